//! Keeps the substrate's joined-topic set equal to the subscription
//! engine's required-topic set.
//!
//! Reconciliation runs on explicit `sync()` calls and on an internal ticker.
//! Join and leave failures are logged and retried on the next sync; they
//! never propagate to the caller. A sync with no subscription changes
//! performs no substrate calls.

use crate::subscriptions::SubscriptionManager;
use crate::substrate::{Substrate, TopicStream};
use crate::topic_router::TopicRouter;
use parking_lot::Mutex;
use sdn_time::{Clock, Duration, Interval};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct PubSubBridge {
    clock: Clock,
    sync_interval: Duration,
    substrate: Arc<dyn Substrate>,
    subscriptions: Arc<SubscriptionManager>,
    topic_router: Arc<TopicRouter>,
    /// Topic name → cancellation of its reader task.
    joined: Mutex<HashMap<String, CancellationToken>>,
}

impl PubSubBridge {
    pub fn new(
        clock: Clock,
        sync_interval: Duration,
        substrate: Arc<dyn Substrate>,
        subscriptions: Arc<SubscriptionManager>,
        topic_router: Arc<TopicRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            sync_interval,
            substrate,
            subscriptions,
            topic_router,
            joined: Mutex::new(HashMap::new()),
        })
    }

    pub fn joined_topics(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.joined.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// One reconciliation pass.
    pub async fn sync(&self) {
        let required = self.subscriptions.required_topics();
        let current: Vec<(String, bool)> = self
            .joined
            .lock()
            .iter()
            .map(|(topic, token)| (topic.clone(), token.is_cancelled()))
            .collect();

        for topic in &required {
            // A topic whose leave failed earlier and is wanted again has a
            // cancelled reader; join it afresh like a new one.
            let joined = current
                .iter()
                .any(|(t, cancelled)| t == topic && !cancelled);
            if joined {
                continue;
            }
            match self.substrate.join(topic).await {
                Ok(stream) => {
                    let token = CancellationToken::new();
                    tracing::debug!(target: "pubsub", topic, "joined");
                    tokio::spawn(Self::read_loop(
                        stream,
                        self.topic_router.clone(),
                        token.clone(),
                    ));
                    self.joined.lock().insert(topic.clone(), token);
                }
                Err(err) => {
                    // Retried on the next sync.
                    tracing::warn!(target: "pubsub", topic, ?err, "join failed");
                }
            }
        }

        for (topic, _) in current.iter().filter(|(t, _)| !required.contains(t)) {
            // Stop consuming right away, but keep the bookkeeping entry until
            // the substrate leave succeeds so a failure is retried on the
            // next sync.
            if let Some(token) = self.joined.lock().get(topic) {
                token.cancel();
            }
            match self.substrate.leave(topic).await {
                Ok(()) => {
                    self.joined.lock().remove(topic);
                    tracing::debug!(target: "pubsub", topic, "left");
                }
                Err(err) => {
                    // Retried on the next sync.
                    tracing::warn!(target: "pubsub", topic, ?err, "leave failed");
                }
            }
        }
    }

    async fn read_loop(
        mut stream: TopicStream,
        topic_router: Arc<TopicRouter>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = stream.receiver.recv() => match message {
                    None => break,
                    Some((sender, data)) => {
                        // Drops are counted and logged inside accept().
                        let _ = topic_router.accept(&stream.topic, sender, data).await;
                    }
                },
            }
        }
    }

    /// Periodic reconciliation until cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut interval = Interval::new(self.clock.now(), self.sync_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick(&self.clock) => self.sync().await,
            }
        }
        // Leave everything on shutdown.
        let joined: Vec<String> = {
            let mut map = self.joined.lock();
            map.drain().map(|(topic, reader)| {
                reader.cancel();
                topic
            }).collect()
        };
        for topic in joined {
            if let Err(err) = self.substrate.leave(&topic).await {
                tracing::debug!(target: "pubsub", topic, ?err, "leave on shutdown failed");
            }
        }
    }
}
