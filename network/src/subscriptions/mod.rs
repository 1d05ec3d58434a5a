//! Subscription engine: the set of active subscriptions, the topic set they
//! require, and the single delivery entry point that fans one message out to
//! every matching handler.
//!
//! Handler lists are snapshotted before dispatch, so cancelling a
//! subscription or removing a handler mid-delivery never invalidates an
//! iterator; in-flight invocations simply run to completion. A panicking
//! handler is isolated from the others and quarantined after repeated
//! failures.

use crate::network_protocol::{MessageId, SchemaType};
use crate::router::MessageRouter;
use crate::topics::Topic;
use crate::types::{Delivery, PublishOptions};
use anyhow::Context as _;
use bytes::Bytes;
use parking_lot::RwLock;
use sdn_primitives::network::PeerId;
use sdn_time::{Clock, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};


/// Cumulative panics after which a handler is removed from its subscription.
const HANDLER_QUARANTINE_THRESHOLD: u32 = 3;

pub type SubscriptionHandler = Arc<dyn Fn(&Delivery) + Send + Sync>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Names one handler registration; required to remove the handler again.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SourceFilter {
    #[default]
    Any,
    Peers(BTreeSet<PeerId>),
}

impl SourceFilter {
    fn matches(&self, peer: &PeerId) -> bool {
        match self {
            SourceFilter::Any => true,
            SourceFilter::Peers(peers) => peers.contains(peer),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DestinationFilter {
    #[default]
    Any,
    /// Only messages explicitly addressed to this node (or broadcast).
    SelfOnly,
    Peers(BTreeSet<PeerId>),
}

impl DestinationFilter {
    /// Called only for non-empty destination lists; a header without
    /// destinations is a broadcast and matches every filter.
    fn matches(&self, destinations: &[PeerId], local: &PeerId) -> bool {
        match self {
            DestinationFilter::Any => true,
            DestinationFilter::SelfOnly => destinations.contains(local),
            DestinationFilter::Peers(peers) => destinations.iter().any(|d| peers.contains(d)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub schemas: BTreeSet<SchemaType>,
    pub sources: SourceFilter,
    pub destinations: DestinationFilter,
    /// Only deliver messages whose header carries the encrypted flag.
    pub encrypted_only: bool,
    /// Deliveries are additionally bridged into streaming sessions.
    pub streaming: bool,
}

impl SubscriptionConfig {
    pub fn new(schemas: impl IntoIterator<Item = SchemaType>) -> Self {
        Self {
            schemas: schemas.into_iter().collect(),
            sources: SourceFilter::Any,
            destinations: DestinationFilter::Any,
            encrypted_only: false,
            streaming: false,
        }
    }

    fn matches(&self, delivery: &Delivery, local: &PeerId) -> bool {
        if !self.schemas.contains(&delivery.schema) {
            return false;
        }
        if !self.sources.matches(&delivery.from) {
            return false;
        }
        if let Some(header) = &delivery.header {
            if !header.destinations.is_empty()
                && !self.destinations.matches(&header.destinations, local)
            {
                return false;
            }
        }
        if self.encrypted_only && !delivery.header.as_ref().is_some_and(|h| h.encrypted) {
            return false;
        }
        true
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription not found")]
    NotFound,
    #[error("handler not found")]
    HandlerNotFound,
    #[error("subscription must name at least one schema")]
    NoSchemas,
}

struct Subscription {
    config: SubscriptionConfig,
    handlers: Vec<(HandlerToken, SubscriptionHandler)>,
    handler_failures: HashMap<HandlerToken, u32>,
    #[allow(dead_code)]
    created: Utc,
}

struct Inner {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    global_handlers: Vec<(HandlerToken, SubscriptionHandler)>,
    global_failures: HashMap<HandlerToken, u32>,
    next_subscription_id: u64,
    next_handler_token: u64,
}

pub struct SubscriptionManager {
    clock: Clock,
    local_peer_id: PeerId,
    topic_prefix: String,
    inner: RwLock<Inner>,
    router: OnceLock<Weak<MessageRouter>>,
}

impl SubscriptionManager {
    pub fn new(clock: Clock, local_peer_id: PeerId, topic_prefix: &str) -> Arc<Self> {
        Arc::new(Self {
            clock,
            local_peer_id,
            topic_prefix: topic_prefix.to_string(),
            inner: RwLock::new(Inner {
                subscriptions: HashMap::new(),
                global_handlers: vec![],
                global_failures: HashMap::new(),
                next_subscription_id: 0,
                next_handler_token: 0,
            }),
            router: OnceLock::new(),
        })
    }

    /// Wires the outbound half. Called once by the node during construction.
    pub(crate) fn set_router(&self, router: &Arc<MessageRouter>) {
        let _ = self.router.set(Arc::downgrade(router));
    }

    pub fn create(&self, config: SubscriptionConfig) -> Result<SubscriptionId, SubscriptionError> {
        if config.schemas.is_empty() {
            return Err(SubscriptionError::NoSchemas);
        }
        let created = self.clock.now_utc();
        let mut inner = self.inner.write();
        let id = SubscriptionId(inner.next_subscription_id);
        inner.next_subscription_id += 1;
        tracing::debug!(target: "pubsub", %id, schemas = ?config.schemas, "subscription created");
        inner.subscriptions.insert(
            id,
            Subscription { config, handlers: vec![], handler_failures: HashMap::new(), created },
        );
        Ok(id)
    }

    /// Synchronous: once this returns, no new handler invocations for the
    /// subscription begin. In-flight invocations run to completion.
    pub fn cancel(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.write();
        inner.subscriptions.remove(&id).ok_or(SubscriptionError::NotFound)?;
        tracing::debug!(target: "pubsub", %id, "subscription cancelled");
        Ok(())
    }

    pub fn add_handler(
        &self,
        id: SubscriptionId,
        handler: SubscriptionHandler,
    ) -> Result<HandlerToken, SubscriptionError> {
        let mut inner = self.inner.write();
        let token = HandlerToken(inner.next_handler_token);
        inner.next_handler_token += 1;
        let sub = inner.subscriptions.get_mut(&id).ok_or(SubscriptionError::NotFound)?;
        sub.handlers.push((token, handler));
        Ok(token)
    }

    pub fn remove_handler(
        &self,
        id: SubscriptionId,
        token: HandlerToken,
    ) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.write();
        let sub = inner.subscriptions.get_mut(&id).ok_or(SubscriptionError::NotFound)?;
        let before = sub.handlers.len();
        sub.handlers.retain(|(t, _)| *t != token);
        if sub.handlers.len() == before {
            return Err(SubscriptionError::HandlerNotFound);
        }
        sub.handler_failures.remove(&token);
        Ok(())
    }

    /// Registers a handler invoked for every delivered message, regardless of
    /// subscription matching. Used by the streaming session manager; global
    /// handlers must only enqueue, never perform transport I/O.
    pub fn add_global_handler(&self, handler: SubscriptionHandler) -> HandlerToken {
        let mut inner = self.inner.write();
        let token = HandlerToken(inner.next_handler_token);
        inner.next_handler_token += 1;
        inner.global_handlers.push((token, handler));
        token
    }

    pub fn remove_global_handler(&self, token: HandlerToken) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.write();
        let before = inner.global_handlers.len();
        inner.global_handlers.retain(|(t, _)| *t != token);
        if inner.global_handlers.len() == before {
            return Err(SubscriptionError::HandlerNotFound);
        }
        Ok(())
    }

    pub fn get_config(&self, id: SubscriptionId) -> Option<SubscriptionConfig> {
        self.inner.read().subscriptions.get(&id).map(|s| s.config.clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.read().subscriptions.len()
    }

    /// The substrate topics the active subscriptions need: one data topic per
    /// schema, plus this node's point-cast topic while any subscription could
    /// receive destination-addressed messages.
    pub fn required_topics(&self) -> BTreeSet<String> {
        let inner = self.inner.read();
        let mut topics = BTreeSet::new();
        let mut want_peer_topic = false;
        for sub in inner.subscriptions.values() {
            for schema in &sub.config.schemas {
                topics.insert(Topic::data(schema.clone()).name(&self.topic_prefix));
            }
            want_peer_topic |= match &sub.config.destinations {
                DestinationFilter::Any | DestinationFilter::SelfOnly => true,
                DestinationFilter::Peers(peers) => peers.contains(&self.local_peer_id),
            };
        }
        if want_peer_topic {
            topics.insert(Topic::peer(self.local_peer_id.clone()).name(&self.topic_prefix));
        }
        topics
    }

    /// The single delivery entry point. Returns the number of subscriptions
    /// the message matched.
    pub fn process(
        &self,
        schema: SchemaType,
        payload: Bytes,
        from: PeerId,
        header: Option<Arc<crate::network_protocol::RoutingHeader>>,
    ) -> usize {
        let delivery = Delivery { schema, payload, from, header };
        // Snapshot matching handlers under the read lock; run them outside it
        // so that a slow or panicking handler never holds up registration.
        let (matched, globals) = {
            let inner = self.inner.read();
            let matched: Vec<(SubscriptionId, Vec<(HandlerToken, SubscriptionHandler)>)> = inner
                .subscriptions
                .iter()
                .filter(|(_, sub)| sub.config.matches(&delivery, &self.local_peer_id))
                .map(|(id, sub)| (*id, sub.handlers.clone()))
                .collect();
            (matched, inner.global_handlers.clone())
        };

        for (id, handlers) in &matched {
            for (token, handler) in handlers {
                self.invoke(Some(*id), *token, handler, &delivery);
            }
        }
        for (token, handler) in &globals {
            self.invoke(None, *token, handler, &delivery);
        }
        matched.len()
    }

    fn invoke(
        &self,
        subscription: Option<SubscriptionId>,
        token: HandlerToken,
        handler: &SubscriptionHandler,
        delivery: &Delivery,
    ) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(delivery)));
        if result.is_ok() {
            return;
        }
        tracing::warn!(
            target: "pubsub",
            subscription = ?subscription,
            schema = %delivery.schema,
            "subscription handler panicked"
        );
        let mut inner = self.inner.write();
        let failures = match subscription {
            Some(id) => match inner.subscriptions.get_mut(&id) {
                Some(sub) => {
                    let failures = sub.handler_failures.entry(token).or_default();
                    *failures += 1;
                    let failures = *failures;
                    if failures >= HANDLER_QUARANTINE_THRESHOLD {
                        sub.handlers.retain(|(t, _)| *t != token);
                    }
                    failures
                }
                None => return,
            },
            None => {
                let failures = inner.global_failures.entry(token).or_default();
                *failures += 1;
                let failures = *failures;
                if failures >= HANDLER_QUARANTINE_THRESHOLD {
                    inner.global_handlers.retain(|(t, _)| *t != token);
                }
                failures
            }
        };
        if failures >= HANDLER_QUARANTINE_THRESHOLD {
            tracing::warn!(
                target: "pubsub",
                subscription = ?subscription,
                failures,
                "handler quarantined after repeated panics"
            );
        }
    }

    /// Local publication: assigns a routing header and hands the message to
    /// the router, which records it as seen and publishes it on the topics
    /// the header selects.
    pub async fn publish(
        &self,
        schema: SchemaType,
        payload: Bytes,
        options: PublishOptions,
    ) -> anyhow::Result<MessageId> {
        let router = self
            .router
            .get()
            .and_then(Weak::upgrade)
            .context("subscription manager is not wired to a router")?;
        router.publish_local(schema, payload, options).await
    }
}
