//! Wires the components into a running node.
//!
//! Construction order matches the data flow: registry and gate first (the
//! substrate needs the gate before it accepts anything), then the
//! subscription engine, router, topic router, bridge and session manager.
//! There is no global state; every cross-component reference is injected
//! here.

use crate::config::{Config, VerifiedConfig};
use crate::network_protocol::{MessageId, SchemaType};
use crate::peer_registry::gate::RegistryGate;
use crate::peer_registry::{PeerRegistry, TrustLevel};
use crate::pubsub_bridge::PubSubBridge;
use crate::router::{MessageRouter, MessageRouterConfig};
use crate::streaming::{SessionKeyExchange, SessionManager, StreamingTransport};
use crate::subscriptions::SubscriptionManager;
use crate::substrate::Substrate;
use crate::topic_router::{TopicRouter, TopicRouterConfig, WILDCARD_TOPIC};
use crate::types::PublishOptions;
use anyhow::Context as _;
use bytes::Bytes;
use sdn_primitives::network::PeerId;
use sdn_time::{Clock, Interval};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct Node {
    clock: Clock,
    config: VerifiedConfig,
    pub registry: Arc<PeerRegistry>,
    pub gate: Arc<RegistryGate>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub router: Arc<MessageRouter>,
    pub topic_router: Arc<TopicRouter>,
    pub bridge: Arc<PubSubBridge>,
    pub sessions: Arc<SessionManager>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        clock: Clock,
        config: Config,
        db: Arc<dyn sdn_store::Database>,
        substrate: Arc<dyn Substrate>,
        streaming_transport: Arc<dyn StreamingTransport>,
        key_exchange: Arc<dyn SessionKeyExchange>,
    ) -> anyhow::Result<Arc<Node>> {
        let config = config.verify().context("config")?;

        let registry = Arc::new(
            PeerRegistry::new(clock.clone(), db, config.strict_mode)
                .context("loading trust registry")?,
        );
        let gate = RegistryGate::new(registry.clone());
        substrate.set_connection_gate(gate.clone());

        let subscriptions = SubscriptionManager::new(
            clock.clone(),
            substrate.local_peer_id(),
            &config.topic_prefix,
        );
        let router = MessageRouter::new(
            clock.clone(),
            MessageRouterConfig {
                topic_prefix: config.topic_prefix.clone(),
                relay_mode: config.relay_mode,
                default_ttl: config.default_ttl,
                max_destinations: config.max_destinations,
                seen_cache_size: config.seen_cache_size,
                seen_cache_ttl: config.seen_cache_ttl,
                rate_limiter: config.rate_limiter(),
            },
            registry.clone(),
            subscriptions.clone(),
            substrate.clone(),
        );
        subscriptions.set_router(&router);

        let topic_router = TopicRouter::new(
            TopicRouterConfig {
                topic_prefix: config.topic_prefix.clone(),
                max_message_size: config.max_message_size,
                limits: config.frame_limits(),
            },
            router.clone(),
        );
        // The edge-relay predicate applies to every topic; the default
        // configuration passes everything.
        let edge_filter = crate::edge_relay::EdgeRelayFilter::new(config.edge_filter.clone());
        topic_router.add_filter(WILDCARD_TOPIC, edge_filter.as_topic_filter());

        let sessions = SessionManager::new(
            clock.clone(),
            config.streaming.clone(),
            subscriptions.clone(),
            streaming_transport,
            key_exchange,
        );
        sessions.register();
        // A peer dropping to Untrusted loses its streaming sessions too.
        registry.subscribe_trust_changes({
            let sessions = Arc::downgrade(&sessions);
            Arc::new(move |peer_id: &PeerId, level: TrustLevel| {
                if level == TrustLevel::Untrusted {
                    if let Some(sessions) = sessions.upgrade() {
                        sessions.close_for_peer(peer_id);
                    }
                }
            })
        });

        let bridge = PubSubBridge::new(
            clock.clone(),
            config.sync_interval,
            substrate,
            subscriptions.clone(),
            topic_router.clone(),
        );

        Ok(Arc::new(Node {
            clock,
            config,
            registry,
            gate,
            subscriptions,
            router,
            topic_router,
            bridge,
            sessions,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Spawns the background loops: topic reconciliation, statistics flush,
    /// session sweep. Returns the token that stops them.
    pub fn start(self: &Arc<Self>) -> CancellationToken {
        let token = self.shutdown.clone();
        tokio::spawn(self.bridge.clone().run(token.clone()));
        tokio::spawn({
            let node = self.clone();
            let token = token.clone();
            async move {
                let mut interval =
                    Interval::new(node.clock.now(), node.config.stats_flush_interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick(&node.clock) => {
                            if let Err(err) = node.registry.flush_stats() {
                                tracing::warn!(target: "registry", ?err, "statistics flush failed");
                            }
                            node.router.sweep();
                            node.sessions.sweep();
                        }
                    }
                }
            }
        });
        token
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn publish(
        &self,
        schema: SchemaType,
        payload: Bytes,
        options: PublishOptions,
    ) -> anyhow::Result<MessageId> {
        self.subscriptions.publish(schema, payload, options).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
