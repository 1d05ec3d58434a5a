//! Message router: the per-message decision pipeline between the substrate
//! and the subscription engine.
//!
//! For every inbound framed message, in order: source authenticity, dedup,
//! rate limit, destination check, TTL, local delivery, forwarding. The
//! seen-cache is owned here; nothing else touches it.

use crate::network_protocol::{MessageId, ParseHeaderError, RoutingHeader, SchemaType};
use crate::peer_registry::{PeerRegistry, TrustLevel};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::stats::metrics;
use crate::subscriptions::SubscriptionManager;
use crate::substrate::Substrate;
use crate::topics::Topic;
use crate::types::PublishOptions;
use anyhow::Context as _;
use bytes::Bytes;
use parking_lot::Mutex;
use sdn_primitives::network::PeerId;
use sdn_time::Clock;
use std::sync::Arc;

mod seen_cache;

use seen_cache::SeenCache;

/// What happened to an accepted message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Routed {
    /// Number of local subscriptions the message was delivered to.
    pub delivered: usize,
    /// Whether the message was re-published with a decremented TTL.
    pub forwarded: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("header source does not match transport sender")]
    SpoofedSource,
    #[error("duplicate message")]
    Duplicate,
    #[error("rate limited")]
    RateLimited,
    #[error("node is not among the destinations")]
    NotDestination,
    #[error("message of {got} bytes exceeds the {max} byte limit")]
    OversizedMessage { got: usize, max: usize },
    #[error("unroutable topic `{0}`")]
    UnroutableTopic(String),
    #[error("dropped by topic filter")]
    Filtered,
    #[error(transparent)]
    Header(#[from] ParseHeaderError),
}

impl RouteError {
    /// Label under which the drop is counted.
    pub(crate) fn metric_label(&self) -> &'static str {
        match self {
            RouteError::SpoofedSource => "spoofed_source",
            RouteError::Duplicate => "duplicate",
            RouteError::RateLimited => "rate_limited",
            RouteError::NotDestination => "not_destination",
            RouteError::OversizedMessage { .. } => "oversized",
            RouteError::UnroutableTopic(_) => "unroutable",
            RouteError::Filtered => "filtered",
            RouteError::Header(_) => "bad_header",
        }
    }
}

pub struct MessageRouter {
    clock: Clock,
    local_peer_id: PeerId,
    topic_prefix: String,
    relay_mode: bool,
    default_ttl: u8,
    max_destinations: usize,
    seen: Mutex<SeenCache>,
    rate_limiter: RateLimiter,
    registry: Arc<PeerRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    substrate: Arc<dyn Substrate>,
}

pub struct MessageRouterConfig {
    pub topic_prefix: String,
    pub relay_mode: bool,
    pub default_ttl: u8,
    pub max_destinations: usize,
    pub seen_cache_size: usize,
    pub seen_cache_ttl: sdn_time::Duration,
    pub rate_limiter: RateLimiterConfig,
}

impl MessageRouter {
    pub fn new(
        clock: Clock,
        config: MessageRouterConfig,
        registry: Arc<PeerRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        substrate: Arc<dyn Substrate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer_id: substrate.local_peer_id(),
            topic_prefix: config.topic_prefix,
            relay_mode: config.relay_mode,
            default_ttl: config.default_ttl,
            max_destinations: config.max_destinations,
            seen: Mutex::new(SeenCache::new(config.seen_cache_size, config.seen_cache_ttl)),
            rate_limiter: RateLimiter::new(clock.clone(), config.rate_limiter),
            clock,
            registry,
            subscriptions,
            substrate,
        })
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Framed message observed on `topic`. `sender` is the transport-reported
    /// peer the bytes came from, which is not necessarily the originator of
    /// the header when relays are involved. For messages we accept, the
    /// header source and the sender must agree.
    pub async fn handle_framed(
        &self,
        topic: &Topic,
        sender: &PeerId,
        header: RoutingHeader,
        payload: Bytes,
    ) -> Result<Routed, RouteError> {
        if header.source_peer != *sender {
            self.registry.record_fault(sender);
            tracing::debug!(
                target: "network",
                %sender,
                source = %header.source_peer,
                "dropping message with spoofed source"
            );
            return Err(RouteError::SpoofedSource);
        }
        if !self.seen.lock().insert_if_new(header.message_id, self.clock.now()) {
            tracing::trace!(target: "network", message_id = %header.message_id, "duplicate");
            return Err(RouteError::Duplicate);
        }
        let strictest = self.registry.resolve(sender) == TrustLevel::Limited;
        if self.rate_limiter.acquire(sender, strictest).is_err() {
            tracing::debug!(target: "network", %sender, "rate limited");
            return Err(RouteError::RateLimited);
        }

        let addressed_to_self =
            header.destinations.is_empty() || header.destinations.contains(&self.local_peer_id);
        if !addressed_to_self && !self.relay_mode {
            return Err(RouteError::NotDestination);
        }

        // Local delivery happens before forwarding, so a slow substrate never
        // delays handlers.
        let mut routed = Routed::default();
        if addressed_to_self {
            routed.delivered = self.subscriptions.process(
                header.schema_type.clone(),
                payload.clone(),
                sender.clone(),
                Some(Arc::new(header.clone())),
            );
            metrics::MESSAGES_DELIVERED.inc();
        }

        // Forward only while TTL remains and the message can still be of use
        // to someone else: broadcast, or a destination other than this node.
        if self.relay_mode && header.ttl > 0 {
            let others_remain = header.destinations.is_empty()
                || header.destinations.iter().any(|d| *d != self.local_peer_id);
            if others_remain {
                let mut forwarded = header;
                forwarded.ttl -= 1;
                let frame = Bytes::from(forwarded.frame(&payload));
                match self.substrate.publish(&topic.name(&self.topic_prefix), frame).await {
                    Ok(()) => {
                        routed.forwarded = true;
                        metrics::MESSAGES_FORWARDED.inc();
                    }
                    Err(err) => {
                        tracing::warn!(target: "network", ?err, "forwarding failed");
                    }
                }
            }
        }
        Ok(routed)
    }

    /// Raw (header-less) message: the schema comes from the topic name, the
    /// source is the transport sender, and TTL/destination logic does not
    /// apply. Rate limiting still does.
    pub fn handle_raw(
        &self,
        schema: SchemaType,
        sender: &PeerId,
        payload: Bytes,
    ) -> Result<Routed, RouteError> {
        let strictest = self.registry.resolve(sender) == TrustLevel::Limited;
        if self.rate_limiter.acquire(sender, strictest).is_err() {
            tracing::debug!(target: "network", %sender, "rate limited");
            return Err(RouteError::RateLimited);
        }
        let delivered = self.subscriptions.process(schema, payload, sender.clone(), None);
        metrics::MESSAGES_DELIVERED.inc();
        Ok(Routed { delivered, forwarded: false })
    }

    /// Local publication: assigns the header, records the message id in the
    /// seen-cache (so the node ignores its own echo), and publishes on the
    /// topics the header selects: the schema topic, plus a point-cast topic
    /// per destination. Receivers joined to several of those dedup on the
    /// message id.
    pub async fn publish_local(
        &self,
        schema: SchemaType,
        payload: Bytes,
        options: PublishOptions,
    ) -> anyhow::Result<MessageId> {
        anyhow::ensure!(
            options.destinations.len() <= self.max_destinations,
            "{} destinations exceed the {} cap",
            options.destinations.len(),
            self.max_destinations,
        );
        let header = RoutingHeader {
            schema_type: schema.clone(),
            source_peer: self.local_peer_id.clone(),
            destinations: options.destinations,
            ttl: options.ttl.unwrap_or(self.default_ttl),
            priority: options.priority,
            encrypted: options.encrypted,
            message_id: MessageId::random(),
            timestamp: self.clock.now_utc(),
            session_key_id: options.session_key_id,
        };
        self.seen.lock().insert_if_new(header.message_id, self.clock.now());
        let frame = Bytes::from(header.frame(&payload));

        let topic = Topic::data(schema).name(&self.topic_prefix);
        self.substrate
            .publish(&topic, frame.clone())
            .await
            .with_context(|| format!("publish on {topic}"))?;
        for destination in &header.destinations {
            let topic = Topic::peer(destination.clone()).name(&self.topic_prefix);
            self.substrate
                .publish(&topic, frame.clone())
                .await
                .with_context(|| format!("publish on {topic}"))?;
        }
        Ok(header.message_id)
    }

    /// Periodic housekeeping: evicts idle rate-limit buckets.
    pub fn sweep(&self) {
        self.rate_limiter.evict_idle();
    }

    #[cfg(test)]
    pub(crate) fn seen_len(&self) -> usize {
        self.seen.lock().len()
    }
}
