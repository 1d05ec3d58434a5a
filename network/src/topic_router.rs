//! Bridges raw substrate messages into the message router: topic parsing,
//! size cap, header parsing, and per-topic filters.
//!
//! Filters are header-only predicates; all of them must pass, they never
//! mutate the header, and the wildcard `"*"` list applies to every topic.
//! Relay-only deployments install the edge-relay filter here to short-circuit
//! traffic by header alone.

use crate::network_protocol::{FrameLimits, RoutingHeader, is_framed};
use crate::router::{MessageRouter, Routed, RouteError};
use crate::stats::metrics;
use crate::topics::Topic;
use bytes::Bytes;
use parking_lot::RwLock;
use sdn_primitives::network::PeerId;
use std::collections::HashMap;
use std::sync::Arc;

/// Filter key applied to every topic.
pub const WILDCARD_TOPIC: &str = "*";

pub type TopicFilter = Arc<dyn Fn(&RoutingHeader) -> bool + Send + Sync>;

pub struct TopicRouter {
    topic_prefix: String,
    max_message_size: usize,
    limits: FrameLimits,
    router: Arc<MessageRouter>,
    filters: RwLock<HashMap<String, Vec<TopicFilter>>>,
}

pub struct TopicRouterConfig {
    pub topic_prefix: String,
    pub max_message_size: usize,
    pub limits: FrameLimits,
}

impl TopicRouter {
    pub fn new(config: TopicRouterConfig, router: Arc<MessageRouter>) -> Arc<Self> {
        Arc::new(Self {
            topic_prefix: config.topic_prefix,
            max_message_size: config.max_message_size,
            limits: config.limits,
            router,
            filters: RwLock::new(HashMap::new()),
        })
    }

    /// Adds a filter for `topic` (a full topic name, or [`WILDCARD_TOPIC`]).
    pub fn add_filter(&self, topic: &str, filter: TopicFilter) {
        self.filters.write().entry(topic.to_string()).or_default().push(filter);
    }

    pub fn clear_filters(&self, topic: &str) {
        self.filters.write().remove(topic);
    }

    /// Entry point for every message the substrate observed on a joined
    /// topic.
    pub async fn accept(
        &self,
        topic_name: &str,
        sender: PeerId,
        data: Bytes,
    ) -> Result<Routed, RouteError> {
        metrics::MESSAGES_RECEIVED.inc();
        let result = self.accept_inner(topic_name, sender, data).await;
        if let Err(err) = &result {
            metrics::MESSAGES_DROPPED.with_label_values(&[err.metric_label()]).inc();
            tracing::debug!(target: "network", topic = topic_name, %err, "message dropped");
        }
        result
    }

    async fn accept_inner(
        &self,
        topic_name: &str,
        sender: PeerId,
        data: Bytes,
    ) -> Result<Routed, RouteError> {
        if data.len() > self.max_message_size {
            return Err(RouteError::OversizedMessage {
                got: data.len(),
                max: self.max_message_size,
            });
        }
        let topic = Topic::parse(&self.topic_prefix, topic_name)
            .ok_or_else(|| RouteError::UnroutableTopic(topic_name.to_string()))?;

        if is_framed(&data) {
            let (header, payload) = RoutingHeader::parse(&data, &self.limits)?;
            if !self.filters_pass(topic_name, &header) {
                return Err(RouteError::Filtered);
            }
            self.router.handle_framed(&topic, &sender, header, payload).await
        } else {
            // Legacy raw payload: schema from the topic, source from the
            // transport. Point-cast topics carry no schema, so raw messages
            // are only meaningful on data topics.
            match topic {
                Topic::Data { schema } => self.router.handle_raw(schema, &sender, data),
                Topic::Peer { .. } => Err(RouteError::UnroutableTopic(topic_name.to_string())),
            }
        }
    }

    fn filters_pass(&self, topic_name: &str, header: &RoutingHeader) -> bool {
        let filters = self.filters.read();
        for key in [WILDCARD_TOPIC, topic_name] {
            if let Some(list) = filters.get(key) {
                if !list.iter().all(|filter| filter(header)) {
                    return false;
                }
            }
        }
        true
    }
}
