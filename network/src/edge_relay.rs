//! Edge-relay filter: a stateless forward/drop predicate over routing
//! headers, for nodes that relay traffic without ever decrypting payloads.

use crate::network_protocol::{Priority, RoutingHeader, SchemaType};
use crate::topic_router::TopicFilter;
use sdn_primitives::network::PeerId;
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EdgeRelayConfig {
    /// Empty means any schema.
    pub allowed_schemas: BTreeSet<SchemaType>,
    /// Empty means any destination.
    pub allowed_destinations: BTreeSet<PeerId>,
    pub min_priority: Priority,
    /// 0 means any TTL.
    pub max_ttl: u8,
    pub allow_encrypted: bool,
    pub allow_unencrypted: bool,
}

impl Default for EdgeRelayConfig {
    fn default() -> Self {
        Self {
            allowed_schemas: BTreeSet::new(),
            allowed_destinations: BTreeSet::new(),
            min_priority: Priority::Low,
            max_ttl: 0,
            allow_encrypted: true,
            allow_unencrypted: true,
        }
    }
}

pub struct EdgeRelayFilter {
    config: EdgeRelayConfig,
}

impl EdgeRelayFilter {
    pub fn new(config: EdgeRelayConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    /// The forward/drop decision, from the header alone.
    pub fn should_forward(&self, header: &RoutingHeader) -> bool {
        let config = &self.config;
        if !config.allowed_schemas.is_empty()
            && !config.allowed_schemas.contains(&header.schema_type)
        {
            return false;
        }
        // A broadcast (no destinations) passes any destination allowlist.
        if !config.allowed_destinations.is_empty()
            && !header.destinations.is_empty()
            && !header.destinations.iter().any(|d| config.allowed_destinations.contains(d))
        {
            return false;
        }
        if header.priority < config.min_priority {
            return false;
        }
        if config.max_ttl != 0 && header.ttl > config.max_ttl {
            return false;
        }
        if header.encrypted { config.allow_encrypted } else { config.allow_unencrypted }
    }

    /// Adapter for installation as a wildcard topic filter.
    pub fn as_topic_filter(self: &Arc<Self>) -> TopicFilter {
        let this = self.clone();
        Arc::new(move |header: &RoutingHeader| this.should_forward(header))
    }
}
