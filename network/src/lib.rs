//! Message routing and delivery core of the Space Data Network.
//!
//! The crate glues four concerns together on top of a gossip substrate it
//! does not implement itself:
//!
//! * routed pubsub: framed messages carry a routing header with TTL,
//!   destinations, dedup id and priority ([`network_protocol`], [`router`]);
//! * trust: a persistent per-peer trust registry consulted synchronously on
//!   every dial and accept ([`peer_registry`]);
//! * subscriptions: predicates over (schema, source, destination, encryption)
//!   mapped onto substrate topics, fanning deliveries out to handlers
//!   ([`subscriptions`], [`pubsub_bridge`]);
//! * streaming sessions: long-lived per-subscriber flows with three delivery
//!   modes and four encryption modes ([`streaming`]).
//!
//! [`node::Node`] wires the pieces together in the only supported layering:
//! substrate → topic router → message router → subscription manager →
//! streaming sessions, with administrative writes flowing back through the
//! public interfaces.

pub mod config;
pub mod edge_relay;
mod network_protocol;
pub mod node;
pub mod peer_registry;
pub mod pubsub_bridge;
pub mod rate_limiter;
pub mod router;
mod stats;
mod store;
pub mod streaming;
pub mod subscriptions;
pub mod substrate;
pub mod test_utils;
pub mod topic_router;
pub mod topics;
pub mod types;

#[cfg(test)]
mod tests;

pub use crate::network_protocol::{
    FrameLimits, InvalidSchemaName, MessageId, ParseHeaderError, Priority, RoutingHeader,
    SchemaType,
};
pub use crate::types::{Delivery, PublishOptions};
