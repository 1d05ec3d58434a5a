//! Types crossing component boundaries.

use crate::network_protocol::{Priority, RoutingHeader, SchemaType};
use bytes::Bytes;
use sdn_crypto::SessionKeyId;
use sdn_primitives::network::PeerId;
use std::sync::Arc;

/// One message handed to subscription handlers. `payload` and `header` are
/// cheap to clone; the same delivery is fanned out to every matching
/// subscription.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub schema: SchemaType,
    pub payload: Bytes,
    /// Transport-observed sender. Equal to the header's source peer for
    /// framed messages; for raw messages it is the only identity available.
    pub from: PeerId,
    /// Absent for raw (header-less) substrate messages.
    pub header: Option<Arc<RoutingHeader>>,
}

/// Knobs for a local publication. The router fills in source, message id and
/// timestamp.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// Empty means broadcast within the schema topic.
    pub destinations: Vec<PeerId>,
    /// Defaults to the configured `default_ttl`.
    pub ttl: Option<u8>,
    pub priority: Priority,
    pub encrypted: bool,
    pub session_key_id: Option<SessionKeyId>,
}
