//! Contract between the routing core and the gossip substrate.
//!
//! The core does not implement gossip; it requires only the operations below.
//! Production nodes adapt their transport to this trait, tests use
//! [`crate::test_utils::FakeSubstrate`].

use bytes::Bytes;
use sdn_primitives::network::PeerId;

/// The four moments at which the transport must consult the connection gate.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum GateMoment {
    /// Before dialing an outbound connection.
    OutboundPreDial,
    /// After an outbound handshake completed.
    OutboundHandshake,
    /// On inbound accept, before the handshake.
    InboundPreHandshake,
    /// On inbound accept, after the handshake.
    InboundHandshake,
}

/// Why a connection was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Refusal {
    #[error("peer is blocklisted")]
    Blocked,
    #[error("peer is untrusted")]
    Untrusted,
}

/// Predicate invoked synchronously by the transport at every [`GateMoment`].
/// Implementations must be fast and must never block on I/O.
pub trait ConnectionGate: Send + Sync {
    fn admit(&self, peer_id: &PeerId, moment: GateMoment) -> Result<(), Refusal>;
}

/// A joined topic: its name plus the stream of raw messages the substrate
/// observed on it, each tagged with the authenticated sender identity.
pub struct TopicStream {
    pub topic: String,
    pub receiver: tokio::sync::mpsc::Receiver<(PeerId, Bytes)>,
}

/// Gossip transport contract.
#[async_trait::async_trait]
pub trait Substrate: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    async fn publish(&self, topic: &str, data: Bytes) -> anyhow::Result<()>;

    async fn join(&self, topic: &str) -> anyhow::Result<TopicStream>;

    async fn leave(&self, topic: &str) -> anyhow::Result<()>;

    /// Installs the predicate consulted at the four [`GateMoment`]s.
    fn set_connection_gate(&self, gate: std::sync::Arc<dyn ConnectionGate>);
}
