//! Connection gate: the synchronous admission predicate the transport
//! consults before dialing, after handshakes and on inbound accepts.

use crate::peer_registry::{PeerRegistry, TrustLevel};
use crate::substrate::{ConnectionGate, GateMoment, Refusal};
use sdn_primitives::network::PeerId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Refused peers keep redialing; log only one refusal in this many.
const REFUSAL_LOG_SAMPLE: u64 = 100;

pub struct RegistryGate {
    registry: Arc<PeerRegistry>,
    refusals: AtomicU64,
}

impl RegistryGate {
    pub fn new(registry: Arc<PeerRegistry>) -> Arc<Self> {
        Arc::new(Self { registry, refusals: AtomicU64::new(0) })
    }

    fn refuse(&self, peer_id: &PeerId, moment: GateMoment, refusal: Refusal) -> Refusal {
        let n = self.refusals.fetch_add(1, Ordering::Relaxed);
        if n % REFUSAL_LOG_SAMPLE == 0 {
            tracing::debug!(
                target: "network",
                peer_id = %peer_id,
                moment = <&str>::from(moment),
                %refusal,
                total_refusals = n + 1,
                "connection refused"
            );
        }
        refusal
    }
}

impl ConnectionGate for RegistryGate {
    fn admit(&self, peer_id: &PeerId, moment: GateMoment) -> Result<(), Refusal> {
        // Blocklist check precedes trust resolution.
        if self.registry.is_blocked(peer_id) {
            return Err(self.refuse(peer_id, moment, Refusal::Blocked));
        }
        if self.registry.resolve(peer_id) == TrustLevel::Untrusted {
            return Err(self.refuse(peer_id, moment, Refusal::Untrusted));
        }
        // Statistics are recorded once the connection is actually formed,
        // in memory only; the transport is never blocked on storage.
        match moment {
            GateMoment::OutboundHandshake | GateMoment::InboundHandshake => {
                self.registry.record_connect(peer_id, 0);
            }
            GateMoment::OutboundPreDial | GateMoment::InboundPreHandshake => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer_id_from_seed;
    use sdn_store::TestDB;
    use sdn_time::FakeClock;

    fn registry(strict: bool) -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry::new(FakeClock::default().clock(), TestDB::new(), strict).unwrap())
    }

    #[test]
    fn admits_unknown_peer_outside_strict_mode() {
        let registry = registry(false);
        let gate = RegistryGate::new(registry.clone());
        let peer = peer_id_from_seed("stranger");
        for moment in [
            GateMoment::OutboundPreDial,
            GateMoment::OutboundHandshake,
            GateMoment::InboundPreHandshake,
            GateMoment::InboundHandshake,
        ] {
            assert_eq!(gate.admit(&peer, moment), Ok(()));
        }
        // Two handshake moments recorded two connects.
        assert_eq!(registry.lookup(&peer).unwrap().stats.successful_connects, 2);
    }

    #[test]
    fn refuses_unknown_peer_in_strict_mode() {
        let registry = registry(true);
        let gate = RegistryGate::new(registry.clone());
        let peer = peer_id_from_seed("stranger");
        assert_eq!(gate.admit(&peer, GateMoment::InboundPreHandshake), Err(Refusal::Untrusted));
        assert!(registry.lookup(&peer).is_none());
    }

    #[test]
    fn blocklist_beats_trust_level() {
        let registry = registry(false);
        let gate = RegistryGate::new(registry.clone());
        let peer = peer_id_from_seed("vip");
        registry
            .add(peer.clone(), Some(TrustLevel::Admin), vec![], None, None, None)
            .unwrap();
        registry.block(&peer).unwrap();
        assert_eq!(gate.admit(&peer, GateMoment::OutboundPreDial), Err(Refusal::Blocked));
        registry.unblock(&peer).unwrap();
        assert_eq!(gate.admit(&peer, GateMoment::OutboundPreDial), Ok(()));
    }

    #[test]
    fn untrusted_is_refused_at_every_moment() {
        let registry = registry(false);
        let gate = RegistryGate::new(registry.clone());
        let peer = peer_id_from_seed("revoked");
        registry.add(peer.clone(), Some(TrustLevel::Untrusted), vec![], None, None, None).unwrap();
        for moment in [
            GateMoment::OutboundPreDial,
            GateMoment::OutboundHandshake,
            GateMoment::InboundPreHandshake,
            GateMoment::InboundHandshake,
        ] {
            assert_eq!(gate.admit(&peer, moment), Err(Refusal::Untrusted));
        }
        assert_eq!(registry.lookup(&peer).unwrap().stats.successful_connects, 0);
    }
}
