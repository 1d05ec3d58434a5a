use super::*;
use crate::test_utils::peer_id_from_seed;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use sdn_store::TestDB;
use sdn_time::{Duration, FakeClock};

fn registry_on(db: Arc<sdn_store::TestDB>, strict: bool) -> PeerRegistry {
    PeerRegistry::new(FakeClock::default().clock(), db, strict).unwrap()
}

#[test]
fn add_lookup_remove() {
    let registry = registry_on(TestDB::new(), false);
    let peer = peer_id_from_seed("alpha");
    registry
        .add(
            peer.clone(),
            Some(TrustLevel::Trusted),
            vec!["/dns4/alpha.example/tcp/4001".to_string()],
            None,
            Some("Alpha Station".to_string()),
            Some("ExampleSat".to_string()),
        )
        .unwrap();
    assert_matches!(
        registry.add(peer.clone(), None, vec![], None, None, None),
        Err(RegistryError::AlreadyExists)
    );
    let record = registry.lookup(&peer).unwrap();
    assert_eq!(record.trust_level, TrustLevel::Trusted);
    assert_eq!(record.name.as_deref(), Some("Alpha Station"));

    registry.remove(&peer).unwrap();
    assert!(registry.lookup(&peer).is_none());
    assert_matches!(registry.remove(&peer), Err(RegistryError::NotFound));
}

#[test]
fn resolution_precedence() {
    let registry = registry_on(TestDB::new(), false);
    let known = peer_id_from_seed("known");
    let unknown = peer_id_from_seed("unknown");
    registry.add(known.clone(), Some(TrustLevel::Trusted), vec![], None, None, None).unwrap();

    assert_eq!(registry.resolve(&known), TrustLevel::Trusted);
    assert_eq!(registry.resolve(&unknown), TrustLevel::Standard);

    // The blocklist wins over the stored level.
    registry.block(&known).unwrap();
    assert_eq!(registry.resolve(&known), TrustLevel::Untrusted);
    registry.unblock(&known).unwrap();
    assert_eq!(registry.resolve(&known), TrustLevel::Trusted);

    registry.set_strict_mode(true).unwrap();
    assert_eq!(registry.resolve(&unknown), TrustLevel::Untrusted);
    assert_eq!(registry.resolve(&known), TrustLevel::Trusted);
}

#[test]
fn group_default_trust_is_inherited() {
    let registry = registry_on(TestDB::new(), false);
    registry
        .add_group("operators".to_string(), "Ground stations".to_string(), TrustLevel::Trusted)
        .unwrap();
    assert_matches!(
        registry.add_group("operators".to_string(), String::new(), TrustLevel::Limited),
        Err(RegistryError::GroupAlreadyExists(_))
    );

    let member = peer_id_from_seed("member");
    registry
        .add(member.clone(), None, vec![], Some("operators".to_string()), None, None)
        .unwrap();
    assert_eq!(registry.lookup(&member).unwrap().trust_level, TrustLevel::Trusted);
    assert_eq!(registry.list_group("operators").unwrap().len(), 1);

    // An explicit level wins over the group default.
    let other = peer_id_from_seed("other");
    registry
        .add(
            other.clone(),
            Some(TrustLevel::Limited),
            vec![],
            Some("operators".to_string()),
            None,
            None,
        )
        .unwrap();
    assert_eq!(registry.lookup(&other).unwrap().trust_level, TrustLevel::Limited);

    assert_matches!(
        registry.add(peer_id_from_seed("x"), None, vec![], Some("nope".to_string()), None, None),
        Err(RegistryError::GroupNotFound(_))
    );
}

#[test]
fn group_membership_edits() {
    let registry = registry_on(TestDB::new(), false);
    registry.add_group("ops".to_string(), String::new(), TrustLevel::Standard).unwrap();
    let peer = peer_id_from_seed("p");
    registry.add(peer.clone(), None, vec![], None, None, None).unwrap();

    registry.add_to_group(&peer, "ops").unwrap();
    assert_eq!(registry.list_group("ops").unwrap().len(), 1);
    assert_eq!(registry.lookup(&peer).unwrap().groups, vec!["ops".to_string()]);

    registry.remove_from_group(&peer, "ops").unwrap();
    assert!(registry.list_group("ops").unwrap().is_empty());
    assert!(registry.lookup(&peer).unwrap().groups.is_empty());

    registry.add_to_group(&peer, "ops").unwrap();
    registry.remove_group("ops").unwrap();
    assert!(registry.lookup(&peer).unwrap().groups.is_empty());
    assert_matches!(registry.list_group("ops"), Err(RegistryError::GroupNotFound(_)));
}

#[test]
fn survives_reload() {
    let db = TestDB::new();
    let peer = peer_id_from_seed("persistent");
    {
        let registry = registry_on(db.clone(), false);
        registry.add(peer.clone(), Some(TrustLevel::Admin), vec![], None, None, None).unwrap();
        registry.block(&peer_id_from_seed("banned")).unwrap();
        registry.set_strict_mode(true).unwrap();
    }
    let registry = registry_on(db, false);
    assert_eq!(registry.lookup(&peer).unwrap().trust_level, TrustLevel::Admin);
    assert!(registry.is_blocked(&peer_id_from_seed("banned")));
    // The persisted strict-mode setting wins over the config default.
    assert!(registry.strict_mode());
}

#[test]
fn failed_write_leaves_memory_unchanged() {
    let db = TestDB::new();
    let registry = registry_on(db.clone(), false);
    let peer = peer_id_from_seed("p");
    registry.add(peer.clone(), Some(TrustLevel::Standard), vec![], None, None, None).unwrap();

    db.fail_next_write();
    assert_matches!(
        registry.set_trust(&peer, TrustLevel::Admin),
        Err(RegistryError::Storage(_))
    );
    assert_eq!(registry.lookup(&peer).unwrap().trust_level, TrustLevel::Standard);

    db.fail_next_write();
    assert_matches!(registry.block(&peer), Err(RegistryError::Storage(_)));
    assert!(!registry.is_blocked(&peer));
}

#[test]
fn first_observation_creates_record_outside_strict_mode() {
    let registry = registry_on(TestDB::new(), false);
    let peer = peer_id_from_seed("observed");
    registry.record_connect(&peer, 512);
    registry.record_connect(&peer, 256);
    let record = registry.lookup(&peer).unwrap();
    assert_eq!(record.trust_level, TrustLevel::Standard);
    assert_eq!(record.stats.successful_connects, 2);
    assert_eq!(record.stats.bytes_received, 768);
    assert!(record.stats.first_seen.is_some());

    let strict = registry_on(TestDB::new(), true);
    strict.record_connect(&peer, 512);
    assert!(strict.lookup(&peer).is_none());
}

#[test]
fn stats_flush_persists() {
    let db = TestDB::new();
    let peer = peer_id_from_seed("flushed");
    {
        let registry = registry_on(db.clone(), false);
        registry.add(peer.clone(), None, vec![], None, None, None).unwrap();
        registry.record_connect(&peer, 100);
        registry.record_traffic(&peer, 40, 0);
        registry.record_fault(&peer);
        registry.flush_stats().unwrap();
    }
    let reloaded = registry_on(db, false);
    let stats = reloaded.lookup(&peer).unwrap().stats;
    assert_eq!(stats.successful_connects, 1);
    assert_eq!(stats.bytes_received, 100);
    assert_eq!(stats.bytes_sent, 40);
    assert_eq!(stats.faults, 1);
}

#[test]
fn failed_flush_keeps_records_dirty() {
    let db = TestDB::new();
    let registry = registry_on(db.clone(), false);
    let peer = peer_id_from_seed("dirty");
    registry.record_connect(&peer, 1);

    db.fail_next_write();
    assert_matches!(registry.flush_stats(), Err(RegistryError::Storage(_)));
    // The next flush retries the same record.
    registry.flush_stats().unwrap();
    let reloaded = registry_on(db, false);
    assert_eq!(reloaded.lookup(&peer).unwrap().stats.successful_connects, 1);
}

#[test]
fn export_import_replace_round_trips() {
    let registry = registry_on(TestDB::new(), false);
    registry.add_group("ops".to_string(), "desc".to_string(), TrustLevel::Trusted).unwrap();
    registry
        .add(
            peer_id_from_seed("a"),
            None,
            vec!["/dns4/a/tcp/1".to_string()],
            Some("ops".to_string()),
            None,
            None,
        )
        .unwrap();
    registry.add(peer_id_from_seed("b"), Some(TrustLevel::Limited), vec![], None, None, None).unwrap();
    registry.block(&peer_id_from_seed("c")).unwrap();
    registry.record_connect(&peer_id_from_seed("a"), 7);
    let exported = registry.export();

    // Imports are JSON-portable.
    let json = serde_json::to_string(&exported).unwrap();
    let parsed: RegistryExport = serde_json::from_str(&json).unwrap();

    let restored = registry_on(TestDB::new(), false);
    restored.import(parsed, false).unwrap();
    assert_eq!(restored.export(), exported);
}

#[test]
fn import_with_merge_unions() {
    let registry = registry_on(TestDB::new(), false);
    let existing = peer_id_from_seed("existing");
    registry.add(existing.clone(), Some(TrustLevel::Trusted), vec![], None, None, None).unwrap();

    let incoming = peer_id_from_seed("incoming");
    let snapshot = RegistryExport {
        peers: vec![
            TrustedPeer {
                peer_id: existing.clone(),
                addrs: vec![],
                trust_level: TrustLevel::Limited,
                name: Some("renamed".to_string()),
                organization: None,
                groups: vec![],
                stats: PeerStats::default(),
                notes: String::new(),
            },
            TrustedPeer {
                peer_id: incoming.clone(),
                addrs: vec![],
                trust_level: TrustLevel::Standard,
                name: None,
                organization: None,
                groups: vec![],
                stats: PeerStats::default(),
                notes: String::new(),
            },
        ],
        groups: vec![],
        blocked: vec![peer_id_from_seed("blocked")],
        strict_mode: true,
    };
    registry.import(snapshot, true).unwrap();

    // Known peers are updated (last writer wins), unknown peers added, the
    // blocklist unioned, and strict mode untouched.
    assert_eq!(registry.lookup(&existing).unwrap().trust_level, TrustLevel::Limited);
    assert_eq!(registry.lookup(&existing).unwrap().name.as_deref(), Some("renamed"));
    assert!(registry.lookup(&incoming).is_some());
    assert!(registry.is_blocked(&peer_id_from_seed("blocked")));
    assert!(!registry.strict_mode());
}

#[test]
fn trust_listener_fires_on_changes() {
    let registry = registry_on(TestDB::new(), false);
    let peer = peer_id_from_seed("watched");
    registry.add(peer.clone(), Some(TrustLevel::Trusted), vec![], None, None, None).unwrap();

    let seen: Arc<Mutex<Vec<(PeerId, TrustLevel)>>> = Arc::new(Mutex::new(vec![]));
    registry.subscribe_trust_changes({
        let seen = seen.clone();
        Arc::new(move |peer_id: &PeerId, level: TrustLevel| {
            seen.lock().push((peer_id.clone(), level))
        })
    });

    registry.set_trust(&peer, TrustLevel::Untrusted).unwrap();
    registry.block(&peer).unwrap();
    registry.unblock(&peer).unwrap();
    let events = seen.lock().clone();
    assert_eq!(
        events,
        vec![
            (peer.clone(), TrustLevel::Untrusted),
            (peer.clone(), TrustLevel::Untrusted),
            (peer.clone(), TrustLevel::Untrusted),
        ]
    );
}

#[test]
fn equality_is_on_identity_bytes_not_names() {
    let registry = registry_on(TestDB::new(), false);
    let peer = peer_id_from_seed("identity");
    registry
        .add(peer.clone(), Some(TrustLevel::Trusted), vec![], None, Some("Name A".to_string()), None)
        .unwrap();
    // Lookup by an equal identity with a different display name attached
    // elsewhere still finds the record.
    let same = peer_id_from_seed("identity");
    assert_eq!(registry.lookup(&same).unwrap().name.as_deref(), Some("Name A"));
}

#[test]
fn record_disconnect_touches_last_seen() {
    let db = TestDB::new();
    let fake = FakeClock::default();
    let registry = PeerRegistry::new(fake.clock(), db, false).unwrap();
    let peer = peer_id_from_seed("p");
    registry.record_connect(&peer, 0);
    let first = registry.lookup(&peer).unwrap().stats.last_seen.unwrap();
    fake.advance(Duration::seconds(30));
    registry.record_disconnect(&peer);
    let last = registry.lookup(&peer).unwrap().stats.last_seen.unwrap();
    assert_eq!(last - first, Duration::seconds(30));
}
