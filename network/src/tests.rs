//! End-to-end scenarios over a fully wired node with a fake substrate,
//! fake clock and recording streaming collaborators.

use crate::config::Config;
use crate::network_protocol::{FrameLimits, RoutingHeader};
use crate::node::Node;
use crate::peer_registry::TrustLevel;
use crate::router::RouteError;
use crate::streaming::{DeliveryMode, SessionEncryption};
use crate::subscriptions::{SubscriptionConfig, SubscriptionHandler};
use crate::substrate::{GateMoment, Refusal};
use crate::test_utils::{
    FakeSubstrate, RecordingKeyExchange, RecordingTransport, make_header, peer_id_from_seed,
    schema, wait_or_timeout,
};
use crate::types::{Delivery, PublishOptions};
use assert_matches::assert_matches;
use bytes::Bytes;
use parking_lot::Mutex;
use sdn_store::TestDB;
use sdn_time::FakeClock;
use std::ops::ControlFlow;
use std::sync::Arc;

struct TestNode {
    #[allow(dead_code)]
    fake_clock: FakeClock,
    substrate: Arc<FakeSubstrate>,
    transport: Arc<RecordingTransport>,
    #[allow(dead_code)]
    key_exchange: Arc<RecordingKeyExchange>,
    node: Arc<Node>,
}

fn test_node(config: Config) -> TestNode {
    let fake_clock = FakeClock::default();
    let substrate = FakeSubstrate::new(peer_id_from_seed("local"));
    let transport = RecordingTransport::new();
    let key_exchange = RecordingKeyExchange::new();
    let node = Node::new(
        fake_clock.clock(),
        config,
        TestDB::new(),
        substrate.clone(),
        transport.clone(),
        key_exchange.clone(),
    )
    .unwrap();
    TestNode { fake_clock, substrate, transport, key_exchange, node }
}

fn recording_handler(log: &Arc<Mutex<Vec<Delivery>>>) -> SubscriptionHandler {
    let log = log.clone();
    Arc::new(move |delivery: &Delivery| log.lock().push(delivery.clone()))
}

/// Scenario: strict mode, empty registry, incoming dial.
#[tokio::test]
async fn strict_mode_refuses_unknown_dialer() {
    let t = test_node(Config { strict_mode: true, ..Config::default() });
    let gate = t.substrate.connection_gate().expect("gate installed");
    let stranger = peer_id_from_seed("12D3KooWA");

    assert_eq!(gate.admit(&stranger, GateMoment::InboundPreHandshake), Err(Refusal::Untrusted));
    assert_eq!(gate.admit(&stranger, GateMoment::InboundHandshake), Err(Refusal::Untrusted));
    // No record was created and nothing reached the subscription engine.
    assert!(t.node.registry.lookup(&stranger).is_none());
    assert!(t.node.registry.list_all().is_empty());
}

/// Scenario: framed message whose header source differs from the transport
/// sender.
#[tokio::test]
async fn spoofed_source_is_dropped_without_cache_side_effects() {
    let t = test_node(Config::default());
    let log = Arc::new(Mutex::new(vec![]));
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.subscriptions.add_handler(sub, recording_handler(&log)).unwrap();

    let claimed = peer_id_from_seed("12D3KooWB");
    let actual = peer_id_from_seed("12D3KooWC");
    let header = make_header("OMM", &claimed);
    let frame = Bytes::from(header.frame(b"omm record"));

    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", actual.clone(), frame.clone())
        .await;
    assert_matches!(got, Err(RouteError::SpoofedSource));
    assert!(log.lock().is_empty());
    assert_eq!(t.node.router.seen_len(), 0);

    // The registry attributed a fault to the actual sender, and the same
    // message id is still deliverable from its true source.
    let got = t.node.topic_router.accept("/sdn/data/OMM", claimed, frame).await.unwrap();
    assert_eq!(got.delivered, 1);
    assert_eq!(log.lock().len(), 1);
}

/// Scenario: two matching subscriptions, one message, then a duplicate.
#[tokio::test]
async fn fan_out_once_per_subscription_then_dedup() {
    let t = test_node(Config::default());
    let log1 = Arc::new(Mutex::new(vec![]));
    let log2 = Arc::new(Mutex::new(vec![]));
    for log in [&log1, &log2] {
        let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
        t.node.subscriptions.add_handler(sub, recording_handler(log)).unwrap();
    }

    let source = peer_id_from_seed("X");
    let frame = Bytes::from(make_header("OMM", &source).frame(b"payload"));
    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", source.clone(), frame.clone())
        .await
        .unwrap();
    assert_eq!(got.delivered, 2);

    // Both handlers saw identical deliveries.
    for log in [&log1, &log2] {
        let deliveries = log.lock();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].schema, schema("OMM"));
        assert_eq!(&deliveries[0].payload[..], b"payload");
        assert_eq!(deliveries[0].from, source);
        assert!(deliveries[0].header.is_some());
    }

    // Second arrival of the same message id is silently dropped.
    let got = t.node.topic_router.accept("/sdn/data/OMM", source, frame).await;
    assert_matches!(got, Err(RouteError::Duplicate));
    assert_eq!(log1.lock().len(), 1);
    assert_eq!(log2.lock().len(), 1);
}

/// Scenario: single-mode streaming session auto-closes after one delivery.
#[tokio::test]
async fn streaming_single_mode_auto_close() {
    let t = test_node(Config::default());
    let sub = t
        .node
        .subscriptions
        .create(SubscriptionConfig { streaming: true, ..SubscriptionConfig::new([schema("CDM")]) })
        .unwrap();
    let session = t
        .node
        .sessions
        .create(
            sub,
            peer_id_from_seed("subscriber"),
            [schema("CDM")].into_iter().collect(),
            DeliveryMode::Single,
            SessionEncryption::None,
        )
        .unwrap();

    let source = peer_id_from_seed("sensor");
    for payload in [&b"cdm-1"[..], &b"cdm-2"[..]] {
        let frame = Bytes::from(make_header("CDM", &source).frame(payload));
        t.node
            .topic_router
            .accept("/sdn/data/CDM", source.clone(), frame)
            .await
            .unwrap();
    }

    wait_or_timeout(10, 2000, || async {
        if session.is_active() { ControlFlow::Continue(()) } else { ControlFlow::Break(()) }
    })
    .await
    .expect("session auto-close");
    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    let sent = t.transport.sent();
    assert_eq!(sent.len(), 1, "only the first CDM reaches the session transport");
}

/// Scenario: edge node forwards encrypted OMM traffic by header alone.
#[tokio::test]
async fn edge_relay_forwards_by_header_only() {
    let mut config = Config { relay_mode: true, ..Config::default() };
    config.edge_filter.allowed_schemas = [schema("OMM")].into_iter().collect();
    config.edge_filter.allow_unencrypted = false;
    let t = test_node(config);

    let source = peer_id_from_seed("origin");
    let mut header = make_header("OMM", &source);
    header.ttl = 3;
    header.encrypted = true;
    let ciphertext = b"\x9f\x03opaque ciphertext bytes";
    let frame = Bytes::from(header.frame(ciphertext));

    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", source.clone(), frame)
        .await
        .unwrap();
    assert!(got.forwarded);
    assert_eq!(got.delivered, 0, "no subscription handler runs on the edge");

    let published = t.substrate.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "/sdn/data/OMM");
    let (relayed, payload) =
        RoutingHeader::parse(&published[0].1, &FrameLimits::default()).unwrap();
    assert_eq!(relayed.ttl, 2);
    assert_eq!(&payload[..], ciphertext, "payload is forwarded untouched");
    assert_eq!(relayed.message_id, header.message_id);

    // Unencrypted traffic is dropped by the filter, not forwarded.
    let mut plain = make_header("OMM", &source);
    plain.ttl = 3;
    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", source, Bytes::from(plain.frame(b"plaintext")))
        .await;
    assert_matches!(got, Err(RouteError::Filtered));
    assert_eq!(t.substrate.published().len(), 1);
}

/// Scenario: per-second limit 2, burst 2, five messages in one second.
#[tokio::test]
async fn rate_limited_peer_drops_excess_without_forwarding() {
    let t = test_node(Config {
        relay_mode: true,
        max_messages_per_second: 2,
        rate_limit_burst: 2,
        ..Config::default()
    });
    let log = Arc::new(Mutex::new(vec![]));
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.subscriptions.add_handler(sub, recording_handler(&log)).unwrap();

    let source = peer_id_from_seed("P");
    let mut outcomes = vec![];
    for i in 0..5 {
        let frame =
            Bytes::from(make_header("OMM", &source).frame(format!("m{i}").as_bytes()));
        outcomes.push(t.node.topic_router.accept("/sdn/data/OMM", source.clone(), frame).await);
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 2);
    assert_eq!(
        outcomes.iter().filter(|o| matches!(o, Err(RouteError::RateLimited))).count(),
        3
    );
    assert_eq!(log.lock().len(), 2);
    // Dropped messages are not forwarded either.
    assert_eq!(t.substrate.published().len(), 2);
}

/// Boundary: TTL 0 still delivers locally but never forwards.
#[tokio::test]
async fn ttl_zero_delivers_locally_but_never_forwards() {
    let t = test_node(Config { relay_mode: true, ..Config::default() });
    let log = Arc::new(Mutex::new(vec![]));
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.subscriptions.add_handler(sub, recording_handler(&log)).unwrap();

    let source = peer_id_from_seed("origin");
    let mut header = make_header("OMM", &source);
    header.ttl = 0;
    header.destinations = vec![peer_id_from_seed("local")];
    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", source, Bytes::from(header.frame(b"last hop")))
        .await
        .unwrap();
    assert_eq!(got.delivered, 1);
    assert!(!got.forwarded);
    assert!(t.substrate.published().is_empty());
}

/// Boundary: a message addressed elsewhere is not delivered locally; without
/// relay mode it is dropped outright.
#[tokio::test]
async fn destination_respect() {
    let t = test_node(Config::default());
    let log = Arc::new(Mutex::new(vec![]));
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.subscriptions.add_handler(sub, recording_handler(&log)).unwrap();

    let source = peer_id_from_seed("origin");
    let mut header = make_header("OMM", &source);
    header.destinations = vec![peer_id_from_seed("someone-else")];
    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", source, Bytes::from(header.frame(b"not yours")))
        .await;
    assert_matches!(got, Err(RouteError::NotDestination));
    assert!(log.lock().is_empty());
}

/// Repeated bridge syncs with unchanged subscriptions are free.
#[tokio::test]
async fn bridge_sync_is_idempotent() {
    let t = test_node(Config::default());
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();

    t.node.bridge.sync().await;
    assert_eq!(t.node.bridge.joined_topics().len(), 2, "data topic plus own point-cast topic");
    let joins = t.substrate.join_count();

    t.node.bridge.sync().await;
    t.node.bridge.sync().await;
    assert_eq!(t.substrate.join_count(), joins);
    assert_eq!(t.substrate.leave_count(), 0);

    t.node.subscriptions.cancel(sub).unwrap();
    t.node.bridge.sync().await;
    assert_eq!(t.substrate.leave_count(), 2);
    assert!(t.node.bridge.joined_topics().is_empty());
}

/// A failed substrate leave keeps the topic in the bridge's bookkeeping and
/// is retried on the next sync.
#[tokio::test]
async fn bridge_retries_failed_leaves() {
    let t = test_node(Config::default());
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.bridge.sync().await;
    assert_eq!(t.node.bridge.joined_topics().len(), 2);

    t.node.subscriptions.cancel(sub).unwrap();
    t.substrate.set_fail_leave(true);
    t.node.bridge.sync().await;
    // The leaves failed: nothing left the substrate and both topics are
    // still tracked, pending another attempt.
    assert_eq!(t.substrate.leave_count(), 0);
    assert_eq!(t.substrate.joined().len(), 2);
    assert_eq!(t.node.bridge.joined_topics().len(), 2);

    t.substrate.set_fail_leave(false);
    t.node.bridge.sync().await;
    assert_eq!(t.substrate.leave_count(), 2);
    assert!(t.node.bridge.joined_topics().is_empty());
    assert!(t.substrate.joined().is_empty());
}

/// A topic pending a failed leave that becomes required again is rejoined
/// with a fresh reader instead of lingering cancelled.
#[tokio::test]
async fn bridge_rejoins_topic_required_again_after_failed_leave() {
    let t = test_node(Config::default());
    let log = Arc::new(Mutex::new(vec![]));
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.bridge.sync().await;

    t.node.subscriptions.cancel(sub).unwrap();
    t.substrate.set_fail_leave(true);
    t.node.bridge.sync().await;
    t.substrate.set_fail_leave(false);

    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.subscriptions.add_handler(sub, recording_handler(&log)).unwrap();
    t.node.bridge.sync().await;

    let source = peer_id_from_seed("remote");
    let frame = Bytes::from(make_header("OMM", &source).frame(b"after rejoin"));
    assert!(t.substrate.inject("/sdn/data/OMM", source, frame).await);
    wait_or_timeout(10, 2000, || async {
        if log.lock().is_empty() { ControlFlow::Continue(()) } else { ControlFlow::Break(()) }
    })
    .await
    .expect("delivery after rejoin");
}

/// Messages injected through the substrate reach handlers via the bridge's
/// reader tasks.
#[tokio::test]
async fn bridge_reader_feeds_the_router() {
    let t = test_node(Config::default());
    let log = Arc::new(Mutex::new(vec![]));
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.subscriptions.add_handler(sub, recording_handler(&log)).unwrap();
    t.node.bridge.sync().await;

    let source = peer_id_from_seed("remote");
    let frame = Bytes::from(make_header("OMM", &source).frame(b"via substrate"));
    assert!(t.substrate.inject("/sdn/data/OMM", source, frame).await);

    wait_or_timeout(10, 2000, || async {
        if log.lock().is_empty() { ControlFlow::Continue(()) } else { ControlFlow::Break(()) }
    })
    .await
    .expect("delivery via bridge");
    assert_eq!(&log.lock()[0].payload[..], b"via substrate");
}

/// Raw (header-less) messages synthesize their identity from topic and
/// transport sender.
#[tokio::test]
async fn raw_messages_are_delivered_without_header() {
    let t = test_node(Config::default());
    let log = Arc::new(Mutex::new(vec![]));
    let sub = t.node.subscriptions.create(SubscriptionConfig::new([schema("OMM")])).unwrap();
    t.node.subscriptions.add_handler(sub, recording_handler(&log)).unwrap();

    let source = peer_id_from_seed("legacy");
    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", source.clone(), Bytes::from_static(b"{\"raw\":true}"))
        .await
        .unwrap();
    assert_eq!(got.delivered, 1);
    let deliveries = log.lock();
    assert!(deliveries[0].header.is_none());
    assert_eq!(deliveries[0].from, source);
}

/// Local publish frames the message, records it as seen, and selects topics
/// from the header.
#[tokio::test]
async fn publish_selects_topics_and_suppresses_own_echo() {
    let t = test_node(Config::default());
    let destination = peer_id_from_seed("addressee");
    let message_id = t
        .node
        .publish(
            schema("OMM"),
            Bytes::from_static(b"fresh elements"),
            PublishOptions { destinations: vec![destination.clone()], ..PublishOptions::default() },
        )
        .await
        .unwrap();

    let published = t.substrate.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].0, "/sdn/data/OMM");
    assert_eq!(published[1].0, format!("/sdn/peer/{destination}"));
    let (header, payload) =
        RoutingHeader::parse(&published[0].1, &FrameLimits::default()).unwrap();
    assert_eq!(header.message_id, message_id);
    assert_eq!(header.source_peer, peer_id_from_seed("local"));
    assert_eq!(header.ttl, t.node.config().default_ttl);
    assert_eq!(&payload[..], b"fresh elements");

    // Our own echo from the substrate is dropped as a duplicate.
    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", peer_id_from_seed("local"), published[0].1.clone())
        .await;
    assert_matches!(got, Err(RouteError::Duplicate));
}

/// A peer dropping to Untrusted loses the gate and its streaming sessions.
#[tokio::test]
async fn trust_revocation_tears_down_sessions_and_gate() {
    let t = test_node(Config::default());
    let peer = peer_id_from_seed("flaky-operator");
    t.node
        .registry
        .add(peer.clone(), Some(TrustLevel::Trusted), vec![], None, None, None)
        .unwrap();
    let sub = t
        .node
        .subscriptions
        .create(SubscriptionConfig { streaming: true, ..SubscriptionConfig::new([schema("OMM")]) })
        .unwrap();
    let session = t
        .node
        .sessions
        .create(
            sub,
            peer.clone(),
            [schema("OMM")].into_iter().collect(),
            DeliveryMode::Streaming,
            SessionEncryption::None,
        )
        .unwrap();
    let gate = t.substrate.connection_gate().unwrap();
    assert_eq!(gate.admit(&peer, GateMoment::InboundHandshake), Ok(()));

    t.node.registry.set_trust(&peer, TrustLevel::Untrusted).unwrap();

    assert_eq!(gate.admit(&peer, GateMoment::InboundHandshake), Err(Refusal::Untrusted));
    assert!(!session.is_active());

    // Blocking has the same effect on another session.
    t.node.registry.set_trust(&peer, TrustLevel::Trusted).unwrap();
    let session = t
        .node
        .sessions
        .create(
            sub,
            peer.clone(),
            [schema("OMM")].into_iter().collect(),
            DeliveryMode::Streaming,
            SessionEncryption::None,
        )
        .unwrap();
    t.node.registry.block(&peer).unwrap();
    assert!(!session.is_active());
    assert_eq!(gate.admit(&peer, GateMoment::OutboundPreDial), Err(Refusal::Blocked));
}

/// Oversized substrate messages are dropped before parsing.
#[tokio::test]
async fn oversized_messages_are_dropped() {
    let t = test_node(Config { max_message_size: 64, ..Config::default() });
    let source = peer_id_from_seed("bulk");
    let got = t
        .node
        .topic_router
        .accept("/sdn/data/OMM", source, Bytes::from(vec![0u8; 65]))
        .await;
    assert_matches!(got, Err(RouteError::OversizedMessage { got: 65, max: 64 }));
}
