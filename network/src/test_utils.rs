//! Helpers shared by the test suites: deterministic peer identities, a fake
//! substrate, and recording doubles for the streaming collaborators.

use crate::network_protocol::{MessageId, Priority, RoutingHeader, SchemaType};
use crate::streaming::{KeyMaterial, SessionId, SessionKeyExchange, StreamingTransport};
use crate::substrate::{ConnectionGate, Substrate, TopicStream};
use bytes::Bytes;
use parking_lot::Mutex;
use sdn_crypto::{KeyType, SecretKey, SessionKeyId};
use sdn_primitives::network::PeerId;
use sdn_time::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// `peer_id_from_seed` generates a deterministic `PeerId` for unit tests.
pub fn peer_id_from_seed(seed: &str) -> PeerId {
    PeerId::new(SecretKey::from_seed(KeyType::ED25519, seed).public_key())
}

pub fn secret_key_from_seed(seed: &str) -> SecretKey {
    SecretKey::from_seed(KeyType::ED25519, seed)
}

pub fn random_peer_id() -> PeerId {
    PeerId::random()
}

/// A plausible framed-message header with test defaults.
pub fn make_header(schema: &str, source: &PeerId) -> RoutingHeader {
    RoutingHeader {
        schema_type: schema.parse().expect("schema"),
        source_peer: source.clone(),
        destinations: vec![],
        ttl: 8,
        priority: Priority::Normal,
        encrypted: false,
        message_id: MessageId::random(),
        timestamp: Utc::UNIX_EPOCH,
        session_key_id: None,
    }
}

pub fn schema(name: &str) -> SchemaType {
    name.parse().expect("schema")
}

/// In-memory [`Substrate`]: records publishes, hands out channels for joined
/// topics, and lets tests inject inbound messages.
pub struct FakeSubstrate {
    local: PeerId,
    published: Mutex<Vec<(String, Bytes)>>,
    topics: Mutex<HashMap<String, mpsc::Sender<(PeerId, Bytes)>>>,
    joins: AtomicUsize,
    leaves: AtomicUsize,
    fail_publish: AtomicBool,
    fail_leave: AtomicBool,
    gate: Mutex<Option<Arc<dyn ConnectionGate>>>,
}

impl FakeSubstrate {
    pub fn new(local: PeerId) -> Arc<Self> {
        Arc::new(Self {
            local,
            published: Mutex::new(vec![]),
            topics: Mutex::new(HashMap::new()),
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            fail_publish: AtomicBool::new(false),
            fail_leave: AtomicBool::new(false),
            gate: Mutex::new(None),
        })
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    pub fn joined(&self) -> Vec<String> {
        let mut topics: Vec<_> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn join_count(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leave_count(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_leave(&self, fail: bool) {
        self.fail_leave.store(fail, Ordering::SeqCst);
    }

    pub fn connection_gate(&self) -> Option<Arc<dyn ConnectionGate>> {
        self.gate.lock().clone()
    }

    /// Injects an inbound message on a joined topic. Returns false if the
    /// node is not joined to the topic (the message goes nowhere).
    pub async fn inject(&self, topic: &str, sender: PeerId, data: Bytes) -> bool {
        let tx = self.topics.lock().get(topic).cloned();
        match tx {
            Some(tx) => tx.send((sender, data)).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl Substrate for FakeSubstrate {
    fn local_peer_id(&self) -> PeerId {
        self.local.clone()
    }

    async fn publish(&self, topic: &str, data: Bytes) -> anyhow::Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            anyhow::bail!("injected publish failure");
        }
        self.published.lock().push((topic.to_string(), data));
        Ok(())
    }

    async fn join(&self, topic: &str) -> anyhow::Result<TopicStream> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.topics.lock().insert(topic.to_string(), tx);
        Ok(TopicStream { topic: topic.to_string(), receiver: rx })
    }

    async fn leave(&self, topic: &str) -> anyhow::Result<()> {
        if self.fail_leave.load(Ordering::SeqCst) {
            anyhow::bail!("injected leave failure");
        }
        self.leaves.fetch_add(1, Ordering::SeqCst);
        self.topics.lock().remove(topic);
        Ok(())
    }

    fn set_connection_gate(&self, gate: Arc<dyn ConnectionGate>) {
        *self.gate.lock() = Some(gate);
    }
}

/// Records streaming deliveries; can be told to fail.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(PeerId, SessionId, Bytes)>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<(PeerId, SessionId, Bytes)> {
        self.sent.lock().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl StreamingTransport for RecordingTransport {
    async fn send(
        &self,
        subscriber: &PeerId,
        session_id: SessionId,
        frame: Bytes,
    ) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("injected transport failure");
        }
        self.sent.lock().push((subscriber.clone(), session_id, frame));
        Ok(())
    }
}

/// Records conveyed session keys; can be told to fail.
#[derive(Default)]
pub struct RecordingKeyExchange {
    conveyed: Mutex<Vec<(PeerId, SessionKeyId, KeyMaterial)>>,
    fail: AtomicBool,
}

impl RecordingKeyExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn conveyed(&self) -> Vec<(PeerId, SessionKeyId, KeyMaterial)> {
        self.conveyed.lock().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl SessionKeyExchange for RecordingKeyExchange {
    fn convey(
        &self,
        subscriber: &PeerId,
        key_id: SessionKeyId,
        material: KeyMaterial,
    ) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("injected key exchange failure");
        }
        self.conveyed.lock().push((subscriber.clone(), key_id, material));
        Ok(())
    }
}

/// Blocks until `cond` returns `ControlFlow::Break`, checking it every
/// `check_interval_ms`.
///
/// If the condition wasn't fulfilled within `max_wait_ms`, returns an error.
pub async fn wait_or_timeout<C, F, T>(
    check_interval_ms: u64,
    max_wait_ms: u64,
    mut cond: C,
) -> Result<T, tokio::time::error::Elapsed>
where
    C: FnMut() -> F,
    F: Future<Output = ControlFlow<T>>,
{
    assert!(
        check_interval_ms < max_wait_ms,
        "interval shorter than wait time, did you swap the argument order?"
    );
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(check_interval_ms));
    tokio::time::timeout(tokio::time::Duration::from_millis(max_wait_ms), async {
        loop {
            interval.tick().await;
            if let ControlFlow::Break(res) = cond().await {
                break res;
            }
        }
    })
    .await
}
