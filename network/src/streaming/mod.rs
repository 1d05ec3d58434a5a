//! Streaming sessions: long-lived per-subscriber flows fed from the
//! subscription engine's global handler.
//!
//! A session names the records it wants by schema, a delivery mode (single
//! shot, continuous, or batched) and an encryption mode. Each session owns a
//! bounded outbound queue drained by a dedicated worker task; the global
//! handler only enqueues, so a slow subscriber can never back up the
//! subscription engine: its session overflows and is closed instead.

use crate::network_protocol::SchemaType;
use crate::stats::metrics;
use crate::subscriptions::{HandlerToken, SubscriptionId, SubscriptionManager};
use crate::types::Delivery;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use sdn_crypto::{SessionKey, SessionKeyId, ecies_seal};
use sdn_primitives::network::PeerId;
use sdn_time::{Clock, Duration, Instant, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;


#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum DeliveryMode {
    /// The first matching message is sent, then the session auto-closes.
    Single,
    /// Every matching message is sent as it arrives.
    Streaming,
    /// Matching messages are buffered and flushed by count or interval.
    Batch,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum::IntoStaticStr)]
pub enum SessionEncryption {
    /// Payload forwarded as-is.
    None,
    /// Per-message envelope keyed to the subscriber's identity key.
    Ecies,
    /// Symmetric key minted at session creation, conveyed out-of-band.
    SessionKey,
    /// Session key ECIES-wrapped to the subscriber at setup, then symmetric.
    Hybrid,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub max_sessions_per_peer: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_queue_size: usize,
    /// Transport/encryption failures tolerated before the session closes.
    pub max_failures: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_peer: 4,
            batch_size: 32,
            batch_interval: Duration::seconds(1),
            idle_timeout: Duration::minutes(5),
            outbound_queue_size: 256,
            max_failures: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("per-subscriber session limit reached")]
    LimitExceeded,
    #[error("session not found")]
    NotFound,
    #[error("originating subscription not found")]
    UnknownSubscription,
    #[error("originating subscription is not marked streaming")]
    NotStreaming,
    #[error("session key conveyance failed")]
    KeyExchange(#[source] anyhow::Error),
    #[error("encryption failure")]
    Crypto(#[source] anyhow::Error),
}

/// Why a session went inactive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
pub enum CloseReason {
    /// Explicit close.
    Closed,
    /// Single-mode delivery completed.
    Delivered,
    /// Outbound queue overflowed: slow consumer.
    Overflow,
    /// Failure counter exceeded the configured threshold.
    TransportFailures,
    /// No activity past the idle cutoff.
    Idle,
    /// The subscriber's trust was revoked or it was blocked.
    TrustRevoked,
}

/// Outbound transport for session deliveries. One frame per call; frames of
/// one session are sent in order by its worker.
#[async_trait::async_trait]
pub trait StreamingTransport: Send + Sync + 'static {
    async fn send(
        &self,
        subscriber: &PeerId,
        session_id: SessionId,
        frame: Bytes,
    ) -> anyhow::Result<()>;
}

/// Session-key material handed to the external key-exchange collaborator.
/// The routing core does not define how it travels.
#[derive(Clone, Debug)]
pub enum KeyMaterial {
    Raw(Vec<u8>),
    EciesWrapped(Vec<u8>),
}

/// External key-exchange hook. Called synchronously during session creation;
/// implementations must be fast and must not block on the network.
pub trait SessionKeyExchange: Send + Sync {
    fn convey(
        &self,
        subscriber: &PeerId,
        key_id: SessionKeyId,
        material: KeyMaterial,
    ) -> anyhow::Result<()>;
}

/// One frame on the wire, before encryption.
#[derive(Debug, PartialEq, Eq, borsh::BorshSerialize, borsh::BorshDeserialize)]
pub enum StreamFrame {
    Data(Vec<u8>),
    Batch(Vec<Vec<u8>>),
}

#[derive(Debug)]
struct SessionState {
    active: bool,
    /// Single-mode sessions stop accepting at the first message.
    accepting: bool,
    close_reason: Option<CloseReason>,
    last_activity: Instant,
    messages_sent: u64,
    bytes_sent: u64,
    failures: u32,
    last_error: Option<String>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub subscription_id: SubscriptionId,
    pub subscriber: PeerId,
    pub schemas: BTreeSet<SchemaType>,
    pub mode: DeliveryMode,
    pub encryption: SessionEncryption,
    created: Utc,
    key: Option<SessionKey>,
    state: Mutex<SessionState>,
    queue: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

impl Session {
    pub fn session_key_id(&self) -> Option<SessionKeyId> {
        self.key.as_ref().map(|k| k.id())
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().close_reason
    }

    /// Marks the session inactive and cancels its worker, dropping any
    /// pending batched items. Returns false if it was already closed.
    fn close_with(&self, reason: CloseReason) -> bool {
        {
            let mut state = self.state.lock();
            if !state.active {
                return false;
            }
            state.active = false;
            state.accepting = false;
            state.close_reason = Some(reason);
        }
        self.token.cancel();
        tracing::debug!(
            target: "stream",
            id = %self.id,
            subscriber = %self.subscriber,
            reason = <&str>::from(reason),
            "session closed"
        );
        true
    }

    pub fn view(&self) -> SessionView {
        let state = self.state.lock();
        SessionView {
            id: self.id.to_string(),
            subscription_id: self.subscription_id.to_string(),
            subscriber: self.subscriber.to_string(),
            schemas: self.schemas.iter().map(|s| s.to_string()).collect(),
            mode: <&str>::from(self.mode).to_string(),
            encryption: <&str>::from(self.encryption).to_string(),
            session_key_id: self.key.as_ref().map(|k| k.id().to_string()),
            created: self.created,
            active: state.active,
            close_reason: state.close_reason.map(|r| <&str>::from(r).to_string()),
            messages_sent: state.messages_sent,
            bytes_sent: state.bytes_sent,
            failures: state.failures,
            last_error: state.last_error.clone(),
        }
    }
}

/// Inspection snapshot of one session.
#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionView {
    pub id: String,
    pub subscription_id: String,
    pub subscriber: String,
    pub schemas: Vec<String>,
    pub mode: String,
    pub encryption: String,
    pub session_key_id: Option<String>,
    pub created: Utc,
    pub active: bool,
    pub close_reason: Option<String>,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub failures: u32,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct SessionManagerStats {
    pub active_sessions: usize,
    pub total_created: u64,
    /// Summed over currently tracked sessions.
    pub messages_sent: u64,
    pub bytes_sent: u64,
}

struct Inner {
    sessions: HashMap<SessionId, Arc<Session>>,
    next_session_id: u64,
    /// Ids handed out over the process lifetime; never reused.
    used_key_ids: HashSet<SessionKeyId>,
    total_created: u64,
}

pub struct SessionManager {
    clock: Clock,
    config: StreamingConfig,
    subscriptions: Arc<SubscriptionManager>,
    transport: Arc<dyn StreamingTransport>,
    key_exchange: Arc<dyn SessionKeyExchange>,
    inner: RwLock<Inner>,
}

impl SessionManager {
    pub fn new(
        clock: Clock,
        config: StreamingConfig,
        subscriptions: Arc<SubscriptionManager>,
        transport: Arc<dyn StreamingTransport>,
        key_exchange: Arc<dyn SessionKeyExchange>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            config,
            subscriptions,
            transport,
            key_exchange,
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                next_session_id: 0,
                used_key_ids: HashSet::new(),
                total_created: 0,
            }),
        })
    }

    /// Installs the bridge from subscription deliveries into sessions. The
    /// handler only enqueues; all transport I/O happens on worker tasks.
    pub fn register(self: &Arc<Self>) -> HandlerToken {
        let this = Arc::downgrade(self);
        self.subscriptions.add_global_handler(Arc::new(move |delivery: &Delivery| {
            if let Some(manager) = this.upgrade() {
                manager.deliver(delivery);
            }
        }))
    }

    pub fn create(
        &self,
        subscription_id: SubscriptionId,
        subscriber: PeerId,
        schemas: BTreeSet<SchemaType>,
        mode: DeliveryMode,
        encryption: SessionEncryption,
    ) -> Result<Arc<Session>, StreamError> {
        let sub = self
            .subscriptions
            .get_config(subscription_id)
            .ok_or(StreamError::UnknownSubscription)?;
        if !sub.streaming {
            return Err(StreamError::NotStreaming);
        }

        let mut inner = self.inner.write();
        let active = inner
            .sessions
            .values()
            .filter(|s| s.subscriber == subscriber && s.is_active())
            .count();
        if active >= self.config.max_sessions_per_peer {
            return Err(StreamError::LimitExceeded);
        }

        let key = match encryption {
            SessionEncryption::SessionKey | SessionEncryption::Hybrid => {
                let mut key = SessionKey::generate();
                // 128-bit ids collide only by cosmic accident; regenerate if
                // one ever does.
                while !inner.used_key_ids.insert(key.id()) {
                    key = SessionKey::generate();
                }
                Some(key)
            }
            SessionEncryption::None | SessionEncryption::Ecies => None,
        };
        if let Some(key) = &key {
            let material = match encryption {
                SessionEncryption::Hybrid => KeyMaterial::EciesWrapped(
                    ecies_seal(subscriber.public_key(), key.id().as_bytes(), &key.to_bytes())
                        .map_err(|err| StreamError::Crypto(err.into()))?,
                ),
                _ => KeyMaterial::Raw(key.to_bytes()),
            };
            self.key_exchange
                .convey(&subscriber, key.id(), material)
                .map_err(StreamError::KeyExchange)?;
        }

        let id = SessionId(inner.next_session_id);
        inner.next_session_id += 1;
        inner.total_created += 1;
        let (queue, rx) = mpsc::channel(self.config.outbound_queue_size);
        let session = Arc::new(Session {
            id,
            subscription_id,
            subscriber,
            schemas,
            mode,
            encryption,
            created: self.clock.now_utc(),
            key,
            state: Mutex::new(SessionState {
                active: true,
                accepting: true,
                close_reason: None,
                last_activity: self.clock.now(),
                messages_sent: 0,
                bytes_sent: 0,
                failures: 0,
                last_error: None,
            }),
            queue,
            token: CancellationToken::new(),
        });
        inner.sessions.insert(id, session.clone());
        metrics::ACTIVE_SESSIONS.set(
            inner.sessions.values().filter(|s| s.is_active()).count() as i64,
        );
        tracing::debug!(
            target: "stream",
            %id,
            subscriber = %session.subscriber,
            mode = <&str>::from(mode),
            encryption = <&str>::from(encryption),
            "session created"
        );
        tokio::spawn(run_worker(
            session.clone(),
            self.transport.clone(),
            self.clock.clone(),
            self.config.clone(),
            rx,
        ));
        Ok(session)
    }

    /// Synchronous close: pending batched items are dropped, not flushed.
    pub fn close(&self, id: SessionId) -> Result<(), StreamError> {
        let session =
            self.inner.read().sessions.get(&id).cloned().ok_or(StreamError::NotFound)?;
        session.close_with(CloseReason::Closed);
        Ok(())
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(&id).cloned()
    }

    /// Bridge from the subscription engine. Enqueue-only; a full queue marks
    /// the session a slow consumer and closes it with an overflow.
    pub fn deliver(&self, delivery: &Delivery) {
        let sessions: Vec<Arc<Session>> =
            self.inner.read().sessions.values().cloned().collect();
        for session in sessions {
            if !session.schemas.contains(&delivery.schema) {
                continue;
            }
            {
                let mut state = session.state.lock();
                if !state.active || !state.accepting {
                    continue;
                }
                if session.mode == DeliveryMode::Single {
                    state.accepting = false;
                }
                state.last_activity = self.clock.now();
            }
            match session.queue.try_send(delivery.payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        target: "stream",
                        id = %session.id,
                        subscriber = %session.subscriber,
                        "outbound queue overflow, closing slow consumer"
                    );
                    session.close_with(CloseReason::Overflow);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Closes every session of `peer`. Wired to trust-revocation events.
    pub fn close_for_peer(&self, peer: &PeerId) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .read()
            .sessions
            .values()
            .filter(|s| s.subscriber == *peer)
            .cloned()
            .collect();
        for session in sessions {
            session.close_with(CloseReason::TrustRevoked);
        }
    }

    /// Closes sessions idle past the cutoff, drops closed sessions from the
    /// map, and refreshes the gauge.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        for session in inner.sessions.values() {
            let idle = {
                let state = session.state.lock();
                state.active && now - state.last_activity > self.config.idle_timeout
            };
            if idle {
                session.close_with(CloseReason::Idle);
            }
        }
        inner.sessions.retain(|_, session| session.is_active());
        metrics::ACTIVE_SESSIONS.set(inner.sessions.len() as i64);
    }

    pub fn list(&self) -> Vec<SessionView> {
        let mut views: Vec<_> =
            self.inner.read().sessions.values().map(|s| s.view()).collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    pub fn stats(&self) -> SessionManagerStats {
        let inner = self.inner.read();
        let mut stats = SessionManagerStats {
            total_created: inner.total_created,
            ..SessionManagerStats::default()
        };
        for session in inner.sessions.values() {
            let state = session.state.lock();
            if state.active {
                stats.active_sessions += 1;
            }
            stats.messages_sent += state.messages_sent;
            stats.bytes_sent += state.bytes_sent;
        }
        stats
    }
}

async fn run_worker(
    session: Arc<Session>,
    transport: Arc<dyn StreamingTransport>,
    clock: Clock,
    config: StreamingConfig,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let mut batch: Vec<Bytes> = vec![];
    let mut flush_deadline: Option<Instant> = None;
    loop {
        // A disabled timer branch still needs a deadline expression; park it
        // far enough out that it never fires.
        let deadline = flush_deadline.unwrap_or_else(|| clock.now() + Duration::days(365));
        tokio::select! {
            // Cancellation drops whatever is buffered: close never flushes.
            _ = session.token.cancelled() => break,
            item = rx.recv() => match item {
                None => break,
                Some(payload) => match session.mode {
                    DeliveryMode::Single | DeliveryMode::Streaming => {
                        let frame = StreamFrame::Data(payload.to_vec());
                        if !send_frame(&session, &transport, frame, 1, &config).await {
                            break;
                        }
                        if session.mode == DeliveryMode::Single {
                            session.close_with(CloseReason::Delivered);
                            break;
                        }
                    }
                    DeliveryMode::Batch => {
                        batch.push(payload);
                        if batch.len() >= config.batch_size {
                            let items = std::mem::take(&mut batch);
                            flush_deadline = None;
                            if !flush_batch(&session, &transport, items, &config).await {
                                break;
                            }
                        } else if flush_deadline.is_none() {
                            flush_deadline = Some(clock.now() + config.batch_interval);
                        }
                    }
                },
            },
            _ = clock.sleep_until(deadline), if flush_deadline.is_some() => {
                let items = std::mem::take(&mut batch);
                flush_deadline = None;
                if !items.is_empty()
                    && !flush_batch(&session, &transport, items, &config).await
                {
                    break;
                }
            }
        }
    }
}

async fn flush_batch(
    session: &Arc<Session>,
    transport: &Arc<dyn StreamingTransport>,
    items: Vec<Bytes>,
    config: &StreamingConfig,
) -> bool {
    let count = items.len() as u64;
    let frame = StreamFrame::Batch(items.into_iter().map(|b| b.to_vec()).collect());
    send_frame(session, transport, frame, count, config).await
}

/// Encrypts and sends one frame. Returns false when the worker should stop
/// (failure threshold exceeded). The message itself is never retried.
async fn send_frame(
    session: &Arc<Session>,
    transport: &Arc<dyn StreamingTransport>,
    frame: StreamFrame,
    message_count: u64,
    config: &StreamingConfig,
) -> bool {
    let encoded = borsh::to_vec(&frame).expect("borsh serialization");
    let aad = session.id.to_string();
    let bytes = match session.encryption {
        SessionEncryption::None => encoded,
        SessionEncryption::Ecies => {
            match ecies_seal(session.subscriber.public_key(), aad.as_bytes(), &encoded) {
                Ok(sealed) => sealed,
                Err(err) => return record_failure(session, &err.to_string(), config),
            }
        }
        SessionEncryption::SessionKey | SessionEncryption::Hybrid => match &session.key {
            Some(key) => match key.seal(aad.as_bytes(), &encoded) {
                Ok(sealed) => sealed,
                Err(err) => return record_failure(session, &err.to_string(), config),
            },
            // Unreachable by construction; treat as a failure rather than
            // sending plaintext.
            None => return record_failure(session, "session key missing", config),
        },
    };
    let len = bytes.len() as u64;
    match transport.send(&session.subscriber, session.id, Bytes::from(bytes)).await {
        Ok(()) => {
            let mut state = session.state.lock();
            state.messages_sent += message_count;
            state.bytes_sent += len;
            metrics::SESSION_BYTES_SENT.inc_by(len);
            true
        }
        Err(err) => record_failure(session, &err.to_string(), config),
    }
}

fn record_failure(session: &Arc<Session>, error: &str, config: &StreamingConfig) -> bool {
    let failures = {
        let mut state = session.state.lock();
        state.failures += 1;
        state.last_error = Some(error.to_string());
        state.failures
    };
    tracing::warn!(
        target: "stream",
        id = %session.id,
        failures,
        error,
        "session delivery failed"
    );
    if failures > config.max_failures {
        session.close_with(CloseReason::TransportFailures);
        false
    } else {
        true
    }
}
