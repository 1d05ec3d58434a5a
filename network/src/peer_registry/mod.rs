//! Persistent trust registry.
//!
//! Maps peer identity to a trust level plus bookkeeping (addresses, groups,
//! observed connection statistics). The in-memory view is authoritative for
//! reads; every mutation is persisted first and applied to memory only after
//! the write succeeded, so a failed store write never leaves the two views
//! disagreeing.
//!
//! Hot statistics counters are the exception: they are updated in memory on
//! the connection path (which must never block on storage) and flushed
//! periodically by [`PeerRegistry::flush_stats`].

use crate::store;
use parking_lot::{Mutex, RwLock};
use sdn_primitives::network::PeerId;
use sdn_time::{Clock, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub mod gate;

#[cfg(test)]
mod tests;

/// Ordered trust policy labels.
///
/// * `Untrusted`: no connection may be established in either direction.
/// * `Limited`: read-only participation, strictest rate-limit tier.
/// * `Standard`: default for unknown peers outside strict mode.
/// * `Trusted`: full participation, priority routing eligible.
/// * `Admin`: `Trusted` plus authority to mutate this registry.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
    strum::IntoStaticStr,
)]
#[borsh(use_discriminant = true)]
pub enum TrustLevel {
    Untrusted = 0,
    Limited = 1,
    #[default]
    Standard = 2,
    Trusted = 3,
    Admin = 4,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(<&str>::from(self))
    }
}

/// Observed connection statistics for one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerStats {
    pub first_seen: Option<Utc>,
    pub last_seen: Option<Utc>,
    pub successful_connects: u64,
    pub failed_connects: u64,
    /// Protocol faults attributed to the peer (e.g. spoofed source headers).
    pub faults: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// One registry record.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrustedPeer {
    pub peer_id: PeerId,
    /// Opaque dialable addresses, owned by the transport.
    pub addrs: Vec<String>,
    pub trust_level: TrustLevel,
    pub name: Option<String>,
    pub organization: Option<String>,
    pub groups: Vec<String>,
    #[serde(default)]
    pub stats: PeerStats,
    #[serde(default)]
    pub notes: String,
}

/// Named peer group carrying a default trust level for members added without
/// an explicit one.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeerGroup {
    pub name: String,
    pub description: String,
    pub default_trust: TrustLevel,
    pub members: BTreeSet<PeerId>,
}

/// Serializable snapshot of the whole registry, used by `export`/`import`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegistryExport {
    pub peers: Vec<TrustedPeer>,
    pub groups: Vec<PeerGroup>,
    pub blocked: Vec<PeerId>,
    pub strict_mode: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("peer already exists")]
    AlreadyExists,
    #[error("peer not found")]
    NotFound,
    #[error("group `{0}` not found")]
    GroupNotFound(String),
    #[error("group `{0}` already exists")]
    GroupAlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(Box<dyn std::error::Error + Send + Sync>),
}

impl From<store::Error> for RegistryError {
    fn from(err: store::Error) -> Self {
        RegistryError::Storage(Box::new(err))
    }
}

/// Invoked after a peer's resolved trust level changed (admin action, block,
/// removal). Must be cheap; called outside registry locks.
pub type TrustListener = Arc<dyn Fn(&PeerId, TrustLevel) + Send + Sync>;

struct Inner {
    peers: HashMap<PeerId, TrustedPeer>,
    groups: HashMap<String, PeerGroup>,
    blocked: HashSet<PeerId>,
    strict_mode: bool,
    /// Peers whose in-memory statistics are ahead of the persisted record.
    dirty_stats: HashSet<PeerId>,
}

pub struct PeerRegistry {
    clock: Clock,
    store: store::Store,
    inner: RwLock<Inner>,
    listeners: Mutex<Vec<TrustListener>>,
}

impl PeerRegistry {
    /// Loads the persisted registry. `default_strict` applies only when no
    /// strict-mode setting has ever been persisted.
    pub fn new(
        clock: Clock,
        db: Arc<dyn sdn_store::Database>,
        default_strict: bool,
    ) -> Result<Self, RegistryError> {
        let store = store::Store::from(db);
        let peers: HashMap<_, _> =
            store.list_peers()?.into_iter().map(|p| (p.peer_id.clone(), p)).collect();
        let groups: HashMap<_, _> =
            store.list_groups()?.into_iter().map(|g| (g.name.clone(), g)).collect();
        let blocked: HashSet<_> = store.list_blocked()?.into_iter().collect();
        let strict_mode = store.get_strict_mode()?.unwrap_or(default_strict);
        tracing::debug!(
            target: "registry",
            peers = peers.len(),
            groups = groups.len(),
            blocked = blocked.len(),
            strict_mode,
            "loaded trust registry"
        );
        Ok(Self {
            clock,
            store,
            inner: RwLock::new(Inner {
                peers,
                groups,
                blocked,
                strict_mode,
                dirty_stats: HashSet::new(),
            }),
            listeners: Mutex::new(vec![]),
        })
    }

    /// Trust resolution. Blocklist takes precedence over everything else.
    pub fn resolve(&self, peer_id: &PeerId) -> TrustLevel {
        let inner = self.inner.read();
        if inner.blocked.contains(peer_id) {
            return TrustLevel::Untrusted;
        }
        match inner.peers.get(peer_id) {
            Some(peer) => peer.trust_level,
            None if inner.strict_mode => TrustLevel::Untrusted,
            None => TrustLevel::Standard,
        }
    }

    pub fn is_blocked(&self, peer_id: &PeerId) -> bool {
        self.inner.read().blocked.contains(peer_id)
    }

    pub fn strict_mode(&self) -> bool {
        self.inner.read().strict_mode
    }

    pub fn add(
        &self,
        peer_id: PeerId,
        trust_level: Option<TrustLevel>,
        addrs: Vec<String>,
        group: Option<String>,
        name: Option<String>,
        organization: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.peers.contains_key(&peer_id) {
            return Err(RegistryError::AlreadyExists);
        }
        let group_record = match &group {
            Some(group_name) => Some(
                inner
                    .groups
                    .get(group_name)
                    .cloned()
                    .ok_or_else(|| RegistryError::GroupNotFound(group_name.clone()))?,
            ),
            None => None,
        };
        // An explicit level wins; otherwise the group default; otherwise
        // Standard.
        let trust_level = trust_level
            .or_else(|| group_record.as_ref().map(|g| g.default_trust))
            .unwrap_or(TrustLevel::Standard);
        let peer = TrustedPeer {
            peer_id: peer_id.clone(),
            addrs,
            trust_level,
            name,
            organization,
            groups: group.iter().cloned().collect(),
            stats: PeerStats::default(),
            notes: String::new(),
        };

        let mut update = self.store.update();
        update.set_peer(&peer);
        let group_record = group_record.map(|mut g| {
            g.members.insert(peer_id.clone());
            update.set_group(&g);
            g
        });
        self.store.commit(update)?;

        inner.peers.insert(peer_id, peer);
        if let Some(g) = group_record {
            inner.groups.insert(g.name.clone(), g);
        }
        Ok(())
    }

    pub fn remove(&self, peer_id: &PeerId) -> Result<(), RegistryError> {
        let new_level = {
            let mut inner = self.inner.write();
            let peer = inner.peers.get(peer_id).ok_or(RegistryError::NotFound)?.clone();

            let mut update = self.store.update();
            update.del_peer(peer_id);
            let mut touched_groups = vec![];
            for group_name in &peer.groups {
                if let Some(mut g) = inner.groups.get(group_name).cloned() {
                    g.members.remove(peer_id);
                    update.set_group(&g);
                    touched_groups.push(g);
                }
            }
            self.store.commit(update)?;

            inner.peers.remove(peer_id);
            inner.dirty_stats.remove(peer_id);
            for g in touched_groups {
                inner.groups.insert(g.name.clone(), g);
            }
            if inner.blocked.contains(peer_id) || inner.strict_mode {
                TrustLevel::Untrusted
            } else {
                TrustLevel::Standard
            }
        };
        self.notify(peer_id, new_level);
        Ok(())
    }

    pub fn set_trust(&self, peer_id: &PeerId, level: TrustLevel) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.write();
            let mut peer = inner.peers.get(peer_id).ok_or(RegistryError::NotFound)?.clone();
            peer.trust_level = level;

            let mut update = self.store.update();
            update.set_peer(&peer);
            self.store.commit(update)?;
            inner.peers.insert(peer_id.clone(), peer);
        }
        self.notify(peer_id, self.resolve(peer_id));
        Ok(())
    }

    pub fn lookup(&self, peer_id: &PeerId) -> Option<TrustedPeer> {
        self.inner.read().peers.get(peer_id).cloned()
    }

    /// Blocks every connection to and from the peer, regardless of its trust
    /// level. Idempotent.
    pub fn block(&self, peer_id: &PeerId) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.write();
            if !inner.blocked.contains(peer_id) {
                let mut update = self.store.update();
                update.set_blocked(peer_id);
                self.store.commit(update)?;
                inner.blocked.insert(peer_id.clone());
            }
        }
        self.notify(peer_id, TrustLevel::Untrusted);
        Ok(())
    }

    pub fn unblock(&self, peer_id: &PeerId) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.write();
            if inner.blocked.contains(peer_id) {
                let mut update = self.store.update();
                update.del_blocked(peer_id);
                self.store.commit(update)?;
                inner.blocked.remove(peer_id);
            }
        }
        self.notify(peer_id, self.resolve(peer_id));
        Ok(())
    }

    pub fn add_group(
        &self,
        name: String,
        description: String,
        default_trust: TrustLevel,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.groups.contains_key(&name) {
            return Err(RegistryError::GroupAlreadyExists(name));
        }
        let group =
            PeerGroup { name: name.clone(), description, default_trust, members: BTreeSet::new() };
        let mut update = self.store.update();
        update.set_group(&group);
        self.store.commit(update)?;
        inner.groups.insert(name, group);
        Ok(())
    }

    /// Removes the group; member peers keep their trust level but lose the
    /// membership tag.
    pub fn remove_group(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let group = inner.groups.get(name).ok_or_else(|| {
            RegistryError::GroupNotFound(name.to_string())
        })?;
        let mut update = self.store.update();
        update.del_group(name);
        let mut touched = vec![];
        for member in &group.members {
            if let Some(mut peer) = inner.peers.get(member).cloned() {
                peer.groups.retain(|g| g != name);
                update.set_peer(&peer);
                touched.push(peer);
            }
        }
        self.store.commit(update)?;
        inner.groups.remove(name);
        for peer in touched {
            inner.peers.insert(peer.peer_id.clone(), peer);
        }
        Ok(())
    }

    pub fn add_to_group(&self, peer_id: &PeerId, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let mut peer = inner.peers.get(peer_id).ok_or(RegistryError::NotFound)?.clone();
        let mut group = inner
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))?;
        if !peer.groups.iter().any(|g| g == name) {
            peer.groups.push(name.to_string());
        }
        group.members.insert(peer_id.clone());

        let mut update = self.store.update();
        update.set_peer(&peer);
        update.set_group(&group);
        self.store.commit(update)?;
        inner.peers.insert(peer_id.clone(), peer);
        inner.groups.insert(name.to_string(), group);
        Ok(())
    }

    pub fn remove_from_group(&self, peer_id: &PeerId, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let mut peer = inner.peers.get(peer_id).ok_or(RegistryError::NotFound)?.clone();
        let mut group = inner
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))?;
        peer.groups.retain(|g| g != name);
        group.members.remove(peer_id);

        let mut update = self.store.update();
        update.set_peer(&peer);
        update.set_group(&group);
        self.store.commit(update)?;
        inner.peers.insert(peer_id.clone(), peer);
        inner.groups.insert(name.to_string(), group);
        Ok(())
    }

    pub fn list_group(&self, name: &str) -> Result<Vec<TrustedPeer>, RegistryError> {
        let inner = self.inner.read();
        let group = inner
            .groups
            .get(name)
            .ok_or_else(|| RegistryError::GroupNotFound(name.to_string()))?;
        Ok(group.members.iter().filter_map(|m| inner.peers.get(m).cloned()).collect())
    }

    pub fn list_all(&self) -> Vec<TrustedPeer> {
        let mut peers: Vec<_> = self.inner.read().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn list_groups(&self) -> Vec<PeerGroup> {
        let mut groups: Vec<_> = self.inner.read().groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    pub fn list_blocked(&self) -> Vec<PeerId> {
        let mut blocked: Vec<_> = self.inner.read().blocked.iter().cloned().collect();
        blocked.sort();
        blocked
    }

    pub fn set_strict_mode(&self, strict: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let mut update = self.store.update();
        update.set_strict_mode(strict);
        self.store.commit(update)?;
        inner.strict_mode = strict;
        Ok(())
    }

    /// In-memory statistics update on a successful connection. Creates a
    /// Standard record on first observation outside strict mode. Never blocks
    /// on storage.
    pub fn record_connect(&self, peer_id: &PeerId, bytes_received: u64) {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write();
        if !inner.peers.contains_key(peer_id) && (inner.strict_mode || inner.blocked.contains(peer_id)) {
            return;
        }
        let peer = inner.peers.entry(peer_id.clone()).or_insert_with(|| TrustedPeer {
            peer_id: peer_id.clone(),
            addrs: vec![],
            trust_level: TrustLevel::Standard,
            name: None,
            organization: None,
            groups: vec![],
            stats: PeerStats::default(),
            notes: String::new(),
        });
        peer.stats.first_seen.get_or_insert(now);
        peer.stats.last_seen = Some(now);
        peer.stats.successful_connects += 1;
        peer.stats.bytes_received += bytes_received;
        inner.dirty_stats.insert(peer_id.clone());
    }

    pub fn record_disconnect(&self, peer_id: &PeerId) {
        let now = self.clock.now_utc();
        let mut inner = self.inner.write();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.stats.last_seen = Some(now);
            inner.dirty_stats.insert(peer_id.clone());
        }
    }

    pub fn record_connect_failure(&self, peer_id: &PeerId) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.stats.failed_connects += 1;
            inner.dirty_stats.insert(peer_id.clone());
        }
    }

    /// Byte counters for traffic on an established connection.
    pub fn record_traffic(&self, peer_id: &PeerId, bytes_sent: u64, bytes_received: u64) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.stats.bytes_sent += bytes_sent;
            peer.stats.bytes_received += bytes_received;
            inner.dirty_stats.insert(peer_id.clone());
        }
    }

    /// Attributes a protocol fault (spoofed header, repeated rate-limit
    /// abuse) to the peer.
    pub fn record_fault(&self, peer_id: &PeerId) {
        let mut inner = self.inner.write();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.stats.faults += 1;
            inner.dirty_stats.insert(peer_id.clone());
        }
    }

    /// Persists records with pending statistics updates. Called periodically;
    /// on failure the records stay marked dirty for the next flush.
    pub fn flush_stats(&self) -> Result<(), RegistryError> {
        let (dirty, records) = {
            let mut inner = self.inner.write();
            let dirty: Vec<PeerId> = inner.dirty_stats.drain().collect();
            let records: Vec<TrustedPeer> =
                dirty.iter().filter_map(|id| inner.peers.get(id).cloned()).collect();
            (dirty, records)
        };
        if records.is_empty() {
            return Ok(());
        }
        let mut update = self.store.update();
        for record in &records {
            update.set_peer(record);
        }
        if let Err(err) = self.store.commit(update) {
            let mut inner = self.inner.write();
            inner.dirty_stats.extend(dirty);
            return Err(err.into());
        }
        tracing::trace!(target: "registry", records = records.len(), "flushed peer statistics");
        Ok(())
    }

    pub fn export(&self) -> RegistryExport {
        RegistryExport {
            peers: self.list_all(),
            groups: self.list_groups(),
            blocked: self.list_blocked(),
            strict_mode: self.strict_mode(),
        }
    }

    /// With `merge`, unknown peers are added and known peers are replaced
    /// (last writer wins); groups are replaced by name and the blocklist is
    /// unioned; the strict-mode flag is left untouched. Without `merge`, the
    /// registry is replaced atomically by the snapshot.
    pub fn import(&self, snapshot: RegistryExport, merge: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let mut update = self.store.update();
        let (peers, groups, blocked, strict_mode) = if merge {
            let mut peers = inner.peers.clone();
            for peer in snapshot.peers {
                peers.insert(peer.peer_id.clone(), peer);
            }
            let mut groups = inner.groups.clone();
            for group in snapshot.groups {
                groups.insert(group.name.clone(), group);
            }
            let mut blocked = inner.blocked.clone();
            blocked.extend(snapshot.blocked);
            (peers, groups, blocked, inner.strict_mode)
        } else {
            (
                snapshot.peers.into_iter().map(|p| (p.peer_id.clone(), p)).collect(),
                snapshot.groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
                snapshot.blocked.into_iter().collect(),
                snapshot.strict_mode,
            )
        };

        update.clear_all();
        for peer in peers.values() {
            update.set_peer(peer);
        }
        for group in groups.values() {
            update.set_group(group);
        }
        for peer_id in &blocked {
            update.set_blocked(peer_id);
        }
        update.set_strict_mode(strict_mode);
        self.store.commit(update)?;

        inner.peers = peers;
        inner.groups = groups;
        inner.blocked = blocked;
        inner.strict_mode = strict_mode;
        inner.dirty_stats.clear();
        Ok(())
    }

    /// Registers a listener invoked after a peer's resolved trust level
    /// changes through this registry.
    pub fn subscribe_trust_changes(&self, listener: TrustListener) {
        self.listeners.lock().push(listener);
    }

    fn notify(&self, peer_id: &PeerId, level: TrustLevel) {
        let listeners: Vec<_> = self.listeners.lock().clone();
        for listener in listeners {
            listener(peer_id, level);
        }
    }
}
