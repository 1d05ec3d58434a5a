//! Typed view of the durable key-value store: one marker type per column,
//! borsh-encoded row representations, and conversions between those and the
//! in-memory registry types. Keys carry a textual prefix (`peer:`, `group:`,
//! `blocked:`, `settings:`) so the persisted layout stays readable on
//! backends that flatten columns into one namespace.

use crate::peer_registry::{PeerGroup, PeerStats, TrustLevel, TrustedPeer};
use borsh::{BorshDeserialize, BorshSerialize};
use sdn_primitives::network::PeerId;
use sdn_store::{DBCol, DBTransaction, Database};
use sdn_time::Utc;
use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub(super) enum Error {
    #[error("storage: {0}")]
    IO(#[from] io::Error),
    #[error("decoding {col}: {err}")]
    Decode { col: DBCol, err: io::Error },
    #[error("corrupt key in {col}")]
    Key { col: DBCol },
    #[error("stored timestamp out of range")]
    Timestamp,
}

pub(super) trait Column {
    const COL: DBCol;
    const KEY_PREFIX: &'static [u8];
    type Key;
    type Value: BorshSerialize + BorshDeserialize;

    fn key(key: &Self::Key) -> Vec<u8>;
    fn decode_key(raw: &[u8]) -> Result<Self::Key, Error>;
}

fn peer_key(prefix: &[u8], peer_id: &PeerId) -> Vec<u8> {
    let key = peer_id.public_key();
    let mut out = Vec::with_capacity(prefix.len() + 1 + key.key_data().len());
    out.extend_from_slice(prefix);
    out.push(key.key_type() as u8);
    out.extend_from_slice(key.key_data());
    out
}

fn decode_peer_key(col: DBCol, prefix: &[u8], raw: &[u8]) -> Result<PeerId, Error> {
    let rest = raw.strip_prefix(prefix).ok_or(Error::Key { col })?;
    match rest {
        [0, key @ ..] => {
            let key: [u8; 32] = key.try_into().map_err(|_| Error::Key { col })?;
            Ok(PeerId::new(sdn_crypto::PublicKey::from_ed25519_bytes(key)))
        }
        _ => Err(Error::Key { col }),
    }
}

pub(super) struct Peers;

impl Column for Peers {
    const COL: DBCol = DBCol::Peers;
    const KEY_PREFIX: &'static [u8] = b"peer:";
    type Key = PeerId;
    type Value = PeerRepr;

    fn key(key: &PeerId) -> Vec<u8> {
        peer_key(Self::KEY_PREFIX, key)
    }

    fn decode_key(raw: &[u8]) -> Result<PeerId, Error> {
        decode_peer_key(Self::COL, Self::KEY_PREFIX, raw)
    }
}

pub(super) struct Groups;

impl Column for Groups {
    const COL: DBCol = DBCol::Groups;
    const KEY_PREFIX: &'static [u8] = b"group:";
    type Key = String;
    type Value = GroupRepr;

    fn key(key: &String) -> Vec<u8> {
        let mut out = Self::KEY_PREFIX.to_vec();
        out.extend_from_slice(key.as_bytes());
        out
    }

    fn decode_key(raw: &[u8]) -> Result<String, Error> {
        let rest = raw.strip_prefix(Self::KEY_PREFIX).ok_or(Error::Key { col: Self::COL })?;
        String::from_utf8(rest.to_vec()).map_err(|_| Error::Key { col: Self::COL })
    }
}

pub(super) struct Blocklist;

impl Column for Blocklist {
    const COL: DBCol = DBCol::Blocklist;
    const KEY_PREFIX: &'static [u8] = b"blocked:";
    type Key = PeerId;
    type Value = bool;

    fn key(key: &PeerId) -> Vec<u8> {
        peer_key(Self::KEY_PREFIX, key)
    }

    fn decode_key(raw: &[u8]) -> Result<PeerId, Error> {
        decode_peer_key(Self::COL, Self::KEY_PREFIX, raw)
    }
}

pub(super) struct StrictMode;

impl Column for StrictMode {
    const COL: DBCol = DBCol::Settings;
    const KEY_PREFIX: &'static [u8] = b"settings:strict_mode";
    type Key = ();
    type Value = bool;

    fn key(_key: &()) -> Vec<u8> {
        Self::KEY_PREFIX.to_vec()
    }

    fn decode_key(_raw: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Clone)]
pub(super) struct Store(Arc<dyn Database>);

pub(super) struct StoreUpdate(DBTransaction);

impl Store {
    pub fn new_update(&self) -> StoreUpdate {
        StoreUpdate(DBTransaction::default())
    }

    pub fn commit(&self, update: StoreUpdate) -> Result<(), Error> {
        Ok(self.0.write(update.0)?)
    }

    pub fn get<C: Column>(&self, key: &C::Key) -> Result<Option<C::Value>, Error> {
        let Some(bytes) = self.0.get_raw_bytes(C::COL, &C::key(key))? else {
            return Ok(None);
        };
        C::Value::try_from_slice(&bytes)
            .map(Some)
            .map_err(|err| Error::Decode { col: C::COL, err })
    }

    pub fn iter_values<C: Column>(&self) -> Result<Vec<C::Value>, Error> {
        self.0
            .iter_prefix(C::COL, C::KEY_PREFIX)
            .map(|row| {
                let (_, value) = row?;
                C::Value::try_from_slice(&value).map_err(|err| Error::Decode { col: C::COL, err })
            })
            .collect()
    }

    pub fn iter_keys<C: Column>(&self) -> Result<Vec<C::Key>, Error> {
        self.0
            .iter_prefix(C::COL, C::KEY_PREFIX)
            .map(|row| {
                let (key, _) = row?;
                C::decode_key(&key)
            })
            .collect()
    }
}

impl StoreUpdate {
    pub fn set<C: Column>(&mut self, key: &C::Key, value: &C::Value) {
        // Serializing to a fresh Vec cannot fail for these row types.
        let value = borsh::to_vec(value).expect("borsh serialization");
        self.0.set(C::COL, C::key(key), value);
    }

    pub fn delete<C: Column>(&mut self, key: &C::Key) {
        self.0.delete(C::COL, C::key(key));
    }

    pub fn delete_all<C: Column>(&mut self) {
        self.0.delete_all(C::COL);
    }
}

impl From<Arc<dyn Database>> for Store {
    fn from(db: Arc<dyn Database>) -> Self {
        Self(db)
    }
}

/// Persisted form of [`TrustedPeer`]; timestamps are unix nanoseconds.
#[derive(BorshSerialize, BorshDeserialize)]
pub(super) struct PeerRepr {
    peer_id: PeerId,
    addrs: Vec<String>,
    trust_level: TrustLevel,
    name: Option<String>,
    organization: Option<String>,
    groups: Vec<String>,
    stats: StatsRepr,
    notes: String,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct StatsRepr {
    first_seen: Option<i64>,
    last_seen: Option<i64>,
    successful_connects: u64,
    failed_connects: u64,
    faults: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

#[derive(BorshSerialize, BorshDeserialize)]
pub(super) struct GroupRepr {
    name: String,
    description: String,
    default_trust: TrustLevel,
    members: Vec<PeerId>,
}

fn utc_to_nanos(ts: Utc) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn nanos_to_utc(nanos: i64) -> Result<Utc, Error> {
    Utc::from_unix_timestamp_nanos(nanos as i128).map_err(|_| Error::Timestamp)
}

impl From<&TrustedPeer> for PeerRepr {
    fn from(peer: &TrustedPeer) -> Self {
        PeerRepr {
            peer_id: peer.peer_id.clone(),
            addrs: peer.addrs.clone(),
            trust_level: peer.trust_level,
            name: peer.name.clone(),
            organization: peer.organization.clone(),
            groups: peer.groups.clone(),
            stats: StatsRepr {
                first_seen: peer.stats.first_seen.map(utc_to_nanos),
                last_seen: peer.stats.last_seen.map(utc_to_nanos),
                successful_connects: peer.stats.successful_connects,
                failed_connects: peer.stats.failed_connects,
                faults: peer.stats.faults,
                bytes_sent: peer.stats.bytes_sent,
                bytes_received: peer.stats.bytes_received,
            },
            notes: peer.notes.clone(),
        }
    }
}

impl TryFrom<PeerRepr> for TrustedPeer {
    type Error = Error;

    fn try_from(repr: PeerRepr) -> Result<Self, Error> {
        Ok(TrustedPeer {
            peer_id: repr.peer_id,
            addrs: repr.addrs,
            trust_level: repr.trust_level,
            name: repr.name,
            organization: repr.organization,
            groups: repr.groups,
            stats: PeerStats {
                first_seen: repr.stats.first_seen.map(nanos_to_utc).transpose()?,
                last_seen: repr.stats.last_seen.map(nanos_to_utc).transpose()?,
                successful_connects: repr.stats.successful_connects,
                failed_connects: repr.stats.failed_connects,
                faults: repr.stats.faults,
                bytes_sent: repr.stats.bytes_sent,
                bytes_received: repr.stats.bytes_received,
            },
            notes: repr.notes,
        })
    }
}

impl From<&PeerGroup> for GroupRepr {
    fn from(group: &PeerGroup) -> Self {
        GroupRepr {
            name: group.name.clone(),
            description: group.description.clone(),
            default_trust: group.default_trust,
            members: group.members.iter().cloned().collect(),
        }
    }
}

impl From<GroupRepr> for PeerGroup {
    fn from(repr: GroupRepr) -> Self {
        PeerGroup {
            name: repr.name,
            description: repr.description,
            default_trust: repr.default_trust,
            members: repr.members.into_iter().collect::<BTreeSet<_>>(),
        }
    }
}
