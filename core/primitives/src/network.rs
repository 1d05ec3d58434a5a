use borsh::{BorshDeserialize, BorshSerialize};
use sdn_crypto::{KeyType, PublicKey, SecretKey};
use std::fmt;
use std::sync::Arc;

/// Peer identity: the peer's public identity key. Self-authenticating, and
/// compared / hashed on the key bytes only.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PeerId(Arc<PublicKey>);

impl PeerId {
    pub fn new(key: PublicKey) -> Self {
        Self(Arc::new(key))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.0
    }

    pub fn random() -> Self {
        PeerId::new(SecretKey::from_random(KeyType::ED25519).public_key())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = sdn_crypto::ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PeerId::new(s.parse()?))
    }
}
