//! Symmetric session keys for long-lived streaming flows.
//!
//! A key is minted once per session and identified by an opaque 128-bit id.
//! How the key material reaches the subscriber is not decided here; callers
//! hand it to an external key-exchange collaborator.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use std::fmt;

const NONCE_LEN: usize = 12;
pub(crate) const SESSION_KEY_ID_LEN: usize = 16;
const SESSION_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SessionCipherError {
    #[error("ciphertext too short")]
    Truncated,
    #[error("AEAD failure")]
    Aead,
    #[error("bad key material length")]
    BadLength,
}

/// Opaque handle naming one session key. Ids are drawn at random and never
/// reused across sessions within a process.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
)]
pub struct SessionKeyId([u8; SESSION_KEY_ID_LEN]);

impl SessionKeyId {
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_ID_LEN] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; SESSION_KEY_ID_LEN]) -> Self {
        SessionKeyId(bytes)
    }
}

impl fmt::Display for SessionKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SessionKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Symmetric key plus its identifier.
#[derive(Clone)]
pub struct SessionKey {
    id: SessionKeyId,
    key: Key,
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut id = [0u8; SESSION_KEY_ID_LEN];
        let mut key = [0u8; SESSION_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut id);
        rand::rngs::OsRng.fill_bytes(&mut key);
        SessionKey { id: SessionKeyId(id), key: Key::from(key) }
    }

    pub fn id(&self) -> SessionKeyId {
        self.id
    }

    /// Raw conveyance form: id || key. This is what gets handed to the
    /// key-exchange collaborator (possibly ECIES-wrapped first).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SESSION_KEY_ID_LEN + SESSION_KEY_LEN);
        out.extend_from_slice(&self.id.0);
        out.extend_from_slice(self.key.as_slice());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionCipherError> {
        if bytes.len() != SESSION_KEY_ID_LEN + SESSION_KEY_LEN {
            return Err(SessionCipherError::BadLength);
        }
        let id: [u8; SESSION_KEY_ID_LEN] = bytes[..SESSION_KEY_ID_LEN].try_into().unwrap();
        let key: [u8; SESSION_KEY_LEN] = bytes[SESSION_KEY_ID_LEN..].try_into().unwrap();
        Ok(SessionKey { id: SessionKeyId(id), key: Key::from(key) })
    }

    /// Encrypts one payload: nonce (12) || ciphertext.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionCipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = ChaCha20Poly1305::new(&self.key)
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| SessionCipherError::Aead)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn open(&self, aad: &[u8], data: &[u8]) -> Result<Vec<u8>, SessionCipherError> {
        if data.len() < NONCE_LEN {
            return Err(SessionCipherError::Truncated);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        ChaCha20Poly1305::new(&self.key)
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| SessionCipherError::Aead)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.id)
    }
}
