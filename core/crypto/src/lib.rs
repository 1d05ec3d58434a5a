//! Cryptographic types shared across the workspace.
//!
//! Peer identity is an ED25519 public key; everything that names a peer on
//! the wire or in storage goes through [`PublicKey`]. Session payload
//! protection (ECIES envelopes and symmetric session keys) lives in
//! [`ecies`] and [`session_key`].

mod ecies;
mod session_key;
mod signature;

pub use ecies::{EciesError, ecies_open, ecies_seal};
pub use session_key::{SessionCipherError, SessionKey, SessionKeyId};
pub use signature::{KeyType, ParseKeyError, PublicKey, SecretKey, Signature};
