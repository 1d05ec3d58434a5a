//! ECIES envelopes: X25519 ECDH against the recipient's identity key,
//! HKDF-SHA256 key derivation, ChaCha20-Poly1305 payload protection.
//!
//! The recipient is addressed by their ED25519 identity key; the Edwards
//! point is mapped to its Montgomery form for the ECDH. Envelope layout:
//! ephemeral X25519 public key (32) || nonce (12) || ciphertext.

use crate::signature::{PublicKey, SecretKey};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KDF_INFO: &[u8] = b"sdn-ecies-v1";

#[derive(Debug, thiserror::Error)]
pub enum EciesError {
    #[error("recipient key is not a valid curve point")]
    InvalidKey,
    #[error("degenerate shared secret")]
    DegenerateSharedSecret,
    #[error("envelope too short")]
    Truncated,
    #[error("AEAD failure")]
    Aead,
}

fn derive_key(shared: &[u8], ephemeral_pub: &[u8; 32], recipient_pub: &[u8; 32]) -> Key {
    let hk = Hkdf::<Sha256>::new(Some(KDF_INFO), shared);
    let mut info = [0u8; 64];
    info[..32].copy_from_slice(ephemeral_pub);
    info[32..].copy_from_slice(recipient_pub);
    let mut okm = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length.
    hk.expand(&info, &mut okm).unwrap();
    Key::from(okm)
}

fn recipient_x25519(recipient: &PublicKey) -> Result<x25519_dalek::PublicKey, EciesError> {
    let PublicKey::ED25519(bytes) = recipient;
    let edwards = ed25519_dalek::VerifyingKey::from_bytes(bytes)
        .map_err(|_| EciesError::InvalidKey)?;
    Ok(x25519_dalek::PublicKey::from(edwards.to_montgomery().to_bytes()))
}

/// Encrypts `plaintext` so that only the holder of `recipient`'s secret key
/// can read it. A fresh ephemeral key is drawn per call.
pub fn ecies_seal(
    recipient: &PublicKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, EciesError> {
    let their_pub = recipient_x25519(recipient)?;
    let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_pub = x25519_dalek::PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&their_pub);
    if !shared.was_contributory() {
        return Err(EciesError::DegenerateSharedSecret);
    }
    let key = derive_key(shared.as_bytes(), ephemeral_pub.as_bytes(), their_pub.as_bytes());

    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ciphertext = ChaCha20Poly1305::new(&key)
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| EciesError::Aead)?;

    let mut envelope = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    envelope.extend_from_slice(ephemeral_pub.as_bytes());
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

/// Opens an envelope produced by [`ecies_seal`] for `recipient`'s key.
pub fn ecies_open(
    recipient: &SecretKey,
    aad: &[u8],
    envelope: &[u8],
) -> Result<Vec<u8>, EciesError> {
    if envelope.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(EciesError::Truncated);
    }
    let (ephemeral_pub, rest) = envelope.split_at(EPHEMERAL_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let ephemeral_pub: [u8; 32] = ephemeral_pub.try_into().unwrap();
    let ephemeral_pub = x25519_dalek::PublicKey::from(ephemeral_pub);

    let scalar = x25519_dalek::StaticSecret::from(recipient.ed25519().to_scalar_bytes());
    let my_pub = x25519_dalek::PublicKey::from(&scalar);
    let shared = scalar.diffie_hellman(&ephemeral_pub);
    if !shared.was_contributory() {
        return Err(EciesError::DegenerateSharedSecret);
    }
    let key = derive_key(shared.as_bytes(), ephemeral_pub.as_bytes(), my_pub.as_bytes());

    ChaCha20Poly1305::new(&key)
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| EciesError::Aead)
}
