use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeyType {
    ED25519 = 0,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::ED25519 => write!(f, "ed25519"),
        }
    }
}

impl std::str::FromStr for KeyType {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ed25519" => Ok(KeyType::ED25519),
            _ => Err(ParseKeyError::UnknownKeyType { key_type: s.to_string() }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseKeyError {
    #[error("unknown key type '{key_type}'")]
    UnknownKeyType { key_type: String },
    #[error("invalid key data: {msg}")]
    InvalidData { msg: String },
}

/// Public key container. Only ED25519 exists today; the enum layout keeps the
/// borsh encoding (1-byte key type tag followed by the raw key) stable if
/// another curve is ever added.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub enum PublicKey {
    ED25519([u8; 32]),
}

impl PublicKey {
    pub fn key_type(&self) -> KeyType {
        match self {
            PublicKey::ED25519(_) => KeyType::ED25519,
        }
    }

    pub fn key_data(&self) -> &[u8] {
        match self {
            PublicKey::ED25519(data) => data,
        }
    }

    pub fn from_ed25519_bytes(data: [u8; 32]) -> Self {
        PublicKey::ED25519(data)
    }

    /// Signature check. An identifier that does not decode to a valid curve
    /// point verifies nothing.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        match (self, signature) {
            (PublicKey::ED25519(key), Signature::ED25519(sig)) => {
                let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(key) else {
                    return false;
                };
                key.verify_strict(data, &ed25519_dalek::Signature::from_bytes(sig)).is_ok()
            }
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_type(), bs58::encode(self.key_data()).into_string())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::str::FromStr for PublicKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key_type, data) = match s.split_once(':') {
            Some((prefix, data)) => (prefix.parse::<KeyType>()?, data),
            None => (KeyType::ED25519, s),
        };
        let bytes = bs58::decode(data)
            .into_vec()
            .map_err(|err| ParseKeyError::InvalidData { msg: err.to_string() })?;
        match key_type {
            KeyType::ED25519 => {
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| ParseKeyError::InvalidData { msg: "bad length".to_string() })?;
                Ok(PublicKey::ED25519(bytes))
            }
        }
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Secret key. Kept out of Debug/Display output.
#[derive(Clone)]
pub enum SecretKey {
    ED25519(ed25519_dalek::SigningKey),
}

impl SecretKey {
    pub fn from_random(key_type: KeyType) -> Self {
        match key_type {
            KeyType::ED25519 => {
                SecretKey::ED25519(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
            }
        }
    }

    /// Deterministic key for tests and tooling; the seed string is hashed
    /// into the 32-byte ED25519 seed.
    pub fn from_seed(key_type: KeyType, seed: &str) -> Self {
        match key_type {
            KeyType::ED25519 => {
                use sha2::Digest;
                let digest: [u8; 32] = sha2::Sha256::digest(seed.as_bytes()).into();
                SecretKey::ED25519(ed25519_dalek::SigningKey::from_bytes(&digest))
            }
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            SecretKey::ED25519(key) => PublicKey::ED25519(key.verifying_key().to_bytes()),
        }
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        match self {
            SecretKey::ED25519(key) => {
                use ed25519_dalek::Signer;
                Signature::ED25519(key.sign(data).to_bytes())
            }
        }
    }

    pub(crate) fn ed25519(&self) -> &ed25519_dalek::SigningKey {
        match self {
            SecretKey::ED25519(key) => key,
        }
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({})", self.public_key())
    }
}

#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Signature {
    ED25519([u8; 64]),
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::ED25519(sig) => {
                write!(f, "ed25519:{}", bs58::encode(&sig[..]).into_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let sk = SecretKey::from_seed(KeyType::ED25519, "test");
        let pk = sk.public_key();
        let sig = sk.sign(b"space data");
        assert!(pk.verify(b"space data", &sig));
        assert!(!pk.verify(b"space data!", &sig));
    }

    #[test]
    fn from_seed_is_deterministic() {
        let a = SecretKey::from_seed(KeyType::ED25519, "node0");
        let b = SecretKey::from_seed(KeyType::ED25519, "node0");
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(
            a.public_key(),
            SecretKey::from_seed(KeyType::ED25519, "node1").public_key()
        );
    }

    #[test]
    fn display_round_trip() {
        let pk = SecretKey::from_seed(KeyType::ED25519, "rt").public_key();
        let parsed: PublicKey = pk.to_string().parse().unwrap();
        assert_eq!(pk, parsed);
    }

    #[test]
    fn borsh_layout_is_tagged() {
        let pk = SecretKey::from_seed(KeyType::ED25519, "tag").public_key();
        let bytes = borsh::to_vec(&pk).unwrap();
        assert_eq!(bytes.len(), 33);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..], pk.key_data());
    }
}
