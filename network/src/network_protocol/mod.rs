//! Wire format of the routing header framed in front of every payload.
//!
//! Layout of a framed substrate message:
//!
//! ```text
//! +-------+----------------+------------------+---------------------+
//! | magic | u32 LE length L | L bytes of header | opaque payload ... |
//! +-------+----------------+------------------+---------------------+
//! ```
//!
//! The header block itself is a fixed-order little-endian encoding; it is
//! canonical, so re-serializing a parsed header reproduces the input bytes.
//! The TTL byte is the only field a relay may change in flight.
//!
//! Parsing is defensive: every length read is bounds-checked against the
//! remaining input and against the configured caps *before* anything is
//! allocated, so a hostile count cannot drive allocation.

use bytes::Bytes;
use rand::RngCore;
use sdn_crypto::SessionKeyId;
use sdn_primitives::hash::CryptoHash;
use sdn_primitives::network::PeerId;
use sdn_time::Utc;
use std::fmt;


/// Preamble identifying a framed message. Anything else on a topic is
/// treated as a raw (header-less) payload.
pub const HEADER_MAGIC: [u8; 4] = *b"SDNR";

/// Hard cap on schema names, independent of configuration.
pub const MAX_SCHEMA_NAME: usize = 256;

const KEY_LEN: usize = 32;
const SESSION_KEY_ID_LEN: usize = 16;

/// Caps applied while parsing a header. Derived from the node configuration;
/// the defaults match the documented configuration defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameLimits {
    /// Upper bound on the encoded header block, bytes.
    pub max_header_size: usize,
    pub max_schema_name: usize,
    pub max_destinations: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self { max_header_size: 4096, max_schema_name: MAX_SCHEMA_NAME, max_destinations: 64 }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseHeaderError {
    #[error("preamble does not match")]
    InvalidFrame,
    #[error("header exceeds input bounds")]
    TruncatedHeader,
    #[error("header length {got} exceeds the {max} byte ceiling")]
    OversizedHeader { got: usize, max: usize },
    #[error("schema name of {got} bytes exceeds the {max} byte cap")]
    SchemaTooLong { got: usize, max: usize },
    #[error("invalid schema name")]
    InvalidSchema,
    #[error("{got} destinations exceed the {max} cap")]
    TooManyDestinations { got: usize, max: usize },
    #[error("source peer is empty")]
    EmptySource,
    #[error("unknown key type {0}")]
    UnknownKeyType(u8),
    #[error("unknown priority {0}")]
    UnknownPriority(u8),
    #[error("timestamp out of range")]
    InvalidTimestamp,
    #[error("trailing bytes inside the header block")]
    TrailingBytes,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("schema name must be 1..={MAX_SCHEMA_NAME} bytes without '/'")]
pub struct InvalidSchemaName;

/// Short identifier of one of the fixed binary record formats carried by the
/// network (OMM, CDM, ...). Opaque to the routing core apart from the name
/// restrictions needed to embed it in topic names.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaType(String);

impl SchemaType {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidSchemaName> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_SCHEMA_NAME || name.contains('/') {
            return Err(InvalidSchemaName);
        }
        Ok(SchemaType(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::str::FromStr for SchemaType {
    type Err = InvalidSchemaName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SchemaType::new(s)
    }
}

impl serde::Serialize for SchemaType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SchemaType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        SchemaType::new(s).map_err(serde::de::Error::custom)
    }
}

/// Globally unique message identifier, drawn at random by the originating
/// publisher and stable for the life of the message.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    borsh::BorshSerialize,
    borsh::BorshDeserialize,
)]
pub struct MessageId(pub CryptoHash);

impl MessageId {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        MessageId(CryptoHash(bytes))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Delivery priority. The ordering is meaningful: a relay configured with a
/// minimum priority compares with `<`.
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
    serde::Serialize,
    serde::Deserialize,
    strum::IntoStaticStr,
)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl TryFrom<u8> for Priority {
    type Error = ParseHeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            3 => Ok(Priority::Urgent),
            other => Err(ParseHeaderError::UnknownPriority(other)),
        }
    }
}

const FLAG_ENCRYPTED: u8 = 1 << 0;
const FLAG_SESSION_KEY: u8 = 1 << 1;

/// Routing metadata attached in front of the opaque payload. The header
/// alone is sufficient for a relay to decide forward/drop without looking at
/// the payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingHeader {
    pub schema_type: SchemaType,
    pub source_peer: PeerId,
    /// Empty means broadcast within the topic.
    pub destinations: Vec<PeerId>,
    /// Remaining hops; must be > 0 for the message to be forwarded further.
    pub ttl: u8,
    pub priority: Priority,
    /// Payload is opaque to relays when set.
    pub encrypted: bool,
    pub message_id: MessageId,
    pub timestamp: Utc,
    /// Present only for session-key and hybrid encrypted flows.
    pub session_key_id: Option<SessionKeyId>,
}

impl RoutingHeader {
    /// Canonical encoding of the header block (without preamble and length
    /// prefix).
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.schema_type.0.len() as u16).to_le_bytes());
        out.extend_from_slice(self.schema_type.0.as_bytes());
        encode_peer(&mut out, &self.source_peer);
        out.extend_from_slice(&(self.destinations.len() as u16).to_le_bytes());
        for dest in &self.destinations {
            encode_peer(&mut out, dest);
        }
        out.push(self.ttl);
        out.push(self.priority as u8);
        let mut flags = 0u8;
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        if self.session_key_id.is_some() {
            flags |= FLAG_SESSION_KEY;
        }
        out.push(flags);
        out.extend_from_slice(self.message_id.0.as_bytes());
        out.extend_from_slice(&timestamp_nanos(self.timestamp).to_le_bytes());
        if let Some(key_id) = &self.session_key_id {
            out.extend_from_slice(key_id.as_bytes());
        }
        out
    }

    fn encoded_len(&self) -> usize {
        2 + self.schema_type.0.len()
            + (1 + KEY_LEN)
            + 2
            + self.destinations.len() * (1 + KEY_LEN)
            + 3
            + 32
            + 8
            + if self.session_key_id.is_some() { SESSION_KEY_ID_LEN } else { 0 }
    }

    /// Full wire message: preamble, length prefix, header block, payload.
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let header = self.serialize();
        let mut out = Vec::with_capacity(HEADER_MAGIC.len() + 4 + header.len() + payload.len());
        out.extend_from_slice(&HEADER_MAGIC);
        out.extend_from_slice(&(header.len() as u32).to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out
    }

    /// Parses a framed message, returning the header and the payload as a
    /// zero-copy slice of the input.
    pub fn parse(data: &Bytes, limits: &FrameLimits) -> Result<(RoutingHeader, Bytes), ParseHeaderError> {
        if data.len() < HEADER_MAGIC.len() + 4 {
            return Err(ParseHeaderError::InvalidFrame);
        }
        if data[..HEADER_MAGIC.len()] != HEADER_MAGIC {
            return Err(ParseHeaderError::InvalidFrame);
        }
        let len_bytes: [u8; 4] = data[4..8].try_into().unwrap();
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        if header_len > limits.max_header_size {
            return Err(ParseHeaderError::OversizedHeader {
                got: header_len,
                max: limits.max_header_size,
            });
        }
        if data.len() < 8 + header_len {
            return Err(ParseHeaderError::TruncatedHeader);
        }
        let header = Self::decode(&data[8..8 + header_len], limits)?;
        Ok((header, data.slice(8 + header_len..)))
    }

    fn decode(block: &[u8], limits: &FrameLimits) -> Result<RoutingHeader, ParseHeaderError> {
        let mut reader = Reader { data: block, pos: 0 };

        let schema_len = reader.u16()? as usize;
        if schema_len > limits.max_schema_name {
            return Err(ParseHeaderError::SchemaTooLong {
                got: schema_len,
                max: limits.max_schema_name,
            });
        }
        let schema_bytes = reader.bytes(schema_len)?;
        let schema = std::str::from_utf8(schema_bytes)
            .map_err(|_| ParseHeaderError::InvalidSchema)?
            .to_string();
        let schema_type = SchemaType::new(schema).map_err(|_| ParseHeaderError::InvalidSchema)?;

        let source_peer = decode_peer(&mut reader)?;
        if source_peer.public_key().key_data().iter().all(|b| *b == 0) {
            return Err(ParseHeaderError::EmptySource);
        }

        let dest_count = reader.u16()? as usize;
        if dest_count > limits.max_destinations {
            return Err(ParseHeaderError::TooManyDestinations {
                got: dest_count,
                max: limits.max_destinations,
            });
        }
        let mut destinations = Vec::with_capacity(dest_count);
        for _ in 0..dest_count {
            destinations.push(decode_peer(&mut reader)?);
        }

        let ttl = reader.u8()?;
        let priority = Priority::try_from(reader.u8()?)?;
        let flags = reader.u8()?;
        let message_id = MessageId(CryptoHash(reader.array::<32>()?));
        let nanos = i64::from_le_bytes(reader.array::<8>()?);
        let timestamp = Utc::from_unix_timestamp_nanos(nanos as i128)
            .map_err(|_| ParseHeaderError::InvalidTimestamp)?;
        let session_key_id = if flags & FLAG_SESSION_KEY != 0 {
            Some(SessionKeyId::from_bytes(reader.array::<SESSION_KEY_ID_LEN>()?))
        } else {
            None
        };
        if reader.pos != block.len() {
            return Err(ParseHeaderError::TrailingBytes);
        }

        Ok(RoutingHeader {
            schema_type,
            source_peer,
            destinations,
            ttl,
            priority,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            message_id,
            timestamp,
            session_key_id,
        })
    }
}

/// Whether the bytes carry a routing header. A raw payload that happens to
/// start with the preamble is indistinguishable from a frame; publishers of
/// raw messages own that risk.
pub fn is_framed(data: &[u8]) -> bool {
    data.len() >= HEADER_MAGIC.len() && data[..HEADER_MAGIC.len()] == HEADER_MAGIC
}

fn timestamp_nanos(ts: Utc) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn encode_peer(out: &mut Vec<u8>, peer: &PeerId) {
    let key = peer.public_key();
    out.push(key.key_type() as u8);
    out.extend_from_slice(key.key_data());
}

fn decode_peer(reader: &mut Reader<'_>) -> Result<PeerId, ParseHeaderError> {
    let key_type = reader.u8()?;
    if key_type != 0 {
        return Err(ParseHeaderError::UnknownKeyType(key_type));
    }
    let bytes = reader.array::<KEY_LEN>()?;
    Ok(PeerId::new(sdn_crypto::PublicKey::from_ed25519_bytes(bytes)))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ParseHeaderError> {
        let end = self.pos.checked_add(len).ok_or(ParseHeaderError::TruncatedHeader)?;
        if end > self.data.len() {
            return Err(ParseHeaderError::TruncatedHeader);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ParseHeaderError> {
        Ok(self.bytes(N)?.try_into().unwrap())
    }

    fn u8(&mut self) -> Result<u8, ParseHeaderError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseHeaderError> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }
}
