//! Topic naming convention.
//!
//! Exactly two shapes exist on the substrate:
//! `/<prefix>/data/<schema>` for schema-scoped broadcasts and
//! `/<prefix>/peer/<peer-id>` for point-casts to a single peer. The prefix is
//! a configured constant; everything else in the system treats topic names as
//! opaque strings.

use crate::network_protocol::SchemaType;
use sdn_primitives::network::PeerId;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Data { schema: SchemaType },
    Peer { peer_id: PeerId },
}

impl Topic {
    pub fn data(schema: SchemaType) -> Self {
        Topic::Data { schema }
    }

    pub fn peer(peer_id: PeerId) -> Self {
        Topic::Peer { peer_id }
    }

    pub fn name(&self, prefix: &str) -> String {
        match self {
            Topic::Data { schema } => format!("/{prefix}/data/{schema}"),
            Topic::Peer { peer_id } => format!("/{prefix}/peer/{peer_id}"),
        }
    }

    /// Inverse of [`Topic::name`]. Returns `None` for anything that does not
    /// follow the convention under the given prefix.
    pub fn parse(prefix: &str, name: &str) -> Option<Topic> {
        let rest = name.strip_prefix('/')?.strip_prefix(prefix)?.strip_prefix('/')?;
        if let Some(schema) = rest.strip_prefix("data/") {
            return Some(Topic::Data { schema: schema.parse().ok()? });
        }
        if let Some(peer) = rest.strip_prefix("peer/") {
            return Some(Topic::Peer { peer_id: peer.parse().ok()? });
        }
        None
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Data { schema } => write!(f, "data/{schema}"),
            Topic::Peer { peer_id } => write!(f, "peer/{peer_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer_id_from_seed;

    #[test]
    fn name_parse_round_trip() {
        let data = Topic::data("OMM".parse().unwrap());
        assert_eq!(data.name("sdn"), "/sdn/data/OMM");
        assert_eq!(Topic::parse("sdn", &data.name("sdn")), Some(data));

        let peer = Topic::peer(peer_id_from_seed("subscriber"));
        assert_eq!(Topic::parse("sdn", &peer.name("sdn")), Some(peer));
    }

    #[test]
    fn rejects_foreign_names() {
        assert_eq!(Topic::parse("sdn", "/other/data/OMM"), None);
        assert_eq!(Topic::parse("sdn", "/sdn/blocks/42"), None);
        assert_eq!(Topic::parse("sdn", "sdn/data/OMM"), None);
        assert_eq!(Topic::parse("sdn", "/sdn/peer/not-a-key"), None);
    }
}
