//! Base primitives shared by the SDN crates: content hashes and peer
//! identities.

pub mod hash;
pub mod network;
