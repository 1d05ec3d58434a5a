/// Store module defines atomic DB operations on top of the schema module.
/// All transactions are built here; in particular `schema::StoreUpdate` is
/// not exported.
use crate::peer_registry::{PeerGroup, TrustedPeer};
use sdn_primitives::network::PeerId;
use std::sync::Arc;

mod schema;

/// Opaque error type representing storage errors.
///
/// Invariant: any store error is a critical operational error which signals
/// about data corruption. If you have an error condition which needs to be
/// handled somehow, it should be some *other* error type.
#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub(crate) struct Error(#[from] schema::Error);

/// Store allows for performing synchronous atomic operations on the DB.
#[derive(Clone)]
pub(crate) struct Store(schema::Store);

/// Mutation batch; committed atomically via [`Store::commit`].
pub(crate) struct Update(schema::StoreUpdate);

impl Store {
    pub fn update(&self) -> Update {
        Update(self.0.new_update())
    }

    pub fn commit(&self, update: Update) -> Result<(), Error> {
        self.0.commit(update.0).map_err(Error)
    }

    pub fn list_peers(&self) -> Result<Vec<TrustedPeer>, Error> {
        let reprs = self.0.iter_values::<schema::Peers>()?;
        reprs.into_iter().map(|r| TrustedPeer::try_from(r).map_err(Error::from)).collect()
    }

    pub fn list_groups(&self) -> Result<Vec<PeerGroup>, Error> {
        Ok(self.0.iter_values::<schema::Groups>()?.into_iter().map(PeerGroup::from).collect())
    }

    pub fn list_blocked(&self) -> Result<Vec<PeerId>, Error> {
        Ok(self.0.iter_keys::<schema::Blocklist>()?)
    }

    pub fn get_strict_mode(&self) -> Result<Option<bool>, Error> {
        Ok(self.0.get::<schema::StrictMode>(&())?)
    }
}

impl Update {
    pub fn set_peer(&mut self, peer: &TrustedPeer) {
        self.0.set::<schema::Peers>(&peer.peer_id, &peer.into());
    }

    pub fn del_peer(&mut self, peer_id: &PeerId) {
        self.0.delete::<schema::Peers>(peer_id);
    }

    pub fn set_group(&mut self, group: &PeerGroup) {
        self.0.set::<schema::Groups>(&group.name, &group.into());
    }

    pub fn del_group(&mut self, name: &str) {
        self.0.delete::<schema::Groups>(&name.to_string());
    }

    pub fn set_blocked(&mut self, peer_id: &PeerId) {
        self.0.set::<schema::Blocklist>(peer_id, &true);
    }

    pub fn del_blocked(&mut self, peer_id: &PeerId) {
        self.0.delete::<schema::Blocklist>(peer_id);
    }

    pub fn set_strict_mode(&mut self, strict: bool) {
        self.0.set::<schema::StrictMode>(&(), &strict);
    }

    /// Empties every registry column. Used by imports that replace the whole
    /// registry; combined with the follow-up sets in the same transaction the
    /// replacement is atomic.
    pub fn clear_all(&mut self) {
        self.0.delete_all::<schema::Peers>();
        self.0.delete_all::<schema::Groups>();
        self.0.delete_all::<schema::Blocklist>();
        self.0.delete_all::<schema::StrictMode>();
    }
}

impl From<Arc<dyn sdn_store::Database>> for Store {
    fn from(db: Arc<dyn sdn_store::Database>) -> Self {
        Self(schema::Store::from(db))
    }
}
