use async_trait::async_trait;
use illbroker_model::{Peer, PeerId};

use crate::error::Result;

#[async_trait]
pub trait PeerRepository: Send + Sync {
    async fn get(&self, id: PeerId) -> Result<Option<Peer>>;

    /// Resolve a peer by one of its symbols or branch symbols.
    async fn find_by_symbol(&self, symbol: &str) -> Result<Option<Peer>>;

    /// Insert or update a peer, replacing its symbol and branch symbol sets.
    /// Symbols previously owned by another peer move to this one.
    /// Loan and borrow counters of an existing row are left untouched.
    async fn save(&self, peer: &Peer) -> Result<()>;

    async fn increment_loans(&self, id: PeerId) -> Result<()>;

    async fn increment_borrows(&self, id: PeerId) -> Result<()>;
}
