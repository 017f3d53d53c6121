//! Collaborators the broker consults to find holdings and peers.

pub mod directory;
pub mod holdings;
pub mod peers;

pub use directory::{
    DirectoryEntry, DirectoryLookup, DirectoryResult, HttpDirectoryLookup, StaticDirectoryLookup,
};
pub use holdings::{
    Holding, HoldingsLookup, HoldingsResult, HttpHoldingsLookup, PatternHoldingsLookup,
};
pub use peers::{PeerResolver, ResolvedPeers};
