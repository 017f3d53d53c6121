use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use illbroker_model::{Peer, PeerId, RefreshPolicy};
use tracing::{debug, warn};

use crate::database::ports::PeerRepository;
use crate::error::Result;
use crate::lookup::directory::DirectoryLookup;

/// Peers resolved for a set of symbols, plus the directory query if one ran.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPeers {
    pub peers: Vec<Peer>,
    pub directory_query: Option<String>,
}

/// Get-or-refresh access to peers: cached rows are served as long as their
/// refresh policy allows it, everything else goes through the directory.
#[derive(Clone)]
pub struct PeerResolver {
    peers: Arc<dyn PeerRepository>,
    directory: Arc<dyn DirectoryLookup>,
}

impl fmt::Debug for PeerResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerResolver")
            .field("peers_ptr", &Arc::as_ptr(&self.peers))
            .field("directory_ptr", &Arc::as_ptr(&self.directory))
            .finish()
    }
}

impl PeerResolver {
    pub fn new(peers: Arc<dyn PeerRepository>, directory: Arc<dyn DirectoryLookup>) -> Self {
        Self { peers, directory }
    }

    pub fn repository(&self) -> Arc<dyn PeerRepository> {
        Arc::clone(&self.peers)
    }

    pub async fn resolve(&self, symbols: &[String]) -> Result<ResolvedPeers> {
        let mut cached = Vec::new();
        let mut stale = Vec::new();
        for symbol in symbols {
            match self.peers.find_by_symbol(symbol).await? {
                Some(peer) if peer.refresh_policy == RefreshPolicy::Never => cached.push(peer),
                Some(peer) => {
                    stale.push(symbol.clone());
                    cached.push(peer);
                }
                None => stale.push(symbol.clone()),
            }
        }

        if stale.is_empty() {
            return Ok(ResolvedPeers {
                peers: dedupe(cached),
                directory_query: None,
            });
        }

        let result = match self.directory.lookup(&stale).await {
            Ok(result) => result,
            Err(err) => {
                // Stale-but-known peers still beat failing the request.
                let all_known = symbols
                    .iter()
                    .all(|symbol| cached.iter().any(|peer| peer.answers_to(symbol)));
                if all_known {
                    warn!(error = %err, "directory lookup failed, using cached peers");
                    return Ok(ResolvedPeers {
                        peers: dedupe(cached),
                        directory_query: None,
                    });
                }
                return Err(err);
            }
        };

        let mut resolved: Vec<Peer> = cached
            .into_iter()
            .filter(|peer| peer.refresh_policy == RefreshPolicy::Never)
            .collect();

        for entry in result.entries {
            if resolved
                .iter()
                .any(|peer| entry.shares_symbol_with(&peer.symbols))
            {
                continue;
            }

            let existing = self
                .find_existing(&entry.symbols, &entry.branch_symbols)
                .await?;
            let peer = match existing {
                Some(mut peer) => {
                    entry.apply_to(&mut peer);
                    peer
                }
                None => entry.into_peer(),
            };
            self.peers.save(&peer).await?;
            debug!(peer_id = %peer.id, name = %peer.name, "peer refreshed from directory");
            resolved.push(peer);
        }

        Ok(ResolvedPeers {
            peers: dedupe(resolved),
            directory_query: Some(result.query),
        })
    }

    /// Resolve a single symbol, e.g. the requester of a new transaction.
    pub async fn resolve_one(&self, symbol: &str) -> Result<Option<Peer>> {
        let resolved = self.resolve(&[symbol.to_string()]).await?;
        Ok(resolved
            .peers
            .into_iter()
            .find(|peer| peer.answers_to(symbol)))
    }

    async fn find_existing(
        &self,
        symbols: &[String],
        branch_symbols: &[String],
    ) -> Result<Option<Peer>> {
        for symbol in symbols.iter().chain(branch_symbols) {
            if let Some(peer) = self.peers.find_by_symbol(symbol).await? {
                return Ok(Some(peer));
            }
        }
        Ok(None)
    }
}

fn dedupe(peers: Vec<Peer>) -> Vec<Peer> {
    let mut seen: HashSet<PeerId> = HashSet::new();
    peers
        .into_iter()
        .filter(|peer| seen.insert(peer.id))
        .collect()
}
