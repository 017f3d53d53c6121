use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use illbroker_model::{BrokerMode, Peer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{BrokerError, Result};

/// One institution as described by the directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub branch_symbols: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_mode: Option<BrokerMode>,
    /// Free-form properties, including `closures` and `timeZone`.
    #[serde(default)]
    pub custom: Map<String, Value>,
}

impl DirectoryEntry {
    pub fn shares_symbol_with(&self, symbols: &[String]) -> bool {
        self.symbols
            .iter()
            .chain(self.branch_symbols.iter())
            .any(|symbol| symbols.contains(symbol))
    }

    /// Copy the directory view onto a cached peer, keeping its identity and
    /// counters.
    pub fn apply_to(&self, peer: &mut Peer) {
        peer.name = self.name.clone();
        peer.url = self.url.clone();
        peer.vendor = self.vendor.clone();
        if let Some(mode) = self.broker_mode {
            peer.broker_mode = mode;
        }
        peer.custom_data = self.custom.clone();
        peer.symbols = self.symbols.clone();
        peer.branch_symbols = self.branch_symbols.clone();
        peer.refresh_time = chrono::Utc::now();
    }

    pub fn into_peer(self) -> Peer {
        let mut peer = Peer::new(self.name.clone(), Vec::new());
        self.apply_to(&mut peer);
        peer
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryResult {
    pub entries: Vec<DirectoryEntry>,
    pub query: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    async fn lookup(&self, symbols: &[String]) -> Result<DirectoryResult>;
}

/// Fixed directory, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectoryLookup {
    entries: Vec<DirectoryEntry>,
}

impl StaticDirectoryLookup {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl DirectoryLookup for StaticDirectoryLookup {
    async fn lookup(&self, symbols: &[String]) -> Result<DirectoryResult> {
        Ok(DirectoryResult {
            entries: self
                .entries
                .iter()
                .filter(|entry| entry.shares_symbol_with(symbols))
                .cloned()
                .collect(),
            query: format!("symbols={}", symbols.join(",")),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    items: Vec<DirectoryEntry>,
}

/// Directory over HTTP: `GET {base}?symbols=A,B` answering `{"items": [...]}`.
#[derive(Clone)]
pub struct HttpDirectoryLookup {
    client: reqwest::Client,
    base_url: Url,
}

impl fmt::Debug for HttpDirectoryLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpDirectoryLookup")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpDirectoryLookup {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl DirectoryLookup for HttpDirectoryLookup {
    async fn lookup(&self, symbols: &[String]) -> Result<DirectoryResult> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("symbols", &symbols.join(","));
        let query = url.to_string();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BrokerError::Lookup(format!("directory request failed: {e}")))?
            .error_for_status()
            .map_err(|e| BrokerError::Lookup(format!("directory service error: {e}")))?;

        let body: DirectoryResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Lookup(format!("invalid directory response: {e}")))?;

        Ok(DirectoryResult {
            entries: body.items,
            query,
        })
    }
}
