use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BrokerError, Result};

/// A library that holds the requested item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub symbol: String,
    pub local_identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingsResult {
    pub holdings: Vec<Holding>,
    /// The query sent to the collaborator, kept for diagnostics.
    pub query: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HoldingsLookup: Send + Sync {
    async fn lookup(&self, identifier: &str) -> Result<HoldingsResult>;
}

/// Offline holdings source driven by the identifier itself:
/// `return-ISIL:A;ISIL:B` yields one holding per symbol, `return-error`
/// fails, anything else holds nothing.
#[derive(Debug, Clone, Default)]
pub struct PatternHoldingsLookup;

const RETURN_PREFIX: &str = "return-";

#[async_trait]
impl HoldingsLookup for PatternHoldingsLookup {
    async fn lookup(&self, identifier: &str) -> Result<HoldingsResult> {
        let query = format!("identifier={identifier}");
        let Some(rest) = identifier.strip_prefix(RETURN_PREFIX) else {
            return Ok(HoldingsResult {
                holdings: Vec::new(),
                query,
            });
        };

        if rest == "error" {
            return Err(BrokerError::Lookup(format!(
                "holdings lookup failed for {identifier}"
            )));
        }

        let holdings = rest
            .split(';')
            .map(str::trim)
            .filter(|symbol| !symbol.is_empty())
            .map(|symbol| Holding {
                symbol: symbol.to_string(),
                local_identifier: identifier.to_string(),
            })
            .collect();
        Ok(HoldingsResult { holdings, query })
    }
}

#[derive(Debug, Deserialize)]
struct HoldingsResponse {
    #[serde(default)]
    holdings: Vec<Holding>,
}

/// Holdings over HTTP: `GET {base}?identifier=...` answering
/// `{"holdings": [{"symbol": ..., "localIdentifier": ...}]}`.
#[derive(Clone)]
pub struct HttpHoldingsLookup {
    client: reqwest::Client,
    base_url: Url,
}

impl fmt::Debug for HttpHoldingsLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHoldingsLookup")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpHoldingsLookup {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl HoldingsLookup for HttpHoldingsLookup {
    async fn lookup(&self, identifier: &str) -> Result<HoldingsResult> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair("identifier", identifier);
        let query = url.to_string();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BrokerError::Lookup(format!("holdings request failed: {e}")))?
            .error_for_status()
            .map_err(|e| BrokerError::Lookup(format!("holdings service error: {e}")))?;

        let body: HoldingsResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Lookup(format!("invalid holdings response: {e}")))?;

        Ok(HoldingsResult {
            holdings: body.holdings,
            query,
        })
    }
}
