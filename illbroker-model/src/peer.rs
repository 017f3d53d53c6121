use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::PeerId;

string_enum! {
    /// Whether the broker hides the real counterpart behind its own symbol.
    #[derive(Default)]
    pub enum BrokerMode ("broker mode") {
        #[default]
        Opaque => "opaque",
        Transparent => "transparent",
    }
}

string_enum! {
    /// Governs whether the cached peer is re-fetched from the directory.
    #[derive(Default)]
    pub enum RefreshPolicy ("refresh policy") {
        Never => "never",
        #[default]
        OnTransaction => "on-transaction",
    }
}

/// A library or institution known to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub url: String,
    pub vendor: String,
    pub broker_mode: BrokerMode,
    pub refresh_policy: RefreshPolicy,
    pub refresh_time: DateTime<Utc>,
    pub loans_count: i64,
    pub borrows_count: i64,
    #[serde(default)]
    pub custom_data: Map<String, Value>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub branch_symbols: Vec<String>,
}

impl Peer {
    pub fn new(name: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            id: PeerId::new(),
            name: name.into(),
            url: String::new(),
            vendor: String::new(),
            broker_mode: BrokerMode::default(),
            refresh_policy: RefreshPolicy::default(),
            refresh_time: Utc::now(),
            loans_count: 0,
            borrows_count: 0,
            custom_data: Map::new(),
            symbols,
            branch_symbols: Vec::new(),
        }
    }

    /// Loans over borrows; a peer that never borrowed ranks behind every
    /// peer that did.
    pub fn fairness_ratio(&self) -> f64 {
        if self.borrows_count == 0 {
            f64::INFINITY
        } else {
            self.loans_count as f64 / self.borrows_count as f64
        }
    }

    /// Every symbol the peer answers to, main symbols first.
    pub fn all_symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols
            .iter()
            .chain(self.branch_symbols.iter())
            .map(String::as_str)
    }

    pub fn answers_to(&self, symbol: &str) -> bool {
        self.all_symbols().any(|candidate| candidate == symbol)
    }
}
