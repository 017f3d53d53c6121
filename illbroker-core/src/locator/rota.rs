use illbroker_model::{BillingInfo, PeerId, ServiceInfo};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// A peer symbol that holds the requested item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub supplier_id: PeerId,
    pub symbol: String,
    pub local_id: String,
    /// Loans over borrows of the owning peer.
    #[serde(with = "ratio")]
    pub ratio: f64,
    pub local: bool,
}

/// Description of how a rota was produced, stored with the locate result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotaInfo {
    pub name: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Orders (and may drop) candidates before they are persisted as a rota.
pub trait RotaFilter: Send + Sync {
    fn filter_and_sort(
        &self,
        candidates: Vec<Candidate>,
        requester_custom: &Map<String, Value>,
        service_info: Option<&ServiceInfo>,
        billing_info: Option<&BillingInfo>,
    ) -> Result<(Vec<Candidate>, RotaInfo)>;
}

/// Local candidates first, then the peers that lend least relative to what
/// they borrow.
#[derive(Debug, Clone, Copy, Default)]
pub struct FairnessRota;

impl RotaFilter for FairnessRota {
    fn filter_and_sort(
        &self,
        mut candidates: Vec<Candidate>,
        _requester_custom: &Map<String, Value>,
        _service_info: Option<&ServiceInfo>,
        _billing_info: Option<&BillingInfo>,
    ) -> Result<(Vec<Candidate>, RotaInfo)> {
        candidates.sort_by_key(|candidate| (!candidate.local, OrderedFloat(candidate.ratio)));
        Ok((
            candidates,
            RotaInfo {
                name: "fairness".to_string(),
                details: Map::new(),
            },
        ))
    }
}

/// JSON has no infinity; a peer that never borrowed is written as `null`.
mod ratio {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}
