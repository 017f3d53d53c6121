use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IllTransactionId, PeerId};
use crate::message::{
    BibliographicInfo, BillingInfo, Request, RequesterAction, ServiceInfo, SupplierStatus,
};

/// Structured payload of the original request, kept for later rota and
/// outbound decisions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IllTransactionData {
    #[serde(default)]
    pub bibliographic_info: BibliographicInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_info: Option<ServiceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_info: Option<BillingInfo>,
}

impl IllTransactionData {
    /// Unique record id as supplied by the requester, ignoring blank values.
    pub fn supplier_unique_record_id(&self) -> Option<&str> {
        self.bibliographic_info
            .supplier_unique_record_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// One loan request and the protocol state the broker has observed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IllTransaction {
    pub id: IllTransactionId,
    pub timestamp: DateTime<Utc>,
    pub requester_symbol: String,
    pub requester_id: Option<PeerId>,
    pub requester_request_id: String,
    pub supplier_symbol: Option<String>,
    pub last_requester_action: Option<RequesterAction>,
    pub prev_requester_action: Option<RequesterAction>,
    pub last_supplier_status: Option<SupplierStatus>,
    pub prev_supplier_status: Option<SupplierStatus>,
    pub ill_transaction_data: IllTransactionData,
}

impl IllTransaction {
    pub fn from_request(request: &Request, requester_id: Option<PeerId>) -> Self {
        Self {
            id: IllTransactionId::new(),
            timestamp: Utc::now(),
            requester_symbol: request.header.requesting_agency_id.clone(),
            requester_id,
            requester_request_id: request.header.requesting_agency_request_id.clone(),
            supplier_symbol: None,
            last_requester_action: None,
            prev_requester_action: None,
            last_supplier_status: None,
            prev_supplier_status: None,
            ill_transaction_data: IllTransactionData {
                bibliographic_info: request.bibliographic_info.clone(),
                service_info: request.service_info.clone(),
                billing_info: request.billing_info.clone(),
            },
        }
    }

    pub fn record_supplier_status(&mut self, status: SupplierStatus) {
        self.prev_supplier_status = self.last_supplier_status.replace(status);
    }

    pub fn record_requester_action(&mut self, action: RequesterAction) {
        self.prev_requester_action = self.last_requester_action.replace(action);
    }
}
