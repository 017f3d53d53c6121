//! Subset of the ISO 18626 message set the broker routes internally.
//!
//! The XML envelope is terminated by the transport layer; what reaches the
//! broker core is one of the three message kinds below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

string_enum! {
    /// Status a supplying agency reports for a request.
    pub enum SupplierStatus ("supplier status") {
        RequestReceived => "RequestReceived",
        ExpectToSupply => "ExpectToSupply",
        WillSupply => "WillSupply",
        Loaned => "Loaned",
        Overdue => "Overdue",
        Recalled => "Recalled",
        RetryPossible => "RetryPossible",
        Unfilled => "Unfilled",
        CopyCompleted => "CopyCompleted",
        LoanCompleted => "LoanCompleted",
        CompletedWithoutReturn => "CompletedWithoutReturn",
        Cancelled => "Cancelled",
    }
}

impl SupplierStatus {
    /// Fulfilment outcomes that are relayed straight to the requester.
    pub fn is_fulfilment_outcome(&self) -> bool {
        matches!(
            self,
            SupplierStatus::Loaned
                | SupplierStatus::Overdue
                | SupplierStatus::Recalled
                | SupplierStatus::CopyCompleted
                | SupplierStatus::LoanCompleted
                | SupplierStatus::CompletedWithoutReturn
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupplierStatus::CopyCompleted
                | SupplierStatus::LoanCompleted
                | SupplierStatus::CompletedWithoutReturn
                | SupplierStatus::Cancelled
                | SupplierStatus::Unfilled
        )
    }
}

string_enum! {
    pub enum ReasonForMessage ("reason for message") {
        RequestResponse => "RequestResponse",
        StatusRequestResponse => "StatusRequestResponse",
        RenewResponse => "RenewResponse",
        CancelResponse => "CancelResponse",
        StatusChange => "StatusChange",
        Notification => "Notification",
    }
}

string_enum! {
    /// Action a requesting agency asks of its supplier.
    pub enum RequesterAction ("requester action") {
        StatusRequest => "StatusRequest",
        Received => "Received",
        Cancel => "Cancel",
        Renew => "Renew",
        ShippedReturn => "ShippedReturn",
        ShippedForward => "ShippedForward",
        Notification => "Notification",
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub requesting_agency_id: String,
    pub supplying_agency_id: String,
    pub requesting_agency_request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplying_agency_request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BibliographicInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_unique_record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub need_before_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_costs: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub header: MessageHeader,
    #[serde(default)]
    pub bibliographic_info: BibliographicInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_info: Option<ServiceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_info: Option<BillingInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInfo {
    pub reason_for_message: ReasonForMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_yes_no: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    pub status: SupplierStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyingAgencyMessage {
    pub header: MessageHeader,
    pub message_info: MessageInfo,
    pub status_info: StatusInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestingAgencyMessage {
    pub header: MessageHeader,
    pub action: RequesterAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One protocol message, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IllMessage {
    Request(Request),
    SupplyingAgencyMessage(SupplyingAgencyMessage),
    RequestingAgencyMessage(RequestingAgencyMessage),
}

impl IllMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            IllMessage::Request(request) => &request.header,
            IllMessage::SupplyingAgencyMessage(message) => &message.header,
            IllMessage::RequestingAgencyMessage(message) => &message.header,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IllMessage::Request(_) => "request",
            IllMessage::SupplyingAgencyMessage(_) => "supplying-agency-message",
            IllMessage::RequestingAgencyMessage(_) => "requesting-agency-message",
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            IllMessage::Request(request) => Some(request),
            _ => None,
        }
    }

    pub fn as_supplying_agency_message(&self) -> Option<&SupplyingAgencyMessage> {
        match self {
            IllMessage::SupplyingAgencyMessage(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_requesting_agency_message(&self) -> Option<&RequestingAgencyMessage> {
        match self {
            IllMessage::RequestingAgencyMessage(message) => Some(message),
            _ => None,
        }
    }

    /// Supplier status carried by a supplying agency message.
    pub fn supplier_status(&self) -> Option<SupplierStatus> {
        self.as_supplying_agency_message()
            .map(|message| message.status_info.status)
    }

    pub fn requester_action(&self) -> Option<RequesterAction> {
        self.as_requesting_agency_message()
            .map(|message| message.action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supplying_agency_message_uses_iso_names() {
        let message = IllMessage::SupplyingAgencyMessage(SupplyingAgencyMessage {
            header: MessageHeader {
                requesting_agency_id: "ISIL:REQ".into(),
                supplying_agency_id: "ISIL:SUP".into(),
                requesting_agency_request_id: "req-1".into(),
                ..MessageHeader::default()
            },
            message_info: MessageInfo {
                reason_for_message: ReasonForMessage::CancelResponse,
                answer_yes_no: Some(true),
                note: None,
            },
            status_info: StatusInfo {
                status: SupplierStatus::Cancelled,
                last_change: None,
            },
        });

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "supplying-agency-message");
        assert_eq!(json["messageInfo"]["reasonForMessage"], "CancelResponse");
        assert_eq!(json["statusInfo"]["status"], "Cancelled");
        assert_eq!(json["header"]["supplyingAgencyId"], "ISIL:SUP");

        let back: IllMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back.supplier_status(), Some(SupplierStatus::Cancelled));
    }

    #[test]
    fn fulfilment_outcomes_exclude_unfilled_and_cancelled() {
        assert!(SupplierStatus::Loaned.is_fulfilment_outcome());
        assert!(SupplierStatus::CompletedWithoutReturn.is_fulfilment_outcome());
        assert!(!SupplierStatus::Unfilled.is_fulfilment_outcome());
        assert!(!SupplierStatus::Cancelled.is_fulfilment_outcome());
        assert!(!SupplierStatus::WillSupply.is_fulfilment_outcome());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "Lost".parse::<SupplierStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown supplier status: Lost");
    }
}
