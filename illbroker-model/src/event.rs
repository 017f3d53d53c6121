//! Tasks and notices recorded in the broker's event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{EventId, IllTransactionId};
use crate::message::IllMessage;

string_enum! {
    /// A task is claimed and completed with a result; a notice records
    /// something that already happened.
    pub enum EventType ("event type") {
        Task => "TASK",
        Notice => "NOTICE",
    }
}

string_enum! {
    pub enum EventName ("event name") {
        RequestReceived => "request-received",
        SupplierMsgReceived => "supplier-msg-received",
        RequesterMsgReceived => "requester-msg-received",
        LocateSuppliers => "locate-suppliers",
        SelectSupplier => "select-supplier",
        MessageSupplier => "message-supplier",
        MessageRequester => "message-requester",
    }
}

string_enum! {
    pub enum EventStatus ("event status") {
        New => "NEW",
        Processing => "PROCESSING",
        Success => "SUCCESS",
        Problem => "PROBLEM",
        Error => "ERROR",
    }
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Success | EventStatus::Problem | EventStatus::Error
        )
    }
}

string_enum! {
    /// Lifecycle signal published alongside an event mutation.
    pub enum Signal ("signal") {
        Created => "created",
        TaskBegin => "task_begin",
        TaskComplete => "task_complete",
    }
}

/// Notification payload carried on the pub/sub channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub event: EventId,
    pub signal: Signal,
}

string_enum! {
    pub enum MessageDirection ("message direction") {
        Incoming => "incoming",
        Outgoing => "outgoing",
    }
}

string_enum! {
    /// Expected business outcomes that end a task in PROBLEM.
    pub enum ProblemKind ("problem kind") {
        MissingRequestId => "missing-request-id",
        NoHoldings => "no-holdings",
        NoSuppliers => "no-suppliers",
        NoSuppliersAfterFilter => "no-suppliers-after-filter",
        NoNewSuppliers => "no-new-suppliers",
    }
}

impl ProblemKind {
    pub fn message(&self) -> &'static str {
        match self {
            ProblemKind::MissingRequestId => "missing unique record id",
            ProblemKind::NoHoldings => "no holdings located",
            ProblemKind::NoSuppliers => "no suppliers located",
            ProblemKind::NoSuppliersAfterFilter => "no suppliers left after rota filter",
            ProblemKind::NoNewSuppliers => "no suppliers with new status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub kind: ProblemKind,
    pub message: String,
}

impl From<ProblemKind> for ProblemRecord {
    fn from(kind: ProblemKind) -> Self {
        Self {
            kind,
            message: kind.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

/// Typed shape of the event payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    #[default]
    None,
    Message {
        direction: MessageDirection,
        message: Box<IllMessage>,
    },
    Problem(ProblemRecord),
    Error(ErrorRecord),
}

/// Input or result data attached to an event.
///
/// `custom` is an open key/value bag so collaborators can attach extra
/// fields without widening [`EventPayload`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub custom: Map<String, Value>,
}

impl EventData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn incoming(message: IllMessage) -> Self {
        Self::from_payload(EventPayload::Message {
            direction: MessageDirection::Incoming,
            message: Box::new(message),
        })
    }

    pub fn outgoing(message: IllMessage) -> Self {
        Self::from_payload(EventPayload::Message {
            direction: MessageDirection::Outgoing,
            message: Box::new(message),
        })
    }

    pub fn problem(kind: ProblemKind) -> Self {
        Self::from_payload(EventPayload::Problem(kind.into()))
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from_payload(EventPayload::Error(ErrorRecord {
            kind: kind.into(),
            message: message.into(),
        }))
    }

    pub fn from_payload(payload: EventPayload) -> Self {
        Self {
            payload,
            custom: Map::new(),
        }
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    pub fn message(&self) -> Option<&IllMessage> {
        match &self.payload {
            EventPayload::Message { message, .. } => Some(message.as_ref()),
            _ => None,
        }
    }

    pub fn problem_record(&self) -> Option<&ProblemRecord> {
        match &self.payload {
            EventPayload::Problem(problem) => Some(problem),
            _ => None,
        }
    }

    pub fn error_record(&self) -> Option<&ErrorRecord> {
        match &self.payload {
            EventPayload::Error(error) => Some(error),
            _ => None,
        }
    }

    pub fn custom_str(&self, key: &str) -> Option<&str> {
        self.custom.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub ill_transaction_id: IllTransactionId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub event_name: EventName,
    pub event_status: EventStatus,
    pub event_data: EventData,
    #[serde(default)]
    pub result_data: Option<EventData>,
}

impl Event {
    pub fn new_task(
        ill_transaction_id: IllTransactionId,
        event_name: EventName,
        event_data: EventData,
    ) -> Self {
        Self {
            id: EventId::new(),
            ill_transaction_id,
            timestamp: Utc::now(),
            event_type: EventType::Task,
            event_name,
            event_status: EventStatus::New,
            event_data,
            result_data: None,
        }
    }

    pub fn new_notice(
        ill_transaction_id: IllTransactionId,
        event_name: EventName,
        event_data: EventData,
        event_status: EventStatus,
    ) -> Self {
        Self {
            id: EventId::new(),
            ill_transaction_id,
            timestamp: Utc::now(),
            event_type: EventType::Notice,
            event_name,
            event_status,
            event_data,
            result_data: None,
        }
    }

    pub fn is_task(&self) -> bool {
        self.event_type == EventType::Task
    }
}
