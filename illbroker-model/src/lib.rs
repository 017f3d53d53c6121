//! Core data model definitions shared across the ILL broker crates.
#![allow(missing_docs)]

#[macro_use]
mod macros;

pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod peer;
pub mod supplier;
pub mod transaction;

pub use error::{ModelError, Result as ModelResult};
pub use event::{
    ErrorRecord, Event, EventData, EventName, EventPayload, EventStatus, EventType,
    MessageDirection, ProblemKind, ProblemRecord, Signal, SignalEnvelope,
};
pub use ids::{EventId, IllTransactionId, LocatedSupplierId, PeerId};
pub use message::{
    BibliographicInfo, BillingInfo, IllMessage, MessageHeader, MessageInfo, ReasonForMessage,
    Request, RequesterAction, RequestingAgencyMessage, ServiceInfo, StatusInfo, SupplierStatus,
    SupplyingAgencyMessage,
};
pub use peer::{BrokerMode, Peer, RefreshPolicy};
pub use supplier::{LocatedSupplier, SupplierSelection};
pub use transaction::{IllTransaction, IllTransactionData};
