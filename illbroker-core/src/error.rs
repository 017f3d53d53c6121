use illbroker_model::{EventId, EventStatus, ModelError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Event {0} is not a task")]
    NotATask(EventId),

    #[error("Event {event_id} is {actual}, expected {expected}")]
    InvalidState {
        event_id: EventId,
        expected: EventStatus,
        actual: EventStatus,
    },

    #[error("Task cannot complete with non-terminal status {0}")]
    NonTerminalStatus(EventStatus),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Event listener gave up after {attempts} reconnect attempts")]
    ListenerExhausted { attempts: u32 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Precondition failures raised by task transitions.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            BrokerError::NotATask(_) | BrokerError::InvalidState { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
