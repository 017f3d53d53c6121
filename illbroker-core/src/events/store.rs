use async_trait::async_trait;
use illbroker_model::{
    Event, EventData, EventId, EventStatus, IllTransactionId, Signal, SignalEnvelope,
};

use crate::error::{BrokerError, Result};

/// Durable event log with publish-on-commit semantics.
///
/// Every mutating operation writes the row and emits the matching signal in
/// one relational transaction: either both happen or neither does.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the event and publish [`Signal::Created`].
    async fn insert_and_publish(&self, event: &Event) -> Result<()>;

    /// Move a task from `from` to `to`, optionally storing `result`, and
    /// publish `signal`. Fails without mutation when the event is a notice
    /// or its current status is not `from`.
    async fn transition_task(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
        result: Option<&EventData>,
        signal: Signal,
    ) -> Result<Event>;

    async fn get_event(&self, id: EventId) -> Result<Option<Event>>;

    /// Event history of a transaction, oldest first.
    async fn events_for_transaction(&self, transaction_id: IllTransactionId)
    -> Result<Vec<Event>>;

    async fn delete_events_for_transaction(&self, transaction_id: IllTransactionId)
    -> Result<u64>;
}

/// Source of raw publish notifications.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn SignalSubscription>>;
}

#[async_trait]
pub trait SignalSubscription: Send {
    /// Next raw notification payload. `Ok(None)` and `Err` both mean the
    /// underlying connection is gone and the caller must resubscribe.
    async fn next_payload(&mut self) -> Result<Option<String>>;
}

/// Shared precondition for task transitions.
pub fn check_transition(event: &Event, expected: EventStatus) -> Result<()> {
    if !event.is_task() {
        return Err(BrokerError::NotATask(event.id));
    }
    if event.event_status != expected {
        return Err(BrokerError::InvalidState {
            event_id: event.id,
            expected,
            actual: event.event_status,
        });
    }
    Ok(())
}

pub fn encode_signal(event: EventId, signal: Signal) -> Result<String> {
    Ok(serde_json::to_string(&SignalEnvelope { event, signal })?)
}

pub fn decode_signal(payload: &str) -> Result<SignalEnvelope> {
    Ok(serde_json::from_str(payload)?)
}
