use std::fmt;
use std::future::Future;
use std::sync::Arc;

use illbroker_model::{
    Event, EventData, EventId, EventName, EventStatus, IllTransactionId, Signal,
};
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::events::store::EventStore;

/// Task and notice operations on top of an [`EventStore`].
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn EventStore>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("store_ptr", &Arc::as_ptr(&self.store))
            .finish()
    }
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    pub async fn create_task(
        &self,
        transaction_id: IllTransactionId,
        name: EventName,
        data: EventData,
    ) -> Result<Event> {
        let event = Event::new_task(transaction_id, name, data);
        self.store.insert_and_publish(&event).await?;
        debug!(event_id = %event.id, event_name = %name, "task created");
        Ok(event)
    }

    pub async fn create_notice(
        &self,
        transaction_id: IllTransactionId,
        name: EventName,
        data: EventData,
        status: EventStatus,
    ) -> Result<Event> {
        let event = Event::new_notice(transaction_id, name, data, status);
        self.store.insert_and_publish(&event).await?;
        debug!(event_id = %event.id, event_name = %name, "notice created");
        Ok(event)
    }

    /// Claim a NEW task.
    pub async fn begin_task(&self, id: EventId) -> Result<Event> {
        self.store
            .transition_task(
                id,
                EventStatus::New,
                EventStatus::Processing,
                None,
                Signal::TaskBegin,
            )
            .await
    }

    /// Finish a PROCESSING task with a terminal status.
    pub async fn complete_task(
        &self,
        id: EventId,
        result: EventData,
        status: EventStatus,
    ) -> Result<Event> {
        if !status.is_terminal() {
            return Err(BrokerError::NonTerminalStatus(status));
        }
        self.store
            .transition_task(
                id,
                EventStatus::Processing,
                status,
                Some(&result),
                Signal::TaskComplete,
            )
            .await
    }

    pub async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        self.store.get_event(id).await
    }

    pub async fn events_for_transaction(
        &self,
        transaction_id: IllTransactionId,
    ) -> Result<Vec<Event>> {
        self.store.events_for_transaction(transaction_id).await
    }

    /// Claim `task`, run `work` and record its outcome.
    ///
    /// A task already claimed elsewhere is left alone.
    pub async fn run_task<F, Fut>(&self, task: &Event, work: F) -> Result<()>
    where
        F: FnOnce(Event) -> Fut,
        Fut: Future<Output = (EventStatus, EventData)>,
    {
        let claimed = match self.begin_task(task.id).await {
            Ok(event) => event,
            Err(err) if err.is_precondition() => {
                debug!(event_id = %task.id, error = %err, "task not claimable, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let (status, result) = work(claimed).await;
        if status != EventStatus::Success {
            warn!(event_id = %task.id, event_name = %task.event_name, status = %status, "task did not succeed");
        }
        self.complete_task(task.id, result, status).await?;
        Ok(())
    }
}
