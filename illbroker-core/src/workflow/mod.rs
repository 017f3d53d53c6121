//! Reacts to lifecycle signals by creating the next task of a transaction.

mod cancel;
pub mod notifications;

use std::fmt;
use std::sync::Arc;

use illbroker_model::{
    Event, EventData, EventName, EventStatus, IllMessage, IllTransactionId, ReasonForMessage,
    SupplierSelection, SupplierStatus,
};
use tracing::{debug, info, warn};

pub use notifications::{NotificationHub, RequesterNotified, log_notifications};

use crate::database::ports::{LocatedSupplierRepository, TransactionRepository};
use crate::error::Result;
use crate::events::{EventBus, HandlerRegistry};

/// Custom data keys shared by the workflow, intake and outbound messaging.
pub mod keys {
    /// Supplier status a `message-requester` task relays when it carries no
    /// message.
    pub const STATUS: &str = "status";
    pub const NOTE: &str = "note";
    /// Marks an `Unfilled` relay produced because the rota ran out.
    pub const ROTA_EXHAUSTED: &str = "rota_exhausted";
    /// Requester action a `message-supplier` task sends on its own.
    pub const ACTION: &str = "action";
    pub const SUPPLIER_SYMBOL: &str = "supplier_symbol";
    /// Identity a requester message was addressed to.
    pub const ADDRESSED_AS: &str = "addressed_as";
    pub const ADDRESSED_AS_BROKER: &str = "broker";
}

#[derive(Clone)]
pub struct WorkflowManager {
    bus: EventBus,
    transactions: Arc<dyn TransactionRepository>,
    located: Arc<dyn LocatedSupplierRepository>,
    notifications: NotificationHub,
    broker_symbol: String,
}

impl fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("broker_symbol", &self.broker_symbol)
            .finish()
    }
}

impl WorkflowManager {
    pub fn new(
        bus: EventBus,
        transactions: Arc<dyn TransactionRepository>,
        located: Arc<dyn LocatedSupplierRepository>,
        notifications: NotificationHub,
        broker_symbol: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            transactions,
            located,
            notifications,
            broker_symbol: broker_symbol.into(),
        }
    }

    pub fn notifications(&self) -> &NotificationHub {
        &self.notifications
    }

    pub fn register(&self, registry: &mut HandlerRegistry) {
        let manager = self.clone();
        registry.on_created(EventName::RequestReceived, move |event| {
            let manager = manager.clone();
            async move { manager.on_request_received(event).await }
        });

        let manager = self.clone();
        registry.on_task_completed(EventName::LocateSuppliers, move |event| {
            let manager = manager.clone();
            async move { manager.on_locate_completed(event).await }
        });

        let manager = self.clone();
        registry.on_task_completed(EventName::SelectSupplier, move |event| {
            let manager = manager.clone();
            async move { manager.on_select_completed(event).await }
        });

        let manager = self.clone();
        registry.on_created(EventName::SupplierMsgReceived, move |event| {
            let manager = manager.clone();
            async move { manager.on_supplier_message(event).await }
        });

        let manager = self.clone();
        registry.on_created(EventName::RequesterMsgReceived, move |event| {
            let manager = manager.clone();
            async move { manager.on_requester_message(event).await }
        });

        let manager = self.clone();
        registry.on_task_completed(EventName::MessageSupplier, move |event| {
            let manager = manager.clone();
            async move { manager.on_supplier_messaged(event).await }
        });

        let manager = self.clone();
        registry.on_task_completed(EventName::MessageRequester, move |event| {
            let manager = manager.clone();
            async move { manager.on_requester_messaged(event).await }
        });
    }

    pub async fn on_request_received(&self, event: Event) -> Result<()> {
        self.bus
            .create_task(
                event.ill_transaction_id,
                EventName::LocateSuppliers,
                EventData::empty(),
            )
            .await?;
        Ok(())
    }

    pub async fn on_locate_completed(&self, event: Event) -> Result<()> {
        match event.event_status {
            EventStatus::Success => {
                self.bus
                    .create_task(
                        event.ill_transaction_id,
                        EventName::SelectSupplier,
                        EventData::empty(),
                    )
                    .await?;
            }
            EventStatus::Problem | EventStatus::Error => {
                self.relay_unfilled(&event).await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn on_select_completed(&self, event: Event) -> Result<()> {
        match event.event_status {
            EventStatus::Success => {
                self.bus
                    .create_task(
                        event.ill_transaction_id,
                        EventName::MessageSupplier,
                        EventData::empty(),
                    )
                    .await?;
            }
            EventStatus::Problem | EventStatus::Error => {
                self.relay_unfilled(&event).await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn on_supplier_message(&self, event: Event) -> Result<()> {
        let Some(message) = event
            .event_data
            .message()
            .and_then(|message| message.as_supplying_agency_message())
        else {
            warn!(event_id = %event.id, "supplier notice without a supplying agency message");
            return Ok(());
        };

        let status = message.status_info.status;
        let reason = message.message_info.reason_for_message;
        let advance_rota = match status {
            SupplierStatus::Unfilled => true,
            SupplierStatus::Cancelled => reason != ReasonForMessage::CancelResponse,
            _ => false,
        };

        let sender = &message.header.supplying_agency_id;
        if advance_rota && !self.is_selected(event.ill_transaction_id, sender).await? {
            info!(
                transaction_id = %event.ill_transaction_id,
                supplier = %sender,
                status = %status,
                "status from a supplier that no longer holds the request"
            );
            return Ok(());
        }

        if advance_rota {
            debug!(transaction_id = %event.ill_transaction_id, status = %status, "advancing rota");
            self.bus
                .create_task(
                    event.ill_transaction_id,
                    EventName::SelectSupplier,
                    EventData::empty(),
                )
                .await?;
        } else {
            self.bus
                .create_task(
                    event.ill_transaction_id,
                    EventName::MessageRequester,
                    EventData::incoming(IllMessage::SupplyingAgencyMessage(
                        message.clone(),
                    )),
                )
                .await?;
        }
        Ok(())
    }

    /// A request that could not be delivered to the selected supplier counts
    /// as `Unfilled` from that supplier. The requester is told, and the rota
    /// moves on once the relay completes.
    pub async fn on_supplier_messaged(&self, event: Event) -> Result<()> {
        if !matches!(event.event_status, EventStatus::Error | EventStatus::Problem) {
            return Ok(());
        }
        let data = &event.event_data;
        if data.message().is_some() || data.custom_str(keys::ACTION).is_some() {
            debug!(event_id = %event.id, "failed supplier action leaves the rota alone");
            return Ok(());
        }

        let transaction_id = event.ill_transaction_id;
        let Some(mut selected) = self.located.get_selected(transaction_id).await? else {
            return self.relay_unfilled(&event).await;
        };
        if let Some(target) = data.custom_str(keys::SUPPLIER_SYMBOL)
            && target != selected.supplier_symbol
        {
            debug!(event_id = %event.id, supplier = %target, "failed request was not for the selected supplier");
            return Ok(());
        }

        selected.record_status(SupplierStatus::Unfilled);
        self.located.update_status(&selected).await?;

        let reason = event
            .result_data
            .as_ref()
            .and_then(|result| result.error_record())
            .map(|error| error.message.clone())
            .unwrap_or_else(|| "request could not be delivered".to_string());
        warn!(
            transaction_id = %transaction_id,
            supplier = %selected.supplier_symbol,
            error = %reason,
            "selected supplier unreachable"
        );
        self.bus
            .create_task(
                transaction_id,
                EventName::MessageRequester,
                EventData::empty()
                    .with_custom(keys::STATUS, SupplierStatus::Unfilled.as_str())
                    .with_custom(
                        keys::NOTE,
                        format!("supplier {} unreachable: {reason}", selected.supplier_symbol),
                    ),
            )
            .await?;
        Ok(())
    }

    pub async fn on_requester_message(&self, event: Event) -> Result<()> {
        let Some(message) = event.event_data.message().cloned() else {
            warn!(event_id = %event.id, "requester notice without a message");
            return Ok(());
        };
        if message.as_requesting_agency_message().is_none() {
            warn!(event_id = %event.id, kind = message.kind(), "unexpected message on requester notice");
            return Ok(());
        }

        self.bus
            .create_task(
                event.ill_transaction_id,
                EventName::MessageSupplier,
                EventData::incoming(message),
            )
            .await?;
        Ok(())
    }

    pub async fn on_requester_messaged(&self, event: Event) -> Result<()> {
        let transaction_id = event.ill_transaction_id;
        let status = relayed_status(&event.event_data);

        if let Err(err) = self.notify_participants(transaction_id, status).await {
            warn!(transaction_id = %transaction_id, error = %err, "participant broadcast failed");
        }

        let exhausted = event
            .event_data
            .custom
            .get(keys::ROTA_EXHAUSTED)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if event.event_status == EventStatus::Success
            && status == Some(SupplierStatus::Unfilled)
            && !exhausted
            && self.has_new_candidates(transaction_id).await?
        {
            self.bus
                .create_task(transaction_id, EventName::SelectSupplier, EventData::empty())
                .await?;
        }

        let confirms_cancel = event
            .event_data
            .message()
            .and_then(|message| message.as_supplying_agency_message())
            .is_some_and(|message| {
                message.message_info.reason_for_message == ReasonForMessage::CancelResponse
                    && message.status_info.status == SupplierStatus::Cancelled
            });
        if confirms_cancel {
            self.reconcile_cancel(&event).await;
        }
        Ok(())
    }

    async fn relay_unfilled(&self, event: &Event) -> Result<()> {
        let note = event.result_data.as_ref().and_then(|result| {
            result
                .problem_record()
                .map(|problem| problem.message.clone())
                .or_else(|| result.error_record().map(|error| error.message.clone()))
        });

        let mut data = EventData::empty()
            .with_custom(keys::STATUS, SupplierStatus::Unfilled.as_str())
            .with_custom(keys::ROTA_EXHAUSTED, true);
        if let Some(note) = note {
            data = data.with_custom(keys::NOTE, note);
        }

        info!(
            transaction_id = %event.ill_transaction_id,
            from = %event.event_name,
            status = %event.event_status,
            "relaying unfilled to requester"
        );
        self.bus
            .create_task(event.ill_transaction_id, EventName::MessageRequester, data)
            .await?;
        Ok(())
    }

    async fn notify_participants(
        &self,
        transaction_id: IllTransactionId,
        status: Option<SupplierStatus>,
    ) -> Result<()> {
        let current = self
            .transactions
            .get(transaction_id)
            .await?
            .and_then(|transaction| transaction.supplier_symbol);
        let participants = self
            .located
            .list(transaction_id)
            .await?
            .into_iter()
            .map(|supplier| supplier.supplier_symbol)
            .filter(|symbol| current.as_deref() != Some(symbol.as_str()))
            .collect();

        self.notifications.publish(RequesterNotified {
            transaction_id,
            status,
            participants,
        });
        Ok(())
    }

    async fn is_selected(&self, transaction_id: IllTransactionId, symbol: &str) -> Result<bool> {
        Ok(self
            .located
            .get_selected(transaction_id)
            .await?
            .is_some_and(|selected| selected.supplier_symbol == symbol))
    }

    async fn has_new_candidates(&self, transaction_id: IllTransactionId) -> Result<bool> {
        Ok(!self
            .located
            .list_by_selection(transaction_id, SupplierSelection::New)
            .await?
            .is_empty())
    }
}

/// Status a `message-requester` task relays: the carried message wins over
/// the custom `status` field.
pub fn relayed_status(data: &EventData) -> Option<SupplierStatus> {
    data.message()
        .and_then(|message| message.supplier_status())
        .or_else(|| data.custom_str(keys::STATUS)?.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;
    use crate::events::EventStore;
    use crate::database::ports::LocatedSupplierRepository;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use illbroker_model::{
        IllMessage, IllTransaction, LocatedSupplier, LocatedSupplierId, MessageHeader, MessageInfo,
        PeerId, Request, StatusInfo, SupplyingAgencyMessage,
    };

    pub(super) fn supplier_message(
        supplier: &str,
        status: SupplierStatus,
        reason: ReasonForMessage,
    ) -> IllMessage {
        IllMessage::SupplyingAgencyMessage(SupplyingAgencyMessage {
            header: MessageHeader {
                requesting_agency_id: "ISIL:REQ".into(),
                supplying_agency_id: supplier.into(),
                requesting_agency_request_id: "req-1".into(),
                ..MessageHeader::default()
            },
            message_info: MessageInfo {
                reason_for_message: reason,
                answer_yes_no: None,
                note: None,
            },
            status_info: StatusInfo {
                status,
                last_change: None,
            },
        })
    }

    pub(super) async fn fixture() -> (Arc<MemoryDatabase>, WorkflowManager, IllTransactionId) {
        let db = Arc::new(MemoryDatabase::new());
        let tx = IllTransaction::from_request(&Request::default(), None);
        TransactionRepository::create(db.as_ref(), &tx).await.unwrap();
        let manager = WorkflowManager::new(
            EventBus::new(db.clone()),
            db.clone(),
            db.clone(),
            NotificationHub::default(),
            "ISIL:BROKER",
        );
        (db, manager, tx.id)
    }

    fn rota_row(
        transaction_id: IllTransactionId,
        symbol: &str,
        ordinal: i32,
        selection: SupplierSelection,
    ) -> LocatedSupplier {
        LocatedSupplier {
            id: LocatedSupplierId::new(),
            ill_transaction_id: transaction_id,
            supplier_id: PeerId::new(),
            supplier_symbol: symbol.into(),
            ordinal,
            supplier_status: selection,
            local_id: None,
            local: false,
            last_status: None,
            prev_status: None,
            last_action: None,
        }
    }

    /// Transactions that cannot be read back.
    struct UnreadableTransactions;

    #[async_trait]
    impl TransactionRepository for UnreadableTransactions {
        async fn create(&self, _: &IllTransaction) -> Result<()> {
            Ok(())
        }

        async fn get(&self, id: IllTransactionId) -> Result<Option<IllTransaction>> {
            Err(crate::error::BrokerError::Internal(format!("transaction {id} unreadable")))
        }

        async fn find_by_requester_request_id(&self, _: &str) -> Result<Option<IllTransaction>> {
            Ok(None)
        }

        async fn update(&self, _: &IllTransaction) -> Result<()> {
            Ok(())
        }

        async fn set_supplier_symbol(&self, _: IllTransactionId, _: Option<&str>) -> Result<()> {
            Ok(())
        }

        async fn list_archivable(
            &self,
            _: DateTime<Utc>,
            _: &[SupplierStatus],
        ) -> Result<Vec<IllTransactionId>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _: IllTransactionId) -> Result<bool> {
            Ok(false)
        }
    }

    fn unfilled_relay(tx: IllTransactionId) -> Event {
        let mut completed = Event::new_task(
            tx,
            EventName::MessageRequester,
            EventData::empty().with_custom(keys::STATUS, "Unfilled"),
        );
        completed.event_status = EventStatus::Success;
        completed
    }

    fn names(events: &[Event]) -> Vec<EventName> {
        events.iter().map(|event| event.event_name).collect()
    }

    #[tokio::test]
    async fn supplier_statuses_route_to_the_right_task() {
        let cases = [
            (SupplierStatus::Unfilled, ReasonForMessage::StatusChange, EventName::SelectSupplier),
            (SupplierStatus::Loaned, ReasonForMessage::StatusChange, EventName::MessageRequester),
            (SupplierStatus::WillSupply, ReasonForMessage::RequestResponse, EventName::MessageRequester),
            (SupplierStatus::Cancelled, ReasonForMessage::CancelResponse, EventName::MessageRequester),
            (SupplierStatus::Cancelled, ReasonForMessage::StatusChange, EventName::SelectSupplier),
        ];

        for (status, reason, expected) in cases {
            let (db, manager, tx) = fixture().await;
            db.replace_rota(tx, &[rota_row(tx, "ISIL:SUP", 0, SupplierSelection::Selected)])
                .await
                .unwrap();
            let notice = Event::new_notice(
                tx,
                EventName::SupplierMsgReceived,
                EventData::incoming(supplier_message("ISIL:SUP", status, reason)),
                EventStatus::Success,
            );
            manager.on_supplier_message(notice).await.unwrap();

            let events = db.events_for_transaction(tx).await.unwrap();
            assert_eq!(names(&events), vec![expected], "{status} / {reason}");
        }
    }

    #[tokio::test]
    async fn failed_locate_relays_unfilled_with_the_problem_note() {
        let (db, manager, tx) = fixture().await;
        let mut completed = Event::new_task(tx, EventName::LocateSuppliers, EventData::empty());
        completed.event_status = EventStatus::Problem;
        completed.result_data = Some(EventData::problem(illbroker_model::ProblemKind::NoHoldings));

        manager.on_locate_completed(completed).await.unwrap();

        let events = db.events_for_transaction(tx).await.unwrap();
        assert_eq!(names(&events), vec![EventName::MessageRequester]);
        let data = &events[0].event_data;
        assert_eq!(data.custom_str(keys::STATUS), Some("Unfilled"));
        assert_eq!(data.custom_str(keys::NOTE), Some("no holdings located"));
        assert_eq!(relayed_status(data), Some(SupplierStatus::Unfilled));
    }

    #[tokio::test]
    async fn exhausted_relay_does_not_requeue_selection() {
        let (db, manager, tx) = fixture().await;
        let mut receiver = manager.notifications().subscribe();
        let mut completed = Event::new_task(
            tx,
            EventName::MessageRequester,
            EventData::empty()
                .with_custom(keys::STATUS, "Unfilled")
                .with_custom(keys::ROTA_EXHAUSTED, true),
        );
        completed.event_status = EventStatus::Success;

        manager.on_requester_messaged(completed).await.unwrap();

        assert!(db.events_for_transaction(tx).await.unwrap().is_empty());
        let notified = receiver.try_recv().unwrap();
        assert_eq!(notified.transaction_id, tx);
        assert_eq!(notified.status, Some(SupplierStatus::Unfilled));
    }

    #[tokio::test]
    async fn skipped_supplier_cannot_move_the_rota() {
        let (db, manager, tx) = fixture().await;
        db.replace_rota(
            tx,
            &[
                rota_row(tx, "ISIL:A", 0, SupplierSelection::Skipped),
                rota_row(tx, "ISIL:B", 1, SupplierSelection::Selected),
                rota_row(tx, "ISIL:C", 2, SupplierSelection::New),
            ],
        )
        .await
        .unwrap();

        for (status, reason) in [
            (SupplierStatus::Unfilled, ReasonForMessage::RequestResponse),
            (SupplierStatus::Cancelled, ReasonForMessage::StatusChange),
        ] {
            let notice = Event::new_notice(
                tx,
                EventName::SupplierMsgReceived,
                EventData::incoming(supplier_message("ISIL:A", status, reason)),
                EventStatus::Success,
            );
            manager.on_supplier_message(notice).await.unwrap();
        }

        assert!(db.events_for_transaction(tx).await.unwrap().is_empty());
        let selected = db.get_selected(tx).await.unwrap().unwrap();
        assert_eq!(selected.supplier_symbol, "ISIL:B");
    }

    #[tokio::test]
    async fn undeliverable_request_relays_unfilled_without_ending_the_rota() {
        let (db, manager, tx) = fixture().await;
        db.replace_rota(
            tx,
            &[
                rota_row(tx, "ISIL:A", 0, SupplierSelection::Selected),
                rota_row(tx, "ISIL:B", 1, SupplierSelection::New),
            ],
        )
        .await
        .unwrap();

        let mut failed = Event::new_task(tx, EventName::MessageSupplier, EventData::empty());
        failed.event_status = EventStatus::Error;
        failed.result_data = Some(EventData::error("send", "connection refused"));
        manager.on_supplier_messaged(failed).await.unwrap();

        let events = db.events_for_transaction(tx).await.unwrap();
        assert_eq!(names(&events), vec![EventName::MessageRequester]);
        let data = &events[0].event_data;
        assert_eq!(relayed_status(data), Some(SupplierStatus::Unfilled));
        assert!(!data.custom.contains_key(keys::ROTA_EXHAUSTED));
        assert!(data.custom_str(keys::NOTE).unwrap().contains("ISIL:A"));

        let row = LocatedSupplierRepository::find_by_symbol(db.as_ref(), tx, "ISIL:A")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.last_status, Some(SupplierStatus::Unfilled));
    }

    #[tokio::test]
    async fn failed_cancel_delivery_leaves_the_rota_alone() {
        let (db, manager, tx) = fixture().await;
        db.replace_rota(tx, &[rota_row(tx, "ISIL:A", 0, SupplierSelection::Selected)])
            .await
            .unwrap();

        let mut failed = Event::new_task(
            tx,
            EventName::MessageSupplier,
            EventData::empty()
                .with_custom(keys::ACTION, "Cancel")
                .with_custom(keys::SUPPLIER_SYMBOL, "ISIL:A"),
        );
        failed.event_status = EventStatus::Error;
        manager.on_supplier_messaged(failed).await.unwrap();

        assert!(db.events_for_transaction(tx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unfilled_relay_requeues_selection_while_candidates_remain() {
        let (db, manager, tx) = fixture().await;
        db.replace_rota(
            tx,
            &[
                rota_row(tx, "ISIL:A", 0, SupplierSelection::Selected),
                rota_row(tx, "ISIL:B", 1, SupplierSelection::New),
            ],
        )
        .await
        .unwrap();

        manager.on_requester_messaged(unfilled_relay(tx)).await.unwrap();

        let events = db.events_for_transaction(tx).await.unwrap();
        assert_eq!(names(&events), vec![EventName::SelectSupplier]);
    }

    #[tokio::test]
    async fn broadcast_failure_does_not_block_the_requeue() {
        let (db, _, tx) = fixture().await;
        db.replace_rota(tx, &[rota_row(tx, "ISIL:B", 0, SupplierSelection::New)])
            .await
            .unwrap();
        let manager = WorkflowManager::new(
            EventBus::new(db.clone()),
            Arc::new(UnreadableTransactions),
            db.clone(),
            NotificationHub::default(),
            "ISIL:BROKER",
        );
        let mut receiver = manager.notifications().subscribe();

        manager.on_requester_messaged(unfilled_relay(tx)).await.unwrap();

        let events = db.events_for_transaction(tx).await.unwrap();
        assert_eq!(names(&events), vec![EventName::SelectSupplier]);
        assert!(receiver.try_recv().is_err());
    }
}
