use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use illbroker_model::{IllTransactionId, SupplierStatus};
use tracing::info;

use crate::database::ports::{LocatedSupplierRepository, TransactionRepository};
use crate::error::Result;
use crate::events::EventStore;

/// Statuses after which nothing more happens to a transaction.
pub const DEFAULT_ARCHIVE_STATUSES: &[SupplierStatus] = &[
    SupplierStatus::LoanCompleted,
    SupplierStatus::CopyCompleted,
    SupplierStatus::CompletedWithoutReturn,
    SupplierStatus::Unfilled,
    SupplierStatus::Cancelled,
];

#[derive(Clone)]
pub struct Archiver {
    transactions: Arc<dyn TransactionRepository>,
    located: Arc<dyn LocatedSupplierRepository>,
    events: Arc<dyn EventStore>,
}

impl fmt::Debug for Archiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archiver")
            .field("transactions_ptr", &Arc::as_ptr(&self.transactions))
            .finish()
    }
}

impl Archiver {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        located: Arc<dyn LocatedSupplierRepository>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            transactions,
            located,
            events,
        }
    }

    /// Delete transactions created before `before` whose last supplier
    /// status is in `statuses`, together with their events and rota.
    /// Returns the removed ids.
    pub async fn archive_transactions(
        &self,
        before: DateTime<Utc>,
        statuses: &[SupplierStatus],
    ) -> Result<Vec<IllTransactionId>> {
        let candidates = self.transactions.list_archivable(before, statuses).await?;
        let mut archived = Vec::with_capacity(candidates.len());
        for id in candidates {
            let events = self.events.delete_events_for_transaction(id).await?;
            let suppliers = self.located.delete_for_transaction(id).await?;
            if self.transactions.delete(id).await? {
                info!(transaction_id = %id, events, suppliers, "transaction archived");
                archived.push(id);
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryDatabase;
    use crate::events::EventBus;
    use chrono::Duration;
    use illbroker_model::{EventData, EventName, IllTransaction, Request};

    async fn transaction(db: &MemoryDatabase, status: Option<SupplierStatus>) -> IllTransactionId {
        let mut request = Request::default();
        request.header.requesting_agency_request_id = uuid::Uuid::now_v7().to_string();
        let mut tx = IllTransaction::from_request(&request, None);
        tx.timestamp = Utc::now() - Duration::days(30);
        if let Some(status) = status {
            tx.record_supplier_status(status);
        }
        TransactionRepository::create(db, &tx).await.unwrap();
        tx.id
    }

    #[tokio::test]
    async fn only_old_finished_transactions_are_removed() {
        let db = Arc::new(MemoryDatabase::new());
        let done = transaction(&db, Some(SupplierStatus::LoanCompleted)).await;
        let open = transaction(&db, Some(SupplierStatus::Loaned)).await;
        let fresh = transaction(&db, None).await;
        let bus = EventBus::new(db.clone());
        bus.create_task(done, EventName::LocateSuppliers, EventData::empty())
            .await
            .unwrap();

        let archiver = Archiver::new(db.clone(), db.clone(), db.clone());
        let archived = archiver
            .archive_transactions(Utc::now() - Duration::days(1), DEFAULT_ARCHIVE_STATUSES)
            .await
            .unwrap();

        assert_eq!(archived, vec![done]);
        assert!(TransactionRepository::get(db.as_ref(), done).await.unwrap().is_none());
        assert!(db.events_for_transaction(done).await.unwrap().is_empty());
        assert!(TransactionRepository::get(db.as_ref(), open).await.unwrap().is_some());
        assert!(TransactionRepository::get(db.as_ref(), fresh).await.unwrap().is_some());
    }
}
