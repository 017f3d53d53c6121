use async_trait::async_trait;
use chrono::{DateTime, Utc};
use illbroker_model::{IllTransaction, IllTransactionId, SupplierStatus};

use crate::error::Result;

#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Insert a new transaction. A second transaction with the same
    /// requester request id is rejected with `Conflict`.
    async fn create(&self, transaction: &IllTransaction) -> Result<()>;

    async fn get(&self, id: IllTransactionId) -> Result<Option<IllTransaction>>;

    async fn find_by_requester_request_id(
        &self,
        requester_request_id: &str,
    ) -> Result<Option<IllTransaction>>;

    /// Persist the mutable columns (supplier symbol and the last/previous
    /// action and status pairs).
    async fn update(&self, transaction: &IllTransaction) -> Result<()>;

    async fn set_supplier_symbol(
        &self,
        id: IllTransactionId,
        supplier_symbol: Option<&str>,
    ) -> Result<()>;

    /// Transactions created before `before` whose last supplier status is one
    /// of `statuses`.
    async fn list_archivable(
        &self,
        before: DateTime<Utc>,
        statuses: &[SupplierStatus],
    ) -> Result<Vec<IllTransactionId>>;

    async fn delete(&self, id: IllTransactionId) -> Result<bool>;
}
