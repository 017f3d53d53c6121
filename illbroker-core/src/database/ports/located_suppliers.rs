use async_trait::async_trait;
use illbroker_model::{IllTransactionId, LocatedSupplier, LocatedSupplierId, SupplierSelection};

use crate::error::Result;

#[async_trait]
pub trait LocatedSupplierRepository: Send + Sync {
    /// Replace the rota of a transaction in one step.
    async fn replace_rota(
        &self,
        transaction_id: IllTransactionId,
        rota: &[LocatedSupplier],
    ) -> Result<()>;

    /// All candidates of a transaction ordered by ordinal.
    async fn list(&self, transaction_id: IllTransactionId) -> Result<Vec<LocatedSupplier>>;

    async fn list_by_selection(
        &self,
        transaction_id: IllTransactionId,
        selection: SupplierSelection,
    ) -> Result<Vec<LocatedSupplier>>;

    async fn get_selected(
        &self,
        transaction_id: IllTransactionId,
    ) -> Result<Option<LocatedSupplier>>;

    async fn find_by_symbol(
        &self,
        transaction_id: IllTransactionId,
        symbol: &str,
    ) -> Result<Option<LocatedSupplier>>;

    /// Demote the currently selected candidate (if any) to `skipped` and,
    /// when `promote` is given, mark that `new` candidate `selected`.
    /// Runs atomically. Promoting a candidate that is not `new` fails with
    /// `Conflict` and leaves the rota unchanged.
    async fn rotate_selection(
        &self,
        transaction_id: IllTransactionId,
        promote: Option<LocatedSupplierId>,
    ) -> Result<Option<LocatedSupplier>>;

    /// Persist `last_status`, `prev_status` and `last_action`.
    async fn update_status(&self, supplier: &LocatedSupplier) -> Result<()>;

    async fn delete_for_transaction(&self, transaction_id: IllTransactionId) -> Result<u64>;
}
