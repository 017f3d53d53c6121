use serde::{Deserialize, Serialize};

use crate::ids::{IllTransactionId, LocatedSupplierId, PeerId};
use crate::message::{RequesterAction, SupplierStatus};

string_enum! {
    /// Position of a candidate within the rota walk.
    pub enum SupplierSelection ("located supplier status") {
        New => "new",
        Selected => "selected",
        Skipped => "skipped",
    }
}

/// A transaction-scoped, ordinal-ranked candidate supplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedSupplier {
    pub id: LocatedSupplierId,
    pub ill_transaction_id: IllTransactionId,
    pub supplier_id: PeerId,
    pub supplier_symbol: String,
    pub ordinal: i32,
    pub supplier_status: SupplierSelection,
    pub local_id: Option<String>,
    pub local: bool,
    pub last_status: Option<SupplierStatus>,
    pub prev_status: Option<SupplierStatus>,
    pub last_action: Option<RequesterAction>,
}

impl LocatedSupplier {
    pub fn record_status(&mut self, status: SupplierStatus) {
        self.prev_status = self.last_status.replace(status);
    }

    /// True once the candidate was contacted and has not closed the
    /// request from its side.
    pub fn still_in_play(&self) -> bool {
        self.supplier_status != SupplierSelection::New
            && !matches!(
                self.last_status,
                Some(SupplierStatus::Cancelled) | Some(SupplierStatus::Unfilled)
            )
    }
}
