//! Repository ports grouped by aggregate. Implementations live in the
//! Postgres adapter under `database::infrastructure::postgres` and in the
//! in-memory adapter under `database::infrastructure::memory`.

pub mod located_suppliers;
pub mod peers;
pub mod transactions;

pub use located_suppliers::LocatedSupplierRepository;
pub use peers::PeerRepository;
pub use transactions::TransactionRepository;
