//! PostgreSQL infrastructure adapters implementing the database ports.

pub mod repositories;

pub use repositories::events::{PostgresEventStore, PostgresSignalSource};
pub use repositories::located_suppliers::PostgresLocatedSupplierRepository;
pub use repositories::peers::PostgresPeerRepository;
pub use repositories::transactions::PostgresTransactionRepository;
