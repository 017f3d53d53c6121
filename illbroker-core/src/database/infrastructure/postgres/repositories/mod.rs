//! PostgreSQL-backed repository implementations.

pub mod events;
pub mod located_suppliers;
pub mod peers;
pub mod transactions;
