pub mod context;
pub mod infrastructure;
pub mod ports;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use context::DatabaseContext;
pub use infrastructure::MemoryDatabase;
#[cfg(feature = "postgres")]
pub use postgres::{PoolSettings, PoolStats, PostgresDatabase};
