use std::fmt;
use std::sync::Arc;

use crate::database::infrastructure::MemoryDatabase;
#[cfg(feature = "postgres")]
use crate::database::postgres::PostgresDatabase;
use crate::database::ports::{
    LocatedSupplierRepository, PeerRepository, TransactionRepository,
};
use crate::events::store::{EventStore, SignalSource};

/// Bundles the repository ports, event store and signal source of one
/// storage backend so components can grab exactly what they need.
#[derive(Clone)]
pub struct DatabaseContext {
    pub transactions: Arc<dyn TransactionRepository>,
    pub peers: Arc<dyn PeerRepository>,
    pub located_suppliers: Arc<dyn LocatedSupplierRepository>,
    pub events: Arc<dyn EventStore>,
    pub signals: Arc<dyn SignalSource>,
}

impl fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("transactions_ptr", &Arc::as_ptr(&self.transactions))
            .field("events_ptr", &Arc::as_ptr(&self.events))
            .finish()
    }
}

impl DatabaseContext {
    #[cfg(feature = "postgres")]
    pub fn from_postgres(database: &PostgresDatabase, channel: &str) -> Self {
        Self {
            transactions: Arc::new(database.transactions()),
            peers: Arc::new(database.peers()),
            located_suppliers: Arc::new(database.located_suppliers()),
            events: Arc::new(database.event_store(channel)),
            signals: Arc::new(database.signal_source(channel)),
        }
    }

    pub fn from_memory(database: Arc<MemoryDatabase>) -> Self {
        Self {
            transactions: database.clone(),
            peers: database.clone(),
            located_suppliers: database.clone(),
            events: database.clone(),
            signals: database,
        }
    }
}
