use std::fmt;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::database::infrastructure::postgres::{
    PostgresEventStore, PostgresLocatedSupplierRepository, PostgresPeerRepository,
    PostgresSignalSource, PostgresTransactionRepository,
};
use crate::error::{BrokerError, Result};

/// Pool sizing, resolved by the configuration layer.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
        }
    }
}

/// Statistics about the connection pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max_size: u32,
    pub min_idle: u32,
}

#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
    settings: PoolSettings,
}

impl fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("max_connections", &self.settings.max_connections)
            .field("min_connections", &self.settings.min_connections)
            .finish()
    }
}

impl PostgresDatabase {
    pub async fn connect(connection_string: &str, settings: PoolSettings) -> Result<Self> {
        let min_connections = settings.min_connections.min(settings.max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .max_lifetime(Duration::from_secs(1800))
            .idle_timeout(Duration::from_secs(600))
            .test_before_acquire(true)
            .connect(connection_string)
            .await
            .map_err(|e| BrokerError::Internal(format!("Database connection failed: {e}")))?;

        info!(
            "Database pool initialized with max_connections={}, min_connections={}",
            settings.max_connections, min_connections
        );

        Ok(Self { pool, settings })
    }

    /// Wrap an existing pool, e.g. one provided by `#[sqlx::test]`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            settings: PoolSettings::default(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            max_size: self.settings.max_connections,
            min_idle: self.settings.min_connections,
        }
    }

    pub async fn initialize_schema(&self) -> Result<()> {
        crate::MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Internal(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn transactions(&self) -> PostgresTransactionRepository {
        PostgresTransactionRepository::new(self.pool.clone())
    }

    pub fn peers(&self) -> PostgresPeerRepository {
        PostgresPeerRepository::new(self.pool.clone())
    }

    pub fn located_suppliers(&self) -> PostgresLocatedSupplierRepository {
        PostgresLocatedSupplierRepository::new(self.pool.clone())
    }

    pub fn event_store(&self, channel: &str) -> PostgresEventStore {
        PostgresEventStore::new(self.pool.clone(), channel)
    }

    pub fn signal_source(&self, channel: &str) -> PostgresSignalSource {
        PostgresSignalSource::new(self.pool.clone(), channel)
    }
}
