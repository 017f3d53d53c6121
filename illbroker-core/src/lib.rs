//! Event-driven core of the ILL broker: durable event bus, workflow rules,
//! supplier location and the ports to storage and collaborators.

pub mod archive;
pub mod broker;
pub mod database;
pub mod error;
pub mod events;
pub mod intake;
pub mod locator;
pub mod lookup;
pub mod messaging;
pub mod workflow;

#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use archive::{Archiver, DEFAULT_ARCHIVE_STATUSES};
pub use broker::{Broker, BrokerSettings, Collaborators, DEFAULT_BROKER_SYMBOL};
pub use database::{DatabaseContext, MemoryDatabase};
#[cfg(feature = "postgres")]
pub use database::{PoolSettings, PoolStats, PostgresDatabase};
pub use error::{BrokerError, Result};
pub use events::{EventBus, EventListener, HandlerRegistry, ListenerConfig};
pub use intake::ProtocolIntake;
pub use locator::{Candidate, FairnessRota, RotaFilter, RotaInfo, SupplierLocator};
pub use lookup::{
    DirectoryEntry, DirectoryLookup, Holding, HoldingsLookup, HttpDirectoryLookup,
    HttpHoldingsLookup, PatternHoldingsLookup, PeerResolver, StaticDirectoryLookup,
};
pub use messaging::{HttpMessageSender, MessageSender, OutboundMessaging};
pub use workflow::{NotificationHub, RequesterNotified, WorkflowManager, log_notifications};
