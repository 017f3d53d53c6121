//! Configuration loading for the ILL broker.
//!
//! Values come from three layers: built-in defaults, an optional TOML file
//! (`config/illbroker.toml` or `ILLBROKER_CONFIG_PATH`) and the process
//! environment, with `.env` loaded first when present.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{
    ConfigLoad, ConfigLoader, DEFAULT_CONFIG_PATH, error::ConfigLoadError,
    load_from_sources,
};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{
    BrokerConfig, BusConfig, Config, ConfigMetadata, DatabaseConfig,
    LookupConfig,
};
pub use validation::{ConfigWarning, ConfigWarnings};
