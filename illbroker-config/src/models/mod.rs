pub mod sources;

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

pub const DEFAULT_BROKER_SYMBOL: &str = "ISIL:BROKER";
pub const DEFAULT_BUS_CHANNEL: &str = "ill_events";
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_CONNECTIONS: u32 = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub bus: BusConfig,
    pub lookup: LookupConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub primary_url: Option<String>,
    pub max_connections: Option<u32>,
    pub min_connections: u32,
}

/// Identity and policy of the broker itself.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Symbol the broker presents to peers in opaque mode.
    pub symbol: String,
    /// Allow the requester's own institution to fill its request.
    pub supply_local: bool,
}

/// Event bus listener tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub channel: String,
    /// Base unit of the linear reconnect backoff: attempt `n` waits `n` units.
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_BUS_CHANNEL.to_string(),
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Holdings and directory collaborators. Absent URLs select the built-in
/// offline adapters.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    pub holdings_url: Option<Url>,
    pub directory_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
