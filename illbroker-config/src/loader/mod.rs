mod db_url;
pub mod error;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::models::sources::{EnvConfig, FileConfig};
use crate::models::{
    BrokerConfig, BusConfig, Config, ConfigMetadata, DEFAULT_BROKER_SYMBOL,
    DEFAULT_BUS_CHANNEL, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_MIN_CONNECTIONS, DEFAULT_RECONNECT_BACKOFF, DatabaseConfig,
    LookupConfig,
};
use crate::util::is_agency_symbol;
use crate::validation::{ConfigWarning, ConfigWarnings};

pub use error::ConfigLoadError;

pub const DEFAULT_CONFIG_PATH: &str = "config/illbroker.toml";

/// Result of a successful load: the resolved configuration plus any
/// non-fatal findings the caller should log.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

/// Loads configuration from `.env`, an optional TOML file and the process
/// environment. Environment values override the file.
#[derive(Debug, Default, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    skip_env_file: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn skip_env_file(mut self) -> Self {
        self.skip_env_file = true;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = if self.skip_env_file {
            false
        } else {
            match dotenvy::dotenv() {
                Ok(path) => {
                    tracing::debug!(path = %path.display(), "loaded .env file");
                    true
                }
                Err(err) if err.not_found() => false,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read .env file");
                    false
                }
            }
        };

        let env = EnvConfig::gather();

        let (path, explicit) = match (&self.config_path, &env.config_path) {
            (Some(path), _) => (path.clone(), true),
            (None, Some(path)) => (path.clone(), true),
            (None, None) => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let file = read_file_config(&path, explicit)?;
        let config_path = file.as_ref().map(|_| path);

        let mut load = load_from_sources(file.unwrap_or_default(), &env)?;
        load.config.metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };
        Ok(load)
    }
}

/// Reads the TOML file. A missing file is an error only when the path was
/// requested explicitly.
fn read_file_config(
    path: &Path,
    explicit: bool,
) -> Result<Option<FileConfig>, ConfigLoadError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
            return Ok(None);
        }
        Err(source) => {
            return Err(ConfigLoadError::FileIo {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    toml::from_str(&raw)
        .map(Some)
        .map_err(|source| ConfigLoadError::FileParse {
            path: path.to_path_buf(),
            source,
        })
}

/// Merge file and environment layers into a validated [`Config`].
pub fn load_from_sources(
    file: FileConfig,
    env: &EnvConfig,
) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    let primary_url = db_url::resolve_database_url(env, &file.database)?;
    if primary_url.is_none() {
        warnings.push(ConfigWarning::new(
            "no database connection configured",
            Some("set DATABASE_URL or DATABASE_HOST/DATABASE_NAME"),
        ));
    }

    let max_connections = env.db_max_connections.or(file.database.max_connections);
    let min_connections = env
        .db_min_connections
        .or(file.database.min_connections)
        .unwrap_or(DEFAULT_MIN_CONNECTIONS);
    if let Some(max) = max_connections
        && min_connections > max
    {
        warnings.push(ConfigWarning::new(
            format!("min_connections ({min_connections}) exceeds max_connections ({max})"),
            Some("the pool will be capped at max_connections"),
        ));
    }

    let symbol = env
        .broker_symbol
        .clone()
        .or(file.broker.symbol)
        .unwrap_or_else(|| DEFAULT_BROKER_SYMBOL.to_string());
    if !is_agency_symbol(&symbol) {
        return Err(ConfigLoadError::InvalidBrokerSymbol(symbol));
    }
    if symbol == DEFAULT_BROKER_SYMBOL {
        warnings.push(ConfigWarning::new(
            format!("broker symbol left at default {DEFAULT_BROKER_SYMBOL}"),
            Some("set BROKER_SYMBOL to the symbol peers know the broker by"),
        ));
    }
    let supply_local = env.supply_local.or(file.broker.supply_local).unwrap_or(false);

    let channel = env
        .bus_channel
        .clone()
        .or(file.bus.channel)
        .unwrap_or_else(|| DEFAULT_BUS_CHANNEL.to_string());
    if channel.trim().is_empty() {
        return Err(ConfigLoadError::EmptyBusChannel);
    }
    let reconnect_backoff = match env.bus_reconnect_backoff {
        Some(value) => value,
        None => parse_duration("bus.reconnect_backoff", file.bus.reconnect_backoff)?
            .unwrap_or(DEFAULT_RECONNECT_BACKOFF),
    };
    let max_reconnect_attempts = env
        .bus_max_reconnect_attempts
        .or(file.bus.max_reconnect_attempts)
        .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
    if max_reconnect_attempts == 0 {
        warnings.push(ConfigWarning::new(
            "bus.max_reconnect_attempts is 0",
            Some("the listener will stop on the first lost connection"),
        ));
    }

    let holdings_url = parse_url(
        "holdings",
        env.holdings_url.clone().or(file.lookup.holdings_url),
    )?;
    let directory_url = parse_url(
        "directory",
        env.directory_url.clone().or(file.lookup.directory_url),
    )?;
    let timeout = match env.lookup_timeout {
        Some(value) => value,
        None => parse_duration("lookup.timeout", file.lookup.timeout)?
            .unwrap_or(DEFAULT_LOOKUP_TIMEOUT),
    };

    let config = Config {
        database: DatabaseConfig {
            primary_url,
            max_connections,
            min_connections,
        },
        broker: BrokerConfig {
            symbol,
            supply_local,
        },
        bus: BusConfig {
            channel,
            reconnect_backoff,
            max_reconnect_attempts,
        },
        lookup: LookupConfig {
            holdings_url,
            directory_url,
            timeout,
        },
        metadata: ConfigMetadata::default(),
    };

    Ok(ConfigLoad { config, warnings })
}

fn parse_duration(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    match raw {
        None => Ok(None),
        Some(value) => humantime::parse_duration(value.trim())
            .map(Some)
            .map_err(|_| ConfigLoadError::InvalidDuration { field, value }),
    }
}

fn parse_url(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<Url>, ConfigLoadError> {
    match raw.filter(|value| !value.trim().is_empty()) {
        None => Ok(None),
        Some(value) => Url::parse(value.trim())
            .map(Some)
            .map_err(|source| ConfigLoadError::InvalidLookupUrl {
                field,
                value,
                source,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_with_db() -> EnvConfig {
        EnvConfig {
            database_url: Some("postgres://broker@localhost/ill".into()),
            broker_symbol: Some("ISIL:DK-BROKER".into()),
            ..EnvConfig::default()
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let load = load_from_sources(FileConfig::default(), &env_with_db()).unwrap();
        let config = load.config;
        assert_eq!(config.bus.channel, DEFAULT_BUS_CHANNEL);
        assert_eq!(config.bus.reconnect_backoff, DEFAULT_RECONNECT_BACKOFF);
        assert_eq!(config.bus.max_reconnect_attempts, DEFAULT_MAX_RECONNECT_ATTEMPTS);
        assert_eq!(config.lookup.timeout, DEFAULT_LOOKUP_TIMEOUT);
        assert!(config.lookup.holdings_url.is_none());
        assert!(!config.broker.supply_local);
        assert!(load.warnings.is_empty());
    }

    #[test]
    fn env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [broker]
            symbol = "ISIL:FILE"
            supply_local = false

            [bus]
            channel = "from_file"
            reconnect_backoff = "250ms"
            max_reconnect_attempts = 9

            [lookup]
            holdings_url = "http://holdings.local/search"
            timeout = "3s"
            "#,
        )
        .unwrap();
        let env = EnvConfig {
            supply_local: Some(true),
            bus_channel: Some("from_env".into()),
            ..env_with_db()
        };

        let config = load_from_sources(file, &env).unwrap().config;
        assert_eq!(config.broker.symbol, "ISIL:DK-BROKER");
        assert!(config.broker.supply_local);
        assert_eq!(config.bus.channel, "from_env");
        assert_eq!(config.bus.reconnect_backoff, Duration::from_millis(250));
        assert_eq!(config.bus.max_reconnect_attempts, 9);
        assert_eq!(config.lookup.timeout, Duration::from_secs(3));
        assert_eq!(
            config.lookup.holdings_url.map(|u| u.to_string()),
            Some("http://holdings.local/search".to_string())
        );
    }

    #[test]
    fn rejects_malformed_broker_symbol() {
        let env = EnvConfig {
            broker_symbol: Some("BROKER".into()),
            ..env_with_db()
        };
        let err = load_from_sources(FileConfig::default(), &env).unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidBrokerSymbol(s) if s == "BROKER"));
    }

    #[test]
    fn rejects_bad_duration() {
        let file: FileConfig = toml::from_str("[bus]\nreconnect_backoff = \"soon\"\n").unwrap();
        let err = load_from_sources(file, &env_with_db()).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidDuration { field: "bus.reconnect_backoff", .. }
        ));
    }

    #[test]
    fn warns_without_database() {
        let env = EnvConfig {
            broker_symbol: Some("ISIL:DK-BROKER".into()),
            ..EnvConfig::default()
        };
        let load = load_from_sources(FileConfig::default(), &env).unwrap();
        assert!(load.config.database.primary_url.is_none());
        assert_eq!(load.warnings.len(), 1);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file_config(&dir.path().join("absent.toml"), true).unwrap_err();
        assert!(matches!(err, ConfigLoadError::FileIo { .. }));
        assert!(read_file_config(&dir.path().join("absent.toml"), false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nsymbol = \"ISIL:DISK\"").unwrap();
        let parsed = read_file_config(file.path(), true).unwrap().unwrap();
        assert_eq!(parsed.broker.symbol.as_deref(), Some("ISIL:DISK"));
    }
}
