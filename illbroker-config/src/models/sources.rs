use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::util::{millis_var, non_empty_var, parse_bool_var, parse_var};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub broker: FileBrokerConfig,
    #[serde(default)]
    pub bus: FileBusConfig,
    #[serde(default)]
    pub lookup: FileLookupConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supply_local: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBusConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Humantime string, e.g. `"1s"` or `"250ms"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_backoff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLookupConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holdings_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub database_url_file: Option<PathBuf>,
    pub database_host: Option<String>,
    pub database_port: Option<u16>,
    pub database_user: Option<String>,
    pub database_name: Option<String>,
    pub database_password: Option<String>,
    pub database_password_file: Option<PathBuf>,
    pub db_max_connections: Option<u32>,
    pub db_min_connections: Option<u32>,
    pub broker_symbol: Option<String>,
    pub supply_local: Option<bool>,
    pub bus_channel: Option<String>,
    pub bus_reconnect_backoff: Option<Duration>,
    pub bus_max_reconnect_attempts: Option<u32>,
    pub holdings_url: Option<String>,
    pub directory_url: Option<String>,
    pub lookup_timeout: Option<Duration>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("ILLBROKER_CONFIG_PATH").map(PathBuf::from),
            database_url: non_empty_var("DATABASE_URL"),
            database_url_file: non_empty_var("DATABASE_URL_FILE").map(PathBuf::from),
            database_host: non_empty_var("DATABASE_HOST"),
            database_port: parse_var("DATABASE_PORT"),
            database_user: non_empty_var("DATABASE_USER"),
            database_name: non_empty_var("DATABASE_NAME"),
            database_password: non_empty_var("DATABASE_PASSWORD"),
            database_password_file: non_empty_var("DATABASE_PASSWORD_FILE")
                .map(PathBuf::from),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS"),
            db_min_connections: parse_var("DB_MIN_CONNECTIONS"),
            broker_symbol: non_empty_var("BROKER_SYMBOL"),
            supply_local: parse_bool_var("SUPPLY_LOCAL"),
            bus_channel: non_empty_var("BUS_CHANNEL"),
            bus_reconnect_backoff: millis_var("BUS_RECONNECT_BACKOFF_MS"),
            bus_max_reconnect_attempts: parse_var("BUS_MAX_RECONNECT_ATTEMPTS"),
            holdings_url: non_empty_var("HOLDINGS_URL"),
            directory_url: non_empty_var("DIRECTORY_URL"),
            lookup_timeout: millis_var("LOOKUP_TIMEOUT_MS"),
        }
    }
}
