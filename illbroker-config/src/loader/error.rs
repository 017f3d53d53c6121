use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    FileParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to read secret file {path}: {source}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid database url: {source}")]
    InvalidDatabaseUrl {
        #[source]
        source: url::ParseError,
    },

    #[error("database username {username:?} cannot be encoded into the connection url")]
    InvalidDatabaseUsername { username: String },

    #[error("database password cannot be encoded into the connection url")]
    InvalidDatabasePassword,

    #[error("invalid {field} url {value:?}: {source}")]
    InvalidLookupUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("broker symbol {0:?} must take the form AGENCY:VALUE")]
    InvalidBrokerSymbol(String),

    #[error("bus channel name must not be empty")]
    EmptyBusChannel,
}
