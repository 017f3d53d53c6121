use std::{fs::read_to_string, path::Path};

use url::Url;

use crate::{
    ConfigLoadError,
    models::sources::{EnvConfig, FileDatabaseConfig},
};

const DEFAULT_PORT: u16 = 5432;

/// Effective PostgreSQL URL for the broker's pool.
///
/// `DATABASE_URL` or `DATABASE_URL_FILE` is taken verbatim. Otherwise the
/// `[database] url` from the config file is used, or a URL is built from
/// `DATABASE_HOST` and `DATABASE_NAME` with optional `DATABASE_PORT` and
/// `DATABASE_USER`. Both of the latter pick up a password when the URL has
/// none.
pub(crate) fn resolve_database_url(
    env: &EnvConfig,
    file_database: &FileDatabaseConfig,
) -> Result<Option<String>, ConfigLoadError> {
    if let Some(url) = non_blank(env.database_url.as_deref()) {
        return Ok(Some(url));
    }
    if let Some(path) = env.database_url_file.as_deref()
        && let Some(url) = read_secret_file(path)?
    {
        return Ok(Some(url));
    }

    let mut url = match (
        non_blank(file_database.url.as_deref()),
        non_blank(env.database_host.as_deref()),
        non_blank(env.database_name.as_deref()),
    ) {
        (Some(stored), _, _) => parse(&stored)?,
        (None, Some(host), Some(name)) => {
            let port = env.database_port.unwrap_or(DEFAULT_PORT);
            let mut url = parse(&format!("postgresql://{host}:{port}/{name}"))?;
            if let Some(user) = non_blank(env.database_user.as_deref()) {
                url.set_username(&user)
                    .map_err(|_| ConfigLoadError::InvalidDatabaseUsername { username: user })?;
            }
            url
        }
        _ => return Ok(None),
    };

    if url.password().is_none()
        && !url.username().is_empty()
        && let Some(password) = database_password(env, file_database)?
    {
        url.set_password(Some(&password))
            .map_err(|_| ConfigLoadError::InvalidDatabasePassword)?;
    }
    Ok(Some(url.to_string()))
}

/// `DATABASE_PASSWORD`, then `DATABASE_PASSWORD_FILE`, then the config
/// file's `password_file`.
fn database_password(
    env: &EnvConfig,
    file_database: &FileDatabaseConfig,
) -> Result<Option<String>, ConfigLoadError> {
    if let Some(password) = non_blank(env.database_password.as_deref()) {
        return Ok(Some(password));
    }
    for path in [
        env.database_password_file.as_deref(),
        file_database.password_file.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(secret) = read_secret_file(path)? {
            return Ok(Some(secret));
        }
    }
    Ok(None)
}

fn read_secret_file(path: &Path) -> Result<Option<String>, ConfigLoadError> {
    let contents = read_to_string(path).map_err(|source| ConfigLoadError::SecretFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(non_blank(Some(&contents)))
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse(raw: &str) -> Result<Url, ConfigLoadError> {
    Url::parse(raw).map_err(|source| ConfigLoadError::InvalidDatabaseUrl { source })
}
