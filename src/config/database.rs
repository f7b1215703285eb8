use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_i64_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Storage engine selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    LibSql,
    Postgres,
}

impl DatabaseBackend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "libsql" | "turso" | "sqlite" => Ok(Self::LibSql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            other => Err(ConfigError::InvalidValue {
                key: "DATABASE_BACKEND".to_string(),
                message: format!("unsupported backend '{other}' (expected libsql or postgres)"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LibSql => "libsql",
            Self::Postgres => "postgres",
        }
    }
}

#[derive(Debug)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    /// Local database file. `None` means `default_libsql_path()`.
    pub libsql_path: Option<PathBuf>,
    /// Remote libSQL server to replicate from.
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<SecretString>,
    pub database_url: Option<SecretString>,
    pub pool_size: usize,
}

/// `~/.casebill/casebill.db`, or a relative path when no home directory exists.
pub fn default_libsql_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".casebill")
        .join("casebill.db")
}

fn validate_pool_size(raw: i64) -> Result<usize, ConfigError> {
    if !(1..=256).contains(&raw) {
        return Err(ConfigError::InvalidValue {
            key: "DATABASE_POOL_SIZE".to_string(),
            message: format!("pool size must be between 1 and 256, got {raw}"),
        });
    }
    usize::try_from(raw).map_err(|e| ConfigError::InvalidValue {
        key: "DATABASE_POOL_SIZE".to_string(),
        message: e.to_string(),
    })
}

impl DatabaseConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let backend = DatabaseBackend::parse(&parse_string_env(
            "DATABASE_BACKEND",
            settings.database.backend.clone(),
        )?)?;

        let libsql_path = optional_env("LIBSQL_PATH")?
            .or_else(|| settings.database.libsql_path.clone())
            .map(PathBuf::from);
        let libsql_url = optional_env("LIBSQL_URL")?.or_else(|| settings.database.libsql_url.clone());
        let libsql_auth_token = optional_env("LIBSQL_AUTH_TOKEN")?.map(SecretString::from);
        let database_url = optional_env("DATABASE_URL")?.map(SecretString::from);

        if backend == DatabaseBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
            });
        }

        let pool_size = validate_pool_size(parse_i64_env(
            "DATABASE_POOL_SIZE",
            i64::try_from(settings.database.pool_size).unwrap_or(i64::MAX),
        )?)?;

        Ok(Self {
            backend,
            libsql_path,
            libsql_url,
            libsql_auth_token,
            database_url,
            pool_size,
        })
    }
}
