//! Runtime configuration.
//!
//! Values come from `Settings` (an optional TOML file) and are overridden by
//! environment variables. `.env` loading happens in the binary before
//! `Config::resolve` runs.

mod billing;
mod database;
pub(crate) mod helpers;

use std::path::PathBuf;

pub use billing::BillingConfig;
pub use database::{DatabaseBackend, DatabaseConfig, default_libsql_path};

use crate::config::helpers::{optional_env, parse_bool_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" | "" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::InvalidValue {
                key: "CASEBILL_LOG_FORMAT".to_string(),
                message: format!("unsupported log format '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` still wins when set.
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl LoggingConfig {
    fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            level: parse_string_env("CASEBILL_LOG_LEVEL", settings.logging.level.clone())?,
            format: LogFormat::parse(&parse_string_env(
                "CASEBILL_LOG_FORMAT",
                settings.logging.format.clone(),
            )?)?,
            ansi: parse_bool_env("CASEBILL_LOG_ANSI", true)?,
        })
    }
}

/// Fully resolved configuration.
#[derive(Debug)]
pub struct Config {
    pub database: DatabaseConfig,
    pub billing: BillingConfig,
    pub logging: LoggingConfig,
    pub directory_path: Option<PathBuf>,
}

impl Config {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            database: DatabaseConfig::resolve(settings)?,
            billing: BillingConfig::resolve(settings)?,
            logging: LoggingConfig::resolve(settings)?,
            directory_path: optional_env("CASEBILL_DIRECTORY")?
                .or_else(|| settings.directory_path.clone())
                .map(PathBuf::from),
        })
    }

    /// Settings file location: `CASEBILL_CONFIG`, else `~/.casebill/config.toml`.
    pub fn settings_path() -> Result<PathBuf, ConfigError> {
        Ok(match optional_env("CASEBILL_CONFIG")? {
            Some(path) => PathBuf::from(path),
            None => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".casebill")
                .join("config.toml"),
        })
    }

    /// Load the settings file (if any) and resolve against the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Settings::load(&Self::settings_path()?)?;
        Self::resolve(&settings)
    }
}

#[cfg(test)]
mod tests {
    use super::LogFormat;
    use crate::error::ConfigError;

    #[test]
    fn log_format_parses_known_values() {
        assert_eq!(LogFormat::parse("JSON").expect("format"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty").expect("format"), LogFormat::Pretty);
        let err = LogFormat::parse("xml").expect_err("must reject");
        let ConfigError::InvalidValue { key, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert_eq!(key, "CASEBILL_LOG_FORMAT");
    }
}
