//! File-backed settings.
//!
//! Every field has a default, so an empty or missing settings file is valid.
//! Environment variables override these values in `crate::config`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub billing: BillingSettings,
    pub logging: LoggingSettings,
    /// TOML file describing cases, attorneys, and clients.
    pub directory_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub backend: String,
    pub libsql_path: Option<String>,
    pub libsql_url: Option<String>,
    pub pool_size: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            backend: "libsql".to_string(),
            libsql_path: None,
            libsql_url: None,
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingSettings {
    pub default_due_days: i64,
    pub currency_symbol: String,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            default_due_days: 30,
            currency_symbol: "$".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "casebill=info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Load settings from `path`, falling back to defaults when the file does
    /// not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw, &path.display().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = Settings::from_toml_str("", "inline").expect("settings");
        assert_eq!(settings.database.backend, "libsql");
        assert_eq!(settings.billing.default_due_days, 30);
        assert_eq!(settings.billing.currency_symbol, "$");
        assert!(settings.directory_path.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            directory_path = "practice.toml"

            [billing]
            default_due_days = 14
            "#,
            "inline",
        )
        .expect("settings");
        assert_eq!(settings.billing.default_due_days, 14);
        assert_eq!(settings.billing.currency_symbol, "$");
        assert_eq!(settings.database.pool_size, 10);
        assert_eq!(settings.directory_path.as_deref(), Some("practice.toml"));
    }

    #[test]
    fn malformed_toml_reports_origin() {
        let err = Settings::from_toml_str("[billing\n", "casebill.toml").expect_err("must fail");
        assert!(err.to_string().contains("casebill.toml"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(settings.logging.format, "pretty");
    }
}
