use crate::config::helpers::{parse_i64_env, parse_string_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Billing defaults applied by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingConfig {
    /// Days between issue date and due date when a caller gives no due date.
    pub default_due_days: i64,
    pub currency_symbol: String,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_due_days: 30,
            currency_symbol: "$".to_string(),
        }
    }
}

fn validate_due_days(raw: i64) -> Result<i64, ConfigError> {
    if !(0..=3650).contains(&raw) {
        return Err(ConfigError::InvalidValue {
            key: "BILLING_DEFAULT_DUE_DAYS".to_string(),
            message: format!("due days must be between 0 and 3650, got {raw}"),
        });
    }
    Ok(raw)
}

fn validate_currency_symbol(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: "BILLING_CURRENCY_SYMBOL".to_string(),
            message: "currency symbol must not be empty".to_string(),
        });
    }
    if trimmed.chars().count() > 4 {
        return Err(ConfigError::InvalidValue {
            key: "BILLING_CURRENCY_SYMBOL".to_string(),
            message: format!("currency symbol '{trimmed}' is longer than 4 characters"),
        });
    }
    Ok(trimmed.to_string())
}

impl BillingConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            default_due_days: validate_due_days(parse_i64_env(
                "BILLING_DEFAULT_DUE_DAYS",
                settings.billing.default_due_days,
            )?)?,
            currency_symbol: validate_currency_symbol(&parse_string_env(
                "BILLING_CURRENCY_SYMBOL",
                settings.billing.currency_symbol.clone(),
            )?)?,
        })
    }
}
