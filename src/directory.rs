//! Practice directory: the case, attorney, and client lookups billing needs.
//!
//! Case management lives outside this crate. Billing only needs to know that
//! a case exists, which client it belongs to, and an attorney's default rate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, ConfigError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRef {
    pub id: String,
    pub client_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttorneyRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Rate applied to new time entries that do not set their own.
    #[serde(default)]
    pub hourly_rate: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRef {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait PracticeDirectory: Send + Sync {
    async fn find_case(&self, case_id: &str) -> Result<Option<CaseRef>, BillingError>;
    async fn find_attorney(&self, attorney_id: &str) -> Result<Option<AttorneyRef>, BillingError>;
    async fn find_client(&self, client_id: &str) -> Result<Option<ClientRef>, BillingError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DirectoryFile {
    clients: Vec<ClientRef>,
    cases: Vec<CaseRef>,
    attorneys: Vec<AttorneyRef>,
}

/// Directory held in memory, optionally loaded from TOML:
///
/// ```toml
/// [[clients]]
/// id = "client-1"
/// name = "Acme Corp"
///
/// [[cases]]
/// id = "case-1"
/// client_id = "client-1"
///
/// [[attorneys]]
/// id = "att-1"
/// hourly_rate = "250.00"
/// ```
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    cases: RwLock<HashMap<String, CaseRef>>,
    attorneys: RwLock<HashMap<String, AttorneyRef>>,
    clients: RwLock<HashMap<String, ClientRef>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(self, id: &str, name: &str) -> Self {
        self.insert_client(ClientRef {
            id: id.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_case(self, id: &str, client_id: &str) -> Self {
        self.insert_case(CaseRef {
            id: id.to_string(),
            client_id: client_id.to_string(),
            title: None,
        });
        self
    }

    pub fn with_attorney(self, id: &str, hourly_rate: Option<Decimal>) -> Self {
        self.insert_attorney(AttorneyRef {
            id: id.to_string(),
            name: None,
            hourly_rate,
        });
        self
    }

    pub fn insert_client(&self, client: ClientRef) {
        self.clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(client.id.clone(), client);
    }

    pub fn insert_case(&self, case: CaseRef) {
        self.cases
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(case.id.clone(), case);
    }

    pub fn insert_attorney(&self, attorney: AttorneyRef) {
        self.attorneys
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(attorney.id.clone(), attorney);
    }

    pub fn from_toml_str(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let file: DirectoryFile = toml::from_str(raw).map_err(|e| ConfigError::ParseError {
            path: origin.to_string(),
            message: e.to_string(),
        })?;

        if !file.clients.is_empty()
            && let Some(orphan) = file
                .cases
                .iter()
                .find(|case| !file.clients.iter().any(|c| c.id == case.client_id))
        {
            return Err(ConfigError::InvalidValue {
                key: origin.to_string(),
                message: format!(
                    "case '{}' references unknown client '{}'",
                    orphan.id, orphan.client_id
                ),
            });
        }

        if let Some(attorney) = file
            .attorneys
            .iter()
            .find(|a| a.hourly_rate.is_some_and(|rate| rate.is_sign_negative()))
        {
            return Err(ConfigError::InvalidValue {
                key: origin.to_string(),
                message: format!("attorney '{}' has a negative hourly rate", attorney.id),
            });
        }

        let directory = Self::new();
        for client in file.clients {
            directory.insert_client(client);
        }
        for case in file.cases {
            directory.insert_case(case);
        }
        for attorney in file.attorneys {
            directory.insert_attorney(attorney);
        }
        Ok(directory)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&raw, &path.display().to_string())
    }
}

#[async_trait]
impl PracticeDirectory for InMemoryDirectory {
    async fn find_case(&self, case_id: &str) -> Result<Option<CaseRef>, BillingError> {
        Ok(self
            .cases
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(case_id)
            .cloned())
    }

    async fn find_attorney(&self, attorney_id: &str) -> Result<Option<AttorneyRef>, BillingError> {
        Ok(self
            .attorneys
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(attorney_id)
            .cloned())
    }

    async fn find_client(&self, client_id: &str) -> Result<Option<ClientRef>, BillingError> {
        Ok(self
            .clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(client_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::{InMemoryDirectory, PracticeDirectory};
    use crate::error::ConfigError;

    #[tokio::test]
    async fn builder_entries_are_found() {
        let directory = InMemoryDirectory::new()
            .with_client("client-1", "Acme Corp")
            .with_case("case-1", "client-1")
            .with_attorney("att-1", Some(dec!(250)));

        let case = directory.find_case("case-1").await.expect("lookup");
        assert_eq!(case.map(|c| c.client_id).as_deref(), Some("client-1"));
        let attorney = directory.find_attorney("att-1").await.expect("lookup");
        assert_eq!(attorney.and_then(|a| a.hourly_rate), Some(dec!(250)));
        assert!(directory.find_case("case-2").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn toml_directory_loads_all_sections() {
        let directory = InMemoryDirectory::from_toml_str(
            r#"
            [[clients]]
            id = "client-1"
            name = "Acme Corp"

            [[cases]]
            id = "case-1"
            client_id = "client-1"
            title = "Acme v. Widgets"

            [[attorneys]]
            id = "att-1"
            name = "R. Counsel"
            hourly_rate = "275.50"

            [[attorneys]]
            id = "paralegal-1"
            "#,
            "practice.toml",
        )
        .expect("directory");

        let client = directory.find_client("client-1").await.expect("lookup");
        assert_eq!(client.map(|c| c.name).as_deref(), Some("Acme Corp"));
        let attorney = directory.find_attorney("att-1").await.expect("lookup");
        assert_eq!(attorney.and_then(|a| a.hourly_rate), Some(dec!(275.50)));
        let paralegal = directory.find_attorney("paralegal-1").await.expect("lookup");
        assert_eq!(paralegal.and_then(|a| a.hourly_rate), None);
    }

    #[test]
    fn cases_must_reference_listed_clients() {
        let err = InMemoryDirectory::from_toml_str(
            r#"
            [[clients]]
            id = "client-1"
            name = "Acme Corp"

            [[cases]]
            id = "case-9"
            client_id = "client-404"
            "#,
            "practice.toml",
        )
        .expect_err("orphan case");
        let ConfigError::InvalidValue { message, .. } = err else {
            panic!("expected InvalidValue");
        };
        assert!(message.contains("client-404"), "unexpected message: {message}");
    }
}
