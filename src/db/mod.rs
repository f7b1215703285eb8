//! Database abstraction layer.
//!
//! Provides a backend-agnostic `Database` trait for the billing entities.
//! Two implementations exist behind feature flags:
//!
//! - `postgres` (default): Uses `deadpool-postgres` + `tokio-postgres`
//! - `libsql` (default): Uses libSQL (Turso's SQLite fork) for the embedded
//!   desktop deployment
//!
//! Every read and write happens inside a `BillingTransaction` obtained from
//! `Database::begin`. A transaction is the unit of work: callers either
//! `commit` it or `rollback` it, and nothing it wrote is visible to other
//! callers before the commit.

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "libsql")]
pub mod libsql;

#[cfg(feature = "libsql")]
pub mod libsql_migrations;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// Create a database backend from configuration, run migrations, and return it.
pub async fn connect_from_config(
    config: &crate::config::DatabaseConfig,
) -> Result<Arc<dyn Database>, DatabaseError> {
    match config.backend {
        #[cfg(feature = "libsql")]
        crate::config::DatabaseBackend::LibSql => {
            use secrecy::ExposeSecret as _;

            let default_path = crate::config::default_libsql_path();
            let db_path = config.libsql_path.as_deref().unwrap_or(&default_path);

            let backend = if let Some(ref url) = config.libsql_url {
                let token = config.libsql_auth_token.as_ref().ok_or_else(|| {
                    DatabaseError::Config(
                        "LIBSQL_AUTH_TOKEN required when LIBSQL_URL is set".to_string(),
                    )
                })?;
                libsql::LibSqlBackend::new_remote_replica(db_path, url, token.expose_secret())
                    .await?
            } else {
                libsql::LibSqlBackend::new_local(db_path).await?
            };
            backend.run_migrations().await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "postgres")]
        crate::config::DatabaseBackend::Postgres => {
            let pg = postgres::PgBackend::new(config).await?;
            pg.run_migrations().await?;
            Ok(Arc::new(pg))
        }
        #[allow(unreachable_patterns)]
        other => Err(DatabaseError::Config(format!(
            "database backend '{}' is not compiled in; enable the matching cargo feature",
            other.as_str()
        ))),
    }
}

/// Lifecycle state of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Issued,
    PartiallyPaid,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Issued => "issued",
            Self::PartiallyPaid => "partially_paid",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "issued" => Some(Self::Issued),
            "partially_paid" => Some(Self::PartiallyPaid),
            "paid" => Some(Self::Paid),
            "overdue" => Some(Self::Overdue),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Human-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Issued => "Issued",
            Self::PartiallyPaid => "Partially Paid",
            Self::Paid => "Paid",
            Self::Overdue => "Overdue",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// How a payment was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Check,
    CreditCard,
    BankTransfer,
    WireTransfer,
    PayPal,
    Other,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 7] = [
        Self::Cash,
        Self::Check,
        Self::CreditCard,
        Self::BankTransfer,
        Self::WireTransfer,
        Self::PayPal,
        Self::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Check => "check",
            Self::CreditCard => "credit_card",
            Self::BankTransfer => "bank_transfer",
            Self::WireTransfer => "wire_transfer",
            Self::PayPal => "paypal",
            Self::Other => "other",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "cash" => Some(Self::Cash),
            "check" => Some(Self::Check),
            "credit_card" => Some(Self::CreditCard),
            "bank_transfer" => Some(Self::BankTransfer),
            "wire_transfer" => Some(Self::WireTransfer),
            "paypal" => Some(Self::PayPal),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cash => "Cash",
            Self::Check => "Check",
            Self::CreditCard => "Credit Card",
            Self::BankTransfer => "Bank Transfer",
            Self::WireTransfer => "Wire Transfer",
            Self::PayPal => "PayPal",
            Self::Other => "Other",
        }
    }

    /// Accepts either the stored value or the display label, case-insensitively.
    pub fn parse_loose(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        Self::from_db_value(&normalized)
    }
}

/// Activity category of a unit of billable work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityCode {
    Res,
    Dra,
    Rev,
    Com,
    Mee,
    Hea,
    Tri,
    Dep,
    Tra,
    Neg,
    Oth,
}

impl ActivityCode {
    pub const ALL: [ActivityCode; 11] = [
        Self::Res,
        Self::Dra,
        Self::Rev,
        Self::Com,
        Self::Mee,
        Self::Hea,
        Self::Tri,
        Self::Dep,
        Self::Tra,
        Self::Neg,
        Self::Oth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Res => "RES",
            Self::Dra => "DRA",
            Self::Rev => "REV",
            Self::Com => "COM",
            Self::Mee => "MEE",
            Self::Hea => "HEA",
            Self::Tri => "TRI",
            Self::Dep => "DEP",
            Self::Tra => "TRA",
            Self::Neg => "NEG",
            Self::Oth => "OTH",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(value.trim()))
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Res => "Research",
            Self::Dra => "Drafting",
            Self::Rev => "Review",
            Self::Com => "Communication",
            Self::Mee => "Meeting",
            Self::Hea => "Hearing",
            Self::Tri => "Trial",
            Self::Dep => "Deposition",
            Self::Tra => "Travel",
            Self::Neg => "Negotiation",
            Self::Oth => "Other",
        }
    }
}

/// One unit of billable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeEntryRecord {
    pub id: Uuid,
    pub entry_code: String,
    pub case_id: String,
    pub attorney_id: String,
    pub entry_date: NaiveDate,
    pub hours: Decimal,
    pub description: String,
    pub activity_code: ActivityCode,
    pub hourly_rate: Option<Decimal>,
    pub billed: bool,
    pub invoice_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct CreateTimeEntryParams {
    pub entry_code: String,
    pub case_id: String,
    pub attorney_id: String,
    pub entry_date: NaiveDate,
    pub hours: Decimal,
    pub description: String,
    pub activity_code: ActivityCode,
    pub hourly_rate: Option<Decimal>,
}

/// A billing statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub invoice_number: String,
    pub client_id: String,
    pub case_id: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub amount: Decimal,
    pub amount_paid: Decimal,
    pub status: InvoiceStatus,
    pub notes: Option<String>,
    /// Bumped on every write; used for optimistic conflict detection.
    pub version: i64,
}

impl InvoiceRecord {
    /// Outstanding balance. Negative when the invoice is overpaid.
    pub fn balance(&self) -> Decimal {
        self.amount - self.amount_paid
    }
}

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub invoice_number: String,
    pub client_id: String,
    pub case_id: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub amount: Decimal,
    pub amount_paid: Decimal,
    pub status: InvoiceStatus,
    pub notes: Option<String>,
}

/// Cash received against one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub payment_number: String,
    pub invoice_id: Uuid,
    pub client_id: String,
    pub payment_date: NaiveDate,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatePaymentParams {
    pub payment_number: String,
    pub invoice_id: Uuid,
    pub client_id: String,
    pub payment_date: NaiveDate,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub notes: Option<String>,
}

/// Selection for time entry listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeEntryFilter {
    All,
    Case(String),
    UnbilledForCase(String),
    Attorney(String),
    Invoice(Uuid),
    DateRange { start: NaiveDate, end: NaiveDate },
}

/// Selection for invoice listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceFilter {
    All,
    Client(String),
    Case(String),
    Status(InvoiceStatus),
    IssuedBetween { start: NaiveDate, end: NaiveDate },
    /// Due strictly before the given date and neither paid nor cancelled.
    OverdueAsOf(NaiveDate),
}

/// Selection for payment listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentFilter {
    All,
    Invoice(Uuid),
    Client(String),
    Method(PaymentMethod),
    DateRange { start: NaiveDate, end: NaiveDate },
}

/// Entity types that carry a minted human-readable number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceKind {
    Invoice,
    Payment,
    TimeEntry,
}

impl SequenceKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Invoice => "INV",
            Self::Payment => "PMT",
            Self::TimeEntry => "TE",
        }
    }
}

/// Whether a transaction intends to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Read,
    Write,
}

// ==================== Sub-traits ====================
//
// Each sub-trait groups related persistence methods. A `BillingTransaction`
// implements all of them; leaf code can depend on just the slice it needs.

#[async_trait]
pub trait TimeEntryStore: Send {
    async fn get_time_entry(&mut self, id: Uuid)
    -> Result<Option<TimeEntryRecord>, DatabaseError>;
    async fn find_time_entry_by_code(
        &mut self,
        entry_code: &str,
    ) -> Result<Option<TimeEntryRecord>, DatabaseError>;
    async fn list_time_entries(
        &mut self,
        filter: &TimeEntryFilter,
    ) -> Result<Vec<TimeEntryRecord>, DatabaseError>;
    async fn insert_time_entry(
        &mut self,
        input: &CreateTimeEntryParams,
    ) -> Result<TimeEntryRecord, DatabaseError>;
    /// Overwrites every column of an existing row. Returns false if the row is gone.
    async fn update_time_entry(&mut self, record: &TimeEntryRecord)
    -> Result<bool, DatabaseError>;
    /// Marks the given entries billed on `invoice_id`, skipping any that are
    /// already billed. Returns the number of rows changed.
    async fn mark_time_entries_billed(
        &mut self,
        ids: &[Uuid],
        invoice_id: Uuid,
    ) -> Result<u64, DatabaseError>;
    /// Resets every entry billed on `invoice_id` to unbilled.
    async fn unbill_time_entries(&mut self, invoice_id: Uuid) -> Result<u64, DatabaseError>;
    /// Deletes the entry only while it is unbilled.
    async fn delete_unbilled_time_entry(&mut self, id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait InvoiceStore: Send {
    async fn get_invoice(&mut self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError>;
    /// Reads the invoice and holds its row lock until the transaction ends.
    async fn lock_invoice(&mut self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError>;
    async fn find_invoice_by_number(
        &mut self,
        invoice_number: &str,
    ) -> Result<Option<InvoiceRecord>, DatabaseError>;
    async fn list_invoices(
        &mut self,
        filter: &InvoiceFilter,
    ) -> Result<Vec<InvoiceRecord>, DatabaseError>;
    async fn insert_invoice(
        &mut self,
        input: &CreateInvoiceParams,
    ) -> Result<InvoiceRecord, DatabaseError>;
    /// Writes the record if its `version` still matches the stored row and
    /// returns the stored result with the bumped version. A stale version
    /// yields `DatabaseError::Conflict`.
    async fn update_invoice(
        &mut self,
        record: &InvoiceRecord,
    ) -> Result<InvoiceRecord, DatabaseError>;
    async fn delete_invoice(&mut self, id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait PaymentStore: Send {
    async fn get_payment(&mut self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError>;
    async fn find_payment_by_number(
        &mut self,
        payment_number: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError>;
    async fn list_payments(
        &mut self,
        filter: &PaymentFilter,
    ) -> Result<Vec<PaymentRecord>, DatabaseError>;
    async fn insert_payment(
        &mut self,
        input: &CreatePaymentParams,
    ) -> Result<PaymentRecord, DatabaseError>;
    async fn update_payment(&mut self, record: &PaymentRecord) -> Result<bool, DatabaseError>;
    async fn delete_payment(&mut self, id: Uuid) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait SequenceStore: Send {
    /// Highest numeric suffix stored for the kind's prefix, or 0.
    ///
    /// Inside a write transaction the implementation also serializes minting
    /// for this prefix until the transaction ends.
    async fn max_sequence_value(&mut self, kind: SequenceKind) -> Result<u64, DatabaseError>;
}

/// One open unit of work against the store.
#[async_trait]
pub trait BillingTransaction:
    TimeEntryStore + InvoiceStore + PaymentStore + SequenceStore + Send
{
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;
    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Backend-agnostic database handle.
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a unit of work. Write transactions are serialized against other
    /// writers for as long as they stay open.
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn BillingTransaction>, DatabaseError>;

    /// Run schema migrations for this backend.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::{ActivityCode, InvoiceStatus, PaymentMethod};

    #[test]
    fn invoice_status_round_trips_through_db_values() {
        for status in [
            InvoiceStatus::Draft,
            InvoiceStatus::Issued,
            InvoiceStatus::PartiallyPaid,
            InvoiceStatus::Paid,
            InvoiceStatus::Overdue,
            InvoiceStatus::Cancelled,
        ] {
            assert_eq!(InvoiceStatus::from_db_value(status.as_str()), Some(status));
        }
        assert_eq!(InvoiceStatus::from_db_value("Partially Paid"), None);
    }

    #[test]
    fn payment_method_accepts_labels() {
        assert_eq!(
            PaymentMethod::parse_loose("Credit Card"),
            Some(PaymentMethod::CreditCard)
        );
        assert_eq!(
            PaymentMethod::parse_loose("wire-transfer"),
            Some(PaymentMethod::WireTransfer)
        );
        assert_eq!(PaymentMethod::parse_loose("PayPal"), Some(PaymentMethod::PayPal));
        assert_eq!(PaymentMethod::parse_loose("barter"), None);
    }

    #[test]
    fn display_labels_parse_back() {
        for method in PaymentMethod::ALL {
            assert_eq!(PaymentMethod::parse_loose(method.label()), Some(method));
        }
        assert_eq!(InvoiceStatus::PartiallyPaid.label(), "Partially Paid");
        let normalized = InvoiceStatus::PartiallyPaid
            .label()
            .to_ascii_lowercase()
            .replace(' ', "_");
        assert_eq!(
            InvoiceStatus::from_db_value(&normalized),
            Some(InvoiceStatus::PartiallyPaid)
        );
    }

    #[test]
    fn activity_codes_parse_case_insensitively() {
        assert_eq!(ActivityCode::from_db_value("res"), Some(ActivityCode::Res));
        assert_eq!(ActivityCode::from_db_value(" TRA "), Some(ActivityCode::Tra));
        assert_eq!(ActivityCode::from_db_value("XYZ"), None);
        assert_eq!(ActivityCode::Dep.description(), "Deposition");
    }
}
