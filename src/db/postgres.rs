//! PostgreSQL backend for the Database trait.
//!
//! Each unit of work checks a client out of the `deadpool-postgres` pool and
//! drives `BEGIN`/`COMMIT`/`ROLLBACK` on it directly. Invoice rows are locked
//! with `SELECT ... FOR UPDATE`; number minting takes a per-prefix advisory
//! lock scoped to the transaction.

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool, PoolConfig, Runtime};
use secrecy::ExposeSecret as _;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{
    ActivityCode, BillingTransaction, CreateInvoiceParams, CreatePaymentParams,
    CreateTimeEntryParams, Database, InvoiceFilter, InvoiceRecord, InvoiceStatus, InvoiceStore,
    PaymentFilter, PaymentMethod, PaymentRecord, PaymentStore, SequenceKind, SequenceStore,
    TimeEntryFilter, TimeEntryRecord, TimeEntryStore, TxMode,
};
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_ENTRY_COLUMNS: &str = "id, entry_code, case_id, attorney_id, entry_date, hours, \
     description, activity_code, hourly_rate, billed, invoice_id";

const INVOICE_COLUMNS: &str = "id, invoice_number, client_id, case_id, issue_date, due_date, \
     amount, amount_paid, status, notes, version";

const PAYMENT_COLUMNS: &str = "id, payment_number, invoice_id, client_id, payment_date, amount, \
     payment_method, reference, notes";

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// PostgreSQL database backend.
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    /// Create a new PostgreSQL backend from configuration.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .database_url
            .as_ref()
            .ok_or_else(|| DatabaseError::Config("DATABASE_URL is not set".to_string()))?;

        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(PoolConfig::new(config.pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Config(e.to_string()))?;

        // Fail fast on a bad URL instead of on the first billing call.
        let _ = pool.get().await?;
        Ok(Self { pool })
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }
}

/// Open unit of work on a pooled PostgreSQL client.
pub struct PgTransaction {
    client: Option<Object>,
    mode: TxMode,
}

impl PgTransaction {
    fn client(&self) -> Result<&Object, DatabaseError> {
        self.client
            .as_ref()
            .ok_or_else(|| DatabaseError::Query("transaction already finished".to_string()))
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<(), DatabaseError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| DatabaseError::Query("transaction already finished".to_string()))?;
        match client.batch_execute(statement).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Never hand a connection in an unknown state back to the pool.
                let _ = Object::take(client);
                Err(e.into())
            }
        }
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // Dropped mid-transaction: detach the connection so closing it makes
        // the server abort the transaction.
        if let Some(client) = self.client.take() {
            tracing::warn!("PostgreSQL transaction dropped without commit or rollback");
            let _ = Object::take(client);
        }
    }
}

fn param<T: ToSql + Sync + Send + 'static>(value: T) -> SqlParam {
    Box::new(value)
}

fn param_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn row_to_time_entry_record(row: &tokio_postgres::Row) -> Result<TimeEntryRecord, DatabaseError> {
    let activity_raw: String = row.get("activity_code");
    let activity_code = ActivityCode::from_db_value(&activity_raw).ok_or_else(|| {
        DatabaseError::Serialization(format!("invalid activity_code '{}'", activity_raw))
    })?;
    Ok(TimeEntryRecord {
        id: row.get("id"),
        entry_code: row.get("entry_code"),
        case_id: row.get("case_id"),
        attorney_id: row.get("attorney_id"),
        entry_date: row.get("entry_date"),
        hours: row.get("hours"),
        description: row.get("description"),
        activity_code,
        hourly_rate: row.get("hourly_rate"),
        billed: row.get("billed"),
        invoice_id: row.get("invoice_id"),
    })
}

fn row_to_invoice_record(row: &tokio_postgres::Row) -> Result<InvoiceRecord, DatabaseError> {
    let status_raw: String = row.get("status");
    let status = InvoiceStatus::from_db_value(&status_raw).ok_or_else(|| {
        DatabaseError::Serialization(format!("invalid invoice status '{}'", status_raw))
    })?;
    Ok(InvoiceRecord {
        id: row.get("id"),
        invoice_number: row.get("invoice_number"),
        client_id: row.get("client_id"),
        case_id: row.get("case_id"),
        issue_date: row.get("issue_date"),
        due_date: row.get("due_date"),
        amount: row.get("amount"),
        amount_paid: row.get("amount_paid"),
        status,
        notes: row.get("notes"),
        version: row.get("version"),
    })
}

fn row_to_payment_record(row: &tokio_postgres::Row) -> Result<PaymentRecord, DatabaseError> {
    let method_raw: String = row.get("payment_method");
    let method = PaymentMethod::from_db_value(&method_raw).ok_or_else(|| {
        DatabaseError::Serialization(format!("invalid payment_method '{}'", method_raw))
    })?;
    Ok(PaymentRecord {
        id: row.get("id"),
        payment_number: row.get("payment_number"),
        invoice_id: row.get("invoice_id"),
        client_id: row.get("client_id"),
        payment_date: row.get("payment_date"),
        amount: row.get("amount"),
        method,
        reference: row.get("reference"),
        notes: row.get("notes"),
    })
}

fn time_entry_where(filter: &TimeEntryFilter) -> (&'static str, Vec<SqlParam>) {
    match filter {
        TimeEntryFilter::All => ("", Vec::new()),
        TimeEntryFilter::Case(case_id) => ("WHERE case_id = $1", vec![param(case_id.clone())]),
        TimeEntryFilter::UnbilledForCase(case_id) => (
            "WHERE case_id = $1 AND NOT billed",
            vec![param(case_id.clone())],
        ),
        TimeEntryFilter::Attorney(attorney_id) => (
            "WHERE attorney_id = $1",
            vec![param(attorney_id.clone())],
        ),
        TimeEntryFilter::Invoice(invoice_id) => {
            ("WHERE invoice_id = $1", vec![param(*invoice_id)])
        }
        TimeEntryFilter::DateRange { start, end } => (
            "WHERE entry_date >= $1 AND entry_date <= $2",
            vec![param(*start), param(*end)],
        ),
    }
}

fn invoice_where(filter: &InvoiceFilter) -> (&'static str, Vec<SqlParam>) {
    match filter {
        InvoiceFilter::All => ("", Vec::new()),
        InvoiceFilter::Client(client_id) => {
            ("WHERE client_id = $1", vec![param(client_id.clone())])
        }
        InvoiceFilter::Case(case_id) => ("WHERE case_id = $1", vec![param(case_id.clone())]),
        InvoiceFilter::Status(status) => (
            "WHERE status = $1",
            vec![param(status.as_str().to_string())],
        ),
        InvoiceFilter::IssuedBetween { start, end } => (
            "WHERE issue_date >= $1 AND issue_date <= $2",
            vec![param(*start), param(*end)],
        ),
        InvoiceFilter::OverdueAsOf(today) => (
            "WHERE due_date < $1 AND status NOT IN ('paid', 'cancelled')",
            vec![param(*today)],
        ),
    }
}

fn payment_where(filter: &PaymentFilter) -> (&'static str, Vec<SqlParam>) {
    match filter {
        PaymentFilter::All => ("", Vec::new()),
        PaymentFilter::Invoice(invoice_id) => {
            ("WHERE invoice_id = $1", vec![param(*invoice_id)])
        }
        PaymentFilter::Client(client_id) => {
            ("WHERE client_id = $1", vec![param(client_id.clone())])
        }
        PaymentFilter::Method(method) => (
            "WHERE payment_method = $1",
            vec![param(method.as_str().to_string())],
        ),
        PaymentFilter::DateRange { start, end } => (
            "WHERE payment_date >= $1 AND payment_date <= $2",
            vec![param(*start), param(*end)],
        ),
    }
}

// ==================== Database ====================

#[async_trait]
impl Database for PgBackend {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn BillingTransaction>, DatabaseError> {
        let client = self.pool.get().await?;
        let begin = match mode {
            TxMode::Write => "BEGIN ISOLATION LEVEL READ COMMITTED",
            TxMode::Read => "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY",
        };
        client.batch_execute(begin).await?;
        Ok(Box::new(PgTransaction {
            client: Some(client),
            mode,
        }))
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut client = self.pool.get().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applied PostgreSQL migration"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl BillingTransaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.finish("ROLLBACK").await
    }
}

// ==================== TimeEntryStore ====================

#[async_trait]
impl TimeEntryStore for PgTransaction {
    async fn get_time_entry(
        &mut self,
        id: Uuid,
    ) -> Result<Option<TimeEntryRecord>, DatabaseError> {
        let sql = format!("SELECT {} FROM time_entries WHERE id = $1", TIME_ENTRY_COLUMNS);
        let row = self.client()?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(row_to_time_entry_record).transpose()
    }

    async fn find_time_entry_by_code(
        &mut self,
        entry_code: &str,
    ) -> Result<Option<TimeEntryRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM time_entries WHERE entry_code = $1",
            TIME_ENTRY_COLUMNS
        );
        let row = self.client()?.query_opt(&sql, &[&entry_code]).await?;
        row.as_ref().map(row_to_time_entry_record).transpose()
    }

    async fn list_time_entries(
        &mut self,
        filter: &TimeEntryFilter,
    ) -> Result<Vec<TimeEntryRecord>, DatabaseError> {
        let (clause, params) = time_entry_where(filter);
        let sql = format!(
            "SELECT {} FROM time_entries {} ORDER BY entry_date ASC, entry_code ASC",
            TIME_ENTRY_COLUMNS, clause
        );
        let rows = self.client()?.query(&sql, &param_refs(&params)).await?;
        rows.iter().map(row_to_time_entry_record).collect()
    }

    async fn insert_time_entry(
        &mut self,
        input: &CreateTimeEntryParams,
    ) -> Result<TimeEntryRecord, DatabaseError> {
        let sql = format!(
            "INSERT INTO time_entries (id, entry_code, case_id, attorney_id, entry_date, hours, \
             description, activity_code, hourly_rate, billed, invoice_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, NULL) \
             RETURNING {}",
            TIME_ENTRY_COLUMNS
        );
        let row = self
            .client()?
            .query_one(
                &sql,
                &[
                    &Uuid::new_v4(),
                    &input.entry_code,
                    &input.case_id,
                    &input.attorney_id,
                    &input.entry_date,
                    &input.hours,
                    &input.description,
                    &input.activity_code.as_str(),
                    &input.hourly_rate,
                ],
            )
            .await?;
        row_to_time_entry_record(&row)
    }

    async fn update_time_entry(
        &mut self,
        record: &TimeEntryRecord,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .client()?
            .execute(
                "UPDATE time_entries SET entry_code = $2, case_id = $3, attorney_id = $4, \
                 entry_date = $5, hours = $6, description = $7, activity_code = $8, \
                 hourly_rate = $9, billed = $10, invoice_id = $11 \
                 WHERE id = $1",
                &[
                    &record.id,
                    &record.entry_code,
                    &record.case_id,
                    &record.attorney_id,
                    &record.entry_date,
                    &record.hours,
                    &record.description,
                    &record.activity_code.as_str(),
                    &record.hourly_rate,
                    &record.billed,
                    &record.invoice_id,
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_time_entries_billed(
        &mut self,
        ids: &[Uuid],
        invoice_id: Uuid,
    ) -> Result<u64, DatabaseError> {
        let ids = ids.to_vec();
        let changed = self
            .client()?
            .execute(
                "UPDATE time_entries SET billed = TRUE, invoice_id = $1 \
                 WHERE id = ANY($2) AND NOT billed",
                &[&invoice_id, &ids],
            )
            .await?;
        Ok(changed)
    }

    async fn unbill_time_entries(&mut self, invoice_id: Uuid) -> Result<u64, DatabaseError> {
        let changed = self
            .client()?
            .execute(
                "UPDATE time_entries SET billed = FALSE, invoice_id = NULL WHERE invoice_id = $1",
                &[&invoice_id],
            )
            .await?;
        Ok(changed)
    }

    async fn delete_unbilled_time_entry(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .client()?
            .execute(
                "DELETE FROM time_entries WHERE id = $1 AND NOT billed",
                &[&id],
            )
            .await?;
        Ok(changed > 0)
    }
}

// ==================== InvoiceStore ====================

#[async_trait]
impl InvoiceStore for PgTransaction {
    async fn get_invoice(&mut self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let sql = format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS);
        let row = self.client()?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(row_to_invoice_record).transpose()
    }

    async fn lock_invoice(&mut self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let sql = match self.mode {
            TxMode::Write => format!(
                "SELECT {} FROM invoices WHERE id = $1 FOR UPDATE",
                INVOICE_COLUMNS
            ),
            TxMode::Read => format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS),
        };
        let row = self.client()?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(row_to_invoice_record).transpose()
    }

    async fn find_invoice_by_number(
        &mut self,
        invoice_number: &str,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE invoice_number = $1",
            INVOICE_COLUMNS
        );
        let row = self.client()?.query_opt(&sql, &[&invoice_number]).await?;
        row.as_ref().map(row_to_invoice_record).transpose()
    }

    async fn list_invoices(
        &mut self,
        filter: &InvoiceFilter,
    ) -> Result<Vec<InvoiceRecord>, DatabaseError> {
        let (clause, params) = invoice_where(filter);
        let order = match filter {
            InvoiceFilter::OverdueAsOf(_) => "ORDER BY due_date ASC, invoice_number ASC",
            _ => "ORDER BY issue_date DESC, invoice_number DESC",
        };
        let sql = format!("SELECT {} FROM invoices {} {}", INVOICE_COLUMNS, clause, order);
        let rows = self.client()?.query(&sql, &param_refs(&params)).await?;
        rows.iter().map(row_to_invoice_record).collect()
    }

    async fn insert_invoice(
        &mut self,
        input: &CreateInvoiceParams,
    ) -> Result<InvoiceRecord, DatabaseError> {
        let sql = format!(
            "INSERT INTO invoices (id, invoice_number, client_id, case_id, issue_date, due_date, \
             amount, amount_paid, status, notes, version) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1) \
             RETURNING {}",
            INVOICE_COLUMNS
        );
        let row = self
            .client()?
            .query_one(
                &sql,
                &[
                    &Uuid::new_v4(),
                    &input.invoice_number,
                    &input.client_id,
                    &input.case_id,
                    &input.issue_date,
                    &input.due_date,
                    &input.amount,
                    &input.amount_paid,
                    &input.status.as_str(),
                    &input.notes,
                ],
            )
            .await?;
        row_to_invoice_record(&row)
    }

    async fn update_invoice(
        &mut self,
        record: &InvoiceRecord,
    ) -> Result<InvoiceRecord, DatabaseError> {
        let sql = format!(
            "UPDATE invoices SET invoice_number = $2, client_id = $3, case_id = $4, \
             issue_date = $5, due_date = $6, amount = $7, amount_paid = $8, status = $9, \
             notes = $10, version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $11 \
             RETURNING {}",
            INVOICE_COLUMNS
        );
        let row = self
            .client()?
            .query_opt(
                &sql,
                &[
                    &record.id,
                    &record.invoice_number,
                    &record.client_id,
                    &record.case_id,
                    &record.issue_date,
                    &record.due_date,
                    &record.amount,
                    &record.amount_paid,
                    &record.status.as_str(),
                    &record.notes,
                    &record.version,
                ],
            )
            .await?;
        match row {
            Some(row) => row_to_invoice_record(&row),
            None => Err(DatabaseError::Conflict(format!(
                "invoice {} changed since version {} was read",
                record.id, record.version
            ))),
        }
    }

    async fn delete_invoice(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .client()?
            .execute("DELETE FROM invoices WHERE id = $1", &[&id])
            .await?;
        Ok(changed > 0)
    }
}

// ==================== PaymentStore ====================

#[async_trait]
impl PaymentStore for PgTransaction {
    async fn get_payment(&mut self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let row = self.client()?.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(row_to_payment_record).transpose()
    }

    async fn find_payment_by_number(
        &mut self,
        payment_number: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payments WHERE payment_number = $1",
            PAYMENT_COLUMNS
        );
        let row = self.client()?.query_opt(&sql, &[&payment_number]).await?;
        row.as_ref().map(row_to_payment_record).transpose()
    }

    async fn list_payments(
        &mut self,
        filter: &PaymentFilter,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let (clause, params) = payment_where(filter);
        let sql = format!(
            "SELECT {} FROM payments {} ORDER BY payment_date DESC, payment_number DESC",
            PAYMENT_COLUMNS, clause
        );
        let rows = self.client()?.query(&sql, &param_refs(&params)).await?;
        rows.iter().map(row_to_payment_record).collect()
    }

    async fn insert_payment(
        &mut self,
        input: &CreatePaymentParams,
    ) -> Result<PaymentRecord, DatabaseError> {
        let sql = format!(
            "INSERT INTO payments (id, payment_number, invoice_id, client_id, payment_date, \
             amount, payment_method, reference, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {}",
            PAYMENT_COLUMNS
        );
        let row = self
            .client()?
            .query_one(
                &sql,
                &[
                    &Uuid::new_v4(),
                    &input.payment_number,
                    &input.invoice_id,
                    &input.client_id,
                    &input.payment_date,
                    &input.amount,
                    &input.method.as_str(),
                    &input.reference,
                    &input.notes,
                ],
            )
            .await?;
        row_to_payment_record(&row)
    }

    async fn update_payment(&mut self, record: &PaymentRecord) -> Result<bool, DatabaseError> {
        let changed = self
            .client()?
            .execute(
                "UPDATE payments SET payment_number = $2, invoice_id = $3, client_id = $4, \
                 payment_date = $5, amount = $6, payment_method = $7, reference = $8, notes = $9 \
                 WHERE id = $1",
                &[
                    &record.id,
                    &record.payment_number,
                    &record.invoice_id,
                    &record.client_id,
                    &record.payment_date,
                    &record.amount,
                    &record.method.as_str(),
                    &record.reference,
                    &record.notes,
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete_payment(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .client()?
            .execute("DELETE FROM payments WHERE id = $1", &[&id])
            .await?;
        Ok(changed > 0)
    }
}

// ==================== SequenceStore ====================

#[async_trait]
impl SequenceStore for PgTransaction {
    async fn max_sequence_value(&mut self, kind: SequenceKind) -> Result<u64, DatabaseError> {
        let (table, column) = match kind {
            SequenceKind::Invoice => ("invoices", "invoice_number"),
            SequenceKind::Payment => ("payments", "payment_number"),
            SequenceKind::TimeEntry => ("time_entries", "entry_code"),
        };
        let prefix = kind.prefix();
        let client = self.client()?;

        if self.mode == TxMode::Write {
            client
                .execute(
                    "SELECT pg_advisory_xact_lock(hashtext($1))",
                    &[&format!("casebill:{}", prefix)],
                )
                .await?;
        }

        let sql = format!(
            "SELECT MAX(CAST(SUBSTRING({column} FROM {start}) AS BIGINT)) FROM {table} \
             WHERE {column} ~ '^{prefix}[0-9]+$'",
            column = column,
            start = prefix.len() + 1,
            table = table,
            prefix = prefix,
        );
        let row = client.query_one(&sql, &[]).await?;
        let max: Option<i64> = row.get(0);
        Ok(max.and_then(|n| u64::try_from(n).ok()).unwrap_or(0))
    }
}
