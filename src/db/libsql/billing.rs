use async_trait::async_trait;
use libsql::params;
use libsql::params::Params;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::{
    ActivityCode, CreateInvoiceParams, CreatePaymentParams, CreateTimeEntryParams, InvoiceFilter,
    InvoiceRecord, InvoiceStatus, InvoiceStore, PaymentFilter, PaymentMethod, PaymentRecord,
    PaymentStore, SequenceKind, SequenceStore, TimeEntryFilter, TimeEntryRecord, TimeEntryStore,
};
use crate::error::DatabaseError;

use super::{
    LibSqlTransaction, fmt_date, get_i64, get_opt_text, get_text, opt_text, parse_date,
    parse_decimal, parse_uuid, text,
};

const TIME_ENTRY_COLUMNS: &str = "id, entry_code, case_id, attorney_id, entry_date, hours, \
     description, activity_code, hourly_rate, billed, invoice_id";

const INVOICE_COLUMNS: &str = "id, invoice_number, client_id, case_id, issue_date, due_date, \
     amount, amount_paid, status, notes, version";

const PAYMENT_COLUMNS: &str = "id, payment_number, invoice_id, client_id, payment_date, amount, \
     payment_method, reference, notes";

fn row_to_time_entry_record(row: &libsql::Row) -> Result<TimeEntryRecord, DatabaseError> {
    let activity_raw = get_text(row, 7);
    let activity_code = ActivityCode::from_db_value(&activity_raw).ok_or_else(|| {
        DatabaseError::Serialization(format!("invalid activity_code '{}'", activity_raw))
    })?;
    Ok(TimeEntryRecord {
        id: parse_uuid(&get_text(row, 0), "time_entries.id")?,
        entry_code: get_text(row, 1),
        case_id: get_text(row, 2),
        attorney_id: get_text(row, 3),
        entry_date: parse_date(&get_text(row, 4), "entry_date")?,
        hours: parse_decimal(&get_text(row, 5), "hours")?,
        description: get_text(row, 6),
        activity_code,
        hourly_rate: get_opt_text(row, 8)
            .map(|raw| parse_decimal(&raw, "hourly_rate"))
            .transpose()?,
        billed: get_i64(row, 9) != 0,
        invoice_id: get_opt_text(row, 10)
            .map(|raw| parse_uuid(&raw, "time_entries.invoice_id"))
            .transpose()?,
    })
}

fn row_to_invoice_record(row: &libsql::Row) -> Result<InvoiceRecord, DatabaseError> {
    let status_raw = get_text(row, 8);
    let status = InvoiceStatus::from_db_value(&status_raw).ok_or_else(|| {
        DatabaseError::Serialization(format!("invalid invoice status '{}'", status_raw))
    })?;
    Ok(InvoiceRecord {
        id: parse_uuid(&get_text(row, 0), "invoices.id")?,
        invoice_number: get_text(row, 1),
        client_id: get_text(row, 2),
        case_id: get_text(row, 3),
        issue_date: parse_date(&get_text(row, 4), "issue_date")?,
        due_date: parse_date(&get_text(row, 5), "due_date")?,
        amount: parse_decimal(&get_text(row, 6), "amount")?,
        amount_paid: parse_decimal(&get_text(row, 7), "amount_paid")?,
        status,
        notes: get_opt_text(row, 9),
        version: get_i64(row, 10),
    })
}

fn row_to_payment_record(row: &libsql::Row) -> Result<PaymentRecord, DatabaseError> {
    let method_raw = get_text(row, 6);
    let method = PaymentMethod::from_db_value(&method_raw).ok_or_else(|| {
        DatabaseError::Serialization(format!("invalid payment_method '{}'", method_raw))
    })?;
    Ok(PaymentRecord {
        id: parse_uuid(&get_text(row, 0), "payments.id")?,
        payment_number: get_text(row, 1),
        invoice_id: parse_uuid(&get_text(row, 2), "payments.invoice_id")?,
        client_id: get_text(row, 3),
        payment_date: parse_date(&get_text(row, 4), "payment_date")?,
        amount: parse_decimal(&get_text(row, 5), "amount")?,
        method,
        reference: get_opt_text(row, 7),
        notes: get_opt_text(row, 8),
    })
}

fn opt_decimal(value: Option<Decimal>) -> libsql::Value {
    match value {
        Some(d) => libsql::Value::Text(d.to_string()),
        None => libsql::Value::Null,
    }
}

fn time_entry_where(filter: &TimeEntryFilter) -> (&'static str, Vec<libsql::Value>) {
    match filter {
        TimeEntryFilter::All => ("", Vec::new()),
        TimeEntryFilter::Case(case_id) => ("WHERE case_id = ?1", vec![text(case_id.as_str())]),
        TimeEntryFilter::UnbilledForCase(case_id) => (
            "WHERE case_id = ?1 AND billed = 0",
            vec![text(case_id.as_str())],
        ),
        TimeEntryFilter::Attorney(attorney_id) => (
            "WHERE attorney_id = ?1",
            vec![text(attorney_id.as_str())],
        ),
        TimeEntryFilter::Invoice(invoice_id) => {
            ("WHERE invoice_id = ?1", vec![text(invoice_id.to_string())])
        }
        TimeEntryFilter::DateRange { start, end } => (
            "WHERE entry_date >= ?1 AND entry_date <= ?2",
            vec![text(fmt_date(*start)), text(fmt_date(*end))],
        ),
    }
}

fn invoice_where(filter: &InvoiceFilter) -> (&'static str, Vec<libsql::Value>) {
    match filter {
        InvoiceFilter::All => ("", Vec::new()),
        InvoiceFilter::Client(client_id) => {
            ("WHERE client_id = ?1", vec![text(client_id.as_str())])
        }
        InvoiceFilter::Case(case_id) => ("WHERE case_id = ?1", vec![text(case_id.as_str())]),
        InvoiceFilter::Status(status) => ("WHERE status = ?1", vec![text(status.as_str())]),
        InvoiceFilter::IssuedBetween { start, end } => (
            "WHERE issue_date >= ?1 AND issue_date <= ?2",
            vec![text(fmt_date(*start)), text(fmt_date(*end))],
        ),
        InvoiceFilter::OverdueAsOf(today) => (
            "WHERE due_date < ?1 AND status NOT IN ('paid', 'cancelled')",
            vec![text(fmt_date(*today))],
        ),
    }
}

fn payment_where(filter: &PaymentFilter) -> (&'static str, Vec<libsql::Value>) {
    match filter {
        PaymentFilter::All => ("", Vec::new()),
        PaymentFilter::Invoice(invoice_id) => {
            ("WHERE invoice_id = ?1", vec![text(invoice_id.to_string())])
        }
        PaymentFilter::Client(client_id) => {
            ("WHERE client_id = ?1", vec![text(client_id.as_str())])
        }
        PaymentFilter::Method(method) => {
            ("WHERE payment_method = ?1", vec![text(method.as_str())])
        }
        PaymentFilter::DateRange { start, end } => (
            "WHERE payment_date >= ?1 AND payment_date <= ?2",
            vec![text(fmt_date(*start)), text(fmt_date(*end))],
        ),
    }
}

impl LibSqlTransaction {
    async fn time_entry_where_id(
        &self,
        clause: &str,
        value: String,
    ) -> Result<Option<TimeEntryRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM time_entries WHERE {} = ?1 LIMIT 1",
            TIME_ENTRY_COLUMNS, clause
        );
        let mut rows = self.conn.query(&sql, params![value]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_time_entry_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn invoice_where_id(
        &self,
        clause: &str,
        value: String,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE {} = ?1 LIMIT 1",
            INVOICE_COLUMNS, clause
        );
        let mut rows = self.conn.query(&sql, params![value]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_invoice_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn payment_where_id(
        &self,
        clause: &str,
        value: String,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM payments WHERE {} = ?1 LIMIT 1",
            PAYMENT_COLUMNS, clause
        );
        let mut rows = self.conn.query(&sql, params![value]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_payment_record(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TimeEntryStore for LibSqlTransaction {
    async fn get_time_entry(
        &mut self,
        id: Uuid,
    ) -> Result<Option<TimeEntryRecord>, DatabaseError> {
        self.time_entry_where_id("id", id.to_string()).await
    }

    async fn find_time_entry_by_code(
        &mut self,
        entry_code: &str,
    ) -> Result<Option<TimeEntryRecord>, DatabaseError> {
        self.time_entry_where_id("entry_code", entry_code.to_string())
            .await
    }

    async fn list_time_entries(
        &mut self,
        filter: &TimeEntryFilter,
    ) -> Result<Vec<TimeEntryRecord>, DatabaseError> {
        let (clause, values) = time_entry_where(filter);
        let sql = format!(
            "SELECT {} FROM time_entries {} ORDER BY entry_date ASC, entry_code ASC",
            TIME_ENTRY_COLUMNS, clause
        );
        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_time_entry_record(&row)?);
        }
        Ok(out)
    }

    async fn insert_time_entry(
        &mut self,
        input: &CreateTimeEntryParams,
    ) -> Result<TimeEntryRecord, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO time_entries (id, entry_code, case_id, attorney_id, entry_date, hours, \
                 description, activity_code, hourly_rate, billed, invoice_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL)",
                params![
                    id.to_string(),
                    input.entry_code.as_str(),
                    input.case_id.as_str(),
                    input.attorney_id.as_str(),
                    fmt_date(input.entry_date),
                    input.hours.to_string(),
                    input.description.as_str(),
                    input.activity_code.as_str(),
                    opt_decimal(input.hourly_rate),
                ],
            )
            .await?;

        self.time_entry_where_id("id", id.to_string())
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created time entry".to_string()))
    }

    async fn update_time_entry(
        &mut self,
        record: &TimeEntryRecord,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE time_entries SET entry_code = ?2, case_id = ?3, attorney_id = ?4, \
                 entry_date = ?5, hours = ?6, description = ?7, activity_code = ?8, \
                 hourly_rate = ?9, billed = ?10, invoice_id = ?11 \
                 WHERE id = ?1",
                params![
                    record.id.to_string(),
                    record.entry_code.as_str(),
                    record.case_id.as_str(),
                    record.attorney_id.as_str(),
                    fmt_date(record.entry_date),
                    record.hours.to_string(),
                    record.description.as_str(),
                    record.activity_code.as_str(),
                    opt_decimal(record.hourly_rate),
                    i64::from(record.billed),
                    opt_text(record.invoice_id.map(|id| id.to_string()).as_deref()),
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
        let mut changed = 0;
        for id in ids {
            changed += self
                .conn
                .execute(
                    "UPDATE time_entries SET billed = 1, invoice_id = ?1 \
                     WHERE id = ?2 AND billed = 0",
                    params![invoice_id.to_string(), id.to_string()],
                )
                .await?;
        }
        Ok(changed)
    }

    async fn unbill_time_entries(&mut self, invoice_id: Uuid) -> Result<u64, DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE time_entries SET billed = 0, invoice_id = NULL WHERE invoice_id = ?1",
                params![invoice_id.to_string()],
            )
            .await?;
        Ok(changed)
    }

    async fn delete_unbilled_time_entry(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM time_entries WHERE id = ?1 AND billed = 0",
                params![id.to_string()],
            )
            .await?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl InvoiceStore for LibSqlTransaction {
    async fn get_invoice(&mut self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        self.invoice_where_id("id", id.to_string()).await
    }

    async fn lock_invoice(&mut self, id: Uuid) -> Result<Option<InvoiceRecord>, DatabaseError> {
        // BEGIN IMMEDIATE already holds the database write lock.
        self.invoice_where_id("id", id.to_string()).await
    }

    async fn find_invoice_by_number(
        &mut self,
        invoice_number: &str,
    ) -> Result<Option<InvoiceRecord>, DatabaseError> {
        self.invoice_where_id("invoice_number", invoice_number.to_string())
            .await
    }

    async fn list_invoices(
        &mut self,
        filter: &InvoiceFilter,
    ) -> Result<Vec<InvoiceRecord>, DatabaseError> {
        let (clause, values) = invoice_where(filter);
        let order = match filter {
            InvoiceFilter::OverdueAsOf(_) => "ORDER BY due_date ASC, invoice_number ASC",
            _ => "ORDER BY issue_date DESC, invoice_number DESC",
        };
        let sql = format!("SELECT {} FROM invoices {} {}", INVOICE_COLUMNS, clause, order);
        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_invoice_record(&row)?);
        }
        Ok(out)
    }

    async fn insert_invoice(
        &mut self,
        input: &CreateInvoiceParams,
    ) -> Result<InvoiceRecord, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO invoices (id, invoice_number, client_id, case_id, issue_date, due_date, \
                 amount, amount_paid, status, notes, version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
                params![
                    id.to_string(),
                    input.invoice_number.as_str(),
                    input.client_id.as_str(),
                    input.case_id.as_str(),
                    fmt_date(input.issue_date),
                    fmt_date(input.due_date),
                    input.amount.to_string(),
                    input.amount_paid.to_string(),
                    input.status.as_str(),
                    opt_text(input.notes.as_deref()),
                ],
            )
            .await?;

        self.invoice_where_id("id", id.to_string())
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created invoice".to_string()))
    }

    async fn update_invoice(
        &mut self,
        record: &InvoiceRecord,
    ) -> Result<InvoiceRecord, DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE invoices SET invoice_number = ?2, client_id = ?3, case_id = ?4, \
                 issue_date = ?5, due_date = ?6, amount = ?7, amount_paid = ?8, status = ?9, \
                 notes = ?10, version = version + 1 \
                 WHERE id = ?1 AND version = ?11",
                params![
                    record.id.to_string(),
                    record.invoice_number.as_str(),
                    record.client_id.as_str(),
                    record.case_id.as_str(),
                    fmt_date(record.issue_date),
                    fmt_date(record.due_date),
                    record.amount.to_string(),
                    record.amount_paid.to_string(),
                    record.status.as_str(),
                    opt_text(record.notes.as_deref()),
                    record.version,
                ],
            )
            .await?;

        if changed == 0 {
            return Err(DatabaseError::Conflict(format!(
                "invoice {} changed since version {} was read",
                record.id, record.version
            )));
        }

        self.invoice_where_id("id", record.id.to_string())
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to reload updated invoice".to_string()))
    }

    async fn delete_invoice(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn
            .execute("DELETE FROM invoices WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl PaymentStore for LibSqlTransaction {
    async fn get_payment(&mut self, id: Uuid) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.payment_where_id("id", id.to_string()).await
    }

    async fn find_payment_by_number(
        &mut self,
        payment_number: &str,
    ) -> Result<Option<PaymentRecord>, DatabaseError> {
        self.payment_where_id("payment_number", payment_number.to_string())
            .await
    }

    async fn list_payments(
        &mut self,
        filter: &PaymentFilter,
    ) -> Result<Vec<PaymentRecord>, DatabaseError> {
        let (clause, values) = payment_where(filter);
        let sql = format!(
            "SELECT {} FROM payments {} ORDER BY payment_date DESC, payment_number DESC",
            PAYMENT_COLUMNS, clause
        );
        let mut rows = self.conn.query(&sql, Params::Positional(values)).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_payment_record(&row)?);
        }
        Ok(out)
    }

    async fn insert_payment(
        &mut self,
        input: &CreatePaymentParams,
    ) -> Result<PaymentRecord, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO payments (id, payment_number, invoice_id, client_id, payment_date, \
                 amount, payment_method, reference, notes) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    input.payment_number.as_str(),
                    input.invoice_id.to_string(),
                    input.client_id.as_str(),
                    fmt_date(input.payment_date),
                    input.amount.to_string(),
                    input.method.as_str(),
                    opt_text(input.reference.as_deref()),
                    opt_text(input.notes.as_deref()),
                ],
            )
            .await?;

        self.payment_where_id("id", id.to_string())
            .await?
            .ok_or_else(|| DatabaseError::Query("failed to load created payment".to_string()))
    }

    async fn update_payment(&mut self, record: &PaymentRecord) -> Result<bool, DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE payments SET payment_number = ?2, invoice_id = ?3, client_id = ?4, \
                 payment_date = ?5, amount = ?6, payment_method = ?7, reference = ?8, notes = ?9 \
                 WHERE id = ?1",
                params![
                    record.id.to_string(),
                    record.payment_number.as_str(),
                    record.invoice_id.to_string(),
                    record.client_id.as_str(),
                    fmt_date(record.payment_date),
                    record.amount.to_string(),
                    record.method.as_str(),
                    opt_text(record.reference.as_deref()),
                    opt_text(record.notes.as_deref()),
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete_payment(&mut self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn
            .execute("DELETE FROM payments WHERE id = ?1", params![id.to_string()])
            .await?;
        Ok(changed > 0)
    }
}

#[async_trait]
impl SequenceStore for LibSqlTransaction {
    async fn max_sequence_value(&mut self, kind: SequenceKind) -> Result<u64, DatabaseError> {
        let (table, column) = match kind {
            SequenceKind::Invoice => ("invoices", "invoice_number"),
            SequenceKind::Payment => ("payments", "payment_number"),
            SequenceKind::TimeEntry => ("time_entries", "entry_code"),
        };
        let prefix = kind.prefix();
        let sql = format!(
            "SELECT MAX(CAST(SUBSTR({column}, {start}) AS INTEGER)) FROM {table} \
             WHERE {column} GLOB '{prefix}[0-9]*' \
               AND SUBSTR({column}, {start}) NOT GLOB '*[^0-9]*'",
            column = column,
            start = prefix.len() + 1,
            table = table,
            prefix = prefix,
        );
        let mut rows = self.conn.query(&sql, ()).await?;
        let Some(row) = rows.next().await? else {
            return Ok(0);
        };
        match row.get_value(0)? {
            libsql::Value::Integer(n) => Ok(u64::try_from(n).unwrap_or(0)),
            libsql::Value::Null => Ok(0),
            other => Err(DatabaseError::Serialization(format!(
                "unexpected {} sequence value: {:?}",
                prefix, other
            ))),
        }
    }
}
