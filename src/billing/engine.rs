//! Reconciliation engine.
//!
//! Every public operation is one `with_transaction` call. The `*_tx`
//! functions hold the operation bodies; they take the open transaction plus
//! owned inputs so the boxed future can outlive the caller's borrows.
//!
//! After any write that touches an invoice's entries, payments, or dates the
//! invoice is reconciled inside the same transaction: `amount` is re-summed
//! from its time entries, `amount_paid` from its payments, and the status is
//! re-derived. The invoice row is written with a version check.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::money::{
    Clock, MAX_AMOUNT, MAX_ENTRY_HOURS, MAX_HOURLY_RATE, SystemClock, add_days, checked_sum,
    line_amount, round_money,
};
use crate::billing::sequence::mint;
use crate::billing::status::derive_for;
use crate::billing::unit_of_work::with_transaction;
use crate::config::BillingConfig;
use crate::db::{
    ActivityCode, BillingTransaction, CreateInvoiceParams, CreatePaymentParams,
    CreateTimeEntryParams, Database, InvoiceFilter, InvoiceRecord, InvoiceStatus, InvoiceStore,
    PaymentFilter, PaymentMethod, PaymentRecord, PaymentStore, SequenceKind, TimeEntryFilter,
    TimeEntryRecord, TimeEntryStore, TxMode,
};
use crate::directory::{CaseRef, PracticeDirectory};
use crate::error::BillingError;

/// Input for `log_time_entry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTimeEntryRequest {
    pub case_id: String,
    pub attorney_id: String,
    pub hours: Decimal,
    pub description: String,
    pub activity_code: ActivityCode,
    /// Defaults to today.
    #[serde(default)]
    pub entry_date: Option<NaiveDate>,
    /// Defaults to the attorney's rate.
    #[serde(default)]
    pub hourly_rate: Option<Decimal>,
    /// Defaults to a minted `TE` code.
    #[serde(default)]
    pub entry_code: Option<String>,
}

/// Field changes for `update_time_entry`. `None` leaves a field alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeEntryChanges {
    pub case_id: Option<String>,
    pub attorney_id: Option<String>,
    pub entry_date: Option<NaiveDate>,
    pub hours: Option<Decimal>,
    pub description: Option<String>,
    pub activity_code: Option<ActivityCode>,
    /// `Some(None)` clears the rate.
    pub hourly_rate: Option<Option<Decimal>>,
}

/// Input for `create_invoice`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    pub case_id: String,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// `Draft` or `Issued`.
    pub status: InvoiceStatus,
    #[serde(default)]
    pub notes: Option<String>,
    /// Unbilled entries of the case to bill on the new invoice.
    #[serde(default)]
    pub time_entry_ids: Vec<Uuid>,
}

/// Field changes for `update_invoice`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceChanges {
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    /// `Some(None)` clears the notes.
    pub notes: Option<Option<String>>,
    /// Reject the update with `Conflict` unless the stored version matches.
    pub expected_version: Option<i64>,
}

/// Input for `record_payment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPaymentRequest {
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub method: PaymentMethod,
    /// Defaults to today.
    #[serde(default)]
    pub payment_date: Option<NaiveDate>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Field changes for `update_payment`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaymentChanges {
    pub payment_date: Option<NaiveDate>,
    pub amount: Option<Decimal>,
    pub method: Option<PaymentMethod>,
    pub reference: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

/// Billing operations over an injected store and practice directory.
pub struct BillingEngine {
    pub(crate) db: Arc<dyn Database>,
    pub(crate) directory: Arc<dyn PracticeDirectory>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: BillingConfig,
}

impl BillingEngine {
    pub fn new(
        db: Arc<dyn Database>,
        directory: Arc<dyn PracticeDirectory>,
        config: BillingConfig,
    ) -> Self {
        Self {
            db,
            directory,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the clock used for "today".
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    pub(crate) async fn require_case(&self, case_id: &str) -> Result<CaseRef, BillingError> {
        self.directory
            .find_case(case_id)
            .await?
            .ok_or_else(|| BillingError::not_found("case", case_id))
    }

    pub(crate) async fn client_name(&self, client_id: &str) -> Result<Option<String>, BillingError> {
        Ok(self
            .directory
            .find_client(client_id)
            .await?
            .map(|client| client.name))
    }

    fn default_due_date(&self, issue_date: NaiveDate) -> NaiveDate {
        add_days(issue_date, self.config.default_due_days)
    }

    // ==================== Time entries ====================

    /// Record a unit of billable work.
    pub async fn log_time_entry(
        &self,
        request: LogTimeEntryRequest,
    ) -> Result<TimeEntryRecord, BillingError> {
        validate_hours(request.hours)?;
        validate_rate(request.hourly_rate)?;
        let entry_code = normalize_number(request.entry_code.as_deref(), "entry code")?;

        self.require_case(&request.case_id).await?;
        let attorney = self
            .directory
            .find_attorney(&request.attorney_id)
            .await?
            .ok_or_else(|| BillingError::not_found("attorney", &request.attorney_id))?;
        let hourly_rate = request.hourly_rate.or(attorney.hourly_rate);
        validate_rate(hourly_rate)?;

        let params = CreateTimeEntryParams {
            entry_code: entry_code.unwrap_or_default(),
            case_id: request.case_id,
            attorney_id: request.attorney_id,
            entry_date: request.entry_date.unwrap_or_else(|| self.today()),
            hours: request.hours,
            description: request.description.trim().to_string(),
            activity_code: request.activity_code,
            hourly_rate,
        };

        let entry = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(log_time_entry_tx(tx, params))
        })
        .await?;

        tracing::info!(
            time_entry = %entry.entry_code,
            case_id = %entry.case_id,
            hours = %entry.hours,
            "Logged time entry"
        );
        Ok(entry)
    }

    /// Edit a time entry. Billed entries keep their case, attorney, hours,
    /// and rate until they are detached from their invoice.
    pub async fn update_time_entry(
        &self,
        time_entry_id: Uuid,
        changes: TimeEntryChanges,
    ) -> Result<TimeEntryRecord, BillingError> {
        if let Some(hours) = changes.hours {
            validate_hours(hours)?;
        }
        if let Some(rate) = changes.hourly_rate {
            validate_rate(rate)?;
        }
        if let Some(case_id) = changes.case_id.as_deref() {
            self.require_case(case_id).await?;
        }
        if let Some(attorney_id) = changes.attorney_id.as_deref()
            && self.directory.find_attorney(attorney_id).await?.is_none()
        {
            return Err(BillingError::not_found("attorney", attorney_id));
        }

        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(update_time_entry_tx(tx, time_entry_id, changes))
        })
        .await
    }

    /// Delete an unbilled time entry.
    pub async fn delete_time_entry(&self, time_entry_id: Uuid) -> Result<(), BillingError> {
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(delete_time_entry_tx(tx, time_entry_id))
        })
        .await?;
        tracing::info!(%time_entry_id, "Deleted time entry");
        Ok(())
    }

    // ==================== Invoices ====================

    /// Bill every unbilled time entry of a case on a new invoice.
    pub async fn bill_time_entries(
        &self,
        case_id: &str,
        invoice_number: Option<&str>,
        due_date: Option<NaiveDate>,
    ) -> Result<InvoiceRecord, BillingError> {
        let case = self.require_case(case_id).await?;
        let invoice_number = normalize_number(invoice_number, "invoice number")?;
        let today = self.today();
        let due_date = due_date.unwrap_or_else(|| self.default_due_date(today));
        validate_dates(today, due_date)?;

        let invoice = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(bill_time_entries_tx(
                tx,
                case,
                invoice_number,
                today,
                due_date,
            ))
        })
        .await?;

        tracing::info!(
            invoice = %invoice.invoice_number,
            case_id = %invoice.case_id,
            amount = %invoice.amount,
            status = invoice.status.as_str(),
            "Billed time entries"
        );
        Ok(invoice)
    }

    /// Create an invoice directly, optionally billing a chosen set of
    /// unbilled entries of the case.
    pub async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<InvoiceRecord, BillingError> {
        if !matches!(request.status, InvoiceStatus::Draft | InvoiceStatus::Issued) {
            return Err(BillingError::InvalidInput(format!(
                "new invoices must be draft or issued, not {}",
                request.status.as_str()
            )));
        }
        let case = self.require_case(&request.case_id).await?;
        let invoice_number = normalize_number(request.invoice_number.as_deref(), "invoice number")?;
        let today = self.today();
        let issue_date = request.issue_date.unwrap_or(today);
        let due_date = request
            .due_date
            .unwrap_or_else(|| self.default_due_date(issue_date));
        validate_dates(issue_date, due_date)?;

        let draft = DraftInvoice {
            case,
            invoice_number,
            issue_date,
            due_date,
            status: request.status,
            notes: clean_text(request.notes),
            time_entry_ids: dedupe(request.time_entry_ids),
        };

        let invoice = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(create_invoice_tx(tx, draft, today))
        })
        .await?;

        tracing::info!(
            invoice = %invoice.invoice_number,
            amount = %invoice.amount,
            status = invoice.status.as_str(),
            "Created invoice"
        );
        Ok(invoice)
    }

    /// Bill additional unbilled entries of the invoice's case on it.
    pub async fn attach_time_entries(
        &self,
        invoice_id: Uuid,
        time_entry_ids: Vec<Uuid>,
    ) -> Result<InvoiceRecord, BillingError> {
        if time_entry_ids.is_empty() {
            return Err(BillingError::InvalidInput(
                "no time entries given to attach".to_string(),
            ));
        }
        let ids = dedupe(time_entry_ids);
        let today = self.today();
        let invoice = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(attach_time_entries_tx(tx, invoice_id, ids, today))
        })
        .await?;
        tracing::info!(
            invoice = %invoice.invoice_number,
            amount = %invoice.amount,
            "Attached time entries"
        );
        Ok(invoice)
    }

    /// Return a billed entry to the unbilled pool.
    pub async fn detach_time_entry(
        &self,
        time_entry_id: Uuid,
    ) -> Result<InvoiceRecord, BillingError> {
        let today = self.today();
        let invoice = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(detach_time_entry_tx(tx, time_entry_id, today))
        })
        .await?;
        tracing::info!(
            invoice = %invoice.invoice_number,
            amount = %invoice.amount,
            %time_entry_id,
            "Detached time entry"
        );
        Ok(invoice)
    }

    /// Change dates or notes. Amounts and status are never caller-set.
    pub async fn update_invoice(
        &self,
        invoice_id: Uuid,
        changes: InvoiceChanges,
    ) -> Result<InvoiceRecord, BillingError> {
        let today = self.today();
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(update_invoice_tx(tx, invoice_id, changes, today))
        })
        .await
    }

    /// Move a draft invoice into the derived lifecycle.
    pub async fn issue_invoice(&self, invoice_id: Uuid) -> Result<InvoiceRecord, BillingError> {
        let today = self.today();
        let invoice = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(issue_invoice_tx(tx, invoice_id, today))
        })
        .await?;
        tracing::info!(
            invoice = %invoice.invoice_number,
            status = invoice.status.as_str(),
            "Issued invoice"
        );
        Ok(invoice)
    }

    /// Cancel an invoice that is neither paid nor already cancelled. Its time
    /// entries stay billed on it.
    pub async fn cancel_invoice(&self, invoice_id: Uuid) -> Result<InvoiceRecord, BillingError> {
        let today = self.today();
        let invoice = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(cancel_invoice_tx(tx, invoice_id, today))
        })
        .await?;
        tracing::info!(invoice = %invoice.invoice_number, "Cancelled invoice");
        Ok(invoice)
    }

    /// Delete an invoice without payments and unbill its time entries.
    pub async fn delete_invoice(&self, invoice_id: Uuid) -> Result<(), BillingError> {
        let unbilled = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(delete_invoice_tx(tx, invoice_id))
        })
        .await?;
        tracing::info!(%invoice_id, unbilled, "Deleted invoice");
        Ok(())
    }

    /// Re-derive one invoice's status against today and persist it.
    pub async fn refresh_invoice_status(
        &self,
        invoice_id: Uuid,
    ) -> Result<InvoiceRecord, BillingError> {
        let today = self.today();
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(refresh_invoice_tx(tx, invoice_id, today))
        })
        .await
    }

    /// Re-derive every open invoice. Returns the invoices that changed.
    pub async fn refresh_overdue_invoices(&self) -> Result<Vec<InvoiceRecord>, BillingError> {
        let today = self.today();
        let changed = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(refresh_all_tx(tx, today))
        })
        .await?;
        if !changed.is_empty() {
            tracing::info!(count = changed.len(), "Refreshed invoice statuses");
        }
        Ok(changed)
    }

    // ==================== Payments ====================

    /// Record cash received against an invoice.
    pub async fn record_payment(
        &self,
        request: RecordPaymentRequest,
    ) -> Result<PaymentRecord, BillingError> {
        let amount = validate_payment_amount(request.amount)?;
        let today = self.today();
        let params = PendingPayment {
            invoice_id: request.invoice_id,
            payment_date: request.payment_date.unwrap_or(today),
            amount,
            method: request.method,
            reference: clean_text(request.reference),
            notes: clean_text(request.notes),
        };

        let payment = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(record_payment_tx(tx, params, today))
        })
        .await?;

        tracing::info!(
            payment = %payment.payment_number,
            invoice_id = %payment.invoice_id,
            amount = %payment.amount,
            method = payment.method.as_str(),
            "Recorded payment"
        );
        Ok(payment)
    }

    /// Delete a payment and reconcile its invoice. Returns the invoice.
    pub async fn delete_payment(&self, payment_id: Uuid) -> Result<InvoiceRecord, BillingError> {
        let today = self.today();
        let invoice = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(delete_payment_tx(tx, payment_id, today))
        })
        .await?;
        tracing::info!(
            %payment_id,
            invoice = %invoice.invoice_number,
            amount_paid = %invoice.amount_paid,
            status = invoice.status.as_str(),
            "Deleted payment"
        );
        Ok(invoice)
    }

    /// Edit a payment. Amount changes reconcile the invoice.
    pub async fn update_payment(
        &self,
        payment_id: Uuid,
        changes: PaymentChanges,
    ) -> Result<PaymentRecord, BillingError> {
        let amount = changes.amount.map(validate_payment_amount).transpose()?;
        let changes = PaymentChanges { amount, ..changes };
        let today = self.today();
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(update_payment_tx(tx, payment_id, changes, today))
        })
        .await
    }
}

// ==================== Validation ====================

fn validate_hours(hours: Decimal) -> Result<(), BillingError> {
    if hours.is_sign_negative() && !hours.is_zero() {
        return Err(BillingError::InvalidInput(format!(
            "hours must not be negative, got {hours}"
        )));
    }
    if hours > MAX_ENTRY_HOURS {
        return Err(BillingError::InvalidInput(format!(
            "hours must be at most {MAX_ENTRY_HOURS}, got {hours}"
        )));
    }
    Ok(())
}

fn validate_rate(rate: Option<Decimal>) -> Result<(), BillingError> {
    match rate {
        Some(rate) if rate.is_sign_negative() && !rate.is_zero() => Err(
            BillingError::InvalidAmount(format!("hourly rate must not be negative, got {rate}")),
        ),
        Some(rate) if rate > MAX_HOURLY_RATE => Err(BillingError::InvalidAmount(format!(
            "hourly rate must be at most {MAX_HOURLY_RATE}, got {rate}"
        ))),
        _ => Ok(()),
    }
}

fn validate_payment_amount(amount: Decimal) -> Result<Decimal, BillingError> {
    let rounded = round_money(amount);
    if rounded <= Decimal::ZERO {
        return Err(BillingError::InvalidAmount(format!(
            "payment amount must be greater than 0, got {amount}"
        )));
    }
    if rounded > MAX_AMOUNT {
        return Err(BillingError::InvalidAmount(format!(
            "payment amount must be at most {MAX_AMOUNT}, got {amount}"
        )));
    }
    Ok(rounded)
}

fn validate_dates(issue_date: NaiveDate, due_date: NaiveDate) -> Result<(), BillingError> {
    if due_date < issue_date {
        return Err(BillingError::InvalidInput(format!(
            "due date {due_date} is before issue date {issue_date}"
        )));
    }
    Ok(())
}

fn normalize_number(raw: Option<&str>, what: &str) -> Result<Option<String>, BillingError> {
    match raw.map(str::trim) {
        None => Ok(None),
        Some("") => Err(BillingError::InvalidInput(format!("{what} must not be empty"))),
        Some(value) => Ok(Some(value.to_string())),
    }
}

fn clean_text(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn dedupe(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

// ==================== Reconciliation ====================

/// Sum of line amounts of the given entries.
pub(crate) fn sum_line_amounts<'a>(
    entries: impl IntoIterator<Item = &'a TimeEntryRecord>,
) -> Result<Decimal, BillingError> {
    entries.into_iter().try_fold(Decimal::ZERO, |acc, e| {
        line_amount(e.hours, e.hourly_rate)
            .and_then(|line| acc.checked_add(line))
            .ok_or_else(|| {
                BillingError::InvalidAmount(format!(
                    "billing total overflows at time entry {}",
                    e.entry_code
                ))
            })
    })
}

/// Reject totals the stores cannot hold.
fn within_amount_limit(amount: Decimal, what: &str) -> Result<Decimal, BillingError> {
    if amount > MAX_AMOUNT {
        return Err(BillingError::InvalidAmount(format!(
            "{what} {amount} exceeds the maximum of {MAX_AMOUNT}"
        )));
    }
    Ok(amount)
}

/// Recompute `amount`, `amount_paid`, and `status` of `next` from the store
/// and write it if anything differs from `current`.
async fn reconcile_invoice(
    tx: &mut dyn BillingTransaction,
    current: InvoiceRecord,
    mut next: InvoiceRecord,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let entries = tx
        .list_time_entries(&TimeEntryFilter::Invoice(next.id))
        .await?;
    next.amount = within_amount_limit(sum_line_amounts(&entries)?, "invoice amount")?;

    let payments = tx
        .list_payments(&PaymentFilter::Invoice(next.id))
        .await?;
    let paid = checked_sum(payments.iter().map(|p| p.amount)).ok_or_else(|| {
        BillingError::InvalidAmount(format!(
            "payments on invoice {} overflow",
            next.invoice_number
        ))
    })?;
    next.amount_paid = within_amount_limit(paid, "amount paid")?;

    next.status = derive_for(&next, today);
    if next == current {
        return Ok(current);
    }

    tracing::debug!(
        invoice = %next.invoice_number,
        amount = %next.amount,
        amount_paid = %next.amount_paid,
        from = current.status.as_str(),
        to = next.status.as_str(),
        "Reconciled invoice"
    );
    Ok(tx.update_invoice(&next).await?)
}

async fn lock_invoice_or_not_found(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
) -> Result<InvoiceRecord, BillingError> {
    tx.lock_invoice(invoice_id)
        .await?
        .ok_or_else(|| BillingError::not_found("invoice", invoice_id))
}

async fn ensure_invoice_number_free(
    tx: &mut dyn BillingTransaction,
    number: Option<String>,
) -> Result<String, BillingError> {
    match number {
        Some(number) => {
            if tx.find_invoice_by_number(&number).await?.is_some() {
                return Err(BillingError::InvalidInput(format!(
                    "invoice number {number} is already in use"
                )));
            }
            Ok(number)
        }
        None => Ok(mint(tx, SequenceKind::Invoice).await),
    }
}

/// Validate the entries to bill on an invoice of `case_id`.
async fn load_billable_entries(
    tx: &mut dyn BillingTransaction,
    case_id: &str,
    ids: &[Uuid],
) -> Result<Vec<TimeEntryRecord>, BillingError> {
    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        let entry = tx
            .get_time_entry(*id)
            .await?
            .ok_or_else(|| BillingError::not_found("time entry", id))?;
        if entry.case_id != case_id {
            return Err(BillingError::InvalidInput(format!(
                "time entry {} belongs to case '{}', not '{}'",
                entry.entry_code, entry.case_id, case_id
            )));
        }
        if let Some(invoice_id) = entry.invoice_id.filter(|_| entry.billed) {
            return Err(BillingError::AlreadyBilled {
                time_entry_id: entry.id,
                invoice_id,
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

async fn mark_all_billed(
    tx: &mut dyn BillingTransaction,
    ids: &[Uuid],
    invoice_id: Uuid,
) -> Result<(), BillingError> {
    let marked = tx.mark_time_entries_billed(ids, invoice_id).await?;
    if marked != ids.len() as u64 {
        return Err(BillingError::Conflict(format!(
            "expected to bill {} time entries, billed {}",
            ids.len(),
            marked
        )));
    }
    Ok(())
}

// ==================== Operation bodies ====================

async fn log_time_entry_tx(
    tx: &mut dyn BillingTransaction,
    mut params: CreateTimeEntryParams,
) -> Result<TimeEntryRecord, BillingError> {
    if params.entry_code.is_empty() {
        params.entry_code = mint(tx, SequenceKind::TimeEntry).await;
    } else if tx.find_time_entry_by_code(&params.entry_code).await?.is_some() {
        return Err(BillingError::InvalidInput(format!(
            "time entry code {} is already in use",
            params.entry_code
        )));
    }
    Ok(tx.insert_time_entry(&params).await?)
}

async fn update_time_entry_tx(
    tx: &mut dyn BillingTransaction,
    time_entry_id: Uuid,
    changes: TimeEntryChanges,
) -> Result<TimeEntryRecord, BillingError> {
    let current = tx
        .get_time_entry(time_entry_id)
        .await?
        .ok_or_else(|| BillingError::not_found("time entry", time_entry_id))?;

    let mut next = current.clone();
    if let Some(case_id) = changes.case_id {
        next.case_id = case_id;
    }
    if let Some(attorney_id) = changes.attorney_id {
        next.attorney_id = attorney_id;
    }
    if let Some(hours) = changes.hours {
        next.hours = hours;
    }
    if let Some(rate) = changes.hourly_rate {
        next.hourly_rate = rate;
    }
    if let Some(entry_date) = changes.entry_date {
        next.entry_date = entry_date;
    }
    if let Some(description) = changes.description {
        next.description = description.trim().to_string();
    }
    if let Some(activity_code) = changes.activity_code {
        next.activity_code = activity_code;
    }

    let billing_fields_changed = next.case_id != current.case_id
        || next.attorney_id != current.attorney_id
        || next.hours != current.hours
        || next.hourly_rate != current.hourly_rate;
    if billing_fields_changed
        && current.billed
        && let Some(invoice_id) = current.invoice_id
    {
        return Err(BillingError::AlreadyBilled {
            time_entry_id,
            invoice_id,
        });
    }

    if next == current {
        return Ok(current);
    }
    if !tx.update_time_entry(&next).await? {
        return Err(BillingError::not_found("time entry", time_entry_id));
    }
    Ok(next)
}

async fn delete_time_entry_tx(
    tx: &mut dyn BillingTransaction,
    time_entry_id: Uuid,
) -> Result<(), BillingError> {
    let entry = tx
        .get_time_entry(time_entry_id)
        .await?
        .ok_or_else(|| BillingError::not_found("time entry", time_entry_id))?;
    if let Some(invoice_id) = entry.invoice_id.filter(|_| entry.billed) {
        return Err(BillingError::AlreadyBilled {
            time_entry_id,
            invoice_id,
        });
    }
    if !tx.delete_unbilled_time_entry(time_entry_id).await? {
        return Err(BillingError::Conflict(format!(
            "time entry {} changed while being deleted",
            entry.entry_code
        )));
    }
    Ok(())
}

async fn bill_time_entries_tx(
    tx: &mut dyn BillingTransaction,
    case: CaseRef,
    invoice_number: Option<String>,
    today: NaiveDate,
    due_date: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let entries = tx
        .list_time_entries(&TimeEntryFilter::UnbilledForCase(case.id.clone()))
        .await?;
    if entries.is_empty() {
        return Err(BillingError::NothingToBill { case_id: case.id });
    }

    let invoice_number = ensure_invoice_number_free(tx, invoice_number).await?;
    let invoice = tx
        .insert_invoice(&CreateInvoiceParams {
            invoice_number,
            client_id: case.client_id,
            case_id: case.id,
            issue_date: today,
            due_date,
            amount: within_amount_limit(sum_line_amounts(&entries)?, "invoice amount")?,
            amount_paid: Decimal::ZERO,
            status: InvoiceStatus::Issued,
            notes: None,
        })
        .await?;

    let ids: Vec<Uuid> = entries.iter().map(|e| e.id).collect();
    mark_all_billed(tx, &ids, invoice.id).await?;

    let next = invoice.clone();
    reconcile_invoice(tx, invoice, next, today).await
}

struct DraftInvoice {
    case: CaseRef,
    invoice_number: Option<String>,
    issue_date: NaiveDate,
    due_date: NaiveDate,
    status: InvoiceStatus,
    notes: Option<String>,
    time_entry_ids: Vec<Uuid>,
}

async fn create_invoice_tx(
    tx: &mut dyn BillingTransaction,
    draft: DraftInvoice,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let entries = load_billable_entries(tx, &draft.case.id, &draft.time_entry_ids).await?;
    let invoice_number = ensure_invoice_number_free(tx, draft.invoice_number).await?;
    let invoice = tx
        .insert_invoice(&CreateInvoiceParams {
            invoice_number,
            client_id: draft.case.client_id,
            case_id: draft.case.id,
            issue_date: draft.issue_date,
            due_date: draft.due_date,
            amount: within_amount_limit(sum_line_amounts(&entries)?, "invoice amount")?,
            amount_paid: Decimal::ZERO,
            status: draft.status,
            notes: draft.notes,
        })
        .await?;

    if !draft.time_entry_ids.is_empty() {
        mark_all_billed(tx, &draft.time_entry_ids, invoice.id).await?;
    }

    let next = invoice.clone();
    reconcile_invoice(tx, invoice, next, today).await
}

async fn attach_time_entries_tx(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
    ids: Vec<Uuid>,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let invoice = lock_invoice_or_not_found(tx, invoice_id).await?;
    if invoice.status == InvoiceStatus::Cancelled {
        return Err(BillingError::InvalidInput(format!(
            "invoice {} is cancelled",
            invoice.invoice_number
        )));
    }
    load_billable_entries(tx, &invoice.case_id, &ids).await?;
    mark_all_billed(tx, &ids, invoice.id).await?;

    let next = invoice.clone();
    reconcile_invoice(tx, invoice, next, today).await
}

async fn detach_time_entry_tx(
    tx: &mut dyn BillingTransaction,
    time_entry_id: Uuid,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let mut entry = tx
        .get_time_entry(time_entry_id)
        .await?
        .ok_or_else(|| BillingError::not_found("time entry", time_entry_id))?;
    let Some(invoice_id) = entry.invoice_id.filter(|_| entry.billed) else {
        return Err(BillingError::InvalidInput(format!(
            "time entry {} is not billed",
            entry.entry_code
        )));
    };

    let invoice = lock_invoice_or_not_found(tx, invoice_id).await?;
    if invoice.status == InvoiceStatus::Cancelled {
        return Err(BillingError::InvalidInput(format!(
            "invoice {} is cancelled",
            invoice.invoice_number
        )));
    }

    entry.billed = false;
    entry.invoice_id = None;
    tx.update_time_entry(&entry).await?;

    let next = invoice.clone();
    reconcile_invoice(tx, invoice, next, today).await
}

async fn update_invoice_tx(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
    changes: InvoiceChanges,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let invoice = lock_invoice_or_not_found(tx, invoice_id).await?;
    if let Some(expected) = changes.expected_version
        && expected != invoice.version
    {
        return Err(BillingError::Conflict(format!(
            "invoice {} is at version {}, expected {}",
            invoice.invoice_number, invoice.version, expected
        )));
    }

    let mut next = invoice.clone();
    if let Some(issue_date) = changes.issue_date {
        next.issue_date = issue_date;
    }
    if let Some(due_date) = changes.due_date {
        next.due_date = due_date;
    }
    if let Some(notes) = changes.notes {
        next.notes = clean_text(notes);
    }
    validate_dates(next.issue_date, next.due_date)?;

    reconcile_invoice(tx, invoice, next, today).await
}

async fn issue_invoice_tx(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let invoice = lock_invoice_or_not_found(tx, invoice_id).await?;
    if invoice.status != InvoiceStatus::Draft {
        return Err(BillingError::InvalidInput(format!(
            "only draft invoices can be issued; {} is {}",
            invoice.invoice_number,
            invoice.status.as_str()
        )));
    }
    let mut next = invoice.clone();
    next.status = InvoiceStatus::Issued;
    reconcile_invoice(tx, invoice, next, today).await
}

async fn cancel_invoice_tx(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let invoice = lock_invoice_or_not_found(tx, invoice_id).await?;
    if matches!(
        invoice.status,
        InvoiceStatus::Paid | InvoiceStatus::Cancelled
    ) {
        return Err(BillingError::InvalidInput(format!(
            "invoice {} is {} and cannot be cancelled",
            invoice.invoice_number,
            invoice.status.as_str()
        )));
    }
    let mut next = invoice.clone();
    next.status = InvoiceStatus::Cancelled;
    reconcile_invoice(tx, invoice, next, today).await
}

/// Returns the number of time entries returned to the unbilled pool.
async fn delete_invoice_tx(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
) -> Result<u64, BillingError> {
    let invoice = lock_invoice_or_not_found(tx, invoice_id).await?;
    let payments = tx.list_payments(&PaymentFilter::Invoice(invoice.id)).await?;
    if !payments.is_empty() {
        return Err(BillingError::HasPayments {
            invoice_id,
            payment_count: payments.len(),
        });
    }
    let unbilled = tx.unbill_time_entries(invoice_id).await?;
    if !tx.delete_invoice(invoice_id).await? {
        return Err(BillingError::not_found("invoice", invoice_id));
    }
    Ok(unbilled)
}

async fn refresh_invoice_tx(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let invoice = lock_invoice_or_not_found(tx, invoice_id).await?;
    let next = invoice.clone();
    reconcile_invoice(tx, invoice, next, today).await
}

async fn refresh_all_tx(
    tx: &mut dyn BillingTransaction,
    today: NaiveDate,
) -> Result<Vec<InvoiceRecord>, BillingError> {
    let invoices = tx.list_invoices(&InvoiceFilter::All).await?;
    let mut changed = Vec::new();
    for invoice in invoices {
        if matches!(
            invoice.status,
            InvoiceStatus::Draft | InvoiceStatus::Cancelled
        ) {
            continue;
        }
        let Some(locked) = tx.lock_invoice(invoice.id).await? else {
            continue;
        };
        let before = locked.status;
        let next = locked.clone();
        let reconciled = reconcile_invoice(tx, locked, next, today).await?;
        if reconciled.status != before {
            changed.push(reconciled);
        }
    }
    Ok(changed)
}

struct PendingPayment {
    invoice_id: Uuid,
    payment_date: NaiveDate,
    amount: Decimal,
    method: PaymentMethod,
    reference: Option<String>,
    notes: Option<String>,
}

async fn record_payment_tx(
    tx: &mut dyn BillingTransaction,
    pending: PendingPayment,
    today: NaiveDate,
) -> Result<PaymentRecord, BillingError> {
    let invoice = lock_invoice_or_not_found(tx, pending.invoice_id).await?;
    if invoice.status == InvoiceStatus::Cancelled {
        return Err(BillingError::InvalidInput(format!(
            "invoice {} is cancelled",
            invoice.invoice_number
        )));
    }

    let payment_number = mint(tx, SequenceKind::Payment).await;
    let payment = tx
        .insert_payment(&CreatePaymentParams {
            payment_number,
            invoice_id: invoice.id,
            client_id: invoice.client_id.clone(),
            payment_date: pending.payment_date,
            amount: pending.amount,
            method: pending.method,
            reference: pending.reference,
            notes: pending.notes,
        })
        .await?;

    let next = invoice.clone();
    reconcile_invoice(tx, invoice, next, today).await?;
    Ok(payment)
}

async fn delete_payment_tx(
    tx: &mut dyn BillingTransaction,
    payment_id: Uuid,
    today: NaiveDate,
) -> Result<InvoiceRecord, BillingError> {
    let payment = tx
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| BillingError::not_found("payment", payment_id))?;
    let invoice = lock_invoice_or_not_found(tx, payment.invoice_id).await?;

    if !tx.delete_payment(payment_id).await? {
        return Err(BillingError::not_found("payment", payment_id));
    }

    let next = invoice.clone();
    reconcile_invoice(tx, invoice, next, today).await
}

async fn update_payment_tx(
    tx: &mut dyn BillingTransaction,
    payment_id: Uuid,
    changes: PaymentChanges,
    today: NaiveDate,
) -> Result<PaymentRecord, BillingError> {
    let current = tx
        .get_payment(payment_id)
        .await?
        .ok_or_else(|| BillingError::not_found("payment", payment_id))?;
    let invoice = lock_invoice_or_not_found(tx, current.invoice_id).await?;

    let mut next = current.clone();
    if let Some(payment_date) = changes.payment_date {
        next.payment_date = payment_date;
    }
    if let Some(amount) = changes.amount {
        next.amount = amount;
    }
    if let Some(method) = changes.method {
        next.method = method;
    }
    if let Some(reference) = changes.reference {
        next.reference = clean_text(reference);
    }
    if let Some(notes) = changes.notes {
        next.notes = clean_text(notes);
    }
    if next == current {
        return Ok(current);
    }

    if !tx.update_payment(&next).await? {
        return Err(BillingError::not_found("payment", payment_id));
    }
    if next.amount != current.amount {
        let reconciled = invoice.clone();
        reconcile_invoice(tx, invoice, reconciled, today).await?;
    }
    Ok(next)
}
