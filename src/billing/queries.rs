//! Read-side queries. Each runs in a single read transaction, so the figures
//! it returns come from one consistent snapshot.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::billing::engine::{BillingEngine, sum_line_amounts};
use crate::billing::money::checked_sum;
use crate::billing::sequence;
use crate::billing::unit_of_work::with_transaction;
use crate::db::{
    BillingTransaction, InvoiceFilter, InvoiceRecord, InvoiceStatus, InvoiceStore, PaymentFilter,
    PaymentRecord, PaymentStore, SequenceKind, TimeEntryFilter, TimeEntryRecord, TimeEntryStore,
    TxMode,
};
use crate::error::BillingError;

/// An invoice with the records it owns or bills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDetails {
    pub invoice: InvoiceRecord,
    /// From the practice directory; `None` when the client is not listed.
    pub client_name: Option<String>,
    pub time_entries: Vec<TimeEntryRecord>,
    pub payments: Vec<PaymentRecord>,
    /// `amount - amount_paid`; negative when overpaid.
    pub balance: Decimal,
}

/// Billing position of one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseBillingSummary {
    pub case_id: String,
    pub client_id: String,
    pub client_name: Option<String>,
    pub total_hours: Decimal,
    pub billable_amount: Decimal,
    pub billed_amount: Decimal,
    pub unbilled_hours: Decimal,
    pub unbilled_amount: Decimal,
    /// Sum of amounts of invoices that are not cancelled.
    pub invoiced_amount: Decimal,
    pub collected_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub invoice_count: usize,
    pub overdue_count: usize,
}

fn total(values: impl IntoIterator<Item = Decimal>, what: &str) -> Result<Decimal, BillingError> {
    checked_sum(values).ok_or_else(|| BillingError::InvalidAmount(format!("{what} overflows")))
}

fn sum_hours<'a>(
    entries: impl IntoIterator<Item = &'a TimeEntryRecord>,
) -> Result<Decimal, BillingError> {
    total(entries.into_iter().map(|e| e.hours), "total hours")
}

fn sum_payments(payments: &[PaymentRecord]) -> Result<Decimal, BillingError> {
    total(payments.iter().map(|p| p.amount), "payment total")
}

async fn load_case_records(
    tx: &mut dyn BillingTransaction,
    case_id: String,
) -> Result<(Vec<TimeEntryRecord>, Vec<InvoiceRecord>), BillingError> {
    let entries = tx
        .list_time_entries(&TimeEntryFilter::Case(case_id.clone()))
        .await?;
    let invoices = tx.list_invoices(&InvoiceFilter::Case(case_id)).await?;
    Ok((entries, invoices))
}

async fn load_invoice_details(
    tx: &mut dyn BillingTransaction,
    invoice_id: Uuid,
) -> Result<InvoiceDetails, BillingError> {
    let invoice = tx
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| BillingError::not_found("invoice", invoice_id))?;
    let time_entries = tx
        .list_time_entries(&TimeEntryFilter::Invoice(invoice_id))
        .await?;
    let payments = tx.list_payments(&PaymentFilter::Invoice(invoice_id)).await?;
    let balance = invoice.balance();
    Ok(InvoiceDetails {
        invoice,
        client_name: None,
        time_entries,
        payments,
        balance,
    })
}

impl BillingEngine {
    async fn case_entries(&self, case_id: &str) -> Result<Vec<TimeEntryRecord>, BillingError> {
        self.require_case(case_id).await?;
        let filter = TimeEntryFilter::Case(case_id.to_string());
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.list_time_entries(&filter)
                    .await
                    .map_err(BillingError::from)
            })
        })
        .await
    }

    /// Hours logged on a case, billed or not.
    pub async fn total_hours_for_case(&self, case_id: &str) -> Result<Decimal, BillingError> {
        sum_hours(&self.case_entries(case_id).await?)
    }

    /// Value of all time logged on a case at each entry's rate.
    pub async fn total_billable_amount_for_case(
        &self,
        case_id: &str,
    ) -> Result<Decimal, BillingError> {
        sum_line_amounts(&self.case_entries(case_id).await?)
    }

    /// Unbilled entries of a case, oldest first.
    pub async fn find_unbilled_time_entries(
        &self,
        case_id: &str,
    ) -> Result<Vec<TimeEntryRecord>, BillingError> {
        self.require_case(case_id).await?;
        let filter = TimeEntryFilter::UnbilledForCase(case_id.to_string());
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.list_time_entries(&filter)
                    .await
                    .map_err(BillingError::from)
            })
        })
        .await
    }

    /// Invoices due before today that are neither paid nor cancelled,
    /// regardless of their stored status.
    pub async fn find_overdue_invoices(&self) -> Result<Vec<InvoiceRecord>, BillingError> {
        self.list_invoices(InvoiceFilter::OverdueAsOf(self.today()))
            .await
    }

    pub async fn case_billing_summary(
        &self,
        case_id: &str,
    ) -> Result<CaseBillingSummary, BillingError> {
        let case = self.require_case(case_id).await?;
        let client_name = self.client_name(&case.client_id).await?;
        let today = self.today();
        let case_key = case.id.clone();

        let (entries, invoices) = with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(load_case_records(tx, case_key))
        })
        .await?;

        let (billed, unbilled): (Vec<_>, Vec<_>) = entries.iter().partition(|e| e.billed);
        let open: Vec<&InvoiceRecord> = invoices
            .iter()
            .filter(|i| i.status != InvoiceStatus::Cancelled)
            .collect();
        let invoiced_amount = total(open.iter().map(|i| i.amount), "invoiced amount")?;
        let collected_amount = total(open.iter().map(|i| i.amount_paid), "collected amount")?;

        Ok(CaseBillingSummary {
            case_id: case.id,
            client_id: case.client_id,
            client_name,
            total_hours: sum_hours(&entries)?,
            billable_amount: sum_line_amounts(&entries)?,
            billed_amount: sum_line_amounts(billed)?,
            unbilled_hours: sum_hours(unbilled.iter().copied())?,
            unbilled_amount: sum_line_amounts(unbilled)?,
            invoiced_amount,
            collected_amount,
            outstanding_amount: invoiced_amount - collected_amount,
            invoice_count: invoices.len(),
            overdue_count: open
                .iter()
                .filter(|i| crate::billing::status::is_overdue(i, today))
                .count(),
        })
    }

    pub async fn invoice_details(&self, invoice_id: Uuid) -> Result<InvoiceDetails, BillingError> {
        let mut details = with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(load_invoice_details(tx, invoice_id))
        })
        .await?;
        details.client_name = self.client_name(&details.invoice.client_id).await?;
        Ok(details)
    }

    // ==================== Lookups ====================

    pub async fn get_time_entry(&self, id: Uuid) -> Result<TimeEntryRecord, BillingError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.get_time_entry(id)
                    .await?
                    .ok_or_else(|| BillingError::not_found("time entry", id))
            })
        })
        .await
    }

    pub async fn find_time_entry_by_code(
        &self,
        entry_code: &str,
    ) -> Result<TimeEntryRecord, BillingError> {
        let code = entry_code.trim().to_string();
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.find_time_entry_by_code(&code)
                    .await?
                    .ok_or_else(|| BillingError::not_found("time entry", code))
            })
        })
        .await
    }

    pub async fn get_invoice(&self, id: Uuid) -> Result<InvoiceRecord, BillingError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.get_invoice(id)
                    .await?
                    .ok_or_else(|| BillingError::not_found("invoice", id))
            })
        })
        .await
    }

    pub async fn find_invoice_by_number(
        &self,
        invoice_number: &str,
    ) -> Result<InvoiceRecord, BillingError> {
        let number = invoice_number.trim().to_string();
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.find_invoice_by_number(&number)
                    .await?
                    .ok_or_else(|| BillingError::not_found("invoice", number))
            })
        })
        .await
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<PaymentRecord, BillingError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.get_payment(id)
                    .await?
                    .ok_or_else(|| BillingError::not_found("payment", id))
            })
        })
        .await
    }

    pub async fn find_payment_by_number(
        &self,
        payment_number: &str,
    ) -> Result<PaymentRecord, BillingError> {
        let number = payment_number.trim().to_string();
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.find_payment_by_number(&number)
                    .await?
                    .ok_or_else(|| BillingError::not_found("payment", number))
            })
        })
        .await
    }

    // ==================== Listings ====================

    pub async fn list_time_entries(
        &self,
        filter: TimeEntryFilter,
    ) -> Result<Vec<TimeEntryRecord>, BillingError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.list_time_entries(&filter)
                    .await
                    .map_err(BillingError::from)
            })
        })
        .await
    }

    pub async fn list_invoices(
        &self,
        filter: InvoiceFilter,
    ) -> Result<Vec<InvoiceRecord>, BillingError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.list_invoices(&filter)
                    .await
                    .map_err(BillingError::from)
            })
        })
        .await
    }

    pub async fn list_payments(
        &self,
        filter: PaymentFilter,
    ) -> Result<Vec<PaymentRecord>, BillingError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.list_payments(&filter)
                    .await
                    .map_err(BillingError::from)
            })
        })
        .await
    }

    // ==================== Totals ====================

    /// Cash received from a client across all of its invoices.
    pub async fn total_payments_for_client(
        &self,
        client_id: &str,
    ) -> Result<Decimal, BillingError> {
        let payments = self
            .list_payments(PaymentFilter::Client(client_id.to_string()))
            .await?;
        sum_payments(&payments)
    }

    /// Cash received with a payment date in `[start, end]`.
    pub async fn total_payments_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Decimal, BillingError> {
        if end < start {
            return Err(BillingError::InvalidInput(format!(
                "date range ends ({end}) before it starts ({start})"
            )));
        }
        let payments = self
            .list_payments(PaymentFilter::DateRange { start, end })
            .await?;
        sum_payments(&payments)
    }

    // ==================== Number previews ====================

    /// The invoice number the next mint would produce. Not reserved.
    pub async fn next_invoice_number(&self) -> Result<String, BillingError> {
        sequence::peek(self.db.as_ref(), SequenceKind::Invoice).await
    }

    /// The payment number the next mint would produce. Not reserved.
    pub async fn next_payment_number(&self) -> Result<String, BillingError> {
        sequence::peek(self.db.as_ref(), SequenceKind::Payment).await
    }
}
