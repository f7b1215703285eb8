//! End-to-end reconciliation against an on-disk libSQL database.
//!
//! Run with:
//!   cargo test --test libsql_reconciliation

use std::sync::Arc;

use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

use casebill::billing::{
    BillingEngine, CreateInvoiceRequest, FixedClock, InvoiceChanges, LogTimeEntryRequest,
    RecordPaymentRequest, TimeEntryChanges,
};
use casebill::config::BillingConfig;
use casebill::db::libsql::LibSqlBackend;
use casebill::db::{
    ActivityCode, Database, InvoiceFilter, InvoiceStatus, PaymentMethod, TimeEntryRecord,
};
use casebill::directory::InMemoryDirectory;
use casebill::error::BillingError;

struct Harness {
    _dir: TempDir,
    backend: Arc<LibSqlBackend>,
    directory: Arc<InMemoryDirectory>,
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn today() -> NaiveDate {
    date(2024, 3, 15)
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LibSqlBackend::new_local(&dir.path().join("casebill.db"))
            .await
            .expect("open database");
        backend.run_migrations().await.expect("migrations");

        let directory = InMemoryDirectory::new()
            .with_client("client-1", "Acme Corp")
            .with_client("client-2", "Globex")
            .with_case("case-1", "client-1")
            .with_case("case-2", "client-2")
            .with_attorney("att-100", Some(dec!(100)))
            .with_attorney("att-150", Some(dec!(150)))
            .with_attorney("paralegal", None);

        Self {
            _dir: dir,
            backend: Arc::new(backend),
            directory: Arc::new(directory),
        }
    }

    /// An engine over the shared database whose "today" is `on`.
    fn engine_at(&self, on: NaiveDate) -> BillingEngine {
        let db: Arc<dyn Database> = self.backend.clone();
        BillingEngine::new(db, self.directory.clone(), BillingConfig::default())
            .with_clock(Arc::new(FixedClock(on)))
    }

    fn engine(&self) -> BillingEngine {
        self.engine_at(today())
    }
}

async fn log(engine: &BillingEngine, case: &str, attorney: &str, hours: Decimal) -> TimeEntryRecord {
    engine
        .log_time_entry(LogTimeEntryRequest {
            case_id: case.to_string(),
            attorney_id: attorney.to_string(),
            hours,
            description: "Work on the matter".to_string(),
            activity_code: ActivityCode::Dra,
            entry_date: None,
            hourly_rate: None,
            entry_code: None,
        })
        .await
        .expect("log time entry")
}

async fn pay(engine: &BillingEngine, invoice_id: uuid::Uuid, amount: Decimal) {
    engine
        .record_payment(RecordPaymentRequest {
            invoice_id,
            amount,
            method: PaymentMethod::Check,
            payment_date: None,
            reference: None,
            notes: None,
        })
        .await
        .expect("record payment");
}

/// Two unbilled entries on case-1: 3h at $100 and 2h at $150.
async fn scenario_a(engine: &BillingEngine) -> casebill::db::InvoiceRecord {
    log(engine, "case-1", "att-100", dec!(3)).await;
    log(engine, "case-1", "att-150", dec!(2)).await;
    engine
        .bill_time_entries("case-1", Some("INV000007"), Some(date(2024, 4, 14)))
        .await
        .expect("bill case")
}

#[tokio::test]
async fn billing_unbilled_entries_creates_issued_invoice() {
    let h = Harness::new().await;
    let engine = h.engine();

    let invoice = scenario_a(&engine).await;
    assert_eq!(invoice.invoice_number, "INV000007");
    assert_eq!(invoice.amount, dec!(600));
    assert_eq!(invoice.amount_paid, Decimal::ZERO);
    assert_eq!(invoice.status, InvoiceStatus::Issued);
    assert_eq!(invoice.client_id, "client-1");
    assert_eq!(invoice.issue_date, today());

    let details = engine.invoice_details(invoice.id).await.expect("details");
    assert_eq!(details.client_name.as_deref(), Some("Acme Corp"));
    assert_eq!(details.time_entries.len(), 2);
    for entry in &details.time_entries {
        assert!(entry.billed);
        assert_eq!(entry.invoice_id, Some(invoice.id));
    }
    assert!(engine
        .find_unbilled_time_entries("case-1")
        .await
        .expect("unbilled")
        .is_empty());
}

#[tokio::test]
async fn full_payment_marks_invoice_paid() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;

    pay(&engine, invoice.id, dec!(600)).await;

    let invoice = engine.get_invoice(invoice.id).await.expect("invoice");
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.amount_paid, dec!(600));
    assert_eq!(invoice.balance(), Decimal::ZERO);
}

#[tokio::test]
async fn partial_payment_leaves_balance() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;

    pay(&engine, invoice.id, dec!(200)).await;

    let details = engine.invoice_details(invoice.id).await.expect("details");
    assert_eq!(details.invoice.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(details.invoice.amount_paid, dec!(200));
    assert_eq!(details.balance, dec!(400));
    assert_eq!(details.payments.len(), 1);
    assert_eq!(details.payments[0].client_id, "client-1");
}

#[tokio::test]
async fn invoice_with_payments_cannot_be_deleted() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;
    pay(&engine, invoice.id, dec!(200)).await;
    let before = engine.invoice_details(invoice.id).await.expect("details");

    let err = engine
        .delete_invoice(invoice.id)
        .await
        .expect_err("delete must fail");
    assert!(
        matches!(err, BillingError::HasPayments { payment_count: 1, .. }),
        "unexpected error: {err}"
    );

    let after = engine.invoice_details(invoice.id).await.expect("details");
    assert_eq!(after, before);
}

#[tokio::test]
async fn past_due_invoice_becomes_overdue_on_refresh() {
    let h = Harness::new().await;
    let engine = h.engine();
    log(&engine, "case-1", "att-100", dec!(1)).await;
    let invoice = engine
        .bill_time_entries("case-1", None, Some(date(2024, 3, 20)))
        .await
        .expect("bill");
    assert_eq!(invoice.status, InvoiceStatus::Issued);

    let later = h.engine_at(date(2024, 3, 21));
    assert_eq!(
        later.find_overdue_invoices().await.expect("overdue").len(),
        1
    );
    let changed = later.refresh_overdue_invoices().await.expect("refresh");
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].status, InvoiceStatus::Overdue);

    // Idempotent once stored.
    assert!(later.refresh_overdue_invoices().await.expect("refresh").is_empty());

    // A payment on an overdue invoice still settles it.
    pay(&later, invoice.id, dec!(100)).await;
    let settled = later.get_invoice(invoice.id).await.expect("invoice");
    assert_eq!(settled.status, InvoiceStatus::Paid);
    assert!(later.find_overdue_invoices().await.expect("overdue").is_empty());
}

#[tokio::test]
async fn billed_entries_are_protected() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;
    let entry = engine
        .list_time_entries(casebill::db::TimeEntryFilter::Invoice(invoice.id))
        .await
        .expect("entries")
        .remove(0);

    let err = engine
        .delete_time_entry(entry.id)
        .await
        .expect_err("billed entry delete");
    assert!(matches!(err, BillingError::AlreadyBilled { .. }), "{err}");

    let err = engine
        .update_time_entry(
            entry.id,
            TimeEntryChanges {
                hours: Some(dec!(10)),
                ..TimeEntryChanges::default()
            },
        )
        .await
        .expect_err("billed hours change");
    assert!(matches!(err, BillingError::AlreadyBilled { .. }), "{err}");

    let renamed = engine
        .update_time_entry(
            entry.id,
            TimeEntryChanges {
                description: Some("Drafted motion to compel".to_string()),
                ..TimeEntryChanges::default()
            },
        )
        .await
        .expect("description change");
    assert_eq!(renamed.description, "Drafted motion to compel");

    let err = engine
        .create_invoice(CreateInvoiceRequest {
            case_id: "case-1".to_string(),
            invoice_number: None,
            issue_date: None,
            due_date: None,
            status: InvoiceStatus::Issued,
            notes: None,
            time_entry_ids: vec![entry.id],
        })
        .await
        .expect_err("double billing");
    assert!(
        matches!(err, BillingError::AlreadyBilled { invoice_id, .. } if invoice_id == invoice.id),
        "{err}"
    );
}

#[tokio::test]
async fn billing_a_case_without_unbilled_time_fails() {
    let h = Harness::new().await;
    let engine = h.engine();

    let err = engine
        .bill_time_entries("case-2", None, None)
        .await
        .expect_err("nothing to bill");
    assert!(matches!(err, BillingError::NothingToBill { .. }), "{err}");

    let err = engine
        .bill_time_entries("case-404", None, None)
        .await
        .expect_err("unknown case");
    assert!(matches!(err, BillingError::NotFound { entity: "case", .. }), "{err}");
}

#[tokio::test]
async fn attach_and_detach_keep_amount_in_step() {
    let h = Harness::new().await;
    let engine = h.engine();
    let first = log(&engine, "case-1", "att-100", dec!(1.5)).await;
    let second = log(&engine, "case-1", "att-150", dec!(0.25)).await;

    let invoice = engine
        .create_invoice(CreateInvoiceRequest {
            case_id: "case-1".to_string(),
            invoice_number: None,
            issue_date: None,
            due_date: None,
            status: InvoiceStatus::Draft,
            notes: Some("Retainer period".to_string()),
            time_entry_ids: vec![first.id],
        })
        .await
        .expect("create draft");
    assert_eq!(invoice.amount, dec!(150));
    assert_eq!(invoice.status, InvoiceStatus::Draft);
    assert_eq!(invoice.due_date, date(2024, 4, 14));

    let invoice = engine
        .attach_time_entries(invoice.id, vec![second.id])
        .await
        .expect("attach");
    assert_eq!(invoice.amount, dec!(187.50));

    let invoice = engine.detach_time_entry(first.id).await.expect("detach");
    assert_eq!(invoice.amount, dec!(37.50));
    let first = engine.get_time_entry(first.id).await.expect("entry");
    assert!(!first.billed);
    assert_eq!(first.invoice_id, None);

    let issued = engine.issue_invoice(invoice.id).await.expect("issue");
    assert_eq!(issued.status, InvoiceStatus::Issued);
}

#[tokio::test]
async fn deleting_invoice_returns_entries_to_unbilled() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;

    engine.delete_invoice(invoice.id).await.expect("delete");

    let unbilled = engine
        .find_unbilled_time_entries("case-1")
        .await
        .expect("unbilled");
    assert_eq!(unbilled.len(), 2);
    assert!(unbilled.iter().all(|e| !e.billed && e.invoice_id.is_none()));
    assert!(matches!(
        engine.get_invoice(invoice.id).await,
        Err(BillingError::NotFound { .. })
    ));
}

#[tokio::test]
async fn payments_reconcile_on_delete_and_edit() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;

    let payment = engine
        .record_payment(RecordPaymentRequest {
            invoice_id: invoice.id,
            amount: dec!(600),
            method: PaymentMethod::WireTransfer,
            payment_date: None,
            reference: Some("  WIRE-991 ".to_string()),
            notes: None,
        })
        .await
        .expect("payment");
    assert_eq!(payment.payment_number, "PMT000001");
    assert_eq!(payment.reference.as_deref(), Some("WIRE-991"));

    let edited = engine
        .update_payment(
            payment.id,
            casebill::billing::PaymentChanges {
                amount: Some(dec!(250)),
                ..Default::default()
            },
        )
        .await
        .expect("edit payment");
    assert_eq!(edited.amount, dec!(250));
    let reconciled = engine.get_invoice(invoice.id).await.expect("invoice");
    assert_eq!(reconciled.amount_paid, dec!(250));
    assert_eq!(reconciled.status, InvoiceStatus::PartiallyPaid);

    let after_delete = engine.delete_payment(payment.id).await.expect("delete");
    assert_eq!(after_delete.amount_paid, Decimal::ZERO);
    assert_eq!(after_delete.status, InvoiceStatus::Issued);
}

#[tokio::test]
async fn overpayment_and_zero_amount_invoices_are_paid() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;

    pay(&engine, invoice.id, dec!(700)).await;
    let overpaid = engine.get_invoice(invoice.id).await.expect("invoice");
    assert_eq!(overpaid.status, InvoiceStatus::Paid);
    assert_eq!(overpaid.balance(), dec!(-100));

    let empty = engine
        .create_invoice(CreateInvoiceRequest {
            case_id: "case-2".to_string(),
            invoice_number: None,
            issue_date: None,
            due_date: None,
            status: InvoiceStatus::Issued,
            notes: None,
            time_entry_ids: Vec::new(),
        })
        .await
        .expect("empty invoice");
    assert_eq!(empty.amount, Decimal::ZERO);
    assert_eq!(empty.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn invalid_payments_are_rejected() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;

    let err = engine
        .record_payment(RecordPaymentRequest {
            invoice_id: invoice.id,
            amount: dec!(0),
            method: PaymentMethod::Cash,
            payment_date: None,
            reference: None,
            notes: None,
        })
        .await
        .expect_err("zero payment");
    assert!(matches!(err, BillingError::InvalidAmount(_)), "{err}");

    let err = engine
        .record_payment(RecordPaymentRequest {
            invoice_id: uuid::Uuid::new_v4(),
            amount: dec!(10),
            method: PaymentMethod::Cash,
            payment_date: None,
            reference: None,
            notes: None,
        })
        .await
        .expect_err("unknown invoice");
    assert!(matches!(err, BillingError::NotFound { entity: "invoice", .. }), "{err}");

    engine.cancel_invoice(invoice.id).await.expect("cancel");
    let err = engine
        .record_payment(RecordPaymentRequest {
            invoice_id: invoice.id,
            amount: dec!(10),
            method: PaymentMethod::Cash,
            payment_date: None,
            reference: None,
            notes: None,
        })
        .await
        .expect_err("cancelled invoice");
    assert!(matches!(err, BillingError::InvalidInput(_)), "{err}");
    assert!(engine
        .list_payments(casebill::db::PaymentFilter::Invoice(invoice.id))
        .await
        .expect("payments")
        .is_empty());
}

#[tokio::test]
async fn oversized_hours_and_rates_are_rejected() {
    let h = Harness::new().await;
    let engine = h.engine();

    let err = engine
        .log_time_entry(LogTimeEntryRequest {
            case_id: "case-1".to_string(),
            attorney_id: "att-100".to_string(),
            hours: Decimal::MAX / dec!(2),
            description: "Runaway timer".to_string(),
            activity_code: ActivityCode::Oth,
            entry_date: None,
            hourly_rate: None,
            entry_code: None,
        })
        .await
        .expect_err("hours out of range");
    assert!(matches!(err, BillingError::InvalidInput(_)), "{err}");

    let err = engine
        .log_time_entry(LogTimeEntryRequest {
            case_id: "case-1".to_string(),
            attorney_id: "att-100".to_string(),
            hours: dec!(1),
            description: "Typo in rate".to_string(),
            activity_code: ActivityCode::Oth,
            entry_date: None,
            hourly_rate: Some(dec!(250000000)),
            entry_code: None,
        })
        .await
        .expect_err("rate out of range");
    assert!(matches!(err, BillingError::InvalidAmount(_)), "{err}");

    let entry = log(&engine, "case-1", "att-100", dec!(2)).await;
    let err = engine
        .update_time_entry(
            entry.id,
            TimeEntryChanges {
                hours: Some(Decimal::MAX),
                ..Default::default()
            },
        )
        .await
        .expect_err("edit out of range");
    assert!(matches!(err, BillingError::InvalidInput(_)), "{err}");
    assert!(engine
        .list_time_entries(casebill::db::TimeEntryFilter::All)
        .await
        .expect("entries")
        .iter()
        .all(|e| e.hours == dec!(2)));
}

#[tokio::test]
async fn overflowing_stored_entry_fails_billing_cleanly() {
    let h = Harness::new().await;
    let engine = h.engine();
    log(&engine, "case-1", "att-100", dec!(1)).await;

    // Written behind the engine's back, so no input bounds applied.
    let conn = h.backend.connect().await.expect("connect");
    conn.execute(
        "INSERT INTO time_entries \
         (id, entry_code, case_id, attorney_id, entry_date, hours, activity_code, hourly_rate) \
         VALUES (?1, 'TE900000', 'case-1', 'att-100', '2024-03-01', \
                 '39614081257132168796771975167', 'OTH', '250')",
        libsql::params![uuid::Uuid::new_v4().to_string()],
    )
    .await
    .expect("insert oversized entry");

    let err = engine
        .total_billable_amount_for_case("case-1")
        .await
        .expect_err("total overflows");
    assert!(matches!(err, BillingError::InvalidAmount(_)), "{err}");

    let err = engine
        .case_billing_summary("case-1")
        .await
        .expect_err("summary overflows");
    assert!(matches!(err, BillingError::InvalidAmount(_)), "{err}");

    let err = engine
        .bill_time_entries("case-1", None, None)
        .await
        .expect_err("billing overflows");
    assert!(matches!(err, BillingError::InvalidAmount(_)), "{err}");
    assert!(engine
        .list_invoices(InvoiceFilter::All)
        .await
        .expect("invoices")
        .is_empty());
    assert_eq!(
        engine
            .find_unbilled_time_entries("case-1")
            .await
            .expect("unbilled")
            .len(),
        2
    );
}

#[tokio::test]
async fn schema_rejects_billed_entry_without_invoice() {
    let h = Harness::new().await;
    let engine = h.engine();
    let entry = log(&engine, "case-1", "att-100", dec!(1)).await;

    let conn = h.backend.connect().await.expect("connect");
    let result = conn
        .execute(
            "UPDATE time_entries SET billed = 1 WHERE id = ?1",
            libsql::params![entry.id.to_string()],
        )
        .await;
    let err = result.expect_err("billed without invoice");
    assert!(err.to_string().contains("CHECK"), "{err}");

    let result = conn
        .execute(
            "UPDATE time_entries SET hours = '-1' WHERE id = ?1",
            libsql::params![entry.id.to_string()],
        )
        .await;
    assert!(result.is_err(), "negative hours must violate the schema");

    let stored = engine.get_time_entry(entry.id).await.expect("entry");
    assert!(!stored.billed);
    assert_eq!(stored.hours, dec!(1));
}

#[tokio::test]
async fn non_numeric_suffixes_do_not_advance_the_sequence() {
    let h = Harness::new().await;
    let engine = h.engine();

    log(&engine, "case-1", "att-100", dec!(1)).await;
    let explicit = engine
        .bill_time_entries("case-1", Some("INV2024-7"), None)
        .await
        .expect("bill with explicit number");
    assert_eq!(explicit.invoice_number, "INV2024-7");

    assert_eq!(
        engine.next_invoice_number().await.expect("preview"),
        "INV000001"
    );
    log(&engine, "case-2", "att-100", dec!(1)).await;
    let minted = engine
        .bill_time_entries("case-2", None, None)
        .await
        .expect("bill with minted number");
    assert_eq!(minted.invoice_number, "INV000001");
}

#[tokio::test]
async fn failed_write_leaves_no_partial_state() {
    let h = Harness::new().await;
    let engine = h.engine();
    log(&engine, "case-1", "att-100", dec!(3)).await;
    log(&engine, "case-1", "att-150", dec!(2)).await;

    // Marking entries billed fails after the invoice row is inserted.
    let conn = h.backend.connect().await.expect("connect");
    conn.execute(
        "CREATE TRIGGER block_billing BEFORE UPDATE ON time_entries \
         BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
        (),
    )
    .await
    .expect("install trigger");

    let err = engine
        .bill_time_entries("case-1", None, None)
        .await
        .expect_err("billing must fail");
    assert!(err.to_string().contains("injected failure"), "{err}");

    assert!(engine
        .list_invoices(InvoiceFilter::All)
        .await
        .expect("invoices")
        .is_empty());
    assert_eq!(
        engine
            .find_unbilled_time_entries("case-1")
            .await
            .expect("unbilled")
            .len(),
        2
    );

    conn.execute("DROP TRIGGER block_billing", ())
        .await
        .expect("drop trigger");
    let invoice = engine
        .bill_time_entries("case-1", None, None)
        .await
        .expect("billing after recovery");
    assert_eq!(invoice.invoice_number, "INV000001");
    assert_eq!(invoice.amount, dec!(600));
}

#[tokio::test]
async fn numbers_are_sequential_per_prefix() {
    let h = Harness::new().await;
    let engine = h.engine();

    let first = log(&engine, "case-1", "att-100", dec!(1)).await;
    let second = log(&engine, "case-2", "att-100", dec!(1)).await;
    assert_eq!(first.entry_code, "TE000001");
    assert_eq!(second.entry_code, "TE000002");

    assert_eq!(engine.next_invoice_number().await.expect("peek"), "INV000001");
    assert_eq!(engine.next_invoice_number().await.expect("peek"), "INV000001");

    let a = engine.bill_time_entries("case-1", None, None).await.expect("bill");
    assert_eq!(a.invoice_number, "INV000001");

    log(&engine, "case-2", "att-100", dec!(1)).await;
    let b = engine
        .bill_time_entries("case-2", Some("INV000041"), None)
        .await
        .expect("bill");
    assert_eq!(b.invoice_number, "INV000041");
    assert_eq!(engine.next_invoice_number().await.expect("peek"), "INV000042");

    log(&engine, "case-1", "att-100", dec!(1)).await;
    let err = engine
        .bill_time_entries("case-1", Some("INV000041"), None)
        .await
        .expect_err("duplicate number");
    assert!(matches!(err, BillingError::InvalidInput(_)), "{err}");

    assert_eq!(engine.next_payment_number().await.expect("peek"), "PMT000001");
}

#[tokio::test]
async fn stale_invoice_version_is_a_conflict() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;

    let updated = engine
        .update_invoice(
            invoice.id,
            InvoiceChanges {
                due_date: Some(date(2024, 5, 1)),
                expected_version: Some(invoice.version),
                ..InvoiceChanges::default()
            },
        )
        .await
        .expect("update");
    assert!(updated.version > invoice.version);
    assert_eq!(updated.due_date, date(2024, 5, 1));

    let err = engine
        .update_invoice(
            invoice.id,
            InvoiceChanges {
                notes: Some(Some("late".to_string())),
                expected_version: Some(invoice.version),
                ..InvoiceChanges::default()
            },
        )
        .await
        .expect_err("stale version");
    assert!(matches!(err, BillingError::Conflict(_)), "{err}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn case_summary_adds_up() {
    let h = Harness::new().await;
    let engine = h.engine();
    let invoice = scenario_a(&engine).await;
    pay(&engine, invoice.id, dec!(200)).await;
    log(&engine, "case-1", "att-100", dec!(0.5)).await;
    log(&engine, "case-1", "paralegal", dec!(4)).await;

    assert_eq!(
        engine.total_hours_for_case("case-1").await.expect("hours"),
        dec!(9.5)
    );
    assert_eq!(
        engine
            .total_billable_amount_for_case("case-1")
            .await
            .expect("billable"),
        dec!(650)
    );

    let summary = engine.case_billing_summary("case-1").await.expect("summary");
    assert_eq!(summary.client_id, "client-1");
    assert_eq!(summary.client_name.as_deref(), Some("Acme Corp"));
    assert_eq!(summary.billed_amount, dec!(600));
    assert_eq!(summary.unbilled_hours, dec!(4.5));
    assert_eq!(summary.unbilled_amount, dec!(50));
    assert_eq!(summary.invoiced_amount, dec!(600));
    assert_eq!(summary.collected_amount, dec!(200));
    assert_eq!(summary.outstanding_amount, dec!(400));
    assert_eq!(summary.invoice_count, 1);
    assert_eq!(summary.overdue_count, 0);

    assert_eq!(
        engine
            .total_payments_for_client("client-1")
            .await
            .expect("client total"),
        dec!(200)
    );
    assert_eq!(
        engine
            .total_payments_between(today(), today())
            .await
            .expect("range total"),
        dec!(200)
    );
    assert!(matches!(
        engine
            .total_payments_between(today(), date(2024, 3, 1))
            .await,
        Err(BillingError::InvalidInput(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_payments_all_land() {
    let h = Harness::new().await;
    let engine = Arc::new(h.engine());
    let invoice_id = scenario_a(&engine).await.id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .record_payment(RecordPaymentRequest {
                    invoice_id,
                    amount: dec!(25),
                    method: PaymentMethod::CreditCard,
                    payment_date: None,
                    reference: None,
                    notes: None,
                })
                .await
        }));
    }

    let mut numbers = Vec::new();
    for handle in handles {
        let payment = handle.await.expect("join").expect("payment");
        numbers.push(payment.payment_number);
    }
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers.len(), 8);

    let invoice = engine.get_invoice(invoice_id).await.expect("invoice");
    assert_eq!(invoice.amount_paid, dec!(200));
    assert_eq!(invoice.status, InvoiceStatus::PartiallyPaid);
}
