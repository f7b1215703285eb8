//! Reconciliation against a live PostgreSQL server.
//!
//! Requires `DATABASE_URL` pointing at a scratch database. Run with:
//!   DATABASE_URL=postgres://localhost/casebill_test \
//!     cargo test --features integration --test postgres_reconciliation

use std::sync::Arc;

use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use uuid::Uuid;

use casebill::billing::{BillingEngine, LogTimeEntryRequest, RecordPaymentRequest};
use casebill::config::{BillingConfig, DatabaseBackend, DatabaseConfig};
use casebill::db::postgres::PgBackend;
use casebill::db::{ActivityCode, Database, InvoiceStatus, PaymentMethod};
use casebill::directory::InMemoryDirectory;
use casebill::error::BillingError;

/// Engine plus a case id unique to this test run, so tests can share one database.
async fn setup() -> Option<(Arc<BillingEngine>, String)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("Skipping: DATABASE_URL not set");
        return None;
    };

    let config = DatabaseConfig {
        backend: DatabaseBackend::Postgres,
        libsql_path: None,
        libsql_url: None,
        libsql_auth_token: None,
        database_url: Some(SecretString::from(url)),
        pool_size: 8,
    };
    let backend = PgBackend::new(&config).await.expect("connect to postgres");
    backend.run_migrations().await.expect("migrations");

    let suffix = Uuid::new_v4().simple().to_string();
    let client_id = format!("client-{suffix}");
    let case_id = format!("case-{suffix}");
    let directory = InMemoryDirectory::new()
        .with_client(&client_id, "Acme Corp")
        .with_case(&case_id, &client_id)
        .with_attorney("att-100", Some(dec!(100)))
        .with_attorney("att-150", Some(dec!(150)));

    let engine = BillingEngine::new(
        Arc::new(backend),
        Arc::new(directory),
        BillingConfig::default(),
    );
    Some((Arc::new(engine), case_id))
}

async fn log(engine: &BillingEngine, case_id: &str, attorney: &str, hours: Decimal) {
    engine
        .log_time_entry(LogTimeEntryRequest {
            case_id: case_id.to_string(),
            attorney_id: attorney.to_string(),
            hours,
            description: "Reviewed production set".to_string(),
            activity_code: ActivityCode::Rev,
            entry_date: None,
            hourly_rate: None,
            entry_code: None,
        })
        .await
        .expect("log time entry");
}

fn payment(invoice_id: Uuid, amount: Decimal) -> RecordPaymentRequest {
    RecordPaymentRequest {
        invoice_id,
        amount,
        method: PaymentMethod::BankTransfer,
        payment_date: None,
        reference: None,
        notes: None,
    }
}

#[tokio::test]
async fn bill_pay_and_guard_delete() {
    let Some((engine, case_id)) = setup().await else {
        return;
    };
    log(&engine, &case_id, "att-100", dec!(3)).await;
    log(&engine, &case_id, "att-150", dec!(2)).await;

    let invoice = engine
        .bill_time_entries(&case_id, None, None)
        .await
        .expect("bill");
    assert_eq!(invoice.amount, dec!(600));
    assert_eq!(invoice.status, InvoiceStatus::Issued);
    assert!(invoice.invoice_number.starts_with("INV"));

    engine
        .record_payment(payment(invoice.id, dec!(200)))
        .await
        .expect("payment");
    let details = engine.invoice_details(invoice.id).await.expect("details");
    assert_eq!(details.invoice.status, InvoiceStatus::PartiallyPaid);
    assert_eq!(details.balance, dec!(400));
    assert!(details.time_entries.iter().all(|e| e.billed));

    let err = engine
        .delete_invoice(invoice.id)
        .await
        .expect_err("invoice has a payment");
    assert!(matches!(err, BillingError::HasPayments { .. }), "{err}");

    engine
        .record_payment(payment(invoice.id, dec!(400)))
        .await
        .expect("payment");
    let paid = engine.get_invoice(invoice.id).await.expect("invoice");
    assert_eq!(paid.status, InvoiceStatus::Paid);
    assert_eq!(paid.amount_paid, dec!(600));
}

#[tokio::test]
async fn concurrent_payments_serialize_on_the_invoice() {
    let Some((engine, case_id)) = setup().await else {
        return;
    };
    log(&engine, &case_id, "att-100", dec!(10)).await;
    let invoice_id = engine
        .bill_time_entries(&case_id, None, None)
        .await
        .expect("bill")
        .id;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.record_payment(payment(invoice_id, dec!(50))).await
        }));
    }
    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.expect("join").expect("payment").payment_number);
    }
    numbers.sort();
    numbers.dedup();
    assert_eq!(numbers.len(), 6);

    let invoice = engine.get_invoice(invoice_id).await.expect("invoice");
    assert_eq!(invoice.amount_paid, dec!(300));
    assert_eq!(invoice.status, InvoiceStatus::PartiallyPaid);
}
