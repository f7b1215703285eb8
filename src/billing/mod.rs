//! Billing reconciliation: time entries, invoices, and payments that always
//! add up.

pub mod engine;
pub mod money;
pub mod queries;
pub mod sequence;
pub mod status;
pub mod unit_of_work;

pub use engine::{
    BillingEngine, CreateInvoiceRequest, InvoiceChanges, LogTimeEntryRequest, PaymentChanges,
    RecordPaymentRequest, TimeEntryChanges,
};
pub use money::{Clock, FixedClock, SystemClock};
pub use queries::{CaseBillingSummary, InvoiceDetails};
pub use status::derive_status;
pub use unit_of_work::with_transaction;
