//! casebill: the billing reconciliation core of a legal practice tool.
//!
//! Time entries record billable work, invoices bill them, and payments settle
//! invoices. `billing::BillingEngine` keeps the three consistent: an
//! invoice's amount always equals the value of the entries it bills, its
//! paid amount always equals the sum of its payments, and an entry is billed
//! by at most one invoice.

pub mod billing;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod settings;
