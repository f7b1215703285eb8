//! Invoice status derivation.
//!
//! Status is a function of the stored status, the amounts, the due date, and
//! today's date. The engine re-derives it after every write that touches one
//! of those inputs.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::db::{InvoiceRecord, InvoiceStatus};

/// Derive the status an invoice should carry. First matching rule wins:
///
/// 1. `Draft` and `Cancelled` are manual states and never change here.
/// 2. Paid in full (including a zero amount) is `Paid`.
/// 3. Anything paid is `PartiallyPaid`.
/// 4. Due before today is `Overdue`.
/// 5. Otherwise `Issued`.
pub fn derive_status(
    current: InvoiceStatus,
    amount: Decimal,
    amount_paid: Decimal,
    due_date: NaiveDate,
    today: NaiveDate,
) -> InvoiceStatus {
    match current {
        InvoiceStatus::Draft | InvoiceStatus::Cancelled => current,
        _ if amount_paid >= amount => InvoiceStatus::Paid,
        _ if amount_paid > Decimal::ZERO => InvoiceStatus::PartiallyPaid,
        _ if due_date < today => InvoiceStatus::Overdue,
        _ => InvoiceStatus::Issued,
    }
}

/// Status of `invoice` as of `today`.
pub fn derive_for(invoice: &InvoiceRecord, today: NaiveDate) -> InvoiceStatus {
    derive_status(
        invoice.status,
        invoice.amount,
        invoice.amount_paid,
        invoice.due_date,
        today,
    )
}

pub fn is_fully_paid(invoice: &InvoiceRecord) -> bool {
    invoice.amount_paid >= invoice.amount
}

/// Past due, not fully paid, and not cancelled.
pub fn is_overdue(invoice: &InvoiceRecord, today: NaiveDate) -> bool {
    invoice.status != InvoiceStatus::Cancelled
        && !is_fully_paid(invoice)
        && invoice.due_date < today
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    use super::{derive_status, is_overdue};
    use crate::db::{InvoiceRecord, InvoiceStatus};

    const ALL: [InvoiceStatus; 6] = [
        InvoiceStatus::Draft,
        InvoiceStatus::Issued,
        InvoiceStatus::PartiallyPaid,
        InvoiceStatus::Paid,
        InvoiceStatus::Overdue,
        InvoiceStatus::Cancelled,
    ];

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn manual_states_are_preserved() {
        let today = date(2024, 6, 1);
        for paid in [dec!(0), dec!(50), dec!(100)] {
            assert_eq!(
                derive_status(InvoiceStatus::Draft, dec!(100), paid, date(2024, 1, 1), today),
                InvoiceStatus::Draft
            );
            assert_eq!(
                derive_status(
                    InvoiceStatus::Cancelled,
                    dec!(100),
                    paid,
                    date(2024, 1, 1),
                    today
                ),
                InvoiceStatus::Cancelled
            );
        }
    }

    #[test]
    fn payment_rules_take_precedence_over_due_date() {
        let today = date(2024, 6, 1);
        let past_due = date(2024, 5, 1);
        assert_eq!(
            derive_status(InvoiceStatus::Overdue, dec!(600), dec!(600), past_due, today),
            InvoiceStatus::Paid
        );
        assert_eq!(
            derive_status(InvoiceStatus::Overdue, dec!(600), dec!(200), past_due, today),
            InvoiceStatus::PartiallyPaid
        );
        assert_eq!(
            derive_status(InvoiceStatus::Issued, dec!(600), dec!(0), past_due, today),
            InvoiceStatus::Overdue
        );
    }

    #[test]
    fn due_today_is_not_overdue() {
        let today = date(2024, 6, 1);
        assert_eq!(
            derive_status(InvoiceStatus::Issued, dec!(600), dec!(0), today, today),
            InvoiceStatus::Issued
        );
    }

    #[test]
    fn zero_amount_invoices_are_paid() {
        let today = date(2024, 6, 1);
        assert_eq!(
            derive_status(InvoiceStatus::Issued, dec!(0), dec!(0), today, today),
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn overpayment_is_paid() {
        let today = date(2024, 6, 1);
        assert_eq!(
            derive_status(InvoiceStatus::PartiallyPaid, dec!(100), dec!(150), today, today),
            InvoiceStatus::Paid
        );
    }

    #[test]
    fn removing_all_payments_falls_back_to_issued_or_overdue() {
        let today = date(2024, 6, 1);
        assert_eq!(
            derive_status(InvoiceStatus::Paid, dec!(600), Decimal::ZERO, date(2024, 7, 1), today),
            InvoiceStatus::Issued
        );
        assert_eq!(
            derive_status(InvoiceStatus::Paid, dec!(600), Decimal::ZERO, date(2024, 5, 1), today),
            InvoiceStatus::Overdue
        );
    }

    #[test]
    fn derivation_is_idempotent() {
        let today = date(2024, 6, 1);
        let due_dates = [date(2024, 5, 1), today, date(2024, 7, 1)];
        let amounts = [dec!(0), dec!(600)];
        let paid = [dec!(0), dec!(200), dec!(600), dec!(700)];
        for status in ALL {
            for due in due_dates {
                for amount in amounts {
                    for p in paid {
                        let once = derive_status(status, amount, p, due, today);
                        let twice = derive_status(once, amount, p, due, today);
                        assert_eq!(once, twice, "{status:?} {amount} {p} {due}");
                    }
                }
            }
        }
    }

    #[test]
    fn overdue_predicate_ignores_cancelled_and_paid() {
        let today = date(2024, 6, 1);
        let mut invoice = InvoiceRecord {
            id: Uuid::new_v4(),
            invoice_number: "INV000001".to_string(),
            client_id: "client-1".to_string(),
            case_id: "case-1".to_string(),
            issue_date: date(2024, 4, 1),
            due_date: date(2024, 5, 1),
            amount: dec!(100),
            amount_paid: dec!(0),
            status: InvoiceStatus::Issued,
            notes: None,
            version: 1,
        };
        assert!(is_overdue(&invoice, today));

        invoice.amount_paid = dec!(100);
        assert!(!is_overdue(&invoice, today));

        invoice.amount_paid = dec!(0);
        invoice.status = InvoiceStatus::Cancelled;
        assert!(!is_overdue(&invoice, today));
    }
}
