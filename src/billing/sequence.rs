//! Human-readable numbers: `INV000001`, `PMT000001`, `TE000001`.
//!
//! A number is minted inside the write transaction that inserts its row. The
//! store serializes minting per prefix for the life of that transaction, so
//! two concurrent writers can never read the same maximum.

use chrono::Utc;

use crate::billing::unit_of_work::with_transaction;
use crate::db::{Database, SequenceKind, SequenceStore, TxMode};
use crate::error::BillingError;

/// Width of the zero-padded numeric suffix.
pub const SEQUENCE_WIDTH: usize = 6;

pub fn format_number(kind: SequenceKind, value: u64) -> String {
    format!("{}{:0width$}", kind.prefix(), value, width = SEQUENCE_WIDTH)
}

/// Numeric suffix of `number` when it is `prefix` followed only by digits.
pub fn parse_number(kind: SequenceKind, number: &str) -> Option<u64> {
    let digits = number.strip_prefix(kind.prefix())?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Number synthesized from the wall clock when the stored maximum is unreadable.
fn fallback_number(kind: SequenceKind) -> String {
    format!("{}{}", kind.prefix(), Utc::now().timestamp_millis())
}

/// Next number for `kind`, strictly above every stored number with that prefix.
pub async fn mint<S>(store: &mut S, kind: SequenceKind) -> String
where
    S: SequenceStore + ?Sized,
{
    match store.max_sequence_value(kind).await {
        Ok(max) => format_number(kind, max.saturating_add(1)),
        Err(e) => {
            let number = fallback_number(kind);
            tracing::warn!(
                prefix = kind.prefix(),
                error = %e,
                fallback = %number,
                "Could not read sequence maximum; using timestamp number"
            );
            number
        }
    }
}

/// Preview of the next number without reserving it.
pub async fn peek(db: &dyn Database, kind: SequenceKind) -> Result<String, BillingError> {
    with_transaction(db, TxMode::Read, move |tx| {
        Box::pin(async move { Ok::<_, BillingError>(mint(tx, kind).await) })
    })
    .await
}
