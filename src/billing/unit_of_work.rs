//! The single construct every engine operation runs through.

use futures::future::BoxFuture;

use crate::db::{BillingTransaction, Database, TxMode};
use crate::error::BillingError;

/// Run `op` inside one store transaction.
///
/// Commits when `op` returns `Ok`. On `Err` the transaction is rolled back and
/// the original error is returned; a failed rollback is logged, not surfaced.
/// Nothing `op` writes is visible to other callers before the commit.
///
/// ```ignore
/// let total = with_transaction(db, TxMode::Read, |tx| {
///     Box::pin(async move { Ok(tx.list_invoices(&InvoiceFilter::All).await?.len()) })
/// })
/// .await?;
/// ```
pub async fn with_transaction<T, F>(
    db: &dyn Database,
    mode: TxMode,
    op: F,
) -> Result<T, BillingError>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn BillingTransaction) -> BoxFuture<'t, Result<T, BillingError>>
        + Send,
{
    let mut tx = db.begin(mode).await?;
    let result = op(tx.as_mut()).await;

    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(
                    error = %err,
                    rollback_error = %rollback_err,
                    "Rollback failed after billing error"
                );
            } else if mode == TxMode::Write {
                tracing::debug!(error = %err, "Rolled back billing transaction");
            }
            Err(err)
        }
    }
}
