//! Schema for the libSQL backend.
//!
//! Migrations are append-only. Each one is applied inside its own transaction
//! and recorded in `schema_migrations`, so re-running is a no-op.

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "billing",
    sql: r#"
CREATE TABLE IF NOT EXISTS invoices (
    id TEXT PRIMARY KEY,
    invoice_number TEXT NOT NULL UNIQUE,
    client_id TEXT NOT NULL,
    case_id TEXT NOT NULL,
    issue_date TEXT NOT NULL,
    due_date TEXT NOT NULL,
    amount TEXT NOT NULL DEFAULT '0' CHECK (CAST(amount AS REAL) >= 0),
    amount_paid TEXT NOT NULL DEFAULT '0' CHECK (CAST(amount_paid AS REAL) >= 0),
    status TEXT NOT NULL DEFAULT 'draft',
    notes TEXT,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_invoices_client ON invoices(client_id);
CREATE INDEX IF NOT EXISTS idx_invoices_case ON invoices(case_id);
CREATE INDEX IF NOT EXISTS idx_invoices_status_due ON invoices(status, due_date);

CREATE TABLE IF NOT EXISTS time_entries (
    id TEXT PRIMARY KEY,
    entry_code TEXT NOT NULL UNIQUE,
    case_id TEXT NOT NULL,
    attorney_id TEXT NOT NULL,
    entry_date TEXT NOT NULL,
    hours TEXT NOT NULL CHECK (CAST(hours AS REAL) >= 0),
    description TEXT NOT NULL DEFAULT '',
    activity_code TEXT NOT NULL DEFAULT 'OTH',
    hourly_rate TEXT,
    billed INTEGER NOT NULL DEFAULT 0,
    invoice_id TEXT REFERENCES invoices(id),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    CHECK (billed = (invoice_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_time_entries_case_billed ON time_entries(case_id, billed);
CREATE INDEX IF NOT EXISTS idx_time_entries_invoice ON time_entries(invoice_id);

CREATE TABLE IF NOT EXISTS payments (
    id TEXT PRIMARY KEY,
    payment_number TEXT NOT NULL UNIQUE,
    invoice_id TEXT NOT NULL REFERENCES invoices(id) ON DELETE CASCADE,
    client_id TEXT NOT NULL,
    payment_date TEXT NOT NULL,
    amount TEXT NOT NULL CHECK (CAST(amount AS REAL) > 0),
    payment_method TEXT NOT NULL,
    reference TEXT,
    notes TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_payments_invoice ON payments(invoice_id);
CREATE INDEX IF NOT EXISTS idx_payments_client_date ON payments(client_id, payment_date);
"#,
}];

/// Apply every migration newer than the recorded schema version.
pub async fn run(conn: &libsql::Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(e.to_string()))?;

    let current = current_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply(conn, migration).await?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied libSQL migration"
        );
    }
    Ok(())
}

async fn current_version(conn: &libsql::Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => Ok(super::libsql::get_i64(&row, 0)),
        None => Ok(0),
    }
}

async fn apply(conn: &libsql::Connection, migration: &Migration) -> Result<(), DatabaseError> {
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    let result = async {
        conn.execute_batch(migration.sql).await?;
        conn.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await?;
        Ok::<(), libsql::Error>(())
    }
    .await;

    match result {
        Ok(()) => {
            conn.execute("COMMIT", ()).await?;
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", ()).await;
            Err(DatabaseError::Migration(format!(
                "migration V{} ({}) failed: {}",
                migration.version, migration.name, e
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MIGRATIONS;

    #[test]
    fn migration_versions_strictly_increase() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.first(), Some(&1));
    }
}
