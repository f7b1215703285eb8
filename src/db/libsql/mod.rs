//! libSQL backend for the Database trait.
//!
//! One `libsql::Database` handle is shared; every transaction opens its own
//! connection. Write transactions hold an in-process writer lock and start
//! with `BEGIN IMMEDIATE`, so SQLite's database-level write lock is taken up
//! front instead of on the first write.

mod billing;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::{BillingTransaction, Database, TxMode};
use crate::error::DatabaseError;

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Embedded libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<libsql::Database>,
    writer: Arc<Mutex<()>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Config(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libSQL database: {}", e)))?;
        let backend = Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        };

        // WAL lets readers proceed while a writer holds the lock.
        let conn = backend.connect().await?;
        conn.query("PRAGMA journal_mode = WAL", ()).await?;
        Ok(backend)
    }

    /// Open a local replica that syncs from a remote libSQL server.
    pub async fn new_remote_replica(
        path: &Path,
        url: &str,
        auth_token: &str,
    ) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_remote_replica(path, url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("failed to open libSQL replica: {}", e)))?;
        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Open a configured connection.
    pub async fn connect(&self) -> Result<libsql::Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("failed to connect: {}", e)))?;
        conn.query(&format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT_MS), ())
            .await?;
        conn.query("PRAGMA foreign_keys = ON", ()).await?;
        Ok(conn)
    }
}

/// Open unit of work on a libSQL connection.
pub struct LibSqlTransaction {
    conn: libsql::Connection,
    // Held until commit/rollback/drop.
    _writer: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn BillingTransaction>, DatabaseError> {
        let writer = match mode {
            TxMode::Write => Some(Arc::clone(&self.writer).lock_owned().await),
            TxMode::Read => None,
        };
        let conn = self.connect().await?;
        let begin = match mode {
            TxMode::Write => "BEGIN IMMEDIATE",
            TxMode::Read => "BEGIN",
        };
        conn.execute(begin, ()).await?;
        Ok(Box::new(LibSqlTransaction {
            conn,
            _writer: writer,
        }))
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _writer = self.writer.lock().await;
        let conn = self.connect().await?;
        super::libsql_migrations::run(&conn).await
    }
}

#[async_trait]
impl BillingTransaction for LibSqlTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.conn.execute("COMMIT", ()).await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.conn.execute("ROLLBACK", ()).await?;
        Ok(())
    }
}

// ==================== Row helpers ====================

pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    match row.get_value(idx) {
        Ok(libsql::Value::Text(s)) => s,
        Ok(libsql::Value::Integer(i)) => i.to_string(),
        Ok(libsql::Value::Real(f)) => f.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    match row.get_value(idx) {
        Ok(libsql::Value::Text(s)) => Some(s),
        Ok(libsql::Value::Integer(i)) => Some(i.to_string()),
        Ok(libsql::Value::Real(f)) => Some(f.to_string()),
        _ => None,
    }
}

pub(crate) fn get_i64(row: &libsql::Row, idx: i32) -> i64 {
    match row.get_value(idx) {
        Ok(libsql::Value::Integer(i)) => i,
        Ok(libsql::Value::Text(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn text(value: impl Into<String>) -> libsql::Value {
    libsql::Value::Text(value.into())
}

pub(crate) fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub(crate) fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} date '{}': {}", field, raw, e)))
}

pub(crate) fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("invalid {} uuid: {}", field, e)))
}

pub(crate) fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(raw.trim()).map_err(|e| {
        DatabaseError::Serialization(format!("invalid {} decimal '{}': {}", field, raw, e))
    })
}
