//! SQLite-backed desired-state table.
//!
//! Survives agent restarts so the reconciliation loop resumes driving
//! containers toward the last status a caller asked for.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use berth_reconcile::DesiredStatus;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// One row of the desired-state table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredState {
    pub container_id: String,
    pub status: DesiredStatus,
    pub updated_at: DateTime<Utc>,
}

/// SQLite desired-state store.
///
/// The connection sits behind a mutex so the store can be shared between the
/// request handlers and the reconciliation loop.
pub struct DesiredStateStore {
    conn: Mutex<Connection>,
}

impl DesiredStateStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS desired_state (
                container_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Desired-state schema initialized");
        Ok(())
    }

    /// Record the desired status of a container (last write wins).
    pub fn set(&self, container_id: &str, status: DesiredStatus) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO desired_state (container_id, status, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(container_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![container_id, status.as_str(), Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Desired status of a container, `None` if it is unmanaged.
    pub fn get(&self, container_id: &str) -> Result<Option<DesiredStatus>, StoreError> {
        let status: Option<String> = self
            .conn()
            .query_row(
                "SELECT status FROM desired_state WHERE container_id = ?1",
                params![container_id],
                |row| row.get(0),
            )
            .optional()?;

        status
            .map(|s| s.parse().map_err(|_| StoreError::Invalid(s)))
            .transpose()
    }

    /// Stop managing a container. Removing a missing row is not an error.
    pub fn remove(&self, container_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "DELETE FROM desired_state WHERE container_id = ?1",
            params![container_id],
        )?;
        Ok(())
    }

    /// All managed containers, ordered by ID.
    pub fn list(&self) -> Result<Vec<DesiredState>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT container_id, status, updated_at FROM desired_state ORDER BY container_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(container_id, status, updated_at)| {
                Ok(DesiredState {
                    status: status.parse().map_err(|_| StoreError::Invalid(status))?,
                    updated_at: Utc
                        .timestamp_millis_opt(updated_at)
                        .single()
                        .ok_or_else(|| {
                            StoreError::Invalid(format!("bad timestamp for {container_id}"))
                        })?,
                    container_id,
                })
            })
            .collect()
    }
}
