//! Session status persistence.
//!
//! Sessions move through a fixed set of status values as stages run:
//! created, extracting, extracted, chunking, chunked, embedding, embedded,
//! uploading, completed, cancelled, and error. Only the status and the last
//! error are
//! stored here; everything else about a session lives on disk in its
//! directory.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::error::DatabaseError;

/// A session row.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
            })?;
        }
        let conn = Connection::open(path).map_err(DatabaseError::Connection)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;
        Self::with_connection(conn)
    }

    /// In-memory store, used in tests.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Connection)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, DatabaseError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'created',
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(DatabaseError::Query)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create the session in `created` status if it does not exist yet.
    pub fn ensure_session(&self, session_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO sessions (id, status, created_at, updated_at)
            VALUES (?1, 'created', ?2, ?2)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![session_id, now],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Set the session status; clears any stored error.
    pub fn set_status(&self, session_id: &str, status: &str) -> Result<(), DatabaseError> {
        self.ensure_session(session_id)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET status = ?2, error = NULL, updated_at = ?3 WHERE id = ?1",
            params![session_id, status, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    /// Move the session to `error` status with a message.
    pub fn set_error(&self, session_id: &str, message: &str) -> Result<(), DatabaseError> {
        self.ensure_session(session_id)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET status = 'error', error = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id, message, Utc::now().to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, status, error, created_at, updated_at FROM sessions WHERE id = ?1",
            params![session_id],
            |row| {
                Ok(SessionRecord {
                    id: row.get(0)?,
                    status: row.get(1)?,
                    error: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(DatabaseError::Query)
    }
}
