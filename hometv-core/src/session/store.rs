use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

use crate::sqlite::configure_connection;

use super::Session;

const SESSIONS_SCHEMA: &str = include_str!("../../sql/sessions.sql");

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("failed to open session database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on session database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("session store path not configured")]
    MissingStore,
}

pub type SessionStoreResult<T> = Result<T, SessionStoreError>;

/// Durable side of the guard. The in-memory view stays authoritative for
/// concurrency decisions; this store only has to keep up eventually.
pub trait SessionStore: Send + Sync {
    fn persist(&self, session: &Session) -> SessionStoreResult<()>;
    fn add_bytes(
        &self,
        session_id: &str,
        bytes: u64,
        at: DateTime<Utc>,
    ) -> SessionStoreResult<()>;
    fn close(&self, session_id: &str, ended_at: DateTime<Utc>) -> SessionStoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteSessionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteSessionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SessionStoreResult<SqliteSessionStore> {
        let path = self.path.ok_or(SessionStoreError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSessionStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSessionStore {
    pub fn builder() -> SqliteSessionStoreBuilder {
        SqliteSessionStoreBuilder::new()
    }

    fn open(&self) -> SessionStoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SessionStoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| SessionStoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SessionStoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SESSIONS_SCHEMA)?;
        Ok(())
    }

    /// Fetches the persisted byte counter for a session. The request path
    /// never reads back; this exists for tooling and tests.
    pub fn bytes_transferred(&self, session_id: &str) -> SessionStoreResult<Option<u64>> {
        let conn = self.open()?;
        let bytes = conn
            .query_row(
                "SELECT bytes_transferred FROM stream_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(bytes.map(|value| value.max(0) as u64))
    }
}

impl SessionStore for SqliteSessionStore {
    fn persist(&self, session: &Session) -> SessionStoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO stream_sessions (
                id, subscriber_id, channel_slug, device_id,
                started_at, last_activity, bytes_transferred, ended_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)
            ON CONFLICT(id) DO UPDATE SET
                last_activity = excluded.last_activity",
            params![
                &session.id,
                &session.subscriber_id,
                &session.channel_slug,
                &session.device_id,
                session.started_at.to_rfc3339(),
                session.last_activity.to_rfc3339(),
                session.bytes_transferred as i64,
            ],
        )?;
        Ok(())
    }

    fn add_bytes(
        &self,
        session_id: &str,
        bytes: u64,
        at: DateTime<Utc>,
    ) -> SessionStoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE stream_sessions
             SET bytes_transferred = bytes_transferred + ?2, last_activity = ?3
             WHERE id = ?1",
            params![session_id, bytes as i64, at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn close(&self, session_id: &str, ended_at: DateTime<Utc>) -> SessionStoreResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE stream_sessions SET ended_at = ?2 WHERE id = ?1",
            params![session_id, ended_at.to_rfc3339()],
        )?;
        Ok(())
    }
}
