//! Durable state for the daemon: paired apps, pairing requests and the
//! completion audit log, kept in one SQLite database.

mod apps;
mod connect;
mod history;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use thiserror::Error;

pub use apps::{App, NewApp};
pub use connect::{ConnectRequest, ConnectStatus, PairingStatus};
pub use history::{HistoryEntry, HistoryFilter, HistorySort, HistoryStatus};

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;
CREATE TABLE IF NOT EXISTS apps (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL DEFAULT '',
    scope TEXT NOT NULL DEFAULT 'chat',
    token TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS app_providers (
    app_id TEXT NOT NULL REFERENCES apps(id),
    provider_id TEXT NOT NULL,
    PRIMARY KEY (app_id, provider_id)
);
CREATE TABLE IF NOT EXISTS history (
    id TEXT PRIMARY KEY,
    app_id TEXT NOT NULL,
    app_name TEXT NOT NULL,
    model TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL DEFAULT '',
    messages TEXT NOT NULL DEFAULT '[]',
    response TEXT NOT NULL DEFAULT '{}',
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'success',
    error_message TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS connect_requests (
    id TEXT PRIMARY KEY,
    app_name TEXT NOT NULL,
    app_url TEXT NOT NULL DEFAULT '',
    app_icon TEXT NOT NULL DEFAULT '',
    requested_scope TEXT NOT NULL DEFAULT 'chat',
    status TEXT NOT NULL DEFAULT 'pending',
    token TEXT,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_app_id ON history(app_id);
CREATE INDEX IF NOT EXISTS idx_history_created_at ON history(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_connect_status ON connect_requests(status, expires_at);
"#;

/// Errors produced by [`Store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("creating data directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One SQLite connection in WAL mode behind a mutex. Every operation is a
/// single statement or transaction.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

/// Unrecognised value in an enum-like text column.
#[derive(Debug, Error)]
#[error("unexpected value '{0}'")]
pub struct UnknownValue(pub String);

/// Read a text column through `FromStr`.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_keeps_schema_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.db");
        let app = {
            let store = Store::open(&path).unwrap();
            store.create_app(&NewApp::new("Notes")).unwrap()
        };
        let store = Store::open(&path).unwrap();
        let found = store.get_app_by_token(&app.token).unwrap().expect("app");
        assert_eq!(found.id, app.id);
    }
}
