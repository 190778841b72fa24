#![forbid(unsafe_code)]

mod error;
mod events;
mod leases;
mod logs;
mod support;
mod types;

pub use error::StoreError;
pub use types::*;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DB_FILE_NAME: &str = "tranlease.db";
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// How lease and log transactions take their write lock.
///
/// `Pessimistic` begins every write transaction with `BEGIN IMMEDIATE`, the
/// SQLite counterpart of `SELECT ... FOR UPDATE`, so competing members queue
/// on the busy timeout instead of losing the compare-and-set. `Optimistic`
/// relies on the guarded UPDATE alone. Both are correct.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockingMode {
    #[default]
    Optimistic,
    Pessimistic,
}

impl LockingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimistic => "optimistic",
            Self::Pessimistic => "pessimistic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Some(Self::Optimistic),
            "pessimistic" => Some(Self::Pessimistic),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub peer_locking_enabled: bool,
    pub locking_mode: LockingMode,
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            peer_locking_enabled: true,
            locking_mode: LockingMode::default(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// SQLite backing of the shared log store. Every cluster member (and every
/// worker inside a member) opens its own handle on the same database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    storage_dir: PathBuf,
    options: StoreOptions,
}

impl SqliteStore {
    pub fn open(storage_dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;

        let conn = Connection::open(storage_dir.join(DB_FILE_NAME))?;
        conn.busy_timeout(options.busy_timeout)?;
        support::migrate_sqlite_schema(&conn)?;

        tracing::debug!(
            storage_dir = %storage_dir.display(),
            peer_locking_enabled = options.peer_locking_enabled,
            locking_mode = options.locking_mode.as_str(),
            "opened recovery log store"
        );
        Ok(Self {
            conn,
            storage_dir,
            options,
        })
    }

    /// Second handle on the same database, e.g. for another worker thread.
    pub fn reopen(&self) -> Result<Self, StoreError> {
        Self::open(&self.storage_dir, self.options.clone())
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(DB_FILE_NAME)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn schema_version(&self) -> Result<Option<String>, StoreError> {
        use rusqlite::OptionalExtension;
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn write_tx(&mut self) -> Result<Transaction<'_>, StoreError> {
        let behavior = match self.options.locking_mode {
            LockingMode::Optimistic => TransactionBehavior::Deferred,
            LockingMode::Pessimistic => TransactionBehavior::Immediate,
        };
        Ok(self.conn.transaction_with_behavior(behavior)?)
    }
}
