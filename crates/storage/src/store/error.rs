#![forbid(unsafe_code)]

use rusqlite::ErrorCode;
use tl_core::{LogName, RecordKey};

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    /// A stored row could not be turned back into a domain value.
    MalformedRow(String),
    LeaseNotHeld {
        identity: String,
        owner: Option<String>,
    },
    DuplicateRecord {
        identity: String,
        log: LogName,
        key: RecordKey,
    },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Sql(_) => "SQL",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::MalformedRow(_) => "MALFORMED_ROW",
            Self::LeaseNotHeld { .. } => "LEASE_NOT_HELD",
            Self::DuplicateRecord { .. } => "DUPLICATE_RECORD",
        }
    }

    /// Busy/locked failures that may succeed on retry. Everything else is
    /// persistent from the caller's point of view.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sql(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::MalformedRow(message) => write!(f, "malformed row: {message}"),
            Self::LeaseNotHeld { identity, owner } => match owner {
                Some(owner) => write!(
                    f,
                    "lease not held (identity={identity}, owner={owner})"
                ),
                None => write!(f, "lease not held (identity={identity}, no lease row)"),
            },
            Self::DuplicateRecord { identity, log, key } => write!(
                f,
                "duplicate log record (identity={identity}, log={log}, key={key})"
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Sql(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}
