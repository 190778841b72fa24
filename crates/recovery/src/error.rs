#![forbid(unsafe_code)]

use crate::coordinator::RunState;
use std::path::PathBuf;
use tl_core::{LogName, RecordKey, ServerIdentity};
use tl_storage::StoreError;

#[derive(Debug)]
pub enum RecoveryError {
    Store(StoreError),
    /// The recovery agent could not process a log.
    Agent(String),
    /// Log access for an identity this process does not hold as `Active`.
    NotOwner {
        identity: ServerIdentity,
        state: Option<RunState>,
    },
    /// Key collisions found in a log before recovery; never retried away.
    DuplicateRecords {
        identity: ServerIdentity,
        log: LogName,
        keys: Vec<RecordKey>,
    },
    /// Another worker of this process is already recovering the identity.
    RecoveryInProgress { identity: ServerIdentity },
    /// Conditional writes kept losing to concurrent writers.
    ContendedLease { identity: ServerIdentity },
    Config(ConfigError),
}

impl RecoveryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(err) => err.code(),
            Self::Agent(_) => "AGENT",
            Self::NotOwner { .. } => "NOT_OWNER",
            Self::DuplicateRecords { .. } => "DUPLICATE_RECORD",
            Self::RecoveryInProgress { .. } => "RECOVERY_IN_PROGRESS",
            Self::ContendedLease { .. } => "CONTENDED_LEASE",
            Self::Config(_) => "CONFIG",
        }
    }

    /// False for failures that stay the same however often they are retried,
    /// such as colliding record keys or rows that cannot be decoded.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::DuplicateRecords { .. } | Self::Store(StoreError::MalformedRow(_))
        )
    }

    /// Owner seen by the store when it refused a log write for lack of a lease.
    pub fn lost_to(&self) -> Option<Option<ServerIdentity>> {
        match self {
            Self::Store(StoreError::LeaseNotHeld { owner, .. }) => Some(
                owner
                    .as_deref()
                    .and_then(|owner| ServerIdentity::try_new(owner).ok()),
            ),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "store: {err}"),
            Self::Agent(message) => write!(f, "recovery agent: {message}"),
            Self::NotOwner { identity, state } => match state {
                Some(state) => write!(
                    f,
                    "not the active owner of {identity} (run state {})",
                    state.as_str()
                ),
                None => write!(f, "not the owner of {identity} (no recovery run)"),
            },
            Self::DuplicateRecords {
                identity,
                log,
                keys,
            } => {
                write!(f, "duplicate records in {log} of {identity}:")?;
                for key in keys {
                    write!(f, " {key}")?;
                }
                Ok(())
            }
            Self::RecoveryInProgress { identity } => {
                write!(f, "recovery of {identity} is already in progress")
            }
            Self::ContendedLease { identity } => {
                write!(f, "lease for {identity} kept changing during the update")
            }
            Self::Config(err) => write!(f, "config: {err}"),
        }
    }
}

impl std::error::Error for RecoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for RecoveryError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ConfigError> for RecoveryError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        message: String,
    },
    InvalidEnv {
        name: &'static str,
        value: String,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "read {}: {source}", path.display()),
            Self::Parse { path, message } => write!(f, "parse {}: {message}", path.display()),
            Self::InvalidEnv { name, value } => write!(f, "invalid {name}={value:?}"),
            Self::Invalid(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}
