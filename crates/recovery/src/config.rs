#![forbid(unsafe_code)]

//! Member configuration. Sources are layered: an optional YAML (or JSON)
//! file, then `TL_*` environment variables, then command-line flags.

use crate::coordinator::PeerReleasePolicy;
use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tl_core::{RecoveryGroup, ServerIdentity};
use tl_storage::{LockingMode, StoreOptions};

pub const DEFAULT_STALE_THRESHOLD_MS: u64 = 20_000;
pub const DEFAULT_RENEW_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 10_000;

/// Backoff applied to busy/locked store errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 50,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    pub identity: String,
    pub recovery_group: String,
    pub backend_url: Option<String>,
    pub storage_dir: PathBuf,
    pub peer_locking_enabled: bool,
    /// Only consulted when peer locking is enabled.
    pub stale_threshold_ms: u64,
    pub renew_interval_ms: u64,
    pub scan_interval_ms: u64,
    /// Leave a live foreign claim on our own identity alone at startup.
    pub peer_recovery_precedence: bool,
    pub peer_release: PeerReleasePolicy,
    pub locking_mode: LockingMode,
    /// Inline recovery attempts before a run is left for the renewal loop.
    pub recovery_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            recovery_group: String::new(),
            backend_url: None,
            storage_dir: PathBuf::from(".tranlease"),
            peer_locking_enabled: true,
            stale_threshold_ms: DEFAULT_STALE_THRESHOLD_MS,
            renew_interval_ms: DEFAULT_RENEW_INTERVAL_MS,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            peer_recovery_precedence: false,
            peer_release: PeerReleasePolicy::default(),
            locking_mode: LockingMode::default(),
            recovery_attempts: 3,
            retry: RetryPolicy::default(),
        }
    }
}

impl RecoveryConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|err| err.to_string())
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies `TL_*` overrides read through `lookup`. Blank values are
    /// ignored.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = get("TL_IDENTITY") {
            self.identity = value;
        }
        if let Some(value) = get("TL_RECOVERY_GROUP") {
            self.recovery_group = value;
        }
        if let Some(value) = get("TL_BACKEND_URL") {
            self.backend_url = Some(value);
        }
        if let Some(value) = get("TL_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(value);
        }
        if let Some(value) = get("TL_PEER_LOCKING_ENABLED") {
            self.peer_locking_enabled = parse_bool("TL_PEER_LOCKING_ENABLED", &value)?;
        }
        if let Some(value) = get("TL_STALE_THRESHOLD_MS") {
            self.stale_threshold_ms = parse_u64("TL_STALE_THRESHOLD_MS", &value)?;
        }
        if let Some(value) = get("TL_RENEW_INTERVAL_MS") {
            self.renew_interval_ms = parse_u64("TL_RENEW_INTERVAL_MS", &value)?;
        }
        if let Some(value) = get("TL_SCAN_INTERVAL_MS") {
            self.scan_interval_ms = parse_u64("TL_SCAN_INTERVAL_MS", &value)?;
        }
        if let Some(value) = get("TL_PEER_RECOVERY_PRECEDENCE") {
            self.peer_recovery_precedence = parse_bool("TL_PEER_RECOVERY_PRECEDENCE", &value)?;
        }
        if let Some(value) = get("TL_PEER_RELEASE") {
            self.peer_release =
                PeerReleasePolicy::parse(&value).ok_or(ConfigError::InvalidEnv {
                    name: "TL_PEER_RELEASE",
                    value,
                })?;
        }
        if let Some(value) = get("TL_LOCKING_MODE") {
            self.locking_mode = LockingMode::parse(&value).ok_or(ConfigError::InvalidEnv {
                name: "TL_LOCKING_MODE",
                value,
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_identity()?;
        self.group()?;
        if self.stale_threshold_ms == 0 {
            return Err(ConfigError::Invalid(
                "stale_threshold_ms must be positive".to_string(),
            ));
        }
        if self.renew_interval_ms == 0 || self.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "renew_interval_ms and scan_interval_ms must be positive".to_string(),
            ));
        }
        if self.renew_interval_ms >= self.stale_threshold_ms {
            return Err(ConfigError::Invalid(format!(
                "renew_interval_ms ({}) must be below stale_threshold_ms ({})",
                self.renew_interval_ms, self.stale_threshold_ms
            )));
        }
        if self.recovery_attempts == 0 {
            return Err(ConfigError::Invalid(
                "recovery_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server_identity(&self) -> Result<ServerIdentity, ConfigError> {
        ServerIdentity::try_new(self.identity.trim())
            .map_err(|err| ConfigError::Invalid(format!("identity: {err}")))
    }

    pub fn group(&self) -> Result<RecoveryGroup, ConfigError> {
        RecoveryGroup::try_new(self.recovery_group.trim())
            .map_err(|err| ConfigError::Invalid(format!("recovery_group: {err}")))
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            peer_locking_enabled: self.peer_locking_enabled,
            locking_mode: self.locking_mode,
            ..StoreOptions::default()
        }
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_u64(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
    })
}
