#![forbid(unsafe_code)]

use crate::ids::ServerIdentity;
use crate::log::LogName;
use std::fmt;

/// Why a peer claim did not go through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// The lease has not been unrenewed for long enough yet.
    NotStale { age_ms: i64 },
    /// Another process claimed or renewed the row since it was read.
    OwnerChanged { owner: ServerIdentity },
    /// The row disappeared since it was read.
    Missing,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotStale { .. } => "not_stale",
            Self::OwnerChanged { .. } => "owner_changed",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStale { age_ms } => write!(f, "not stale (age_ms={age_ms})"),
            Self::OwnerChanged { owner } => write!(f, "claimed by {owner}"),
            Self::Missing => write!(f, "lease row missing"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunKind {
    Local,
    Peer,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Peer => "peer",
        }
    }
}

/// Observable lifecycle events of the locking and recovery layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoverySignal {
    LeaseClaimed {
        identity: ServerIdentity,
        kind: RunKind,
        previous_owner: Option<ServerIdentity>,
    },
    RecoveryComplete {
        identity: ServerIdentity,
        kind: RunKind,
        records_recovered: usize,
        in_doubt: usize,
    },
    LogCleared {
        identity: ServerIdentity,
        log: LogName,
    },
    PeerRecoveryAttempted {
        identity: ServerIdentity,
        observed_owner: ServerIdentity,
        lease_age_ms: i64,
    },
    PeerClaimRejected {
        identity: ServerIdentity,
        reason: RejectReason,
    },
    RecoveryFailed {
        identity: ServerIdentity,
        attempt: u32,
        /// Stable error code, e.g. `DUPLICATE_RECORD` or `SQL`.
        code: &'static str,
        error: String,
        /// False when the run waits for an operator instead of the next tick.
        retryable: bool,
    },
    /// The lease could not be renewed; ownership is unconfirmed.
    RenewalFailed {
        identity: ServerIdentity,
        code: &'static str,
        error: String,
        /// Time since the last successful claim or renewal.
        unconfirmed_ms: i64,
    },
    LeaseLost {
        identity: ServerIdentity,
        current_owner: Option<ServerIdentity>,
    },
    LeaseReleased {
        identity: ServerIdentity,
    },
    PeerLeaseRetired {
        identity: ServerIdentity,
    },
}

impl RecoverySignal {
    pub fn identity(&self) -> &ServerIdentity {
        match self {
            Self::LeaseClaimed { identity, .. }
            | Self::RecoveryComplete { identity, .. }
            | Self::LogCleared { identity, .. }
            | Self::PeerRecoveryAttempted { identity, .. }
            | Self::PeerClaimRejected { identity, .. }
            | Self::RecoveryFailed { identity, .. }
            | Self::RenewalFailed { identity, .. }
            | Self::LeaseLost { identity, .. }
            | Self::LeaseReleased { identity }
            | Self::PeerLeaseRetired { identity } => identity,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::LeaseClaimed { .. } => "lease_claimed",
            Self::RecoveryComplete { .. } => "recovery_complete",
            Self::LogCleared { .. } => "log_cleared",
            Self::PeerRecoveryAttempted { .. } => "peer_recovery_attempted",
            Self::PeerClaimRejected { .. } => "peer_claim_rejected",
            Self::RecoveryFailed { .. } => "recovery_failed",
            Self::RenewalFailed { .. } => "renewal_failed",
            Self::LeaseLost { .. } => "lease_lost",
            Self::LeaseReleased { .. } => "lease_released",
            Self::PeerLeaseRetired { .. } => "peer_lease_retired",
        }
    }
}
