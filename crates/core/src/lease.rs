#![forbid(unsafe_code)]

use crate::ids::{RecoveryGroup, ServerIdentity};
use crate::latch::Latch;
use crate::staleness::{is_stale, lease_age_ms};
use std::time::Duration;

/// One row of the lease (control) table, latch already decoded.
///
/// `raw_latch` keeps the stored integer so conditional writes compare against
/// exactly what was read, including values the decoder did not recognize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub server_identity: ServerIdentity,
    pub recovery_group: RecoveryGroup,
    pub owner: ServerIdentity,
    pub lease_time_ms: i64,
    pub latch: Latch,
    pub raw_latch: Option<i64>,
    pub backend_url: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claimability {
    /// Renewed within the threshold by a lock-aware owner.
    Live { age_ms: i64 },
    Stale { age_ms: i64 },
    /// Last written by a lock-disabled member; adoptable at once.
    Legacy,
    /// Owner gave the lease up explicitly.
    Released,
}

impl Claimability {
    pub fn is_claimable(self) -> bool {
        !matches!(self, Self::Live { .. })
    }
}

impl Lease {
    /// Row a member writes when it takes `identity` for itself or a peer.
    pub fn owned(
        identity: ServerIdentity,
        group: RecoveryGroup,
        owner: ServerIdentity,
        now_ms: i64,
        latch: Latch,
        backend_url: Option<String>,
    ) -> Self {
        Self {
            server_identity: identity,
            recovery_group: group,
            owner,
            lease_time_ms: now_ms,
            latch,
            raw_latch: Some(latch.encode()),
            backend_url,
        }
    }

    pub fn is_owned_by(&self, identity: &ServerIdentity) -> bool {
        &self.owner == identity
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        lease_age_ms(self.lease_time_ms, now_ms)
    }

    pub fn is_stale(&self, now_ms: i64, threshold: Duration) -> bool {
        is_stale(self.lease_time_ms, now_ms, threshold)
    }

    /// Whether a peer may claim this lease. The latch only overrides the
    /// timestamp when the reader runs with peer locking; without it the
    /// decision is pure staleness.
    pub fn claimability(
        &self,
        now_ms: i64,
        threshold: Duration,
        peer_locking_enabled: bool,
    ) -> Claimability {
        if peer_locking_enabled {
            match self.latch {
                Latch::LegacyMarker(_) => return Claimability::Legacy,
                Latch::LockAware(_) if self.latch.is_released() => {
                    return Claimability::Released;
                }
                Latch::LockAware(_) => {}
            }
        }
        let age_ms = self.age_ms(now_ms);
        if self.is_stale(now_ms, threshold) {
            Claimability::Stale { age_ms }
        } else {
            Claimability::Live { age_ms }
        }
    }

    /// Copy of this row with a new owner, timestamp and latch.
    pub fn reowned(
        &self,
        owner: ServerIdentity,
        now_ms: i64,
        latch: Latch,
        backend_url: Option<String>,
    ) -> Self {
        Self {
            server_identity: self.server_identity.clone(),
            recovery_group: self.recovery_group.clone(),
            owner,
            lease_time_ms: now_ms,
            latch,
            raw_latch: Some(latch.encode()),
            backend_url,
        }
    }
}
