#![forbid(unsafe_code)]

//! Claim, renew and release of lease rows.
//!
//! Every mutation is a conditional write against the row as last read. A lost
//! race is an outcome, not an error: own claims re-read and retry at once,
//! peer claims report `Rejected` and leave the next scan to try again. Busy
//! and locked store errors are retried with a doubling backoff.

use crate::config::RetryPolicy;
use crate::error::RecoveryError;
use std::time::Duration;
use tl_core::{Claimability, Latch, Lease, RecoveryGroup, RejectReason, ServerIdentity};
use tl_storage::{CasOutcome, StorageBackend, StoreError};

/// Re-read and retry rounds for own-identity writes that lose a race.
const MAX_CAS_ROUNDS: usize = 16;
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct LeaseSettings {
    pub stale_threshold: Duration,
    pub peer_recovery_precedence: bool,
    pub backend_url: Option<String>,
    pub retry: RetryPolicy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOwnOutcome {
    Acquired {
        lease: Lease,
        /// Set when the row was taken over from another owner.
        previous_owner: Option<ServerIdentity>,
    },
    AlreadyOwnedByOther { owner: ServerIdentity },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerClaimOutcome {
    Acquired(Lease),
    Rejected(RejectReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed(Lease),
    LostOwnership { current_owner: Option<ServerIdentity> },
}

pub struct LeaseManager<B> {
    backend: B,
    settings: LeaseSettings,
}

impl<B: StorageBackend> LeaseManager<B> {
    pub fn new(backend: B, settings: LeaseSettings) -> Self {
        Self { backend, settings }
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    pub fn peer_locking_enabled(&self) -> bool {
        self.backend.peer_locking_enabled()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Runs `op` against the backend, retrying transient failures.
    pub fn with_store<T>(
        &mut self,
        op: &'static str,
        mut f: impl FnMut(&mut B) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut backoff = Duration::from_millis(self.settings.retry.backoff_ms);
        let mut attempt = 1u32;
        loop {
            match f(&mut self.backend) {
                Err(err) if err.is_transient() && attempt < self.settings.retry.attempts => {
                    tracing::debug!(op, attempt, error = %err, "transient store error, retrying");
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    pub fn read(&mut self, identity: &ServerIdentity) -> Result<Option<Lease>, StoreError> {
        self.with_store("read_lease", |backend| backend.read_lease(identity))
    }

    pub fn list(&mut self, group: &RecoveryGroup) -> Result<Vec<Lease>, StoreError> {
        self.with_store("list_leases", |backend| backend.list_leases(group))
    }

    fn held_latch(&self) -> Latch {
        Latch::held(self.backend.peer_locking_enabled())
    }

    /// Takes `identity` for itself. Own recovery never waits for staleness:
    /// whatever owner the row names is overwritten, unless peer recovery
    /// precedence is configured and that owner is still live.
    pub fn claim_own(
        &mut self,
        identity: &ServerIdentity,
        group: &RecoveryGroup,
        now_ms: i64,
    ) -> Result<ClaimOwnOutcome, RecoveryError> {
        let latch = self.held_latch();
        let enabled = self.peer_locking_enabled();

        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.read(identity)? else {
                let fresh = Lease::owned(
                    identity.clone(),
                    group.clone(),
                    identity.clone(),
                    now_ms,
                    latch,
                    self.settings.backend_url.clone(),
                );
                if self.with_store("insert_lease", |backend| backend.insert_lease(&fresh))? {
                    tracing::info!(identity = %identity, group = %group, "created lease row");
                    return Ok(ClaimOwnOutcome::Acquired {
                        lease: fresh,
                        previous_owner: None,
                    });
                }
                continue;
            };

            let foreign = !current.is_owned_by(identity);
            if foreign
                && self.settings.peer_recovery_precedence
                && !current
                    .claimability(now_ms, self.settings.stale_threshold, enabled)
                    .is_claimable()
            {
                tracing::info!(
                    identity = %identity,
                    owner = %current.owner,
                    lease_age_ms = current.age_ms(now_ms),
                    "own lease held by a live peer, deferring"
                );
                return Ok(ClaimOwnOutcome::AlreadyOwnedByOther {
                    owner: current.owner,
                });
            }

            let mut next = current.reowned(
                identity.clone(),
                now_ms,
                latch,
                self.settings.backend_url.clone(),
            );
            next.recovery_group = group.clone();
            if self.compare_and_set(&current, &next)?.is_applied() {
                let previous_owner = foreign.then(|| current.owner.clone());
                if let Some(previous) = &previous_owner {
                    tracing::info!(
                        identity = %identity,
                        previous_owner = %previous,
                        "took own lease back from another owner"
                    );
                }
                return Ok(ClaimOwnOutcome::Acquired {
                    lease: next,
                    previous_owner,
                });
            }
        }
        Err(RecoveryError::ContendedLease {
            identity: identity.clone(),
        })
    }

    /// Claims a peer's lease as last observed. Fails unless the observed row
    /// is claimable and nobody has touched it since.
    pub fn claim_peer(
        &mut self,
        claimant: &ServerIdentity,
        observed: &Lease,
        now_ms: i64,
    ) -> Result<PeerClaimOutcome, RecoveryError> {
        let enabled = self.peer_locking_enabled();
        let claimability = observed.claimability(now_ms, self.settings.stale_threshold, enabled);
        if let Claimability::Live { age_ms } = claimability {
            return Ok(PeerClaimOutcome::Rejected(RejectReason::NotStale { age_ms }));
        }

        let next = observed.reowned(
            claimant.clone(),
            now_ms,
            self.held_latch(),
            self.settings.backend_url.clone(),
        );
        match self.compare_and_set(observed, &next)? {
            CasOutcome::Applied => {
                tracing::info!(
                    identity = %observed.server_identity,
                    previous_owner = %observed.owner,
                    claimability = ?claimability,
                    "claimed peer lease"
                );
                Ok(PeerClaimOutcome::Acquired(next))
            }
            CasOutcome::Conflict {
                current: Some(current),
            } => Ok(PeerClaimOutcome::Rejected(RejectReason::OwnerChanged {
                owner: current.owner,
            })),
            CasOutcome::Conflict { current: None } => {
                Ok(PeerClaimOutcome::Rejected(RejectReason::Missing))
            }
        }
    }

    pub fn renew(
        &mut self,
        identity: &ServerIdentity,
        owner: &ServerIdentity,
        now_ms: i64,
    ) -> Result<RenewOutcome, RecoveryError> {
        let latch = self.held_latch();
        for _ in 0..MAX_CAS_ROUNDS {
            let Some(current) = self.read(identity)? else {
                return Ok(RenewOutcome::LostOwnership {
                    current_owner: None,
                });
            };
            if !current.is_owned_by(owner) {
                return Ok(RenewOutcome::LostOwnership {
                    current_owner: Some(current.owner),
                });
            }
            let backend_url = current
                .backend_url
                .clone()
                .or_else(|| self.settings.backend_url.clone());
            let next = current.reowned(owner.clone(), now_ms, latch, backend_url);
            match self.compare_and_set(&current, &next)? {
                CasOutcome::Applied => return Ok(RenewOutcome::Renewed(next)),
                CasOutcome::Conflict {
                    current: Some(changed),
                } if changed.is_owned_by(owner) => continue,
                CasOutcome::Conflict { current } => {
                    return Ok(RenewOutcome::LostOwnership {
                        current_owner: current.map(|lease| lease.owner),
                    });
                }
            }
        }
        Err(RecoveryError::ContendedLease {
            identity: identity.clone(),
        })
    }

    /// Marks the lease released if `owner` still holds it. Returns whether
    /// the row was updated.
    pub fn release(
        &mut self,
        identity: &ServerIdentity,
        owner: &ServerIdentity,
        now_ms: i64,
    ) -> Result<bool, RecoveryError> {
        let latch = Latch::released(self.peer_locking_enabled());
        let Some(current) = self.read(identity)? else {
            return Ok(false);
        };
        if !current.is_owned_by(owner) {
            return Ok(false);
        }
        let next = current.reowned(owner.clone(), now_ms, latch, current.backend_url.clone());
        Ok(self.compare_and_set(&current, &next)?.is_applied())
    }

    /// Deletes the row if `owner` still holds it.
    pub fn retire(
        &mut self,
        identity: &ServerIdentity,
        owner: &ServerIdentity,
    ) -> Result<bool, RecoveryError> {
        let Some(current) = self.read(identity)? else {
            return Ok(false);
        };
        if !current.is_owned_by(owner) {
            return Ok(false);
        }
        Ok(self.with_store("delete_lease", |backend| backend.delete_lease(&current))?)
    }

    fn compare_and_set(&mut self, expected: &Lease, new: &Lease) -> Result<CasOutcome, StoreError> {
        self.with_store("conditional_write_lease", |backend| {
            backend.conditional_write_lease(expected, new)
        })
    }
}
