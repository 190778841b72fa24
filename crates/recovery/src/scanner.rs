#![forbid(unsafe_code)]

use crate::coordinator::{AdoptOutcome, Coordinator, PeerDisposition, RecoveryProgress};
use crate::error::RecoveryError;
use tl_core::{Claimability, RecoverySignal};
use tl_storage::StorageBackend;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Peer rows looked at (own identity and rows already in the run table
    /// are not counted).
    pub observed: usize,
    pub attempted: usize,
    pub recovered: usize,
    pub rejected: usize,
    pub pending: usize,
    pub failed: usize,
}

/// Looks for peers in this member's recovery group whose lease may be taken
/// over, and adopts them through the coordinator.
pub struct PeerScanner<B> {
    coordinator: Coordinator<B>,
}

impl<B: StorageBackend> PeerScanner<B> {
    pub fn new(coordinator: Coordinator<B>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&mut self) -> &mut Coordinator<B> {
        &mut self.coordinator
    }

    pub fn scan_once(&mut self, now_ms: i64) -> Result<ScanReport, RecoveryError> {
        let mut report = ScanReport::default();
        let leases = self.coordinator.leases();
        if !leases.peer_locking_enabled() {
            return Ok(report);
        }
        let threshold = leases.settings().stale_threshold;

        let group = self.coordinator.group().clone();
        let own = self.coordinator.identity().clone();
        let rows = self.coordinator.leases().list(&group)?;

        for lease in rows {
            if lease.server_identity == own
                || self.coordinator.run_table().contains(&lease.server_identity)
            {
                continue;
            }
            report.observed += 1;

            let claimability = lease.claimability(now_ms, threshold, true);
            if let Claimability::Live { age_ms } = claimability {
                tracing::debug!(
                    identity = %lease.server_identity,
                    owner = %lease.owner,
                    lease_age_ms = age_ms,
                    "peer lease is live"
                );
                continue;
            }
            // A lease handed back after recovery stays released; only pick it
            // up again while records are left to resolve.
            if claimability == Claimability::Released
                && self.coordinator.logs_empty(&lease.server_identity)
            {
                tracing::debug!(
                    identity = %lease.server_identity,
                    owner = %lease.owner,
                    "released peer lease has nothing to recover"
                );
                continue;
            }

            report.attempted += 1;
            self.coordinator.emit(
                RecoverySignal::PeerRecoveryAttempted {
                    identity: lease.server_identity.clone(),
                    observed_owner: lease.owner.clone(),
                    lease_age_ms: lease.age_ms(now_ms),
                },
                now_ms,
            );

            match self.coordinator.adopt_peer(&lease, now_ms) {
                Ok(AdoptOutcome::Adopted(RecoveryProgress::Complete(summary))) => {
                    report.recovered += 1;
                    let disposition = self
                        .coordinator
                        .finish_peer(&lease.server_identity, now_ms);
                    tracing::debug!(
                        identity = %lease.server_identity,
                        records_recovered = summary.records_recovered,
                        disposition = ?disposition,
                        "peer recovered"
                    );
                    if disposition == PeerDisposition::NotHeld {
                        tracing::warn!(
                            identity = %lease.server_identity,
                            "peer lease changed hands before it could be handed back"
                        );
                    }
                }
                Ok(AdoptOutcome::Adopted(RecoveryProgress::Pending { .. })) => {
                    report.pending += 1;
                }
                Ok(AdoptOutcome::Adopted(RecoveryProgress::Halted { code, .. })) => {
                    report.failed += 1;
                    tracing::warn!(
                        identity = %lease.server_identity,
                        code,
                        "peer recovery halted, lease kept until the log is repaired"
                    );
                }
                Ok(AdoptOutcome::Adopted(RecoveryProgress::Lost { .. })) => {
                    report.failed += 1;
                }
                Ok(AdoptOutcome::Rejected(_)) => report.rejected += 1,
                Ok(AdoptOutcome::AlreadyRunning(_)) => {}
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(
                        identity = %lease.server_identity,
                        error = %err,
                        "peer claim failed"
                    );
                }
            }
        }
        Ok(report)
    }
}
