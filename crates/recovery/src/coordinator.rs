#![forbid(unsafe_code)]

//! Per-identity recovery state machine.
//!
//! A run is created when this process starts claiming an identity and is
//! dropped when the lease is released, retired or lost. Log access goes
//! through the coordinator so that nothing is written for an identity whose
//! run is not `Active`; the store repeats the owner check inside the write.

use crate::error::RecoveryError;
use crate::lease_manager::{ClaimOwnOutcome, LeaseManager, PeerClaimOutcome, RenewOutcome};
use crate::signals::SignalHub;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tl_core::staleness;
use tl_core::{
    Lease, LogName, LogRecord, RecordKey, RecoveryGroup, RecoverySignal, RejectReason, RunKind,
    ServerIdentity,
};
use tl_storage::StorageBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Claiming,
    Claimed,
    Recovering,
    Active,
    Releasing,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Claimed => "claimed",
            Self::Recovering => "recovering",
            Self::Active => "active",
            Self::Releasing => "releasing",
        }
    }

    /// States in which this process holds the lease.
    pub fn holds_lease(self) -> bool {
        matches!(self, Self::Claimed | Self::Recovering | Self::Active)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryRun {
    pub identity: ServerIdentity,
    pub kind: RunKind,
    pub state: RunState,
    pub claimed_at_ms: i64,
    /// Lease time of the last successful claim or renewal.
    pub last_renewed_ms: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set while one worker is inside `recover` for this identity.
    pub in_progress: bool,
    /// Recovery stopped on an error retrying cannot fix. Only an explicit
    /// `recover` call resumes the run.
    pub halted: bool,
}

/// What happens to a peer's lease once its logs have been recovered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerReleasePolicy {
    /// Delete the row when both logs are empty, otherwise release it.
    #[default]
    Retire,
    Release,
    /// Keep the peer identity `Active` on this process.
    Retain,
}

impl PeerReleasePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retire => "retire",
            Self::Release => "release",
            Self::Retain => "retain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retire" => Some(Self::Retire),
            "release" => Some(Self::Release),
            "retain" => Some(Self::Retain),
            _ => None,
        }
    }
}

/// Run bookkeeping shared by the workers of one process.
#[derive(Clone, Debug, Default)]
pub struct RunTable {
    runs: Arc<Mutex<BTreeMap<ServerIdentity, RecoveryRun>>>,
}

impl RunTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &ServerIdentity) -> Option<RecoveryRun> {
        self.runs.lock().get(identity).cloned()
    }

    pub fn state(&self, identity: &ServerIdentity) -> RunState {
        self.runs
            .lock()
            .get(identity)
            .map_or(RunState::Idle, |run| run.state)
    }

    pub fn contains(&self, identity: &ServerIdentity) -> bool {
        self.runs.lock().contains_key(identity)
    }

    pub fn snapshot(&self) -> Vec<RecoveryRun> {
        self.runs.lock().values().cloned().collect()
    }

    /// Inserts a `Claiming` run unless one exists. The table lock makes this
    /// the in-process guard against two workers claiming the same identity.
    fn begin_claim(&self, identity: &ServerIdentity, kind: RunKind, now_ms: i64) -> bool {
        let mut runs = self.runs.lock();
        if runs.contains_key(identity) {
            return false;
        }
        runs.insert(
            identity.clone(),
            RecoveryRun {
                identity: identity.clone(),
                kind,
                state: RunState::Claiming,
                claimed_at_ms: now_ms,
                last_renewed_ms: now_ms,
                attempts: 0,
                last_error: None,
                in_progress: false,
                halted: false,
            },
        );
        true
    }

    fn update<T>(
        &self,
        identity: &ServerIdentity,
        f: impl FnOnce(&mut RecoveryRun) -> T,
    ) -> Option<T> {
        self.runs.lock().get_mut(identity).map(f)
    }

    /// Marks the run `Recovering` if it holds the lease and no other worker
    /// is recovering it.
    fn begin_recovery(&self, identity: &ServerIdentity) -> Result<RunKind, RunState> {
        let mut runs = self.runs.lock();
        let Some(run) = runs.get_mut(identity) else {
            return Err(RunState::Idle);
        };
        if !run.state.holds_lease() || run.in_progress {
            return Err(run.state);
        }
        run.state = RunState::Recovering;
        run.attempts += 1;
        run.in_progress = true;
        Ok(run.kind)
    }

    fn set_state(&self, identity: &ServerIdentity, state: RunState) {
        self.update(identity, |run| run.state = state);
    }

    fn remove(&self, identity: &ServerIdentity) -> Option<RecoveryRun> {
        self.runs.lock().remove(identity)
    }

    fn identities_where(&self, pred: impl Fn(&RecoveryRun) -> bool) -> Vec<ServerIdentity> {
        self.runs
            .lock()
            .values()
            .filter(|run| pred(run))
            .map(|run| run.identity.clone())
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AgentOutcome {
    /// Keys whose work is finished and may be removed from the log.
    pub resolved: Vec<RecordKey>,
    pub in_doubt: usize,
}

/// Re-drives the in-doubt work found in a recovered log.
pub trait RecoveryAgent: Send + Sync {
    fn recover(
        &self,
        identity: &ServerIdentity,
        log: LogName,
        records: &[LogRecord],
    ) -> Result<AgentOutcome, RecoveryError>;
}

/// Treats every record as completed work.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveAllAgent;

impl RecoveryAgent for ResolveAllAgent {
    fn recover(
        &self,
        _identity: &ServerIdentity,
        _log: LogName,
        records: &[LogRecord],
    ) -> Result<AgentOutcome, RecoveryError> {
        Ok(AgentOutcome {
            resolved: records.iter().map(|record| record.key).collect(),
            in_doubt: 0,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub records_recovered: usize,
    pub in_doubt: usize,
    /// Records left in the logs after recovery.
    pub remaining: usize,
    pub cleared: Vec<LogName>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryProgress {
    Complete(RecoverySummary),
    /// Run stays `Recovering`; `retry_pending` tries again.
    Pending {
        attempts: u32,
        code: &'static str,
        error: String,
    },
    /// Run stays `Recovering` holding the lease, but is not retried until
    /// the log is repaired and `recover` is called again.
    Halted {
        attempts: u32,
        code: &'static str,
        error: String,
    },
    /// The store refused a write: another process owns the identity now.
    Lost { current_owner: Option<ServerIdentity> },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started(RecoveryProgress),
    OwnedByOther { owner: ServerIdentity },
    /// A run for the identity is already in progress on this process.
    AlreadyRunning(RunState),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdoptOutcome {
    Adopted(RecoveryProgress),
    Rejected(RejectReason),
    AlreadyRunning(RunState),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerDisposition {
    Retired,
    Released,
    Retained,
    /// Ownership was gone before the policy could be applied.
    NotHeld,
}

#[derive(Clone, Debug)]
pub struct CoordinatorPolicy {
    pub peer_release: PeerReleasePolicy,
    pub recovery_attempts: u32,
}

impl Default for CoordinatorPolicy {
    fn default() -> Self {
        Self {
            peer_release: PeerReleasePolicy::default(),
            recovery_attempts: 3,
        }
    }
}

pub struct Coordinator<B> {
    identity: ServerIdentity,
    group: RecoveryGroup,
    leases: LeaseManager<B>,
    runs: RunTable,
    signals: SignalHub,
    agent: Arc<dyn RecoveryAgent>,
    policy: CoordinatorPolicy,
}

impl<B: StorageBackend> Coordinator<B> {
    pub fn new(
        identity: ServerIdentity,
        group: RecoveryGroup,
        leases: LeaseManager<B>,
        runs: RunTable,
        signals: SignalHub,
        agent: Arc<dyn RecoveryAgent>,
        policy: CoordinatorPolicy,
    ) -> Self {
        Self {
            identity,
            group,
            leases,
            runs,
            signals,
            agent,
            policy,
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn group(&self) -> &RecoveryGroup {
        &self.group
    }

    pub fn leases(&mut self) -> &mut LeaseManager<B> {
        &mut self.leases
    }

    pub fn run_table(&self) -> &RunTable {
        &self.runs
    }

    pub fn runs(&self) -> Vec<RecoveryRun> {
        self.runs.snapshot()
    }

    pub fn run_state(&self, identity: &ServerIdentity) -> RunState {
        self.runs.state(identity)
    }

    pub(crate) fn emit(&mut self, signal: RecoverySignal, now_ms: i64) {
        self.signals
            .emit(self.leases.backend_mut(), &signal, now_ms);
    }

    /// Claims this process's own identity and recovers its logs.
    pub fn start_local(&mut self, now_ms: i64) -> Result<StartOutcome, RecoveryError> {
        let identity = self.identity.clone();
        if !self.runs.begin_claim(&identity, RunKind::Local, now_ms) {
            return Ok(StartOutcome::AlreadyRunning(self.runs.state(&identity)));
        }

        let group = self.group.clone();
        let claimed = match self.leases.claim_own(&identity, &group, now_ms) {
            Ok(claimed) => claimed,
            Err(err) => {
                self.runs.remove(&identity);
                return Err(err);
            }
        };
        match claimed {
            ClaimOwnOutcome::AlreadyOwnedByOther { owner } => {
                self.runs.remove(&identity);
                Ok(StartOutcome::OwnedByOther { owner })
            }
            ClaimOwnOutcome::Acquired {
                lease,
                previous_owner,
            } => {
                self.runs.update(&identity, |run| {
                    run.state = RunState::Claimed;
                    run.claimed_at_ms = lease.lease_time_ms;
                    run.last_renewed_ms = lease.lease_time_ms;
                });
                self.emit(
                    RecoverySignal::LeaseClaimed {
                        identity: identity.clone(),
                        kind: RunKind::Local,
                        previous_owner,
                    },
                    now_ms,
                );
                Ok(StartOutcome::Started(self.drive(&identity, now_ms)))
            }
        }
    }

    /// Claims a peer lease as observed by the scanner and recovers its logs.
    pub fn adopt_peer(
        &mut self,
        observed: &Lease,
        now_ms: i64,
    ) -> Result<AdoptOutcome, RecoveryError> {
        let identity = observed.server_identity.clone();
        if !self.runs.begin_claim(&identity, RunKind::Peer, now_ms) {
            return Ok(AdoptOutcome::AlreadyRunning(self.runs.state(&identity)));
        }

        let claimant = self.identity.clone();
        let claimed = match self.leases.claim_peer(&claimant, observed, now_ms) {
            Ok(claimed) => claimed,
            Err(err) => {
                self.runs.remove(&identity);
                return Err(err);
            }
        };
        match claimed {
            PeerClaimOutcome::Rejected(reason) => {
                self.runs.remove(&identity);
                self.emit(
                    RecoverySignal::PeerClaimRejected {
                        identity,
                        reason: reason.clone(),
                    },
                    now_ms,
                );
                Ok(AdoptOutcome::Rejected(reason))
            }
            PeerClaimOutcome::Acquired(lease) => {
                self.runs.update(&identity, |run| {
                    run.state = RunState::Claimed;
                    run.claimed_at_ms = lease.lease_time_ms;
                    run.last_renewed_ms = lease.lease_time_ms;
                });
                self.emit(
                    RecoverySignal::LeaseClaimed {
                        identity: identity.clone(),
                        kind: RunKind::Peer,
                        previous_owner: Some(observed.owner.clone()),
                    },
                    now_ms,
                );
                Ok(AdoptOutcome::Adopted(self.drive(&identity, now_ms)))
            }
        }
    }

    /// Runs recovery up to the configured number of attempts.
    fn drive(&mut self, identity: &ServerIdentity, now_ms: i64) -> RecoveryProgress {
        let mut progress = self.recover_step(identity, now_ms);
        for _ in 1..self.policy.recovery_attempts {
            if !matches!(progress, RecoveryProgress::Pending { .. }) {
                break;
            }
            progress = self.recover_step(identity, now_ms);
        }
        progress
    }

    fn recover_step(&mut self, identity: &ServerIdentity, now_ms: i64) -> RecoveryProgress {
        match self.recover(identity, now_ms) {
            Ok(summary) => RecoveryProgress::Complete(summary),
            Err(RecoveryError::RecoveryInProgress { .. }) => {
                let attempts = self.runs.get(identity).map_or(0, |run| run.attempts);
                RecoveryProgress::Pending {
                    attempts,
                    code: "RECOVERY_IN_PROGRESS",
                    error: "recovery in progress on another worker".to_string(),
                }
            }
            Err(err) => {
                if let Some(current_owner) = err.lost_to() {
                    self.lose(identity, current_owner.clone(), now_ms);
                    return RecoveryProgress::Lost { current_owner };
                }
                let code = err.code();
                let retryable = err.is_retryable();
                let error = err.to_string();
                let attempts = self
                    .runs
                    .update(identity, |run| {
                        run.last_error = Some(error.clone());
                        run.halted = !retryable;
                        run.attempts
                    })
                    .unwrap_or_default();
                self.emit(
                    RecoverySignal::RecoveryFailed {
                        identity: identity.clone(),
                        attempt: attempts,
                        code,
                        error: error.clone(),
                        retryable,
                    },
                    now_ms,
                );
                if retryable {
                    RecoveryProgress::Pending {
                        attempts,
                        code,
                        error,
                    }
                } else {
                    RecoveryProgress::Halted {
                        attempts,
                        code,
                        error,
                    }
                }
            }
        }
    }

    /// Reads both logs of `identity`, hands them to the agent and removes the
    /// records it resolved. The run must hold the lease.
    pub fn recover(
        &mut self,
        identity: &ServerIdentity,
        now_ms: i64,
    ) -> Result<RecoverySummary, RecoveryError> {
        let kind = match self.runs.begin_recovery(identity) {
            Ok(kind) => kind,
            Err(RunState::Recovering) => {
                return Err(RecoveryError::RecoveryInProgress {
                    identity: identity.clone(),
                });
            }
            Err(state) => {
                return Err(RecoveryError::NotOwner {
                    identity: identity.clone(),
                    state: (state != RunState::Idle).then_some(state),
                });
            }
        };
        let recovered = self.recover_logs(identity);
        self.runs.update(identity, |run| {
            run.in_progress = false;
            if recovered.is_ok() {
                run.state = RunState::Active;
                run.last_error = None;
                run.halted = false;
            }
        });
        let summary = recovered?;

        self.emit(
            RecoverySignal::RecoveryComplete {
                identity: identity.clone(),
                kind,
                records_recovered: summary.records_recovered,
                in_doubt: summary.in_doubt,
            },
            now_ms,
        );
        for log in summary.cleared.clone() {
            self.emit(
                RecoverySignal::LogCleared {
                    identity: identity.clone(),
                    log,
                },
                now_ms,
            );
        }
        Ok(summary)
    }

    fn recover_logs(&mut self, identity: &ServerIdentity) -> Result<RecoverySummary, RecoveryError> {
        let owner = self.identity.clone();
        let agent = Arc::clone(&self.agent);
        let mut summary = RecoverySummary::default();
        for log in LogName::ALL {
            let duplicates = self.leases.with_store("find_duplicate_records", |backend| {
                backend.find_duplicate_records(identity, log)
            })?;
            if !duplicates.is_empty() {
                return Err(RecoveryError::DuplicateRecords {
                    identity: identity.clone(),
                    log,
                    keys: duplicates,
                });
            }

            let records = self.leases.with_store("read_log_records", |backend| {
                backend.read_log_records(identity, log)
            })?;
            if records.is_empty() {
                continue;
            }

            let outcome = agent.recover(identity, log, &records)?;
            let resolved = outcome
                .resolved
                .into_iter()
                .filter(|key| records.iter().any(|record| record.key == *key))
                .collect::<Vec<_>>();
            let removed = if resolved.is_empty() {
                0
            } else {
                self.leases.with_store("remove_log_records", |backend| {
                    backend.remove_log_records(&owner, identity, log, &resolved)
                })?
            };

            summary.records_recovered += removed;
            summary.in_doubt += outcome.in_doubt;
            let remaining = records.len().saturating_sub(removed);
            summary.remaining += remaining;
            if remaining == 0 {
                summary.cleared.push(log);
            }
        }
        Ok(summary)
    }

    /// Renews every lease this process holds. Runs whose lease is gone are
    /// dropped before the next write can reach the store. A run whose
    /// renewals keep failing is dropped once its last confirmed lease time is
    /// older than the stale threshold, since peers may already have taken it.
    pub fn renew_all(
        &mut self,
        now_ms: i64,
    ) -> Vec<(ServerIdentity, Result<RenewOutcome, RecoveryError>)> {
        let held = self.runs.identities_where(|run| run.state.holds_lease());
        let owner = self.identity.clone();
        let threshold = self.leases.settings().stale_threshold;
        let mut outcomes = Vec::with_capacity(held.len());
        for identity in held {
            match self.leases.renew(&identity, &owner, now_ms) {
                Ok(RenewOutcome::Renewed(lease)) => {
                    tracing::trace!(identity = %identity, lease_time_ms = lease.lease_time_ms, "lease renewed");
                    self.runs
                        .update(&identity, |run| run.last_renewed_ms = lease.lease_time_ms);
                    outcomes.push((identity, Ok(RenewOutcome::Renewed(lease))));
                }
                Ok(RenewOutcome::LostOwnership { current_owner }) => {
                    self.lose(&identity, current_owner.clone(), now_ms);
                    outcomes.push((identity, Ok(RenewOutcome::LostOwnership { current_owner })));
                }
                Err(err) => {
                    let confirmed_ms = self
                        .runs
                        .get(&identity)
                        .map_or(now_ms, |run| run.last_renewed_ms);
                    self.emit(
                        RecoverySignal::RenewalFailed {
                            identity: identity.clone(),
                            code: err.code(),
                            error: err.to_string(),
                            unconfirmed_ms: staleness::lease_age_ms(confirmed_ms, now_ms),
                        },
                        now_ms,
                    );
                    if staleness::is_stale(confirmed_ms, now_ms, threshold) {
                        self.lose(&identity, None, now_ms);
                    }
                    outcomes.push((identity, Err(err)));
                }
            }
        }
        outcomes
    }

    /// Re-drives recovery for runs left in `Recovering`.
    pub fn retry_pending(&mut self, now_ms: i64) -> Vec<(ServerIdentity, RecoveryProgress)> {
        let pending = self.runs.identities_where(|run| {
            !run.in_progress
                && !run.halted
                && matches!(run.state, RunState::Claimed | RunState::Recovering)
        });
        let mut out = Vec::with_capacity(pending.len());
        for identity in pending {
            let progress = self.recover_step(&identity, now_ms);
            if let (RecoveryProgress::Complete(_), Some(RunKind::Peer)) =
                (&progress, self.runs.get(&identity).map(|run| run.kind))
            {
                self.finish_peer(&identity, now_ms);
            }
            out.push((identity, progress));
        }
        out
    }

    /// Applies the peer release policy to a recovered peer identity.
    pub fn finish_peer(&mut self, identity: &ServerIdentity, now_ms: i64) -> PeerDisposition {
        let Some(run) = self.runs.get(identity) else {
            return PeerDisposition::NotHeld;
        };
        if run.kind != RunKind::Peer || run.state != RunState::Active {
            return PeerDisposition::NotHeld;
        }
        match self.policy.peer_release {
            PeerReleasePolicy::Retain => PeerDisposition::Retained,
            PeerReleasePolicy::Release => self.release_run(identity, now_ms),
            PeerReleasePolicy::Retire => {
                if self.logs_empty(identity) {
                    self.retire_run(identity, now_ms)
                } else {
                    self.release_run(identity, now_ms)
                }
            }
        }
    }

    pub(crate) fn logs_empty(&mut self, identity: &ServerIdentity) -> bool {
        for log in LogName::ALL {
            match self.leases.with_store("read_log_records", |backend| {
                backend.read_log_records(identity, log)
            }) {
                Ok(records) if records.is_empty() => {}
                Ok(_) => return false,
                Err(err) => {
                    tracing::warn!(identity = %identity, log = log.as_str(), error = %err, "could not check log");
                    return false;
                }
            }
        }
        true
    }

    fn retire_run(&mut self, identity: &ServerIdentity, now_ms: i64) -> PeerDisposition {
        self.runs.set_state(identity, RunState::Releasing);
        let owner = self.identity.clone();
        let retired = self.leases.retire(identity, &owner);
        self.runs.remove(identity);
        match retired {
            Ok(true) => {
                self.emit(
                    RecoverySignal::PeerLeaseRetired {
                        identity: identity.clone(),
                    },
                    now_ms,
                );
                PeerDisposition::Retired
            }
            Ok(false) => PeerDisposition::NotHeld,
            Err(err) => {
                tracing::warn!(identity = %identity, error = %err, "peer lease retirement failed");
                PeerDisposition::NotHeld
            }
        }
    }

    fn release_run(&mut self, identity: &ServerIdentity, now_ms: i64) -> PeerDisposition {
        self.runs.set_state(identity, RunState::Releasing);
        let owner = self.identity.clone();
        let released = self.leases.release(identity, &owner, now_ms);
        self.runs.remove(identity);
        match released {
            Ok(true) => {
                self.emit(
                    RecoverySignal::LeaseReleased {
                        identity: identity.clone(),
                    },
                    now_ms,
                );
                PeerDisposition::Released
            }
            Ok(false) => PeerDisposition::NotHeld,
            Err(err) => {
                tracing::warn!(identity = %identity, error = %err, "lease release failed");
                PeerDisposition::NotHeld
            }
        }
    }

    fn lose(&mut self, identity: &ServerIdentity, current_owner: Option<ServerIdentity>, now_ms: i64) {
        if self.runs.remove(identity).is_none() {
            return;
        }
        self.emit(
            RecoverySignal::LeaseLost {
                identity: identity.clone(),
                current_owner,
            },
            now_ms,
        );
    }

    fn ensure_active(&self, identity: &ServerIdentity) -> Result<(), RecoveryError> {
        let state = self.runs.state(identity);
        if state == RunState::Active {
            return Ok(());
        }
        Err(RecoveryError::NotOwner {
            identity: identity.clone(),
            state: (state != RunState::Idle).then_some(state),
        })
    }

    /// Ordinary logging path for an identity this process holds `Active`.
    pub fn write_record(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
        record: &LogRecord,
        now_ms: i64,
    ) -> Result<(), RecoveryError> {
        self.ensure_active(identity)?;
        let owner = self.identity.clone();
        let written = self.leases.with_store("write_log_record", |backend| {
            backend.write_log_record(&owner, identity, log, record)
        });
        self.after_log_write(identity, written.map_err(RecoveryError::from), now_ms)
    }

    pub fn remove_records(
        &mut self,
        identity: &ServerIdentity,
        log: LogName,
        keys: &[RecordKey],
        now_ms: i64,
    ) -> Result<usize, RecoveryError> {
        self.ensure_active(identity)?;
        let owner = self.identity.clone();
        let removed = self.leases.with_store("remove_log_records", |backend| {
            backend.remove_log_records(&owner, identity, log, keys)
        });
        self.after_log_write(identity, removed.map_err(RecoveryError::from), now_ms)
    }

    fn after_log_write<T>(
        &mut self,
        identity: &ServerIdentity,
        result: Result<T, RecoveryError>,
        now_ms: i64,
    ) -> Result<T, RecoveryError> {
        if let Err(err) = &result
            && let Some(current_owner) = err.lost_to()
        {
            self.lose(identity, current_owner, now_ms);
        }
        result
    }

    /// Releases every lease this process holds. Failures are logged; a lease
    /// that could not be released goes stale on its own.
    pub fn shutdown(&mut self, now_ms: i64) -> usize {
        let owned = self.runs.identities_where(|run| run.state.holds_lease());
        let owner = self.identity.clone();
        let mut released = 0usize;
        for identity in owned {
            self.runs.set_state(&identity, RunState::Releasing);
            match self.leases.release(&identity, &owner, now_ms) {
                Ok(true) => {
                    released += 1;
                    self.emit(
                        RecoverySignal::LeaseReleased {
                            identity: identity.clone(),
                        },
                        now_ms,
                    );
                }
                Ok(false) => {
                    tracing::info!(identity = %identity, "lease already gone at shutdown");
                }
                Err(err) => {
                    tracing::warn!(identity = %identity, error = %err, "lease release at shutdown failed");
                }
            }
            self.runs.remove(&identity);
        }
        released
    }
}
