use crate::clock::now_ms;
use crate::config::{RecoveryConfig, RetryPolicy};
use crate::coordinator::{
    AgentOutcome, Coordinator, CoordinatorPolicy, PeerDisposition, PeerReleasePolicy,
    RecoveryAgent, RecoveryProgress, ResolveAllAgent, RunState, RunTable, StartOutcome,
};
use crate::lease_manager::{
    ClaimOwnOutcome, LeaseManager, LeaseSettings, PeerClaimOutcome, RenewOutcome,
};
use crate::scanner::PeerScanner;
use crate::signals::{SignalHub, SignalRecorder, payload};
use crate::worker::{StopReason, Workers, wait_until_stopped};
use crate::{ConfigError, RecoveryError};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tl_core::{
    Latch, LogName, LogRecord, RecordKey, RecoveryGroup, RecoverySignal, RejectReason, RunKind,
    ServerIdentity,
};
use tl_storage::{MemoryStore, StorageBackend};

fn id(value: &str) -> ServerIdentity {
    ServerIdentity::try_new(value).expect("identity")
}

fn settings() -> LeaseSettings {
    LeaseSettings {
        stale_threshold: Duration::from_secs(20),
        peer_recovery_precedence: false,
        backend_url: None,
        retry: RetryPolicy {
            attempts: 5,
            backoff_ms: 1,
        },
    }
}

fn coordinator(
    identity: &str,
    store: MemoryStore,
    agent: Arc<dyn RecoveryAgent>,
    peer_release: PeerReleasePolicy,
) -> (Coordinator<MemoryStore>, Arc<SignalRecorder>) {
    let signals = SignalHub::new();
    let recorder = SignalRecorder::new();
    signals.subscribe(recorder.clone());
    let coordinator = Coordinator::new(
        id(identity),
        RecoveryGroup::default(),
        LeaseManager::new(store, settings()),
        RunTable::new(),
        signals,
        agent,
        CoordinatorPolicy {
            peer_release,
            recovery_attempts: 1,
        },
    );
    (coordinator, recorder)
}

/// Fails on the first call, then resolves every record.
struct FlakyAgent {
    fail: parking_lot::Mutex<bool>,
}

impl RecoveryAgent for FlakyAgent {
    fn recover(
        &self,
        _identity: &ServerIdentity,
        _log: LogName,
        records: &[LogRecord],
    ) -> Result<AgentOutcome, RecoveryError> {
        let mut fail = self.fail.lock();
        if *fail {
            *fail = false;
            return Err(RecoveryError::Agent("participant unreachable".to_string()));
        }
        Ok(AgentOutcome {
            resolved: records.iter().map(|record| record.key).collect(),
            in_doubt: 0,
        })
    }
}

#[test]
fn config_defaults_match_documented_values() {
    let config = RecoveryConfig::default();
    assert!(config.peer_locking_enabled);
    assert_eq!(config.stale_threshold_ms, 20_000);
    assert_eq!(config.renew_interval_ms, 5_000);
    assert_eq!(config.peer_release, PeerReleasePolicy::Retire);
    assert_eq!(config.retry, RetryPolicy::default());
}

#[test]
fn config_parses_yaml_and_env_overrides() {
    let mut config = RecoveryConfig::from_yaml_str(
        "identity: cloud001\nrecovery_group: group.a\nstale_threshold_ms: 60000\n\
         peer_release: release\nretry:\n  attempts: 2\n",
    )
    .expect("parse yaml");
    assert_eq!(config.identity, "cloud001");
    assert_eq!(config.peer_release, PeerReleasePolicy::Release);
    assert_eq!(config.retry.attempts, 2);
    assert_eq!(config.retry.backoff_ms, 50);

    let env = HashMap::from([
        ("TL_IDENTITY", "cloud002"),
        ("TL_PEER_LOCKING_ENABLED", "false"),
        ("TL_LOCKING_MODE", "pessimistic"),
        ("TL_RECOVERY_GROUP", "  "),
    ]);
    config
        .apply_env_from(|name| env.get(name).map(|value| value.to_string()))
        .expect("apply env");
    assert_eq!(config.identity, "cloud002");
    assert_eq!(config.recovery_group, "group.a");
    assert!(!config.peer_locking_enabled);
    assert_eq!(config.locking_mode, tl_storage::LockingMode::Pessimistic);
    config.validate().expect("valid");

    let bad = HashMap::from([("TL_STALE_THRESHOLD_MS", "soon")]);
    assert!(matches!(
        config.apply_env_from(|name| bad.get(name).map(|value| value.to_string())),
        Err(ConfigError::InvalidEnv {
            name: "TL_STALE_THRESHOLD_MS",
            ..
        })
    ));
}

#[test]
fn config_rejects_unknown_fields_and_bad_intervals() {
    assert!(RecoveryConfig::from_yaml_str("identiy: cloud001\n").is_err());

    let mut config = RecoveryConfig {
        identity: "cloud001".to_string(),
        ..RecoveryConfig::default()
    };
    config.renew_interval_ms = config.stale_threshold_ms;
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

    let config = RecoveryConfig::default();
    assert!(config.validate().is_err(), "identity is required");
}

#[test]
fn claim_own_creates_then_overwrites_any_owner() {
    let store = MemoryStore::new(true);
    let mut leases = LeaseManager::new(store.clone(), settings());

    let created = leases
        .claim_own(&id("cloud001"), &RecoveryGroup::default(), 1_000)
        .expect("claim");
    assert!(matches!(
        created,
        ClaimOwnOutcome::Acquired {
            previous_owner: None,
            ..
        }
    ));

    // A peer holds it with a fresh timestamp; own recovery still wins.
    store.put_raw_lease("cloud001", "", "cloud002", 5_000, Some(3));
    let retaken = leases
        .claim_own(&id("cloud001"), &RecoveryGroup::default(), 5_001)
        .expect("claim");
    match retaken {
        ClaimOwnOutcome::Acquired {
            lease,
            previous_owner,
        } => {
            assert_eq!(lease.owner, id("cloud001"));
            assert_eq!(previous_owner, Some(id("cloud002")));
        }
        other => panic!("expected acquisition, got {other:?}"),
    }
}

#[test]
fn peer_recovery_precedence_defers_to_a_live_peer() {
    let store = MemoryStore::new(true);
    store.put_raw_lease("cloud001", "", "cloud002", 10_000, Some(3));
    let mut leases = LeaseManager::new(
        store,
        LeaseSettings {
            peer_recovery_precedence: true,
            ..settings()
        },
    );

    assert_eq!(
        leases
            .claim_own(&id("cloud001"), &RecoveryGroup::default(), 15_000)
            .expect("claim"),
        ClaimOwnOutcome::AlreadyOwnedByOther {
            owner: id("cloud002")
        }
    );
    assert!(matches!(
        leases
            .claim_own(&id("cloud001"), &RecoveryGroup::default(), 40_000)
            .expect("claim"),
        ClaimOwnOutcome::Acquired { .. }
    ));
}

#[test]
fn claim_peer_is_gated_by_staleness() {
    let mut store = MemoryStore::new(true);
    store.put_raw_lease("cloud001", "", "cloud001", 10_000, Some(3));
    let observed = store
        .read_lease(&id("cloud001"))
        .expect("read")
        .expect("row");
    let mut leases = LeaseManager::new(store, settings());

    assert_eq!(
        leases
            .claim_peer(&id("cloud002"), &observed, 30_000)
            .expect("claim"),
        PeerClaimOutcome::Rejected(RejectReason::NotStale { age_ms: 20_000 })
    );
    match leases
        .claim_peer(&id("cloud002"), &observed, 30_001)
        .expect("claim")
    {
        PeerClaimOutcome::Acquired(lease) => {
            assert_eq!(lease.owner, id("cloud002"));
            assert_eq!(lease.latch, Latch::held(true));
        }
        other => panic!("expected acquisition, got {other:?}"),
    }
}

#[test]
fn claim_peer_reports_owner_change_and_missing_rows() {
    let mut store = MemoryStore::new(true);
    store.put_raw_lease("cloud001", "", "cloud001", 1_000, Some(3));
    let observed = store
        .read_lease(&id("cloud001"))
        .expect("read")
        .expect("row");

    store.put_raw_lease("cloud001", "", "cloud003", 2_000, Some(3));
    let mut leases = LeaseManager::new(store.clone(), settings());
    assert_eq!(
        leases
            .claim_peer(&id("cloud002"), &observed, 60_000)
            .expect("claim"),
        PeerClaimOutcome::Rejected(RejectReason::OwnerChanged {
            owner: id("cloud003")
        })
    );

    let current = store
        .read_lease(&id("cloud001"))
        .expect("read")
        .expect("row");
    assert!(store.delete_lease(&current).expect("delete"));
    assert_eq!(
        leases
            .claim_peer(&id("cloud002"), &observed, 60_000)
            .expect("claim"),
        PeerClaimOutcome::Rejected(RejectReason::Missing)
    );
}

#[test]
fn renew_detects_lost_ownership() {
    let store = MemoryStore::new(true);
    let mut leases = LeaseManager::new(store.clone(), settings());
    leases
        .claim_own(&id("cloud001"), &RecoveryGroup::default(), 1_000)
        .expect("claim");

    assert!(matches!(
        leases
            .renew(&id("cloud001"), &id("cloud001"), 2_000)
            .expect("renew"),
        RenewOutcome::Renewed(lease) if lease.lease_time_ms == 2_000
    ));

    store.put_raw_lease("cloud001", "", "cloud002", 2_500, Some(3));
    assert_eq!(
        leases
            .renew(&id("cloud001"), &id("cloud001"), 3_000)
            .expect("renew"),
        RenewOutcome::LostOwnership {
            current_owner: Some(id("cloud002"))
        }
    );
}

#[test]
fn transient_errors_are_retried_and_persistent_ones_surface() {
    let store = MemoryStore::new(true);
    let mut leases = LeaseManager::new(store.clone(), settings());

    store.inject_busy(3);
    assert!(matches!(
        leases
            .claim_own(&id("cloud001"), &RecoveryGroup::default(), 1_000)
            .expect("claim after retries"),
        ClaimOwnOutcome::Acquired { .. }
    ));

    store.inject_busy(10);
    let err = leases
        .renew(&id("cloud001"), &id("cloud001"), 2_000)
        .unwrap_err();
    assert_eq!(err.code(), "SQL");
    store.inject_busy(0);
}

#[test]
fn release_uses_the_latch_of_the_writer() {
    let enabled = MemoryStore::new(true);
    let mut leases = LeaseManager::new(enabled.clone(), settings());
    leases
        .claim_own(&id("cloud001"), &RecoveryGroup::default(), 1_000)
        .expect("claim");
    assert!(
        leases
            .release(&id("cloud001"), &id("cloud001"), 1_500)
            .expect("release")
    );
    let mut reader = enabled.member(true);
    let row = reader
        .read_lease(&id("cloud001"))
        .expect("read")
        .expect("row");
    assert!(row.latch.is_released());
    assert!(
        !leases
            .release(&id("cloud001"), &id("cloud002"), 1_600)
            .expect("foreign release")
    );

    let mut disabled = LeaseManager::new(enabled.member(false), settings());
    disabled
        .claim_own(&id("cloud005"), &RecoveryGroup::default(), 1_000)
        .expect("claim");
    disabled
        .release(&id("cloud005"), &id("cloud005"), 1_200)
        .expect("release");
    let row = reader
        .read_lease(&id("cloud005"))
        .expect("read")
        .expect("row");
    assert_eq!(row.raw_latch, Some(0));
}

#[test]
fn fresh_start_reaches_active_with_nothing_in_doubt() {
    let store = MemoryStore::new(true);
    let (mut member, recorder) = coordinator(
        "cloud001",
        store,
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retire,
    );

    let outcome = member.start_local(1_000).expect("start");
    match outcome {
        StartOutcome::Started(RecoveryProgress::Complete(summary)) => {
            assert_eq!(summary.records_recovered, 0);
            assert_eq!(summary.in_doubt, 0);
        }
        other => panic!("expected completed start, got {other:?}"),
    }
    assert_eq!(member.run_state(&id("cloud001")), RunState::Active);
    assert_eq!(
        recorder.event_types(),
        vec!["lease_claimed", "recovery_complete"]
    );
    assert!(matches!(
        member.start_local(1_100).expect("second start"),
        StartOutcome::AlreadyRunning(RunState::Active)
    ));
}

#[test]
fn recovery_failure_keeps_the_lease_and_is_retried() {
    let store = MemoryStore::new(true);
    store.put_raw_lease("cloud001", "", "cloud001", 1_000, Some(3));
    store.push_raw_record(
        "cloud001",
        LogName::Transaction,
        LogRecord::new(RecordKey::new(1, 1, 0), b"tx".to_vec()),
    );
    let agent = Arc::new(FlakyAgent {
        fail: parking_lot::Mutex::new(true),
    });
    let (mut member, recorder) =
        coordinator("cloud001", store.clone(), agent, PeerReleasePolicy::Retire);

    let outcome = member.start_local(2_000).expect("start");
    assert!(matches!(
        outcome,
        StartOutcome::Started(RecoveryProgress::Pending { attempts: 1, .. })
    ));
    assert_eq!(member.run_state(&id("cloud001")), RunState::Recovering);
    let run = member.runs().pop().expect("run");
    assert_eq!(run.kind, RunKind::Local);
    assert!(run.last_error.is_some());

    // Writes are refused until recovery completes.
    assert!(matches!(
        member.write_record(
            &id("cloud001"),
            LogName::Transaction,
            &LogRecord::new(RecordKey::new(2, 1, 0), b"new".to_vec()),
            2_100,
        ),
        Err(RecoveryError::NotOwner {
            state: Some(RunState::Recovering),
            ..
        })
    ));

    let retried = member.retry_pending(3_000);
    assert_eq!(retried.len(), 1);
    assert!(matches!(retried[0].1, RecoveryProgress::Complete(_)));
    assert_eq!(member.run_state(&id("cloud001")), RunState::Active);
    assert!(
        recorder
            .snapshot()
            .iter()
            .any(|signal| matches!(signal, RecoverySignal::LogCleared { log: LogName::Transaction, .. }))
    );
}

#[test]
fn duplicate_records_fail_recovery_without_dropping_the_lease() {
    let mut store = MemoryStore::new(true);
    store.put_raw_lease("cloud001", "", "cloud001", 1_000, Some(3));
    for data in ["a", "b"] {
        store.push_raw_record(
            "cloud001",
            LogName::Partner,
            LogRecord::new(RecordKey::new(4, 2, 1), data.as_bytes().to_vec()),
        );
    }
    let (mut member, recorder) = coordinator(
        "cloud001",
        store.clone(),
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retire,
    );

    let outcome = member.start_local(2_000).expect("start");
    match outcome {
        StartOutcome::Started(RecoveryProgress::Halted { code, error, .. }) => {
            assert_eq!(code, "DUPLICATE_RECORD");
            assert!(error.contains("duplicate records"), "{error}");
        }
        other => panic!("expected halted recovery, got {other:?}"),
    }
    assert_eq!(member.run_state(&id("cloud001")), RunState::Recovering);
    assert!(member.runs().iter().all(|run| run.halted));

    // Not retried on later ticks, and the lease is still renewed.
    assert!(member.retry_pending(3_000).is_empty());
    assert!(member.retry_pending(4_000).is_empty());
    assert!(matches!(
        member.renew_all(5_000).as_slice(),
        [(_, Ok(RenewOutcome::Renewed(_)))]
    ));

    let failures = recorder
        .snapshot()
        .into_iter()
        .filter_map(|signal| match signal {
            RecoverySignal::RecoveryFailed {
                code, retryable, ..
            } => Some((code, retryable)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(failures, vec![("DUPLICATE_RECORD", false)]);

    let event = store
        .list_events(Some(&id("cloud001")), 100)
        .expect("events")
        .into_iter()
        .find(|event| event.event_type == "recovery_failed")
        .expect("recovery_failed event");
    let body: serde_json::Value = serde_json::from_str(&event.payload_json).expect("payload json");
    assert_eq!(body["code"], "DUPLICATE_RECORD");
    assert_eq!(body["retryable"], false);

    // An explicit call still runs and reports the same violation.
    let err = member.recover(&id("cloud001"), 6_000).unwrap_err();
    assert_eq!(err.code(), "DUPLICATE_RECORD");
    assert!(!err.is_retryable());
}

/// Blocks inside recovery until the test lets it go.
struct GatedAgent {
    entered: parking_lot::Mutex<std::sync::mpsc::Sender<()>>,
    release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
}

impl RecoveryAgent for GatedAgent {
    fn recover(
        &self,
        _identity: &ServerIdentity,
        _log: LogName,
        records: &[LogRecord],
    ) -> Result<AgentOutcome, RecoveryError> {
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
        Ok(AgentOutcome {
            resolved: records.iter().map(|record| record.key).collect(),
            in_doubt: 0,
        })
    }
}

#[test]
fn a_run_is_recovered_by_one_worker_at_a_time() {
    let store = MemoryStore::new(true);
    store.push_raw_record(
        "cloud001",
        LogName::Transaction,
        LogRecord::new(RecordKey::new(1, 1, 0), b"tx".to_vec()),
    );
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let agent: Arc<dyn RecoveryAgent> = Arc::new(GatedAgent {
        entered: parking_lot::Mutex::new(entered_tx),
        release: parking_lot::Mutex::new(release_rx),
    });

    let runs = RunTable::new();
    let build = |backend: MemoryStore| {
        Coordinator::new(
            id("cloud001"),
            RecoveryGroup::default(),
            LeaseManager::new(backend, settings()),
            runs.clone(),
            SignalHub::new(),
            Arc::clone(&agent),
            CoordinatorPolicy::default(),
        )
    };
    let mut local = build(store.clone());
    let mut renewal = build(store.member(true));

    std::thread::scope(|scope| {
        let started = scope.spawn(move || local.start_local(1_000));
        entered_rx.recv().expect("agent entered");

        assert!(renewal.retry_pending(1_100).is_empty());
        let err = renewal.recover(&id("cloud001"), 1_100).unwrap_err();
        assert_eq!(err.code(), "RECOVERY_IN_PROGRESS");

        release_tx.send(()).expect("release agent");
        let outcome = started.join().expect("join").expect("start");
        assert!(matches!(
            outcome,
            StartOutcome::Started(RecoveryProgress::Complete(_))
        ));
    });
    assert_eq!(runs.state(&id("cloud001")), RunState::Active);
    assert!(runs.get(&id("cloud001")).is_some_and(|run| !run.in_progress));
}

#[test]
fn lost_lease_stops_log_writes() {
    let store = MemoryStore::new(true);
    let (mut member, recorder) = coordinator(
        "cloud001",
        store.clone(),
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retire,
    );
    member.start_local(1_000).expect("start");
    member
        .write_record(
            &id("cloud001"),
            LogName::Transaction,
            &LogRecord::new(RecordKey::new(1, 1, 0), b"ok".to_vec()),
            1_100,
        )
        .expect("write while active");

    store.put_raw_lease("cloud001", "", "cloud002", 1_200, Some(3));
    let renewed = member.renew_all(1_300);
    assert_eq!(renewed.len(), 1);
    match &renewed[0] {
        (identity, Ok(RenewOutcome::LostOwnership { current_owner })) => {
            assert_eq!(identity, &id("cloud001"));
            assert_eq!(current_owner, &Some(id("cloud002")));
        }
        other => panic!("expected lost ownership, got {other:?}"),
    }
    assert_eq!(member.run_state(&id("cloud001")), RunState::Idle);
    assert!(matches!(
        member.write_record(
            &id("cloud001"),
            LogName::Transaction,
            &LogRecord::new(RecordKey::new(2, 1, 0), b"late".to_vec()),
            1_400,
        ),
        Err(RecoveryError::NotOwner { state: None, .. })
    ));
    assert!(recorder.event_types().contains(&"lease_lost"));
}

#[test]
fn store_side_owner_check_drops_the_run() {
    let store = MemoryStore::new(true);
    let (mut member, _recorder) = coordinator(
        "cloud001",
        store.clone(),
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retire,
    );
    member.start_local(1_000).expect("start");

    // Taken over between two renewals: the store refuses the write.
    store.put_raw_lease("cloud001", "", "cloud002", 1_200, Some(3));
    let err = member
        .write_record(
            &id("cloud001"),
            LogName::Transaction,
            &LogRecord::new(RecordKey::new(1, 1, 0), b"x".to_vec()),
            1_300,
        )
        .unwrap_err();
    assert_eq!(err.code(), "LEASE_NOT_HELD");
    assert_eq!(member.run_state(&id("cloud001")), RunState::Idle);
}

#[test]
fn peer_release_policies() {
    for (policy, expected) in [
        (PeerReleasePolicy::Retire, PeerDisposition::Retired),
        (PeerReleasePolicy::Release, PeerDisposition::Released),
        (PeerReleasePolicy::Retain, PeerDisposition::Retained),
    ] {
        let mut store = MemoryStore::new(true);
        store.put_raw_lease("cloud001", "", "cloud001", 1_000, Some(3));
        let observed = store
            .read_lease(&id("cloud001"))
            .expect("read")
            .expect("row");
        let (mut member, _recorder) =
            coordinator("cloud002", store.clone(), Arc::new(ResolveAllAgent), policy);

        member.adopt_peer(&observed, 60_000).expect("adopt");
        assert_eq!(member.finish_peer(&id("cloud001"), 60_000), expected);

        let row = store.read_lease(&id("cloud001")).expect("read");
        match expected {
            PeerDisposition::Retired => assert!(row.is_none()),
            PeerDisposition::Released => {
                assert!(row.expect("row").latch.is_released());
                assert_eq!(member.run_state(&id("cloud001")), RunState::Idle);
            }
            _ => assert_eq!(member.run_state(&id("cloud001")), RunState::Active),
        }
    }
}

#[test]
fn released_peer_lease_is_not_readopted_on_every_scan() {
    let store = MemoryStore::new(true);
    store.put_raw_lease("cloud001", "", "cloud001", 1_000, Some(3));
    let (member, recorder) = coordinator(
        "cloud002",
        store.clone(),
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Release,
    );
    let mut scanner = PeerScanner::new(member);

    let first = scanner.scan_once(60_000).expect("scan");
    assert_eq!((first.attempted, first.recovered), (1, 1));
    for now in [70_000, 80_000] {
        let report = scanner.scan_once(now).expect("scan");
        assert_eq!(report.observed, 1);
        assert_eq!(report.attempted, 0);
    }
    let types = recorder.event_types();
    for kind in ["peer_recovery_attempted", "lease_claimed", "lease_released"] {
        assert_eq!(types.iter().filter(|seen| **seen == kind).count(), 1, "{kind}");
    }

    // Records showing up under the released row make it worth adopting again.
    store.push_raw_record(
        "cloud001",
        LogName::Transaction,
        LogRecord::new(RecordKey::new(9, 1, 0), b"late".to_vec()),
    );
    let again = scanner.scan_once(90_000).expect("scan");
    assert_eq!((again.attempted, again.recovered), (1, 1));
}

#[test]
fn failing_renewals_surface_and_drop_the_run_after_the_threshold() {
    let store = MemoryStore::new(true);
    let (mut member, recorder) = coordinator(
        "cloud001",
        store.clone(),
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retire,
    );
    member.start_local(1_000).expect("start");
    store.inject_busy(1_000);

    let first = member.renew_all(10_000);
    assert_eq!(first.len(), 1);
    assert!(matches!(&first[0], (_, Err(err)) if err.code() == "SQL"));
    assert_eq!(member.run_state(&id("cloud001")), RunState::Active);
    assert!(recorder.snapshot().iter().any(|signal| matches!(
        signal,
        RecoverySignal::RenewalFailed { code: "SQL", unconfirmed_ms: 9_000, .. }
    )));

    // Past the stale threshold since the last confirmed renewal.
    let second = member.renew_all(21_500);
    assert!(matches!(second.as_slice(), [(_, Err(_))]));
    assert_eq!(member.run_state(&id("cloud001")), RunState::Idle);
    assert!(recorder.snapshot().iter().any(|signal| matches!(
        signal,
        RecoverySignal::LeaseLost { current_owner: None, .. }
    )));
    assert!(member.renew_all(22_000).is_empty());
}

#[test]
fn successful_renewal_moves_the_confirmed_time_forward() {
    let store = MemoryStore::new(true);
    let (mut member, _recorder) = coordinator(
        "cloud001",
        store.clone(),
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retire,
    );
    member.start_local(1_000).expect("start");
    member.renew_all(15_000);
    store.inject_busy(1_000);

    // 20s after the claim but only 10s after the last renewal.
    member.renew_all(25_000);
    assert_eq!(member.run_state(&id("cloud001")), RunState::Active);
    assert_eq!(
        member.runs().pop().map(|run| run.last_renewed_ms),
        Some(15_000)
    );
}

#[test]
fn shutdown_releases_every_held_lease() {
    let store = MemoryStore::new(true);
    store.put_raw_lease("cloud009", "", "cloud009", 1_000, Some(1));
    let mut reader = store.member(true);
    let observed = reader
        .read_lease(&id("cloud009"))
        .expect("read")
        .expect("row");
    let (mut member, recorder) = coordinator(
        "cloud001",
        store,
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retain,
    );
    member.start_local(2_000).expect("start");
    member.adopt_peer(&observed, 2_000).expect("adopt legacy peer");
    assert_eq!(member.runs().len(), 2);

    assert_eq!(member.shutdown(3_000), 2);
    assert!(member.runs().is_empty());
    for identity in ["cloud001", "cloud009"] {
        let row = reader.read_lease(&id(identity)).expect("read").expect("row");
        assert!(row.latch.is_released(), "{identity}");
    }
    assert_eq!(
        recorder
            .event_types()
            .iter()
            .filter(|event| **event == "lease_released")
            .count(),
        2
    );
}

#[test]
fn signal_payloads_carry_reason_codes() {
    let rejected = payload(&RecoverySignal::PeerClaimRejected {
        identity: id("cloud001"),
        reason: RejectReason::NotStale { age_ms: 5_000 },
    });
    assert_eq!(rejected["reason"]["code"], "not_stale");
    assert_eq!(rejected["reason"]["age_ms"], 5_000);

    let changed = payload(&RecoverySignal::PeerClaimRejected {
        identity: id("cloud001"),
        reason: RejectReason::OwnerChanged {
            owner: id("cloud003"),
        },
    });
    assert_eq!(changed["reason"]["code"], "owner_changed");
    assert_eq!(changed["reason"]["owner"], "cloud003");

    let cleared = payload(&RecoverySignal::LogCleared {
        identity: id("cloud001"),
        log: LogName::Partner,
    });
    assert_eq!(cleared["log"], "partnerlog");
}

#[test]
fn signals_are_persisted_as_events() {
    let store = MemoryStore::new(true);
    let (mut member, _recorder) = coordinator(
        "cloud001",
        store.clone(),
        Arc::new(ResolveAllAgent),
        PeerReleasePolicy::Retire,
    );
    member.start_local(1_000).expect("start");

    let mut reader = store.member(true);
    let events = reader
        .list_events(Some(&id("cloud001")), 10)
        .expect("events");
    let types = events
        .iter()
        .map(|event| event.event_type.as_str())
        .collect::<Vec<_>>();
    assert_eq!(types, vec!["lease_claimed", "recovery_complete"]);
    assert!(events.iter().all(|event| event.ts_ms == 1_000));
}

#[test]
fn wait_until_stopped_returns_on_request_or_deadline() {
    let flag = Arc::new(AtomicBool::new(false));
    assert_eq!(
        wait_until_stopped(&flag, Some(Duration::from_millis(20))),
        StopReason::Deadline
    );

    let setter = Arc::clone(&flag);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        setter.store(true, Ordering::SeqCst);
    });
    assert_eq!(wait_until_stopped(&flag, None), StopReason::Requested);
    handle.join().expect("join");
}

/// Fails once, then blocks inside every later call until released.
struct StallingAgent {
    failed: AtomicBool,
    entered: parking_lot::Mutex<std::sync::mpsc::Sender<()>>,
    release: parking_lot::Mutex<std::sync::mpsc::Receiver<()>>,
}

impl RecoveryAgent for StallingAgent {
    fn recover(
        &self,
        _identity: &ServerIdentity,
        _log: LogName,
        records: &[LogRecord],
    ) -> Result<AgentOutcome, RecoveryError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(RecoveryError::Agent("participant unreachable".to_string()));
        }
        let _ = self.entered.lock().send(());
        let _ = self.release.lock().recv();
        Ok(AgentOutcome {
            resolved: records.iter().map(|record| record.key).collect(),
            in_doubt: 0,
        })
    }
}

#[test]
fn renewal_keeps_going_while_a_recovery_retry_is_stuck() {
    let mut store = MemoryStore::new(true);
    store.push_raw_record(
        "cloud001",
        LogName::Transaction,
        LogRecord::new(RecordKey::new(1, 1, 0), b"tx".to_vec()),
    );
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel();
    let agent: Arc<dyn RecoveryAgent> = Arc::new(StallingAgent {
        failed: AtomicBool::new(false),
        entered: parking_lot::Mutex::new(entered_tx),
        release: parking_lot::Mutex::new(release_rx),
    });

    let runs = RunTable::new();
    let build = |backend: MemoryStore| {
        Coordinator::new(
            id("cloud001"),
            RecoveryGroup::default(),
            LeaseManager::new(backend, settings()),
            runs.clone(),
            SignalHub::new(),
            Arc::clone(&agent),
            CoordinatorPolicy {
                peer_release: PeerReleasePolicy::Retire,
                recovery_attempts: 1,
            },
        )
    };
    let mut local = build(store.clone());
    assert!(matches!(
        local.start_local(now_ms()).expect("start"),
        StartOutcome::Started(RecoveryProgress::Pending { .. })
    ));

    let workers = Workers::spawn(
        build(store.member(true)),
        PeerScanner::new(build(store.member(true))),
        Duration::from_millis(20),
        Duration::from_millis(20),
    )
    .expect("spawn workers");

    entered_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("retry reached the agent");
    let lease_time = |store: &mut MemoryStore| {
        store
            .read_lease(&id("cloud001"))
            .expect("read")
            .expect("row")
            .lease_time_ms
    };
    let before = lease_time(&mut store);
    std::thread::sleep(Duration::from_millis(300));
    let after = lease_time(&mut store);
    assert!(after > before, "renewal stalled: {before} -> {after}");

    release_tx.send(()).expect("release agent");
    workers.stop();
    assert_eq!(runs.state(&id("cloud001")), RunState::Active);
}
