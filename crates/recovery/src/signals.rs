#![forbid(unsafe_code)]

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::sync::Arc;
use tl_core::{RecoverySignal, RejectReason};
use tl_storage::{EventAppend, StorageBackend};

/// In-process subscriber to lifecycle signals.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, signal: &RecoverySignal);
}

/// Fan-out point shared by every worker of one member. Each signal is logged,
/// appended to the store's event table, and handed to subscribers.
#[derive(Clone, Default)]
pub struct SignalHub {
    sinks: Arc<RwLock<Vec<Arc<dyn SignalSink>>>>,
}

impl SignalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn SignalSink>) {
        self.sinks.write().push(sink);
    }

    pub fn emit(&self, backend: &mut impl StorageBackend, signal: &RecoverySignal, now_ms: i64) {
        log_signal(signal);

        let event = EventAppend {
            ts_ms: now_ms,
            server_identity: signal.identity().to_string(),
            event_type: signal.event_type().to_string(),
            payload_json: payload(signal).to_string(),
        };
        if let Err(err) = backend.append_event(&event) {
            tracing::warn!(
                identity = %signal.identity(),
                event_type = signal.event_type(),
                error = %err,
                "failed to persist recovery event"
            );
        }

        for sink in self.sinks.read().iter() {
            sink.deliver(signal);
        }
    }
}

/// Keeps every delivered signal; used by tests and by tooling that wants a
/// synchronous view of what happened.
#[derive(Debug, Default)]
pub struct SignalRecorder {
    signals: Mutex<Vec<RecoverySignal>>,
}

impl SignalRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<RecoverySignal> {
        self.signals.lock().clone()
    }

    pub fn take(&self) -> Vec<RecoverySignal> {
        std::mem::take(&mut *self.signals.lock())
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.signals
            .lock()
            .iter()
            .map(RecoverySignal::event_type)
            .collect()
    }
}

impl SignalSink for SignalRecorder {
    fn deliver(&self, signal: &RecoverySignal) {
        self.signals.lock().push(signal.clone());
    }
}

fn reason_payload(reason: &RejectReason) -> Value {
    match reason {
        RejectReason::NotStale { age_ms } => json!({ "code": reason.code(), "age_ms": age_ms }),
        RejectReason::OwnerChanged { owner } => {
            json!({ "code": reason.code(), "owner": owner.as_str() })
        }
        RejectReason::Missing => json!({ "code": reason.code() }),
    }
}

/// JSON body stored with the event row.
pub fn payload(signal: &RecoverySignal) -> Value {
    match signal {
        RecoverySignal::LeaseClaimed {
            kind,
            previous_owner,
            ..
        } => json!({
            "kind": kind.as_str(),
            "previous_owner": previous_owner.as_ref().map(|owner| owner.as_str()),
        }),
        RecoverySignal::RecoveryComplete {
            kind,
            records_recovered,
            in_doubt,
            ..
        } => json!({
            "kind": kind.as_str(),
            "records_recovered": records_recovered,
            "in_doubt": in_doubt,
        }),
        RecoverySignal::LogCleared { log, .. } => json!({ "log": log.as_str() }),
        RecoverySignal::PeerRecoveryAttempted {
            observed_owner,
            lease_age_ms,
            ..
        } => json!({
            "observed_owner": observed_owner.as_str(),
            "lease_age_ms": lease_age_ms,
        }),
        RecoverySignal::PeerClaimRejected { reason, .. } => {
            json!({ "reason": reason_payload(reason) })
        }
        RecoverySignal::RecoveryFailed {
            attempt,
            code,
            error,
            retryable,
            ..
        } => json!({
            "attempt": attempt,
            "code": code,
            "error": error,
            "retryable": retryable,
        }),
        RecoverySignal::RenewalFailed {
            code,
            error,
            unconfirmed_ms,
            ..
        } => json!({
            "code": code,
            "error": error,
            "unconfirmed_ms": unconfirmed_ms,
        }),
        RecoverySignal::LeaseLost { current_owner, .. } => json!({
            "current_owner": current_owner.as_ref().map(|owner| owner.as_str()),
        }),
        RecoverySignal::LeaseReleased { .. } | RecoverySignal::PeerLeaseRetired { .. } => {
            json!({})
        }
    }
}

fn log_signal(signal: &RecoverySignal) {
    let identity = signal.identity();
    match signal {
        RecoverySignal::LeaseClaimed {
            kind,
            previous_owner,
            ..
        } => tracing::info!(
            identity = %identity,
            kind = kind.as_str(),
            previous_owner = ?previous_owner.as_ref().map(|owner| owner.as_str()),
            "lease claimed"
        ),
        RecoverySignal::RecoveryComplete {
            kind,
            records_recovered,
            in_doubt,
            ..
        } => tracing::info!(
            identity = %identity,
            kind = kind.as_str(),
            records_recovered,
            in_doubt,
            "recovery complete"
        ),
        RecoverySignal::LogCleared { log, .. } => {
            tracing::info!(identity = %identity, log = log.as_str(), "log cleared")
        }
        RecoverySignal::PeerRecoveryAttempted {
            observed_owner,
            lease_age_ms,
            ..
        } => tracing::info!(
            identity = %identity,
            owner = %observed_owner,
            lease_age_ms,
            "peer recovery attempted"
        ),
        RecoverySignal::PeerClaimRejected { reason, .. } => tracing::info!(
            identity = %identity,
            reason = reason.code(),
            detail = %reason,
            "peer claim rejected"
        ),
        RecoverySignal::RecoveryFailed {
            attempt,
            code,
            error,
            retryable,
            ..
        } => tracing::error!(
            identity = %identity,
            attempt,
            code = *code,
            error = %error,
            retryable,
            "recovery failed, lease kept"
        ),
        RecoverySignal::RenewalFailed {
            code,
            error,
            unconfirmed_ms,
            ..
        } => tracing::error!(
            identity = %identity,
            code = *code,
            error = %error,
            unconfirmed_ms,
            "lease renewal failed"
        ),
        RecoverySignal::LeaseLost { current_owner, .. } => tracing::warn!(
            identity = %identity,
            current_owner = ?current_owner.as_ref().map(|owner| owner.as_str()),
            "lease lost, log writes stopped"
        ),
        RecoverySignal::LeaseReleased { .. } => {
            tracing::info!(identity = %identity, "lease released")
        }
        RecoverySignal::PeerLeaseRetired { .. } => {
            tracing::info!(identity = %identity, "peer lease retired")
        }
    }
}
