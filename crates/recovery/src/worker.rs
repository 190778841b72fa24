#![forbid(unsafe_code)]

//! Background loops of one member: lease renewal, and the peer scan (plus
//! retry of pending recovery). Renewal never waits on a recovery agent, so a
//! slow recovery cannot let this member's own lease go stale. Each loop owns
//! its own store handle; they share the run table and the signal hub.

use crate::clock::now_ms;
use crate::config::RecoveryConfig;
use crate::coordinator::{Coordinator, CoordinatorPolicy, RecoveryAgent, RunTable};
use crate::error::ConfigError;
use crate::lease_manager::{LeaseManager, LeaseSettings};
use crate::scanner::PeerScanner;
use crate::signals::SignalHub;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tl_storage::StorageBackend;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Shared pieces every coordinator of one member is built from.
#[derive(Clone)]
pub struct MemberContext {
    pub runs: RunTable,
    pub signals: SignalHub,
    pub agent: Arc<dyn RecoveryAgent>,
}

impl MemberContext {
    pub fn new(agent: Arc<dyn RecoveryAgent>) -> Self {
        Self {
            runs: RunTable::new(),
            signals: SignalHub::new(),
            agent,
        }
    }

    pub fn coordinator<B: StorageBackend>(
        &self,
        config: &RecoveryConfig,
        backend: B,
    ) -> Result<Coordinator<B>, ConfigError> {
        let settings = LeaseSettings {
            stale_threshold: config.stale_threshold(),
            peer_recovery_precedence: config.peer_recovery_precedence,
            backend_url: config.backend_url.clone(),
            retry: config.retry,
        };
        Ok(Coordinator::new(
            config.server_identity()?,
            config.group()?,
            LeaseManager::new(backend, settings),
            self.runs.clone(),
            self.signals.clone(),
            Arc::clone(&self.agent),
            CoordinatorPolicy {
                peer_release: config.peer_release,
                recovery_attempts: config.recovery_attempts,
            },
        ))
    }
}

pub struct Workers {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    pub fn spawn<B>(
        renewal: Coordinator<B>,
        scanner: PeerScanner<B>,
        renew_interval: Duration,
        scan_interval: Duration,
    ) -> std::io::Result<Self>
    where
        B: StorageBackend + Send + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(2);

        let flag = Arc::clone(&shutdown);
        handles.push(
            std::thread::Builder::new()
                .name("tl-renewal".to_string())
                .spawn(move || renewal_loop(renewal, renew_interval, &flag))?,
        );

        let flag = Arc::clone(&shutdown);
        let spawned = std::thread::Builder::new()
            .name("tl-scanner".to_string())
            .spawn(move || scanner_loop(scanner, scan_interval, &flag));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                shutdown.store(true, Ordering::SeqCst);
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(err);
            }
        }

        Ok(Self { shutdown, handles })
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stops both loops and waits for them; neither holds a store lock
    /// between ticks, so this returns within one tick.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            if handle.join().is_err() {
                tracing::error!("recovery worker panicked");
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Deadline,
}

/// Blocks until `shutdown` is set or `deadline` has passed.
pub fn wait_until_stopped(shutdown: &AtomicBool, deadline: Option<Duration>) -> StopReason {
    let started = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return StopReason::Requested;
        }
        if deadline.is_some_and(|limit| started.elapsed() >= limit) {
            return StopReason::Deadline;
        }
        std::thread::sleep(SLEEP_SLICE);
    }
}

/// Sleeps for `interval` in short slices. Returns false once shutdown is
/// requested.
fn pause(interval: Duration, shutdown: &AtomicBool) -> bool {
    let mut left = interval;
    while !left.is_zero() {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let slice = left.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        left = left.saturating_sub(slice);
    }
    !shutdown.load(Ordering::SeqCst)
}

fn renewal_loop<B: StorageBackend>(
    mut coordinator: Coordinator<B>,
    interval: Duration,
    shutdown: &AtomicBool,
) {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "renewal loop started");
    while pause(interval, shutdown) {
        for (identity, outcome) in coordinator.renew_all(now_ms()) {
            if let Err(err) = outcome {
                tracing::debug!(identity = %identity, code = err.code(), "renewal tick failed");
            }
        }
    }
    tracing::debug!("renewal loop stopped");
}

fn scanner_loop<B: StorageBackend>(
    mut scanner: PeerScanner<B>,
    interval: Duration,
    shutdown: &AtomicBool,
) {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "peer scanner started");
    while pause(interval, shutdown) {
        scanner.coordinator().retry_pending(now_ms());
        match scanner.scan_once(now_ms()) {
            Ok(report) if report.attempted > 0 => {
                tracing::info!(
                    observed = report.observed,
                    attempted = report.attempted,
                    recovered = report.recovered,
                    rejected = report.rejected,
                    "peer scan finished"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "peer scan failed"),
        }
    }
    tracing::debug!("peer scanner stopped");
}
