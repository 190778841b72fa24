#![forbid(unsafe_code)]

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tl_core::ServerIdentity;
use tl_recovery::clock::{now_ms, ts_ms_to_rfc3339};
use tl_recovery::config::RecoveryConfig;
use tl_recovery::coordinator::{ResolveAllAgent, StartOutcome};
use tl_recovery::scanner::PeerScanner;
use tl_recovery::worker::{MemberContext, Workers, wait_until_stopped};
use tl_recovery::{ConfigError, RecoveryError};
use tl_storage::{LockingMode, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "tl_recoveryd", about = "Transaction log lease and peer recovery daemon")]
struct Cli {
    /// YAML or JSON configuration file.
    #[arg(long, env = "TL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Args, Debug, Default)]
struct Overrides {
    #[arg(long, global = true)]
    identity: Option<String>,

    #[arg(long, global = true)]
    recovery_group: Option<String>,

    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    backend_url: Option<String>,

    #[arg(long, global = true)]
    peer_locking: Option<bool>,

    #[arg(long, global = true)]
    stale_threshold_ms: Option<u64>,

    #[arg(long, global = true)]
    locking_mode: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Claim the own identity, recover it, then renew and scan for peers.
    Run {
        /// Recover once, scan once, release and exit.
        #[arg(long)]
        once: bool,

        /// Stop after this many seconds (0 runs until killed).
        #[arg(long, default_value_t = 0)]
        max_runtime_s: u64,
    },
    /// Print lease rows of the recovery group.
    Leases,
    /// Print recorded lifecycle events.
    Events {
        #[arg(long)]
        server: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn load_config(cli: &Cli) -> Result<RecoveryConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => RecoveryConfig::from_file(path)?,
        None => RecoveryConfig::default(),
    };
    config.apply_env()?;

    let overrides = &cli.overrides;
    if let Some(identity) = &overrides.identity {
        config.identity = identity.clone();
    }
    if let Some(group) = &overrides.recovery_group {
        config.recovery_group = group.clone();
    }
    if let Some(dir) = &overrides.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(url) = &overrides.backend_url {
        config.backend_url = Some(url.clone());
    }
    if let Some(enabled) = overrides.peer_locking {
        config.peer_locking_enabled = enabled;
    }
    if let Some(threshold) = overrides.stale_threshold_ms {
        config.stale_threshold_ms = threshold;
    }
    if let Some(mode) = &overrides.locking_mode {
        config.locking_mode = LockingMode::parse(mode)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown locking mode {mode:?}")))?;
    }

    config.validate()?;
    Ok(config)
}

fn run_member(config: &RecoveryConfig, once: bool, max_runtime_s: u64) -> Result<(), RecoveryError> {
    let store = SqliteStore::open(&config.storage_dir, config.store_options())?;
    let context = MemberContext::new(Arc::new(ResolveAllAgent));

    let renewal_store = store.reopen()?;
    let scanner_store = store.reopen()?;
    let mut local = context.coordinator(config, store)?;

    tracing::info!(
        identity = %local.identity(),
        group = %local.group(),
        peer_locking_enabled = config.peer_locking_enabled,
        stale_threshold_ms = config.stale_threshold_ms,
        "starting recovery member"
    );
    match local.start_local(now_ms())? {
        StartOutcome::Started(progress) => {
            tracing::info!(progress = ?progress, "own identity claimed");
        }
        StartOutcome::OwnedByOther { owner } => {
            tracing::warn!(owner = %owner, "own identity is being recovered by a peer");
        }
        StartOutcome::AlreadyRunning(state) => {
            tracing::debug!(state = state.as_str(), "own identity already running");
        }
    }

    let mut scanner = PeerScanner::new(context.coordinator(config, scanner_store)?);
    if once {
        let report = scanner.scan_once(now_ms())?;
        tracing::info!(report = ?report, "single peer scan finished");
        let released = local.shutdown(now_ms());
        tracing::info!(released, "member stopped");
        return Ok(());
    }

    let workers = Workers::spawn(
        context.coordinator(config, renewal_store)?,
        scanner,
        config.renew_interval(),
        config.scan_interval(),
    )
    .map_err(|err| RecoveryError::Store(err.into()))?;

    let shutdown = workers.shutdown_flag();
    let flag = Arc::clone(&shutdown);
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        tracing::warn!(error = %err, "could not install the shutdown signal handler");
    }

    let deadline = (max_runtime_s > 0).then(|| Duration::from_secs(max_runtime_s));
    let reason = wait_until_stopped(&shutdown, deadline);
    tracing::info!(reason = ?reason, "stopping recovery member");

    workers.stop();
    let released = local.shutdown(now_ms());
    tracing::info!(released, "member stopped");
    Ok(())
}

fn print_leases(config: &RecoveryConfig) -> Result<(), RecoveryError> {
    let mut store = SqliteStore::open(&config.storage_dir, config.store_options())?;
    let now = now_ms();
    for lease in store.leases_list(&config.group()?)? {
        let claimability = lease.claimability(
            now,
            config.stale_threshold(),
            config.peer_locking_enabled,
        );
        println!(
            "{}\towner={}\tleased_at={}\tlatch={}\t{:?}",
            lease.server_identity,
            lease.owner,
            ts_ms_to_rfc3339(lease.lease_time_ms),
            lease.latch.label(),
            claimability
        );
    }
    Ok(())
}

fn print_events(
    config: &RecoveryConfig,
    server: Option<&str>,
    limit: usize,
) -> Result<(), RecoveryError> {
    let mut store = SqliteStore::open(&config.storage_dir, config.store_options())?;
    let server = server
        .map(ServerIdentity::try_new)
        .transpose()
        .map_err(|err| ConfigError::Invalid(format!("server: {err}")))?;
    for event in store.events_list(server.as_ref(), limit)? {
        println!(
            "{}\t{}\t{}\t{}",
            ts_ms_to_rfc3339(event.ts_ms),
            event.server_identity,
            event.event_type,
            event.payload_json
        );
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };

    let result = match &cli.cmd {
        Command::Run {
            once,
            max_runtime_s,
        } => run_member(&config, *once, *max_runtime_s),
        Command::Leases => print_leases(&config),
        Command::Events { server, limit } => print_events(&config, server.as_deref(), *limit),
    };
    if let Err(err) = result {
        tracing::error!(code = err.code(), error = %err, "tl_recoveryd failed");
        std::process::exit(1);
    }
}
