use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vigil::coordination::{ElectionConfig, KubeBackend, LeaseCoordinator};
use vigil::identity::Identity;
use vigil::registration::register_self;
use vigil::relabel::TrafficRelabeler;
use vigil::role::RoleController;
use vigil::settings::{AppConfig, LogFormat};
use vigil::status::{self, StatusState};
use vigil::trace;
use vigil::workload::HeartbeatWorkload;

#[derive(Parser, Debug)]
#[command(version, about)]
/// Lease-based leader election that routes Service traffic to the leader
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// log output format, overrides the config file
    #[arg(long = "log-format", value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal error, exiting");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.verbose {
        println!("DEBUG {args:?}");
    }

    let cfg = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    trace::init(args.log_format.unwrap_or(cfg.logging.format))?;

    let identity =
        Identity::resolve(cfg.election.identity.as_deref()).context("resolving replica identity")?;
    let status_addr = cfg.status_addr()?;
    info!(identity = %identity, "starting replica");

    let backend = KubeBackend::try_default()
        .await
        .context("connecting to the Kubernetes API")?;

    register_self(
        &backend,
        &cfg.registration.namespace,
        &cfg.registration.label_key,
        &identity,
    )
    .await
    .context("self-registration")?;

    let shutdown = CancellationToken::new();

    let coordinator = LeaseCoordinator::new(
        backend.clone(),
        ElectionConfig::from_settings(&cfg.election, identity.clone()),
    )?;
    let relabeler = TrafficRelabeler::from_settings(backend, &cfg.routing, identity.clone());
    let mut controller = RoleController::new(
        identity.clone(),
        Arc::new(relabeler),
        Arc::new(HeartbeatWorkload::new(Duration::from_millis(
            cfg.workload.interval_ms,
        ))),
        shutdown.clone(),
        Duration::from_millis(cfg.workload.stop_timeout_ms),
    );

    let election_shutdown = shutdown.clone();
    let election = tokio::spawn(async move {
        let result = coordinator
            .run(election_shutdown.clone(), &mut controller)
            .await;
        controller.stop().await;
        // A failed leadership transition takes the whole process down.
        if result.is_err() {
            election_shutdown.cancel();
        }
        result
    });

    let status = tokio::spawn(status::serve(
        status_addr,
        StatusState { identity },
        shutdown.clone(),
    ));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    let status_result = status.await;
    shutdown.cancel();

    // Wait for the election loop to drain (demote, release) before exiting.
    election
        .await
        .context("leader election task panicked")?
        .context("leader election")?;
    status_result
        .context("status server task panicked")?
        .context("status server")?;

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
