//! hemostatd — HemoStat agent daemon.
//!
//! Each subcommand runs one long-lived agent of the pipeline. Agents share
//! nothing but the bus; run one process per agent, mirroring the deployment
//! layout the compose stack expects.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hemo_actuator::Actuator;
use hemo_bus::{Bus, RedisBus, RetryPolicy};
use hemo_config::{
    ActuatorConfig, BusConfig, DeciderConfig, NotifierConfig, ObserverConfig, ScannerConfig,
};
use hemo_decider::{Decider, llm};
use hemo_notifier::Notifier;
use hemo_observer::Observer;
use hemo_proto::{Clock, SystemClock};
use hemo_runtime::{ContainerRuntime, DockerRuntime};
use hemo_scanner::Scanner;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "hemostatd")]
#[command(about = "HemoStat autonomous container-health agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll containers, detect anomalies, publish health alerts
    Observer,
    /// Analyze health alerts and decide on remediation
    Decider,
    /// Execute remediation actions under safety guards
    Actuator,
    /// Store events and send Slack notifications
    Notifier,
    /// Run vulnerability scans and publish findings
    Scanner,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let bus_config = BusConfig::from_env();
    // Bus unreachable after all retries is fatal at startup (exit 1).
    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect_with_retry(
            &bus_config.url,
            bus_config.retry_max,
            bus_config.retry_delay,
        )
        .await
        .context("failed to connect to the message bus")?,
    );
    let retry = RetryPolicy::new(bus_config.retry_max, bus_config.retry_delay);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(wait_for_shutdown(stop_tx));

    match cli.command {
        Commands::Observer => {
            let observer = Observer::new(
                Arc::clone(&bus),
                connect_runtime(),
                ObserverConfig::from_env(),
                retry,
            );
            observer.run(stop_rx).await;
        }
        Commands::Decider => {
            let config = DeciderConfig::from_env();
            let backend = llm::backend_from_env(config.ai_model.as_deref(), config.ai_fallback_enabled);
            let decider = Decider::new(Arc::clone(&bus), backend, config, retry);
            decider.run(stop_rx).await.context("decider loop failed")?;
        }
        Commands::Actuator => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let actuator = Actuator::new(
                Arc::clone(&bus),
                connect_runtime(),
                ActuatorConfig::from_env(),
                clock,
                retry,
            );
            actuator.run(stop_rx).await.context("actuator loop failed")?;
        }
        Commands::Notifier => {
            let notifier = Notifier::new(Arc::clone(&bus), NotifierConfig::from_env());
            notifier.run(stop_rx).await.context("notifier loop failed")?;
        }
        Commands::Scanner => {
            let scanner = Scanner::new(Arc::clone(&bus), ScannerConfig::from_env(), retry);
            scanner.run(stop_rx).await;
        }
    }

    info!("agent stopped cleanly");
    Ok(())
}

/// Runtime-API unavailability is not fatal: the agent runs degraded and
/// keeps consuming bus events.
fn connect_runtime() -> Option<Arc<dyn ContainerRuntime>> {
    match DockerRuntime::connect() {
        Ok(runtime) => Some(Arc::new(runtime)),
        Err(e) => {
            warn!(error = %e, "docker unavailable, continuing via bus events only");
            None
        }
    }
}

/// Flip the shared stop flag on SIGINT/SIGTERM; agent loops drain and exit.
async fn wait_for_shutdown(stop: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to install sigterm handler");
                    ctrl_c.await;
                    let _ = stop.send(true);
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;

    info!("shutdown signal received, stopping");
    let _ = stop.send(true);
}
