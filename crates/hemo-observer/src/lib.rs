//! Observer agent: polls the container runtime at a fixed cadence, derives
//! metrics, detects anomalies, refreshes the read-model snapshot, and
//! publishes a health alert whenever at least one anomaly is present.

#![forbid(unsafe_code)]

use chrono::Utc;
use hemo_bus::{Bus, RetryPolicy, publish_event, set_state};
use hemo_config::ObserverConfig;
use hemo_proto::{Agent, ContainerSnapshot, HealthAlert, keys};
use hemo_runtime::{ContainerBrief, ContainerRuntime};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub mod anomaly;
pub mod metrics;

/// TTL on the per-container read-model snapshot, refreshed each poll.
const SNAPSHOT_TTL_SECS: u64 = 300;

pub struct Observer {
    bus: Arc<dyn Bus>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    config: ObserverConfig,
    retry: RetryPolicy,
}

impl Observer {
    /// A missing runtime client (`None`) leaves the Observer running in a
    /// degraded mode that publishes nothing, per the failure semantics.
    pub fn new(
        bus: Arc<dyn Bus>,
        runtime: Option<Arc<dyn ContainerRuntime>>,
        config: ObserverConfig,
        retry: RetryPolicy,
    ) -> Self {
        if runtime.is_none() {
            warn!("runtime client unavailable; observer will poll nothing until it recovers");
        }
        info!(
            threshold_cpu = config.threshold_cpu,
            threshold_memory = config.threshold_memory,
            poll_interval_secs = config.poll_interval.as_secs(),
            "observer initialized"
        );
        Self {
            bus,
            runtime,
            config,
            retry,
        }
    }

    /// One poll cycle over all running and exited containers. Per-container
    /// failures are logged and skipped; the cycle itself never errors out.
    pub async fn poll_once(&self) {
        let Some(runtime) = &self.runtime else {
            return;
        };

        let containers = match runtime.list_containers(true).await {
            Ok(containers) => containers,
            Err(e) => {
                error!(error = %e, "container listing failed");
                return;
            }
        };
        debug!(count = containers.len(), "polling containers");

        for container in containers {
            if let Err(e) = self.check_container(runtime.as_ref(), &container).await {
                error!(container = %container.name, error = %e, "container check failed");
            }
        }
    }

    async fn check_container(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &ContainerBrief,
    ) -> Result<(), hemo_runtime::RuntimeError> {
        // Re-inspect to avoid acting on a stale listing.
        let details = runtime.inspect(&container.name).await?;
        let sample = runtime.stats(&container.name).await?;
        let metrics = metrics::derive(&sample);

        let anomalies = anomaly::detect(
            &metrics,
            details.health_status,
            details.exit_code,
            details.restart_count,
            &details.status,
            self.config.threshold_cpu,
            self.config.threshold_memory,
        );

        let short_id: String = details.id.chars().take(12).collect();

        // Snapshot every container, healthy or not, for the dashboard grid.
        let snapshot = ContainerSnapshot {
            container_id: short_id.clone(),
            container_name: details.name.clone(),
            status: details.status.clone(),
            cpu_percent: metrics.cpu_percent,
            memory_percent: metrics.memory_percent,
            memory_usage: metrics.memory_usage,
            memory_limit: metrics.memory_limit,
            health_status: details.health_status,
            timestamp: Utc::now(),
        };
        if let Err(e) = set_state(
            self.bus.as_ref(),
            &keys::container_state(&short_id),
            &snapshot,
            Some(SNAPSHOT_TTL_SECS),
        )
        .await
        {
            error!(container = %details.name, error = %e, "failed to refresh snapshot");
        }

        if anomalies.is_empty() {
            debug!(container = %details.name, "container is healthy");
            return Ok(());
        }

        let alert = HealthAlert {
            container_id: short_id,
            container_name: details.name.clone(),
            image: details.image.clone(),
            status: details.status.clone(),
            metrics,
            anomalies,
            health_status: details.health_status,
            exit_code: details.exit_code,
            restart_count: details.restart_count,
        };

        warn!(
            container = %details.name,
            anomalies = alert.anomalies.len(),
            "health alert published"
        );
        if let Err(e) = publish_event(
            self.bus.as_ref(),
            &self.retry,
            keys::CHANNEL_HEALTH_ALERT,
            keys::EVENT_CONTAINER_UNHEALTHY,
            Agent::Observer,
            serde_json::to_value(&alert).unwrap_or_default(),
        )
        .await
        {
            error!(container = %details.name, error = %e, "failed to publish health alert");
        }

        Ok(())
    }

    /// Main loop: poll at the configured cadence until the stop flag flips.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        info!("observer loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("observer loop stopped");
    }
}
