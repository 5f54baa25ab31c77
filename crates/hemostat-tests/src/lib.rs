//! Shared fixtures for the HemoStat end-to-end test suites.

#![forbid(unsafe_code)]

use chrono::Utc;
use hemo_actuator::Actuator;
use hemo_bus::{MemoryBus, RetryPolicy};
use hemo_config::{ActuatorConfig, DeciderConfig};
use hemo_decider::Decider;
use hemo_decider::llm::{LlmBackend, NullBackend};
use hemo_proto::{
    Anomaly, AnomalyKind, AnomalySeverity, Clock, FixedClock, HealthAlert, HealthMetrics,
    HealthStatus,
};
use hemo_runtime::{ContainerRuntime, FakeRuntime};
use std::sync::Arc;

/// A health alert with the given CPU reading and anomaly list.
pub fn alert(container: &str, cpu: f64, anomalies: Vec<Anomaly>) -> HealthAlert {
    HealthAlert {
        container_id: format!("{container}-id"),
        container_name: container.to_string(),
        image: format!("{container}:latest"),
        status: "running".to_string(),
        metrics: HealthMetrics {
            cpu_percent: cpu,
            ..Default::default()
        },
        anomalies,
        health_status: HealthStatus::Healthy,
        exit_code: 0,
        restart_count: 0,
    }
}

pub fn medium_cpu_anomaly(actual: f64) -> Anomaly {
    Anomaly::threshold_breach(AnomalyKind::HighCpu, AnomalySeverity::Medium, 85.0, actual)
}

pub fn critical_cpu_anomaly(actual: f64) -> Anomaly {
    Anomaly::threshold_breach(AnomalyKind::HighCpu, AnomalySeverity::Critical, 85.0, actual)
}

/// Bus + runtime + clock + both decision/action agents wired together.
pub struct Pipeline {
    pub bus: Arc<MemoryBus>,
    pub runtime: Arc<FakeRuntime>,
    pub clock: Arc<FixedClock>,
    pub decider: Decider,
    pub actuator: Actuator,
}

impl Pipeline {
    pub fn new(actuator_config: ActuatorConfig) -> Self {
        Self::with_backend(actuator_config, Arc::new(NullBackend))
    }

    pub fn with_backend(
        actuator_config: ActuatorConfig,
        backend: Arc<dyn LlmBackend>,
    ) -> Self {
        let bus = Arc::new(MemoryBus::new());
        let runtime = Arc::new(FakeRuntime::new());
        let clock = Arc::new(FixedClock::at(Utc::now()));

        let decider = Decider::new(
            Arc::clone(&bus) as Arc<dyn hemo_bus::Bus>,
            backend,
            DeciderConfig::default(),
            RetryPolicy::default(),
        );
        let actuator = Actuator::new(
            Arc::clone(&bus) as Arc<dyn hemo_bus::Bus>,
            Some(Arc::clone(&runtime) as Arc<dyn ContainerRuntime>),
            actuator_config,
            Arc::clone(&clock) as Arc<dyn Clock>,
            RetryPolicy::default(),
        );

        Self {
            bus,
            runtime,
            clock,
            decider,
            actuator,
        }
    }

    /// Drive one alert through the Decider, then feed any resulting
    /// remediation request to the Actuator, mirroring the bus hand-off.
    pub async fn drive(&self, alert: HealthAlert) {
        self.decider.handle_alert(alert).await;

        let requests: Vec<hemo_proto::RemediationRequest> = self
            .bus
            .published_envelopes(hemo_proto::keys::CHANNEL_REMEDIATION_NEEDED)
            .iter()
            .filter_map(|env| serde_json::from_value(env.data.clone()).ok())
            .collect();

        // Only the newest request has not been executed yet.
        if let Some(request) = requests.last() {
            let already_done = self
                .bus
                .published_envelopes(hemo_proto::keys::CHANNEL_REMEDIATION_COMPLETE)
                .len();
            if requests.len() > already_done {
                self.actuator.handle_request(request.clone()).await;
            }
        }
    }
}
