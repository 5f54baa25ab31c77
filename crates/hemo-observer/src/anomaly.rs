//! Threshold and state anomaly detection.

use hemo_proto::{Anomaly, AnomalyKind, AnomalySeverity, HealthMetrics, HealthStatus};

/// Evaluate the full anomaly ladder for one container snapshot. Every rule
/// that fires contributes an entry.
///
/// Severity for resource breaches: critical above the threshold and past
/// 95%, high above the threshold, medium above 0.8x the threshold.
pub fn detect(
    metrics: &HealthMetrics,
    health_status: HealthStatus,
    exit_code: i64,
    restart_count: u64,
    container_status: &str,
    threshold_cpu: f64,
    threshold_memory: f64,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();

    let cpu = metrics.cpu_percent;
    if cpu > threshold_cpu {
        let severity = if cpu > 95.0 {
            AnomalySeverity::Critical
        } else {
            AnomalySeverity::High
        };
        anomalies.push(Anomaly::threshold_breach(
            AnomalyKind::HighCpu,
            severity,
            threshold_cpu,
            cpu,
        ));
    } else if cpu > 0.8 * threshold_cpu {
        anomalies.push(Anomaly::threshold_breach(
            AnomalyKind::HighCpu,
            AnomalySeverity::Medium,
            threshold_cpu,
            cpu,
        ));
    }

    let memory = metrics.memory_percent;
    if memory > threshold_memory {
        let severity = if memory > 95.0 {
            AnomalySeverity::Critical
        } else {
            AnomalySeverity::High
        };
        anomalies.push(Anomaly::threshold_breach(
            AnomalyKind::HighMemory,
            severity,
            threshold_memory,
            memory,
        ));
    } else if memory > 0.8 * threshold_memory {
        anomalies.push(Anomaly::threshold_breach(
            AnomalyKind::HighMemory,
            AnomalySeverity::Medium,
            threshold_memory,
            memory,
        ));
    }

    if !matches!(health_status, HealthStatus::Healthy | HealthStatus::Unknown) {
        anomalies.push(Anomaly::unhealthy(health_status));
    }

    if exit_code != 0 && container_status == "exited" {
        anomalies.push(Anomaly::non_zero_exit(exit_code));
    }

    if restart_count > 5 {
        anomalies.push(Anomaly::excessive_restarts(restart_count));
    }

    anomalies
}
