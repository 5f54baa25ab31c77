//! Deterministic rule ladder and metric trend detection.
//!
//! Evaluated top-to-bottom; the first matching rule wins. Note that the
//! excessive-restarts circuit is checked before the critical-anomaly rule,
//! so a container with more than five restarts is classed as a false alarm
//! even when a critical anomaly is present.

use hemo_proto::{
    Action, Analysis, AnalysisMethod, AnomalySeverity, HealthAlert, HealthStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub enum MetricKey {
    Cpu,
    Memory,
}

/// Trend across the last five historical samples of one metric. Requires at
/// least two samples; the mean pairwise difference decides the direction
/// with a +-5 point dead band.
pub fn metric_trend(history: &[HealthAlert], key: MetricKey) -> Trend {
    if history.len() < 2 {
        return Trend::Unknown;
    }

    let start = history.len().saturating_sub(5);
    let values: Vec<f64> = history[start..]
        .iter()
        .map(|alert| match key {
            MetricKey::Cpu => alert.metrics.cpu_percent,
            MetricKey::Memory => alert.metrics.memory_percent,
        })
        .collect();

    if values.len() < 2 {
        return Trend::Unknown;
    }

    let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;

    if mean > 5.0 {
        Trend::Increasing
    } else if mean < -5.0 {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

fn verdict(action: Action, reason: String, confidence: f64, is_false_alarm: bool) -> Analysis {
    Analysis {
        action,
        reason,
        confidence,
        is_false_alarm,
        analysis_method: AnalysisMethod::RuleBased,
        root_cause: None,
    }
}

/// Classify a health alert against the rule ladder.
pub fn analyze(alert: &HealthAlert, history: &[HealthAlert]) -> Analysis {
    let cpu = alert.metrics.cpu_percent;
    let memory = alert.metrics.memory_percent;

    // Rule 1: non-zero exit code.
    if alert.exit_code != 0 {
        return verdict(
            Action::Restart,
            format!("Container exited with non-zero code: {}", alert.exit_code),
            0.9,
            false,
        );
    }

    // Rule 2: excessive restarts; repeated restarting means another restart
    // will not help.
    if alert.restart_count > 5 {
        return verdict(
            Action::None,
            format!(
                "Excessive restarts detected ({}); restart circuit active",
                alert.restart_count
            ),
            0.6,
            true,
        );
    }

    // Rule 3: any critical-severity anomaly.
    let critical: Vec<&str> = alert
        .anomalies
        .iter()
        .filter(|a| a.severity == AnomalySeverity::Critical)
        .map(|a| match a.kind {
            hemo_proto::AnomalyKind::HighCpu => "high_cpu",
            hemo_proto::AnomalyKind::HighMemory => "high_memory",
            hemo_proto::AnomalyKind::UnhealthyStatus => "unhealthy_status",
            hemo_proto::AnomalyKind::NonZeroExit => "non_zero_exit",
            hemo_proto::AnomalyKind::ExcessiveRestarts => "excessive_restarts",
        })
        .collect();
    if !critical.is_empty() {
        return verdict(
            Action::Restart,
            format!("Critical anomalies detected: {}", critical.join(", ")),
            0.85,
            false,
        );
    }

    // Rule 4: failing health check.
    if alert.health_status == HealthStatus::Unhealthy {
        return verdict(
            Action::Restart,
            "Container health check failed".to_string(),
            0.7,
            false,
        );
    }

    // Rule 5: sustained high CPU.
    let cpu_trend = metric_trend(history, MetricKey::Cpu);
    if cpu > 90.0 && matches!(cpu_trend, Trend::Increasing | Trend::Stable) {
        return verdict(
            Action::Restart,
            format!("Sustained high CPU usage: {cpu:.1}%"),
            0.75,
            false,
        );
    }

    // Rule 6: memory leak pattern.
    let memory_trend = metric_trend(history, MetricKey::Memory);
    if memory_trend == Trend::Increasing && memory > 70.0 {
        return verdict(
            Action::Restart,
            format!("Memory leak pattern detected; memory increasing to {memory:.1}%"),
            0.8,
            false,
        );
    }

    // Rule 7: single medium anomaly with no history reads as a transient spike.
    let medium_count = alert
        .anomalies
        .iter()
        .filter(|a| a.severity == AnomalySeverity::Medium)
        .count();
    if alert.anomalies.len() == 1 && medium_count == 1 && history.is_empty() {
        return verdict(
            Action::None,
            "Transient spike detected; likely false alarm".to_string(),
            0.65,
            true,
        );
    }

    // Default: not enough evidence.
    verdict(
        Action::None,
        "Insufficient evidence for remediation".to_string(),
        0.5,
        true,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use hemo_proto::{Anomaly, AnomalyKind, HealthMetrics};

    fn alert(cpu: f64, memory: f64, anomalies: Vec<Anomaly>) -> HealthAlert {
        HealthAlert {
            container_id: "abc123".to_string(),
            container_name: "web-1".to_string(),
            image: "web:latest".to_string(),
            status: "running".to_string(),
            metrics: HealthMetrics {
                cpu_percent: cpu,
                memory_percent: memory,
                ..Default::default()
            },
            anomalies,
            health_status: HealthStatus::Healthy,
            exit_code: 0,
            restart_count: 0,
        }
    }

    fn history_with_cpu(values: &[f64]) -> Vec<HealthAlert> {
        values.iter().map(|&cpu| alert(cpu, 0.0, vec![])).collect()
    }

    fn history_with_memory(values: &[f64]) -> Vec<HealthAlert> {
        values.iter().map(|&m| alert(0.0, m, vec![])).collect()
    }

    #[test]
    fn test_rule1_non_zero_exit() {
        let mut a = alert(0.0, 0.0, vec![Anomaly::non_zero_exit(137)]);
        a.exit_code = 137;
        a.status = "exited".to_string();

        let result = analyze(&a, &[]);
        assert_eq!(result.action, Action::Restart);
        assert_eq!(result.confidence, 0.9);
        assert!(!result.is_false_alarm);
        assert_eq!(result.analysis_method, AnalysisMethod::RuleBased);
    }

    #[test]
    fn test_rule2_excessive_restarts_beats_critical() {
        let mut a = alert(
            97.0,
            0.0,
            vec![Anomaly::threshold_breach(
                AnomalyKind::HighCpu,
                AnomalySeverity::Critical,
                85.0,
                97.0,
            )],
        );
        a.restart_count = 6;

        // Rule order is part of the contract: the restart circuit wins even
        // with a critical anomaly present.
        let result = analyze(&a, &[]);
        assert_eq!(result.action, Action::None);
        assert!(result.is_false_alarm);
        assert_eq!(result.confidence, 0.6);
    }

    #[test]
    fn test_rule3_critical_anomaly() {
        let a = alert(
            97.0,
            0.0,
            vec![Anomaly::threshold_breach(
                AnomalyKind::HighCpu,
                AnomalySeverity::Critical,
                85.0,
                97.0,
            )],
        );
        let result = analyze(&a, &[]);
        assert_eq!(result.action, Action::Restart);
        assert_eq!(result.confidence, 0.85);
        assert!(result.reason.contains("high_cpu"));
    }

    #[test]
    fn test_rule4_unhealthy_status() {
        let mut a = alert(0.0, 0.0, vec![Anomaly::unhealthy(HealthStatus::Unhealthy)]);
        a.health_status = HealthStatus::Unhealthy;

        let result = analyze(&a, &[]);
        assert_eq!(result.action, Action::Restart);
        assert_eq!(result.confidence, 0.7);
    }

    #[test]
    fn test_rule5_sustained_high_cpu() {
        let a = alert(
            92.0,
            0.0,
            vec![Anomaly::threshold_breach(
                AnomalyKind::HighCpu,
                AnomalySeverity::High,
                85.0,
                92.0,
            )],
        );
        let history = history_with_cpu(&[80.0, 88.0, 91.0]);

        let result = analyze(&a, &history);
        assert_eq!(result.action, Action::Restart);
        assert_eq!(result.confidence, 0.75);
    }

    #[test]
    fn test_rule6_memory_leak_pattern() {
        let a = alert(
            0.0,
            75.0,
            vec![Anomaly::threshold_breach(
                AnomalyKind::HighMemory,
                AnomalySeverity::Medium,
                80.0,
                75.0,
            )],
        );
        let history = history_with_memory(&[50.0, 60.0, 70.0]);

        let result = analyze(&a, &history);
        assert_eq!(result.action, Action::Restart);
        assert_eq!(result.confidence, 0.8);
        assert!(result.reason.contains("leak"));
    }

    #[test]
    fn test_rule7_transient_spike() {
        let a = alert(
            72.0,
            0.0,
            vec![Anomaly::threshold_breach(
                AnomalyKind::HighCpu,
                AnomalySeverity::Medium,
                85.0,
                72.0,
            )],
        );
        let result = analyze(&a, &[]);
        assert_eq!(result.action, Action::None);
        assert!(result.is_false_alarm);
        assert_eq!(result.confidence, 0.65);
    }

    #[test]
    fn test_default_rule() {
        let a = alert(
            72.0,
            0.0,
            vec![Anomaly::threshold_breach(
                AnomalyKind::HighCpu,
                AnomalySeverity::Medium,
                85.0,
                72.0,
            )],
        );
        // Same alert with history no longer matches the transient-spike rule.
        let history = history_with_cpu(&[70.0, 71.0]);
        let result = analyze(&a, &history);
        assert_eq!(result.action, Action::None);
        assert!(result.is_false_alarm);
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_trend_detection() {
        assert_eq!(
            metric_trend(&history_with_cpu(&[10.0, 20.0, 30.0]), MetricKey::Cpu),
            Trend::Increasing
        );
        assert_eq!(
            metric_trend(&history_with_cpu(&[90.0, 70.0, 50.0]), MetricKey::Cpu),
            Trend::Decreasing
        );
        assert_eq!(
            metric_trend(&history_with_cpu(&[50.0, 52.0, 49.0]), MetricKey::Cpu),
            Trend::Stable
        );
        assert_eq!(
            metric_trend(&history_with_cpu(&[50.0]), MetricKey::Cpu),
            Trend::Unknown
        );
        assert_eq!(metric_trend(&[], MetricKey::Cpu), Trend::Unknown);
    }

    #[test]
    fn test_trend_uses_last_five_samples() {
        // Early decline followed by a strong rise; only the last 5 count.
        let history = history_with_cpu(&[90.0, 80.0, 10.0, 20.0, 35.0, 50.0, 70.0]);
        assert_eq!(metric_trend(&history, MetricKey::Cpu), Trend::Increasing);
    }
}
