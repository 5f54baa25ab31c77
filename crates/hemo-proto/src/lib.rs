//! Protocol types for the HemoStat container-health pipeline.
//!
//! Defines the event envelope and every payload exchanged between the
//! Observer, Decider, Actuator, Notifier, and Scanner agents, plus the
//! keyed-state records stored on the bus.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Agent identity ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Observer,
    Decider,
    Actuator,
    Notifier,
    Scanner,
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Observer => "observer",
            Self::Decider => "decider",
            Self::Actuator => "actuator",
            Self::Notifier => "notifier",
            Self::Scanner => "scanner",
        };
        write!(f, "{s}")
    }
}

// ─── Event envelope ───────────────────────────────────────────────────────────

/// Wrapper for every message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub agent: Agent,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Build an envelope stamped with the current wall-clock time.
    pub fn new(event_type: &str, agent: Agent, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            agent,
            data,
        }
    }
}

// ─── Health status ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Map the runtime's health string; anything unrecognized is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            "starting" => Self::Starting,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

// ─── Metrics ──────────────────────────────────────────────────────────────────

/// Per-container metric snapshot derived by the Observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub blkio_read_bytes: u64,
    pub blkio_write_bytes: u64,
}

// ─── Anomalies ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    HighCpu,
    HighMemory,
    UnhealthyStatus,
    NonZeroExit,
    ExcessiveRestarts,
}

/// A single threshold or state breach detected by the Observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HealthStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<u64>,
}

impl Anomaly {
    pub fn threshold_breach(
        kind: AnomalyKind,
        severity: AnomalySeverity,
        threshold: f64,
        actual: f64,
    ) -> Self {
        Self {
            kind,
            severity,
            threshold: Some(threshold),
            actual: Some((actual * 100.0).round() / 100.0),
            status: None,
            exit_code: None,
            restart_count: None,
        }
    }

    pub fn unhealthy(status: HealthStatus) -> Self {
        Self {
            kind: AnomalyKind::UnhealthyStatus,
            severity: AnomalySeverity::High,
            threshold: None,
            actual: None,
            status: Some(status),
            exit_code: None,
            restart_count: None,
        }
    }

    pub fn non_zero_exit(exit_code: i64) -> Self {
        Self {
            kind: AnomalyKind::NonZeroExit,
            severity: AnomalySeverity::High,
            threshold: None,
            actual: None,
            status: None,
            exit_code: Some(exit_code),
            restart_count: None,
        }
    }

    pub fn excessive_restarts(restart_count: u64) -> Self {
        Self {
            kind: AnomalyKind::ExcessiveRestarts,
            severity: AnomalySeverity::Medium,
            threshold: None,
            actual: None,
            status: None,
            exit_code: None,
            restart_count: Some(restart_count),
        }
    }
}

// ─── Health alert ─────────────────────────────────────────────────────────────

/// Observer → Decider payload: one or more anomalies on a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthAlert {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub status: String,
    pub metrics: HealthMetrics,
    pub anomalies: Vec<Anomaly>,
    pub health_status: HealthStatus,
    pub exit_code: i64,
    pub restart_count: u64,
}

// ─── Analysis ─────────────────────────────────────────────────────────────────

/// Remediation action, routed by exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Restart,
    ScaleUp,
    Cleanup,
    Exec,
    #[default]
    None,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Restart => "restart",
            Self::ScaleUp => "scale_up",
            Self::Cleanup => "cleanup",
            Self::Exec => "exec",
            Self::None => "none",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    Ai,
    RuleBased,
}

/// The Decider's verdict on a health alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub action: Action,
    pub reason: String,
    pub confidence: f64,
    pub is_false_alarm: bool,
    pub analysis_method: AnalysisMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
}

// ─── Remediation request / outcome ────────────────────────────────────────────

/// Decider → Actuator payload on `remediation_needed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub container: String,
    pub action: Action,
    pub reason: String,
    pub confidence: f64,
    #[serde(default)]
    pub metrics: Option<HealthMetrics>,
    pub analysis_method: AnalysisMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
    Rejected,
    NotApplicable,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::NotApplicable => "not_applicable",
        };
        write!(f, "{s}")
    }
}

/// Statistics returned by the cleanup action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CleanupStats {
    pub containers_removed: u64,
    pub volumes_removed: u64,
    pub space_reclaimed_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Result of a single remediation action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable rejection reason (`cooldown_active`, `circuit_breaker_open`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl ActionOutcome {
    pub fn success(details: serde_json::Value) -> Self {
        Self {
            status: OutcomeStatus::Success,
            details: Some(details),
            error: None,
            reason: None,
            remaining_seconds: None,
            retry_count: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            details: None,
            error: Some(error.into()),
            reason: None,
            remaining_seconds: None,
            retry_count: None,
        }
    }

    pub fn not_applicable(details: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::NotApplicable,
            details: Some(serde_json::Value::String(details.into())),
            error: None,
            reason: None,
            remaining_seconds: None,
            retry_count: None,
        }
    }

    pub fn rejected_cooldown(remaining_seconds: i64) -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            details: None,
            error: None,
            reason: Some("cooldown_active".to_string()),
            remaining_seconds: Some(remaining_seconds),
            retry_count: None,
        }
    }

    pub fn rejected_breaker(retry_count: u32) -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            details: None,
            error: None,
            reason: Some("circuit_breaker_open".to_string()),
            remaining_seconds: None,
            retry_count: Some(retry_count),
        }
    }

    pub fn rejected(reason: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Rejected,
            details: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
            remaining_seconds: None,
            retry_count: None,
        }
    }
}

/// Actuator → bus payload on `remediation_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationComplete {
    pub container: String,
    pub action: Action,
    pub result: ActionOutcome,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Decider → bus payload on `false_alarm`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FalseAlarm {
    pub container: String,
    pub reason: String,
    pub confidence: f64,
    pub analysis_method: AnalysisMethod,
}

// ─── Keyed state records ──────────────────────────────────────────────────────

/// Read-model snapshot refreshed by the Observer every poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    pub container_id: String,
    pub container_name: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub health_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

/// Bounded ring of recent alerts maintained by the Decider.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlertHistory {
    pub container: String,
    pub alerts: Vec<HealthAlert>,
}

/// Per-container remediation bookkeeping written by the Actuator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemediationHistory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result_status: Option<OutcomeStatus>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_hour: Option<DateTime<Utc>>,
}

/// Per-container circuit-breaker state written by the Actuator.
///
/// `failure_count` and `retry_count` track the same counter; both are kept
/// on the wire for consumers that read either name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakerState {
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

/// One row of the per-container audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub container: String,
    pub action: Action,
    pub result_status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HealthMetrics>,
    pub dry_run: bool,
}

/// Vulnerability scan summary published by the Scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnReport {
    pub target: String,
    pub total_alerts: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub informational: u64,
    pub top_findings: Vec<String>,
    pub scanned_at: DateTime<Utc>,
}

// ─── Channels & keys ──────────────────────────────────────────────────────────

/// Channel names and KV key builders. The bus applies the `hemostat:` prefix.
pub mod keys {
    pub const CHANNEL_HEALTH_ALERT: &str = "health_alert";
    pub const CHANNEL_REMEDIATION_NEEDED: &str = "remediation_needed";
    pub const CHANNEL_FALSE_ALARM: &str = "false_alarm";
    pub const CHANNEL_REMEDIATION_COMPLETE: &str = "remediation_complete";
    pub const CHANNEL_ALERTS: &str = "alerts";

    pub const EVENT_CONTAINER_UNHEALTHY: &str = "container_unhealthy";
    pub const EVENT_REMEDIATION_NEEDED: &str = "remediation_needed";
    pub const EVENT_FALSE_ALARM: &str = "false_alarm";
    pub const EVENT_REMEDIATION_COMPLETE: &str = "remediation_complete";
    pub const EVENT_VULN_SCAN: &str = "vulnerability_scan";

    pub fn container_state(container_id: &str) -> String {
        format!("state:container:{container_id}")
    }

    pub fn alert_history(container_name: &str) -> String {
        format!("state:alert_history:{container_name}")
    }

    pub fn remediation_history(container_name: &str) -> String {
        format!("state:remediation_history:{container_name}")
    }

    pub fn circuit_breaker(container_name: &str) -> String {
        format!("state:circuit_breaker:{container_name}")
    }

    pub fn vuln_state(target: &str) -> String {
        format!("state:vulnscan:{target}")
    }

    pub fn events(event_type: &str) -> String {
        format!("events:{event_type}")
    }

    pub const EVENTS_ALL: &str = "events:all";

    pub fn audit(container_name: &str) -> String {
        format!("audit:{container_name}")
    }

    pub fn alert_sent(hash: &str) -> String {
        format!("alert_sent:{hash}")
    }
}

// ─── Clock ────────────────────────────────────────────────────────────────────

/// Injectable time source. Interval math (cooldown, breaker window) goes
/// through this so property tests run deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(Some(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("clock lock") = Some(now);
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.now.lock().expect("clock lock");
        let base = guard.unwrap_or_else(Utc::now);
        *guard = Some(base + delta);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().expect("clock lock").unwrap_or_else(Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_parse() {
        assert_eq!(HealthStatus::parse("healthy"), HealthStatus::Healthy);
        assert_eq!(HealthStatus::parse("unhealthy"), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::parse("starting"), HealthStatus::Starting);
        assert_eq!(HealthStatus::parse("none"), HealthStatus::Unknown);
        assert_eq!(HealthStatus::parse(""), HealthStatus::Unknown);
    }

    #[test]
    fn test_action_wire_form() {
        assert_eq!(
            serde_json::to_string(&Action::ScaleUp).expect("serialize"),
            "\"scale_up\""
        );
        let back: Action = serde_json::from_str("\"restart\"").expect("deserialize");
        assert_eq!(back, Action::Restart);
    }

    #[test]
    fn test_anomaly_wire_uses_type_field() {
        let a = Anomaly::threshold_breach(AnomalyKind::HighCpu, AnomalySeverity::High, 85.0, 91.237);
        let json = serde_json::to_value(&a).expect("serialize");
        assert_eq!(json["type"], "high_cpu");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["actual"], 91.24);
        assert!(json.get("exit_code").is_none());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AnomalySeverity::Critical > AnomalySeverity::High);
        assert!(AnomalySeverity::High > AnomalySeverity::Medium);
    }

    #[test]
    fn test_envelope_round_trip() {
        let env = Envelope::new(
            keys::EVENT_CONTAINER_UNHEALTHY,
            Agent::Observer,
            serde_json::json!({"container_name": "web-1"}),
        );
        let json = serde_json::to_string(&env).expect("serialize");
        let back: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.event_type, "container_unhealthy");
        assert_eq!(back.agent, Agent::Observer);
        assert_eq!(back.data["container_name"], "web-1");
    }

    #[test]
    fn test_rejection_outcomes() {
        let cooldown = ActionOutcome::rejected_cooldown(3590);
        assert_eq!(cooldown.status, OutcomeStatus::Rejected);
        assert_eq!(cooldown.reason.as_deref(), Some("cooldown_active"));
        assert_eq!(cooldown.remaining_seconds, Some(3590));

        let breaker = ActionOutcome::rejected_breaker(2);
        assert_eq!(breaker.reason.as_deref(), Some("circuit_breaker_open"));
        assert_eq!(breaker.retry_count, Some(2));
    }

    #[test]
    fn test_remediation_request_tolerates_missing_optionals() {
        let json = r#"{
            "container": "web-1",
            "action": "restart",
            "reason": "crashed",
            "confidence": 0.9,
            "analysis_method": "rule_based"
        }"#;
        let req: RemediationRequest = serde_json::from_str(json).expect("deserialize");
        assert!(req.metrics.is_none());
        assert!(req.command.is_none());
    }

    #[test]
    fn test_keys_namespacing() {
        assert_eq!(keys::container_state("abc123"), "state:container:abc123");
        assert_eq!(keys::alert_history("web-1"), "state:alert_history:web-1");
        assert_eq!(keys::audit("web-1"), "audit:web-1");
        assert_eq!(keys::events("false_alarm"), "events:false_alarm");
    }

    #[test]
    fn test_fixed_clock_advance() {
        let t0 = Utc::now();
        let clock = FixedClock::at(t0);
        assert_eq!(clock.now(), t0);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), t0 + chrono::Duration::seconds(90));
    }

    #[test]
    fn test_breaker_state_defaults() {
        let state: BreakerState = serde_json::from_str("{}").expect("deserialize");
        assert!(!state.is_open);
        assert_eq!(state.failure_count, 0);
        assert!(state.opened_timestamp.is_none());
    }
}
