//! End-to-end scenarios for the observe → decide → act pipeline.

use hemo_actuator::Actuator;
use hemo_bus::{Bus, MemoryBus, RetryPolicy, get_state};
use hemo_config::{ActuatorConfig, DeciderConfig};
use hemo_decider::Decider;
use hemo_decider::llm::ScriptedBackend;
use hemo_proto::{
    Action, AlertHistory, AnalysisMethod, BreakerState, Clock, FalseAlarm, FixedClock,
    OutcomeStatus, RemediationComplete, RemediationRequest, keys,
};
use hemo_runtime::{ContainerRuntime, fake};
use hemostat_tests::{Pipeline, alert, critical_cpu_anomaly, medium_cpu_anomaly};
use std::sync::Arc;

fn completions(bus: &MemoryBus) -> Vec<RemediationComplete> {
    bus.published_envelopes(keys::CHANNEL_REMEDIATION_COMPLETE)
        .iter()
        .map(|env| serde_json::from_value(env.data.clone()).expect("completion"))
        .collect()
}

// Scenario 1: a single medium CPU spike with no history is a false alarm at
// confidence 0.65, classified by the rule ladder.
#[tokio::test]
async fn transient_spike_is_false_alarm() {
    let pipeline = Pipeline::new(ActuatorConfig::default());

    pipeline
        .drive(alert("web-1", 72.0, vec![medium_cpu_anomaly(72.0)]))
        .await;

    let false_alarms = pipeline.bus.published_envelopes(keys::CHANNEL_FALSE_ALARM);
    assert_eq!(false_alarms.len(), 1);
    let verdict: FalseAlarm =
        serde_json::from_value(false_alarms[0].data.clone()).expect("payload");
    assert_eq!(verdict.confidence, 0.65);
    assert_eq!(verdict.analysis_method, AnalysisMethod::RuleBased);
    assert!(
        pipeline
            .bus
            .published_envelopes(keys::CHANNEL_REMEDIATION_NEEDED)
            .is_empty()
    );
    assert!(pipeline.runtime.restarts().is_empty());
}

// Scenario 2: a critical CPU hotspot with a rising history demands a restart
// at confidence >= 0.85, and the Actuator carries it out.
#[tokio::test]
async fn cpu_hotspot_restarts_container() {
    let pipeline = Pipeline::new(ActuatorConfig::default());
    pipeline
        .runtime
        .add_container(fake::details("web-1", "running"), fake::idle_sample());

    // Three prior alerts with increasing CPU build the trend history.
    for cpu in [70.0, 80.0, 90.0] {
        pipeline
            .decider
            .handle_alert(alert("web-1", cpu, vec![medium_cpu_anomaly(cpu)]))
            .await;
    }
    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;

    let requests = pipeline
        .bus
        .published_envelopes(keys::CHANNEL_REMEDIATION_NEEDED);
    assert_eq!(requests.len(), 1);
    let request: RemediationRequest =
        serde_json::from_value(requests[0].data.clone()).expect("request");
    assert_eq!(request.action, Action::Restart);
    assert!(request.confidence >= 0.85);

    assert_eq!(pipeline.runtime.restarts(), vec!["web-1"]);
    let done = completions(&pipeline.bus);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].result.status, OutcomeStatus::Success);
}

// Scenario 3: the same alert ten seconds after a successful restart is
// rejected by the cooldown with the remaining time reported.
#[tokio::test]
async fn cooldown_rejects_repeat_remediation() {
    let pipeline = Pipeline::new(ActuatorConfig::default());
    pipeline
        .runtime
        .add_container(fake::details("web-1", "running"), fake::idle_sample());

    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;
    pipeline.clock.advance(chrono::Duration::seconds(10));
    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;

    let done = completions(&pipeline.bus);
    assert_eq!(done.len(), 2);
    assert_eq!(done[0].result.status, OutcomeStatus::Success);
    assert_eq!(done[1].result.status, OutcomeStatus::Rejected);
    assert_eq!(done[1].result.reason.as_deref(), Some("cooldown_active"));
    assert_eq!(done[1].result.remaining_seconds, Some(3590));

    // The breaker is untouched by the rejection.
    let breaker: BreakerState = get_state(
        pipeline.bus.as_ref(),
        &keys::circuit_breaker("web-1"),
    )
    .await
    .unwrap_or_default();
    assert!(!breaker.is_open);
    assert_eq!(breaker.failure_count, 0);

    // One real restart only.
    assert_eq!(pipeline.runtime.restarts().len(), 1);
}

// Scenario 4: with MAX_RETRIES_PER_HOUR=2, two failures open the breaker and
// the third attempt is rejected with the retry count.
#[tokio::test]
async fn breaker_opens_after_repeated_failures() {
    let config = ActuatorConfig {
        max_retries_per_hour: 2,
        cooldown_seconds: 0,
        ..Default::default()
    };
    let pipeline = Pipeline::new(config);
    // Target container does not exist, so every restart fails.

    for _ in 0..3 {
        pipeline
            .drive(alert("ghost", 97.0, vec![critical_cpu_anomaly(97.0)]))
            .await;
    }

    let done = completions(&pipeline.bus);
    assert_eq!(done.len(), 3);
    assert_eq!(done[0].result.status, OutcomeStatus::Failed);
    assert_eq!(done[1].result.status, OutcomeStatus::Failed);
    assert_eq!(done[2].result.status, OutcomeStatus::Rejected);
    assert_eq!(
        done[2].result.reason.as_deref(),
        Some("circuit_breaker_open")
    );
    assert_eq!(done[2].result.retry_count, Some(2));
}

// Scenario 5: scale_up on a standalone (unlabeled) container is
// not_applicable and leaves cooldown and breaker untouched.
#[tokio::test]
async fn scale_up_standalone_not_applicable() {
    let bus = Arc::new(MemoryBus::new());
    let runtime = Arc::new(hemo_runtime::FakeRuntime::new());
    runtime.add_container(fake::details("solo", "running"), fake::idle_sample());
    let clock = Arc::new(FixedClock::at(chrono::Utc::now()));
    let actuator = Actuator::new(
        Arc::clone(&bus) as Arc<dyn Bus>,
        Some(Arc::clone(&runtime) as Arc<dyn ContainerRuntime>),
        ActuatorConfig::default(),
        Arc::clone(&clock) as Arc<dyn Clock>,
        RetryPolicy::default(),
    );

    actuator
        .handle_request(RemediationRequest {
            container: "solo".to_string(),
            action: Action::ScaleUp,
            reason: "load".to_string(),
            confidence: 0.8,
            metrics: None,
            analysis_method: AnalysisMethod::RuleBased,
            command: None,
        })
        .await;

    let done = completions(&bus);
    assert_eq!(done[0].result.status, OutcomeStatus::NotApplicable);
    assert!(
        get_state::<hemo_proto::RemediationHistory>(
            bus.as_ref(),
            &keys::remediation_history("solo")
        )
        .await
        .is_none()
    );
    assert!(
        get_state::<BreakerState>(bus.as_ref(), &keys::circuit_breaker("solo"))
            .await
            .is_none()
    );
}

// Scenario 6: an LLM that keeps returning garbage is retried up to the
// limit, then the rule ladder takes over and the event says so.
#[tokio::test]
async fn malformed_ai_output_falls_back_to_rules() {
    let backend = Arc::new(ScriptedBackend::new());
    for _ in 0..3 {
        backend.push_ok("here is the answer: ```json {bogus} ``` trailing");
    }
    let pipeline = Pipeline::with_backend(ActuatorConfig::default(), backend);
    pipeline
        .runtime
        .add_container(fake::details("web-1", "running"), fake::idle_sample());

    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;

    let requests = pipeline
        .bus
        .published_envelopes(keys::CHANNEL_REMEDIATION_NEEDED);
    assert_eq!(requests.len(), 1);
    let request: RemediationRequest =
        serde_json::from_value(requests[0].data.clone()).expect("request");
    assert_eq!(request.analysis_method, AnalysisMethod::RuleBased);
}

// The observation end of the pipeline: a saturated container seen by the
// Observer produces an alert the Decider turns into a remediation demand.
#[tokio::test]
async fn observer_alert_feeds_decider() {
    let bus = Arc::new(MemoryBus::new());
    let runtime = Arc::new(hemo_runtime::FakeRuntime::new());
    runtime.add_container(
        fake::details("web-1", "running"),
        hemo_runtime::StatsSample {
            cpu_total_usage: 97_000,
            precpu_total_usage: 0,
            system_cpu_usage: 100_000,
            presystem_cpu_usage: 0,
            online_cpus: 1,
            memory_usage: 100 << 20,
            memory_limit: 1 << 30,
            memory_inactive_file: 0,
            interfaces: Vec::new(),
            blkio: Vec::new(),
        },
    );

    let observer = hemo_observer::Observer::new(
        Arc::clone(&bus) as Arc<dyn Bus>,
        Some(Arc::clone(&runtime) as Arc<dyn ContainerRuntime>),
        hemo_config::ObserverConfig::default(),
        RetryPolicy::default(),
    );
    observer.poll_once().await;

    let alerts = bus.published_envelopes(keys::CHANNEL_HEALTH_ALERT);
    assert_eq!(alerts.len(), 1);
    let alert: hemo_proto::HealthAlert =
        serde_json::from_value(alerts[0].data.clone()).expect("alert");

    let decider = Decider::new(
        Arc::clone(&bus) as Arc<dyn Bus>,
        Arc::new(hemo_decider::llm::NullBackend),
        DeciderConfig::default(),
        RetryPolicy::default(),
    );
    decider.handle_alert(alert).await;

    let requests = bus.published_envelopes(keys::CHANNEL_REMEDIATION_NEEDED);
    assert_eq!(requests.len(), 1);
    let request: RemediationRequest =
        serde_json::from_value(requests[0].data.clone()).expect("request");
    assert_eq!(request.container, "web-1");
    assert_eq!(request.action, Action::Restart);
}

// The Decider emits exactly one routed event per alert, and history grows
// alongside.
#[tokio::test]
async fn one_verdict_per_alert_with_history() {
    let bus = Arc::new(MemoryBus::new());
    let decider = Decider::new(
        Arc::clone(&bus) as Arc<dyn Bus>,
        Arc::new(hemo_decider::llm::NullBackend),
        DeciderConfig::default(),
        RetryPolicy::default(),
    );

    for i in 0..4 {
        decider
            .handle_alert(alert("web-1", 40.0 + i as f64, vec![]))
            .await;
    }

    let verdicts = bus.published_envelopes(keys::CHANNEL_FALSE_ALARM).len()
        + bus.published_envelopes(keys::CHANNEL_REMEDIATION_NEEDED).len();
    assert_eq!(verdicts, 4);

    let history: AlertHistory = get_state(bus.as_ref(), &keys::alert_history("web-1"))
        .await
        .expect("history");
    assert_eq!(history.alerts.len(), 4);
}
