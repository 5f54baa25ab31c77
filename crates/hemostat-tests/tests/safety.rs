//! Safety-envelope tests: the guard rails the Actuator must never let
//! callers slip past, plus the bookkeeping invariants around them.

use hemo_bus::{Bus, MemoryBus, get_state};
use hemo_config::ActuatorConfig;
use hemo_notifier::Notifier;
use hemo_proto::{
    Action, AuditEntry, BreakerState, Envelope, OutcomeStatus, RemediationHistory, keys,
};
use hemo_runtime::fake;
use hemostat_tests::{Pipeline, alert, critical_cpu_anomaly};
use std::sync::Arc;

async fn audit_rows(bus: &MemoryBus, container: &str) -> Vec<AuditEntry> {
    bus.lrange(&keys::audit(container), 0, -1)
        .await
        .expect("lrange")
        .iter()
        .map(|row| serde_json::from_str(row).expect("audit row"))
        .collect()
}

// Every request path, including rejections, leaves exactly one audit row.
#[tokio::test]
async fn audit_row_on_every_path() {
    let pipeline = Pipeline::new(ActuatorConfig::default());
    pipeline
        .runtime
        .add_container(fake::details("web-1", "running"), fake::idle_sample());

    // Success, then cooldown rejection.
    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;
    pipeline.clock.advance(chrono::Duration::seconds(5));
    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;

    let rows = audit_rows(&pipeline.bus, "web-1").await;
    assert_eq!(rows.len(), 2);
    // Newest first.
    assert_eq!(rows[0].result_status, OutcomeStatus::Rejected);
    assert_eq!(rows[1].result_status, OutcomeStatus::Success);
}

// A duplicate alert while cooldown is active yields one rejected audit row
// and no change to remediation or breaker state.
#[tokio::test]
async fn duplicate_alert_under_cooldown_is_inert() {
    let pipeline = Pipeline::new(ActuatorConfig::default());
    pipeline
        .runtime
        .add_container(fake::details("web-1", "running"), fake::idle_sample());

    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;

    let history_before: RemediationHistory =
        get_state(pipeline.bus.as_ref(), &keys::remediation_history("web-1"))
            .await
            .expect("history");
    let breaker_before: BreakerState =
        get_state(pipeline.bus.as_ref(), &keys::circuit_breaker("web-1"))
            .await
            .unwrap_or_default();

    pipeline.clock.advance(chrono::Duration::seconds(30));
    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;

    let rows = audit_rows(&pipeline.bus, "web-1").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].result_status, OutcomeStatus::Rejected);

    // State identical to before the duplicate.
    let history_after: RemediationHistory =
        get_state(pipeline.bus.as_ref(), &keys::remediation_history("web-1"))
            .await
            .expect("history");
    assert_eq!(
        history_after.last_action_timestamp,
        history_before.last_action_timestamp
    );
    let breaker_after: BreakerState =
        get_state(pipeline.bus.as_ref(), &keys::circuit_breaker("web-1"))
            .await
            .unwrap_or_default();
    assert_eq!(breaker_after.failure_count, breaker_before.failure_count);
    assert_eq!(breaker_after.is_open, breaker_before.is_open);

    // Only the first restart reached the runtime.
    assert_eq!(pipeline.runtime.restarts().len(), 1);
}

// Dry-run must not touch the runtime or the guard state; only the audit
// trail records it.
#[tokio::test]
async fn dry_run_leaves_no_side_effects() {
    let config = ActuatorConfig {
        dry_run: true,
        ..Default::default()
    };
    let pipeline = Pipeline::new(config);
    pipeline
        .runtime
        .add_container(fake::details("web-1", "running"), fake::idle_sample());

    pipeline
        .drive(alert("web-1", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;

    assert!(pipeline.runtime.restarts().is_empty());
    assert!(
        get_state::<RemediationHistory>(
            pipeline.bus.as_ref(),
            &keys::remediation_history("web-1")
        )
        .await
        .is_none()
    );
    assert!(
        get_state::<BreakerState>(pipeline.bus.as_ref(), &keys::circuit_breaker("web-1"))
            .await
            .is_none()
    );

    let rows = audit_rows(&pipeline.bus, "web-1").await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].dry_run);

    // The completion event still fans out, flagged as a dry run.
    let done = pipeline
        .bus
        .published_envelopes(keys::CHANNEL_REMEDIATION_COMPLETE);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].data["dry_run"], true);
}

// Everything published on remediation_needed is actionable and confident:
// never action=none, never below the routing threshold.
#[tokio::test]
async fn remediation_requests_are_always_actionable() {
    let pipeline = Pipeline::new(ActuatorConfig::default());

    // A mix of alerts: quiet, spiky, critical, restart-looping.
    pipeline.decider.handle_alert(alert("a", 10.0, vec![])).await;
    pipeline
        .decider
        .handle_alert(alert("b", 72.0, vec![hemostat_tests::medium_cpu_anomaly(72.0)]))
        .await;
    pipeline
        .decider
        .handle_alert(alert("c", 97.0, vec![critical_cpu_anomaly(97.0)]))
        .await;
    let mut looping = alert("d", 97.0, vec![critical_cpu_anomaly(97.0)]);
    looping.restart_count = 9;
    pipeline.decider.handle_alert(looping).await;

    for env in pipeline
        .bus
        .published_envelopes(keys::CHANNEL_REMEDIATION_NEEDED)
    {
        let request: hemo_proto::RemediationRequest =
            serde_json::from_value(env.data.clone()).expect("request");
        assert_ne!(request.action, Action::None);
        assert!(request.confidence >= 0.7);
    }

    // The restart-looping container went to false_alarm despite its
    // critical anomaly (rule order is part of the contract).
    let false_alarms: Vec<hemo_proto::FalseAlarm> = pipeline
        .bus
        .published_envelopes(keys::CHANNEL_FALSE_ALARM)
        .iter()
        .map(|env| serde_json::from_value(env.data.clone()).expect("payload"))
        .collect();
    assert!(false_alarms.iter().any(|fa| fa.container == "d"));
}

// events:{type} and events:all stay bounded and hold the same entries for a
// given type, newest first.
#[tokio::test]
async fn event_lists_are_bounded_and_consistent() {
    let bus = Arc::new(MemoryBus::new());
    let config = hemo_config::NotifierConfig {
        max_events: 10,
        ..Default::default()
    };
    let notifier = Notifier::new(Arc::clone(&bus) as Arc<dyn Bus>, config);

    for i in 0..25 {
        let envelope = Envelope::new(
            keys::EVENT_FALSE_ALARM,
            hemo_proto::Agent::Decider,
            serde_json::json!({"container": format!("c-{i}"), "reason": "noise",
                               "confidence": 0.5, "analysis_method": "rule_based"}),
        );
        notifier.store_event(&envelope).await.expect("store");
    }

    let typed = bus
        .lrange(&keys::events("false_alarm"), 0, -1)
        .await
        .expect("lrange");
    let all = bus.lrange(keys::EVENTS_ALL, 0, -1).await.expect("lrange");
    assert_eq!(typed.len(), 10);
    assert_eq!(all.len(), 10);
    assert_eq!(typed, all);

    let newest: Envelope = serde_json::from_str(&typed[0]).expect("envelope");
    assert_eq!(newest.data["container"], "c-24");
}
