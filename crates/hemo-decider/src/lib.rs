//! Decider agent: consumes health alerts, classifies them through AI or the
//! rule ladder, maintains per-container alert history, and publishes exactly
//! one of `remediation_needed` or `false_alarm` per input alert.

#![forbid(unsafe_code)]

use hemo_bus::{Bus, RetryPolicy, get_state, publish_event, set_state};
use hemo_config::DeciderConfig;
use hemo_proto::{
    Action, Agent, AlertHistory, Analysis, FalseAlarm, HealthAlert, RemediationRequest, keys,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub mod ai;
pub mod extract;
pub mod llm;
pub mod rules;

use ai::AiAnalyzer;
use llm::LlmBackend;

pub struct Decider {
    bus: Arc<dyn Bus>,
    analyzer: AiAnalyzer,
    config: DeciderConfig,
    retry: RetryPolicy,
}

impl Decider {
    pub fn new(
        bus: Arc<dyn Bus>,
        backend: Arc<dyn LlmBackend>,
        config: DeciderConfig,
        retry: RetryPolicy,
    ) -> Self {
        info!(
            model = backend.model(),
            confidence_threshold = config.confidence_threshold,
            history_size = config.history_size,
            "decider initialized"
        );
        Self {
            bus,
            analyzer: AiAnalyzer::new(backend),
            config,
            retry,
        }
    }

    /// Full per-alert pipeline: history, analysis, history update, routing.
    pub async fn handle_alert(&self, alert: HealthAlert) {
        let container = alert.container_name.clone();
        let history: AlertHistory =
            get_state(self.bus.as_ref(), &keys::alert_history(&container))
                .await
                .unwrap_or_default();

        let analysis = match self.analyzer.analyze(&alert, &history.alerts).await {
            Some(analysis) => analysis,
            None => rules::analyze(&alert, &history.alerts),
        };

        self.update_history(history, alert.clone()).await;
        self.route(&alert, analysis).await;
    }

    async fn update_history(&self, mut history: AlertHistory, alert: HealthAlert) {
        let container = alert.container_name.clone();
        history.container = container.clone();
        history.alerts.push(alert);
        let excess = history.alerts.len().saturating_sub(self.config.history_size);
        if excess > 0 {
            history.alerts.drain(..excess);
        }

        if let Err(e) = set_state(
            self.bus.as_ref(),
            &keys::alert_history(&container),
            &history,
            Some(self.config.history_ttl),
        )
        .await
        {
            error!(container = %container, error = %e, "failed to update alert history");
        }
    }

    /// Routing rule: the false-alarm flag wins; otherwise remediation needs
    /// both enough confidence and an actionable action. An analysis that
    /// claims high confidence while recommending `none` is demoted to a
    /// false alarm.
    async fn route(&self, alert: &HealthAlert, analysis: Analysis) {
        let actionable = !analysis.is_false_alarm
            && analysis.confidence >= self.config.confidence_threshold
            && analysis.action != Action::None;

        if actionable {
            let request = RemediationRequest {
                container: alert.container_name.clone(),
                action: analysis.action,
                reason: analysis.reason.clone(),
                confidence: analysis.confidence,
                metrics: Some(alert.metrics.clone()),
                analysis_method: analysis.analysis_method,
                command: None,
            };
            warn!(
                container = %alert.container_name,
                action = %analysis.action,
                confidence = analysis.confidence,
                "remediation needed"
            );
            if let Err(e) = publish_event(
                self.bus.as_ref(),
                &self.retry,
                keys::CHANNEL_REMEDIATION_NEEDED,
                keys::EVENT_REMEDIATION_NEEDED,
                Agent::Decider,
                serde_json::to_value(&request).unwrap_or_default(),
            )
            .await
            {
                error!(container = %alert.container_name, error = %e, "failed to publish remediation request");
            }
            return;
        }

        let false_alarm = FalseAlarm {
            container: alert.container_name.clone(),
            reason: analysis.reason,
            confidence: analysis.confidence,
            analysis_method: analysis.analysis_method,
        };
        info!(
            container = %alert.container_name,
            confidence = false_alarm.confidence,
            reason = %false_alarm.reason,
            "false alarm"
        );
        if let Err(e) = publish_event(
            self.bus.as_ref(),
            &self.retry,
            keys::CHANNEL_FALSE_ALARM,
            keys::EVENT_FALSE_ALARM,
            Agent::Decider,
            serde_json::to_value(&false_alarm).unwrap_or_default(),
        )
        .await
        {
            error!(container = %alert.container_name, error = %e, "failed to publish false alarm");
        }
    }

    /// Subscription loop over `health_alert`. Malformed payloads are logged
    /// and dropped so a bad producer cannot poison the consumer.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), hemo_bus::BusError> {
        let mut sub = self.bus.subscribe(&[keys::CHANNEL_HEALTH_ALERT]).await?;
        info!("decider listening for health alerts");

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    let Some(msg) = msg else { break };
                    let envelope: hemo_proto::Envelope = match serde_json::from_str(&msg.payload) {
                        Ok(env) => env,
                        Err(e) => {
                            error!(error = %e, "dropping malformed bus message");
                            continue;
                        }
                    };
                    match serde_json::from_value::<HealthAlert>(envelope.data) {
                        Ok(alert) => {
                            info!(container = %alert.container_name, "received health alert");
                            self.handle_alert(alert).await;
                        }
                        Err(e) => error!(error = %e, "dropping malformed health alert"),
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("decider loop stopped");
        Ok(())
    }
}
