//! Notifier sink: stores pipeline outcomes in the bounded event timeline and
//! forwards them to a Slack webhook with deduplication.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use hemo_bus::Bus;
use hemo_config::NotifierConfig;
use hemo_proto::{Envelope, FalseAlarm, RemediationComplete, VulnReport, keys};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub mod slack;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const WEBHOOK_MAX_ATTEMPTS: u32 = 3;
const WEBHOOK_BASE_DELAY: Duration = Duration::from_secs(1);

pub struct Notifier {
    bus: Arc<dyn Bus>,
    config: NotifierConfig,
    http: reqwest::Client,
}

impl Notifier {
    pub fn new(bus: Arc<dyn Bus>, config: NotifierConfig) -> Self {
        if let Some(url) = &config.slack_webhook_url {
            if !url.starts_with("https://hooks.slack.com/") {
                let prefix: String = url.chars().take(50).collect();
                warn!(url_prefix = %prefix, "unexpected slack webhook url format");
            }
        }
        let slack = if config.alert_enabled && config.slack_webhook_url.is_some() {
            "enabled"
        } else {
            "disabled"
        };
        info!(
            slack,
            event_ttl = config.event_ttl,
            max_events = config.max_events,
            dedupe_ttl = config.dedupe_ttl,
            "notifier initialized"
        );
        Self {
            bus,
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Store the event in the type-specific list and the unified timeline,
    /// both newest-first, bounded, and TTL'd.
    pub async fn store_event(&self, envelope: &Envelope) -> Result<(), hemo_bus::BusError> {
        let entry = serde_json::to_string(envelope)?;
        let max = self.config.max_events as isize;
        let ttl = self.config.event_ttl;

        let typed_key = keys::events(&envelope.event_type);
        self.bus.lpush(&typed_key, &entry).await?;
        self.bus.ltrim(&typed_key, 0, max - 1).await?;
        self.bus.kv_expire(&typed_key, ttl).await?;

        self.bus.lpush(keys::EVENTS_ALL, &entry).await?;
        self.bus.ltrim(keys::EVENTS_ALL, 0, max - 1).await?;
        self.bus.kv_expire(keys::EVENTS_ALL, ttl).await?;

        debug!(event_type = %envelope.event_type, "event stored");
        Ok(())
    }

    fn event_hash(event_type: &str, timestamp: DateTime<Utc>, container: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(event_type.as_bytes());
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(container.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn is_duplicate(&self, hash: &str) -> bool {
        matches!(self.bus.kv_get(&keys::alert_sent(hash)).await, Ok(Some(_)))
    }

    async fn mark_sent(&self, hash: &str) {
        if let Err(e) = self
            .bus
            .kv_set(&keys::alert_sent(hash), "1", Some(self.config.dedupe_ttl))
            .await
        {
            error!(error = %e, "failed to record dedup marker");
        }
    }

    /// Send one formatted payload to the webhook, skipping duplicates.
    /// 429 responses back off twice as long as other failures.
    async fn notify(&self, payload: serde_json::Value, hash: &str) {
        let Some(url) = &self.config.slack_webhook_url else {
            debug!("slack webhook not configured, skipping notification");
            return;
        };
        if self.is_duplicate(hash).await {
            debug!("duplicate event, skipping notification");
            return;
        }

        for attempt in 1..=WEBHOOK_MAX_ATTEMPTS {
            let response = self
                .http
                .post(url)
                .timeout(WEBHOOK_TIMEOUT)
                .json(&payload)
                .send()
                .await;

            let delay = match response {
                Ok(resp) if resp.status().is_success() => {
                    self.mark_sent(hash).await;
                    info!("slack notification sent");
                    return;
                }
                Ok(resp) if resp.status().as_u16() == 429 => {
                    warn!(attempt, "slack rate limit (429)");
                    WEBHOOK_BASE_DELAY * 2u32.pow(attempt - 1) * 2
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), attempt, "slack webhook error");
                    WEBHOOK_BASE_DELAY * 2u32.pow(attempt - 1)
                }
                Err(e) => {
                    warn!(error = %e, attempt, "slack webhook request failed");
                    WEBHOOK_BASE_DELAY * 2u32.pow(attempt - 1)
                }
            };

            if attempt < WEBHOOK_MAX_ATTEMPTS {
                tokio::time::sleep(delay).await;
            }
        }
        warn!("slack notification dropped after retries");
    }

    async fn handle(&self, channel: &str, envelope: Envelope) {
        if let Err(e) = self.store_event(&envelope).await {
            error!(error = %e, "failed to store event");
        }
        if !self.config.alert_enabled {
            return;
        }

        match channel {
            keys::CHANNEL_REMEDIATION_COMPLETE => {
                match serde_json::from_value::<RemediationComplete>(envelope.data.clone()) {
                    Ok(event) => {
                        let hash = Self::event_hash(
                            &envelope.event_type,
                            envelope.timestamp,
                            &event.container,
                        );
                        self.notify(slack::format_remediation(&event), &hash).await;
                    }
                    Err(e) => error!(error = %e, "malformed remediation_complete payload"),
                }
            }
            keys::CHANNEL_FALSE_ALARM => {
                match serde_json::from_value::<FalseAlarm>(envelope.data.clone()) {
                    Ok(event) => {
                        let hash = Self::event_hash(
                            &envelope.event_type,
                            envelope.timestamp,
                            &event.container,
                        );
                        self.notify(slack::format_false_alarm(&event), &hash).await;
                    }
                    Err(e) => error!(error = %e, "malformed false_alarm payload"),
                }
            }
            keys::CHANNEL_ALERTS => {
                match serde_json::from_value::<VulnReport>(envelope.data.clone()) {
                    Ok(report) => {
                        let hash = Self::event_hash(
                            &envelope.event_type,
                            envelope.timestamp,
                            &report.target,
                        );
                        self.notify(slack::format_vulnerability(&report), &hash).await;
                    }
                    Err(e) => error!(error = %e, "malformed vulnerability payload"),
                }
            }
            other => debug!(channel = other, "ignoring message on unexpected channel"),
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<(), hemo_bus::BusError> {
        let mut sub = self
            .bus
            .subscribe(&[
                keys::CHANNEL_REMEDIATION_COMPLETE,
                keys::CHANNEL_FALSE_ALARM,
                keys::CHANNEL_ALERTS,
            ])
            .await?;
        info!("notifier listening");

        loop {
            tokio::select! {
                msg = sub.recv() => {
                    let Some(msg) = msg else { break };
                    match serde_json::from_str::<Envelope>(&msg.payload) {
                        Ok(envelope) => {
                            info!(
                                channel = %msg.channel,
                                event_type = %envelope.event_type,
                                "received event"
                            );
                            self.handle(&msg.channel, envelope).await;
                        }
                        Err(e) => error!(error = %e, "dropping malformed bus message"),
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("notifier loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hemo_bus::MemoryBus;
    use hemo_proto::{Action, ActionOutcome, Agent};
    use serde_json::json;

    fn notifier(bus: Arc<MemoryBus>) -> Notifier {
        Notifier::new(bus, NotifierConfig::default())
    }

    fn remediation_envelope(container: &str) -> Envelope {
        let complete = RemediationComplete {
            container: container.to_string(),
            action: Action::Restart,
            result: ActionOutcome::success(json!("restarted")),
            dry_run: false,
            reason: Some("cpu".to_string()),
            confidence: Some(0.9),
        };
        Envelope::new(
            keys::EVENT_REMEDIATION_COMPLETE,
            Agent::Actuator,
            serde_json::to_value(&complete).expect("payload"),
        )
    }

    #[tokio::test]
    async fn test_event_stored_in_both_lists() {
        let bus = Arc::new(MemoryBus::new());
        let notifier = notifier(Arc::clone(&bus));

        notifier
            .store_event(&remediation_envelope("web-1"))
            .await
            .expect("store");

        let typed = bus
            .lrange(&keys::events("remediation_complete"), 0, -1)
            .await
            .expect("lrange");
        let all = bus.lrange(keys::EVENTS_ALL, 0, -1).await.expect("lrange");
        assert_eq!(typed.len(), 1);
        assert_eq!(all.len(), 1);
        assert_eq!(typed[0], all[0]);
    }

    #[tokio::test]
    async fn test_timeline_bounded_newest_first() {
        let bus = Arc::new(MemoryBus::new());
        let config = NotifierConfig {
            max_events: 5,
            ..Default::default()
        };
        let notifier = Notifier::new(Arc::clone(&bus) as Arc<dyn Bus>, config);

        for i in 0..8 {
            notifier
                .store_event(&remediation_envelope(&format!("web-{i}")))
                .await
                .expect("store");
        }

        let all = bus.lrange(keys::EVENTS_ALL, 0, -1).await.expect("lrange");
        assert_eq!(all.len(), 5);
        // Newest at the head.
        let head: Envelope = serde_json::from_str(&all[0]).expect("envelope");
        assert_eq!(head.data["container"], "web-7");
    }

    #[tokio::test]
    async fn test_dedup_marker_round_trip() {
        let bus = Arc::new(MemoryBus::new());
        let notifier = notifier(Arc::clone(&bus));

        let hash = Notifier::event_hash("remediation_complete", Utc::now(), "web-1");
        assert!(!notifier.is_duplicate(&hash).await);
        notifier.mark_sent(&hash).await;
        assert!(notifier.is_duplicate(&hash).await);
    }

    #[test]
    fn test_event_hash_distinguishes_events() {
        let now = Utc::now();
        let a = Notifier::event_hash("remediation_complete", now, "web-1");
        let b = Notifier::event_hash("remediation_complete", now, "web-2");
        let c = Notifier::event_hash("false_alarm", now, "web-1");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_handle_without_webhook_still_stores() {
        let bus = Arc::new(MemoryBus::new());
        let notifier = notifier(Arc::clone(&bus));

        let envelope = remediation_envelope("web-1");
        notifier
            .handle(keys::CHANNEL_REMEDIATION_COMPLETE, envelope)
            .await;

        let typed = bus
            .lrange(&keys::events("remediation_complete"), 0, -1)
            .await
            .expect("lrange");
        assert_eq!(typed.len(), 1);
    }
}
