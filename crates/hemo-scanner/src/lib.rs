//! Vulnerability scanner agent: drives OWASP ZAP active scans against
//! configured targets and publishes summarized findings into the alert
//! channel consumed by the Notifier and the read model.

#![forbid(unsafe_code)]

use chrono::Utc;
use hemo_bus::{Bus, RetryPolicy, publish_event, set_state};
use hemo_config::ScannerConfig;
use hemo_proto::{Agent, VulnReport, keys};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const ZAP_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ZAP_READY_WAIT: Duration = Duration::from_secs(120);
const VULN_STATE_TTL_SECS: u64 = 86_400;
const TOP_FINDINGS: usize = 5;

pub struct Scanner {
    bus: Arc<dyn Bus>,
    config: ScannerConfig,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl Scanner {
    pub fn new(bus: Arc<dyn Bus>, config: ScannerConfig, retry: RetryPolicy) -> Self {
        info!(
            zap = %config.api_url(),
            targets = config.targets.len(),
            scan_interval_secs = config.scan_interval.as_secs(),
            "scanner initialized"
        );
        Self {
            bus,
            config,
            http: reqwest::Client::new(),
            retry,
        }
    }

    async fn zap_get(&self, path: &str, query: &[(&str, &str)]) -> Option<Value> {
        let url = format!("{}{path}", self.config.api_url());
        let response = self
            .http
            .get(&url)
            .query(query)
            .timeout(Duration::from_secs(30))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                warn!(path, status = %resp.status(), "zap api error");
                None
            }
            Err(e) => {
                debug!(path, error = %e, "zap request failed");
                None
            }
        }
    }

    /// Poll the version endpoint until ZAP answers or the wait budget ends.
    pub async fn wait_ready(&self) -> bool {
        info!("waiting for zap to become ready");
        let deadline = tokio::time::Instant::now() + ZAP_READY_WAIT;

        while tokio::time::Instant::now() < deadline {
            if let Some(version) = self.zap_get("/JSON/core/view/version/", &[]).await {
                info!(version = %version["version"], "zap ready");
                return true;
            }
            tokio::time::sleep(ZAP_POLL_INTERVAL).await;
        }

        error!("zap did not become ready in time");
        false
    }

    async fn start_scan(&self, target: &str) -> Option<String> {
        info!(target, "starting active scan");
        let result = self
            .zap_get(
                "/JSON/ascan/action/scan/",
                &[("url", target), ("recurse", "true"), ("inScopeOnly", "false")],
            )
            .await?;
        let scan_id = result["scan"].as_str()?.to_string();
        info!(target, scan_id = %scan_id, "scan started");
        Some(scan_id)
    }

    async fn scan_progress(&self, scan_id: &str) -> Option<u32> {
        let result = self
            .zap_get("/JSON/ascan/view/status/", &[("scanId", scan_id)])
            .await?;
        result["status"].as_str()?.parse().ok()
    }

    async fn collect_alerts(&self) -> Vec<Value> {
        match self.zap_get("/JSON/core/view/alerts/", &[]).await {
            Some(result) => result["alerts"].as_array().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    async fn wait_for_completion(&self, scan_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.max_scan_time;
        let mut last_progress = 0;

        while tokio::time::Instant::now() < deadline {
            match self.scan_progress(scan_id).await {
                Some(progress) if progress >= 100 => {
                    info!(scan_id, "scan completed");
                    return true;
                }
                Some(progress) => {
                    if progress != last_progress {
                        debug!(scan_id, progress, "scan in progress");
                        last_progress = progress;
                    }
                }
                None => warn!(scan_id, "scan status unavailable"),
            }
            tokio::time::sleep(ZAP_POLL_INTERVAL).await;
        }

        warn!(scan_id, "scan did not complete within the time budget");
        false
    }

    /// One full scan of a single target. ZAP unavailability just skips the
    /// cycle; the loop keeps running.
    pub async fn scan_target(&self, target: &str) {
        let Some(scan_id) = self.start_scan(target).await else {
            warn!(target, "could not start scan, skipping cycle");
            return;
        };

        if !self.wait_for_completion(&scan_id).await {
            return;
        }

        let alerts = self.collect_alerts().await;
        let report = summarize(target, &alerts);
        info!(
            target,
            total = report.total_alerts,
            high = report.high,
            medium = report.medium,
            "scan summarized"
        );

        if let Err(e) = set_state(
            self.bus.as_ref(),
            &keys::vuln_state(target),
            &report,
            Some(VULN_STATE_TTL_SECS),
        )
        .await
        {
            error!(target, error = %e, "failed to store scan state");
        }

        if let Err(e) = publish_event(
            self.bus.as_ref(),
            &self.retry,
            keys::CHANNEL_ALERTS,
            keys::EVENT_VULN_SCAN,
            Agent::Scanner,
            serde_json::to_value(&report).unwrap_or_default(),
        )
        .await
        {
            error!(target, error = %e, "failed to publish scan report");
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        if !self.wait_ready().await {
            warn!("running degraded; will retry zap on each cycle");
        }

        let mut ticker = tokio::time::interval(self.config.scan_interval);
        info!("scanner loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for target in &self.config.targets {
                        self.scan_target(target).await;
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scanner loop stopped");
    }
}

/// Fold raw ZAP alerts into the published summary: counts per risk level
/// plus the first few distinct finding names, highest risk first.
pub fn summarize(target: &str, alerts: &[Value]) -> VulnReport {
    let mut report = VulnReport {
        target: target.to_string(),
        total_alerts: alerts.len() as u64,
        high: 0,
        medium: 0,
        low: 0,
        informational: 0,
        top_findings: Vec::new(),
        scanned_at: Utc::now(),
    };

    let mut findings: Vec<(u8, String)> = Vec::new();
    for alert in alerts {
        let risk = alert["risk"].as_str().unwrap_or("");
        let rank = match risk {
            "High" => {
                report.high += 1;
                3
            }
            "Medium" => {
                report.medium += 1;
                2
            }
            "Low" => {
                report.low += 1;
                1
            }
            _ => {
                report.informational += 1;
                0
            }
        };
        if let Some(name) = alert["alert"].as_str() {
            if !findings.iter().any(|(_, n)| n == name) {
                findings.push((rank, name.to_string()));
            }
        }
    }

    findings.sort_by(|a, b| b.0.cmp(&a.0));
    report.top_findings = findings
        .into_iter()
        .take(TOP_FINDINGS)
        .map(|(_, name)| name)
        .collect();
    report
}
