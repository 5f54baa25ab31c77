//! AI analysis: prompt construction, bounded retry, tolerant parsing.

use crate::extract::extract_json_object;
use crate::llm::{LlmBackend, LlmError};
use hemo_proto::{Action, Analysis, AnalysisMethod, HealthAlert};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str =
    "You are an expert DevOps engineer analyzing container health issues.";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);

/// The exact schema the model is asked to return.
#[derive(Debug, Deserialize)]
struct AiVerdict {
    root_cause: String,
    action: Action,
    reason: String,
    confidence: f64,
    is_false_alarm: bool,
}

pub struct AiAnalyzer {
    backend: Arc<dyn LlmBackend>,
}

impl AiAnalyzer {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    /// Attempt AI analysis. `None` means "no AI result" (backend missing,
    /// retries exhausted, or server fault) and lets the caller fall through
    /// to the rule ladder.
    pub async fn analyze(&self, alert: &HealthAlert, history: &[HealthAlert]) -> Option<Analysis> {
        let prompt = build_prompt(alert, history);

        for attempt in 0..MAX_ATTEMPTS {
            match self.backend.invoke(SYSTEM_PROMPT, &prompt).await {
                Ok(text) => match parse_verdict(&text) {
                    Some(verdict) => {
                        info!(
                            container = %alert.container_name,
                            action = %verdict.action,
                            confidence = verdict.confidence,
                            "ai analysis succeeded"
                        );
                        return Some(Analysis {
                            action: verdict.action,
                            reason: verdict.reason,
                            confidence: verdict.confidence,
                            is_false_alarm: verdict.is_false_alarm,
                            analysis_method: AnalysisMethod::Ai,
                            root_cause: Some(verdict.root_cause),
                        });
                    }
                    None => {
                        warn!(
                            container = %alert.container_name,
                            attempt = attempt + 1,
                            max_attempts = MAX_ATTEMPTS,
                            "unparsable ai response"
                        );
                    }
                },
                Err(LlmError::Unsupported) => return None,
                Err(LlmError::Server(e)) => {
                    // Server-side model fault: retrying will not help.
                    warn!(container = %alert.container_name, error = %e, "ai server error, falling back");
                    return None;
                }
                Err(e) => {
                    warn!(
                        container = %alert.container_name,
                        attempt = attempt + 1,
                        max_attempts = MAX_ATTEMPTS,
                        error = %e,
                        "ai invocation failed"
                    );
                }
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt)).await;
            }
        }

        warn!(
            container = %alert.container_name,
            attempts = MAX_ATTEMPTS,
            "ai analysis exhausted, falling back to rule-based"
        );
        None
    }
}

fn parse_verdict(text: &str) -> Option<AiVerdict> {
    let candidate = extract_json_object(text)?;
    serde_json::from_str(&candidate).ok()
}

fn build_prompt(alert: &HealthAlert, history: &[HealthAlert]) -> String {
    let mut history_summary = String::new();
    if !history.is_empty() {
        history_summary = format!("\n\nRecent alert history ({} alerts):\n", history.len());
        let start = history.len().saturating_sub(3);
        for (i, h) in history[start..].iter().enumerate() {
            history_summary.push_str(&format!(
                "  Alert {}: CPU={:.1}%, Memory={:.1}%, Anomalies={}\n",
                i + 1,
                h.metrics.cpu_percent,
                h.metrics.memory_percent,
                h.anomalies.len()
            ));
        }
    }

    let anomalies_json = serde_json::to_string_pretty(&alert.anomalies)
        .unwrap_or_else(|_| "[]".to_string());

    format!(
        r#"Container: {name}
Health Status: {health}

Current Metrics:
- CPU: {cpu:.1}%
- Memory: {memory:.1}%
- Network I/O: rx={rx} tx={tx}
- Disk I/O: read={read} write={write}
- Exit Code: {exit_code}
- Restart Count: {restarts}

Detected Anomalies ({count}):
{anomalies}{history}

Respond with valid JSON only, no code fences or commentary. Provide your analysis in this format:
{{
  "root_cause": "Brief description of the root cause",
  "action": "restart|scale_up|cleanup|none",
  "reason": "Explanation for the recommended action",
  "confidence": 0.0-1.0,
  "is_false_alarm": true|false
}}

Be concise and focus on actionable insights."#,
        name = alert.container_name,
        health = alert.health_status,
        cpu = alert.metrics.cpu_percent,
        memory = alert.metrics.memory_percent,
        rx = alert.metrics.network_rx_bytes,
        tx = alert.metrics.network_tx_bytes,
        read = alert.metrics.blkio_read_bytes,
        write = alert.metrics.blkio_write_bytes,
        exit_code = alert.exit_code,
        restarts = alert.restart_count,
        count = alert.anomalies.len(),
        anomalies = anomalies_json,
        history = history_summary,
    )
}
