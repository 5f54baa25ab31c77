//! Slack attachment formatting for pipeline outcomes.

use chrono::Utc;
use hemo_proto::{FalseAlarm, OutcomeStatus, RemediationComplete, VulnReport};
use serde_json::{Value, json};

const FOOTER: &str = "HemoStat Notifier";

fn field(title: &str, value: impl Into<Value>, short: bool) -> Value {
    json!({"title": title, "value": value.into(), "short": short})
}

/// Remediation outcomes are color-coded by result status; rejection reasons
/// and failure details get their own fields.
pub fn format_remediation(event: &RemediationComplete) -> Value {
    let (color, marker, status_text) = match event.result.status {
        OutcomeStatus::Success => ("#36a64f", "OK", "Success"),
        OutcomeStatus::Failed => ("#ff0000", "FAIL", "Failed"),
        OutcomeStatus::Rejected => ("#ff9900", "HOLD", "Rejected"),
        OutcomeStatus::NotApplicable => ("#cccccc", "N/A", "Not Applicable"),
    };

    let mut fields = vec![
        field("Container", event.container.clone(), true),
        field("Action", event.action.to_string(), true),
        field("Status", status_text, true),
    ];

    if let Some(reason) = event.reason.as_ref().filter(|r| !r.is_empty()) {
        fields.push(field("Reason", reason.clone(), false));
    }
    if event.result.status == OutcomeStatus::Rejected {
        if let Some(rejection) = &event.result.reason {
            fields.push(field("Rejection Reason", rejection.clone(), false));
        }
    }
    if let Some(confidence) = event.confidence.filter(|c| *c > 0.0) {
        fields.push(field("Confidence", format!("{:.1}%", confidence * 100.0), true));
    }
    if event.dry_run {
        fields.push(field("Dry Run", "Yes", true));
    }
    if event.result.status == OutcomeStatus::Failed {
        if let Some(error) = &event.result.error {
            fields.push(field("Error", error.clone(), false));
        }
    }

    json!({
        "attachments": [{
            "fallback": format!("[{marker}] Container Remediation: {status_text}"),
            "color": color,
            "title": format!("Container Remediation: {status_text}"),
            "fields": fields,
            "footer": FOOTER,
            "ts": Utc::now().timestamp(),
        }]
    })
}

pub fn format_false_alarm(event: &FalseAlarm) -> Value {
    let mut fields = vec![
        field("Container", event.container.clone(), true),
        field(
            "Analysis Method",
            serde_json::to_value(event.analysis_method)
                .unwrap_or_else(|_| Value::String("unknown".to_string())),
            true,
        ),
    ];
    if !event.reason.is_empty() {
        fields.push(field("Reason", event.reason.clone(), false));
    }
    if event.confidence > 0.0 {
        fields.push(field(
            "Confidence",
            format!("{:.1}%", event.confidence * 100.0),
            true,
        ));
    }

    json!({
        "attachments": [{
            "fallback": "False Alarm Detected",
            "color": "#ffcc00",
            "title": "False Alarm Detected",
            "fields": fields,
            "footer": FOOTER,
            "ts": Utc::now().timestamp(),
        }]
    })
}

pub fn format_vulnerability(report: &VulnReport) -> Value {
    let color = if report.high > 0 {
        "#ff0000"
    } else if report.medium > 0 {
        "#ff9900"
    } else {
        "#36a64f"
    };

    let mut fields = vec![
        field("Target", report.target.clone(), true),
        field("Total Alerts", report.total_alerts, true),
        field("High", report.high, true),
        field("Medium", report.medium, true),
        field("Low", report.low, true),
        field("Informational", report.informational, true),
    ];
    if !report.top_findings.is_empty() {
        fields.push(field("Top Findings", report.top_findings.join("\n"), false));
    }

    json!({
        "attachments": [{
            "fallback": format!("Vulnerability Scan: {}", report.target),
            "color": color,
            "title": "Vulnerability Scan Complete",
            "fields": fields,
            "footer": FOOTER,
            "ts": Utc::now().timestamp(),
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hemo_proto::{Action, ActionOutcome, AnalysisMethod};

    fn remediation(status_outcome: ActionOutcome, dry_run: bool) -> RemediationComplete {
        RemediationComplete {
            container: "web-1".to_string(),
            action: Action::Restart,
            result: status_outcome,
            dry_run,
            reason: Some("cpu saturation".to_string()),
            confidence: Some(0.85),
        }
    }

    #[test]
    fn test_success_attachment() {
        let payload = format_remediation(&remediation(
            ActionOutcome::success(json!("restarted")),
            false,
        ));
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "#36a64f");
        assert!(attachment["title"].as_str().expect("title").contains("Success"));
        let fields = attachment["fields"].as_array().expect("fields");
        assert!(fields.iter().any(|f| f["title"] == "Confidence" && f["value"] == "85.0%"));
    }

    #[test]
    fn test_rejection_carries_reason() {
        let payload =
            format_remediation(&remediation(ActionOutcome::rejected_cooldown(3590), false));
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "#ff9900");
        let fields = attachment["fields"].as_array().expect("fields");
        assert!(
            fields
                .iter()
                .any(|f| f["title"] == "Rejection Reason" && f["value"] == "cooldown_active")
        );
    }

    #[test]
    fn test_failed_attachment_has_error() {
        let payload =
            format_remediation(&remediation(ActionOutcome::failed("timed out"), false));
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "#ff0000");
        let fields = attachment["fields"].as_array().expect("fields");
        assert!(fields.iter().any(|f| f["title"] == "Error" && f["value"] == "timed out"));
    }

    #[test]
    fn test_dry_run_flagged() {
        let payload =
            format_remediation(&remediation(ActionOutcome::success(json!("ok")), true));
        let fields = payload["attachments"][0]["fields"].as_array().expect("fields");
        assert!(fields.iter().any(|f| f["title"] == "Dry Run"));
    }

    #[test]
    fn test_false_alarm_attachment() {
        let payload = format_false_alarm(&FalseAlarm {
            container: "web-1".to_string(),
            reason: "transient spike".to_string(),
            confidence: 0.65,
            analysis_method: AnalysisMethod::RuleBased,
        });
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "#ffcc00");
        let fields = attachment["fields"].as_array().expect("fields");
        assert!(
            fields
                .iter()
                .any(|f| f["title"] == "Analysis Method" && f["value"] == "rule_based")
        );
    }

    #[test]
    fn test_vulnerability_color_by_risk() {
        let mut report = VulnReport {
            target: "http://shop:3000".to_string(),
            total_alerts: 4,
            high: 1,
            medium: 2,
            low: 1,
            informational: 0,
            top_findings: vec!["SQL Injection".to_string()],
            scanned_at: Utc::now(),
        };
        assert_eq!(
            format_vulnerability(&report)["attachments"][0]["color"],
            "#ff0000"
        );

        report.high = 0;
        assert_eq!(
            format_vulnerability(&report)["attachments"][0]["color"],
            "#ff9900"
        );
    }
}
