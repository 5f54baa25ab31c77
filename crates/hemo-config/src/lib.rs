//! Environment-variable configuration for every HemoStat agent.
//!
//! Each agent loads its own config struct at startup. Malformed values fall
//! back to the documented default with a warning rather than aborting.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr + Copy>(name: &str, raw: Option<&str>, default: T) -> T {
    match raw {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = name, value = %raw, "malformed value, using default");
                default
            }
        },
        None => default,
    }
}

fn bool_or(raw: Option<&str>, default: bool) -> bool {
    match raw {
        Some(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        None => default,
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    parse_or(name, std::env::var(name).ok().as_deref(), default)
}

fn env_bool(name: &str, default: bool) -> bool {
    bool_or(std::env::var(name).ok().as_deref(), default)
}

// ─── Bus ─────────────────────────────────────────────────────────────────────

/// Bus connection settings plus the universal transport retry policy.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub retry_max: u32,
    pub retry_delay: Duration,
}

impl BusConfig {
    /// `REDIS_URL` wins; otherwise the URL is assembled from
    /// `REDIS_HOST`/`REDIS_PORT`/`REDIS_DB`/`REDIS_PASSWORD`.
    pub fn from_env() -> Self {
        let url = env_string("REDIS_URL").unwrap_or_else(|| {
            let host = env_string("REDIS_HOST").unwrap_or_else(|| "redis".to_string());
            let port: u16 = env_parse("REDIS_PORT", 6379);
            let db: u32 = env_parse("REDIS_DB", 0);
            match env_string("REDIS_PASSWORD") {
                Some(password) => format!("redis://:{password}@{host}:{port}/{db}"),
                None => format!("redis://{host}:{port}/{db}"),
            }
        });
        Self {
            url,
            retry_max: env_parse("RETRY_MAX", 3u32).max(1),
            retry_delay: Duration::from_secs_f64(env_parse("RETRY_DELAY", 1.0f64).max(0.0)),
        }
    }
}

// ─── Observer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub poll_interval: Duration,
    pub threshold_cpu: f64,
    pub threshold_memory: f64,
}

impl ObserverConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL", 30u64).max(1)),
            threshold_cpu: env_parse("THRESHOLD_CPU_PERCENT", 85.0f64),
            threshold_memory: env_parse("THRESHOLD_MEMORY_PERCENT", 80.0f64),
        }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            threshold_cpu: 85.0,
            threshold_memory: 80.0,
        }
    }
}

// ─── Decider ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeciderConfig {
    pub ai_model: Option<String>,
    pub ai_fallback_enabled: bool,
    pub confidence_threshold: f64,
    pub history_size: usize,
    pub history_ttl: u64,
}

impl DeciderConfig {
    pub fn from_env() -> Self {
        Self {
            ai_model: env_string("AI_MODEL"),
            ai_fallback_enabled: env_bool("AI_FALLBACK_ENABLED", true),
            confidence_threshold: env_parse("CONFIDENCE_THRESHOLD", 0.7f64),
            history_size: env_parse("HISTORY_SIZE", 10usize).max(1),
            history_ttl: env_parse("HISTORY_TTL", 3600u64),
        }
    }
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            ai_model: None,
            ai_fallback_enabled: true,
            confidence_threshold: 0.7,
            history_size: 10,
            history_ttl: 3600,
        }
    }
}

// ─── Actuator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ActuatorConfig {
    pub cooldown_seconds: i64,
    pub max_retries_per_hour: u32,
    pub dry_run: bool,
    pub enforce_exec_allowlist: bool,
}

impl ActuatorConfig {
    pub fn from_env() -> Self {
        Self {
            cooldown_seconds: env_parse("COOLDOWN_SECONDS", 3600i64).max(0),
            max_retries_per_hour: env_parse("MAX_RETRIES_PER_HOUR", 3u32).max(1),
            dry_run: env_bool("DRY_RUN", false),
            enforce_exec_allowlist: env_bool("ENFORCE_EXEC_ALLOWLIST", false),
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 3600,
            max_retries_per_hour: 3,
            dry_run: false,
            enforce_exec_allowlist: false,
        }
    }
}

// ─── Notifier ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub slack_webhook_url: Option<String>,
    pub alert_enabled: bool,
    pub event_ttl: u64,
    pub max_events: usize,
    pub dedupe_ttl: u64,
}

impl NotifierConfig {
    pub fn from_env() -> Self {
        Self {
            slack_webhook_url: env_string("SLACK_WEBHOOK_URL"),
            alert_enabled: env_bool("ALERT_ENABLED", true),
            event_ttl: env_parse("ALERT_EVENT_TTL", 3600u64),
            max_events: env_parse("ALERT_MAX_EVENTS", 100usize).max(1),
            dedupe_ttl: env_parse("ALERT_DEDUPE_TTL", 60u64),
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            slack_webhook_url: None,
            alert_enabled: true,
            event_ttl: 3600,
            max_events: 100,
            dedupe_ttl: 60,
        }
    }
}

// ─── Scanner ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub zap_host: String,
    pub zap_port: u16,
    pub scan_interval: Duration,
    pub scan_timeout: Duration,
    pub max_scan_time: Duration,
    pub targets: Vec<String>,
}

impl ScannerConfig {
    pub fn from_env() -> Self {
        let mut targets = vec!["http://juice-shop:3000".to_string()];
        if let Some(extra) = env_string("VULNSCANNER_TARGETS") {
            targets.extend(
                extra
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
            );
        }
        Self {
            zap_host: env_string("ZAP_HOST").unwrap_or_else(|| "zap".to_string()),
            zap_port: env_parse("ZAP_PORT", 8080u16),
            scan_interval: Duration::from_secs(env_parse("VULNSCANNER_INTERVAL", 3600u64).max(1)),
            scan_timeout: Duration::from_secs(env_parse("VULNSCANNER_TIMEOUT", 1800u64)),
            max_scan_time: Duration::from_secs(env_parse("VULNSCANNER_MAX_TIME", 3600u64)),
            targets,
        }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}:{}", self.zap_host, self.zap_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; each uses its own variable names
    // to stay independent of execution order.

    #[test]
    fn test_defaults_without_env() {
        let observer = ObserverConfig::default();
        assert_eq!(observer.poll_interval, Duration::from_secs(30));
        assert_eq!(observer.threshold_cpu, 85.0);
        assert_eq!(observer.threshold_memory, 80.0);

        let decider = DeciderConfig::default();
        assert_eq!(decider.confidence_threshold, 0.7);
        assert_eq!(decider.history_size, 10);
        assert!(decider.ai_fallback_enabled);

        let actuator = ActuatorConfig::default();
        assert_eq!(actuator.cooldown_seconds, 3600);
        assert_eq!(actuator.max_retries_per_hour, 3);
        assert!(!actuator.dry_run);
        assert!(!actuator.enforce_exec_allowlist);
    }

    #[test]
    fn test_parse_malformed_falls_back() {
        let value: u64 = parse_or("POLL_INTERVAL", Some("not-a-number"), 42);
        assert_eq!(value, 42);
        let value: u64 = parse_or("POLL_INTERVAL", Some("15"), 42);
        assert_eq!(value, 15);
        let value: u64 = parse_or("POLL_INTERVAL", None, 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_bool_variants() {
        assert!(bool_or(Some("TRUE"), false));
        assert!(bool_or(Some("1"), false));
        assert!(!bool_or(Some("off"), true));
        assert!(!bool_or(Some("false"), true));
        assert!(bool_or(None, true));
    }

    #[test]
    fn test_scanner_api_url() {
        let config = ScannerConfig {
            zap_host: "zap".to_string(),
            zap_port: 8080,
            scan_interval: Duration::from_secs(3600),
            scan_timeout: Duration::from_secs(1800),
            max_scan_time: Duration::from_secs(3600),
            targets: vec![],
        };
        assert_eq!(config.api_url(), "http://zap:8080");
    }
}
