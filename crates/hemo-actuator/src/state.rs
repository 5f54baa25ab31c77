//! Post-action bookkeeping: remediation history and breaker accounting.

use crate::guards::BREAKER_WINDOW_SECS;
use chrono::{DateTime, Timelike, Utc};
use hemo_proto::{Action, BreakerState, OutcomeStatus, RemediationHistory};
use tracing::{debug, info, warn};

/// Record an executed (non-`not_applicable`) action on the history entry.
/// Retry bookkeeping is per current UTC hour.
pub fn record_action(
    history: &mut RemediationHistory,
    action: Action,
    status: OutcomeStatus,
    now: DateTime<Utc>,
) {
    history.last_action_timestamp = Some(now);
    history.last_action = Some(action);
    history.last_result_status = Some(status);

    if status == OutcomeStatus::Success {
        history.retry_count = 0;
        return;
    }

    let current_hour = truncate_to_hour(now);
    history.retry_count = match history.last_retry_hour {
        Some(last) if last == current_hour => history.retry_count + 1,
        _ => 1,
    };
    history.last_retry_hour = Some(current_hour);
}

/// Fold an action outcome into the breaker. Success closes and zeroes the
/// counter; a failure increments it and opens the breaker once it reaches
/// `max_retries`. A stale open window resets before accounting.
/// `failure_count` and `retry_count` track the same counter.
pub fn record_breaker_outcome(
    state: &mut BreakerState,
    success: bool,
    now: DateTime<Utc>,
    max_retries: u32,
) {
    if let Some(opened) = state.opened_timestamp {
        if now.signed_duration_since(opened).num_seconds() >= BREAKER_WINDOW_SECS {
            info!("circuit breaker window elapsed, resetting");
            reset_breaker(state);
        }
    }

    if success {
        if state.is_open || state.failure_count > 0 {
            debug!("circuit breaker closed after success");
        }
        reset_breaker(state);
        return;
    }

    state.failure_count += 1;
    state.retry_count = state.failure_count;
    if state.failure_count >= max_retries {
        state.is_open = true;
        state.opened_timestamp = Some(now);
        warn!(failures = state.failure_count, "circuit breaker opened");
    }
}

pub fn reset_breaker(state: &mut BreakerState) {
    state.is_open = false;
    state.failure_count = 0;
    state.retry_count = 0;
    state.opened_timestamp = None;
}

fn truncate_to_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}
