//! Cooldown and circuit-breaker admission checks.

use chrono::{DateTime, Utc};
use hemo_proto::{BreakerState, RemediationHistory};

/// One-hour window after which an open breaker stops blocking.
pub const BREAKER_WINDOW_SECS: i64 = 3600;

/// `Some(remaining_seconds)` while the cooldown since the last recorded
/// action is still active, `None` when the request may proceed.
pub fn cooldown_remaining(
    history: &RemediationHistory,
    now: DateTime<Utc>,
    cooldown_seconds: i64,
) -> Option<i64> {
    let last = history.last_action_timestamp?;
    let elapsed = now.signed_duration_since(last).num_seconds();
    if elapsed < cooldown_seconds {
        Some((cooldown_seconds - elapsed).max(0))
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerVerdict {
    /// Breaker closed; proceed.
    Proceed,
    /// Breaker was open but the hour window elapsed; close it, then proceed.
    ProceedAfterReset,
    /// Breaker open inside the window; reject.
    Reject { retry_count: u32 },
}

pub fn check_breaker(state: &BreakerState, now: DateTime<Utc>) -> BreakerVerdict {
    if !state.is_open {
        return BreakerVerdict::Proceed;
    }

    match state.opened_timestamp {
        Some(opened) => {
            let elapsed = now.signed_duration_since(opened).num_seconds();
            if elapsed >= BREAKER_WINDOW_SECS {
                BreakerVerdict::ProceedAfterReset
            } else {
                BreakerVerdict::Reject {
                    retry_count: state.failure_count.max(state.retry_count),
                }
            }
        }
        // Open with no timestamp should not happen; fail safe by resetting.
        None => BreakerVerdict::ProceedAfterReset,
    }
}
