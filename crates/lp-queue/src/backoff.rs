//! Retry policies and the shared retry decision.
//!
//! Two cadences exist in the product: infrastructure backoff for webhook
//! delivery (seconds to an hour) and a consumer-facing cadence for rent
//! collection (days between direct-debit re-attempts). Both plug into the
//! same `decide` function so the state machine lives in exactly one place.

use chrono::{DateTime, Duration, Utc};
use lp_common::ExecutionOutcome;

/// Pluggable delay schedule, indexed by the number of failures already
/// recorded for the task.
#[derive(Debug, Clone)]
pub enum RetryPolicy {
    /// `min(base * factor^attempt, cap)`
    ExponentialBackoff {
        base: Duration,
        factor: u32,
        cap: Duration,
    },
    /// Fixed delays; attempts past the end reuse the last entry.
    FixedOffsets(Vec<Duration>),
}

impl RetryPolicy {
    /// Webhook delivery default: 5s, 20s, 80s, 320s, 1280s, then capped at 1h.
    pub fn webhook_default() -> Self {
        RetryPolicy::ExponentialBackoff {
            base: Duration::seconds(5),
            factor: 4,
            cap: Duration::hours(1),
        }
    }

    /// Rent collection default: re-attempt 3, 7 and 14 days after a failed
    /// direct debit.
    pub fn collection_default() -> Self {
        RetryPolicy::FixedOffsets(vec![
            Duration::days(3),
            Duration::days(7),
            Duration::days(14),
        ])
    }

    /// Build the collection cadence from configured day offsets.
    pub fn from_day_offsets(days: &[i64]) -> Self {
        RetryPolicy::FixedOffsets(days.iter().map(|d| Duration::days(*d)).collect())
    }

    /// Delay before the next attempt, given how many attempts have already
    /// failed (0 = first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::ExponentialBackoff { base, factor, cap } => {
                let base_ms = base.num_milliseconds();
                let delay_ms = match factor.checked_pow(attempt) {
                    Some(mult) => base_ms.saturating_mul(i64::from(mult)),
                    None => cap.num_milliseconds(),
                };
                Duration::milliseconds(delay_ms.min(cap.num_milliseconds()))
            }
            RetryPolicy::FixedOffsets(offsets) => {
                let idx = (attempt as usize).min(offsets.len().saturating_sub(1));
                offsets.get(idx).copied().unwrap_or_else(Duration::zero)
            }
        }
    }
}

/// What to do with a task after one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Attempt succeeded; task is done.
    Complete,
    /// Retryable failure with budget left: persist the new count and due time.
    Reschedule {
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget exhausted, or the failure is not worth retrying.
    /// Webhooks dead-letter; schedules stop and notify.
    Exhaust { retry_count: i32 },
}

/// The one retry decision, shared by webhook delivery and rent collection.
///
/// `retry_count` is the number of failures recorded before this attempt.
/// A task dead-letters exactly when its `max_retries`-th consecutive failure
/// occurs. Non-retryable failures exhaust immediately rather than burning
/// the remaining budget on an unrecoverable error.
pub fn decide(
    outcome: &ExecutionOutcome,
    retry_count: i32,
    max_retries: i32,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Disposition {
    if outcome.success {
        return Disposition::Complete;
    }

    let new_count = retry_count + 1;
    if !outcome.retryable || new_count >= max_retries {
        return Disposition::Exhaust {
            retry_count: new_count,
        };
    }

    let delay = policy.delay_for(retry_count.max(0) as u32);
    Disposition::Reschedule {
        retry_count: new_count,
        next_retry_at: now + delay,
    }
}
