//! Retry and dead-letter policy.
//!
//! Retries are never looped in-process: a retryable failure leaves the
//! message on the queue with a longer visibility timeout, and the queue
//! redelivers it. This module only decides what should happen to a delivery
//! given the result of one attempt and how many attempts have been made.

use std::time::Duration;

use crate::error::PipelineError;
use crate::models::ErrorKind;

/// What to do with a delivery after one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Done; delete the message.
    Ack,
    /// Leave the message on the queue, hidden for `delay`.
    Retry { delay: Duration },
    /// Park the message in the dead-letter destination, then delete it.
    DeadLetter { kind: ErrorKind, reason: String },
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total deliveries allowed, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Backoff before delivery number `receive_count + 1`.
    pub fn backoff(&self, receive_count: u32) -> Duration {
        let exp = receive_count.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }

    /// Decide the fate of a delivery that has been received `receive_count`
    /// times (1 on first delivery).
    pub fn disposition<T>(&self, result: &Result<T, PipelineError>, receive_count: u32) -> Disposition {
        match result {
            Ok(_) => Disposition::Ack,
            Err(e) if !e.is_retryable() => Disposition::DeadLetter {
                kind: e.kind(),
                reason: e.to_string(),
            },
            Err(e) if receive_count >= self.max_attempts => Disposition::DeadLetter {
                kind: ErrorKind::RetriesExhausted,
                reason: format!("gave up after {} attempts: {}", receive_count, e),
            },
            Err(_) => Disposition::Retry {
                delay: self.backoff(receive_count),
            },
        }
    }
}
