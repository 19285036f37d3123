//! Retry collaborator for optimistic concurrency conflicts.
//!
//! The dispatch pipeline reports a lost conditional write as
//! [`DispatchError::ConcurrencyConflict`] and stops. Re-running the *whole*
//! pipeline (reload, re-raise, re-write) is the caller's decision; this module
//! is the standard way to make it.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use sagaflow_machine::{ConsumeContext, Message};

use crate::dispatcher::{DispatchError, DispatchOutcome, PipelineSegment};

/// How the wait grows between pipeline re-runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same wait before every retry.
    Constant { delay: Duration },
    /// `initial * 2^(retry - 1)`, never more than `max`.
    Doubling { initial: Duration, max: Duration },
}

/// Bounds the re-runs of a pipeline that lost an optimistic write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-runs allowed after the first attempt; zero disables retrying.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::doubling(5, Duration::from_millis(10), Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Constant { delay },
        }
    }

    pub fn doubling(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Doubling { initial, max },
        }
    }

    /// Wait before the given retry (1-indexed); zero before the first attempt.
    pub fn delay_before(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Constant { delay } => delay,
            Backoff::Doubling { initial, max } => {
                let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }

    /// Whether another re-run is allowed after `retries` have already run.
    pub fn allows(&self, retries: u32) -> bool {
        retries < self.max_retries
    }
}

/// Run `op` until it succeeds, fails with anything but a concurrency
/// conflict, or the policy runs out of retries.
///
/// `op` receives the 0-indexed attempt number.
pub fn retry_on_conflict<T, F>(policy: &RetryPolicy, mut op: F) -> Result<T, DispatchError>
where
    F: FnMut(u32) -> Result<T, DispatchError>,
{
    let mut retries = 0;
    loop {
        match op(retries) {
            Err(err) if err.is_concurrency_conflict() && policy.allows(retries) => {
                retries += 1;
                let delay = policy.delay_before(retries);
                warn!(retry = retries, delay_ms = delay.as_millis() as u64, error = %err, "concurrency conflict; retrying dispatch");
                thread::sleep(delay);
            }
            result => return result,
        }
    }
}

impl<T: Message> PipelineSegment<T> {
    /// This segment, re-run from scratch on concurrency conflicts.
    pub fn with_retry(self, policy: RetryPolicy) -> PipelineSegment<T> {
        let event = self.event().clone();
        PipelineSegment::new(event, move |ctx: &ConsumeContext<T>| -> Result<DispatchOutcome, DispatchError> {
            retry_on_conflict(&policy, |_| self.handle(ctx))
        })
    }
}
