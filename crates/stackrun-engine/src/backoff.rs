//! Exponential backoff for status polling and transient-error retries.
//!
//! Polling never spins: every iteration sleeps on the tokio clock, which
//! tests pause and auto-advance to get deterministic timing.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use stackrun_core::{ApiError, StackError};

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// First delay.
    pub initial: Duration,
    /// Growth factor applied after every delay.
    pub multiplier: f64,
    /// Upper bound for a single delay.
    pub max_interval: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max_interval,
        }
    }

    /// Constant interval, mostly useful in tests.
    pub fn constant(interval: Duration) -> Self {
        Self::new(interval, 1.0, interval)
    }

    /// Delay that follows `current`, capped at `max_interval`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.multiplier).min(self.max_interval.as_secs_f64()),
        )
    }

    /// Infinite sequence of delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.initial.min(self.max_interval)), move |d| {
            Some(self.next_delay(*d))
        })
    }
}

/// Retry policy for transient collaborator errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. 0 and 1 both mean no retry.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::constant(Duration::ZERO),
        }
    }
}

/// Run `operation`, retrying transient API errors with jittered backoff.
///
/// Non-transient errors are returned immediately.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.backoff.initial;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if attempt >= policy.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis() as u64,
                    "Transient failure, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
                delay = policy.backoff.next_delay(delay);
            }
        }
    }
}

/// Result of one polling probe.
#[derive(Debug)]
pub enum PollStep<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not there yet, poll again.
    Pending,
}

/// Probe until it reports `Ready`, the deadline passes, or `cancel` fires.
///
/// The probe runs once more when the deadline is reached, so a condition
/// that becomes true during the last sleep is still observed.
pub async fn poll_until<F, Fut, T>(
    backoff: &Backoff,
    deadline: Duration,
    cancel: &CancellationToken,
    name: &str,
    mut probe: F,
) -> Result<T, StackError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStep<T>, StackError>>,
{
    let started = Instant::now();
    let mut delays = backoff.delays();

    loop {
        if let PollStep::Ready(value) = probe().await? {
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return Err(StackError::Timeout {
                name: name.to_string(),
                waited: elapsed,
            });
        }

        let delay = delays
            .next()
            .unwrap_or(backoff.max_interval)
            .min(deadline - elapsed);
        debug!(target_name = %name, delay_ms = delay.as_millis() as u64, "Polling again");

        tokio::select! {
            _ = cancel.cancelled() => return Err(StackError::Cancelled(name.to_string())),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
