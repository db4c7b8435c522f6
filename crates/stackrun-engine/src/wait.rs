//! Counting gate between task-tree branches.
//!
//! Producers signal once per dependency; a consumer waits until every
//! expected signal arrived, the timeout elapses or the run is cancelled.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stackrun_core::StackError;

/// What one dependency reported.
#[derive(Debug, Clone)]
pub struct DependencyOutcome {
    pub name: String,
    pub error: Option<StackError>,
}

impl DependencyOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Snapshot returned by [`DeleteWaitCondition::wait`].
#[derive(Debug, Clone)]
pub struct WaitReport {
    /// Signals received so far, in arrival order.
    pub outcomes: Vec<DependencyOutcome>,
    /// Every expected signal arrived.
    pub complete: bool,
}

impl WaitReport {
    /// Names of dependencies that signalled a failure.
    pub fn failed(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.name.clone())
            .collect()
    }
}

/// Counter-and-signal object for one dependency group.
#[derive(Debug)]
pub struct DeleteWaitCondition {
    group: String,
    expected: usize,
    outcomes: Mutex<Vec<DependencyOutcome>>,
    received: watch::Sender<usize>,
}

impl DeleteWaitCondition {
    pub fn new(group: impl Into<String>, expected: usize) -> Arc<Self> {
        let (received, _) = watch::channel(0);
        Arc::new(Self {
            group: group.into(),
            expected,
            outcomes: Mutex::new(Vec::with_capacity(expected)),
            received,
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn received(&self) -> usize {
        *self.received.borrow()
    }

    /// Record the outcome of one dependency. Signals past `expected` are ignored.
    pub fn signal(&self, name: impl Into<String>, result: Result<(), StackError>) {
        let name = name.into();
        let count = {
            let mut outcomes = self.outcomes.lock();
            if outcomes.len() >= self.expected {
                warn!(group = %self.group, dependency = %name, "Unexpected signal ignored");
                return;
            }
            outcomes.push(DependencyOutcome {
                name: name.clone(),
                error: result.err(),
            });
            outcomes.len()
        };
        debug!(
            group = %self.group,
            dependency = %name,
            received = count,
            expected = self.expected,
            "Dependency signalled"
        );
        self.received.send_replace(count);
    }

    /// Signal on behalf of `name` when the returned guard is finished or
    /// dropped. A guard dropped without a result (panic, cancelled future)
    /// records a failure.
    pub fn guard(self: &Arc<Self>, name: impl Into<String>) -> SignalGuard {
        SignalGuard {
            condition: Arc::clone(self),
            name: name.into(),
            result: None,
        }
    }

    fn snapshot(&self) -> WaitReport {
        let outcomes = self.outcomes.lock().clone();
        let complete = outcomes.len() >= self.expected;
        WaitReport { outcomes, complete }
    }

    /// Wait until every expected signal arrived or `timeout` elapses.
    ///
    /// A timeout is not an error here; the report says whether the group
    /// is complete. Only cancellation fails.
    pub async fn wait(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitReport, StackError> {
        let mut rx = self.received.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            if *rx.borrow_and_update() >= self.expected {
                return Ok(self.snapshot());
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(StackError::Cancelled(self.group.clone()));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let report = self.snapshot();
                    warn!(
                        group = %self.group,
                        received = report.outcomes.len(),
                        expected = self.expected,
                        "Timed out waiting for dependencies"
                    );
                    return Ok(report);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(self.snapshot());
                    }
                }
            }
        }
    }

    /// Wait, then decide whether the dependent work may proceed.
    ///
    /// With `force` the gate always opens. Otherwise an incomplete group is
    /// `DependencyTimeout` and a failed dependency is `DependencyFailed`.
    pub async fn gate(
        &self,
        timeout: Duration,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<WaitReport, StackError> {
        let report = self.wait(timeout, cancel).await?;
        let failed = report.failed();

        if force {
            if !report.complete || !failed.is_empty() {
                warn!(
                    group = %self.group,
                    received = report.outcomes.len(),
                    expected = self.expected,
                    failed = failed.len(),
                    "Proceeding despite unfinished dependencies"
                );
            }
            return Ok(report);
        }
        if !report.complete {
            return Err(StackError::DependencyTimeout {
                group: self.group.clone(),
                received: report.outcomes.len(),
                expected: self.expected,
            });
        }
        if !failed.is_empty() {
            return Err(StackError::DependencyFailed {
                group: self.group.clone(),
                failed,
            });
        }

        info!(group = %self.group, expected = self.expected, "All dependencies finished");
        Ok(report)
    }
}

/// Signals its condition exactly once, on every exit path.
#[derive(Debug)]
pub struct SignalGuard {
    condition: Arc<DeleteWaitCondition>,
    name: String,
    result: Option<Result<(), StackError>>,
}

impl SignalGuard {
    pub fn finish(mut self, result: Result<(), StackError>) {
        self.result = Some(result);
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let result = self.result.take().unwrap_or_else(|| {
            Err(StackError::Fatal {
                name: self.name.clone(),
                status: None,
                reason: Some("deletion ended without reporting a result".to_string()),
                events: Vec::new(),
            })
        });
        self.condition.signal(std::mem::take(&mut self.name), result);
    }
}
