//! Task trees: leaves composed into sequential and parallel sub-trees.
//!
//! A tree runs depth-first. Parallel children each get their own tokio task
//! and are joined before the parent completes; sequential children run in
//! declaration order. Every leaf ends up with exactly one [`LeafOutcome`],
//! collected in declaration order into a [`TreeReport`].

mod report;
mod tree;

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stackrun_core::StackError;

pub use report::{AggregateError, LeafOutcome, LeafStatus, TreeReport};
pub use tree::{ExecMode, Node, TaskTree};

/// Per-run context handed to every leaf.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An atomic unit of work.
#[async_trait]
pub trait Task: Send + Sync {
    /// Human readable description, used in logs and reports.
    fn describe(&self) -> String;

    /// Name of the remote resource this task acts on, if any.
    /// Two leaves of one tree may not share a resource.
    fn resource(&self) -> Option<String> {
        None
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), StackError>;
}

/// Leaf built from a closure.
pub struct FnTask<F> {
    description: String,
    resource: Option<String>,
    f: F,
}

impl<F, Fut> FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StackError>> + Send,
{
    pub fn new(description: impl Into<String>, f: F) -> Self {
        Self {
            description: description.into(),
            resource: None,
            f,
        }
    }

    /// Builder method to set the resource name.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

#[async_trait]
impl<F, Fut> Task for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), StackError>> + Send,
{
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn resource(&self) -> Option<String> {
        self.resource.clone()
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), StackError> {
        (self.f)(ctx.clone()).await
    }
}
