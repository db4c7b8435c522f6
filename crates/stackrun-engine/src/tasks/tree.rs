use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use stackrun_core::StackError;

use super::report::{LeafOutcome, LeafStatus, TreeReport};
use super::{Task, TaskContext};

/// How a tree runs its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Sequential,
    Parallel,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// A child of a tree.
#[derive(Clone)]
pub enum Node {
    Leaf(Arc<dyn Task>),
    Tree(Arc<TaskTree>),
}

impl Node {
    fn leaves(&self, out: &mut Vec<Arc<dyn Task>>) {
        match self {
            Self::Leaf(task) => out.push(Arc::clone(task)),
            Self::Tree(tree) => {
                for child in &tree.children {
                    child.leaves(out);
                }
            }
        }
    }

    /// Outcomes for every leaf under this node without running any of them.
    fn mark(&self, status: LeafStatus) -> Vec<LeafOutcome> {
        let mut leaves = Vec::new();
        self.leaves(&mut leaves);
        leaves
            .into_iter()
            .map(|task| LeafOutcome {
                task: task.describe(),
                resource: task.resource(),
                status: status.clone(),
                elapsed: Default::default(),
            })
            .collect()
    }

    fn describe(&self) -> String {
        match self {
            Self::Leaf(task) => task.describe(),
            Self::Tree(tree) => tree.describe_as_child(),
        }
    }

    fn run(self, ctx: TaskContext) -> BoxFuture<'static, Vec<LeafOutcome>> {
        match self {
            Self::Leaf(task) => run_leaf(task, ctx).map(|o| vec![o]).boxed(),
            Self::Tree(tree) => async move { tree.run_children(ctx).await }.boxed(),
        }
    }
}

/// Ordered children plus an execution mode.
pub struct TaskTree {
    name: String,
    mode: ExecMode,
    best_effort: bool,
    concurrency: Option<usize>,
    children: Vec<Node>,
}

impl fmt::Debug for TaskTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskTree")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("best_effort", &self.best_effort)
            .field("concurrency", &self.concurrency)
            .field("children", &self.children.len())
            .finish()
    }
}

impl TaskTree {
    pub fn new(name: impl Into<String>, mode: ExecMode) -> Self {
        Self {
            name: name.into(),
            mode,
            best_effort: false,
            concurrency: None,
            children: Vec::new(),
        }
    }

    pub fn sequential(name: impl Into<String>) -> Self {
        Self::new(name, ExecMode::Sequential)
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::new(name, ExecMode::Parallel)
    }

    /// Builder method: keep running sequential children after a failure.
    pub fn best_effort(mut self, best_effort: bool) -> Self {
        self.best_effort = best_effort;
        self
    }

    /// Builder method: run at most `limit` parallel children at once.
    pub fn with_concurrency(mut self, limit: Option<usize>) -> Self {
        self.concurrency = limit.map(|n| n.max(1));
        self
    }

    pub fn push_task(&mut self, task: impl Task + 'static) {
        self.children.push(Node::Leaf(Arc::new(task)));
    }

    pub fn push_arc(&mut self, task: Arc<dyn Task>) {
        self.children.push(Node::Leaf(task));
    }

    /// Append a sub-tree. Empty sub-trees are dropped.
    pub fn push_tree(&mut self, tree: TaskTree) {
        if !tree.is_empty() {
            self.children.push(Node::Tree(Arc::new(tree)));
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn is_best_effort(&self) -> bool {
        self.best_effort
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of leaves in the whole tree.
    pub fn leaf_count(&self) -> usize {
        self.leaf_descriptions().len()
    }

    pub fn leaf_descriptions(&self) -> Vec<String> {
        let mut leaves = Vec::new();
        for child in &self.children {
            child.leaves(&mut leaves);
        }
        leaves.iter().map(|t| t.describe()).collect()
    }

    /// Reject trees where two leaves act on the same resource or a leaf
    /// names an empty resource.
    pub fn validate(&self) -> Result<(), StackError> {
        let mut leaves = Vec::new();
        for child in &self.children {
            child.leaves(&mut leaves);
        }

        let mut seen = HashSet::new();
        for task in &leaves {
            let Some(resource) = task.resource() else {
                continue;
            };
            if resource.trim().is_empty() {
                return Err(StackError::InvalidTree(format!(
                    "task {:?} has an empty resource name",
                    task.describe()
                )));
            }
            if !seen.insert(resource.clone()) {
                return Err(StackError::InvalidTree(format!(
                    "resource {resource} appears more than once in {}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn describe_as_child(&self) -> String {
        match self.children.as_slice() {
            [only] => only.describe(),
            children => {
                let inner: Vec<String> = children.iter().map(Node::describe).collect();
                format!(
                    "{} {} sub-tasks: {{ {} }}",
                    children.len(),
                    self.mode,
                    inner.join(", ")
                )
            }
        }
    }

    /// Run every leaf and collect one outcome per leaf in declaration order.
    pub async fn run(self: Arc<Self>, ctx: TaskContext) -> TreeReport {
        let name = self.name.clone();
        info!(tree = %name, leaves = self.leaf_count(), "Running task tree");
        let started = Instant::now();

        let outcomes = self.run_children(ctx).await;
        let report = TreeReport {
            tree: name,
            outcomes,
        };

        if report.is_success() {
            info!(
                tree = %report.tree,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "{}",
                report.summary()
            );
        } else {
            warn!(tree = %report.tree, "{}", report.summary());
        }
        report
    }

    async fn run_children(self: Arc<Self>, ctx: TaskContext) -> Vec<LeafOutcome> {
        match self.mode {
            ExecMode::Sequential => self.run_sequential(ctx).await,
            ExecMode::Parallel => self.run_parallel(ctx).await,
        }
    }

    async fn run_sequential(&self, ctx: TaskContext) -> Vec<LeafOutcome> {
        let mut outcomes = Vec::new();
        let mut aborted = false;

        for child in &self.children {
            if aborted {
                outcomes.extend(child.mark(LeafStatus::Skipped));
                continue;
            }
            if ctx.is_cancelled() {
                outcomes.extend(child.mark(LeafStatus::Cancelled));
                continue;
            }

            let results = child.clone().run(ctx.clone()).await;
            let failed = results.iter().any(|o| o.status.is_failure());
            outcomes.extend(results);

            if failed && !self.best_effort {
                debug!(tree = %self.name, "Child failed, skipping remaining children");
                aborted = true;
            }
        }
        outcomes
    }

    async fn run_parallel(&self, ctx: TaskContext) -> Vec<LeafOutcome> {
        let semaphore = self.concurrency.map(|n| Arc::new(Semaphore::new(n)));

        let handles: Vec<_> = self
            .children
            .iter()
            .map(|child| {
                let child = child.clone();
                let ctx = ctx.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore {
                        Some(s) => match s.acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_) => return child.mark(LeafStatus::Cancelled),
                        },
                        None => None,
                    };
                    if ctx.is_cancelled() {
                        return child.mark(LeafStatus::Cancelled);
                    }
                    child.run(ctx).await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for (child, joined) in self.children.iter().zip(join_all(handles).await) {
            match joined {
                Ok(results) => outcomes.extend(results),
                Err(e) => {
                    error!(tree = %self.name, error = %e, "Parallel child aborted");
                    outcomes.extend(child.mark(LeafStatus::Failed(panicked(&e))));
                }
            }
        }
        outcomes
    }
}

impl fmt::Display for TaskTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.children.is_empty() {
            return write!(f, "no tasks");
        }
        let inner: Vec<String> = self.children.iter().map(Node::describe).collect();
        write!(
            f,
            "{} {} tasks: {{ {} }}",
            self.children.len(),
            self.mode,
            inner.join(", ")
        )
    }
}

fn panicked(e: &tokio::task::JoinError) -> StackError {
    StackError::Fatal {
        name: "task".to_string(),
        status: None,
        reason: Some(format!("task panicked: {e}")),
        events: Vec::new(),
    }
}

async fn run_leaf(task: Arc<dyn Task>, ctx: TaskContext) -> LeafOutcome {
    let description = task.describe();
    let resource = task.resource();
    let started = Instant::now();

    if ctx.is_cancelled() {
        return LeafOutcome {
            task: description,
            resource,
            status: LeafStatus::Cancelled,
            elapsed: Default::default(),
        };
    }

    debug!(task = %description, "Starting task");
    let handle = {
        let task = Arc::clone(&task);
        let ctx = ctx.clone();
        tokio::spawn(async move { task.run(&ctx).await })
    };

    let status = match handle.await {
        Ok(Ok(())) => {
            debug!(task = %description, "Task succeeded");
            LeafStatus::Succeeded
        }
        Ok(Err(StackError::Cancelled(_))) if ctx.is_cancelled() => LeafStatus::Cancelled,
        Ok(Err(e)) => {
            warn!(task = %description, error = %e, "Task failed");
            LeafStatus::Failed(e)
        }
        Err(e) => {
            error!(task = %description, error = %e, "Task panicked");
            LeafStatus::Failed(panicked(&e))
        }
    };

    LeafOutcome {
        task: description,
        resource,
        status,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::FnTask;
    use parking_lot::Mutex;
    use stackrun_core::{ErrorKind, StackStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    type Log = Arc<Mutex<Vec<String>>>;

    /// Leaf that sleeps, logs start/end and optionally fails.
    fn leaf(log: &Log, name: &str, secs: u64, fail: bool) -> impl Task + 'static {
        let log = log.clone();
        let name = name.to_string();
        FnTask::new(name.clone(), move |_ctx| {
            let log = log.clone();
            let name = name.clone();
            async move {
                log.lock().push(format!("start {name}"));
                tokio::time::sleep(Duration::from_secs(secs)).await;
                log.lock().push(format!("end {name}"));
                if fail {
                    Err(StackError::NotFound(name))
                } else {
                    Ok(())
                }
            }
        })
    }

    fn status_of(report: &TreeReport, task: &str) -> &'static str {
        report
            .outcome(task)
            .map(|o| o.status.as_str())
            .unwrap_or("missing")
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_leaf_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut root = TaskTree::sequential("root");
        let mut par = TaskTree::parallel("par");
        for i in 0..4 {
            let count = count.clone();
            par.push_task(FnTask::new(format!("leaf {i}"), move |_| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }
        root.push_tree(par);

        let report = Arc::new(root).run(TaskContext::default()).await;
        assert!(report.is_success());
        assert_eq!(report.total(), 4);
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_children_do_not_overlap() {
        let log: Log = Default::default();
        let mut root = TaskTree::sequential("root");
        root.push_task(leaf(&log, "a", 5, false));
        root.push_task(leaf(&log, "b", 1, false));

        Arc::new(root).run(TaskContext::default()).await;
        assert_eq!(*log.lock(), vec!["start a", "end a", "start b", "end b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_children_overlap_and_join() {
        let log: Log = Default::default();
        let mut root = TaskTree::sequential("root");
        let mut par = TaskTree::parallel("par");
        par.push_task(leaf(&log, "a", 5, false));
        par.push_task(leaf(&log, "b", 1, false));
        root.push_tree(par);
        root.push_task(leaf(&log, "after", 1, false));

        let started = Instant::now();
        Arc::new(root).run(TaskContext::default()).await;

        let log = log.lock().clone();
        assert_eq!(&log[..2], &["start a", "start b"]);
        assert_eq!(log[4], "start after");
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_failure_skips_remaining_siblings() {
        let log: Log = Default::default();
        let mut root = TaskTree::sequential("root");
        root.push_task(leaf(&log, "a", 1, true));
        root.push_task(leaf(&log, "b", 1, false));

        let report = Arc::new(root).run(TaskContext::default()).await;
        assert_eq!(status_of(&report, "a"), "failed");
        assert_eq!(status_of(&report, "b"), "skipped");

        let err = report.into_result().unwrap_err();
        assert_eq!(err.errors().count(), 1);
        assert!(err.to_string().contains("failed: a (a not found)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_continues_after_failure() {
        let log: Log = Default::default();
        let mut root = TaskTree::sequential("root").best_effort(true);
        root.push_task(leaf(&log, "a", 1, true));
        root.push_task(leaf(&log, "b", 1, false));

        let report = Arc::new(root).run(TaskContext::default()).await;
        assert_eq!(status_of(&report, "b"), "succeeded");
        assert!(!report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_failure_does_not_stop_siblings() {
        let log: Log = Default::default();
        let mut root = TaskTree::parallel("root");
        root.push_task(leaf(&log, "a", 1, true));
        root.push_task(leaf(&log, "b", 3, false));

        let report = Arc::new(root).run(TaskContext::default()).await;
        assert_eq!(status_of(&report, "a"), "failed");
        assert_eq!(status_of(&report, "b"), "succeeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_error_names_only_the_failed_leaf() {
        let done: Log = Default::default();
        let mut root = TaskTree::parallel("root");
        for (name, fail) in [("s1", false), ("s2", true), ("s3", false)] {
            let done = done.clone();
            root.push_task(
                FnTask::new(format!("delete {name}"), move |_| {
                    let done = done.clone();
                    async move {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        if fail {
                            return Err(StackError::fatal(
                                name,
                                StackStatus::DeleteFailed,
                                Some("resource in use".into()),
                            ));
                        }
                        done.lock().push(name.to_string());
                        Ok(())
                    }
                })
                .with_resource(name),
            );
        }

        let err = Arc::new(root)
            .run(TaskContext::default())
            .await
            .into_result()
            .unwrap_err();

        let failed: Vec<_> = err
            .errors()
            .map(|(o, e)| (o.resource.clone().unwrap_or_default(), e.kind()))
            .collect();
        assert_eq!(failed, vec![("s2".to_string(), ErrorKind::Fatal)]);
        assert!(err.to_string().starts_with("root: 2 of 3 tasks succeeded"));
        assert!(!err.to_string().contains("s1"));

        let mut done = done.lock().clone();
        done.sort();
        assert_eq!(done, vec!["s1", "s3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subtree_only_skips_within_its_parent() {
        let log: Log = Default::default();
        let mut root = TaskTree::parallel("root");
        let mut left = TaskTree::sequential("left");
        left.push_task(leaf(&log, "l1", 1, true));
        left.push_task(leaf(&log, "l2", 1, false));
        let mut right = TaskTree::sequential("right");
        right.push_task(leaf(&log, "r1", 1, false));
        right.push_task(leaf(&log, "r2", 1, false));
        root.push_tree(left);
        root.push_tree(right);

        let report = Arc::new(root).run(TaskContext::default()).await;
        let statuses: Vec<_> = report.outcomes.iter().map(|o| o.status.as_str()).collect();
        assert_eq!(statuses, vec!["failed", "skipped", "succeeded", "succeeded"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_is_honoured() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut root = TaskTree::parallel("root").with_concurrency(Some(2));
        for i in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            root.push_task(FnTask::new(format!("leaf {i}"), move |_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }));
        }

        let started = Instant::now();
        let report = Arc::new(root).run(TaskContext::default()).await;
        assert!(report.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_marks_unstarted_leaves() {
        let log: Log = Default::default();
        let cancel = CancellationToken::new();
        let mut root = TaskTree::sequential("root");
        root.push_task(leaf(&log, "a", 5, false));
        root.push_task(leaf(&log, "b", 5, false));

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            c.cancel();
        });

        let report = Arc::new(root).run(TaskContext::new(cancel)).await;
        assert_eq!(status_of(&report, "a"), "succeeded");
        assert_eq!(status_of(&report, "b"), "cancelled");
        assert!(!log.lock().contains(&"start b".to_string()));
    }

    #[tokio::test]
    async fn test_panicking_leaf_is_recorded_as_failure() {
        let mut root = TaskTree::parallel("root");
        root.push_task(FnTask::new("boom", |_| async {
            if true {
                panic!("boom");
            }
            Ok(())
        }));
        root.push_task(FnTask::new("fine", |_| async { Ok(()) }));

        let report = Arc::new(root).run(TaskContext::default()).await;
        assert_eq!(status_of(&report, "boom"), "failed");
        assert_eq!(status_of(&report, "fine"), "succeeded");
    }

    #[test]
    fn test_validate_rejects_duplicate_resources() {
        let mut root = TaskTree::parallel("root");
        root.push_task(FnTask::new("a", |_| async { Ok(()) }).with_resource("stack-a"));
        root.push_task(FnTask::new("b", |_| async { Ok(()) }).with_resource("stack-a"));
        assert!(matches!(root.validate(), Err(StackError::InvalidTree(_))));

        let mut root = TaskTree::parallel("root");
        root.push_task(FnTask::new("a", |_| async { Ok(()) }).with_resource(" "));
        assert!(root.validate().is_err());
    }

    #[test]
    fn test_describe_nested_tree() {
        let log: Log = Default::default();
        let mut root = TaskTree::sequential("root");
        root.push_task(leaf(&log, "create cluster", 0, false));
        let mut par = TaskTree::parallel("ngs");
        par.push_task(leaf(&log, "ng-1", 0, false));
        par.push_task(leaf(&log, "ng-2", 0, false));
        root.push_tree(par);

        assert_eq!(
            root.to_string(),
            "2 sequential tasks: { create cluster, 2 parallel sub-tasks: { ng-1, ng-2 } }"
        );
        assert_eq!(root.leaf_count(), 3);
    }
}
