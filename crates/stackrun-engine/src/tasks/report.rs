use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};

use stackrun_core::StackError;

/// Final state of one leaf.
#[derive(Debug, Clone)]
pub enum LeafStatus {
    Succeeded,
    Failed(StackError),
    /// Not started because an earlier sequential sibling failed.
    Skipped,
    /// Not started, or stopped, because the run was cancelled.
    Cancelled,
}

impl LeafStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Result of one leaf.
#[derive(Debug, Clone)]
pub struct LeafOutcome {
    pub task: String,
    pub resource: Option<String>,
    pub status: LeafStatus,
    pub elapsed: Duration,
}

impl LeafOutcome {
    pub fn error(&self) -> Option<&StackError> {
        match &self.status {
            LeafStatus::Failed(e) => Some(e),
            _ => None,
        }
    }

    fn label(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.task)
    }
}

/// Outcomes of every leaf of a tree, in declaration order.
#[derive(Debug, Clone)]
pub struct TreeReport {
    pub tree: String,
    pub outcomes: Vec<LeafOutcome>,
}

impl TreeReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &LeafOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }

    pub fn outcome(&self, task: &str) -> Option<&LeafOutcome> {
        self.outcomes.iter().find(|o| o.task == task)
    }

    /// True iff every leaf succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    pub fn summary(&self) -> String {
        format!("{} of {} tasks succeeded", self.succeeded(), self.total())
    }

    /// `Ok` iff every leaf succeeded.
    pub fn into_result(self) -> Result<(), AggregateError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(AggregateError { report: self })
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "tree": self.tree,
            "summary": self.summary(),
            "outcomes": self.outcomes.iter().map(|o| json!({
                "task": o.task,
                "resource": o.resource,
                "status": o.status.as_str(),
                "error": o.error().map(|e| e.to_string()),
                "elapsed_ms": o.elapsed.as_millis() as u64,
            })).collect::<Vec<_>>(),
        })
    }
}

/// Every failed, cancelled and skipped leaf of a run.
#[derive(Debug, Clone)]
pub struct AggregateError {
    pub report: TreeReport,
}

impl AggregateError {
    pub fn errors(&self) -> impl Iterator<Item = (&LeafOutcome, &StackError)> {
        self.report
            .outcomes
            .iter()
            .filter_map(|o| o.error().map(|e| (o, e)))
    }
}

impl std::error::Error for AggregateError {}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.report.tree, self.report.summary())?;

        let failed: Vec<String> = self
            .errors()
            .map(|(o, e)| format!("{} ({e})", o.label()))
            .collect();
        if !failed.is_empty() {
            write!(f, "; failed: {}", failed.join(", "))?;
        }

        for title in ["cancelled", "skipped"] {
            let names: Vec<&str> = self
                .report
                .outcomes
                .iter()
                .filter(|o| o.status.as_str() == title)
                .map(|o| o.label())
                .collect();
            if !names.is_empty() {
                write!(f, "; {title}: {}", names.join(", "))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(task: &str, status: LeafStatus) -> LeafOutcome {
        LeafOutcome {
            task: task.to_string(),
            resource: None,
            status,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_aggregate_error_lists_failures() {
        let report = TreeReport {
            tree: "delete cluster".into(),
            outcomes: vec![
                outcome("a", LeafStatus::Succeeded),
                outcome("b", LeafStatus::Failed(StackError::NotFound("b".into()))),
                outcome("c", LeafStatus::Skipped),
            ],
        };

        let err = report.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "delete cluster: 1 of 3 tasks succeeded; failed: b (b not found); skipped: c"
        );
        assert_eq!(err.errors().count(), 1);
    }

    #[test]
    fn test_empty_report_is_success() {
        let report = TreeReport {
            tree: "noop".into(),
            outcomes: Vec::new(),
        };
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_json_report() {
        let mut o = outcome("a", LeafStatus::Succeeded);
        o.resource = Some("stack-a".into());
        let report = TreeReport {
            tree: "t".into(),
            outcomes: vec![o],
        };
        let value = report.to_json();
        assert_eq!(value["summary"], "1 of 1 tasks succeeded");
        assert_eq!(value["outcomes"][0]["resource"], "stack-a");
    }
}
