//! Core domain errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::{StackEvent, StackStatus};

/// Errors returned by external collaborators (provisioning, autoscaling, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The addressed resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request was throttled.
    #[error("throttled: {0}")]
    Throttled(String),

    /// Service temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A conflicting operation is already running.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request was rejected as invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Unavailable(_))
    }

    /// Returns true for "resource does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Coarse error classification, used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InProgress,
    AlreadyExists,
    Timeout,
    Cancelled,
    Transient,
    Fatal,
    DependencyTimeout,
    DependencyFailed,
    InvalidTree,
    Api,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors produced while driving stacks and task trees.
#[derive(Debug, Clone, Error)]
pub enum StackError {
    /// Stack or resource absent.
    #[error("{0} not found")]
    NotFound(String),

    /// A conflicting operation is mid-flight.
    #[error("{operation} already in progress for {name}")]
    InProgress { name: String, operation: String },

    /// A stack with the same name but a different description exists.
    #[error("stack {0} already exists with a different description")]
    AlreadyExists(String),

    /// A polling or wait deadline was exceeded.
    #[error("timed out after {waited:?} waiting for {name}")]
    Timeout { name: String, waited: Duration },

    /// The operation was cancelled before it could complete.
    #[error("{0} cancelled")]
    Cancelled(String),

    /// Retryable API failure that exhausted its retries.
    #[error("transient error for {name}: {source}")]
    Transient { name: String, source: ApiError },

    /// Terminal failure status.
    #[error("stack {name} failed with status {}{}", fmt_status(.status), fmt_reason(.reason))]
    Fatal {
        name: String,
        status: Option<StackStatus>,
        reason: Option<String>,
        events: Vec<StackEvent>,
    },

    /// A dependency wait did not receive all of its signals in time.
    #[error("timed out waiting for {group}: {received} of {expected} dependencies finished")]
    DependencyTimeout {
        group: String,
        received: usize,
        expected: usize,
    },

    /// At least one dependency finished with an error.
    #[error("dependencies of {group} failed: {}", .failed.join(", "))]
    DependencyFailed { group: String, failed: Vec<String> },

    /// A builder was given inconsistent input.
    #[error("invalid task tree: {0}")]
    InvalidTree(String),

    /// Non-retryable API failure.
    #[error("{name}: {source}")]
    Api { name: String, source: ApiError },
}

fn fmt_status(status: &Option<StackStatus>) -> String {
    status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn fmt_reason(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default()
}

impl StackError {
    /// Map a collaborator error for the named resource onto the taxonomy.
    pub fn from_api(name: impl Into<String>, err: ApiError) -> Self {
        let name = name.into();
        match err {
            ApiError::NotFound(_) => Self::NotFound(name),
            ApiError::Conflict(_) => Self::InProgress {
                name,
                operation: "operation".to_string(),
            },
            e if e.is_transient() => Self::Transient { name, source: e },
            e => Self::Api { name, source: e },
        }
    }

    /// Create a fatal error without events attached.
    pub fn fatal(name: impl Into<String>, status: StackStatus, reason: Option<String>) -> Self {
        Self::Fatal {
            name: name.into(),
            status: Some(status),
            reason,
            events: Vec::new(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InProgress { .. } => ErrorKind::InProgress,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::DependencyTimeout { .. } => ErrorKind::DependencyTimeout,
            Self::DependencyFailed { .. } => ErrorKind::DependencyFailed,
            Self::InvalidTree(_) => ErrorKind::InvalidTree,
            Self::Api { .. } => ErrorKind::Api,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::DependencyTimeout { .. })
    }

    /// Returns true if retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InProgress { .. } | Self::Transient { .. })
    }

    /// Stack events attached to a fatal error.
    pub fn events(&self) -> &[StackEvent] {
        match self {
            Self::Fatal { events, .. } => events,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_api_classification() {
        let e = StackError::from_api("s", ApiError::Throttled("rate".into()));
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_retryable());

        let e = StackError::from_api("s", ApiError::NotFound("gone".into()));
        assert!(e.is_not_found());

        let e = StackError::from_api("s", ApiError::Validation("bad".into()));
        assert_eq!(e.kind(), ErrorKind::Api);
    }

    #[test]
    fn test_fatal_display_includes_status_and_reason() {
        let e = StackError::fatal(
            "stackrun-dev-cluster",
            StackStatus::DeleteFailed,
            Some("resource in use".into()),
        );
        assert_eq!(
            e.to_string(),
            "stack stackrun-dev-cluster failed with status DELETE_FAILED (resource in use)"
        );
    }
}
