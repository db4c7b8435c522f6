//! Status enums for stacks, change sets, and nodegroups.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Provider-native status of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
}

/// Every status, in declaration order.
pub const ALL_STACK_STATUSES: [StackStatus; 17] = [
    StackStatus::CreateInProgress,
    StackStatus::CreateFailed,
    StackStatus::CreateComplete,
    StackStatus::RollbackInProgress,
    StackStatus::RollbackFailed,
    StackStatus::RollbackComplete,
    StackStatus::DeleteInProgress,
    StackStatus::DeleteFailed,
    StackStatus::DeleteComplete,
    StackStatus::UpdateInProgress,
    StackStatus::UpdateCompleteCleanupInProgress,
    StackStatus::UpdateComplete,
    StackStatus::UpdateFailed,
    StackStatus::UpdateRollbackInProgress,
    StackStatus::UpdateRollbackFailed,
    StackStatus::UpdateRollbackCompleteCleanupInProgress,
    StackStatus::UpdateRollbackComplete,
];

impl StackStatus {
    /// Returns true while a remote operation is still running.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::CreateInProgress
                | Self::RollbackInProgress
                | Self::DeleteInProgress
                | Self::UpdateInProgress
                | Self::UpdateCompleteCleanupInProgress
                | Self::UpdateRollbackInProgress
                | Self::UpdateRollbackCompleteCleanupInProgress
        )
    }

    /// Returns true if no further automatic change will occur.
    pub fn is_terminal(&self) -> bool {
        !self.is_transitional()
    }

    /// Returns true if the last requested operation completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::CreateComplete | Self::UpdateComplete | Self::DeleteComplete
        )
    }

    /// Returns true if the stack exists and is usable, even after a rolled back update.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            Self::CreateComplete | Self::UpdateComplete | Self::UpdateRollbackComplete
        )
    }

    /// Returns true for terminal failure statuses.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.phase(),
            LifecyclePhase::CreateFailed
                | LifecyclePhase::UpdateFailed
                | LifecyclePhase::DeleteFailed
        )
    }

    /// Project the provider status onto the lifecycle state machine.
    pub fn phase(&self) -> LifecyclePhase {
        match self {
            Self::CreateInProgress | Self::RollbackInProgress => LifecyclePhase::Creating,
            Self::CreateComplete | Self::UpdateComplete => LifecyclePhase::Created,
            Self::CreateFailed | Self::RollbackFailed | Self::RollbackComplete => {
                LifecyclePhase::CreateFailed
            }
            Self::UpdateInProgress
            | Self::UpdateCompleteCleanupInProgress
            | Self::UpdateRollbackInProgress
            | Self::UpdateRollbackCompleteCleanupInProgress => LifecyclePhase::Updating,
            Self::UpdateFailed | Self::UpdateRollbackFailed | Self::UpdateRollbackComplete => {
                LifecyclePhase::UpdateFailed
            }
            Self::DeleteInProgress => LifecyclePhase::Deleting,
            Self::DeleteComplete => LifecyclePhase::Absent,
            Self::DeleteFailed => LifecyclePhase::DeleteFailed,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateFailed => "CREATE_FAILED",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            Self::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            Self::UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            Self::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STACK_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("Invalid stack status: {s}"))
    }
}

/// Lifecycle state of a single stack as seen by the lifecycle driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Absent,
    Creating,
    Created,
    CreateFailed,
    Updating,
    UpdateFailed,
    Deleting,
    DeleteFailed,
}

impl LifecyclePhase {
    /// Returns true if the phase is one of the in-flight states.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }
}

/// Status of a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSetStatus {
    CreatePending,
    CreateInProgress,
    CreateComplete,
    DeletePending,
    DeleteInProgress,
    DeleteComplete,
    Failed,
}

impl ChangeSetStatus {
    /// Returns true once the change set has been fully computed or has failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CreateComplete | Self::DeleteComplete | Self::Failed
        )
    }
}

/// Kind of nodegroup backing a nodegroup stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeGroupType {
    /// Nodegroup whose instances are managed by the cluster service.
    Managed,
    /// Self-managed nodegroup backed by an autoscaling group in the stack.
    #[default]
    Unmanaged,
}

impl fmt::Display for NodeGroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Managed => write!(f, "managed"),
            Self::Unmanaged => write!(f, "unmanaged"),
        }
    }
}

impl FromStr for NodeGroupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "managed" => Ok(Self::Managed),
            "unmanaged" => Ok(Self::Unmanaged),
            _ => Err(format!("Invalid nodegroup type: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitional_statuses_are_never_terminal() {
        for status in ALL_STACK_STATUSES {
            assert_ne!(status.is_transitional(), status.is_terminal(), "{status}");
            if status.is_transitional() {
                assert!(status.phase().is_transitional(), "{status}");
                assert!(status.to_string().ends_with("IN_PROGRESS"));
            }
        }
    }

    #[test]
    fn test_rollback_variants() {
        assert_eq!(
            StackStatus::RollbackComplete.phase(),
            LifecyclePhase::CreateFailed
        );
        assert!(StackStatus::RollbackComplete.is_failure());
        assert!(StackStatus::UpdateRollbackComplete.is_stable());
        assert!(!StackStatus::UpdateRollbackComplete.is_success());
        assert!(StackStatus::UpdateRollbackCompleteCleanupInProgress.is_transitional());
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        assert_eq!(
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS".parse::<StackStatus>(),
            Ok(StackStatus::UpdateCompleteCleanupInProgress)
        );
        assert!("SOMETHING_ELSE".parse::<StackStatus>().is_err());
    }

    #[test]
    fn test_nodegroup_type_parse() {
        assert_eq!("managed".parse::<NodeGroupType>(), Ok(NodeGroupType::Managed));
        assert_eq!(NodeGroupType::Unmanaged.to_string(), "unmanaged");
    }
}
