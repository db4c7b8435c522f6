//! stackrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network or cloud SDKs
//! - Runtime specifics
//!
//! Stacks, their statuses and roles, change sets, events and the error
//! taxonomy shared by the engine and its collaborators live here.

pub mod error;
pub mod ids;
pub mod role;
pub mod stack;
pub mod status;

// Re-export commonly used types
pub use error::{ApiError, ErrorKind, StackError};
pub use ids::{StackId, StackName};
pub use role::{tags, StackRole};
pub use stack::{
    AuditEvent, Capabilities, ChangeSet, NodeGroupStack, ResourceChange, Stack, StackDescription,
    StackEvent, StackInfo, StackResource, AUTOSCALING_GROUP_RESOURCE_TYPE,
};
pub use status::{ChangeSetStatus, LifecyclePhase, NodeGroupType, StackStatus, ALL_STACK_STATUSES};
