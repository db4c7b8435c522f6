//! Narrow interfaces to the external collaborators the engine drives.
//!
//! Implementations live outside the engine (cloud SDK adapters); the
//! in-memory [`crate::sim::SimulatedCloud`] implements all of them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stackrun_core::{
    ApiError, AuditEvent, ChangeSet, Stack, StackDescription, StackEvent, StackId, StackName,
    StackResource, StackStatus,
};

/// Stack output holding the role ARN of an IAM service-account stack.
pub const ROLE_ARN_OUTPUT: &str = "RoleArn";

/// Request to create a stack.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateStackRequest {
    pub description: StackDescription,
    pub tags: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
}

/// Request to create a change set against an existing stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSetRequest {
    pub stack_name: StackName,
    pub change_set_name: String,
    pub description: String,
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
}

/// Provisioning API: stacks and change sets.
///
/// Every call must be safe to retry after a transient error.
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    /// Issue a create request; returns the new stack id.
    async fn create_stack(&self, request: CreateStackRequest) -> Result<StackId, ApiError>;

    /// Describe one stack. Absent (or fully deleted) stacks are `ApiError::NotFound`.
    async fn describe_stack(&self, name: &StackName) -> Result<Stack, ApiError>;

    /// List live stacks. An empty filter means every status except `DELETE_COMPLETE`.
    async fn list_stacks(&self, statuses: &[StackStatus]) -> Result<Vec<Stack>, ApiError>;

    /// Issue a delete request. Deleting an absent stack succeeds.
    async fn delete_stack(&self, name: &StackName) -> Result<(), ApiError>;

    async fn create_change_set(&self, request: ChangeSetRequest) -> Result<(), ApiError>;

    async fn describe_change_set(
        &self,
        stack: &StackName,
        change_set: &str,
    ) -> Result<ChangeSet, ApiError>;

    async fn execute_change_set(&self, stack: &StackName, change_set: &str)
        -> Result<(), ApiError>;

    async fn delete_change_set(&self, stack: &StackName, change_set: &str)
        -> Result<(), ApiError>;

    /// Stack events, most recent first.
    async fn describe_stack_events(&self, name: &StackName) -> Result<Vec<StackEvent>, ApiError>;

    async fn get_template(&self, name: &StackName) -> Result<String, ApiError>;

    async fn list_stack_resources(&self, name: &StackName)
        -> Result<Vec<StackResource>, ApiError>;
}

/// An autoscaling group as reported by the autoscaling API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingGroup {
    pub name: String,
    pub desired_capacity: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub tags: BTreeMap<String, String>,
}

/// Autoscaling API: lookup by name and tag update by name.
#[async_trait]
pub trait AutoscalingApi: Send + Sync {
    async fn describe_auto_scaling_group(&self, name: &str) -> Result<AutoScalingGroup, ApiError>;

    async fn create_or_update_tags(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ApiError>;
}

/// Audit trail lookups, used for diagnostics only.
#[async_trait]
pub trait AuditApi: Send + Sync {
    /// Events for the stack, oldest first.
    async fn lookup_events(&self, stack_id: &StackId) -> Result<Vec<AuditEvent>, ApiError>;
}

/// The cluster's OIDC identity provider.
#[async_trait]
pub trait OidcProvider: Send + Sync {
    /// Issuer URL, for logs.
    fn issuer(&self) -> String;

    async fn exists(&self) -> Result<bool, ApiError>;

    /// Delete the provider. Deleting an absent provider succeeds.
    async fn delete(&self) -> Result<(), ApiError>;
}

/// Status of a nodegroup managed directly by the cluster service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodegroupStatus {
    Creating,
    Active,
    Updating,
    Deleting,
    CreateFailed,
    DeleteFailed,
    Degraded,
}

/// A nodegroup as reported by the cluster service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nodegroup {
    pub name: String,
    pub status: NodegroupStatus,
    pub autoscaling_groups: Vec<String>,
}

/// Cluster-service nodegroup calls, used for nodegroups without an owning stack
/// and to resolve managed nodegroup ASGs.
#[async_trait]
pub trait NodegroupApi: Send + Sync {
    async fn list_nodegroups(&self, cluster: &str) -> Result<Vec<String>, ApiError>;

    /// Absent nodegroups are `ApiError::NotFound`.
    async fn describe_nodegroup(&self, cluster: &str, name: &str) -> Result<Nodegroup, ApiError>;

    async fn delete_nodegroup(&self, cluster: &str, name: &str) -> Result<(), ApiError>;
}

/// Binding of a Kubernetes service account to an IAM role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountBinding {
    pub namespace: String,
    pub name: String,
    pub role_arn: Option<String>,
}

/// Kubernetes-side client, opaque to the engine beyond these two calls.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn bind_service_account(&self, binding: &ServiceAccountBinding) -> Result<(), ApiError>;

    /// Removing an absent service account succeeds.
    async fn unbind_service_account(&self, namespace: &str, name: &str) -> Result<(), ApiError>;
}
