//! Read-only view over the stacks belonging to one cluster.
//!
//! Absence is reported as `Ok(None)`, never as an error, so callers can build
//! idempotent "ensure" logic on top.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use stackrun_core::{
    AuditEvent, NodeGroupStack, NodeGroupType, Stack, StackError, StackEvent, StackInfo,
    StackName, StackRole, StackStatus, AUTOSCALING_GROUP_RESOURCE_TYPE,
};

use crate::api::{AuditApi, ProvisioningApi, ServiceAccountBinding, ROLE_ARN_OUTPUT};
use crate::naming::Naming;

/// Stack lookups for one cluster.
#[derive(Clone)]
pub struct StackRegistry {
    api: Arc<dyn ProvisioningApi>,
    audit: Option<Arc<dyn AuditApi>>,
    naming: Naming,
}

impl StackRegistry {
    pub fn new(api: Arc<dyn ProvisioningApi>, naming: Naming) -> Self {
        Self {
            api,
            audit: None,
            naming,
        }
    }

    /// Builder method to enable audit lookups.
    pub fn with_audit(mut self, audit: Arc<dyn AuditApi>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    fn api_error(name: &str, err: stackrun_core::ApiError) -> StackError {
        StackError::from_api(name, err)
    }

    /// Describe a stack; `None` when it does not exist.
    pub async fn describe_stack(&self, name: &StackName) -> Result<Option<Stack>, StackError> {
        match self.api.describe_stack(name).await {
            Ok(stack) => Ok(Some(stack)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(Self::api_error(name.as_str(), e)),
        }
    }

    /// Every live stack of this cluster.
    pub async fn list_stacks(&self) -> Result<Vec<Stack>, StackError> {
        self.list_stacks_matching(&self.naming.cluster_stacks_pattern(), &[])
            .await
    }

    /// Stacks of this cluster in one of `statuses`.
    pub async fn list_stacks_with_statuses(
        &self,
        statuses: &[StackStatus],
    ) -> Result<Vec<Stack>, StackError> {
        self.list_stacks_matching(&self.naming.cluster_stacks_pattern(), statuses)
            .await
    }

    /// Stacks whose name matches `name_regex`, optionally filtered by status.
    pub async fn list_stacks_matching(
        &self,
        name_regex: &str,
        statuses: &[StackStatus],
    ) -> Result<Vec<Stack>, StackError> {
        let re = Regex::new(name_regex)
            .map_err(|e| StackError::InvalidTree(format!("bad stack name pattern: {e}")))?;
        let stacks = self
            .api
            .list_stacks(statuses)
            .await
            .map_err(|e| Self::api_error(name_regex, e))?;

        let matched: Vec<Stack> = stacks
            .into_iter()
            .filter(|s| re.is_match(s.name.as_str()))
            .collect();
        debug!(pattern = %name_regex, count = matched.len(), "Listed stacks");
        Ok(matched)
    }

    /// Stacks of this cluster with the given role kind.
    pub async fn list_stacks_by_role(
        &self,
        matches_role: impl Fn(&StackRole) -> bool,
        statuses: &[StackStatus],
    ) -> Result<Vec<Stack>, StackError> {
        Ok(self
            .list_stacks_with_statuses(statuses)
            .await?
            .into_iter()
            .filter(|s| matches_role(&StackRole::classify(s)))
            .collect())
    }

    pub async fn describe_cluster_stack(&self) -> Result<Stack, StackError> {
        let name = self.naming.cluster_stack();
        self.describe_stack(&name)
            .await?
            .ok_or_else(|| StackError::NotFound(name.to_string()))
    }

    pub async fn describe_cluster_stack_if_exists(&self) -> Result<Option<Stack>, StackError> {
        self.describe_stack(&self.naming.cluster_stack()).await
    }

    pub async fn describe_nodegroup_stack(
        &self,
        nodegroup: &str,
    ) -> Result<Option<Stack>, StackError> {
        self.describe_stack(&self.naming.nodegroup_stack(nodegroup))
            .await
    }

    pub async fn list_nodegroup_stacks(&self) -> Result<Vec<Stack>, StackError> {
        self.list_stacks_by_role(|r| matches!(r, StackRole::NodeGroup { .. }), &[])
            .await
    }

    /// Nodegroup stacks with their nodegroup name and type.
    pub async fn list_nodegroup_stacks_with_statuses(
        &self,
    ) -> Result<Vec<NodeGroupStack>, StackError> {
        Ok(self
            .list_nodegroup_stacks()
            .await?
            .into_iter()
            .filter_map(|stack| match StackRole::classify(&stack) {
                StackRole::NodeGroup {
                    name,
                    node_group_type,
                } => Some(NodeGroupStack {
                    stack,
                    node_group_name: name,
                    node_group_type,
                }),
                _ => None,
            })
            .collect())
    }

    /// Map of nodegroup name to a snapshot of its stack, resources and template.
    pub async fn describe_nodegroup_stacks_and_resources(
        &self,
    ) -> Result<BTreeMap<String, StackInfo>, StackError> {
        let mut infos = BTreeMap::new();
        for ng in self.list_nodegroup_stacks_with_statuses().await? {
            let name = ng.stack.name.clone();
            let resources = self
                .api
                .list_stack_resources(&name)
                .await
                .map_err(|e| Self::api_error(name.as_str(), e))?;
            let template = self.get_stack_template(&name).await?;
            infos.insert(
                ng.node_group_name,
                StackInfo {
                    stack: ng.stack,
                    resources,
                    template,
                },
            );
        }
        Ok(infos)
    }

    pub async fn describe_iam_service_account_stacks(&self) -> Result<Vec<Stack>, StackError> {
        self.list_stacks_by_role(
            |r| matches!(r, StackRole::IamServiceAccount { .. }),
            &[],
        )
        .await
    }

    /// `namespace/name` of every IAM service-account stack.
    pub async fn list_iam_service_account_stacks(&self) -> Result<Vec<String>, StackError> {
        Ok(self
            .describe_iam_service_account_stacks()
            .await?
            .iter()
            .filter_map(|s| StackRole::classify(s).service_account())
            .collect())
    }

    /// Every IAM service account with the role ARN its stack exports.
    pub async fn get_iam_service_accounts(
        &self,
    ) -> Result<Vec<ServiceAccountBinding>, StackError> {
        Ok(self
            .describe_iam_service_account_stacks()
            .await?
            .into_iter()
            .filter_map(|stack| match StackRole::classify(&stack) {
                StackRole::IamServiceAccount { namespace, name } => Some(ServiceAccountBinding {
                    namespace,
                    name,
                    role_arn: stack.outputs.get(ROLE_ARN_OUTPUT).cloned(),
                }),
                _ => None,
            })
            .collect())
    }

    pub async fn get_iam_addons_stacks(&self) -> Result<Vec<Stack>, StackError> {
        self.list_stacks_by_role(|r| matches!(r, StackRole::AddonIam { .. }), &[])
            .await
    }

    pub async fn get_fargate_stack(&self) -> Result<Option<Stack>, StackError> {
        self.describe_stack(&self.naming.fargate_stack()).await
    }

    pub async fn get_karpenter_stack(&self) -> Result<Option<Stack>, StackError> {
        self.describe_stack(&self.naming.karpenter_stack()).await
    }

    /// Cluster stack names of every cluster sharing the prefix.
    pub async fn list_cluster_stack_names(&self) -> Result<Vec<String>, StackError> {
        Ok(self
            .list_stacks_matching(&self.naming.any_cluster_stack_pattern(), &[])
            .await?
            .into_iter()
            .map(|s| s.name.into_inner())
            .collect())
    }

    /// True if this cluster's stack is in `names`, or, when `names` is empty,
    /// if it exists remotely.
    pub async fn has_cluster_stack_from_list(&self, names: &[String]) -> Result<bool, StackError> {
        let own = self.naming.cluster_stack();
        if names.is_empty() {
            return Ok(self.describe_cluster_stack_if_exists().await?.is_some());
        }
        Ok(names.iter().any(|n| n == own.as_str()))
    }

    pub async fn get_stack_template(&self, name: &StackName) -> Result<String, StackError> {
        self.api
            .get_template(name)
            .await
            .map_err(|e| Self::api_error(name.as_str(), e))
    }

    /// Stack events, most recent first.
    pub async fn describe_stack_events(&self, name: &StackName) -> Result<Vec<StackEvent>, StackError> {
        self.api
            .describe_stack_events(name)
            .await
            .map_err(|e| Self::api_error(name.as_str(), e))
    }

    /// Audit events for diagnostics. Never fails: errors are logged.
    pub async fn lookup_audit_events(&self, stack: &Stack) -> Vec<AuditEvent> {
        let (Some(audit), Some(id)) = (&self.audit, &stack.id) else {
            return Vec::new();
        };
        match audit.lookup_events(id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(stack = %stack.name, error = %e, "Failed to look up audit events");
                Vec::new()
            }
        }
    }

    /// Name of the autoscaling group inside an unmanaged nodegroup stack.
    pub async fn get_unmanaged_nodegroup_autoscaling_group_name(
        &self,
        stack: &Stack,
    ) -> Result<Option<String>, StackError> {
        let resources = self
            .api
            .list_stack_resources(&stack.name)
            .await
            .map_err(|e| Self::api_error(stack.name.as_str(), e))?;
        Ok(resources
            .into_iter()
            .find(|r| r.resource_type == AUTOSCALING_GROUP_RESOURCE_TYPE)
            .and_then(|r| r.physical_id))
    }
}

/// Nodegroup name of a stack, if it is a nodegroup stack.
pub fn nodegroup_name(stack: &Stack) -> Option<String> {
    StackRole::classify(stack).node_group_name().map(str::to_string)
}

/// Addon name of a stack, if it is an addon IAM stack.
pub fn iam_addon_name(stack: &Stack) -> Option<String> {
    StackRole::classify(stack).addon_name().map(str::to_string)
}

/// Nodegroup type of a stack, if it is a nodegroup stack.
pub fn nodegroup_type(stack: &Stack) -> Option<NodeGroupType> {
    match StackRole::classify(stack) {
        StackRole::NodeGroup {
            node_group_type, ..
        } => Some(node_group_type),
        _ => None,
    }
}

/// True if `stack` will not change without a new request.
pub fn stack_status_is_not_transitional(stack: &Stack) -> bool {
    stack.status.is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{nodegroup_stack_tags, SimulatedCloud};
    use stackrun_core::tags;

    fn registry() -> (Arc<SimulatedCloud>, StackRegistry) {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        let mut ng = Stack::new("stackrun-dev-nodegroup-ng-1", StackStatus::CreateComplete);
        for (k, v) in nodegroup_stack_tags("dev", "ng-1", NodeGroupType::Unmanaged) {
            ng.tags.insert(k, v);
        }
        cloud.seed_stack(Stack::new("stackrun-dev-cluster", StackStatus::CreateComplete), "{}");
        cloud.seed_stack(ng, "{\"ng\": 1}");
        cloud.seed_stack(
            Stack::new(
                "stackrun-dev-addon-iamserviceaccount-kube-system-aws-node",
                StackStatus::CreateComplete,
            )
            .with_tag(tags::IAM_SERVICE_ACCOUNT_NAME, "kube-system/aws-node"),
            "{}",
        );
        cloud.seed_stack(Stack::new("stackrun-prod-cluster", StackStatus::CreateComplete), "{}");
        cloud.seed_stack(Stack::new("stackrun-dev-fargate", StackStatus::CreateFailed), "{}");

        let registry = StackRegistry::new(cloud.clone(), Naming::new("stackrun", "dev"));
        (cloud, registry)
    }

    #[tokio::test]
    async fn test_iam_service_accounts_carry_role_arn() {
        let (cloud, registry) = registry();
        cloud.seed_stack(
            Stack::new(
                "stackrun-dev-addon-iamserviceaccount-default-app",
                StackStatus::DeleteComplete,
            )
            .with_tag(tags::IAM_SERVICE_ACCOUNT_NAME, "default/app"),
            "{}",
        );

        let accounts = registry.get_iam_service_accounts().await.unwrap();
        assert_eq!(
            accounts,
            vec![ServiceAccountBinding {
                namespace: "kube-system".into(),
                name: "aws-node".into(),
                role_arn: Some(
                    "arn:aws:iam::000000000000:role/stackrun-dev-addon-iamserviceaccount-kube-system-aws-node"
                        .into()
                ),
            }]
        );
    }

    #[tokio::test]
    async fn test_absent_stack_is_none() {
        let (_cloud, registry) = registry();
        assert!(registry.get_karpenter_stack().await.unwrap().is_none());
        assert!(registry.describe_nodegroup_stack("nope").await.unwrap().is_none());
        assert!(matches!(
            registry.describe_cluster_stack().await,
            Ok(ref s) if s.name.as_str() == "stackrun-dev-cluster"
        ));
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_cluster() {
        let (_cloud, registry) = registry();
        let names: Vec<String> = registry
            .list_stacks()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name.into_inner())
            .collect();
        assert_eq!(names.len(), 4);
        assert!(!names.contains(&"stackrun-prod-cluster".to_string()));

        let mut clusters = registry.list_cluster_stack_names().await.unwrap();
        clusters.sort();
        assert_eq!(clusters, vec!["stackrun-dev-cluster", "stackrun-prod-cluster"]);
    }

    #[tokio::test]
    async fn test_status_filter() {
        let (_cloud, registry) = registry();
        let failed = registry
            .list_stacks_with_statuses(&[StackStatus::CreateFailed])
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name.as_str(), "stackrun-dev-fargate");
    }

    #[tokio::test]
    async fn test_role_lookups() {
        let (_cloud, registry) = registry();
        let ngs = registry.list_nodegroup_stacks_with_statuses().await.unwrap();
        assert_eq!(ngs.len(), 1);
        assert_eq!(ngs[0].node_group_name, "ng-1");
        assert_eq!(nodegroup_type(&ngs[0].stack), Some(NodeGroupType::Unmanaged));

        assert_eq!(
            registry.list_iam_service_account_stacks().await.unwrap(),
            vec!["kube-system/aws-node".to_string()]
        );

        let infos = registry.describe_nodegroup_stacks_and_resources().await.unwrap();
        assert_eq!(infos["ng-1"].template, "{\"ng\": 1}");

        let asg = registry
            .get_unmanaged_nodegroup_autoscaling_group_name(&ngs[0].stack)
            .await
            .unwrap();
        assert_eq!(asg.as_deref(), Some("ng-1-asg"));
    }

    #[tokio::test]
    async fn test_has_cluster_stack_from_list() {
        let (_cloud, registry) = registry();
        assert!(registry
            .has_cluster_stack_from_list(&["stackrun-dev-cluster".to_string()])
            .await
            .unwrap());
        assert!(!registry
            .has_cluster_stack_from_list(&["stackrun-prod-cluster".to_string()])
            .await
            .unwrap());
        assert!(registry.has_cluster_stack_from_list(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn test_audit_lookup_without_api_is_empty() {
        let (_cloud, registry) = registry();
        let stack = registry.describe_cluster_stack().await.unwrap();
        assert!(registry.lookup_audit_events(&stack).await.is_empty());
    }
}
