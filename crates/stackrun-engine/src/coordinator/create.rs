use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use stackrun_core::{tags, Capabilities, NodeGroupType, StackDescription, StackError};

use super::{BindServiceAccountTask, CreateStackTask, PropagateTagsTask};
use crate::api::{ClusterClient, OidcProvider};
use crate::manager::StackManager;
use crate::tasks::TaskTree;

/// A nodegroup to create. The template is rendered by the caller.
#[derive(Debug, Clone, Default)]
pub struct NodegroupSpec {
    pub name: String,
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
    /// Tags for the nodegroup's autoscaling groups (managed nodegroups).
    pub asg_tags: BTreeMap<String, String>,
    pub propagate_asg_tags: bool,
}

impl NodegroupSpec {
    pub fn new(name: impl Into<String>, template_body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template_body: template_body.into(),
            ..Default::default()
        }
    }

    /// Builder method to push `tags` to the autoscaling groups once the
    /// nodegroup is created.
    pub fn with_asg_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.asg_tags = tags;
        self.propagate_asg_tags = true;
        self
    }
}

/// An IAM service account to create.
#[derive(Debug, Clone, Default)]
pub struct ServiceAccountSpec {
    pub namespace: String,
    pub name: String,
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
}

impl ServiceAccountSpec {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        template_body: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            template_body: template_body.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Everything needed to create a cluster with its nodegroups.
#[derive(Default)]
pub struct ClusterCreation {
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
    pub nodegroups: Vec<NodegroupSpec>,
    pub managed_nodegroups: Vec<NodegroupSpec>,
    /// Runs after the cluster and every nodegroup were created.
    pub post_cluster_tasks: Option<TaskTree>,
}

impl ClusterCreation {
    pub fn new(template_body: impl Into<String>) -> Self {
        Self {
            template_body: template_body.into(),
            ..Default::default()
        }
    }
}

fn require_name(kind: &str, name: &str) -> Result<(), StackError> {
    if name.trim().is_empty() {
        return Err(StackError::InvalidTree(format!("{kind} name must not be empty")));
    }
    Ok(())
}

impl StackManager {
    fn cluster_tags(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            tags::CLUSTER_NAME.to_string(),
            self.cluster_name().to_string(),
        )])
    }

    fn nodegroup_tags(&self, nodegroup: &str, kind: NodeGroupType) -> BTreeMap<String, String> {
        let mut tags = self.cluster_tags();
        tags.insert(tags::NODEGROUP_NAME.to_string(), nodegroup.to_string());
        tags.insert(tags::NODEGROUP_TYPE.to_string(), kind.to_string());
        tags
    }

    /// Cluster stack first, then every nodegroup in parallel, then the
    /// post-creation tasks.
    pub fn new_tasks_to_create_cluster(
        &self,
        request: ClusterCreation,
    ) -> Result<TaskTree, StackError> {
        let cluster = self.cluster_name().to_string();
        let mut root = TaskTree::sequential(format!("create cluster {cluster}"));

        root.push_task(CreateStackTask::new(
            self.lifecycle.clone(),
            format!("create cluster control plane {cluster:?}"),
            StackDescription::new(self.naming().cluster_stack(), request.template_body)
                .with_capabilities(Capabilities::Iam),
            self.cluster_tags(),
            request.parameters,
        ));

        let mut nodegroups = TaskTree::parallel(format!("create nodegroups for {cluster}"))
            .with_concurrency(self.config.max_parallel);
        nodegroups.push_tree(self.new_unmanaged_nodegroup_tasks(&request.nodegroups)?);
        nodegroups.push_tree(self.new_managed_nodegroup_tasks(&request.managed_nodegroups)?);
        root.push_tree(nodegroups);

        if let Some(post) = request.post_cluster_tasks {
            root.push_tree(post);
        }

        root.validate()?;
        debug!(tree = %root, "Built cluster creation tree");
        Ok(root)
    }

    /// Parallel creation of self-managed nodegroup stacks.
    pub fn new_unmanaged_nodegroup_tasks(
        &self,
        nodegroups: &[NodegroupSpec],
    ) -> Result<TaskTree, StackError> {
        let mut tree = TaskTree::parallel("create unmanaged nodegroups")
            .with_concurrency(self.config.max_parallel);
        for ng in nodegroups {
            require_name("nodegroup", &ng.name)?;
            tree.push_task(CreateStackTask::new(
                self.lifecycle.clone(),
                format!("create nodegroup {:?}", ng.name),
                StackDescription::new(self.naming().nodegroup_stack(&ng.name), &ng.template_body)
                    .with_capabilities(Capabilities::Iam),
                self.nodegroup_tags(&ng.name, NodeGroupType::Unmanaged),
                ng.parameters.clone(),
            ));
        }
        tree.validate()?;
        Ok(tree)
    }

    /// Parallel creation of managed nodegroups, each followed by ASG tag
    /// propagation when requested.
    pub fn new_managed_nodegroup_tasks(
        &self,
        nodegroups: &[NodegroupSpec],
    ) -> Result<TaskTree, StackError> {
        let mut tree = TaskTree::parallel("create managed nodegroups")
            .with_concurrency(self.config.max_parallel);
        for ng in nodegroups {
            require_name("managed nodegroup", &ng.name)?;
            let mut steps = TaskTree::sequential(format!("managed nodegroup {}", ng.name));
            steps.push_task(CreateStackTask::new(
                self.lifecycle.clone(),
                format!("create managed nodegroup {:?}", ng.name),
                StackDescription::new(self.naming().nodegroup_stack(&ng.name), &ng.template_body)
                    .with_capabilities(Capabilities::Iam),
                self.nodegroup_tags(&ng.name, NodeGroupType::Managed),
                ng.parameters.clone(),
            ));
            if ng.propagate_asg_tags && !ng.asg_tags.is_empty() {
                steps.push_task(PropagateTagsTask::new(
                    self.nodegroups.clone(),
                    self.autoscaling.clone(),
                    self.cluster_name(),
                    &ng.name,
                    ng.asg_tags.clone(),
                ));
            }
            tree.push_tree(steps);
        }
        tree.validate()?;
        Ok(tree)
    }

    /// One sequential pair per account: create the role stack, then bind
    /// the Kubernetes service account to it.
    pub fn new_tasks_to_create_iam_service_accounts(
        &self,
        accounts: &[ServiceAccountSpec],
        oidc: Arc<dyn OidcProvider>,
        client: Arc<dyn ClusterClient>,
    ) -> Result<TaskTree, StackError> {
        let mut tree = TaskTree::parallel(format!(
            "create {} IAM service account(s)",
            accounts.len()
        ))
        .with_concurrency(self.config.max_parallel);

        for sa in accounts {
            require_name("service account namespace", &sa.namespace)?;
            require_name("service account", &sa.name)?;
            let qualified = sa.qualified_name();
            let stack = self.naming().iam_service_account_stack(&sa.namespace, &sa.name);

            let mut tags = self.cluster_tags();
            tags.insert(tags::IAM_SERVICE_ACCOUNT_NAME.to_string(), qualified.clone());

            let mut pair = TaskTree::sequential(qualified.clone());
            pair.push_task(CreateStackTask::new(
                self.lifecycle.clone(),
                format!("create IAM role for serviceaccount {qualified:?}"),
                StackDescription::new(stack.clone(), &sa.template_body)
                    .with_capabilities(Capabilities::NamedIam),
                tags,
                sa.parameters.clone(),
            ));
            pair.push_task(BindServiceAccountTask::new(
                self.registry.clone(),
                client.clone(),
                oidc.clone(),
                stack,
                &sa.namespace,
                &sa.name,
            ));
            tree.push_tree(pair);
        }

        tree.validate()?;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::manager::Clients;
    use crate::sim::{Behavior, SimOp, SimulatedCloud};
    use crate::tasks::{FnTask, TaskContext};
    use stackrun_core::StackStatus;

    fn manager(cloud: &Arc<SimulatedCloud>) -> StackManager {
        let config = EngineConfig {
            poll_initial_interval_ms: 1_000,
            poll_max_interval_ms: 5_000,
            ..Default::default()
        };
        StackManager::new("dev", config, Clients::from_cloud(cloud.clone())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_is_created_before_nodegroups() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        let manager = manager(&cloud);

        let mut post = TaskTree::sequential("post");
        post.push_task(FnTask::new("label nodes", |_| async { Ok(()) }));

        let request = ClusterCreation {
            nodegroups: vec![NodegroupSpec::new("ng-1", "{}"), NodegroupSpec::new("ng-2", "{}")],
            managed_nodegroups: vec![NodegroupSpec::new("ng-m", "{}").with_asg_tags(
                BTreeMap::from([("team".to_string(), "platform".to_string())]),
            )],
            post_cluster_tasks: Some(post),
            ..ClusterCreation::new("{}")
        };
        let tree = Arc::new(manager.new_tasks_to_create_cluster(request).unwrap());
        assert_eq!(tree.leaf_count(), 6);

        let report = tree.run(TaskContext::default()).await;
        assert!(report.is_success(), "{:?}", report.into_result());

        let cluster_done = cloud
            .position(SimOp::StackSettled, "stackrun-dev-cluster")
            .unwrap();
        for ng in ["ng-1", "ng-2", "ng-m"] {
            let stack = format!("stackrun-dev-nodegroup-{ng}");
            assert!(cloud.position(SimOp::CreateStack, &stack).unwrap() > cluster_done);
            assert_eq!(cloud.stack_status(&stack), Some(StackStatus::CreateComplete));
        }
        assert_eq!(
            cloud.auto_scaling_group("ng-m-asg").unwrap().tags["team"],
            "platform"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cluster_skips_nodegroups() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        cloud.behave("stackrun-dev-cluster", Behavior::failing_create());
        let manager = manager(&cloud);

        let request = ClusterCreation {
            nodegroups: vec![NodegroupSpec::new("ng-1", "{}")],
            ..ClusterCreation::new("{}")
        };
        let tree = Arc::new(manager.new_tasks_to_create_cluster(request).unwrap());
        let report = tree.run(TaskContext::default()).await;

        let statuses: Vec<_> = report.outcomes.iter().map(|o| o.status.as_str()).collect();
        assert_eq!(statuses, vec!["failed", "skipped"]);
        assert_eq!(cloud.count(SimOp::CreateStack, "stackrun-dev-nodegroup-ng-1"), 0);
    }

    #[test]
    fn test_duplicate_nodegroups_are_rejected() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        let manager = manager(&cloud);
        let err = manager
            .new_unmanaged_nodegroup_tasks(&[
                NodegroupSpec::new("ng", "{}"),
                NodegroupSpec::new("ng", "{}"),
            ])
            .unwrap_err();
        assert!(matches!(err, StackError::InvalidTree(_)));

        let err = manager
            .new_managed_nodegroup_tasks(&[NodegroupSpec::new(" ", "{}")])
            .unwrap_err();
        assert!(matches!(err, StackError::InvalidTree(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_accounts_are_bound_to_created_roles() {
        let cloud = Arc::new(SimulatedCloud::new("dev").with_oidc_provider());
        let manager = manager(&cloud);

        let tree = manager
            .new_tasks_to_create_iam_service_accounts(
                &[
                    ServiceAccountSpec::new("kube-system", "aws-node", "{}"),
                    ServiceAccountSpec::new("default", "app", "{}"),
                ],
                cloud.clone(),
                cloud.clone(),
            )
            .unwrap();
        let report = Arc::new(tree).run(TaskContext::default()).await;
        assert!(report.is_success());

        let binding = cloud.binding("kube-system", "aws-node").unwrap();
        assert_eq!(
            binding.role_arn.as_deref(),
            Some("arn:aws:iam::000000000000:role/stackrun-dev-addon-iamserviceaccount-kube-system-aws-node")
        );
        let sa = manager.registry().list_iam_service_account_stacks().await.unwrap();
        assert_eq!(sa, vec!["default/app".to_string(), "kube-system/aws-node".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_binding_requires_oidc_provider() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        let manager = manager(&cloud);

        let tree = manager
            .new_tasks_to_create_iam_service_accounts(
                &[ServiceAccountSpec::new("default", "app", "{}")],
                cloud.clone(),
                cloud.clone(),
            )
            .unwrap();
        let report = Arc::new(tree).run(TaskContext::default()).await;

        let bind = report
            .outcome("create service account \"default/app\"")
            .unwrap();
        assert!(bind.error().unwrap().is_not_found());
        assert!(cloud.binding("default", "app").is_none());
    }
}
