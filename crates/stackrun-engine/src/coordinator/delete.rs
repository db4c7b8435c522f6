use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stackrun_core::{NodeGroupStack, NodeGroupType, Stack, StackError, StackRole};

use super::{
    AwaitDependenciesTask, DeleteNodegroupTask, DeleteOidcProviderTask, DeleteStackTask,
    UnbindServiceAccountTask,
};
use crate::api::{ClusterClient, OidcProvider};
use crate::manager::StackManager;
use crate::tasks::{LeafOutcome, TaskContext, TaskTree, TreeReport};
use crate::wait::DeleteWaitCondition;

const SERVICE_ACCOUNT_GROUP: &str = "iamserviceaccount";

/// Hook invoked once per deletion leaf after a teardown ran, whatever the
/// leaf's outcome.
#[async_trait]
pub trait Cleanup: Send + Sync {
    async fn cleanup(&self, outcome: &LeafOutcome);
}

/// Cleanup that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCleanup;

#[async_trait]
impl Cleanup for NoCleanup {
    async fn cleanup(&self, _outcome: &LeafOutcome) {}
}

/// Options for tearing down a cluster.
#[derive(Clone)]
pub struct ClusterTeardown {
    pub oidc: Option<Arc<dyn OidcProvider>>,
    pub cluster_client: Option<Arc<dyn ClusterClient>>,
    /// The Kubernetes API is reachable; service accounts and the OIDC
    /// provider are only deleted when it is.
    pub cluster_operable: bool,
    /// Attempt every deletion regardless of failures and dependency timeouts.
    pub force: bool,
    /// Wait for the cluster stack deletion to finish.
    pub wait: bool,
    pub cleanup: Arc<dyn Cleanup>,
}

impl Default for ClusterTeardown {
    fn default() -> Self {
        Self {
            oidc: None,
            cluster_client: None,
            cluster_operable: true,
            force: false,
            wait: true,
            cleanup: Arc::new(NoCleanup),
        }
    }
}

/// A teardown tree plus the cleanup folded over its outcomes.
pub struct TeardownPlan {
    tree: Arc<TaskTree>,
    cleanup: Arc<dyn Cleanup>,
}

impl TeardownPlan {
    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// Run the tree, then hand every deletion outcome to the cleanup hook.
    pub async fn run(&self, cancel: CancellationToken) -> TreeReport {
        let report = self.tree.clone().run(TaskContext::new(cancel)).await;
        for outcome in report.outcomes.iter().filter(|o| o.resource.is_some()) {
            self.cleanup.cleanup(outcome).await;
        }
        report
    }
}

impl fmt::Display for TeardownPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.tree.fmt(f)
    }
}

fn split_service_account(qualified: &str) -> Result<(&str, &str), StackError> {
    match qualified.split_once('/') {
        Some((ns, name)) if !ns.trim().is_empty() && !name.trim().is_empty() => Ok((ns, name)),
        _ => Err(StackError::InvalidTree(format!(
            "service account {qualified:?} must be of the form namespace/name"
        ))),
    }
}

impl StackManager {
    /// Tear down the whole cluster.
    ///
    /// Stages run in order: deprecated stacks, service accounts and the OIDC
    /// provider, nodegroups, the cluster stack. With `force` every stage runs
    /// even if an earlier one failed.
    pub async fn new_tasks_to_delete_cluster_with_nodegroups(
        &self,
        request: ClusterTeardown,
    ) -> Result<TeardownPlan, StackError> {
        let cluster = self.cluster_name().to_string();
        let mut root =
            TaskTree::sequential(format!("delete cluster {cluster}")).best_effort(request.force);

        root.push_tree(self.delete_tasks_for_deprecated_stacks().await?);

        if request.cluster_operable {
            root.push_tree(
                self.new_tasks_to_delete_oidc_provider_with_iam_service_accounts(
                    request.oidc.clone(),
                    request.cluster_client.clone(),
                    request.force,
                )
                .await?,
            );
        } else {
            warn!(cluster = %cluster, "Cluster is not operable, skipping service accounts and OIDC provider");
        }

        let mut nodegroups = TaskTree::parallel(format!("delete nodegroups of {cluster}"))
            .with_concurrency(self.config.max_parallel);
        let owned = self.registry.list_nodegroup_stacks_with_statuses().await?;
        nodegroups.push_tree(self.new_tasks_to_delete_nodegroups(&owned, |_| true, true));
        for ng in self.list_unowned_nodegroups(&owned).await? {
            nodegroups.push_task(self.new_task_to_delete_unowned_nodegroup(&ng, true));
        }
        for stack in [
            self.registry.get_fargate_stack().await?,
            self.registry.get_karpenter_stack().await?,
        ]
        .into_iter()
        .flatten()
        {
            let info = format!(
                "delete {} stack {:?}",
                StackRole::classify(&stack).kind(),
                stack.name.as_str()
            );
            nodegroups.push_task(DeleteStackTask::new(
                self.lifecycle.clone(),
                stack.name,
                info,
                true,
            ));
        }
        root.push_tree(nodegroups);

        if let Some(stack) = self.registry.describe_cluster_stack_if_exists().await? {
            root.push_task(DeleteStackTask::new(
                self.lifecycle.clone(),
                stack.name,
                format!("delete cluster control plane {cluster:?}"),
                request.wait,
            ));
        }

        root.validate()?;
        info!(cluster = %cluster, force = request.force, tree = %root, "Built cluster teardown");
        Ok(TeardownPlan {
            tree: Arc::new(root),
            cleanup: request.cleanup,
        })
    }

    /// Parallel deletion of the nodegroup stacks selected by `should_delete`.
    pub fn new_tasks_to_delete_nodegroups(
        &self,
        stacks: &[NodeGroupStack],
        should_delete: impl Fn(&str) -> bool,
        wait: bool,
    ) -> TaskTree {
        let mut tree = TaskTree::parallel("delete nodegroup stacks")
            .with_concurrency(self.config.max_parallel);
        for ng in stacks.iter().filter(|ng| should_delete(&ng.node_group_name)) {
            let info = match ng.node_group_type {
                NodeGroupType::Managed => {
                    format!("delete managed nodegroup {:?}", ng.node_group_name)
                }
                NodeGroupType::Unmanaged => format!("delete nodegroup {:?}", ng.node_group_name),
            };
            tree.push_task(DeleteStackTask::new(
                self.lifecycle.clone(),
                ng.stack.name.clone(),
                info,
                wait,
            ));
        }
        tree
    }

    /// Delete a nodegroup that has no stack, through the nodegroup API.
    pub fn new_task_to_delete_unowned_nodegroup(
        &self,
        nodegroup: &str,
        wait: bool,
    ) -> DeleteNodegroupTask {
        DeleteNodegroupTask::new(
            self.nodegroups.clone(),
            self.cluster_name(),
            nodegroup,
            wait,
            self.config.poll_backoff(),
            self.config.retry_policy(),
            self.config.delete_timeout(),
        )
    }

    /// Nodegroups known to the cluster service that no stack owns.
    pub async fn list_unowned_nodegroups(
        &self,
        owned: &[NodeGroupStack],
    ) -> Result<Vec<String>, StackError> {
        let owned: BTreeSet<&str> = owned.iter().map(|ng| ng.node_group_name.as_str()).collect();
        let all = self
            .nodegroups
            .list_nodegroups(self.cluster_name())
            .await
            .map_err(|e| StackError::from_api(self.cluster_name(), e))?;
        Ok(all
            .into_iter()
            .filter(|ng| !owned.contains(ng.as_str()))
            .collect())
    }

    /// Delete IAM service-account stacks given as `namespace/name`, removing
    /// the Kubernetes service account afterwards when a client is given.
    pub fn new_tasks_to_delete_iam_service_accounts(
        &self,
        names: &[String],
        client: Option<Arc<dyn ClusterClient>>,
        wait: bool,
        signal: Option<Arc<DeleteWaitCondition>>,
    ) -> Result<TaskTree, StackError> {
        let mut tree = TaskTree::parallel("delete IAM service accounts")
            .with_concurrency(self.config.max_parallel);

        for qualified in names {
            let (namespace, name) = split_service_account(qualified)?;
            let mut delete = DeleteStackTask::new(
                self.lifecycle.clone(),
                self.naming().iam_service_account_stack(namespace, name),
                format!("delete IAM role for serviceaccount {qualified:?}"),
                wait,
            );
            if let Some(condition) = &signal {
                delete = delete.signalling(condition.clone());
            }

            match &client {
                Some(client) => {
                    let mut pair = TaskTree::sequential(qualified.clone());
                    pair.push_task(delete);
                    pair.push_task(UnbindServiceAccountTask::new(client.clone(), namespace, name));
                    tree.push_tree(pair);
                }
                None => tree.push_task(delete),
            }
        }

        tree.validate()?;
        Ok(tree)
    }

    /// Delete every addon IAM stack of the cluster.
    pub async fn new_task_to_delete_addon_iam(
        &self,
        wait: bool,
        signal: Option<Arc<DeleteWaitCondition>>,
    ) -> Result<TaskTree, StackError> {
        let stacks = self.registry.get_iam_addons_stacks().await?;
        Ok(self.addon_iam_tasks(stacks, wait, signal))
    }

    fn addon_iam_tasks(
        &self,
        stacks: Vec<Stack>,
        wait: bool,
        signal: Option<Arc<DeleteWaitCondition>>,
    ) -> TaskTree {
        let mut tree = TaskTree::parallel("delete addon IAM stacks")
            .with_concurrency(self.config.max_parallel);
        for stack in stacks {
            let addon = crate::registry::iam_addon_name(&stack).unwrap_or_default();
            let mut delete = DeleteStackTask::new(
                self.lifecycle.clone(),
                stack.name,
                format!("delete addon IAM {addon:?}"),
                wait,
            );
            if let Some(condition) = &signal {
                delete = delete.signalling(condition.clone());
            }
            tree.push_task(delete);
        }
        tree
    }

    /// Service-account and addon IAM stacks are deleted in parallel and
    /// signal a wait condition; the OIDC provider is deleted once they all
    /// finished (or, with `force`, once the wait gave up).
    pub async fn new_tasks_to_delete_oidc_provider_with_iam_service_accounts(
        &self,
        oidc: Option<Arc<dyn OidcProvider>>,
        client: Option<Arc<dyn ClusterClient>>,
        force: bool,
    ) -> Result<TaskTree, StackError> {
        let accounts = self.registry.list_iam_service_account_stacks().await?;
        let addons = self.registry.get_iam_addons_stacks().await?;
        let expected = accounts.len() + addons.len();
        debug!(
            service_accounts = accounts.len(),
            addons = addons.len(),
            "Planning IAM teardown"
        );

        let condition = DeleteWaitCondition::new(SERVICE_ACCOUNT_GROUP, expected);
        let mut dependencies = TaskTree::parallel("delete IAM stacks");
        dependencies.push_tree(self.new_tasks_to_delete_iam_service_accounts(
            &accounts,
            client,
            true,
            Some(condition.clone()),
        )?);
        dependencies.push_tree(self.addon_iam_tasks(addons, true, Some(condition.clone())));

        let mut stage = TaskTree::parallel("delete IAM service accounts and OIDC provider");
        stage.push_tree(dependencies);

        if let Some(oidc) = oidc {
            let mut gated = TaskTree::sequential("delete OIDC provider");
            if expected > 0 {
                gated.push_task(AwaitDependenciesTask::new(
                    condition,
                    self.config.dependency_wait_timeout(),
                    force,
                ));
            }
            gated.push_task(DeleteOidcProviderTask::new(
                oidc,
                self.registry.clone(),
                self.config.retry_policy(),
                force,
            ));
            stage.push_tree(gated);
        }

        stage.validate()?;
        Ok(stage)
    }

    /// Legacy stacks that still exist, deleted one after another.
    pub async fn delete_tasks_for_deprecated_stacks(&self) -> Result<TaskTree, StackError> {
        let mut tree = TaskTree::sequential("delete deprecated stacks");
        for name in self.naming().deprecated_stacks() {
            if let Some(stack) = self.registry.describe_stack(&name).await? {
                tree.push_task(DeleteStackTask::new(
                    self.lifecycle.clone(),
                    stack.name,
                    format!("delete deprecated stack {name:?}"),
                    true,
                ));
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::manager::Clients;
    use crate::sim::{nodegroup_stack_tags, Behavior, SimOp, SimulatedCloud};
    use parking_lot::Mutex;
    use stackrun_core::{tags, StackStatus};
    use tokio::time::Instant;

    const CLUSTER: &str = "stackrun-dev-cluster";
    const SA_NODE: &str = "stackrun-dev-addon-iamserviceaccount-kube-system-aws-node";
    const SA_APP: &str = "stackrun-dev-addon-iamserviceaccount-default-app";
    const ADDON: &str = "stackrun-dev-addon-vpc-cni";
    const NG: &str = "stackrun-dev-nodegroup-ng-1";
    const NG_MANAGED: &str = "stackrun-dev-nodegroup-ng-m";

    fn manager(cloud: &Arc<SimulatedCloud>) -> StackManager {
        let config = EngineConfig {
            poll_initial_interval_ms: 1_000,
            poll_max_interval_ms: 5_000,
            delete_timeout_secs: 300,
            dependency_wait_timeout_secs: 60,
            ..Default::default()
        };
        StackManager::new("dev", config, Clients::from_cloud(cloud.clone())).unwrap()
    }

    fn seed(cloud: &SimulatedCloud, name: &str, extra: &[(&str, &str)]) {
        let mut stack = Stack::new(name, StackStatus::CreateComplete)
            .with_id(stackrun_core::StackId::generate())
            .with_tag(tags::CLUSTER_NAME, "dev");
        for (k, v) in extra {
            stack.tags.insert(k.to_string(), v.to_string());
        }
        cloud.seed_stack(stack, "{}");
    }

    fn seed_cluster(cloud: &SimulatedCloud) {
        seed(cloud, CLUSTER, &[]);
        seed(cloud, SA_NODE, &[(tags::IAM_SERVICE_ACCOUNT_NAME, "kube-system/aws-node")]);
        seed(cloud, SA_APP, &[(tags::IAM_SERVICE_ACCOUNT_NAME, "default/app")]);
        seed(cloud, ADDON, &[(tags::ADDON_NAME, "vpc-cni")]);
        for (ng, stack, kind) in [
            ("ng-1", NG, NodeGroupType::Unmanaged),
            ("ng-m", NG_MANAGED, NodeGroupType::Managed),
        ] {
            let owned = nodegroup_stack_tags("dev", ng, kind);
            let pairs: Vec<(&str, &str)> =
                owned.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            seed(cloud, stack, &pairs);
        }
        cloud.add_unowned_nodegroup("legacy");
    }

    fn teardown(cloud: &Arc<SimulatedCloud>, force: bool) -> ClusterTeardown {
        ClusterTeardown {
            oidc: Some(cloud.clone()),
            cluster_client: Some(cloud.clone()),
            force,
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingCleanup {
        seen: Mutex<Vec<(String, &'static str)>>,
    }

    #[async_trait]
    impl Cleanup for RecordingCleanup {
        async fn cleanup(&self, outcome: &LeafOutcome) {
            self.seen.lock().push((
                outcome.resource.clone().unwrap_or_default(),
                outcome.status.as_str(),
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_respects_dependency_order() {
        let cloud = Arc::new(SimulatedCloud::new("dev").with_oidc_provider());
        seed_cluster(&cloud);
        let manager = manager(&cloud);

        let plan = manager
            .new_tasks_to_delete_cluster_with_nodegroups(teardown(&cloud, false))
            .await
            .unwrap();
        let report = plan.run(CancellationToken::new()).await;
        assert!(report.is_success(), "{}", report.summary());

        let oidc = cloud
            .position(SimOp::DeleteOidcProvider, "https://oidc.sim.local/id/dev")
            .unwrap();
        for stack in [SA_NODE, SA_APP, ADDON] {
            assert!(cloud.position(SimOp::StackSettled, stack).unwrap() < oidc);
        }
        let cluster_delete = cloud.position(SimOp::DeleteStack, CLUSTER).unwrap();
        for stack in [NG, NG_MANAGED] {
            let delete = cloud.position(SimOp::DeleteStack, stack).unwrap();
            assert!(oidc < delete);
            assert!(cloud.position(SimOp::StackSettled, stack).unwrap() < cluster_delete);
        }
        assert!(cloud.position(SimOp::NodegroupDeleted, "legacy").unwrap() < cluster_delete);

        assert_eq!(cloud.stack_status(CLUSTER), Some(StackStatus::DeleteComplete));
        assert!(!cloud.oidc_exists());
        assert!(!cloud.has_nodegroup("legacy"));
        assert_eq!(cloud.count(SimOp::UnbindServiceAccount, "default/app"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_teardown_proceeds_after_dependency_timeout() {
        let cloud = Arc::new(SimulatedCloud::new("dev").with_oidc_provider());
        seed_cluster(&cloud);
        cloud.behave(SA_APP, Behavior::stuck());
        let manager = manager(&cloud);

        let started = Instant::now();
        let plan = manager
            .new_tasks_to_delete_cluster_with_nodegroups(teardown(&cloud, true))
            .await
            .unwrap();
        let report = plan.run(CancellationToken::new()).await;

        // The OIDC provider goes once the 60s gate gives up, long before
        // the stuck stack times out.
        let calls = cloud.calls();
        let oidc_at = calls
            .iter()
            .find(|c| c.op == SimOp::DeleteOidcProvider)
            .map(|c| c.at - started)
            .unwrap();
        assert!(oidc_at >= std::time::Duration::from_secs(60));
        assert!(oidc_at < std::time::Duration::from_secs(300));

        assert_eq!(cloud.stack_status(CLUSTER), Some(StackStatus::DeleteComplete));
        assert_eq!(cloud.stack_status(NG), Some(StackStatus::DeleteComplete));

        let failed: Vec<_> = report.failed().map(|o| o.resource.clone().unwrap()).collect();
        assert_eq!(failed, vec![SA_APP.to_string()]);
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains(SA_APP));
        assert!(err.errors().all(|(_, e)| e.is_timeout()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dependency_blocks_later_stages_without_force() {
        let cloud = Arc::new(SimulatedCloud::new("dev").with_oidc_provider());
        seed_cluster(&cloud);
        cloud.behave(SA_NODE, Behavior::failing_delete());
        let manager = manager(&cloud);
        let cleanup = Arc::new(RecordingCleanup::default());

        let plan = manager
            .new_tasks_to_delete_cluster_with_nodegroups(ClusterTeardown {
                cleanup: cleanup.clone(),
                ..teardown(&cloud, false)
            })
            .await
            .unwrap();
        let report = plan.run(CancellationToken::new()).await;

        assert!(cloud.oidc_exists());
        assert_eq!(cloud.count(SimOp::DeleteStack, CLUSTER), 0);
        assert_eq!(cloud.stack_status(CLUSTER), Some(StackStatus::CreateComplete));
        assert_eq!(
            report.outcome("delete cluster control plane \"dev\"").unwrap().status.as_str(),
            "skipped"
        );
        let gate = report.outcome("wait for 3 iamserviceaccount deletion(s)").unwrap();
        assert!(matches!(gate.error(), Some(StackError::DependencyFailed { .. })));

        // Every deletion leaf reaches the cleanup hook, whatever its outcome.
        let seen = cleanup.seen.lock().clone();
        let with_resource = report.outcomes.iter().filter(|o| o.resource.is_some()).count();
        assert_eq!(seen.len(), with_resource);
        assert!(seen.contains(&(SA_NODE.to_string(), "failed")));
        assert!(seen.contains(&(CLUSTER.to_string(), "skipped")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oidc_provider_kept_while_service_accounts_remain() {
        let cloud = Arc::new(SimulatedCloud::new("dev").with_oidc_provider());
        seed(&cloud, SA_APP, &[(tags::IAM_SERVICE_ACCOUNT_NAME, "default/app")]);
        let manager = manager(&cloud);

        let mut tree = TaskTree::sequential("oidc only");
        tree.push_task(DeleteOidcProviderTask::new(
            cloud.clone(),
            manager.registry().clone(),
            manager.config().retry_policy(),
            false,
        ));
        let report = Arc::new(tree).run(TaskContext::default()).await;

        assert!(!report.is_success());
        assert!(cloud.oidc_exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_cluster_delete_does_not_wait() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        seed(&cloud, CLUSTER, &[]);
        let manager = manager(&cloud);

        let plan = manager
            .new_tasks_to_delete_cluster_with_nodegroups(ClusterTeardown {
                wait: false,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(plan.tree().leaf_count(), 1);
        let report = plan.run(CancellationToken::new()).await;

        assert!(report.is_success());
        assert_eq!(cloud.stack_status(CLUSTER), Some(StackStatus::DeleteInProgress));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inoperable_cluster_keeps_service_accounts() {
        let cloud = Arc::new(SimulatedCloud::new("dev").with_oidc_provider());
        seed_cluster(&cloud);
        let manager = manager(&cloud);

        let plan = manager
            .new_tasks_to_delete_cluster_with_nodegroups(ClusterTeardown {
                cluster_operable: false,
                ..teardown(&cloud, false)
            })
            .await
            .unwrap();
        let report = plan.run(CancellationToken::new()).await;

        assert!(report.is_success());
        assert_eq!(cloud.stack_status(SA_APP), Some(StackStatus::CreateComplete));
        assert!(cloud.oidc_exists());
        assert_eq!(cloud.stack_status(CLUSTER), Some(StackStatus::DeleteComplete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deprecated_stacks_are_deleted_in_order() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        seed(&cloud, "stackrun-dev-VPC", &[]);
        seed(&cloud, "stackrun-dev-ControlPlane", &[]);
        let manager = manager(&cloud);

        let tree = manager.delete_tasks_for_deprecated_stacks().await.unwrap();
        assert_eq!(tree.leaf_count(), 2);
        let report = Arc::new(tree).run(TaskContext::default()).await;
        assert!(report.is_success());

        let control_plane = cloud
            .position(SimOp::StackSettled, "stackrun-dev-ControlPlane")
            .unwrap();
        assert!(control_plane < cloud.position(SimOp::DeleteStack, "stackrun-dev-VPC").unwrap());
    }

    #[test]
    fn test_malformed_service_account_name_is_rejected() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        let err = manager(&cloud)
            .new_tasks_to_delete_iam_service_accounts(&["no-namespace".to_string()], None, true, None)
            .unwrap_err();
        assert!(matches!(err, StackError::InvalidTree(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nodegroup_filter() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        seed_cluster(&cloud);
        let manager = manager(&cloud);

        let stacks = manager.registry().list_nodegroup_stacks_with_statuses().await.unwrap();
        let tree = manager.new_tasks_to_delete_nodegroups(&stacks, |ng| ng == "ng-m", false);
        assert_eq!(tree.leaf_descriptions(), vec!["delete managed nodegroup \"ng-m\" [async]"]);

        let unowned = manager.list_unowned_nodegroups(&stacks).await.unwrap();
        assert_eq!(unowned, vec!["legacy".to_string()]);
    }
}
