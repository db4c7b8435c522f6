//! Entry point owning the registry, lifecycle driver and collaborators of
//! one cluster. Task-tree builders live in [`crate::coordinator`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use stackrun_core::{Stack, StackError, StackName};

use crate::api::{AuditApi, AutoscalingApi, NodegroupApi, ProvisioningApi};
use crate::asg::{AutoscalingGroups, Capacity};
use crate::config::{ConfigError, EngineConfig};
use crate::inflight::InFlightRegistry;
use crate::lifecycle::{StackLifecycle, UpdateOutcome, UpdateStackOptions};
use crate::naming::Naming;
use crate::registry::StackRegistry;

/// Collaborators shared by every operation of a manager.
#[derive(Clone)]
pub struct Clients {
    pub provisioning: Arc<dyn ProvisioningApi>,
    pub autoscaling: Arc<dyn AutoscalingApi>,
    pub nodegroups: Arc<dyn NodegroupApi>,
    pub audit: Option<Arc<dyn AuditApi>>,
}

impl Clients {
    /// Use one object for every collaborator.
    pub fn from_cloud<C>(cloud: Arc<C>) -> Self
    where
        C: ProvisioningApi + AutoscalingApi + NodegroupApi + AuditApi + 'static,
    {
        Self {
            provisioning: cloud.clone(),
            autoscaling: cloud.clone(),
            nodegroups: cloud.clone(),
            audit: Some(cloud),
        }
    }
}

/// Stack operations for one cluster.
#[derive(Clone)]
pub struct StackManager {
    pub(crate) config: EngineConfig,
    pub(crate) registry: StackRegistry,
    pub(crate) lifecycle: StackLifecycle,
    pub(crate) autoscaling: AutoscalingGroups,
    pub(crate) nodegroups: Arc<dyn NodegroupApi>,
    pub(crate) inflight: Arc<InFlightRegistry>,
}

impl StackManager {
    pub fn new(
        cluster: impl Into<String>,
        config: EngineConfig,
        clients: Clients,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_inflight(
            cluster,
            config,
            clients,
            InFlightRegistry::new(),
        ))
    }

    /// Share an in-flight registry between managers of the same process.
    pub fn with_inflight(
        cluster: impl Into<String>,
        config: EngineConfig,
        clients: Clients,
        inflight: Arc<InFlightRegistry>,
    ) -> Self {
        let naming = Naming::new(config.stack_prefix.clone(), cluster);
        let mut registry = StackRegistry::new(clients.provisioning.clone(), naming);
        if let Some(audit) = clients.audit {
            registry = registry.with_audit(audit);
        }
        let lifecycle = StackLifecycle::new(
            clients.provisioning,
            registry.clone(),
            inflight.clone(),
            &config,
        );
        let autoscaling = AutoscalingGroups::new(clients.autoscaling, config.retry_policy());

        Self {
            config,
            registry,
            lifecycle,
            autoscaling,
            nodegroups: clients.nodegroups,
            inflight,
        }
    }

    pub fn cluster_name(&self) -> &str {
        self.naming().cluster_name()
    }

    pub fn naming(&self) -> &Naming {
        self.registry.naming()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StackRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &StackLifecycle {
        &self.lifecycle
    }

    pub fn inflight(&self) -> &Arc<InFlightRegistry> {
        &self.inflight
    }

    /// Wait for a stack to finish creating; fails unless it ends in `CREATE_COMPLETE`.
    pub async fn wait_until_created(
        &self,
        name: &StackName,
        cancel: &CancellationToken,
    ) -> Result<Stack, StackError> {
        self.lifecycle.wait_until_created(name, cancel).await
    }

    /// Update a nodegroup stack with a new template, keeping its parameters.
    pub async fn update_nodegroup_stack(
        &self,
        nodegroup: &str,
        template_body: impl Into<String>,
        wait: bool,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, StackError> {
        let name = self.naming().nodegroup_stack(nodegroup);
        let stack = self
            .registry
            .describe_stack(&name)
            .await?
            .ok_or_else(|| StackError::NotFound(name.to_string()))?;

        info!(nodegroup = %nodegroup, stack = %name, "Updating nodegroup stack");
        self.lifecycle
            .update(
                UpdateStackOptions {
                    stack_name: name,
                    change_set_name: Some(self.naming().change_set("update-nodegroup")),
                    description: format!("updating nodegroup {nodegroup}"),
                    template_body: template_body.into(),
                    parameters: stack.parameters,
                    wait,
                },
                cancel,
            )
            .await
    }

    pub async fn get_autoscaling_group_desired_capacity(
        &self,
        name: &str,
    ) -> Result<Capacity, StackError> {
        self.autoscaling
            .get_autoscaling_group_desired_capacity(name)
            .await
    }

    pub async fn propagate_managed_nodegroup_tags_to_asg(
        &self,
        nodegroup: &str,
        tags: &BTreeMap<String, String>,
        asg_names: &[String],
    ) -> Result<(), StackError> {
        self.autoscaling
            .propagate_managed_nodegroup_tags_to_asg(nodegroup, tags, asg_names)
            .await
    }

    /// Autoscaling groups backing a managed nodegroup.
    pub async fn get_managed_nodegroup_autoscaling_groups(
        &self,
        nodegroup: &str,
    ) -> Result<Vec<String>, StackError> {
        self.nodegroups
            .describe_nodegroup(self.cluster_name(), nodegroup)
            .await
            .map(|ng| ng.autoscaling_groups)
            .map_err(|e| StackError::from_api(nodegroup, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{nodegroup_stack_tags, SimOp, SimulatedCloud};
    use stackrun_core::{NodeGroupType, StackStatus};

    fn manager(cloud: &Arc<SimulatedCloud>) -> StackManager {
        let config = EngineConfig {
            poll_initial_interval_ms: 1_000,
            poll_max_interval_ms: 5_000,
            ..Default::default()
        };
        StackManager::new("dev", config, Clients::from_cloud(cloud.clone())).unwrap()
    }

    fn seed_nodegroup(cloud: &SimulatedCloud, ng: &str, kind: NodeGroupType) {
        let mut stack = Stack::new(
            format!("stackrun-dev-nodegroup-{ng}"),
            StackStatus::CreateComplete,
        );
        for (k, v) in nodegroup_stack_tags("dev", ng, kind) {
            stack.tags.insert(k, v);
        }
        stack.parameters.insert("Size".into(), "2".into());
        cloud.seed_stack(stack, "{\"v\": 1}");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        let config = EngineConfig {
            stack_prefix: String::new(),
            ..Default::default()
        };
        assert!(StackManager::new("dev", config, Clients::from_cloud(cloud)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_nodegroup_stack() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        seed_nodegroup(&cloud, "ng-1", NodeGroupType::Unmanaged);
        let manager = manager(&cloud);
        let cancel = CancellationToken::new();

        let unchanged = manager
            .update_nodegroup_stack("ng-1", "{\"v\": 1}", true, &cancel)
            .await
            .unwrap();
        assert_eq!(unchanged, UpdateOutcome::Unchanged);

        let updated = manager
            .update_nodegroup_stack("ng-1", "{\"v\": 2}", true, &cancel)
            .await
            .unwrap();
        assert!(matches!(updated, UpdateOutcome::Updated(_)));
        assert_eq!(
            cloud.count(SimOp::ExecuteChangeSet, "stackrun-dev-nodegroup-ng-1"),
            1
        );
    }

    #[tokio::test]
    async fn test_update_missing_nodegroup_is_not_found() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        let err = manager(&cloud)
            .update_nodegroup_stack("nope", "{}", false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_managed_nodegroup_autoscaling_groups() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        seed_nodegroup(&cloud, "ng-m", NodeGroupType::Managed);
        let manager = manager(&cloud);

        let asgs = manager
            .get_managed_nodegroup_autoscaling_groups("ng-m")
            .await
            .unwrap();
        assert_eq!(asgs, vec!["ng-m-asg".to_string()]);
        let capacity = manager
            .get_autoscaling_group_desired_capacity(&asgs[0])
            .await
            .unwrap();
        assert_eq!(capacity.desired, 2);
    }
}
