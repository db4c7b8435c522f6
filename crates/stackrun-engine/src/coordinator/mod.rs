//! Creation and teardown trees for a cluster and its dependent stacks.
//!
//! Builders live on [`StackManager`](crate::manager::StackManager); the
//! leaf tasks they compose are defined here.

mod create;
mod delete;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use stackrun_core::{ApiError, StackDescription, StackError, StackName};

use crate::api::{
    ClusterClient, NodegroupApi, OidcProvider, ServiceAccountBinding, ROLE_ARN_OUTPUT,
};
use crate::asg::AutoscalingGroups;
use crate::backoff::{poll_until, retry_transient, Backoff, PollStep, RetryPolicy};
use crate::lifecycle::{DeleteOutcome, StackLifecycle};
use crate::registry::StackRegistry;
use crate::tasks::{Task, TaskContext};
use crate::wait::DeleteWaitCondition;

pub use create::{ClusterCreation, NodegroupSpec, ServiceAccountSpec};
pub use delete::{Cleanup, ClusterTeardown, NoCleanup, TeardownPlan};

/// Create one stack and wait for `CREATE_COMPLETE`.
pub struct CreateStackTask {
    lifecycle: StackLifecycle,
    description: StackDescription,
    tags: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
    info: String,
}

impl CreateStackTask {
    pub fn new(
        lifecycle: StackLifecycle,
        info: impl Into<String>,
        description: StackDescription,
        tags: BTreeMap<String, String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            lifecycle,
            description,
            tags,
            parameters,
            info: info.into(),
        }
    }
}

#[async_trait]
impl Task for CreateStackTask {
    fn describe(&self) -> String {
        self.info.clone()
    }

    fn resource(&self) -> Option<String> {
        Some(self.description.name.to_string())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), StackError> {
        self.lifecycle
            .create(
                self.description.clone(),
                self.tags.clone(),
                self.parameters.clone(),
                ctx.cancel_token(),
            )
            .await
            .map(|_| ())
    }
}

/// Delete one stack, optionally waiting, and report to a wait condition.
pub struct DeleteStackTask {
    lifecycle: StackLifecycle,
    stack: StackName,
    info: String,
    wait: bool,
    signal: Option<Arc<DeleteWaitCondition>>,
}

impl DeleteStackTask {
    pub fn new(lifecycle: StackLifecycle, stack: StackName, info: impl Into<String>, wait: bool) -> Self {
        Self {
            lifecycle,
            stack,
            info: info.into(),
            wait,
            signal: None,
        }
    }

    /// Builder method to signal `condition` once the deletion finished.
    pub fn signalling(mut self, condition: Arc<DeleteWaitCondition>) -> Self {
        self.signal = Some(condition);
        self
    }
}

#[async_trait]
impl Task for DeleteStackTask {
    fn describe(&self) -> String {
        if self.wait {
            self.info.clone()
        } else {
            format!("{} [async]", self.info)
        }
    }

    fn resource(&self) -> Option<String> {
        Some(self.stack.to_string())
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), StackError> {
        let guard = self
            .signal
            .as_ref()
            .map(|condition| condition.guard(self.stack.as_str()));

        let result = if self.wait {
            self.lifecycle.delete(&self.stack, ctx.cancel_token()).await
        } else {
            self.lifecycle.delete_async(&self.stack).await
        };
        if let Ok(DeleteOutcome::AlreadyAbsent) = result {
            debug!(stack = %self.stack, "Nothing to delete");
        }

        let result = result.map(|_| ());
        if let Some(guard) = guard {
            guard.finish(result.clone());
        }
        result
    }
}

/// Delete a nodegroup that no stack owns, through the nodegroup API.
pub struct DeleteNodegroupTask {
    api: Arc<dyn NodegroupApi>,
    cluster: String,
    nodegroup: String,
    wait: bool,
    poll: Backoff,
    retry: RetryPolicy,
    timeout: Duration,
}

impl DeleteNodegroupTask {
    pub fn new(
        api: Arc<dyn NodegroupApi>,
        cluster: impl Into<String>,
        nodegroup: impl Into<String>,
        wait: bool,
        poll: Backoff,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            cluster: cluster.into(),
            nodegroup: nodegroup.into(),
            wait,
            poll,
            retry,
            timeout,
        }
    }
}

#[async_trait]
impl Task for DeleteNodegroupTask {
    fn describe(&self) -> String {
        format!("delete unowned nodegroup {:?}", self.nodegroup)
    }

    fn resource(&self) -> Option<String> {
        Some(format!("nodegroup/{}", self.nodegroup))
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), StackError> {
        let (cluster, nodegroup) = (self.cluster.as_str(), self.nodegroup.as_str());
        info!(nodegroup = %nodegroup, "Deleting unowned nodegroup");

        match retry_transient(&self.retry, "delete_nodegroup", || {
            self.api.delete_nodegroup(cluster, nodegroup)
        })
        .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(nodegroup = %nodegroup, "Nodegroup already absent");
                return Ok(());
            }
            Err(e) => return Err(StackError::from_api(nodegroup, e)),
        }
        if !self.wait {
            return Ok(());
        }

        poll_until(&self.poll, self.timeout, ctx.cancel_token(), nodegroup, || async move {
            match self.api.describe_nodegroup(cluster, nodegroup).await {
                Err(e) if e.is_not_found() => Ok(PollStep::Ready(())),
                Err(e) if e.is_transient() => Ok(PollStep::Pending),
                Err(e) => Err(StackError::from_api(nodegroup, e)),
                Ok(ng) => {
                    debug!(nodegroup = %nodegroup, status = ?ng.status, "Waiting for nodegroup deletion");
                    Ok(PollStep::Pending)
                }
            }
        })
        .await?;
        info!(nodegroup = %nodegroup, "Nodegroup deleted");
        Ok(())
    }
}

/// Block until a dependency group finished, honouring `force`.
pub struct AwaitDependenciesTask {
    condition: Arc<DeleteWaitCondition>,
    timeout: Duration,
    force: bool,
}

impl AwaitDependenciesTask {
    pub fn new(condition: Arc<DeleteWaitCondition>, timeout: Duration, force: bool) -> Self {
        Self {
            condition,
            timeout,
            force,
        }
    }
}

#[async_trait]
impl Task for AwaitDependenciesTask {
    fn describe(&self) -> String {
        format!(
            "wait for {} {} deletion(s)",
            self.condition.expected(),
            self.condition.group()
        )
    }

    async fn run(&self, ctx: &TaskContext) -> Result<(), StackError> {
        self.condition
            .gate(self.timeout, self.force, ctx.cancel_token())
            .await
            .map(|_| ())
    }
}

/// Delete the cluster's OIDC provider once no service-account stack uses it.
pub struct DeleteOidcProviderTask {
    oidc: Arc<dyn OidcProvider>,
    registry: StackRegistry,
    retry: RetryPolicy,
    force: bool,
}

impl DeleteOidcProviderTask {
    pub fn new(
        oidc: Arc<dyn OidcProvider>,
        registry: StackRegistry,
        retry: RetryPolicy,
        force: bool,
    ) -> Self {
        Self {
            oidc,
            registry,
            retry,
            force,
        }
    }
}

#[async_trait]
impl Task for DeleteOidcProviderTask {
    fn describe(&self) -> String {
        "delete OIDC provider".to_string()
    }

    fn resource(&self) -> Option<String> {
        Some(format!("oidc/{}", self.oidc.issuer()))
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), StackError> {
        let issuer = self.oidc.issuer();

        if !self.force {
            let consumers = self.registry.list_iam_service_account_stacks().await?;
            if !consumers.is_empty() {
                return Err(StackError::DependencyFailed {
                    group: format!("consumers of OIDC provider {issuer}"),
                    failed: consumers,
                });
            }
        }

        let exists = retry_transient(&self.retry, "oidc_exists", || self.oidc.exists())
            .await
            .map_err(|e| StackError::from_api(issuer.as_str(), e))?;
        if !exists {
            debug!(issuer = %issuer, "OIDC provider already absent");
            return Ok(());
        }

        match retry_transient(&self.retry, "delete_oidc_provider", || self.oidc.delete()).await {
            Ok(()) | Err(ApiError::NotFound(_)) => {
                info!(issuer = %issuer, "Deleted OIDC provider");
                Ok(())
            }
            Err(e) => Err(StackError::from_api(issuer.as_str(), e)),
        }
    }
}

/// Bind a Kubernetes service account to the role created by its stack.
pub struct BindServiceAccountTask {
    registry: StackRegistry,
    client: Arc<dyn ClusterClient>,
    oidc: Arc<dyn OidcProvider>,
    stack: StackName,
    namespace: String,
    name: String,
}

impl BindServiceAccountTask {
    pub fn new(
        registry: StackRegistry,
        client: Arc<dyn ClusterClient>,
        oidc: Arc<dyn OidcProvider>,
        stack: StackName,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            client,
            oidc,
            stack,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl Task for BindServiceAccountTask {
    fn describe(&self) -> String {
        format!(
            "create service account \"{}/{}\"",
            self.namespace, self.name
        )
    }

    fn resource(&self) -> Option<String> {
        Some(format!("serviceaccount/{}/{}", self.namespace, self.name))
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), StackError> {
        let issuer = self.oidc.issuer();
        let exists = self
            .oidc
            .exists()
            .await
            .map_err(|e| StackError::from_api(issuer.as_str(), e))?;
        if !exists {
            return Err(StackError::NotFound(format!("OIDC provider {issuer}")));
        }

        let stack = self
            .registry
            .describe_stack(&self.stack)
            .await?
            .ok_or_else(|| StackError::NotFound(self.stack.to_string()))?;
        let role_arn = stack.outputs.get(ROLE_ARN_OUTPUT).cloned();
        if role_arn.is_none() {
            warn!(stack = %self.stack, "Stack has no role output");
        }

        let binding = ServiceAccountBinding {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            role_arn,
        };
        self.client
            .bind_service_account(&binding)
            .await
            .map_err(|e| StackError::from_api(format!("{}/{}", self.namespace, self.name), e))
    }
}

/// Remove a Kubernetes service account.
pub struct UnbindServiceAccountTask {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
}

impl UnbindServiceAccountTask {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl Task for UnbindServiceAccountTask {
    fn describe(&self) -> String {
        format!(
            "delete service account \"{}/{}\"",
            self.namespace, self.name
        )
    }

    fn resource(&self) -> Option<String> {
        Some(format!("serviceaccount/{}/{}", self.namespace, self.name))
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), StackError> {
        match self
            .client
            .unbind_service_account(&self.namespace, &self.name)
            .await
        {
            Ok(()) | Err(ApiError::NotFound(_)) => Ok(()),
            Err(e) => Err(StackError::from_api(
                format!("{}/{}", self.namespace, self.name),
                e,
            )),
        }
    }
}

/// Copy nodegroup tags onto the autoscaling groups of a managed nodegroup.
pub struct PropagateTagsTask {
    nodegroups: Arc<dyn NodegroupApi>,
    autoscaling: AutoscalingGroups,
    cluster: String,
    nodegroup: String,
    tags: BTreeMap<String, String>,
}

impl PropagateTagsTask {
    pub fn new(
        nodegroups: Arc<dyn NodegroupApi>,
        autoscaling: AutoscalingGroups,
        cluster: impl Into<String>,
        nodegroup: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            nodegroups,
            autoscaling,
            cluster: cluster.into(),
            nodegroup: nodegroup.into(),
            tags,
        }
    }
}

#[async_trait]
impl Task for PropagateTagsTask {
    fn describe(&self) -> String {
        format!(
            "propagate tags to ASG for managed nodegroup {:?}",
            self.nodegroup
        )
    }

    fn resource(&self) -> Option<String> {
        Some(format!("asg-tags/{}", self.nodegroup))
    }

    async fn run(&self, _ctx: &TaskContext) -> Result<(), StackError> {
        let nodegroup = self
            .nodegroups
            .describe_nodegroup(&self.cluster, &self.nodegroup)
            .await
            .map_err(|e| StackError::from_api(self.nodegroup.as_str(), e))?;
        self.autoscaling
            .propagate_managed_nodegroup_tags_to_asg(
                &self.nodegroup,
                &self.tags,
                &nodegroup.autoscaling_groups,
            )
            .await
    }
}
