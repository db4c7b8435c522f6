//! In-memory cloud implementing every collaborator trait.
//!
//! Remote operations settle after a configurable latency measured on the
//! tokio clock, so tests run with a paused clock and the CLI can simulate a
//! full orchestration. Every mutating call is recorded for ordering checks.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use stackrun_core::{
    tags, ApiError, AuditEvent, ChangeSet, ChangeSetStatus, NodeGroupType, ResourceChange, Stack,
    StackEvent, StackId, StackName, StackResource, StackRole, StackStatus,
    AUTOSCALING_GROUP_RESOURCE_TYPE,
};

use crate::api::{
    AuditApi, AutoScalingGroup, AutoscalingApi, ChangeSetRequest, ClusterClient,
    CreateStackRequest, Nodegroup, NodegroupApi, NodegroupStatus, OidcProvider, ProvisioningApi,
    ServiceAccountBinding, ROLE_ARN_OUTPUT,
};

const NO_CHANGES_REASON: &str =
    "The submitted information didn't contain changes. Submit different information to create a change set.";

/// Scripted behaviour for one stack or nodegroup.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Overrides the cloud's default latency.
    pub latency: Option<Duration>,
    pub fail_create: bool,
    pub fail_update: bool,
    pub fail_delete: bool,
    /// The operation never settles.
    pub stuck: bool,
    /// Number of create/delete calls that fail with a throttling error first.
    pub transient_errors: u32,
}

impl Behavior {
    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Default::default()
        }
    }

    pub fn failing_delete() -> Self {
        Self {
            fail_delete: true,
            ..Default::default()
        }
    }

    pub fn stuck() -> Self {
        Self {
            stuck: true,
            ..Default::default()
        }
    }

    pub fn slow(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    pub fn throttled(times: u32) -> Self {
        Self {
            transient_errors: times,
            ..Default::default()
        }
    }
}

/// Kind of recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateStack,
    DeleteStack,
    CreateChangeSet,
    ExecuteChangeSet,
    DeleteChangeSet,
    /// A pending stack operation reached its terminal status.
    StackSettled,
    DeleteNodegroup,
    NodegroupDeleted,
    DeleteOidcProvider,
    BindServiceAccount,
    UnbindServiceAccount,
    UpdateAsgTags,
}

/// A recorded call.
#[derive(Debug, Clone)]
pub struct SimCall {
    pub op: SimOp,
    pub target: String,
    pub at: Instant,
}

#[derive(Debug)]
struct Pending {
    /// `None` means the operation never settles.
    ready_at: Option<Instant>,
    status: StackStatus,
    reason: Option<String>,
}

#[derive(Debug)]
struct SimStack {
    stack: Stack,
    template: String,
    pending: Option<Pending>,
    events: Vec<StackEvent>,
}

#[derive(Debug)]
struct SimNodegroup {
    nodegroup: Nodegroup,
    owned: bool,
    delete_ready_at: Option<Option<Instant>>,
}

#[derive(Debug, Default)]
struct State {
    stacks: BTreeMap<StackName, SimStack>,
    change_sets: HashMap<(StackName, String), (ChangeSet, ChangeSetRequest)>,
    asgs: BTreeMap<String, AutoScalingGroup>,
    nodegroups: BTreeMap<String, SimNodegroup>,
    oidc_exists: bool,
    bindings: BTreeMap<String, ServiceAccountBinding>,
    behaviors: HashMap<String, Behavior>,
    calls: Vec<SimCall>,
}

impl State {
    fn record(&mut self, op: SimOp, target: impl Into<String>) {
        let target = target.into();
        debug!(op = ?op, target = %target, "Simulated call");
        self.calls.push(SimCall {
            op,
            target,
            at: Instant::now(),
        });
    }

    fn behavior(&self, key: &str) -> Behavior {
        self.behaviors.get(key).cloned().unwrap_or_default()
    }

    fn take_transient(&mut self, key: &str) -> Option<ApiError> {
        let behavior = self.behaviors.get_mut(key)?;
        if behavior.transient_errors == 0 {
            return None;
        }
        behavior.transient_errors -= 1;
        Some(ApiError::Throttled(format!("rate exceeded for {key}")))
    }

    fn settle_all(&mut self) {
        let names: Vec<StackName> = self.stacks.keys().cloned().collect();
        for name in names {
            self.settle(&name);
        }
        let nodegroups: Vec<String> = self.nodegroups.keys().cloned().collect();
        for ng in nodegroups {
            self.settle_nodegroup(&ng);
        }
    }

    fn settle(&mut self, name: &StackName) {
        let now = Instant::now();
        let Some(sim) = self.stacks.get_mut(name) else {
            return;
        };
        let due = matches!(
            sim.pending,
            Some(Pending { ready_at: Some(at), .. }) if at <= now
        );
        if !due {
            return;
        }
        let Some(pending) = sim.pending.take() else {
            return;
        };

        sim.stack.status = pending.status;
        sim.stack.status_reason = pending.reason.clone();
        sim.stack.last_updated_at = Some(Utc::now());
        sim.events.push(StackEvent {
            timestamp: Utc::now(),
            logical_id: name.to_string(),
            resource_type: "AWS::CloudFormation::Stack".to_string(),
            status: pending.status.to_string(),
            reason: pending.reason,
        });
        let stack = sim.stack.clone();

        self.record(SimOp::StackSettled, name.as_str());
        self.apply_side_effects(&stack);
    }

    fn apply_side_effects(&mut self, stack: &Stack) {
        let role = StackRole::classify(stack);
        match (stack.status, role) {
            (
                StackStatus::CreateComplete,
                StackRole::NodeGroup {
                    name,
                    node_group_type,
                },
            ) => {
                let asg_name = format!("{name}-asg");
                self.asgs.insert(
                    asg_name.clone(),
                    AutoScalingGroup {
                        name: asg_name.clone(),
                        desired_capacity: 2,
                        min_size: 1,
                        max_size: 3,
                        tags: BTreeMap::new(),
                    },
                );
                if node_group_type == NodeGroupType::Managed {
                    self.nodegroups.insert(
                        name.clone(),
                        SimNodegroup {
                            nodegroup: Nodegroup {
                                name,
                                status: NodegroupStatus::Active,
                                autoscaling_groups: vec![asg_name.clone()],
                            },
                            owned: true,
                            delete_ready_at: None,
                        },
                    );
                }
                if let Some(sim) = self.stacks.get_mut(&stack.name) {
                    sim.stack.resources.push(
                        StackResource::new("NodeGroup", AUTOSCALING_GROUP_RESOURCE_TYPE)
                            .with_physical_id(asg_name),
                    );
                }
            }
            (StackStatus::CreateComplete, StackRole::IamServiceAccount { .. }) => {
                if let Some(sim) = self.stacks.get_mut(&stack.name) {
                    sim.stack.outputs.insert(
                        ROLE_ARN_OUTPUT.to_string(),
                        format!("arn:aws:iam::000000000000:role/{}", stack.name),
                    );
                }
            }
            (StackStatus::DeleteComplete, StackRole::NodeGroup { name, .. }) => {
                self.asgs.remove(&format!("{name}-asg"));
                if self.nodegroups.get(&name).map(|n| n.owned).unwrap_or(false) {
                    self.nodegroups.remove(&name);
                }
            }
            _ => {}
        }
    }

    fn settle_nodegroup(&mut self, name: &str) {
        let now = Instant::now();
        let due = matches!(
            self.nodegroups.get(name).and_then(|n| n.delete_ready_at),
            Some(Some(at)) if at <= now
        );
        if due {
            self.nodegroups.remove(name);
            self.asgs.remove(&format!("{name}-asg"));
            self.record(SimOp::NodegroupDeleted, name);
        }
    }

    fn live(&self, name: &StackName) -> Option<&SimStack> {
        self.stacks
            .get(name)
            .filter(|s| s.stack.status != StackStatus::DeleteComplete)
    }
}

/// In-memory implementation of all collaborator traits.
#[derive(Debug)]
pub struct SimulatedCloud {
    cluster: String,
    default_latency: Duration,
    state: Mutex<State>,
}

impl SimulatedCloud {
    /// Create a cloud for `cluster` where every operation takes 30 seconds.
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            default_latency: Duration::from_secs(30),
            state: Mutex::new(State::default()),
        }
    }

    /// Builder method to set the default latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Builder method to make the OIDC provider exist.
    pub fn with_oidc_provider(self) -> Self {
        self.state.lock().oidc_exists = true;
        self
    }

    /// Script the behaviour of a stack (by stack name) or nodegroup (by nodegroup name).
    pub fn behave(&self, key: impl Into<String>, behavior: Behavior) {
        self.state.lock().behaviors.insert(key.into(), behavior);
    }

    /// Insert an already-settled stack.
    pub fn seed_stack(&self, stack: Stack, template: impl Into<String>) {
        let mut state = self.state.lock();
        let name = stack.name.clone();
        state.stacks.insert(
            name,
            SimStack {
                stack: stack.clone(),
                template: template.into(),
                pending: None,
                events: Vec::new(),
            },
        );
        state.apply_side_effects(&stack);
    }

    /// Insert a nodegroup that no stack owns.
    pub fn add_unowned_nodegroup(&self, name: impl Into<String>) {
        let name = name.into();
        let asg_name = format!("{name}-asg");
        let mut state = self.state.lock();
        state.asgs.insert(
            asg_name.clone(),
            AutoScalingGroup {
                name: asg_name.clone(),
                desired_capacity: 1,
                min_size: 1,
                max_size: 1,
                tags: BTreeMap::new(),
            },
        );
        state.nodegroups.insert(
            name.clone(),
            SimNodegroup {
                nodegroup: Nodegroup {
                    name,
                    status: NodegroupStatus::Active,
                    autoscaling_groups: vec![asg_name],
                },
                owned: false,
                delete_ready_at: None,
            },
        );
    }

    pub fn add_auto_scaling_group(&self, asg: AutoScalingGroup) {
        self.state.lock().asgs.insert(asg.name.clone(), asg);
    }

    /// Current status of a stack, settling due operations first.
    pub fn stack_status(&self, name: &str) -> Option<StackStatus> {
        let mut state = self.state.lock();
        let name = StackName::new(name);
        state.settle(&name);
        state.stacks.get(&name).map(|s| s.stack.status)
    }

    pub fn auto_scaling_group(&self, name: &str) -> Option<AutoScalingGroup> {
        self.state.lock().asgs.get(name).cloned()
    }

    pub fn oidc_exists(&self) -> bool {
        self.state.lock().oidc_exists
    }

    pub fn binding(&self, namespace: &str, name: &str) -> Option<ServiceAccountBinding> {
        self.state
            .lock()
            .bindings
            .get(&format!("{namespace}/{name}"))
            .cloned()
    }

    pub fn has_nodegroup(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        state.settle_nodegroup(name);
        state.nodegroups.contains_key(name)
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().calls.clone()
    }

    /// Index of the first recorded `op` on `target`.
    pub fn position(&self, op: SimOp, target: &str) -> Option<usize> {
        self.state
            .lock()
            .calls
            .iter()
            .position(|c| c.op == op && c.target == target)
    }

    /// Number of recorded `op` calls on `target`.
    pub fn count(&self, op: SimOp, target: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op && c.target == target)
            .count()
    }

    fn latency(&self, behavior: &Behavior) -> Option<Instant> {
        if behavior.stuck {
            None
        } else {
            Some(Instant::now() + behavior.latency.unwrap_or(self.default_latency))
        }
    }
}

#[async_trait]
impl ProvisioningApi for SimulatedCloud {
    async fn create_stack(&self, request: CreateStackRequest) -> Result<StackId, ApiError> {
        let name = request.description.name.clone();
        let mut state = self.state.lock();
        if let Some(err) = state.take_transient(name.as_str()) {
            return Err(err);
        }
        state.settle(&name);
        if state.live(&name).is_some() {
            return Err(ApiError::Validation(format!("Stack [{name}] already exists")));
        }

        let behavior = state.behavior(name.as_str());
        let (status, reason) = if behavior.fail_create {
            (
                StackStatus::RollbackComplete,
                Some("The following resource(s) failed to create: [Resource]".to_string()),
            )
        } else {
            (StackStatus::CreateComplete, None)
        };

        let id = StackId::generate();
        let mut stack = Stack::new(name.clone(), StackStatus::CreateInProgress).with_id(id.clone());
        stack.tags = request.tags;
        stack.parameters = request.parameters;
        stack.description = Some(format!("stack for cluster {}", self.cluster));

        let ready_at = self.latency(&behavior);
        state.stacks.insert(
            name.clone(),
            SimStack {
                stack,
                template: request.description.template_body,
                pending: Some(Pending {
                    ready_at,
                    status,
                    reason,
                }),
                events: vec![StackEvent {
                    timestamp: Utc::now(),
                    logical_id: name.to_string(),
                    resource_type: "AWS::CloudFormation::Stack".to_string(),
                    status: StackStatus::CreateInProgress.to_string(),
                    reason: Some("User Initiated".to_string()),
                }],
            },
        );
        state.record(SimOp::CreateStack, name.as_str());
        Ok(id)
    }

    async fn describe_stack(&self, name: &StackName) -> Result<Stack, ApiError> {
        let mut state = self.state.lock();
        state.settle(name);
        state
            .live(name)
            .map(|s| s.stack.clone())
            .ok_or_else(|| ApiError::NotFound(format!("Stack with id {name} does not exist")))
    }

    async fn list_stacks(&self, statuses: &[StackStatus]) -> Result<Vec<Stack>, ApiError> {
        let mut state = self.state.lock();
        state.settle_all();
        Ok(state
            .stacks
            .values()
            .map(|s| &s.stack)
            .filter(|s| {
                if statuses.is_empty() {
                    s.status != StackStatus::DeleteComplete
                } else {
                    statuses.contains(&s.status)
                }
            })
            .cloned()
            .collect())
    }

    async fn delete_stack(&self, name: &StackName) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_transient(name.as_str()) {
            return Err(err);
        }
        state.settle(name);
        state.record(SimOp::DeleteStack, name.as_str());

        let behavior = state.behavior(name.as_str());
        let ready_at = self.latency(&behavior);
        let Some(sim) = state.stacks.get_mut(name) else {
            return Ok(());
        };
        if matches!(
            sim.stack.status,
            StackStatus::DeleteComplete | StackStatus::DeleteInProgress
        ) {
            return Ok(());
        }

        let (status, reason) = if behavior.fail_delete {
            (
                StackStatus::DeleteFailed,
                Some("The following resource(s) failed to delete: [Resource]".to_string()),
            )
        } else {
            (StackStatus::DeleteComplete, None)
        };
        sim.stack.status = StackStatus::DeleteInProgress;
        sim.pending = Some(Pending {
            ready_at,
            status,
            reason,
        });
        sim.events.push(StackEvent {
            timestamp: Utc::now(),
            logical_id: name.to_string(),
            resource_type: "AWS::CloudFormation::Stack".to_string(),
            status: StackStatus::DeleteInProgress.to_string(),
            reason: Some("User Initiated".to_string()),
        });
        Ok(())
    }

    async fn create_change_set(&self, request: ChangeSetRequest) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let name = request.stack_name.clone();
        state.settle(&name);
        let sim = state
            .live(&name)
            .ok_or_else(|| ApiError::NotFound(format!("Stack [{name}] does not exist")))?;
        if sim.stack.status.is_transitional() {
            return Err(ApiError::Conflict(format!(
                "Stack [{name}] is in {} state",
                sim.stack.status
            )));
        }

        let unchanged =
            sim.template == request.template_body && sim.stack.parameters == request.parameters;
        let change_set = if unchanged {
            ChangeSet {
                name: request.change_set_name.clone(),
                stack_name: name.clone(),
                status: ChangeSetStatus::Failed,
                status_reason: Some(NO_CHANGES_REASON.to_string()),
                changes: Vec::new(),
            }
        } else {
            ChangeSet {
                name: request.change_set_name.clone(),
                stack_name: name.clone(),
                status: ChangeSetStatus::CreateComplete,
                status_reason: None,
                changes: vec![ResourceChange {
                    action: "Modify".to_string(),
                    logical_id: "Template".to_string(),
                    resource_type: "AWS::CloudFormation::Stack".to_string(),
                }],
            }
        };

        state.record(SimOp::CreateChangeSet, name.as_str());
        state.change_sets.insert(
            (name, request.change_set_name.clone()),
            (change_set, request),
        );
        Ok(())
    }

    async fn describe_change_set(
        &self,
        stack: &StackName,
        change_set: &str,
    ) -> Result<ChangeSet, ApiError> {
        self.state
            .lock()
            .change_sets
            .get(&(stack.clone(), change_set.to_string()))
            .map(|(cs, _)| cs.clone())
            .ok_or_else(|| ApiError::NotFound(format!("ChangeSet [{change_set}] does not exist")))
    }

    async fn execute_change_set(
        &self,
        stack: &StackName,
        change_set: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let (cs, request) = state
            .change_sets
            .remove(&(stack.clone(), change_set.to_string()))
            .ok_or_else(|| ApiError::NotFound(format!("ChangeSet [{change_set}] does not exist")))?;
        if cs.status != ChangeSetStatus::CreateComplete {
            return Err(ApiError::Validation(format!(
                "ChangeSet [{change_set}] cannot be executed in its current status of [{:?}]",
                cs.status
            )));
        }

        let behavior = state.behavior(stack.as_str());
        let ready_at = self.latency(&behavior);
        state.record(SimOp::ExecuteChangeSet, stack.as_str());
        let sim = state
            .stacks
            .get_mut(stack)
            .ok_or_else(|| ApiError::NotFound(format!("Stack [{stack}] does not exist")))?;

        let (status, reason) = if behavior.fail_update {
            (
                StackStatus::UpdateRollbackComplete,
                Some("The following resource(s) failed to update: [Resource]".to_string()),
            )
        } else {
            sim.template = request.template_body;
            sim.stack.parameters = request.parameters;
            (StackStatus::UpdateComplete, None)
        };
        sim.stack.status = StackStatus::UpdateInProgress;
        sim.pending = Some(Pending {
            ready_at,
            status,
            reason,
        });
        Ok(())
    }

    async fn delete_change_set(
        &self,
        stack: &StackName,
        change_set: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state
            .change_sets
            .remove(&(stack.clone(), change_set.to_string()));
        state.record(SimOp::DeleteChangeSet, stack.as_str());
        Ok(())
    }

    async fn describe_stack_events(&self, name: &StackName) -> Result<Vec<StackEvent>, ApiError> {
        let mut state = self.state.lock();
        state.settle(name);
        let sim = state
            .stacks
            .get(name)
            .ok_or_else(|| ApiError::NotFound(format!("Stack [{name}] does not exist")))?;
        Ok(sim.events.iter().rev().cloned().collect())
    }

    async fn get_template(&self, name: &StackName) -> Result<String, ApiError> {
        let state = self.state.lock();
        state
            .live(name)
            .map(|s| s.template.clone())
            .ok_or_else(|| ApiError::NotFound(format!("Stack [{name}] does not exist")))
    }

    async fn list_stack_resources(
        &self,
        name: &StackName,
    ) -> Result<Vec<StackResource>, ApiError> {
        let mut state = self.state.lock();
        state.settle(name);
        state
            .live(name)
            .map(|s| s.stack.resources.clone())
            .ok_or_else(|| ApiError::NotFound(format!("Stack [{name}] does not exist")))
    }
}

#[async_trait]
impl AutoscalingApi for SimulatedCloud {
    async fn describe_auto_scaling_group(&self, name: &str) -> Result<AutoScalingGroup, ApiError> {
        let mut state = self.state.lock();
        state.settle_all();
        state
            .asgs
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("AutoScalingGroup {name} not found")))
    }

    async fn create_or_update_tags(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_transient(name) {
            return Err(err);
        }
        let asg = state
            .asgs
            .get_mut(name)
            .ok_or_else(|| ApiError::NotFound(format!("AutoScalingGroup {name} not found")))?;
        asg.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        state.record(SimOp::UpdateAsgTags, name);
        Ok(())
    }
}

#[async_trait]
impl AuditApi for SimulatedCloud {
    async fn lookup_events(&self, stack_id: &StackId) -> Result<Vec<AuditEvent>, ApiError> {
        let state = self.state.lock();
        let Some(name) = state
            .stacks
            .values()
            .find(|s| s.stack.id.as_ref() == Some(stack_id))
            .map(|s| s.stack.name.to_string())
        else {
            return Ok(Vec::new());
        };

        Ok(state
            .calls
            .iter()
            .filter(|c| c.target == name && c.op != SimOp::StackSettled)
            .enumerate()
            .map(|(i, c)| AuditEvent {
                event_id: format!("{stack_id}-{i}"),
                event_name: format!("{:?}", c.op),
                event_time: Utc::now(),
                username: Some("stackrun".to_string()),
            })
            .collect())
    }
}

#[async_trait]
impl OidcProvider for SimulatedCloud {
    fn issuer(&self) -> String {
        format!("https://oidc.sim.local/id/{}", self.cluster)
    }

    async fn exists(&self) -> Result<bool, ApiError> {
        Ok(self.state.lock().oidc_exists)
    }

    async fn delete(&self) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.oidc_exists = false;
        let issuer = self.issuer();
        state.record(SimOp::DeleteOidcProvider, issuer);
        Ok(())
    }
}

#[async_trait]
impl NodegroupApi for SimulatedCloud {
    async fn list_nodegroups(&self, _cluster: &str) -> Result<Vec<String>, ApiError> {
        let mut state = self.state.lock();
        state.settle_all();
        Ok(state.nodegroups.keys().cloned().collect())
    }

    async fn describe_nodegroup(&self, _cluster: &str, name: &str) -> Result<Nodegroup, ApiError> {
        let mut state = self.state.lock();
        state.settle_nodegroup(name);
        state
            .nodegroups
            .get(name)
            .map(|n| n.nodegroup.clone())
            .ok_or_else(|| ApiError::NotFound(format!("No node group found for name: {name}")))
    }

    async fn delete_nodegroup(&self, _cluster: &str, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_transient(name) {
            return Err(err);
        }
        state.settle_nodegroup(name);
        let behavior = state.behavior(name);
        let ready_at = self.latency(&behavior);
        let ng = state
            .nodegroups
            .get_mut(name)
            .ok_or_else(|| ApiError::NotFound(format!("No node group found for name: {name}")))?;
        if ng.delete_ready_at.is_none() {
            ng.nodegroup.status = NodegroupStatus::Deleting;
            ng.delete_ready_at = Some(ready_at);
        }
        state.record(SimOp::DeleteNodegroup, name);
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for SimulatedCloud {
    async fn bind_service_account(&self, binding: &ServiceAccountBinding) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let key = format!("{}/{}", binding.namespace, binding.name);
        state.bindings.insert(key.clone(), binding.clone());
        state.record(SimOp::BindServiceAccount, key);
        Ok(())
    }

    async fn unbind_service_account(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let key = format!("{namespace}/{name}");
        state.bindings.remove(&key);
        state.record(SimOp::UnbindServiceAccount, key);
        Ok(())
    }
}

/// Tags the engine puts on a nodegroup stack, handy when seeding.
pub fn nodegroup_stack_tags(cluster: &str, nodegroup: &str, kind: NodeGroupType) -> Vec<(String, String)> {
    vec![
        (tags::CLUSTER_NAME.to_string(), cluster.to_string()),
        (tags::NODEGROUP_NAME.to_string(), nodegroup.to_string()),
        (tags::NODEGROUP_TYPE.to_string(), kind.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackrun_core::StackDescription;

    fn request(name: &str) -> CreateStackRequest {
        CreateStackRequest {
            description: StackDescription::new(name, "{}"),
            tags: BTreeMap::new(),
            parameters: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_settles_after_latency() {
        let cloud = SimulatedCloud::new("dev").with_latency(Duration::from_secs(10));
        let name = StackName::new("s");
        cloud.create_stack(request("s")).await.unwrap();

        let stack = cloud.describe_stack(&name).await.unwrap();
        assert_eq!(stack.status, StackStatus::CreateInProgress);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let stack = cloud.describe_stack(&name).await.unwrap();
        assert_eq!(stack.status, StackStatus::CreateComplete);
        assert_eq!(cloud.count(SimOp::StackSettled, "s"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_stack_is_not_found() {
        let cloud = SimulatedCloud::new("dev").with_latency(Duration::from_secs(1));
        let name = StackName::new("s");
        cloud.seed_stack(Stack::new("s", StackStatus::CreateComplete), "{}");

        cloud.delete_stack(&name).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let err = cloud.describe_stack(&name).await.unwrap_err();
        assert!(err.is_not_found());
        // Deleting again is fine.
        cloud.delete_stack(&name).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_errors_are_consumed() {
        let cloud = SimulatedCloud::new("dev");
        cloud.behave("s", Behavior::throttled(1));

        assert!(cloud.create_stack(request("s")).await.unwrap_err().is_transient());
        assert!(cloud.create_stack(request("s")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_managed_nodegroup_stack_registers_nodegroup() {
        let cloud = SimulatedCloud::new("dev");
        let mut stack = Stack::new("stackrun-dev-nodegroup-ng", StackStatus::CreateComplete);
        for (k, v) in nodegroup_stack_tags("dev", "ng", NodeGroupType::Managed) {
            stack.tags.insert(k, v);
        }
        cloud.seed_stack(stack, "{}");

        let ng = cloud.describe_nodegroup("dev", "ng").await.unwrap();
        assert_eq!(ng.autoscaling_groups, vec!["ng-asg".to_string()]);
        assert!(cloud.auto_scaling_group("ng-asg").is_some());
    }
}
