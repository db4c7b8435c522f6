//! Drives a single stack through create, update and delete, polling until
//! the provisioning API reports a terminal status.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stackrun_core::{
    tags, ChangeSet, ChangeSetStatus, Stack, StackDescription, StackError, StackId, StackName,
    StackStatus,
};

use crate::api::{ChangeSetRequest, CreateStackRequest, ProvisioningApi};
use crate::backoff::{poll_until, retry_transient, Backoff, PollStep, RetryPolicy};
use crate::config::EngineConfig;
use crate::inflight::{InFlightRegistry, Operation};
use crate::registry::StackRegistry;

/// Stack events attached to fatal errors.
const MAX_DIAGNOSTIC_EVENTS: usize = 10;

/// Options for updating a stack through a change set.
#[derive(Debug, Clone)]
pub struct UpdateStackOptions {
    pub stack_name: StackName,
    /// Generated from the action when absent.
    pub change_set_name: Option<String>,
    pub description: String,
    pub template_body: String,
    pub parameters: BTreeMap<String, String>,
    /// Wait for the update to reach a terminal status.
    pub wait: bool,
}

/// Result of an update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The change set was empty and has been discarded.
    Unchanged,
    /// The change set was executed; not waited for.
    Submitted,
    /// The change set was executed and the stack settled.
    Updated(Stack),
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing to delete.
    AlreadyAbsent,
    /// Delete request issued, not waited for.
    Requested,
    /// Stack is gone.
    Deleted,
}

/// Digest identifying a stack description and its parameters.
pub fn description_digest(
    description: &StackDescription,
    parameters: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.template_body.as_bytes());
    hasher.update(format!("{:?}", description.capabilities).as_bytes());
    for (k, v) in parameters {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Per-stack lifecycle driver.
#[derive(Clone)]
pub struct StackLifecycle {
    api: Arc<dyn ProvisioningApi>,
    registry: StackRegistry,
    inflight: Arc<InFlightRegistry>,
    poll: Backoff,
    retry: RetryPolicy,
    create_timeout: Duration,
    update_timeout: Duration,
    delete_timeout: Duration,
}

impl StackLifecycle {
    pub fn new(
        api: Arc<dyn ProvisioningApi>,
        registry: StackRegistry,
        inflight: Arc<InFlightRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            api,
            registry,
            inflight,
            poll: config.poll_backoff(),
            retry: config.retry_policy(),
            create_timeout: config.create_timeout(),
            update_timeout: config.update_timeout(),
            delete_timeout: config.delete_timeout(),
        }
    }

    pub fn registry(&self) -> &StackRegistry {
        &self.registry
    }

    pub fn delete_timeout(&self) -> Duration {
        self.delete_timeout
    }

    /// Create a stack and wait for it, unless an identical one already exists.
    pub async fn create(
        &self,
        description: StackDescription,
        tags: BTreeMap<String, String>,
        parameters: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Stack, StackError> {
        let name = description.name.clone();
        let _token = self.inflight.acquire(&name, Operation::Create)?;
        let digest = description_digest(&description, &parameters);

        if let Some(existing) = self.registry.describe_stack(&name).await? {
            if existing.status.is_transitional() {
                return Err(StackError::InProgress {
                    name: name.to_string(),
                    operation: existing.status.to_string(),
                });
            }
            if existing.status.is_stable() && existing.tag(tags::DESCRIPTION_DIGEST) == Some(digest.as_str())
            {
                info!(stack = %name, status = %existing.status, "Stack already exists, skipping create");
                return Ok(existing);
            }
            if existing.status.is_failure() {
                return Err(self.fatal(&existing).await);
            }
            return Err(StackError::AlreadyExists(name.to_string()));
        }

        let mut tags = tags;
        tags.insert(tags::DESCRIPTION_DIGEST.to_string(), digest);
        self.issue_create(description, tags, parameters).await?;
        self.wait_until_created(&name, cancel).await
    }

    /// Issue a create request without waiting for it to settle.
    pub async fn do_create_stack_request(
        &self,
        description: StackDescription,
        tags: BTreeMap<String, String>,
        parameters: BTreeMap<String, String>,
    ) -> Result<StackId, StackError> {
        let _token = self.inflight.acquire(&description.name, Operation::Create)?;
        let mut tags = tags;
        tags.insert(
            tags::DESCRIPTION_DIGEST.to_string(),
            description_digest(&description, &parameters),
        );
        self.issue_create(description, tags, parameters).await
    }

    async fn issue_create(
        &self,
        description: StackDescription,
        tags: BTreeMap<String, String>,
        parameters: BTreeMap<String, String>,
    ) -> Result<StackId, StackError> {
        if description.name.is_blank() {
            return Err(StackError::InvalidTree("stack name must not be empty".into()));
        }
        let name = description.name.clone();
        info!(stack = %name, capabilities = ?description.capabilities, "Creating stack");

        let request = CreateStackRequest {
            description,
            tags,
            parameters,
        };
        let id = retry_transient(&self.retry, "create_stack", || {
            self.api.create_stack(request.clone())
        })
        .await
        .map_err(|e| StackError::from_api(name.as_str(), e))?;

        debug!(stack = %name, stack_id = %id, "Create request accepted");
        Ok(id)
    }

    /// Wait for a create to settle and require `CREATE_COMPLETE`.
    pub async fn wait_until_created(
        &self,
        name: &StackName,
        cancel: &CancellationToken,
    ) -> Result<Stack, StackError> {
        let stack = self
            .wait_until_terminal(name, self.create_timeout, cancel)
            .await?;
        if stack.status == StackStatus::CreateComplete {
            info!(stack = %name, "Stack created");
            Ok(stack)
        } else {
            Err(self.fatal(&stack).await)
        }
    }

    /// Poll until the stack reaches a terminal status.
    ///
    /// Returns `StackError::Timeout` when the deadline passes and
    /// `StackError::NotFound` if the stack disappears.
    pub async fn wait_until_terminal(
        &self,
        name: &StackName,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Stack, StackError> {
        poll_until(&self.poll, timeout, cancel, name.as_str(), || async move {
            match self.api.describe_stack(name).await {
                Ok(stack) if stack.status.is_terminal() => Ok(PollStep::Ready(stack)),
                Ok(stack) => {
                    debug!(stack = %name, status = %stack.status, "Waiting for terminal status");
                    Ok(PollStep::Pending)
                }
                Err(e) if e.is_not_found() => Err(StackError::NotFound(name.to_string())),
                Err(e) if e.is_transient() => {
                    warn!(stack = %name, error = %e, "Transient error while polling");
                    Ok(PollStep::Pending)
                }
                Err(e) => Err(StackError::from_api(name.as_str(), e)),
            }
        })
        .await
    }

    /// Update a stack through a change set. An empty diff is a no-op.
    pub async fn update(
        &self,
        options: UpdateStackOptions,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, StackError> {
        let name = options.stack_name.clone();
        let _token = self.inflight.acquire(&name, Operation::Update)?;

        let existing = self
            .registry
            .describe_stack(&name)
            .await?
            .ok_or_else(|| StackError::NotFound(name.to_string()))?;
        if existing.status.is_transitional() {
            return Err(StackError::InProgress {
                name: name.to_string(),
                operation: existing.status.to_string(),
            });
        }

        let change_set_name = options
            .change_set_name
            .clone()
            .unwrap_or_else(|| self.registry.naming().change_set("update"));
        let request = ChangeSetRequest {
            stack_name: name.clone(),
            change_set_name: change_set_name.clone(),
            description: options.description.clone(),
            template_body: options.template_body.clone(),
            parameters: options.parameters.clone(),
        };
        info!(stack = %name, change_set = %change_set_name, "Creating change set");
        retry_transient(&self.retry, "create_change_set", || {
            self.api.create_change_set(request.clone())
        })
        .await
        .map_err(|e| StackError::from_api(name.as_str(), e))?;

        let change_set = self
            .wait_for_change_set(&name, &change_set_name, cancel)
            .await?;

        if change_set.is_empty() {
            info!(stack = %name, change_set = %change_set_name, "No changes, discarding change set");
            if let Err(e) = self.api.delete_change_set(&name, &change_set_name).await {
                warn!(stack = %name, error = %e, "Failed to discard empty change set");
            }
            return Ok(UpdateOutcome::Unchanged);
        }
        if change_set.status == ChangeSetStatus::Failed {
            return Err(StackError::Fatal {
                name: name.to_string(),
                status: Some(existing.status),
                reason: change_set.status_reason,
                events: Vec::new(),
            });
        }

        retry_transient(&self.retry, "execute_change_set", || {
            self.api.execute_change_set(&name, &change_set_name)
        })
        .await
        .map_err(|e| StackError::from_api(name.as_str(), e))?;

        if !options.wait {
            return Ok(UpdateOutcome::Submitted);
        }

        let stack = self
            .wait_until_terminal(&name, self.update_timeout, cancel)
            .await?;
        if stack.status == StackStatus::UpdateComplete {
            info!(stack = %name, "Stack updated");
            Ok(UpdateOutcome::Updated(stack))
        } else {
            Err(self.fatal(&stack).await)
        }
    }

    pub async fn describe_change_set(
        &self,
        stack: &StackName,
        change_set: &str,
    ) -> Result<ChangeSet, StackError> {
        self.api
            .describe_change_set(stack, change_set)
            .await
            .map_err(|e| StackError::from_api(stack.as_str(), e))
    }

    async fn wait_for_change_set(
        &self,
        stack: &StackName,
        change_set: &str,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet, StackError> {
        poll_until(&self.poll, self.update_timeout, cancel, change_set, || async move {
            match self.api.describe_change_set(stack, change_set).await {
                Ok(cs) if cs.status.is_terminal() => Ok(PollStep::Ready(cs)),
                Ok(_) => Ok(PollStep::Pending),
                Err(e) if e.is_transient() => Ok(PollStep::Pending),
                Err(e) => Err(StackError::from_api(stack.as_str(), e)),
            }
        })
        .await
    }

    /// Issue a delete without waiting. An absent stack is success.
    pub async fn delete_async(&self, name: &StackName) -> Result<DeleteOutcome, StackError> {
        let Some(existing) = self.registry.describe_stack(name).await? else {
            debug!(stack = %name, "Stack already absent");
            return Ok(DeleteOutcome::AlreadyAbsent);
        };
        if existing.status == StackStatus::DeleteInProgress {
            return Ok(DeleteOutcome::Requested);
        }

        info!(stack = %name, status = %existing.status, "Deleting stack");
        match retry_transient(&self.retry, "delete_stack", || self.api.delete_stack(name)).await {
            Ok(()) => Ok(DeleteOutcome::Requested),
            Err(e) if e.is_not_found() => Ok(DeleteOutcome::AlreadyAbsent),
            Err(e) => {
                warn!(stack = %name, error = %e, "Delete request failed");
                match self.registry.describe_stack(name).await {
                    Ok(Some(stack)) => {
                        let reason = format!("delete request failed: {e}");
                        Err(self.fatal_with_reason(&stack, Some(reason)).await)
                    }
                    _ => Err(StackError::from_api(name.as_str(), e)),
                }
            }
        }
    }

    /// Delete a stack and wait until it is gone.
    pub async fn delete(
        &self,
        name: &StackName,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome, StackError> {
        self.delete_sync(name, self.delete_timeout, cancel)
            .await
    }

    /// Delete a stack and wait at most `timeout` for it to disappear.
    pub async fn delete_sync(
        &self,
        name: &StackName,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<DeleteOutcome, StackError> {
        let _token = self.inflight.acquire(name, Operation::Delete)?;

        if self.delete_async(name).await? == DeleteOutcome::AlreadyAbsent {
            return Ok(DeleteOutcome::AlreadyAbsent);
        }

        match self.wait_until_terminal(name, timeout, cancel).await {
            Err(StackError::NotFound(_)) => {
                info!(stack = %name, "Stack deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Ok(stack) if stack.status == StackStatus::DeleteComplete => {
                info!(stack = %name, "Stack deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Ok(stack) => Err(self.fatal(&stack).await),
            Err(e) => Err(e),
        }
    }

    /// Build a fatal error for a stack in a failed terminal status, attaching
    /// recent stack events. Audit events are only logged.
    async fn fatal(&self, stack: &Stack) -> StackError {
        self.fatal_with_reason(stack, stack.status_reason.clone())
            .await
    }

    async fn fatal_with_reason(&self, stack: &Stack, reason: Option<String>) -> StackError {
        let events = match self.registry.describe_stack_events(&stack.name).await {
            Ok(mut events) => {
                events.truncate(MAX_DIAGNOSTIC_EVENTS);
                events
            }
            Err(e) => {
                warn!(stack = %stack.name, error = %e, "Failed to fetch stack events");
                Vec::new()
            }
        };

        let audit = self.registry.lookup_audit_events(stack).await;
        if let Some(last) = audit.last() {
            info!(
                stack = %stack.name,
                audit_events = audit.len(),
                last_event = %last.event_name,
                "Audit trail for failed stack"
            );
        }

        error!(
            stack = %stack.name,
            status = %stack.status,
            reason = reason.as_deref().unwrap_or(""),
            "Stack operation failed"
        );
        StackError::Fatal {
            name: stack.name.to_string(),
            status: Some(stack.status),
            reason,
            events,
        }
    }
}
