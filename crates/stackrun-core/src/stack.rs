//! Stack, change set and event types.

use crate::{ChangeSetStatus, NodeGroupType, StackId, StackName, StackStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource type of an autoscaling group inside a stack.
pub const AUTOSCALING_GROUP_RESOURCE_TYPE: &str = "AWS::AutoScaling::AutoScalingGroup";

/// A remotely provisioned group of resources tracked as one lifecycle unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    /// Stack name.
    pub name: StackName,

    /// Identifier assigned by the provisioning API.
    pub id: Option<StackId>,

    /// Last observed status.
    pub status: StackStatus,

    /// Reason attached to the last status change, if any.
    pub status_reason: Option<String>,

    /// Human-readable description.
    pub description: Option<String>,

    /// Stack tags.
    pub tags: BTreeMap<String, String>,

    /// Input parameters.
    pub parameters: BTreeMap<String, String>,

    /// Stack outputs.
    pub outputs: BTreeMap<String, String>,

    /// Resources owned by the stack.
    pub resources: Vec<StackResource>,

    /// When the stack was created.
    pub created_at: DateTime<Utc>,

    /// When the stack last changed status.
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl Stack {
    /// Create a new Stack handle with the given status.
    pub fn new(name: impl Into<StackName>, status: StackStatus) -> Self {
        Self {
            name: name.into(),
            id: None,
            status,
            status_reason: None,
            description: None,
            tags: BTreeMap::new(),
            parameters: BTreeMap::new(),
            outputs: BTreeMap::new(),
            resources: Vec::new(),
            created_at: Utc::now(),
            last_updated_at: None,
        }
    }

    /// Builder method to set the id.
    pub fn with_id(mut self, id: StackId) -> Self {
        self.id = Some(id);
        self
    }

    /// Builder method to add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder method to add a resource.
    pub fn with_resource(mut self, resource: StackResource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Look up a tag value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Physical ids of all resources of the given type.
    pub fn physical_ids_of(&self, resource_type: &str) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .filter_map(|r| r.physical_id.as_deref())
            .collect()
    }
}

/// A single resource inside a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackResource {
    pub logical_id: String,
    pub physical_id: Option<String>,
    pub resource_type: String,
    pub status: Option<String>,
}

impl StackResource {
    pub fn new(logical_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            physical_id: None,
            resource_type: resource_type.into(),
            status: None,
        }
    }

    /// Builder method to set the physical id.
    pub fn with_physical_id(mut self, id: impl Into<String>) -> Self {
        self.physical_id = Some(id.into());
        self
    }
}

/// A stack that backs a nodegroup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupStack {
    pub stack: Stack,
    pub node_group_name: String,
    pub node_group_type: NodeGroupType,
}

/// Read-only snapshot of a stack together with its resources and template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackInfo {
    pub stack: Stack,
    pub resources: Vec<StackResource>,
    pub template: String,
}

/// IAM capabilities the provisioning API must be allowed to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capabilities {
    #[default]
    None,
    Iam,
    NamedIam,
}

/// Everything needed to issue a create request for one stack.
///
/// The template body is opaque: it is produced elsewhere and only passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDescription {
    pub name: StackName,
    pub template_body: String,
    pub capabilities: Capabilities,
}

impl StackDescription {
    pub fn new(name: impl Into<StackName>, template_body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template_body: template_body.into(),
            capabilities: Capabilities::None,
        }
    }

    /// Builder method to set capabilities.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A named, previewed diff against an existing stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub name: String,
    pub stack_name: StackName,
    pub status: ChangeSetStatus,
    pub status_reason: Option<String>,
    pub changes: Vec<ResourceChange>,
}

impl ChangeSet {
    /// Returns true if the computed diff contains no changes.
    ///
    /// A failed change set whose reason says nothing changed counts as empty.
    pub fn is_empty(&self) -> bool {
        match self.status {
            ChangeSetStatus::Failed => self
                .status_reason
                .as_deref()
                .map(|r| {
                    let r = r.to_ascii_lowercase();
                    r.contains("didn't contain changes") || r.contains("no updates")
                })
                .unwrap_or(false),
            _ => self.changes.is_empty(),
        }
    }
}

/// A single resource-level change in a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub action: String,
    pub logical_id: String,
    pub resource_type: String,
}

/// A timestamped status change of one resource in a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEvent {
    pub timestamp: DateTime<Utc>,
    pub logical_id: String,
    pub resource_type: String,
    pub status: String,
    pub reason: Option<String>,
}

/// An audit-trail entry associated with a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub event_name: String,
    pub event_time: DateTime<Utc>,
    pub username: Option<String>,
}
