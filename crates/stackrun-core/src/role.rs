//! Logical roles a stack can play inside a cluster.

use crate::{NodeGroupType, Stack};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag keys written on every stack the engine creates.
pub mod tags {
    pub const CLUSTER_NAME: &str = "stackrun.io/cluster-name";
    pub const NODEGROUP_NAME: &str = "stackrun.io/nodegroup-name";
    pub const NODEGROUP_TYPE: &str = "stackrun.io/nodegroup-type";
    pub const IAM_SERVICE_ACCOUNT_NAME: &str = "stackrun.io/iamserviceaccount-name";
    pub const ADDON_NAME: &str = "stackrun.io/addon-name";
    pub const DESCRIPTION_DIGEST: &str = "stackrun.io/description-digest";
}

/// Role of a stack, derived from its tags and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum StackRole {
    Cluster,
    NodeGroup {
        name: String,
        node_group_type: NodeGroupType,
    },
    IamServiceAccount {
        namespace: String,
        name: String,
    },
    AddonIam {
        addon: String,
    },
    Fargate,
    Karpenter,
    Unknown,
}

impl StackRole {
    /// Classify a stack. Tags win over naming conventions.
    pub fn classify(stack: &Stack) -> Self {
        if let Some(ng) = stack.tag(tags::NODEGROUP_NAME) {
            let node_group_type = stack
                .tag(tags::NODEGROUP_TYPE)
                .and_then(|t| t.parse().ok())
                .unwrap_or_default();
            return Self::NodeGroup {
                name: ng.to_string(),
                node_group_type,
            };
        }

        if let Some(sa) = stack.tag(tags::IAM_SERVICE_ACCOUNT_NAME) {
            let (namespace, name) = sa.split_once('/').unwrap_or(("default", sa));
            return Self::IamServiceAccount {
                namespace: namespace.to_string(),
                name: name.to_string(),
            };
        }

        if let Some(addon) = stack.tag(tags::ADDON_NAME) {
            return Self::AddonIam {
                addon: addon.to_string(),
            };
        }

        let name = stack.name.as_str();
        if name.ends_with("-cluster") {
            Self::Cluster
        } else if name.ends_with("-fargate") {
            Self::Fargate
        } else if name.ends_with("-karpenter") {
            Self::Karpenter
        } else {
            Self::Unknown
        }
    }

    /// Nodegroup name for nodegroup stacks.
    pub fn node_group_name(&self) -> Option<&str> {
        match self {
            Self::NodeGroup { name, .. } => Some(name),
            _ => None,
        }
    }

    /// `namespace/name` for IAM service-account stacks.
    pub fn service_account(&self) -> Option<String> {
        match self {
            Self::IamServiceAccount { namespace, name } => Some(format!("{namespace}/{name}")),
            _ => None,
        }
    }

    /// Addon name for addon IAM stacks.
    pub fn addon_name(&self) -> Option<&str> {
        match self {
            Self::AddonIam { addon } => Some(addon),
            _ => None,
        }
    }

    /// Short label, useful in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::NodeGroup { .. } => "nodegroup",
            Self::IamServiceAccount { .. } => "iamserviceaccount",
            Self::AddonIam { .. } => "addon-iam",
            Self::Fargate => "fargate",
            Self::Karpenter => "karpenter",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StackRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeGroup { name, .. } => write!(f, "nodegroup {name}"),
            Self::IamServiceAccount { namespace, name } => {
                write!(f, "iamserviceaccount {namespace}/{name}")
            }
            Self::AddonIam { addon } => write!(f, "addon-iam {addon}"),
            other => f.write_str(other.kind()),
        }
    }
}
