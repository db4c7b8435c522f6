//! Stack and change-set naming conventions.

use chrono::Utc;
use regex::escape;

use stackrun_core::StackName;
/// Suffixes of stacks created by older releases, in reverse creation order.
/// Suffixes of stacks created by older releases, in creation order.
const DEPRECATED_STACK_SUFFIXES: [&str; 4] = ["DefaultNodeGroup", "ControlPlane", "ServiceRole", "VPC"];

/// Derives stack names for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    prefix: String,
    cluster: String,
}

impl Naming {
    pub fn new(prefix: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            cluster: cluster.into(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn stack(&self, suffix: &str) -> StackName {
        StackName::new(format!("{}-{}-{}", self.prefix, self.cluster, suffix))
    }

    pub fn cluster_stack(&self) -> StackName {
        self.stack("cluster")
    }

    pub fn nodegroup_stack(&self, nodegroup: &str) -> StackName {
        self.stack(&format!("nodegroup-{nodegroup}"))
    }

    pub fn iam_service_account_stack(&self, namespace: &str, name: &str) -> StackName {
        self.stack(&format!("addon-iamserviceaccount-{namespace}-{name}"))
    }

    pub fn addon_iam_stack(&self, addon: &str) -> StackName {
        self.stack(&format!("addon-{addon}"))
    }

    pub fn fargate_stack(&self) -> StackName {
        self.stack("fargate")
    }

    pub fn karpenter_stack(&self) -> StackName {
        self.stack("karpenter")
    }

    /// Legacy stacks, ordered so that deleting front to back is safe.
    pub fn deprecated_stacks(&self) -> Vec<StackName> {
        DEPRECATED_STACK_SUFFIXES
            .iter()
            .map(|suffix| self.stack(suffix))
            .collect()
    }

    /// Regex matching every stack of this cluster.
    pub fn cluster_stacks_pattern(&self) -> String {
        format!("^{}-{}-", escape(&self.prefix), escape(&self.cluster))
    }

    pub fn nodegroup_stacks_pattern(&self) -> String {
        format!("{}nodegroup-.+$", self.cluster_stacks_pattern())
    }

    pub fn iam_service_account_stacks_pattern(&self) -> String {
        format!("{}addon-iamserviceaccount-.+$", self.cluster_stacks_pattern())
    }

    /// Regex matching the cluster stack of any cluster using this prefix.
    pub fn any_cluster_stack_pattern(&self) -> String {
        format!("^{}-.+-cluster$", escape(&self.prefix))
    }

    /// Unique-per-second change set name, e.g. `stackrun-update-nodegroup-1700000000`.
    pub fn change_set(&self, action: &str) -> String {
        format!("{}-{}-{}", self.prefix, action, Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_stack_names() {
        let naming = Naming::new("stackrun", "dev");
        assert_eq!(naming.cluster_stack().as_str(), "stackrun-dev-cluster");
        assert_eq!(naming.nodegroup_stack("ng-1").as_str(), "stackrun-dev-nodegroup-ng-1");
        assert_eq!(
            naming.iam_service_account_stack("kube-system", "aws-node").as_str(),
            "stackrun-dev-addon-iamserviceaccount-kube-system-aws-node"
        );
        assert_eq!(naming.addon_iam_stack("vpc-cni").as_str(), "stackrun-dev-addon-vpc-cni");
    }

    #[test]
    fn test_patterns_match_only_their_role() {
        let naming = Naming::new("stackrun", "dev");
        let ng = Regex::new(&naming.nodegroup_stacks_pattern()).unwrap();
        assert!(ng.is_match("stackrun-dev-nodegroup-a"));
        assert!(!ng.is_match("stackrun-dev-cluster"));
        assert!(!ng.is_match("stackrun-prod-nodegroup-a"));

        let any = Regex::new(&naming.any_cluster_stack_pattern()).unwrap();
        assert!(any.is_match("stackrun-prod-cluster"));
        assert!(!any.is_match("stackrun-prod-nodegroup-x"));
    }

    #[test]
    fn test_change_set_name_carries_action() {
        let naming = Naming::new("stackrun", "dev");
        assert!(naming.change_set("update-nodegroup").starts_with("stackrun-update-nodegroup-"));
    }

    #[test]
    fn test_deprecated_stack_order() {
        let naming = Naming::new("stackrun", "dev");
        let names: Vec<String> = naming
            .deprecated_stacks()
            .into_iter()
            .map(StackName::into_inner)
            .collect();
        assert_eq!(names[0], "stackrun-dev-DefaultNodeGroup");
        assert_eq!(names[3], "stackrun-dev-VPC");
    }
}
