//! Autoscaling group helpers for nodegroups.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use stackrun_core::{ApiError, StackError};

use crate::api::AutoscalingApi;
use crate::backoff::{retry_transient, RetryPolicy};

/// Upper bound of tags accepted by one `create_or_update_tags` call.
pub const MAX_TAGS_PER_REQUEST: usize = 25;

/// Capacity settings of an autoscaling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub desired: u32,
    pub min: u32,
    pub max: u32,
}

/// Autoscaling calls used by nodegroup tasks.
#[derive(Clone)]
pub struct AutoscalingGroups {
    api: Arc<dyn AutoscalingApi>,
    retry: RetryPolicy,
}

impl AutoscalingGroups {
    pub fn new(api: Arc<dyn AutoscalingApi>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    pub async fn get_autoscaling_group_desired_capacity(
        &self,
        name: &str,
    ) -> Result<Capacity, StackError> {
        let asg = retry_transient(&self.retry, "describe_auto_scaling_group", || {
            self.api.describe_auto_scaling_group(name)
        })
        .await
        .map_err(|e| StackError::from_api(name, e))?;

        Ok(Capacity {
            desired: asg.desired_capacity,
            min: asg.min_size,
            max: asg.max_size,
        })
    }

    /// Copy nodegroup tags onto its autoscaling groups.
    ///
    /// Keys already present on a group are left alone. Each group is tried
    /// even if an earlier one failed; all failures are reported together.
    pub async fn propagate_managed_nodegroup_tags_to_asg(
        &self,
        nodegroup: &str,
        tags: &BTreeMap<String, String>,
        asg_names: &[String],
    ) -> Result<(), StackError> {
        let mut failures = Vec::new();

        for asg_name in asg_names {
            if let Err(e) = self.propagate_to_one(asg_name, tags).await {
                warn!(nodegroup = %nodegroup, asg = %asg_name, error = %e, "Failed to propagate tags");
                failures.push(format!("{asg_name}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StackError::Api {
                name: nodegroup.to_string(),
                source: ApiError::Other(format!(
                    "failed to propagate tags to autoscaling groups: {}",
                    failures.join("; ")
                )),
            })
        }
    }

    async fn propagate_to_one(
        &self,
        asg_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let asg = retry_transient(&self.retry, "describe_auto_scaling_group", || {
            self.api.describe_auto_scaling_group(asg_name)
        })
        .await?;

        let missing: Vec<(&String, &String)> = tags
            .iter()
            .filter(|(k, _)| !asg.tags.contains_key(*k))
            .collect();
        if missing.is_empty() {
            debug!(asg = %asg_name, "All tags already present");
            return Ok(());
        }

        for chunk in missing.chunks(MAX_TAGS_PER_REQUEST) {
            let batch: BTreeMap<String, String> = chunk
                .iter()
                .map(|(k, v)| ((*k).clone(), (*v).clone()))
                .collect();
            retry_transient(&self.retry, "create_or_update_tags", || {
                self.api.create_or_update_tags(asg_name, &batch)
            })
            .await?;
        }

        info!(asg = %asg_name, count = missing.len(), "Propagated nodegroup tags");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AutoScalingGroup;
    use crate::backoff::Backoff;
    use crate::sim::{SimOp, SimulatedCloud};
    use std::time::Duration;

    fn groups(cloud: &Arc<SimulatedCloud>) -> AutoscalingGroups {
        AutoscalingGroups::new(
            cloud.clone(),
            RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::constant(Duration::from_millis(10)),
            },
        )
    }

    fn asg(name: &str, tags: &[(&str, &str)]) -> AutoScalingGroup {
        AutoScalingGroup {
            name: name.to_string(),
            desired_capacity: 3,
            min_size: 1,
            max_size: 5,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tags_are_sent_in_batches() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        cloud.add_auto_scaling_group(asg("asg-1", &[]));

        let tags: BTreeMap<String, String> = (0..60)
            .map(|i| (format!("key-{i:02}"), "v".to_string()))
            .collect();
        groups(&cloud)
            .propagate_managed_nodegroup_tags_to_asg("ng", &tags, &["asg-1".to_string()])
            .await
            .unwrap();

        assert_eq!(cloud.count(SimOp::UpdateAsgTags, "asg-1"), 3);
        assert_eq!(cloud.auto_scaling_group("asg-1").unwrap().tags.len(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_tags_are_skipped() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        cloud.add_auto_scaling_group(asg("asg-1", &[("team", "platform")]));

        let tags = BTreeMap::from([("team".to_string(), "other".to_string())]);
        groups(&cloud)
            .propagate_managed_nodegroup_tags_to_asg("ng", &tags, &["asg-1".to_string()])
            .await
            .unwrap();

        assert_eq!(cloud.count(SimOp::UpdateAsgTags, "asg-1"), 0);
        assert_eq!(
            cloud.auto_scaling_group("asg-1").unwrap().tags["team"],
            "platform"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_aggregated_across_groups() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        cloud.add_auto_scaling_group(asg("asg-2", &[]));

        let tags = BTreeMap::from([("team".to_string(), "a".to_string())]);
        let err = groups(&cloud)
            .propagate_managed_nodegroup_tags_to_asg(
                "ng",
                &tags,
                &["missing".to_string(), "asg-2".to_string()],
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("missing"));
        assert_eq!(cloud.count(SimOp::UpdateAsgTags, "asg-2"), 1);
    }

    #[tokio::test]
    async fn test_desired_capacity() {
        let cloud = Arc::new(SimulatedCloud::new("dev"));
        cloud.add_auto_scaling_group(asg("asg-1", &[]));

        let capacity = groups(&cloud)
            .get_autoscaling_group_desired_capacity("asg-1")
            .await
            .unwrap();
        assert_eq!(
            capacity,
            Capacity {
                desired: 3,
                min: 1,
                max: 5
            }
        );
    }
}
