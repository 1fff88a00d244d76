use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{Condition, ReplicaStatus};
use crate::kubernetes::JobKey;

/// Finalizer holding the job until every owned pod is gone.
pub const POD_CLEANUP_FINALIZER: &str = "training.operator.dev/pod-cleanup";

/// Role treated as the rendezvous coordinator.
pub const COORDINATOR_ROLE: &str = "master";

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "training.operator.dev",
    version = "v1alpha1",
    kind = "TrainingJob",
    namespaced,
    status = "TrainingJobStatus",
    shortname = "tj",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.conditions[-1:].type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct TrainingJobSpec {
    /// Replica groups, one per role
    #[serde(rename = "replicaSpecs")]
    pub replica_specs: Vec<ReplicaSpec>,

    /// What happens when a pod fails
    #[serde(rename = "restartPolicy", default)]
    pub restart_policy: RestartPolicy,

    #[serde(rename = "runPolicy", default)]
    pub run_policy: RunPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ReplicaSpec {
    /// Role name, e.g. master or worker
    pub role: String,

    /// Number of pods for this role
    pub replicas: i32,

    /// Restart budget for this role; overrides runPolicy.backoffLimit
    #[serde(rename = "maxRestarts", skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<i32>,

    pub template: PodTemplate,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct PodTemplate {
    /// Container image
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: ResourceRequirements,

    /// Training processes started inside each pod
    #[serde(rename = "procsPerReplica", skip_serializing_if = "Option::is_none")]
    pub procs_per_replica: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,

    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
pub enum RestartPolicy {
    #[default]
    OnFailure,
    Never,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct RunPolicy {
    /// Pods removed once the job is terminal
    #[serde(rename = "cleanPodPolicy", default)]
    pub clean_pod_policy: CleanPodPolicy,

    /// Default restart budget for roles without maxRestarts
    #[serde(rename = "backoffLimit", skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
pub enum CleanPodPolicy {
    All,
    #[default]
    Running,
    None,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct TrainingJobStatus {
    /// Condition history, oldest first
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(rename = "replicaStatuses", default)]
    pub replica_statuses: BTreeMap<String, ReplicaStatus>,

    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(rename = "completionTime", skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
}

impl TrainingJob {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// True once a Succeeded or Failed condition has been recorded.
    pub fn is_terminal(&self) -> bool {
        self.conditions()
            .iter()
            .any(|c| c.is_true() && c.condition_type.is_terminal())
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == POD_CLEANUP_FINALIZER)
    }

    /// Restart budget for a role, falling back to the job then controller default.
    pub fn restart_budget(&self, role: &str, default_limit: i32) -> i32 {
        if self.spec.restart_policy == RestartPolicy::Never {
            return 0;
        }
        self.spec
            .replica_specs
            .iter()
            .find(|r| r.role == role)
            .and_then(|r| r.max_restarts)
            .or(self.spec.run_policy.backoff_limit)
            .unwrap_or(default_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::common::{ConditionStatus, ConditionType};

    fn spec_with(max_restarts: Option<i32>, backoff_limit: Option<i32>) -> TrainingJobSpec {
        TrainingJobSpec {
            replica_specs: vec![ReplicaSpec {
                role: "worker".to_string(),
                replicas: 2,
                max_restarts,
                template: PodTemplate {
                    image: "pytorch/pytorch:2.3".to_string(),
                    ..Default::default()
                },
            }],
            restart_policy: RestartPolicy::OnFailure,
            run_policy: RunPolicy {
                backoff_limit,
                ..Default::default()
            },
        }
    }

    #[test]
    fn restart_budget_precedence() {
        let job = TrainingJob::new("a", spec_with(Some(5), Some(2)));
        assert_eq!(job.restart_budget("worker", 3), 5);

        let job = TrainingJob::new("a", spec_with(None, Some(2)));
        assert_eq!(job.restart_budget("worker", 3), 2);

        let job = TrainingJob::new("a", spec_with(None, None));
        assert_eq!(job.restart_budget("worker", 3), 3);

        let mut job = TrainingJob::new("a", spec_with(Some(5), None));
        job.spec.restart_policy = RestartPolicy::Never;
        assert_eq!(job.restart_budget("worker", 3), 0);
    }

    #[test]
    fn terminal_detection() {
        let mut job = TrainingJob::new("a", spec_with(None, None));
        assert!(!job.is_terminal());

        let now = Utc::now();
        job.status = Some(TrainingJobStatus {
            conditions: vec![
                Condition::new(ConditionType::Created, ConditionStatus::True, "PodsCreated", "", now),
                Condition::new(ConditionType::Failed, ConditionStatus::True, "InvalidSpec", "", now),
            ],
            ..Default::default()
        });
        assert!(job.is_terminal());
    }

    #[test]
    fn spec_deserializes_from_camel_case() {
        let raw = serde_json::json!({
            "replicaSpecs": [
                {"role": "master", "replicas": 1, "template": {"image": "trainer:1"}},
                {"role": "worker", "replicas": 2, "maxRestarts": 1,
                 "template": {"image": "trainer:1", "procsPerReplica": 4}}
            ],
            "runPolicy": {"cleanPodPolicy": "All"}
        });
        let spec: TrainingJobSpec = serde_json::from_value(raw).unwrap();
        assert_eq!(spec.replica_specs.len(), 2);
        assert_eq!(spec.restart_policy, RestartPolicy::OnFailure);
        assert_eq!(spec.run_policy.clean_pod_policy, CleanPodPolicy::All);
        assert_eq!(spec.replica_specs[1].template.procs_per_replica, Some(4));
    }
}
