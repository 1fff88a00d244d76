use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::crd::TrainingJob;
use crate::{Error, Result};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "trainjob-operator";
pub const JOB_NAME_LABEL: &str = "training.operator.dev/job-name";
pub const ROLE_LABEL: &str = "training.operator.dev/replica-role";
pub const INDEX_LABEL: &str = "training.operator.dev/replica-index";
pub const ATTEMPT_ANNOTATION: &str = "training.operator.dev/restart-attempt";

/// Identity of a TrainingJob: the work queue key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Back-reference from a pod to the job that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerReference {
    pub fn for_job(job: &TrainingJob) -> Result<Self> {
        let uid = job
            .uid()
            .ok_or_else(|| Error::Internal(format!("job {} has no uid", job.key())))?;
        Ok(Self {
            api_version: "training.operator.dev/v1alpha1".to_string(),
            kind: "TrainingJob".to_string(),
            name: job.name_any(),
            uid,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn is_active(self) -> bool {
        matches!(self, PodPhase::Pending | PodPhase::Running | PodPhase::Unknown)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<&str> for PodPhase {
    fn from(s: &str) -> Self {
        match s {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// A pod created by the controller for one `(role, index)` slot of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedPod {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub owner: OwnerReference,
    pub role: String,
    pub index: i32,
    pub phase: PodPhase,
    /// Recreations of this slot before this pod
    pub restart_count: u32,
    pub resource_version: Option<String>,
}

impl ManagedPod {
    pub fn owner_key(&self) -> JobKey {
        JobKey::new(&self.namespace, &self.owner.name)
    }

    /// Reads the controller's labels, owner reference and attempt annotation off a pod.
    /// Pods missing any of them are not ours and yield `None`.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let labels = pod.labels();
        let role = labels.get(ROLE_LABEL)?.clone();
        let index = labels.get(INDEX_LABEL)?.parse().ok()?;
        let owner = pod
            .owner_references()
            .iter()
            .find(|o| o.kind == "TrainingJob" && o.controller == Some(true))?;
        let restart_count = pod
            .annotations()
            .get(ATTEMPT_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(PodPhase::from)
            .unwrap_or(PodPhase::Pending);

        Some(Self {
            name: pod.name_any(),
            namespace: pod.namespace().unwrap_or_default(),
            uid: pod.uid().unwrap_or_default(),
            owner: OwnerReference {
                api_version: owner.api_version.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
            },
            role,
            index,
            phase,
            restart_count,
            resource_version: pod.resource_version(),
        })
    }
}
