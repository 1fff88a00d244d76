use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tracing::{debug, info};

use super::Action;
use crate::crd::{TrainingJob, POD_CLEANUP_FINALIZER};
use crate::kubernetes::{ClusterApi, JobKey, ManagedPod};
use crate::metrics::GC_DELETIONS_TOTAL;
use crate::{Error, Result};

/// Poll interval while owned pods are still terminating.
const FINALIZE_RECHECK: Duration = Duration::from_secs(2);

/// Cascading pod cleanup for deleted jobs.
pub struct GarbageCollector {
    cluster: Arc<dyn ClusterApi>,
}

impl GarbageCollector {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Deletes one pod, treating an absent or already-replaced pod as done.
    pub async fn delete_pod(&self, pod: &ManagedPod) -> Result<bool> {
        match self
            .cluster
            .delete_pod(&pod.namespace, &pod.name, Some(pod.uid.clone()))
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) | Err(Error::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes every pod carrying an ownership reference to `key`, except
    /// those owned by the incarnation with uid `keep`. Returns how many such
    /// pods still exist afterwards.
    pub async fn collect(&self, key: &JobKey, keep: Option<&str>) -> Result<usize> {
        let orphaned = |pod: &ManagedPod| keep.map_or(true, |uid| pod.owner.uid != uid);

        let pods = self.cluster.list_pods(key).await?;
        let mut deleted = 0;
        for pod in pods.iter().filter(|p| orphaned(p)) {
            if self.delete_pod(pod).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            GC_DELETIONS_TOTAL.inc_by(deleted);
            info!(job = %key, deleted, "garbage collected pods");
        }

        let remaining = self
            .cluster
            .list_pods(key)
            .await?
            .iter()
            .filter(|p| orphaned(p))
            .count();
        Ok(remaining)
    }

    /// Deletion path for a job carrying a deletion timestamp: remove its pods,
    /// then release the finalizer once none remain.
    pub async fn finalize(&self, job: &TrainingJob) -> Result<Action> {
        let key = job.key();
        if !job.has_finalizer() {
            return Ok(Action::AwaitChange);
        }

        let remaining = self.collect(&key, None).await?;
        if remaining > 0 {
            debug!(job = %key, remaining, "waiting for owned pods to terminate");
            return Ok(Action::Requeue(FINALIZE_RECHECK));
        }

        let finalizers: Vec<String> = job
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != POD_CLEANUP_FINALIZER)
            .cloned()
            .collect();
        self.cluster.set_finalizers(job, finalizers).await?;
        info!("Released finalizer for TrainingJob: {}", key);
        Ok(Action::AwaitChange)
    }
}
