//! Boundary to the cluster API server.
//!
//! Everything the controller writes goes through [`ClusterApi`]. The trait is
//! implemented by [`KubeCluster`] for a real API server and by
//! [`InMemoryCluster`] for tests and standalone runs.

mod client;
mod memory;
mod resources;

pub use client::KubeCluster;
pub use memory::{InMemoryCluster, OperationCounts};
pub use resources::{
    JobKey, ManagedPod, OwnerReference, PodPhase, ATTEMPT_ANNOTATION, INDEX_LABEL, JOB_NAME_LABEL,
    MANAGED_BY_LABEL, MANAGED_BY_VALUE, ROLE_LABEL,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(test)]
use mockall::automock;

use crate::crd::TrainingJob;
use crate::topology::DesiredPod;
use crate::Result;

/// A change observed on the backing store, in the shape a kube watcher reports it.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    JobApplied(TrainingJob),
    JobDeleted(TrainingJob),
    /// Full re-list of jobs; anything absent from it is gone
    JobsRestarted(Vec<TrainingJob>),
    PodApplied(ManagedPod),
    PodDeleted(ManagedPod),
    PodsRestarted(Vec<ManagedPod>),
}

/// Read/write access to jobs and pods on the authoritative backing store.
///
/// Writes are optimistic: `replace_status` and `set_finalizers` carry the
/// job's resource version and fail with `Error::Conflict` when it is stale.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Authoritative read, bypassing any cache.
    async fn get_job(&self, key: &JobKey) -> Result<Option<TrainingJob>>;

    async fn create_job(&self, job: TrainingJob) -> Result<TrainingJob>;

    /// Requests deletion. Returns false when the job was already absent.
    async fn delete_job(&self, key: &JobKey) -> Result<bool>;

    async fn replace_status(&self, job: &TrainingJob) -> Result<TrainingJob>;

    async fn set_finalizers(&self, job: &TrainingJob, finalizers: Vec<String>) -> Result<TrainingJob>;

    /// Pods carrying an ownership reference to the job.
    async fn list_pods(&self, owner: &JobKey) -> Result<Vec<ManagedPod>>;

    async fn create_pod(
        &self,
        pod: &DesiredPod,
        owner: &OwnerReference,
        attempt: u32,
    ) -> Result<ManagedPod>;

    /// Deletes a pod, only if its UID still matches when one is given.
    async fn delete_pod(&self, namespace: &str, name: &str, uid: Option<String>) -> Result<()>;

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<String>>>;

    /// Infinite stream of changes, starting with a full listing.
    fn watch(&self) -> BoxStream<'static, ClusterEvent>;
}
