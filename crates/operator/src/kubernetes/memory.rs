use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ClusterApi, ClusterEvent, JobKey, ManagedPod, OwnerReference, PodPhase};
use crate::crd::TrainingJob;
use crate::topology::DesiredPod;
use crate::{Error, Result};

const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Mutating calls served so far, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub pods_created: u64,
    pub pods_deleted: u64,
    pub status_updates: u64,
    pub finalizer_updates: u64,
}

impl OperationCounts {
    pub fn pod_mutations(&self) -> u64 {
        self.pods_created + self.pods_deleted
    }
}

type PodId = (String, String);

#[derive(Default)]
struct ClusterState {
    jobs: BTreeMap<JobKey, TrainingJob>,
    pods: BTreeMap<PodId, ManagedPod>,
    logs: HashMap<PodId, Vec<String>>,
    next_version: u64,
    ops: OperationCounts,
    injected_conflicts: u32,
    injected_outages: u32,
}

impl ClusterState {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

struct Shared {
    state: Mutex<ClusterState>,
    events: broadcast::Sender<ClusterEvent>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publishes while the state lock is held so watchers see writes in order.
    fn publish(&self, event: ClusterEvent) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.events.send(event);
        self.changed.notify_waiters();
    }

    fn relist(&self) -> Vec<ClusterEvent> {
        let state = self.lock();
        vec![
            ClusterEvent::JobsRestarted(state.jobs.values().cloned().collect()),
            ClusterEvent::PodsRestarted(state.pods.values().cloned().collect()),
        ]
    }
}

/// Authoritative in-process cluster: jobs, pods and pod logs behind one lock.
///
/// Behaves like an API server for the parts the controller relies on:
/// monotonically increasing resource versions, optimistic concurrency on
/// status and finalizer writes, finalizer-gated job deletion and UID
/// preconditions on pod deletion. Pod phases and log lines are driven by the
/// caller through the `set_pod_phase` and `append_log` helpers.
#[derive(Clone)]
pub struct InMemoryCluster {
    shared: Arc<Shared>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }

    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ClusterState::default()),
                events,
                changed: Notify::new(),
            }),
        }
    }

    pub fn job(&self, key: &JobKey) -> Option<TrainingJob> {
        self.shared.lock().jobs.get(key).cloned()
    }

    pub fn pods_owned_by(&self, key: &JobKey) -> Vec<ManagedPod> {
        self.shared
            .lock()
            .pods
            .values()
            .filter(|p| p.owner_key() == *key)
            .cloned()
            .collect()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<ManagedPod> {
        self.shared
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn operations(&self) -> OperationCounts {
        self.shared.lock().ops
    }

    /// Makes the next `count` status writes fail as if another writer won.
    pub fn inject_status_conflicts(&self, count: u32) {
        self.shared.lock().injected_conflicts = count;
    }

    /// Makes the next `count` API calls fail as unavailable.
    pub fn inject_outages(&self, count: u32) {
        self.shared.lock().injected_outages = count;
    }

    /// Reports a new phase for a pod, as the kubelet would.
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: PodPhase) -> Result<()> {
        let mut state = self.shared.lock();
        let version = state.bump_version();
        let pod = state
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| Error::NotFound(format!("pod {}/{}", namespace, name)))?;
        pod.phase = phase;
        pod.resource_version = Some(version);
        let event = ClusterEvent::PodApplied(pod.clone());
        self.shared.publish(event);
        Ok(())
    }

    pub fn append_log(&self, namespace: &str, name: &str, line: impl Into<String>) -> Result<()> {
        let mut state = self.shared.lock();
        let id = (namespace.to_string(), name.to_string());
        if !state.pods.contains_key(&id) {
            return Err(Error::NotFound(format!("pod {}/{}", namespace, name)));
        }
        state.logs.entry(id).or_default().push(line.into());
        self.shared.changed.notify_waiters();
        Ok(())
    }

    fn check_available(state: &mut ClusterState) -> Result<()> {
        if state.injected_outages > 0 {
            state.injected_outages -= 1;
            return Err(Error::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }

    fn check_version(state: &mut ClusterState, job: &TrainingJob) -> Result<JobKey> {
        let key = job.key();
        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            return Err(Error::Conflict(format!("{}: injected conflict", key)));
        }
        let stored = state
            .jobs
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("trainingjob {}", key)))?;
        if stored.metadata.resource_version != job.metadata.resource_version {
            return Err(Error::Conflict(format!(
                "{}: resource version {:?} is stale (current {:?})",
                key, job.metadata.resource_version, stored.metadata.resource_version
            )));
        }
        Ok(key)
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_job(&self, key: &JobKey) -> Result<Option<TrainingJob>> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        Ok(state.jobs.get(key).cloned())
    }

    async fn create_job(&self, mut job: TrainingJob) -> Result<TrainingJob> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        let key = job.key();
        if key.name.is_empty() {
            return Err(Error::InvalidSpec("job has no name".to_string()));
        }
        if state.jobs.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("trainingjob {}", key)));
        }

        job.metadata.uid = Some(Uuid::new_v4().to_string());
        job.metadata.resource_version = Some(state.bump_version());
        job.metadata.creation_timestamp = Some(Time(Utc::now()));
        job.metadata.generation = Some(1);
        job.metadata.deletion_timestamp = None;
        job.status = None;

        state.jobs.insert(key.clone(), job.clone());
        debug!(job = %key, "created trainingjob");
        self.shared.publish(ClusterEvent::JobApplied(job.clone()));
        Ok(job)
    }

    async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        let version = state.bump_version();
        let Some(job) = state.jobs.get_mut(key) else {
            return Ok(false);
        };

        if job.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if job.metadata.deletion_timestamp.is_none() {
                job.metadata.deletion_timestamp = Some(Time(Utc::now()));
                job.metadata.resource_version = Some(version);
                let event = ClusterEvent::JobApplied(job.clone());
                self.shared.publish(event);
            }
        } else if let Some(job) = state.jobs.remove(key) {
            self.shared.publish(ClusterEvent::JobDeleted(job));
        }
        Ok(true)
    }

    async fn replace_status(&self, job: &TrainingJob) -> Result<TrainingJob> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        let key = Self::check_version(&mut state, job)?;
        let version = state.bump_version();
        state.ops.status_updates += 1;

        let stored = state
            .jobs
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("trainingjob {}", key)))?;
        stored.status = job.status.clone();
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        self.shared.publish(ClusterEvent::JobApplied(updated.clone()));
        Ok(updated)
    }

    async fn set_finalizers(&self, job: &TrainingJob, finalizers: Vec<String>) -> Result<TrainingJob> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        let key = Self::check_version(&mut state, job)?;
        let version = state.bump_version();
        state.ops.finalizer_updates += 1;

        let stored = state
            .jobs
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("trainingjob {}", key)))?;
        let released = finalizers.is_empty() && stored.metadata.deletion_timestamp.is_some();
        stored.metadata.finalizers = if finalizers.is_empty() {
            None
        } else {
            Some(finalizers)
        };
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();

        if released {
            state.jobs.remove(&key);
            debug!(job = %key, "last finalizer removed, trainingjob deleted");
            self.shared.publish(ClusterEvent::JobDeleted(updated.clone()));
        } else {
            self.shared.publish(ClusterEvent::JobApplied(updated.clone()));
        }
        Ok(updated)
    }

    async fn list_pods(&self, owner: &JobKey) -> Result<Vec<ManagedPod>> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        Ok(state
            .pods
            .values()
            .filter(|p| p.owner_key() == *owner)
            .cloned()
            .collect())
    }

    async fn create_pod(
        &self,
        pod: &DesiredPod,
        owner: &OwnerReference,
        attempt: u32,
    ) -> Result<ManagedPod> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        let id = (pod.namespace.clone(), pod.name.clone());
        if state.pods.contains_key(&id) {
            return Err(Error::AlreadyExists(format!("pod {}/{}", pod.namespace, pod.name)));
        }

        let created = ManagedPod {
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            uid: Uuid::new_v4().to_string(),
            owner: owner.clone(),
            role: pod.role.clone(),
            index: pod.index,
            phase: PodPhase::Pending,
            restart_count: attempt,
            resource_version: Some(state.bump_version()),
        };
        state.ops.pods_created += 1;
        state.pods.insert(id, created.clone());
        self.shared.publish(ClusterEvent::PodApplied(created.clone()));
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str, uid: Option<String>) -> Result<()> {
        let mut state = self.shared.lock();
        Self::check_available(&mut state)?;
        let id = (namespace.to_string(), name.to_string());
        let current = state
            .pods
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("pod {}/{}", namespace, name)))?;
        if uid.as_deref().is_some_and(|uid| uid != current.uid) {
            return Err(Error::Conflict(format!(
                "pod {}/{} was replaced (uid precondition failed)",
                namespace, name
            )));
        }

        state.ops.pods_deleted += 1;
        state.logs.remove(&id);
        if let Some(pod) = state.pods.remove(&id) {
            self.shared.publish(ClusterEvent::PodDeleted(pod));
        }
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let id = (namespace.to_string(), name.to_string());
        let uid = {
            let mut state = self.shared.lock();
            Self::check_available(&mut state)?;
            let pod = state
                .pods
                .get(&id)
                .ok_or_else(|| Error::NotFound(format!("pod {}/{}", namespace, name)))?;
            if !follow {
                let lines = state.logs.get(&id).cloned().unwrap_or_default();
                return Ok(stream::iter(lines.into_iter().map(Ok)).boxed());
            }
            pod.uid.clone()
        };

        // Follow until the pod stops running, then drain what is left.
        let shared = self.shared.clone();
        let lines = stream::unfold(0usize, move |pos| {
            let shared = shared.clone();
            let id = id.clone();
            let uid = uid.clone();
            async move {
                loop {
                    let notified = shared.changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    {
                        let state = shared.lock();
                        if let Some(line) = state.logs.get(&id).and_then(|l| l.get(pos)) {
                            return Some((Ok::<_, Error>(line.clone()), pos + 1));
                        }
                        match state.pods.get(&id) {
                            Some(pod) if pod.uid == uid && pod.phase.is_active() => {}
                            _ => return None,
                        }
                    }
                    notified.await;
                }
            }
        });
        Ok(lines.boxed())
    }

    fn watch(&self) -> BoxStream<'static, ClusterEvent> {
        // Subscribe and snapshot under one lock so nothing falls in between.
        let (initial, rx) = {
            let state = self.shared.lock();
            let rx = self.shared.events.subscribe();
            let initial = vec![
                ClusterEvent::JobsRestarted(state.jobs.values().cloned().collect()),
                ClusterEvent::PodsRestarted(state.pods.values().cloned().collect()),
            ];
            (initial, rx)
        };

        let shared = self.shared.clone();
        let live = stream::unfold((rx, shared), |(mut rx, shared)| async move {
            match rx.recv().await {
                Ok(event) => Some((vec![event], (rx, shared))),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "watcher lagged behind, re-listing");
                    let relist = shared.relist();
                    Some((relist, (rx, shared)))
                }
                Err(RecvError::Closed) => None,
            }
        })
        .flat_map(stream::iter);

        stream::iter(initial).chain(live).boxed()
    }
}
