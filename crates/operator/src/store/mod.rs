//! In-memory mirror of TrainingJobs and the pods they own.
//!
//! Fed by [`ClusterApi::watch`](crate::kubernetes::ClusterApi::watch). Pods are
//! kept in an arena keyed by their owning job, so a job never references its
//! pods and garbage collection can look them up without the job present.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::crd::TrainingJob;
use crate::kubernetes::{ClusterEvent, JobKey, ManagedPod};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub enum CachedObject {
    Job(Arc<TrainingJob>),
    Pod(ManagedPod),
}

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Added(CachedObject),
    Updated(CachedObject),
    Deleted(CachedObject),
    /// Events may have been missed; consumers should revisit every key.
    Resync,
}

impl StoreEvent {
    /// Job the event should trigger a reconcile for.
    pub fn job_key(&self) -> Option<JobKey> {
        match self {
            StoreEvent::Added(obj) | StoreEvent::Updated(obj) | StoreEvent::Deleted(obj) => {
                Some(match obj {
                    CachedObject::Job(job) => job.key(),
                    CachedObject::Pod(pod) => pod.owner_key(),
                })
            }
            StoreEvent::Resync => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobKey, Arc<TrainingJob>>,
    pods: HashMap<JobKey, BTreeMap<String, ManagedPod>>,
    jobs_synced: bool,
    pods_synced: bool,
}

pub struct ResourceStore {
    inner: RwLock<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl ResourceStore {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// True once the initial listing of both jobs and pods has been applied.
    pub fn is_ready(&self) -> bool {
        let inner = self.read();
        inner.jobs_synced && inner.pods_synced
    }

    pub fn get(&self, key: &JobKey) -> Result<Arc<TrainingJob>> {
        let inner = self.read();
        match inner.jobs.get(key) {
            Some(job) => Ok(job.clone()),
            None if !inner.jobs_synced => {
                Err(Error::Unavailable("resource cache has not synced yet".to_string()))
            }
            None => Err(Error::NotFound(format!("trainingjob {}", key))),
        }
    }

    /// Jobs in `namespace` (all namespaces for `None`), ordered by key.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<TrainingJob>> {
        let inner = self.read();
        let mut jobs: Vec<Arc<TrainingJob>> = inner
            .jobs
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, job)| job.clone())
            .collect();
        jobs.sort_by_key(|job| job.key());
        jobs
    }

    /// Cached pods owned by `key`, by name.
    pub fn pods_for(&self, key: &JobKey) -> Vec<ManagedPod> {
        self.read()
            .pods
            .get(key)
            .map(|pods| pods.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every key with a cached job or cached owned pods.
    pub fn known_keys(&self) -> Vec<JobKey> {
        let inner = self.read();
        let mut keys: Vec<JobKey> = inner
            .jobs
            .keys()
            .chain(inner.pods.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();
        keys
    }

    /// Changes applied from now on. A lagging subscriber gets `Resync` in
    /// place of what it missed.
    pub fn subscribe(&self) -> BoxStream<'static, StoreEvent> {
        let rx = self.events.subscribe();
        stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((event, rx)),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "store subscriber lagged, requesting resync");
                    Some((StoreEvent::Resync, rx))
                }
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }

    fn publish(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    pub fn apply(&self, event: ClusterEvent) {
        let mut guard = self.write();
        let inner = &mut *guard;
        match event {
            ClusterEvent::JobApplied(job) => {
                let key = job.key();
                let job = Arc::new(job);
                match inner.jobs.get(&key) {
                    Some(cached)
                        if is_stale(
                            cached.metadata.resource_version.as_deref(),
                            job.metadata.resource_version.as_deref(),
                        ) =>
                    {
                        debug!(job = %key, "ignoring stale job event");
                    }
                    Some(cached)
                        if cached.metadata.resource_version == job.metadata.resource_version => {}
                    Some(_) => {
                        inner.jobs.insert(key, job.clone());
                        self.publish(StoreEvent::Updated(CachedObject::Job(job)));
                    }
                    None => {
                        inner.jobs.insert(key, job.clone());
                        self.publish(StoreEvent::Added(CachedObject::Job(job)));
                    }
                }
            }
            ClusterEvent::JobDeleted(job) => {
                let key = job.key();
                let job = inner.jobs.remove(&key).unwrap_or_else(|| Arc::new(job));
                self.publish(StoreEvent::Deleted(CachedObject::Job(job)));
            }
            ClusterEvent::JobsRestarted(jobs) => {
                let fresh: HashMap<JobKey, Arc<TrainingJob>> =
                    jobs.into_iter().map(|j| (j.key(), Arc::new(j))).collect();
                let gone: Vec<Arc<TrainingJob>> = inner
                    .jobs
                    .iter()
                    .filter(|(key, _)| !fresh.contains_key(*key))
                    .map(|(_, job)| job.clone())
                    .collect();
                info!(jobs = fresh.len(), removed = gone.len(), "job cache relisted");
                inner.jobs = fresh;
                inner.jobs_synced = true;
                for job in gone {
                    self.publish(StoreEvent::Deleted(CachedObject::Job(job)));
                }
                self.publish(StoreEvent::Resync);
            }
            ClusterEvent::PodApplied(pod) => {
                let owned = inner.pods.entry(pod.owner_key()).or_default();
                match owned.get(&pod.name) {
                    Some(cached)
                        if cached.uid == pod.uid
                            && is_stale(cached.resource_version.as_deref(), pod.resource_version.as_deref()) =>
                    {
                        debug!(pod = %pod.name, "ignoring stale pod event");
                    }
                    Some(cached) if *cached == pod => {}
                    Some(_) => {
                        owned.insert(pod.name.clone(), pod.clone());
                        self.publish(StoreEvent::Updated(CachedObject::Pod(pod)));
                    }
                    None => {
                        owned.insert(pod.name.clone(), pod.clone());
                        self.publish(StoreEvent::Added(CachedObject::Pod(pod)));
                    }
                }
            }
            ClusterEvent::PodDeleted(pod) => {
                let key = pod.owner_key();
                if let Some(owned) = inner.pods.get_mut(&key) {
                    // A delete for an earlier incarnation must not evict its replacement.
                    if owned.get(&pod.name).is_some_and(|cached| cached.uid == pod.uid) {
                        owned.remove(&pod.name);
                    }
                    if owned.is_empty() {
                        inner.pods.remove(&key);
                    }
                }
                self.publish(StoreEvent::Deleted(CachedObject::Pod(pod)));
            }
            ClusterEvent::PodsRestarted(pods) => {
                let mut fresh: HashMap<JobKey, BTreeMap<String, ManagedPod>> = HashMap::new();
                for pod in pods {
                    fresh
                        .entry(pod.owner_key())
                        .or_default()
                        .insert(pod.name.clone(), pod);
                }
                let gone: Vec<ManagedPod> = inner
                    .pods
                    .iter()
                    .flat_map(|(key, owned)| {
                        owned
                            .values()
                            .filter(|p| {
                                fresh
                                    .get(key)
                                    .and_then(|f| f.get(&p.name))
                                    .map_or(true, |f| f.uid != p.uid)
                            })
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .collect();
                inner.pods = fresh;
                inner.pods_synced = true;
                for pod in gone {
                    self.publish(StoreEvent::Deleted(CachedObject::Pod(pod)));
                }
                self.publish(StoreEvent::Resync);
            }
        }
    }

    /// Applies cluster events until the stream ends.
    pub async fn run(self: Arc<Self>, mut events: BoxStream<'static, ClusterEvent>) {
        info!("Starting resource store");
        while let Some(event) = events.next().await {
            self.apply(event);
        }
        warn!("cluster event stream ended");
    }
}

/// True when `incoming` is provably older than `cached`. Versions that do not
/// parse as integers are treated as opaque and never considered stale.
fn is_stale(cached: Option<&str>, incoming: Option<&str>) -> bool {
    match (
        cached.and_then(|v| v.parse::<u64>().ok()),
        incoming.and_then(|v| v.parse::<u64>().ok()),
    ) {
        (Some(cached), Some(incoming)) => incoming < cached,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PodTemplate, ReplicaSpec, TrainingJobSpec};
    use crate::kubernetes::{OwnerReference, PodPhase};
    use futures::FutureExt;

    fn job(name: &str, version: &str) -> TrainingJob {
        let mut job = TrainingJob::new(
            name,
            TrainingJobSpec {
                replica_specs: vec![ReplicaSpec {
                    role: "worker".to_string(),
                    replicas: 1,
                    max_restarts: None,
                    template: PodTemplate {
                        image: "trainer:1".to_string(),
                        ..Default::default()
                    },
                }],
                restart_policy: Default::default(),
                run_policy: Default::default(),
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job.metadata.resource_version = Some(version.to_string());
        job
    }

    fn pod(job: &str, name: &str, uid: &str, version: &str) -> ManagedPod {
        ManagedPod {
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: uid.to_string(),
            owner: OwnerReference {
                api_version: "training.operator.dev/v1alpha1".to_string(),
                kind: "TrainingJob".to_string(),
                name: job.to_string(),
                uid: "job-uid".to_string(),
            },
            role: "worker".to_string(),
            index: 0,
            phase: PodPhase::Pending,
            restart_count: 0,
            resource_version: Some(version.to_string()),
        }
    }

    fn synced() -> ResourceStore {
        let store = ResourceStore::new(16);
        store.apply(ClusterEvent::JobsRestarted(vec![]));
        store.apply(ClusterEvent::PodsRestarted(vec![]));
        store
    }

    #[test]
    fn get_before_sync_is_recoverable() {
        let store = ResourceStore::new(16);
        let err = store.get(&JobKey::new("default", "a")).unwrap_err();
        assert!(err.is_transient());

        let store = synced();
        assert!(store.get(&JobKey::new("default", "a")).unwrap_err().is_not_found());
    }

    #[test]
    fn stale_job_versions_are_ignored() {
        let store = synced();
        store.apply(ClusterEvent::JobApplied(job("a", "5")));
        store.apply(ClusterEvent::JobApplied(job("a", "3")));
        let cached = store.get(&JobKey::new("default", "a")).unwrap();
        assert_eq!(cached.metadata.resource_version.as_deref(), Some("5"));
    }

    #[test]
    fn list_filters_by_namespace() {
        let store = synced();
        store.apply(ClusterEvent::JobApplied(job("b", "1")));
        store.apply(ClusterEvent::JobApplied(job("a", "2")));
        let mut other = job("c", "3");
        other.metadata.namespace = Some("research".to_string());
        store.apply(ClusterEvent::JobApplied(other));

        let names: Vec<String> = store
            .list(Some("default"))
            .iter()
            .map(|j| j.key().name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.list(None).len(), 3);
    }

    #[tokio::test]
    async fn pods_are_indexed_by_owner_and_outlive_their_job() {
        let store = synced();
        let mut events = store.subscribe();
        store.apply(ClusterEvent::JobApplied(job("a", "1")));
        store.apply(ClusterEvent::PodApplied(pod("a", "a-worker-0", "u1", "2")));
        store.apply(ClusterEvent::JobDeleted(job("a", "3")));

        let key = JobKey::new("default", "a");
        assert_eq!(store.pods_for(&key).len(), 1);
        assert_eq!(store.known_keys(), vec![key.clone()]);

        for _ in 0..3 {
            let event = events.next().await.unwrap();
            assert_eq!(event.job_key(), Some(key.clone()));
        }
        assert!(events.next().now_or_never().is_none());
    }

    #[test]
    fn delete_of_old_incarnation_keeps_replacement() {
        let store = synced();
        store.apply(ClusterEvent::PodApplied(pod("a", "a-worker-0", "new", "9")));
        store.apply(ClusterEvent::PodDeleted(pod("a", "a-worker-0", "old", "4")));
        let pods = store.pods_for(&JobKey::new("default", "a"));
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].uid, "new");
    }

    #[tokio::test]
    async fn relist_reports_vanished_objects_then_resync() {
        let store = synced();
        store.apply(ClusterEvent::JobApplied(job("a", "1")));
        store.apply(ClusterEvent::JobApplied(job("b", "2")));
        let mut events = store.subscribe();

        store.apply(ClusterEvent::JobsRestarted(vec![job("b", "2")]));
        assert!(matches!(
            events.next().await,
            Some(StoreEvent::Deleted(CachedObject::Job(j))) if j.key().name == "a"
        ));
        assert!(matches!(events.next().await, Some(StoreEvent::Resync)));
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_resync() {
        let store = ResourceStore::new(1);
        let mut events = store.subscribe();
        store.apply(ClusterEvent::JobsRestarted(vec![]));
        store.apply(ClusterEvent::JobApplied(job("a", "1")));
        store.apply(ClusterEvent::JobApplied(job("b", "2")));
        assert!(matches!(events.next().await, Some(StoreEvent::Resync)));
    }

    #[test]
    fn opaque_versions_are_never_stale() {
        assert!(is_stale(Some("10"), Some("9")));
        assert!(!is_stale(Some("10"), Some("11")));
        assert!(!is_stale(Some("abc"), Some("9")));
        assert!(!is_stale(None, Some("1")));
    }
}
