use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::gc::GarbageCollector;
use super::queue::WorkQueue;
use super::Action;
use crate::backoff::{BackoffConfig, KeyedBackoff, RestartTracker, SlotKey};
use crate::config::Config;
use crate::crd::{
    CleanPodPolicy, ConditionType, ReplicaStatus, TrainingJob, TrainingJobStatus,
    POD_CLEANUP_FINALIZER,
};
use crate::kubernetes::{ClusterApi, JobKey, ManagedPod, OwnerReference, PodPhase};
use crate::lifecycle::{self, Observation, Transition};
use crate::metrics::{record_pod_operation, record_reconcile, STATUS_CONFLICTS_TOTAL};
use crate::store::{ResourceStore, StoreEvent};
use crate::topology::{self, DesiredPod};
use crate::{Error, Result};

/// Wait before retrying a replacement whose predecessor is still terminating.
const REPLACE_RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    /// Status write retries after a stale resource version
    pub max_conflict_retries: u32,
    /// Requeue interval for jobs that are still running
    pub resync_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.controller.workers,
            max_conflict_retries: config.controller.max_conflict_retries,
            resync_interval: config.resync_interval(),
            backoff: config.backoff_config(),
        }
    }
}

/// What to do for one replica slot this pass.
#[derive(Debug)]
enum SlotAction {
    Keep,
    Create { attempt: u32 },
    Replace { old: ManagedPod, attempt: u32 },
    Wait(Duration),
}

pub struct TrainingJobController {
    cluster: Arc<dyn ClusterApi>,
    store: Arc<ResourceStore>,
    gc: GarbageCollector,
    restarts: RestartTracker,
    errors: KeyedBackoff,
    settings: ControllerSettings,
}

impl TrainingJobController {
    pub fn new(cluster: Arc<dyn ClusterApi>, store: Arc<ResourceStore>, settings: ControllerSettings) -> Self {
        Self {
            gc: GarbageCollector::new(cluster.clone()),
            restarts: RestartTracker::new(settings.backoff.clone()),
            errors: KeyedBackoff::new(Duration::from_millis(500), settings.backoff.max_delay),
            cluster,
            store,
            settings,
        }
    }

    pub fn restarts(&self) -> &RestartTracker {
        &self.restarts
    }

    /// Runs workers until `queue` is shut down and drained.
    pub async fn run(self: Arc<Self>, queue: WorkQueue) -> Result<()> {
        info!("Starting TrainingJob controller with {} workers", self.settings.workers);

        // Subscribe before the initial enqueue so nothing slips between them.
        let events = self.store.subscribe();
        for key in self.store.known_keys() {
            queue.add(key);
        }
        let pump = tokio::spawn(Self::pump(self.store.clone(), events, queue.clone()));

        let workers: Vec<_> = (0..self.settings.workers.max(1))
            .map(|id| tokio::spawn(self.clone().worker(id, queue.clone())))
            .collect();
        for worker in futures::future::join_all(workers).await {
            if let Err(e) = worker {
                error!("Controller worker panicked: {}", e);
            }
        }

        pump.abort();
        info!("TrainingJob controller stopped");
        Ok(())
    }

    async fn pump(store: Arc<ResourceStore>, mut events: BoxStream<'static, StoreEvent>, queue: WorkQueue) {
        while let Some(event) = events.next().await {
            match event.job_key() {
                Some(key) => queue.add(key),
                None => {
                    debug!("resync requested, enqueueing every known job");
                    for key in store.known_keys() {
                        queue.add(key);
                    }
                }
            }
        }
    }

    async fn worker(self: Arc<Self>, id: usize, queue: WorkQueue) {
        debug!(worker = id, "worker started");
        while let Some(key) = queue.next().await {
            let started = std::time::Instant::now();
            let action = match Self::reconcile(key.clone(), self.clone()).await {
                Ok(action) => {
                    self.errors.reset(&key);
                    record_reconcile("success", started.elapsed().as_secs_f64());
                    action
                }
                Err(e) => {
                    record_reconcile("error", started.elapsed().as_secs_f64());
                    Self::error_policy(&key, &e, &self)
                }
            };
            queue.done(&key);
            if let Action::Requeue(delay) = action {
                queue.add_after(key, delay);
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// One reconcile of `key`, retried from a fresh read when a status write
    /// loses an optimistic-concurrency race.
    pub async fn reconcile(key: JobKey, ctx: Arc<Self>) -> Result<Action> {
        let mut conflicts = 0;
        loop {
            let outcome = if conflicts == 0 {
                let cached = match ctx.store.get(&key) {
                    Ok(job) => Some((*job).clone()),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                };
                let pods = ctx.store.pods_for(&key);
                ctx.reconcile_job(&key, cached, pods, true).await
            } else {
                let fresh = ctx.cluster.get_job(&key).await?;
                let pods = ctx.cluster.list_pods(&key).await?;
                ctx.reconcile_job(&key, fresh, pods, false).await
            };

            match outcome {
                Err(Error::Conflict(message)) => {
                    STATUS_CONFLICTS_TOTAL.inc();
                    conflicts += 1;
                    if conflicts > ctx.settings.max_conflict_retries {
                        return Err(Error::Conflict(format!(
                            "{}: gave up after {} conflicting writes: {}",
                            key, conflicts, message
                        )));
                    }
                    debug!(job = %key, attempt = conflicts, "stale resource version, re-reading");
                }
                other => return other,
            }
        }
    }

    fn error_policy(key: &JobKey, err: &Error, ctx: &Self) -> Action {
        let delay = ctx.errors.next_delay(key);
        match err {
            Error::Conflict(_) => error!("Reconciliation conflict for TrainingJob {}: {}", key, err),
            e if e.is_transient() => warn!("Transient error reconciling TrainingJob {}: {}", key, err),
            _ => error!("Error reconciling TrainingJob {}: {}", key, err),
        }
        Action::Requeue(delay)
    }

    async fn reconcile_job(
        &self,
        key: &JobKey,
        job: Option<TrainingJob>,
        pods: Vec<ManagedPod>,
        from_cache: bool,
    ) -> Result<Action> {
        // The cache can lag behind a fresh create; confirm absence before collecting.
        let (job, pods, from_cache) = match job {
            Some(job) => (job, pods, from_cache),
            None => match self.cluster.get_job(key).await? {
                Some(job) => {
                    let pods = self.cluster.list_pods(key).await?;
                    (job, pods, false)
                }
                None => {
                    let remaining = self.gc.collect(key, None).await?;
                    self.restarts.forget_job(key);
                    debug!(job = %key, remaining, "job is gone, dropping key");
                    return Ok(Action::AwaitChange);
                }
            },
        };

        info!("Reconciling TrainingJob: {}", key);

        if job.is_deleting() {
            let action = self.gc.finalize(&job).await?;
            if action == Action::AwaitChange {
                self.restarts.forget_job(key);
            }
            return Ok(action);
        }

        let job = if job.has_finalizer() {
            job
        } else {
            let mut finalizers = job.finalizers().to_vec();
            finalizers.push(POD_CLEANUP_FINALIZER.to_string());
            self.cluster.set_finalizers(&job, finalizers).await?
        };

        if job.is_terminal() {
            return self.clean_up_terminal(&job, &pods).await;
        }

        if let Err(Error::InvalidSpec(message)) = topology::validate(&job.name_any(), &job.spec) {
            warn!(job = %key, %message, "rejecting invalid spec");
            self.fail_with(&job, Transition::invalid_spec(message)).await?;
            return Ok(Action::AwaitChange);
        }

        let owner = OwnerReference::for_job(&job)?;
        let desired = topology::plan(&job);
        let (mut current, strays) = partition_pods(pods, &desired, &owner.uid);

        for pod in &strays {
            info!(job = %key, pod = %pod.name, "deleting pod outside the topology");
            if self.gc.delete_pod(pod).await? {
                record_pod_operation("delete");
            }
        }

        let (actions, exhausted) = self.plan_slots(key, &job, &desired, &current);
        let restarting = actions
            .iter()
            .any(|a| matches!(a, SlotAction::Replace { .. } | SlotAction::Wait(_)));
        let mut wait = actions
            .iter()
            .filter_map(|a| match a {
                SlotAction::Wait(d) => Some(*d),
                _ => None,
            })
            .min();

        let mut admission_error = None;
        if exhausted.is_none() {
            for (pod, action) in desired.iter().zip(actions) {
                let attempt = match action {
                    SlotAction::Keep | SlotAction::Wait(_) => continue,
                    SlotAction::Create { attempt } => attempt,
                    SlotAction::Replace { old, attempt } => {
                        match self
                            .cluster
                            .delete_pod(&old.namespace, &old.name, Some(old.uid.clone()))
                            .await
                        {
                            Ok(()) => record_pod_operation("delete"),
                            Err(Error::NotFound(_)) => {}
                            Err(Error::Conflict(_)) => {
                                debug!(job = %key, pod = %old.name, "failed pod already replaced");
                                continue;
                            }
                            Err(e) => return Err(e),
                        }
                        current.remove(&old.name);
                        attempt
                    }
                };

                if self.deletion_observed(key, &job, from_cache) {
                    info!(job = %key, "job deleted mid-reconcile, stopping pod creation");
                    return Ok(Action::Requeue(Duration::ZERO));
                }

                match self.cluster.create_pod(pod, &owner, attempt).await {
                    Ok(created) => {
                        record_pod_operation("create");
                        info!(job = %key, pod = %created.name, attempt, "created pod");
                        current.insert(created.name.clone(), created);
                    }
                    Err(Error::AlreadyExists(_)) => {
                        debug!(job = %key, pod = %pod.name, "pod already exists");
                        if attempt > 0 {
                            wait = Some(wait.map_or(REPLACE_RECHECK, |w| w.min(REPLACE_RECHECK)));
                        }
                    }
                    Err(Error::InvalidSpec(message)) => {
                        admission_error = Some(message);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(message) = admission_error {
            warn!(job = %key, %message, "pod rejected at admission");
            self.fail_with(&job, Transition::invalid_spec(message)).await?;
            return Ok(Action::AwaitChange);
        }

        let obs = Observation {
            desired: desired.len(),
            pods_issued: !current.is_empty(),
            running: count_phase(&current, PodPhase::Running),
            succeeded: count_phase(&current, PodPhase::Succeeded),
            restarting,
            exhausted,
        };
        let status = next_status(&job, &desired, &current, &obs);
        let terminal = status.conditions.iter().any(|c| c.is_true() && c.condition_type.is_terminal());
        if job.status.as_ref() != Some(&status) {
            let mut updated = job.clone();
            updated.status = Some(status);
            self.cluster.replace_status(&updated).await?;
            debug!(job = %key, "status updated");
        }

        if terminal {
            return Ok(Action::AwaitChange);
        }
        Ok(Action::Requeue(
            wait.map_or(self.settings.resync_interval, |w| w.min(self.settings.resync_interval)),
        ))
    }

    /// Decides per slot whether to keep, create or replace its pod, and whether
    /// any role has run out of restarts.
    fn plan_slots(
        &self,
        key: &JobKey,
        job: &TrainingJob,
        desired: &[DesiredPod],
        current: &HashMap<String, ManagedPod>,
    ) -> (Vec<SlotAction>, Option<String>) {
        let now = Instant::now();
        let default_limit = self.restarts.config().default_restart_limit;

        // Failures spent per role: prior attempts of each slot plus a current failure.
        let mut spent: BTreeMap<&str, u32> = BTreeMap::new();
        for pod in desired {
            let slot = SlotKey::new(key.clone(), &pod.role, pod.index);
            let failures = match current.get(&pod.name) {
                Some(p) => p.restart_count + u32::from(p.phase == PodPhase::Failed),
                None => self.restarts.next_attempt(&slot),
            };
            *spent.entry(pod.role.as_str()).or_default() += failures;
        }

        let exhausted = topology::ordered_roles(&job.spec).iter().find_map(|r| {
            let budget = job.restart_budget(&r.role, default_limit).max(0) as u32;
            let failures = spent.get(r.role.as_str()).copied().unwrap_or(0);
            (failures > budget).then(|| {
                format!(
                    "role {} failed {} times, exceeding its restart budget of {}",
                    r.role, failures, budget
                )
            })
        });

        let actions = desired
            .iter()
            .map(|pod| {
                let slot = SlotKey::new(key.clone(), &pod.role, pod.index);
                match current.get(&pod.name) {
                    None => SlotAction::Create {
                        attempt: self.restarts.next_attempt(&slot),
                    },
                    Some(p) if p.phase == PodPhase::Failed => {
                        let remaining = self.restarts.remaining(&slot, p.restart_count, now);
                        if remaining.is_zero() {
                            SlotAction::Replace {
                                old: p.clone(),
                                attempt: p.restart_count + 1,
                            }
                        } else {
                            SlotAction::Wait(remaining)
                        }
                    }
                    Some(p) if p.phase == PodPhase::Succeeded => {
                        self.restarts.reset(&slot);
                        SlotAction::Keep
                    }
                    Some(_) => SlotAction::Keep,
                }
            })
            .collect();

        (actions, exhausted)
    }

    /// True when the cache shows the job deleted or replaced since this pass read it.
    fn deletion_observed(&self, key: &JobKey, job: &TrainingJob, from_cache: bool) -> bool {
        match self.store.get(key) {
            Ok(cached) => cached.is_deleting() || cached.uid() != job.uid(),
            Err(e) => from_cache && e.is_not_found(),
        }
    }

    async fn fail_with(&self, job: &TrainingJob, transition: Transition) -> Result<()> {
        let mut status = job.status.clone().unwrap_or_default();
        let now = Utc::now();
        if !lifecycle::advance(&mut status.conditions, &transition, now).changed() {
            return Ok(());
        }
        status.completion_time.get_or_insert(now);
        let mut updated = job.clone();
        updated.status = Some(status);
        self.cluster.replace_status(&updated).await?;
        Ok(())
    }

    /// Applies the clean pod policy once the job is terminal.
    async fn clean_up_terminal(&self, job: &TrainingJob, pods: &[ManagedPod]) -> Result<Action> {
        let key = job.key();
        self.restarts.forget_job(&key);
        let doomed: Vec<&ManagedPod> = match job.spec.run_policy.clean_pod_policy {
            CleanPodPolicy::None => vec![],
            CleanPodPolicy::All => pods.iter().collect(),
            CleanPodPolicy::Running => pods.iter().filter(|p| p.phase.is_active()).collect(),
        };
        for pod in doomed {
            if self.gc.delete_pod(pod).await? {
                record_pod_operation("delete");
                debug!(job = %key, pod = %pod.name, "cleaned up pod of finished job");
            }
        }
        Ok(Action::AwaitChange)
    }
}

/// Splits pods into the job's current incarnation keyed by name, and pods that
/// are not part of the plan or belong to an earlier incarnation.
fn partition_pods(
    pods: Vec<ManagedPod>,
    desired: &[DesiredPod],
    owner_uid: &str,
) -> (HashMap<String, ManagedPod>, Vec<ManagedPod>) {
    let mut current = HashMap::new();
    let mut strays = Vec::new();
    for pod in pods {
        let planned = desired
            .iter()
            .any(|d| d.name == pod.name && d.role == pod.role && d.index == pod.index);
        if planned && pod.owner.uid == owner_uid {
            current.insert(pod.name.clone(), pod);
        } else {
            strays.push(pod);
        }
    }
    (current, strays)
}

fn count_phase(pods: &HashMap<String, ManagedPod>, phase: PodPhase) -> usize {
    pods.values().filter(|p| p.phase == phase).count()
}

fn next_status(
    job: &TrainingJob,
    desired: &[DesiredPod],
    current: &HashMap<String, ManagedPod>,
    obs: &Observation,
) -> TrainingJobStatus {
    let mut status = job.status.clone().unwrap_or_default();
    let now = Utc::now();
    lifecycle::evaluate(&mut status.conditions, obs, now);

    let mut replicas: BTreeMap<String, ReplicaStatus> = topology::ordered_roles(&job.spec)
        .iter()
        .map(|r| (r.role.clone(), ReplicaStatus::default()))
        .collect();
    for pod in desired {
        let Some(p) = current.get(&pod.name) else {
            continue;
        };
        let entry = replicas.entry(pod.role.clone()).or_default();
        match p.phase {
            PodPhase::Succeeded => entry.succeeded += 1,
            PodPhase::Failed => entry.failed += 1,
            _ => entry.active += 1,
        }
        entry.restarts += p.restart_count as i32;
    }
    status.replica_statuses = replicas;

    if status.start_time.is_none() && lifecycle::has_condition(&status.conditions, ConditionType::Created) {
        status.start_time = Some(
            status
                .conditions
                .iter()
                .find(|c| c.condition_type == ConditionType::Created)
                .map_or(now, |c| c.last_transition_time),
        );
    }
    if status.completion_time.is_none() {
        status.completion_time = status
            .conditions
            .iter()
            .find(|c| c.is_true() && c.condition_type.is_terminal())
            .map(|c| c.last_transition_time);
    }
    status
}
