#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};

use trainjob_operator::{
    backoff::BackoffConfig,
    client::{CreateJobRequest, TrainingClient},
    controllers::{Action, ControllerSettings, TrainingJobController},
    crd::{PodTemplate, ReplicaSpec, TrainingJobSpec},
    kubernetes::{ClusterApi, ClusterEvent, InMemoryCluster, JobKey, PodPhase},
    store::ResourceStore,
    Result,
};

pub const NAMESPACE: &str = "default";

pub fn replica(role: &str, replicas: i32) -> ReplicaSpec {
    ReplicaSpec {
        role: role.to_string(),
        replicas,
        max_restarts: None,
        template: PodTemplate {
            image: "ghcr.io/example/trainer:latest".to_string(),
            command: vec!["torchrun".to_string()],
            args: vec!["train.py".to_string()],
            ..Default::default()
        },
    }
}

pub fn spec(workers: i32) -> TrainingJobSpec {
    TrainingJobSpec {
        replica_specs: vec![replica("master", 1), replica("worker", workers)],
        restart_policy: Default::default(),
        run_policy: Default::default(),
    }
}

/// Controller settings with restarts allowed immediately.
pub fn settings() -> ControllerSettings {
    ControllerSettings {
        workers: 2,
        max_conflict_retries: 2,
        resync_interval: Duration::from_secs(30),
        backoff: BackoffConfig {
            initial_delay: Duration::ZERO,
            ..BackoffConfig::default()
        },
    }
}

/// In-memory cluster, watch cache and controller, driven one pass at a time.
pub struct Harness {
    pub cluster: InMemoryCluster,
    pub store: Arc<ResourceStore>,
    pub controller: Arc<TrainingJobController>,
    pub client: TrainingClient,
    events: BoxStream<'static, ClusterEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: ControllerSettings) -> Self {
        let cluster = InMemoryCluster::new();
        let api: Arc<dyn ClusterApi> = Arc::new(cluster.clone());
        let store = Arc::new(ResourceStore::new(1024));
        let controller = Arc::new(TrainingJobController::new(api.clone(), store.clone(), settings));
        let events = cluster.watch();
        let mut harness = Self {
            cluster,
            store,
            controller,
            client: TrainingClient::new(api, NAMESPACE),
            events,
        };
        harness.sync();
        harness
    }

    /// Applies every cluster event published so far to the cache.
    pub fn sync(&mut self) {
        while let Some(Some(event)) = self.events.next().now_or_never() {
            self.store.apply(event);
        }
    }

    pub async fn submit(&mut self, name: &str, spec: TrainingJobSpec) -> JobKey {
        self.client
            .create(CreateJobRequest {
                name: name.to_string(),
                spec,
            })
            .await
            .expect("job accepted");
        self.sync();
        JobKey::new(NAMESPACE, name)
    }

    pub async fn reconcile(&mut self, key: &JobKey) -> Result<Action> {
        self.sync();
        let result = TrainingJobController::reconcile(key.clone(), self.controller.clone()).await;
        self.sync();
        result
    }

    pub fn set_phase(&mut self, pod: &str, phase: PodPhase) {
        self.cluster
            .set_pod_phase(NAMESPACE, pod, phase)
            .expect("pod exists");
        self.sync();
    }
}
