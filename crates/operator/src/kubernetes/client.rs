use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference as K8sOwnerReference};
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams, Preconditions},
    runtime::{watcher, WatchStreamExt},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    ClusterApi, ClusterEvent, JobKey, ManagedPod, OwnerReference, ATTEMPT_ANNOTATION, INDEX_LABEL,
    JOB_NAME_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE, ROLE_LABEL,
};
use crate::crd::TrainingJob;
use crate::topology::DesiredPod;
use crate::{Error, Result};

/// [`ClusterApi`] backed by a Kubernetes API server.
pub struct KubeCluster {
    client: Client,
    /// Namespace to watch; `None` watches every namespace
    namespace: Option<String>,
}

impl KubeCluster {
    pub async fn new(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::from_client(client, namespace))
    }

    pub fn from_client(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn jobs(&self, namespace: &str) -> Api<TrainingJob> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pod_manifest(&self, desired: &DesiredPod, owner: &OwnerReference, attempt: u32) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(JOB_NAME_LABEL.to_string(), desired.job_name.clone());
        labels.insert(ROLE_LABEL.to_string(), desired.role.clone());
        labels.insert(INDEX_LABEL.to_string(), desired.index.to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(ATTEMPT_ANNOTATION.to_string(), attempt.to_string());

        let quantities = |values: &BTreeMap<String, String>| {
            (!values.is_empty()).then(|| {
                values
                    .iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect::<BTreeMap<_, _>>()
            })
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(desired.name.clone()),
                namespace: Some(desired.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                owner_references: Some(vec![K8sOwnerReference {
                    api_version: owner.api_version.clone(),
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                    uid: owner.uid.clone(),
                    controller: Some(true),
                    block_owner_deletion: Some(true),
                }]),
                ..Default::default()
            },
            spec: Some(PodSpec {
                hostname: Some(desired.name.clone()),
                containers: vec![Container {
                    name: desired.role.clone(),
                    image: Some(desired.image.clone()),
                    command: (!desired.command.is_empty()).then(|| desired.command.clone()),
                    args: (!desired.args.is_empty()).then(|| desired.args.clone()),
                    env: Some(
                        desired
                            .env
                            .iter()
                            .map(|(k, v)| EnvVar {
                                name: k.clone(),
                                value: Some(v.clone()),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    resources: Some(ResourceRequirements {
                        requests: quantities(&desired.resources.requests),
                        limits: quantities(&desired.resources.limits),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                // Restarts are the controller's job so it can count them.
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_job(&self, key: &JobKey) -> Result<Option<TrainingJob>> {
        Ok(self.jobs(&key.namespace).get_opt(&key.name).await?)
    }

    async fn create_job(&self, job: TrainingJob) -> Result<TrainingJob> {
        let key = job.key();
        Ok(self
            .jobs(&key.namespace)
            .create(&PostParams::default(), &job)
            .await?)
    }

    async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        match self
            .jobs(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match Error::from(e) {
                Error::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn replace_status(&self, job: &TrainingJob) -> Result<TrainingJob> {
        let key = job.key();
        let data = serde_json::to_vec(job)?;
        Ok(self
            .jobs(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await?)
    }

    async fn set_finalizers(&self, job: &TrainingJob, finalizers: Vec<String>) -> Result<TrainingJob> {
        let key = job.key();
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": job.resource_version(),
            }
        });
        Ok(self
            .jobs(&key.namespace)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn list_pods(&self, owner: &JobKey) -> Result<Vec<ManagedPod>> {
        let params = ListParams::default().labels(&format!("{}={}", JOB_NAME_LABEL, owner.name));
        let pods = self.pods(&owner.namespace).list(&params).await?;
        Ok(pods
            .items
            .iter()
            .filter_map(ManagedPod::from_pod)
            .filter(|p| p.owner.name == owner.name)
            .collect())
    }

    async fn create_pod(
        &self,
        pod: &DesiredPod,
        owner: &OwnerReference,
        attempt: u32,
    ) -> Result<ManagedPod> {
        let manifest = self.pod_manifest(pod, owner, attempt);
        let created = self
            .pods(&pod.namespace)
            .create(&PostParams::default(), &manifest)
            .await?;
        debug!(pod = %created.name_any(), attempt, "created pod");
        ManagedPod::from_pod(&created)
            .ok_or_else(|| Error::Internal(format!("created pod {} lost its labels", pod.name)))
    }

    async fn delete_pod(&self, namespace: &str, name: &str, uid: Option<String>) -> Result<()> {
        let params = DeleteParams {
            preconditions: uid.map(|uid| Preconditions {
                uid: Some(uid),
                resource_version: None,
            }),
            ..Default::default()
        };
        self.pods(namespace).delete(name, &params).await?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        name: &str,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let params = LogParams {
            follow,
            ..Default::default()
        };
        let reader = self.pods(namespace).log_stream(name, &params).await?;
        Ok(reader.lines().map_err(Error::from).boxed())
    }

    fn watch(&self) -> BoxStream<'static, ClusterEvent> {
        let (jobs, pods): (Api<TrainingJob>, Api<Pod>) = match &self.namespace {
            Some(ns) => (
                Api::namespaced(self.client.clone(), ns),
                Api::namespaced(self.client.clone(), ns),
            ),
            None => (Api::all(self.client.clone()), Api::all(self.client.clone())),
        };

        let job_events = watcher(jobs, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Applied(job)) => Some(ClusterEvent::JobApplied(job)),
                    Ok(watcher::Event::Deleted(job)) => Some(ClusterEvent::JobDeleted(job)),
                    Ok(watcher::Event::Restarted(jobs)) => Some(ClusterEvent::JobsRestarted(jobs)),
                    Err(e) => {
                        warn!(error = %e, "trainingjob watch error");
                        None
                    }
                }
            });

        let selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        let pod_events = watcher(pods, watcher::Config::default().labels(&selector))
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Applied(pod)) => {
                        ManagedPod::from_pod(&pod).map(ClusterEvent::PodApplied)
                    }
                    Ok(watcher::Event::Deleted(pod)) => {
                        ManagedPod::from_pod(&pod).map(ClusterEvent::PodDeleted)
                    }
                    Ok(watcher::Event::Restarted(pods)) => Some(ClusterEvent::PodsRestarted(
                        pods.iter().filter_map(ManagedPod::from_pod).collect(),
                    )),
                    Err(e) => {
                        warn!(error = %e, "pod watch error");
                        None
                    }
                }
            });

        stream::select(job_events, pod_events).boxed()
    }
}
