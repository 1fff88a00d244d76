//! Typed client for submitting TrainingJobs and observing them.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::{retry_with_backoff, RetryConfig};
use crate::crd::{Condition, ConditionType, TrainingJob, TrainingJobSpec};
use crate::kubernetes::{ClusterApi, JobKey};
use crate::topology;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub spec: TrainingJobSpec,
}

/// One line of output from one pod of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub pod: String,
    pub line: String,
}

#[derive(Clone)]
pub struct TrainingClient {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    retry: RetryConfig,
}

impl TrainingClient {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            retry: RetryConfig::default(),
        }
    }

    /// Same cluster, different namespace.
    pub fn namespaced(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..self.clone()
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, name: &str) -> JobKey {
        JobKey::new(&self.namespace, name)
    }

    /// Submits a job. Specs that could never run are rejected before reaching the cluster.
    pub async fn create(&self, request: CreateJobRequest) -> Result<TrainingJob> {
        topology::validate(&request.name, &request.spec)?;

        let mut job = TrainingJob::new(&request.name, request.spec);
        job.metadata.namespace = Some(self.namespace.clone());

        let created = retry_with_backoff(&self.retry, "create_job", || {
            let cluster = self.cluster.clone();
            let job = job.clone();
            async move { cluster.create_job(job).await }
        })
        .await?;
        info!("Created TrainingJob: {}", created.key());
        Ok(created)
    }

    pub async fn get(&self, name: &str) -> Result<TrainingJob> {
        let key = self.key(name);
        self.cluster
            .get_job(&key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("trainingjob {}", key)))
    }

    /// Conditions in the order they were recorded.
    pub async fn get_conditions(&self, name: &str) -> Result<Vec<Condition>> {
        Ok(self.get(name).await?.conditions().to_vec())
    }

    /// Polls until the job has recorded a True condition of one of the
    /// `expected` types. Fails early with `JobFailed` when the job fails and
    /// Failed was not expected, and with `Timeout` once `timeout` elapses.
    pub async fn wait_for_conditions(
        &self,
        name: &str,
        expected: &[ConditionType],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<TrainingJob> {
        let deadline = Instant::now() + timeout;
        let poll_interval = poll_interval.max(Duration::from_millis(10));

        loop {
            match self.get(name).await {
                Ok(job) => {
                    let reached = job
                        .conditions()
                        .iter()
                        .any(|c| c.is_true() && expected.contains(&c.condition_type));
                    if reached {
                        return Ok(job);
                    }
                    if let Some(failed) = job
                        .conditions()
                        .iter()
                        .find(|c| c.is_true() && c.condition_type == ConditionType::Failed)
                    {
                        return Err(Error::JobFailed {
                            name: name.to_string(),
                            message: format!("{}: {}", failed.reason, failed.message),
                        });
                    }
                }
                Err(e) if e.is_transient() => warn!(job = name, error = %e, "poll failed, retrying"),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(format!(
                    "job {} did not reach any of {:?} within {:?}",
                    name, expected, timeout
                )));
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Names of the job's pods, coordinator role first, then by index.
    pub async fn list_pod_names(&self, name: &str) -> Result<Vec<String>> {
        let job = self.get(name).await?;
        let uid = job.metadata.uid.clone().unwrap_or_default();
        let mut pods: Vec<_> = self
            .cluster
            .list_pods(&job.key())
            .await?
            .into_iter()
            .filter(|p| p.owner.uid == uid)
            .collect();
        pods.sort_by_key(|p| (topology::role_rank(&job.spec, &p.role), p.index));
        Ok(pods.into_iter().map(|p| p.name).collect())
    }

    /// Log lines of every pod of the job, tagged with the pod name.
    ///
    /// With `follow` on a job that is still running, lines from all pods are
    /// interleaved as they arrive and the stream lasts as long as the pods do.
    /// Otherwise each pod's existing output is returned in pod order and the
    /// stream ends. Dropping the stream stops reading.
    pub async fn stream_logs(&self, name: &str, follow: bool) -> Result<BoxStream<'static, Result<LogLine>>> {
        let job = self.get(name).await?;
        let follow = follow && !job.is_terminal();
        let pods = self.list_pod_names(name).await?;
        debug!(job = name, pods = pods.len(), follow, "opening log streams");

        let mut streams = Vec::with_capacity(pods.len());
        for pod in pods {
            let lines = self.cluster.pod_logs(&self.namespace, &pod, follow).await?;
            streams.push(
                lines
                    .map_ok(move |line| LogLine {
                        pod: pod.clone(),
                        line,
                    })
                    .boxed(),
            );
        }

        if follow {
            Ok(stream::select_all(streams).boxed())
        } else {
            Ok(stream::iter(streams).flatten().boxed())
        }
    }

    /// Deletes the job. Deleting a job that does not exist succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        let existed = retry_with_backoff(&self.retry, "delete_job", || {
            let cluster = self.cluster.clone();
            let key = key.clone();
            async move { cluster.delete_job(&key).await }
        })
        .await?;
        if existed {
            info!("Deleted TrainingJob: {}", key);
        } else {
            debug!(job = %key, "delete of absent job");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConditionStatus, PodTemplate, ReplicaSpec, TrainingJobStatus};
    use crate::kubernetes::MockClusterApi;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn spec() -> TrainingJobSpec {
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
        }
    }

    fn job_with(conditions: Vec<(ConditionType, ConditionStatus)>) -> TrainingJob {
        let mut job = TrainingJob::new("bert", spec());
        job.metadata.namespace = Some("default".to_string());
        job.status = Some(TrainingJobStatus {
            conditions: conditions
                .into_iter()
                .map(|(t, s)| Condition::new(t, s, "Test", "", Utc::now()))
                .collect(),
            ..Default::default()
        });
        job
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::with_max_attempts(3)
        }
    }

    #[tokio::test]
    async fn create_rejects_invalid_spec_without_calling_cluster() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_create_job().never();
        let client = TrainingClient::new(Arc::new(cluster), "default");

        let mut bad = spec();
        bad.replica_specs[0].replicas = -1;
        let err = client
            .create(CreateJobRequest {
                name: "bert".to_string(),
                spec: bad,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn create_retries_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut cluster = MockClusterApi::new();
        cluster.expect_create_job().times(2).returning(move |job| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Unavailable("api down".into()))
            } else {
                Ok(job)
            }
        });
        let client = TrainingClient::new(Arc::new(cluster), "default").with_retry(fast_retry());

        let job = client
            .create(CreateJobRequest {
                name: "bert".to_string(),
                spec: spec(),
            })
            .await
            .unwrap();
        assert_eq!(job.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_returns_job_failed_when_failure_not_expected() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_get_job().returning(|_| {
            Ok(Some(job_with(vec![
                (ConditionType::Created, ConditionStatus::True),
                (ConditionType::Failed, ConditionStatus::True),
            ])))
        });
        let client = TrainingClient::new(Arc::new(cluster), "default");

        let err = client
            .wait_for_conditions(
                "bert",
                &[ConditionType::Succeeded],
                Duration::from_secs(5),
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobFailed { .. }));

        let job = client
            .wait_for_conditions(
                "bert",
                &[ConditionType::Succeeded, ConditionType::Failed],
                Duration::from_secs(5),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        assert!(job.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_job()
            .returning(|_| Ok(Some(job_with(vec![(ConditionType::Created, ConditionStatus::True)]))));
        let client = TrainingClient::new(Arc::new(cluster), "default");

        let err = client
            .wait_for_conditions(
                "bert",
                &[ConditionType::Running],
                Duration::from_secs(3),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn delete_of_absent_job_succeeds() {
        let mut cluster = MockClusterApi::new();
        cluster.expect_delete_job().returning(|_| Ok(false));
        let client = TrainingClient::new(Arc::new(cluster), "default");
        client.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn namespaced_view_targets_other_namespace() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_get_job()
            .withf(|key: &JobKey| key.namespace == "research")
            .returning(|_| Ok(None));
        let client = TrainingClient::new(Arc::new(cluster), "default").namespaced("research");
        assert!(client.get("bert").await.unwrap_err().is_not_found());
    }
}
