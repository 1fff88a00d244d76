//! Maps a TrainingJob to the exact set of pods that should exist for it.
//!
//! Everything here is pure: the same job always yields the same pods in the
//! same order, which is what lets the reconciler diff against it repeatedly.

use std::collections::{BTreeMap, HashSet};

use kube::ResourceExt;
use serde::Serialize;

use crate::crd::{ReplicaSpec, ResourceRequirements, TrainingJob, TrainingJobSpec, COORDINATOR_ROLE};
use crate::{Error, Result};

/// Rendezvous port exported to every replica.
pub const MASTER_PORT: u16 = 23456;

const MAX_POD_NAME_LEN: usize = 63;

/// Environment keys the planner owns; template values for them are ignored.
pub const RESERVED_ENV: [&str; 6] = [
    "MASTER_ADDR",
    "MASTER_PORT",
    "WORLD_SIZE",
    "RANK",
    "PET_NNODES",
    "PET_NPROC_PER_NODE",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredPod {
    pub name: String,
    pub namespace: String,
    pub job_name: String,
    pub role: String,
    pub index: i32,
    /// Global rank across roles, coordinator first
    pub rank: i32,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceRequirements,
}

pub fn pod_name(job_name: &str, role: &str, index: i32) -> String {
    format!("{}-{}-{}", job_name, role, index)
}

/// Replica specs with the coordinator role first, the rest in declaration order.
pub fn ordered_roles(spec: &TrainingJobSpec) -> Vec<&ReplicaSpec> {
    let (mut coordinator, rest): (Vec<&ReplicaSpec>, Vec<&ReplicaSpec>) = spec
        .replica_specs
        .iter()
        .partition(|r| r.role == COORDINATOR_ROLE);
    coordinator.extend(rest);
    coordinator
}

/// Ordering key for a role: its position in [`ordered_roles`].
pub fn role_rank(spec: &TrainingJobSpec, role: &str) -> usize {
    ordered_roles(spec)
        .iter()
        .position(|r| r.role == role)
        .unwrap_or(usize::MAX)
}

pub fn plan(job: &TrainingJob) -> Vec<DesiredPod> {
    let job_name = job.name_any();
    let namespace = job.namespace().unwrap_or_default();
    let roles = ordered_roles(&job.spec);

    let world_size: i32 = roles.iter().map(|r| r.replicas.max(0)).sum();
    let master_addr = roles
        .iter()
        .find(|r| r.replicas > 0)
        .map(|r| pod_name(&job_name, &r.role, 0))
        .unwrap_or_default();

    let mut pods = Vec::with_capacity(world_size.max(0) as usize);
    let mut rank = 0;
    for replica in roles {
        for index in 0..replica.replicas.max(0) {
            let template = &replica.template;

            let mut env: BTreeMap<String, String> = template
                .env
                .iter()
                .filter(|(k, _)| !RESERVED_ENV.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            env.insert("MASTER_ADDR".to_string(), master_addr.clone());
            env.insert("MASTER_PORT".to_string(), MASTER_PORT.to_string());
            env.insert("WORLD_SIZE".to_string(), world_size.to_string());
            env.insert("PET_NNODES".to_string(), world_size.to_string());
            env.insert("RANK".to_string(), rank.to_string());
            if let Some(procs) = template.procs_per_replica {
                env.insert("PET_NPROC_PER_NODE".to_string(), procs.to_string());
            }

            pods.push(DesiredPod {
                name: pod_name(&job_name, &replica.role, index),
                namespace: namespace.clone(),
                job_name: job_name.clone(),
                role: replica.role.clone(),
                index,
                rank,
                image: template.image.clone(),
                command: template.command.clone(),
                args: template.args.clone(),
                env,
                resources: template.resources.clone(),
            });
            rank += 1;
        }
    }
    pods
}

/// Rejects specs that can never converge. Failures are terminal for the job.
pub fn validate(job_name: &str, spec: &TrainingJobSpec) -> Result<()> {
    if spec.replica_specs.is_empty() {
        return Err(Error::InvalidSpec("no replica specs".to_string()));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for replica in &spec.replica_specs {
        let role = replica.role.as_str();
        if !is_dns_label(role) {
            return Err(Error::InvalidSpec(format!(
                "role {:?} is not a lowercase DNS label",
                role
            )));
        }
        if !seen.insert(role) {
            return Err(Error::InvalidSpec(format!("role {} declared twice", role)));
        }
        if replica.replicas < 0 {
            return Err(Error::InvalidSpec(format!(
                "role {} has negative replicas ({})",
                role, replica.replicas
            )));
        }
        if role == COORDINATOR_ROLE && replica.replicas != 1 {
            return Err(Error::InvalidSpec(format!(
                "role {} must have exactly 1 replica, got {}",
                role, replica.replicas
            )));
        }
        if replica.template.image.trim().is_empty() {
            return Err(Error::InvalidSpec(format!("role {} has no image", role)));
        }
        if replica.max_restarts.is_some_and(|n| n < 0) {
            return Err(Error::InvalidSpec(format!("role {} has negative maxRestarts", role)));
        }
        if replica.template.procs_per_replica.is_some_and(|n| n < 1) {
            return Err(Error::InvalidSpec(format!(
                "role {} must run at least one process per replica",
                role
            )));
        }
        if replica.replicas > 0 {
            let longest = pod_name(job_name, role, replica.replicas - 1);
            if longest.len() > MAX_POD_NAME_LEN {
                return Err(Error::InvalidSpec(format!(
                    "pod name {} exceeds {} characters",
                    longest, MAX_POD_NAME_LEN
                )));
            }
        }
        total += replica.replicas;
    }

    if spec.run_policy.backoff_limit.is_some_and(|n| n < 0) {
        return Err(Error::InvalidSpec("negative backoffLimit".to_string()));
    }
    if total == 0 {
        return Err(Error::InvalidSpec("job requests zero pods".to_string()));
    }
    Ok(())
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_POD_NAME_LEN
        && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{PodTemplate, RestartPolicy, RunPolicy};

    fn replica(role: &str, replicas: i32) -> ReplicaSpec {
        ReplicaSpec {
            role: role.to_string(),
            replicas,
            max_restarts: None,
            template: PodTemplate {
                image: "trainer:latest".to_string(),
                ..Default::default()
            },
        }
    }

    fn job(name: &str, replicas: Vec<ReplicaSpec>) -> TrainingJob {
        let mut job = TrainingJob::new(
            name,
            TrainingJobSpec {
                replica_specs: replicas,
                restart_policy: RestartPolicy::OnFailure,
                run_policy: RunPolicy::default(),
            },
        );
        job.metadata.namespace = Some("default".to_string());
        job
    }

    #[test]
    fn coordinator_first_then_indices() {
        let job = job("job", vec![replica("worker", 2), replica("master", 1)]);
        let names: Vec<String> = plan(&job).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["job-master-0", "job-worker-0", "job-worker-1"]);
    }

    #[test]
    fn plan_is_byte_identical_across_calls() {
        let mut worker = replica("worker", 3);
        worker.template.env.insert("NCCL_DEBUG".to_string(), "INFO".to_string());
        worker.template.env.insert("HF_HOME".to_string(), "/cache".to_string());
        let job = job("llm", vec![replica("master", 1), worker]);

        let first = serde_json::to_vec(&plan(&job)).unwrap();
        let second = serde_json::to_vec(&plan(&job)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rendezvous_environment() {
        let mut worker = replica("worker", 2);
        worker.template.procs_per_replica = Some(8);
        worker.template.env.insert("RANK".to_string(), "99".to_string());
        let job = job("fsdp", vec![replica("master", 1), worker]);

        let pods = plan(&job);
        assert_eq!(pods.len(), 3);
        let last = &pods[2];
        assert_eq!(last.name, "fsdp-worker-1");
        assert_eq!(last.rank, 2);
        assert_eq!(last.env["RANK"], "2");
        assert_eq!(last.env["WORLD_SIZE"], "3");
        assert_eq!(last.env["MASTER_ADDR"], "fsdp-master-0");
        assert_eq!(last.env["MASTER_PORT"], "23456");
        assert_eq!(last.env["PET_NPROC_PER_NODE"], "8");
        assert!(!pods[0].env.contains_key("PET_NPROC_PER_NODE"));
    }

    #[test]
    fn worker_only_jobs_rendezvous_on_first_worker() {
        let job = job("ddp", vec![replica("worker", 2)]);
        let pods = plan(&job);
        assert_eq!(pods[0].env["MASTER_ADDR"], "ddp-worker-0");
        assert_eq!(pods[0].rank, 0);
    }

    #[test]
    fn rejects_invalid_specs() {
        let cases = vec![
            vec![],
            vec![replica("worker", 0)],
            vec![replica("worker", -1)],
            vec![replica("master", 2)],
            vec![replica("Worker", 1)],
            vec![replica("worker", 1), replica("worker", 1)],
        ];
        for replicas in cases {
            let spec = job("j", replicas).spec;
            assert!(
                matches!(validate("j", &spec), Err(Error::InvalidSpec(_))),
                "expected rejection for {:?}",
                spec.replica_specs
            );
        }

        let mut missing_image = replica("worker", 1);
        missing_image.template.image = String::new();
        let spec = job("j", vec![missing_image]).spec;
        assert!(validate("j", &spec).is_err());

        let long_name = "x".repeat(60);
        let spec = job(&long_name, vec![replica("worker", 1)]).spec;
        assert!(validate(&long_name, &spec).is_err());
    }

    #[test]
    fn accepts_master_worker_spec() {
        let spec = job("j", vec![replica("master", 1), replica("worker", 4)]).spec;
        assert!(validate("j", &spec).is_ok());
    }
}
