pub mod common;
pub mod training_job;

pub use common::{Condition, ConditionStatus, ConditionType, ReplicaStatus};
pub use training_job::{
    CleanPodPolicy, PodTemplate, ReplicaSpec, ResourceRequirements, RestartPolicy, RunPolicy,
    TrainingJob, TrainingJobSpec, TrainingJobStatus, COORDINATOR_ROLE, POD_CLEANUP_FINALIZER,
};
