use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle condition kinds reported on a TrainingJob.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionType {
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

impl ConditionType {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConditionType::Succeeded | ConditionType::Failed)
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionType::Created => write!(f, "Created"),
            ConditionType::Running => write!(f, "Running"),
            ConditionType::Restarting => write!(f, "Restarting"),
            ConditionType::Succeeded => write!(f, "Succeeded"),
            ConditionType::Failed => write!(f, "Failed"),
        }
    }
}

impl FromStr for ConditionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Created" => Ok(ConditionType::Created),
            "Running" => Ok(ConditionType::Running),
            "Restarting" => Ok(ConditionType::Restarting),
            "Succeeded" => Ok(ConditionType::Succeeded),
            "Failed" => Ok(ConditionType::Failed),
            other => Err(format!("unknown condition type {:?}", other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            last_update_time: now,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Observed pod counts for one role.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct ReplicaStatus {
    /// Pods pending or running
    #[serde(default)]
    pub active: i32,

    #[serde(default)]
    pub succeeded: i32,

    /// Pods currently reporting Failed
    #[serde(default)]
    pub failed: i32,

    /// Replacement pods created after failures
    #[serde(default)]
    pub restarts: i32,
}
