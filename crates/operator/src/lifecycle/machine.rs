use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::state::{current_phase, has_condition, is_forward};
use crate::crd::{Condition, ConditionStatus, ConditionType};

pub const REASON_PODS_CREATED: &str = "PodsCreated";
pub const REASON_RUNNING: &str = "ReplicasRunning";
pub const REASON_RESTARTING: &str = "ReplicaRestarting";
pub const REASON_SUCCEEDED: &str = "AllReplicasSucceeded";
pub const REASON_BACKOFF_LIMIT: &str = "BackoffLimitExceeded";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Aggregated pod state for one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Pods the planner wants
    pub desired: usize,
    /// At least one pod has been issued to the cluster API
    pub pods_issued: bool,
    pub running: usize,
    /// Slots whose current pod reported Succeeded
    pub succeeded: usize,
    /// Some slot failed and is being recovered within its budget
    pub restarting: bool,
    /// Set when a role ran out of restarts
    pub exhausted: Option<String>,
}

/// A phase the job should be in, with the reason to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub phase: ConditionType,
    pub reason: String,
    pub message: String,
}

impl Transition {
    pub fn new(phase: ConditionType, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::new(ConditionType::Failed, REASON_INVALID_SPEC, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    /// Same phase, new reason or message
    Refreshed,
    Transitioned,
    /// Backward or post-terminal move, not applied
    Rejected,
}

impl Outcome {
    pub fn changed(self) -> bool {
        matches!(self, Outcome::Refreshed | Outcome::Transitioned)
    }
}

impl Observation {
    /// Phase the pods call for, or `None` before anything was issued.
    pub fn target(&self) -> Option<Transition> {
        if let Some(message) = &self.exhausted {
            return Some(Transition::new(ConditionType::Failed, REASON_BACKOFF_LIMIT, message.clone()));
        }
        if self.desired > 0 && self.succeeded == self.desired {
            return Some(Transition::new(
                ConditionType::Succeeded,
                REASON_SUCCEEDED,
                format!("all {} replicas succeeded", self.desired),
            ));
        }
        if self.restarting {
            return Some(Transition::new(
                ConditionType::Restarting,
                REASON_RESTARTING,
                "recreating failed replicas",
            ));
        }
        if self.running > 0 {
            return Some(Transition::new(
                ConditionType::Running,
                REASON_RUNNING,
                "replicas are running",
            ));
        }
        if self.pods_issued {
            return Some(Transition::new(
                ConditionType::Created,
                REASON_PODS_CREATED,
                "pods created",
            ));
        }
        None
    }
}

/// Moves the condition list toward `target`, appending entries only.
///
/// Leaving Running or Restarting records that condition as False before the
/// new phase is appended as True. Staying in the same phase only refreshes
/// reason, message and `lastUpdateTime`. `now` is clamped so transition times
/// never decrease.
pub fn advance(conditions: &mut Vec<Condition>, target: &Transition, now: DateTime<Utc>) -> Outcome {
    let now = conditions
        .iter()
        .map(|c| c.last_transition_time)
        .max()
        .map_or(now, |latest| latest.max(now));
    let current = current_phase(conditions);

    if current == Some(target.phase) {
        return match conditions
            .iter_mut()
            .rev()
            .find(|c| c.condition_type == target.phase && c.is_true())
        {
            Some(c) if c.reason != target.reason || c.message != target.message => {
                c.reason = target.reason.clone();
                c.message = target.message.clone();
                c.last_update_time = now;
                Outcome::Refreshed
            }
            _ => Outcome::Unchanged,
        };
    }

    if !is_forward(current, target.phase) {
        match current {
            Some(phase) if phase.is_terminal() => warn!(
                from = %phase,
                to = %target.phase,
                "ignoring transition out of terminal phase"
            ),
            _ => debug!(from = ?current, to = %target.phase, "ignoring backward transition"),
        }
        return Outcome::Rejected;
    }

    if let Some(phase @ (ConditionType::Running | ConditionType::Restarting)) = current {
        conditions.push(Condition::new(
            phase,
            ConditionStatus::False,
            target.reason.clone(),
            target.message.clone(),
            now,
        ));
    }
    conditions.push(Condition::new(
        target.phase,
        ConditionStatus::True,
        target.reason.clone(),
        target.message.clone(),
        now,
    ));
    Outcome::Transitioned
}

/// One evaluation pass: records Created once pods exist, then advances to the
/// phase the observation calls for.
pub fn evaluate(conditions: &mut Vec<Condition>, obs: &Observation, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    if obs.pods_issued && !has_condition(conditions, ConditionType::Created) && current_phase(conditions).is_none() {
        let created = Transition::new(ConditionType::Created, REASON_PODS_CREATED, "pods created");
        changed |= advance(conditions, &created, now).changed();
    }
    if let Some(target) = obs.target() {
        changed |= advance(conditions, &target, now).changed();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn types(conditions: &[Condition]) -> Vec<(ConditionType, ConditionStatus)> {
        conditions.iter().map(|c| (c.condition_type, c.status)).collect()
    }

    fn running(n: usize) -> Observation {
        Observation {
            desired: 2,
            pods_issued: true,
            running: n,
            ..Default::default()
        }
    }

    #[test]
    fn created_then_running_then_succeeded() {
        use ConditionStatus::*;
        use ConditionType::*;
        let t0 = Utc::now();
        let mut conditions = vec![];

        assert!(evaluate(&mut conditions, &running(0), t0));
        assert_eq!(types(&conditions), vec![(Created, True)]);

        assert!(evaluate(&mut conditions, &running(2), t0 + Duration::seconds(1)));
        assert!(!evaluate(&mut conditions, &running(2), t0 + Duration::seconds(2)));

        let done = Observation {
            desired: 2,
            pods_issued: true,
            succeeded: 2,
            ..Default::default()
        };
        assert!(evaluate(&mut conditions, &done, t0 + Duration::seconds(3)));
        assert_eq!(
            types(&conditions),
            vec![(Created, True), (Running, True), (Running, False), (Succeeded, True)]
        );
    }

    #[test]
    fn first_pass_can_jump_straight_past_created() {
        use ConditionType::*;
        let mut conditions = vec![];
        evaluate(&mut conditions, &running(1), Utc::now());
        let phases: Vec<ConditionType> = conditions.iter().map(|c| c.condition_type).collect();
        assert_eq!(phases, vec![Created, Running]);
    }

    #[test]
    fn restarting_round_trip() {
        use ConditionStatus::*;
        use ConditionType::*;
        let now = Utc::now();
        let mut conditions = vec![];
        evaluate(&mut conditions, &running(2), now);

        let restarting = Observation {
            restarting: true,
            ..running(1)
        };
        evaluate(&mut conditions, &restarting, now);
        evaluate(&mut conditions, &running(2), now);
        assert_eq!(
            types(&conditions)[2..].to_vec(),
            vec![(Running, False), (Restarting, True), (Restarting, False), (Running, True)]
        );
    }

    #[test]
    fn terminal_phase_is_sticky() {
        let now = Utc::now();
        let mut conditions = vec![];
        advance(&mut conditions, &Transition::invalid_spec("no replicas"), now);
        let before = conditions.clone();

        let outcome = advance(
            &mut conditions,
            &Transition::new(ConditionType::Running, REASON_RUNNING, ""),
            now,
        );
        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(conditions, before);
        assert!(!evaluate(&mut conditions, &running(2), now));
    }

    #[test]
    fn backward_move_is_a_noop() {
        let now = Utc::now();
        let mut conditions = vec![];
        evaluate(&mut conditions, &running(1), now);
        let outcome = advance(
            &mut conditions,
            &Transition::new(ConditionType::Created, REASON_PODS_CREATED, "pods created"),
            now,
        );
        assert_eq!(outcome, Outcome::Rejected);
    }

    #[test]
    fn same_phase_refresh_touches_update_time_only() {
        let t0 = Utc::now();
        let mut conditions = vec![];
        advance(
            &mut conditions,
            &Transition::new(ConditionType::Running, REASON_RUNNING, "1 running"),
            t0,
        );
        let later = t0 + Duration::seconds(30);
        let outcome = advance(
            &mut conditions,
            &Transition::new(ConditionType::Running, REASON_RUNNING, "2 running"),
            later,
        );
        assert_eq!(outcome, Outcome::Refreshed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].last_update_time, later);
    }

    #[test]
    fn transition_times_never_decrease() {
        let t0 = Utc::now();
        let mut conditions = vec![];
        evaluate(&mut conditions, &running(1), t0);
        // Clock skew: an earlier wall-clock reading on a later pass.
        let exhausted = Observation {
            exhausted: Some("worker exceeded 0 restarts".to_string()),
            ..running(0)
        };
        evaluate(&mut conditions, &exhausted, t0 - Duration::minutes(5));

        let times: Vec<_> = conditions.iter().map(|c| c.last_transition_time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(current_phase(&conditions), Some(ConditionType::Failed));
    }
}
