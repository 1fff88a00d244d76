use crate::crd::{Condition, ConditionType};

/// Position of a phase in the lifecycle. Transitions never lower it.
pub fn rank(phase: ConditionType) -> u8 {
    match phase {
        ConditionType::Created => 0,
        ConditionType::Running | ConditionType::Restarting => 1,
        ConditionType::Succeeded | ConditionType::Failed => 2,
    }
}

/// Phase the condition list currently describes: the most recent condition
/// whose status is True.
pub fn current_phase(conditions: &[Condition]) -> Option<ConditionType> {
    conditions
        .iter()
        .rev()
        .find(|c| c.is_true())
        .map(|c| c.condition_type)
}

pub fn has_condition(conditions: &[Condition], condition_type: ConditionType) -> bool {
    conditions.iter().any(|c| c.condition_type == condition_type)
}

/// Whether moving from `from` to `to` is a legal forward step.
pub fn is_forward(from: Option<ConditionType>, to: ConditionType) -> bool {
    match from {
        None => true,
        Some(from) if from.is_terminal() => false,
        Some(from) => from != to && rank(to) >= rank(from),
    }
}
