//! Job-level condition state machine.
//!
//! `Created -> Running <-> Restarting -> {Succeeded, Failed}`. The condition
//! list is append-only and terminal phases are final.

mod machine;
mod state;

pub use machine::{
    advance, evaluate, Observation, Outcome, Transition, REASON_BACKOFF_LIMIT, REASON_INVALID_SPEC,
    REASON_PODS_CREATED, REASON_RESTARTING, REASON_RUNNING, REASON_SUCCEEDED,
};
pub use state::{current_phase, has_condition, is_forward, rank};
