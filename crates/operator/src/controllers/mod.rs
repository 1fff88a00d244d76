pub mod gc;
pub mod queue;
pub mod training_job;

use std::time::Duration;

pub use gc::GarbageCollector;
pub use queue::WorkQueue;
pub use training_job::{ControllerSettings, TrainingJobController};

/// What the controller should do with a key after a reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Reconcile again after the delay even if nothing changes
    Requeue(Duration),
    /// Wait for the next change event
    AwaitChange,
}
