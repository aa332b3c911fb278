//! Scheduler errors

use std::io;
use std::ops::Range;

use thiserror::Error;

use super::stage::{StageId, StageState};

/// Stage wiring / signalling result
pub type StageResult<T> = Result<T, StageError>;

/// Misuse of the stage graph.
///
/// None of these are recoverable in the sense of "retry"; they indicate a
/// programming error in the caller. The graph is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("{stage} has already finished")]
    AlreadyFinished { stage: StageId },

    #[error("{stage} is already {state:?}")]
    AlreadyScheduled { stage: StageId, state: StageState },

    #[error("{stage} still waits on {pending} prerequisite(s)")]
    PrerequisitesPending { stage: StageId, pending: u32 },

    #[error("{stage} cannot depend on itself")]
    SelfDependency { stage: StageId },

    #[error("Runner pool has been shut down")]
    PoolShutDown,
}

/// Pool start-up errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Runners have already been started")]
    AlreadyStarted,

    #[error("Runner pool has been shut down")]
    ShutDown,

    #[error("At least one runner is required")]
    NoRunners,

    #[error("{name} worker range {range:?} exceeds runner count {total}")]
    InvalidRange {
        name: &'static str,
        range: Range<usize>,
        total: usize,
    },

    #[error("Failed to spawn runner thread: {0}")]
    Spawn(#[from] io::Error),
}
