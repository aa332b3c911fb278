//! Headless drivers behind the `jobgraph` binary.
//!
//! Each driver builds work on a [`RunnerPool`](crate::runtime::scheduler::RunnerPool),
//! lends the calling thread to the pool while it waits, and folds every
//! failure into a single flag that the binary turns into its exit status.

pub mod load;
pub mod stress;

use crate::runtime::scheduler::{PoolError, RunnerPool, SchedulerConfig};
use crate::util::config::RuntimeConfig;

/// Start a runner pool as configured.
pub fn start_pool(config: &RuntimeConfig) -> Result<RunnerPool, PoolError> {
    RunnerPool::with_config(SchedulerConfig::from(&config.runners))
}
