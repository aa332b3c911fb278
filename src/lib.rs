//! jobgraph
//!
//! An in-process execution substrate: a dependency-graph job scheduler
//! running on a fixed pool of runner threads, plus a load-once resource
//! cache that guarantees at most one concurrent load per resource.
//!
//! # Example
//!
//! ```no_run
//! use jobgraph::runtime::scheduler::{Batch, Priority, RunnerPool, Stage, StageOutcome};
//!
//! fn main() -> jobgraph::Result<()> {
//!     let pool = RunnerPool::with_runners(4)?;
//!     let mut batch = Batch::new(Stage::from_fn(Priority::NORMAL, |_| {
//!         println!("first");
//!         StageOutcome::Finished
//!     }));
//!     batch.queue_as_new_finished_stage(Stage::from_fn(Priority::NORMAL, |_| {
//!         println!("second");
//!         StageOutcome::Finished
//!     }))?;
//!     pool.queue_batch(batch)?;
//!     pool.run_until_idle(std::time::Duration::from_secs(1));
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/jobgraph")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod driver;
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use runtime::cache::{CacheError, Guid, ListenerId, LoadOutcome, LoadRequest, ResourceCache, ResourceLoader};
pub use runtime::identifier::{Identifier, IdentifierStorage};
pub use runtime::scheduler::{
    Batch, PoolError, PoolHandle, Priority, RunnerPool, SchedulerConfig, Stage, StageError, StageOutcome,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "jobgraph";
