//! Job graph scheduler
//!
//! This module provides the [`RunnerPool`], a fixed set of runner threads
//! that execute [`Stage`]s as soon as every prerequisite stage has finished.
//!
//! # Architecture
//!
//! - [`Stage`] - node of the job graph, with prerequisite count and dependents
//! - [`Batch`] - start/finish pair used to compose sub-graphs
//! - [`ReadyQueue`] - priority-ordered FIFO of runnable stages
//! - [`WorkStealer`] - per-runner and per-affinity queues plus stealing
//! - [`RunnerPool`] / [`PoolHandle`] - runner threads and the shared handle
//!   stages use to queue and signal work
//!
//! Any thread may call [`PoolHandle::run_one_ready_job`] to lend a hand
//! while it waits on a result, which is how a host's main thread avoids
//! blocking.

pub mod batch;
pub mod errors;
pub mod queue;
pub mod stage;
pub mod work_stealer;

pub use batch::Batch;
pub use errors::{PoolError, StageError, StageResult};
pub use queue::ReadyQueue;
pub use stage::{
    Affinity, ExternalCompletion, Job, Priority, Stage, StageBuilder, StageContext, StageId, StageOutcome,
    StageState,
};
pub use work_stealer::{AffinityRanges, WorkStealer};

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, Range};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

thread_local! {
    /// (pool id, runner index) of the runner owning this thread, if any.
    static CURRENT_RUNNER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Runners serving [`Affinity::Performance`] stages.
    pub performance_runners: usize,
    /// Runners serving [`Affinity::Efficiency`] stages.
    pub efficiency_runners: usize,
    /// Let every runner take every stage regardless of affinity.
    pub allow_all_work_on_all_runners: bool,
    /// Runner thread stack size.
    pub stack_size: usize,
    /// Whether idle runners steal from other runners' local queues.
    pub use_work_stealing: bool,
    /// How long an idle runner sleeps before polling again.
    pub idle_timeout: Duration,
    /// Runner thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            performance_runners: num_cpus,
            efficiency_runners: 0,
            allow_all_work_on_all_runners: true,
            stack_size: 2 * 1024 * 1024,
            use_work_stealing: true,
            idle_timeout: Duration::from_millis(1),
            thread_name_prefix: "jobgraph-runner".to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Configuration for `count` runners that all accept all work.
    pub fn with_runners(count: usize) -> Self {
        Self {
            performance_runners: count,
            efficiency_runners: 0,
            allow_all_work_on_all_runners: true,
            ..Self::default()
        }
    }

    /// Total number of runners.
    #[inline]
    pub fn runner_count(&self) -> usize {
        self.performance_runners + self.efficiency_runners
    }

    /// Performance runners first, efficiency runners after them.
    pub fn ranges(&self) -> AffinityRanges {
        let total = self.runner_count();
        AffinityRanges {
            performance: 0..self.performance_runners,
            efficiency: self.performance_runners..total,
            allowed: if self.allow_all_work_on_all_runners {
                0..total
            } else {
                0..0
            },
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total stages queued.
    pub stages_queued: AtomicUsize,
    /// Total stages executed.
    pub stages_completed: AtomicUsize,
    /// Stages executed by a thread outside the pool.
    pub stages_run_cooperatively: AtomicUsize,
    /// Stages whose job panicked.
    pub stages_panicked: AtomicUsize,
    /// Total steal attempts.
    pub steal_attempts: AtomicUsize,
    /// Total successful steals.
    pub steal_success: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Peak number of concurrently executing stages.
    pub peak_parallelism: AtomicUsize,
}

impl SchedulerStats {
    #[inline]
    pub fn record_queued(&self) {
        self.stages_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.stages_completed.fetch_add(1, Ordering::Relaxed);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cooperative(&self) {
        self.stages_run_cooperatively
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_panic(&self) {
        self.stages_panicked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_steal(
        &self,
        success: bool,
    ) {
        self.steal_attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.steal_success.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Raise the recorded peak to `current` if it is higher.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        self.peak_parallelism
            .fetch_max(current, Ordering::Relaxed);
    }

    /// Get steal success rate.
    pub fn steal_success_rate(&self) -> f64 {
        let attempts = self.steal_attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 1.0;
        }
        self.steal_success.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    /// Plain copy of the counters, for reporting.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            stages_queued: self.stages_queued.load(Ordering::Relaxed),
            stages_completed: self.stages_completed.load(Ordering::Relaxed),
            stages_run_cooperatively: self
                .stages_run_cooperatively
                .load(Ordering::Relaxed),
            stages_panicked: self.stages_panicked.load(Ordering::Relaxed),
            steal_attempts: self.steal_attempts.load(Ordering::Relaxed),
            steal_success: self.steal_success.load(Ordering::Relaxed),
            total_exec_time_us: self.total_exec_time_us.load(Ordering::Relaxed),
            peak_parallelism: self.peak_parallelism.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub stages_queued: usize,
    pub stages_completed: usize,
    pub stages_run_cooperatively: usize,
    pub stages_panicked: usize,
    pub steal_attempts: usize,
    pub steal_success: usize,
    pub total_exec_time_us: usize,
    pub peak_parallelism: usize,
}

/// State shared by the pool owner, every handle and every runner.
#[derive(Debug)]
struct PoolShared {
    config: SchedulerConfig,
    stealer: WorkStealer,
    stats: SchedulerStats,
    /// Cleared on shutdown.
    running: AtomicBool,
    started: AtomicBool,
    /// Stages sitting in a queue.
    queued: AtomicUsize,
    /// Stages whose job is running.
    executing: AtomicUsize,
    /// Stages deferred to an [`ExternalCompletion`] token or to
    /// [`Stage::signal_finished`].
    external_in_flight: AtomicUsize,
    /// Runners with nothing to do.
    idle_runners: AtomicUsize,
    sleep_lock: Mutex<()>,
    wake: Condvar,
}

/// Cheap, cloneable handle to a runner pool.
///
/// Stages, loaders and completion tokens hold one of these. Queueing through
/// a handle works before the runners start and after the owning
/// [`RunnerPool`] is gone, but nothing executes unless some thread calls
/// [`run_one_ready_job`](Self::run_one_ready_job).
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl fmt::Debug for PoolHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PoolHandle")
            .field("queued", &self.queued_count())
            .field("executing", &self.executing_count())
            .field("idle_runners", &self.idle_runner_count())
            .finish()
    }
}

impl PoolHandle {
    #[inline]
    fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Hand a stage with no outstanding prerequisites to the pool.
    ///
    /// Pass-through stages finish immediately on the calling thread.
    pub fn queue(
        &self,
        stage: &Stage,
    ) -> StageResult<()> {
        if !self.is_running() {
            return Err(StageError::PoolShutDown);
        }
        stage
            .mark_queued()
            .inspect_err(|err| error!(%err, name = stage.name(), "invalid queue request"))?;

        if stage.is_pass_through() {
            self.finish_pass_through(stage.clone());
        } else {
            self.push_ready(stage.clone());
        }
        Ok(())
    }

    /// Queue a batch's start stage. An invalid batch is already done.
    pub fn queue_batch(
        &self,
        batch: Batch,
    ) -> StageResult<()> {
        match batch.start_stage() {
            Some(start) => self.queue(start),
            None => Ok(()),
        }
    }

    /// Run one ready stage on the calling thread.
    ///
    /// Returns `false` if nothing was runnable.
    pub fn run_one_ready_job(&self) -> bool {
        let stage = match self.current_runner_index() {
            Some(runner) => self
                .shared
                .stealer
                .next_for_runner(runner, &self.shared.stats),
            None => self.shared.stealer.next_for_any(),
        };
        match stage {
            Some(stage) => {
                if self.current_runner_index().is_none() {
                    self.shared.stats.record_cooperative();
                }
                self.run_stage(stage);
                true
            }
            None => false,
        }
    }

    /// Help out until `done` returns `true`.
    pub fn run_until(
        &self,
        mut done: impl FnMut() -> bool,
    ) {
        let backoff = Backoff::new();
        while !done() {
            if self.run_one_ready_job() {
                backoff.reset();
            } else if backoff.is_completed() {
                thread::sleep(self.shared.config.idle_timeout);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Help out until no stage is queued, executing or awaiting external
    /// completion. Returns `false` if `timeout` elapsed first.
    pub fn run_until_idle(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        self.run_until(|| {
            if !self.has_pending_work() && !self.has_external_work_in_flight() {
                return true;
            }
            timed_out = Instant::now() >= deadline;
            timed_out
        });
        !timed_out
    }

    /// Whether any stage is queued or executing.
    #[inline]
    pub fn has_pending_work(&self) -> bool {
        self.shared.queued.load(Ordering::Acquire) > 0 || self.shared.executing.load(Ordering::Acquire) > 0
    }

    /// Whether any stage is waiting to be finished from outside its job,
    /// through a token or [`Stage::signal_finished`].
    #[inline]
    pub fn has_external_work_in_flight(&self) -> bool {
        self.shared.external_in_flight.load(Ordering::Acquire) > 0
    }

    /// Number of runners currently without work.
    #[inline]
    pub fn idle_runner_count(&self) -> usize {
        self.shared.idle_runners.load(Ordering::Acquire)
    }

    #[inline]
    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    #[inline]
    pub fn executing_count(&self) -> usize {
        self.shared.executing.load(Ordering::Acquire)
    }

    /// Number of runner threads started.
    #[inline]
    pub fn runner_count(&self) -> usize {
        self.shared.stealer.num_runners()
    }

    /// Index of the calling runner, if the calling thread is one of this
    /// pool's runners.
    pub fn current_runner_index(&self) -> Option<usize> {
        let pool = self.id();
        CURRENT_RUNNER
            .with(Cell::get)
            .and_then(|(owner, runner)| (owner == pool).then_some(runner))
    }

    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub(crate) fn external_started(&self) {
        self.shared
            .external_in_flight
            .fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn external_finished(&self) {
        self.shared
            .external_in_flight
            .fetch_sub(1, Ordering::AcqRel);
    }

    /// Release the dependents of a stage that just finished.
    ///
    /// Dependents that became ready are queued; pass-through ones finish in
    /// place. Iterative, so long pass-through chains do not grow the stack.
    pub(crate) fn propagate(
        &self,
        finished: &Stage,
    ) {
        let mut ready: VecDeque<Stage> = finished.release_dependents().into_iter().collect();
        while let Some(stage) = ready.pop_front() {
            if let Err(state) = stage.transition(StageState::NotQueued, StageState::Queued) {
                trace!(stage = %stage.id(), ?state, "dependent already moved on");
                continue;
            }
            if stage.is_pass_through() {
                if stage
                    .transition(StageState::Queued, StageState::Finished)
                    .is_ok()
                {
                    ready.extend(stage.release_dependents());
                }
            } else {
                self.push_ready(stage);
            }
        }
    }

    fn finish_pass_through(
        &self,
        stage: Stage,
    ) {
        if stage
            .transition(StageState::Queued, StageState::Finished)
            .is_ok()
        {
            self.propagate(&stage);
        }
    }

    fn push_ready(
        &self,
        stage: Stage,
    ) {
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        self.shared.stats.record_queued();

        let stage = match self.current_runner_index() {
            Some(runner) => match self.shared.stealer.push_local(runner, stage) {
                Ok(()) => return self.notify(),
                Err(stage) => stage,
            },
            None => stage,
        };
        self.shared.stealer.push_shared(stage);
        self.notify();
    }

    fn notify(&self) {
        if self.shared.idle_runners.load(Ordering::SeqCst) > 0 {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.wake.notify_all();
        }
    }

    fn run_stage(
        &self,
        stage: Stage,
    ) {
        // Count as executing before leaving the queued count, so pending
        // work never reads as zero in between.
        let executing = self.shared.executing.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.queued.fetch_sub(1, Ordering::AcqRel);
        self.shared.stats.update_parallelism(executing);

        let start = Instant::now();
        match stage.execute(self) {
            Ok(outcome) => {
                trace!(stage = %stage.id(), name = stage.name(), ?outcome, "stage executed");
                self.shared
                    .stats
                    .record_completed(start.elapsed().as_micros() as usize);
            }
            Err(err) => error!(%err, "dequeued stage could not execute"),
        }

        self.shared.executing.fetch_sub(1, Ordering::AcqRel);
    }

    fn park(
        &self,
        runner: usize,
    ) {
        let mut guard = self.shared.sleep_lock.lock();
        if !self.is_running() || self.shared.stealer.has_work_for(runner) {
            return;
        }
        self.shared
            .wake
            .wait_for(&mut guard, self.shared.config.idle_timeout);
    }

    /// Runner thread main loop.
    fn runner_loop(
        self,
        runner: usize,
    ) {
        CURRENT_RUNNER.with(|current| current.set(Some((self.id(), runner))));
        debug!(runner, "runner started");

        let backoff = Backoff::new();
        let mut idle = false;
        while self.is_running() {
            if let Some(stage) = self
                .shared
                .stealer
                .next_for_runner(runner, &self.shared.stats)
            {
                if idle {
                    idle = false;
                    self.shared.idle_runners.fetch_sub(1, Ordering::SeqCst);
                }
                backoff.reset();
                self.run_stage(stage);
                continue;
            }

            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }
            if !idle {
                idle = true;
                self.shared.idle_runners.fetch_add(1, Ordering::SeqCst);
            }
            self.park(runner);
        }

        if idle {
            self.shared.idle_runners.fetch_sub(1, Ordering::SeqCst);
        }
        CURRENT_RUNNER.with(|current| current.set(None));
        debug!(runner, "runner stopped");
    }
}

/// Owner of the runner threads.
///
/// Dereferences to [`PoolHandle`]. Dropping the pool shuts the runners down;
/// stages still queued at that point never run.
#[derive(Debug)]
pub struct RunnerPool {
    handle: PoolHandle,
    runners: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl RunnerPool {
    /// Create a pool without starting any runner.
    pub fn build(config: SchedulerConfig) -> Self {
        let stealer = WorkStealer::new(config.use_work_stealing);
        Self {
            handle: PoolHandle {
                shared: Arc::new(PoolShared {
                    config,
                    stealer,
                    stats: SchedulerStats::default(),
                    running: AtomicBool::new(true),
                    started: AtomicBool::new(false),
                    queued: AtomicUsize::new(0),
                    executing: AtomicUsize::new(0),
                    external_in_flight: AtomicUsize::new(0),
                    idle_runners: AtomicUsize::new(0),
                    sleep_lock: Mutex::new(()),
                    wake: Condvar::new(),
                }),
            },
            runners: Mutex::new(Vec::new()),
        }
    }

    /// Create a pool and start runners as described by `config`.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, PoolError> {
        let pool = Self::build(config);
        let config = pool.config().clone();
        let ranges = config.ranges();
        pool.start_runners(config.runner_count(), ranges.performance, ranges.efficiency, ranges.allowed)?;
        Ok(pool)
    }

    /// Create a pool with `count` runners that all accept all work.
    pub fn with_runners(count: usize) -> Result<Self, PoolError> {
        Self::with_config(SchedulerConfig::with_runners(count))
    }

    /// Cloneable handle to this pool.
    #[inline]
    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Spawn `total` runner threads.
    ///
    /// Runners in `performance` accept performance stages, runners in
    /// `efficiency` accept efficiency stages, runners in `allowed` accept
    /// both. Every runner accepts [`Affinity::Any`].
    pub fn start_runners(
        &self,
        total: usize,
        performance: Range<usize>,
        efficiency: Range<usize>,
        allowed: Range<usize>,
    ) -> Result<(), PoolError> {
        if !self.is_running() {
            return Err(PoolError::ShutDown);
        }
        if total == 0 {
            return Err(PoolError::NoRunners);
        }
        for (name, range) in [
            ("performance", &performance),
            ("efficiency", &efficiency),
            ("allowed", &allowed),
        ] {
            if range.end > total {
                return Err(PoolError::InvalidRange {
                    name,
                    range: range.clone(),
                    total,
                });
            }
        }
        if self
            .handle
            .shared
            .started
            .swap(true, Ordering::AcqRel)
        {
            return Err(PoolError::AlreadyStarted);
        }

        let ranges = AffinityRanges {
            performance,
            efficiency,
            allowed,
        };
        for affinity in [Affinity::Performance, Affinity::Efficiency] {
            if !ranges.has_acceptor(total, affinity) {
                warn!(?affinity, "no runner accepts this affinity; such stages only run cooperatively");
            }
        }
        self.handle
            .shared
            .stealer
            .install_runners(total, ranges);

        let mut runners = self.runners.lock();
        for runner in 0..total {
            let handle = self.handle.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.config().thread_name_prefix, runner))
                .stack_size(self.config().stack_size)
                .spawn(move || handle.runner_loop(runner));
            match spawned {
                Ok(join) => runners.push(join),
                Err(err) => {
                    drop(runners);
                    self.shutdown();
                    return Err(PoolError::Spawn(err));
                }
            }
        }
        info!(runners = total, "runner pool started");
        Ok(())
    }

    /// Stop the runners and wait for them. Idempotent.
    ///
    /// Stages already executing finish; queued stages are dropped.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if !shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = shared.sleep_lock.lock();
            shared.wake.notify_all();
        }

        let own = self.current_runner_index();
        for (runner, join) in self.runners.lock().drain(..).enumerate() {
            if Some(runner) == own {
                warn!(runner, "pool shut down from one of its own runners; not joining it");
                continue;
            }
            if join.join().is_err() {
                error!(runner, "runner thread panicked");
            }
        }

        let abandoned = shared.stealer.drain();
        if !abandoned.is_empty() {
            shared
                .queued
                .fetch_sub(abandoned.len(), Ordering::AcqRel);
            warn!(count = abandoned.len(), "runner pool shut down with stages still queued");
        }
        info!("runner pool stopped");
    }
}

impl Deref for RunnerPool {
    type Target = PoolHandle;

    fn deref(&self) -> &PoolHandle {
        &self.handle
    }
}

impl Drop for RunnerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
