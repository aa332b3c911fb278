//! Stage definitions for the runner pool.
//!
//! A [`Stage`] is one node of the job graph: an optional unit of work plus
//! the bookkeeping that decides when it may run. Each stage counts its
//! outstanding prerequisites and keeps the list of stages waiting on it.
//! When that count reaches zero the stage is handed to the pool; when it
//! finishes it releases its dependents.
//!
//! Stages without work are *pass-through* stages. They finish the moment
//! they become ready, on whichever thread made them ready, and are used as
//! join points when composing [`Batch`](super::Batch)es.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{error, trace, warn};

use super::errors::{StageError, StageResult};
use super::PoolHandle;

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique stage identifier, used for logging and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(u64);

impl StageId {
    fn next() -> Self {
        Self(NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Stage({})", self.0)
    }
}

/// Lifecycle of a stage. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    /// Waiting for prerequisites or for an explicit queue call.
    NotQueued = 0,
    /// Sitting in a ready queue.
    Queued = 1,
    /// A runner is executing the job.
    Executing = 2,
    /// The job returned and completion is owed by someone else.
    AwaitingExternal = 3,
    /// Done; dependents have been released.
    Finished = 4,
}

impl StageState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => StageState::NotQueued,
            1 => StageState::Queued,
            2 => StageState::Executing,
            3 => StageState::AwaitingExternal,
            _ => StageState::Finished,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Scheduling priority. Higher values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// Background work.
    pub const LOWEST: Priority = Priority(0);
    /// Work that nobody is blocked on yet.
    pub const LOW: Priority = Priority(64);
    /// Default.
    pub const NORMAL: Priority = Priority(128);
    /// Work something visible is waiting for.
    pub const HIGH: Priority = Priority(192);
    /// Frame-critical work.
    pub const HIGHEST: Priority = Priority(255);

    #[inline]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Which class of runner thread may execute a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affinity {
    /// Any runner.
    #[default]
    Any,
    /// Runners in the performance range.
    Performance,
    /// Runners in the efficiency range.
    Efficiency,
}

impl Affinity {
    /// All affinity classes, in shared-queue order.
    pub const ALL: [Affinity; 3] = [Affinity::Any, Affinity::Performance, Affinity::Efficiency];

    #[inline]
    pub(crate) fn slot(self) -> usize {
        match self {
            Affinity::Any => 0,
            Affinity::Performance => 1,
            Affinity::Efficiency => 2,
        }
    }
}

/// What a job reports back when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage is done; release dependents now.
    Finished,
    /// The stage will be finished later by an explicit signal.
    AwaitExternalFinish,
}

/// Work carried by a stage.
///
/// Implemented for every `FnOnce(&mut StageContext) -> StageOutcome` closure.
/// A job must not block waiting on another stage of the same pool; split the
/// work into stages instead.
pub trait Job: Send + 'static {
    fn run(
        self: Box<Self>,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome;
}

impl<F> Job for F
where
    F: FnOnce(&mut StageContext<'_>) -> StageOutcome + Send + 'static,
{
    fn run(
        self: Box<Self>,
        ctx: &mut StageContext<'_>,
    ) -> StageOutcome {
        (*self)(ctx)
    }
}

struct StageInner {
    id: StageId,
    name: String,
    priority: Priority,
    affinity: Affinity,
    state: AtomicU8,
    prerequisites: AtomicU32,
    dependents: Mutex<SmallVec<[Stage; 4]>>,
    job: Mutex<Option<Box<dyn Job>>>,
    pass_through: bool,
    /// Set while the pool counts this stage as external work.
    awaiting_external: AtomicBool,
}

/// Shared handle to a node in the job graph.
///
/// Cloning is cheap and yields another handle to the same stage. A stage
/// stays alive as long as a handle, a queue, or a prerequisite refers to it.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<StageInner>,
}

impl fmt::Debug for Stage {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("priority", &self.inner.priority)
            .field("affinity", &self.inner.affinity)
            .field("prerequisites", &self.prerequisite_count())
            .finish()
    }
}

impl PartialEq for Stage {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stage {}

impl Stage {
    /// Create a pass-through stage with the given priority.
    pub fn new(priority: Priority) -> Self {
        StageBuilder::new().priority(priority).build_pass_through()
    }

    /// Create a pass-through join point.
    pub fn intermediate() -> Self {
        StageBuilder::new()
            .name("intermediate")
            .build_pass_through()
    }

    /// Create a stage that runs `job`.
    pub fn from_fn<F>(
        priority: Priority,
        job: F,
    ) -> Self
    where
        F: FnOnce(&mut StageContext<'_>) -> StageOutcome + Send + 'static,
    {
        StageBuilder::new().priority(priority).build_fn(job)
    }

    /// Start configuring a stage.
    #[inline]
    pub fn builder() -> StageBuilder {
        StageBuilder::new()
    }

    #[inline]
    pub fn id(&self) -> StageId {
        self.inner.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    #[inline]
    pub fn affinity(&self) -> Affinity {
        self.inner.affinity
    }

    #[inline]
    pub fn state(&self) -> StageState {
        StageState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Number of prerequisites that have not finished yet.
    #[inline]
    pub fn prerequisite_count(&self) -> u32 {
        self.inner.prerequisites.load(Ordering::Acquire)
    }

    /// Number of stages currently waiting on this one.
    pub fn dependent_count(&self) -> usize {
        self.inner.dependents.lock().len()
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state() == StageState::Finished
    }

    /// Whether this stage has no job and finishes as soon as it is ready.
    #[inline]
    pub fn is_pass_through(&self) -> bool {
        self.inner.pass_through
    }

    /// Make `dependent` wait for this stage.
    ///
    /// Fails if this stage already finished (the edge could never fire), if
    /// `dependent` has already been queued, or if both are the same stage.
    pub fn add_dependent(
        &self,
        dependent: &Stage,
    ) -> StageResult<()> {
        if self == dependent {
            return Err(StageError::SelfDependency { stage: self.id() });
        }
        let dependent_state = dependent.state();
        if dependent_state != StageState::NotQueued {
            return Err(StageError::AlreadyScheduled {
                stage: dependent.id(),
                state: dependent_state,
            });
        }

        let mut dependents = self.inner.dependents.lock();
        // Checked under the lock: finishing takes the list after the state flip.
        if self.is_finished() {
            return Err(StageError::AlreadyFinished { stage: self.id() });
        }
        dependent
            .inner
            .prerequisites
            .fetch_add(1, Ordering::AcqRel);
        dependents.push(dependent.clone());
        trace!(from = %self.id(), to = %dependent.id(), "added dependency");
        Ok(())
    }

    /// Undo a previous [`add_dependent`](Self::add_dependent).
    ///
    /// Returns `false` if the edge does not exist. Removing the last
    /// prerequisite does not queue `dependent`.
    pub fn remove_dependent(
        &self,
        dependent: &Stage,
    ) -> bool {
        let mut dependents = self.inner.dependents.lock();
        let Some(position) = dependents.iter().position(|stage| stage == dependent) else {
            return false;
        };
        dependents.remove(position);
        dependent
            .inner
            .prerequisites
            .fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Finish this stage from outside its job and release its dependents.
    ///
    /// Valid for stages awaiting external completion, stages still executing
    /// (the job's eventual outcome is then ignored), and never-queued stages
    /// used as manual gates. A queued or finished stage is rejected.
    pub fn signal_finished(
        &self,
        pool: &PoolHandle,
    ) -> StageResult<()> {
        self.finish_from(
            pool,
            &[
                StageState::AwaitingExternal,
                StageState::Executing,
                StageState::NotQueued,
            ],
        )
        .inspect_err(|err| error!(%err, name = self.name(), "invalid finish signal"))?;
        pool.propagate(self);
        Ok(())
    }

    /// Run the job on the calling thread and apply its outcome.
    ///
    /// The stage must be queued, or unqueued with no outstanding
    /// prerequisites. Runners call this for every stage they dequeue.
    pub fn execute(
        &self,
        pool: &PoolHandle,
    ) -> StageResult<StageOutcome> {
        if self.transition(StageState::Queued, StageState::Executing).is_err() {
            let pending = self.prerequisite_count();
            if pending > 0 {
                return Err(StageError::PrerequisitesPending {
                    stage: self.id(),
                    pending,
                });
            }
            self.transition(StageState::NotQueued, StageState::Executing)
                .map_err(|state| self.state_error(state))?;
        }
        Ok(self.run_job(pool))
    }

    fn run_job(
        &self,
        pool: &PoolHandle,
    ) -> StageOutcome {
        let job = self.inner.job.lock().take();
        let mut ctx = StageContext {
            pool,
            stage: self,
            deferred: false,
        };

        let outcome = match job {
            Some(job) => match panic::catch_unwind(AssertUnwindSafe(|| job.run(&mut ctx))) {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(stage = %self.id(), name = self.name(), "stage job panicked");
                    pool.stats().record_panic();
                    StageOutcome::Finished
                }
            },
            None => StageOutcome::Finished,
        };

        let outcome = if ctx.deferred {
            if outcome == StageOutcome::Finished {
                warn!(
                    stage = %self.id(),
                    "job returned Finished after deferring completion; waiting for the token"
                );
            }
            StageOutcome::AwaitExternalFinish
        } else {
            outcome
        };

        match outcome {
            StageOutcome::Finished => match self.finish_from(pool, &[StageState::Executing]) {
                Ok(()) => pool.propagate(self),
                Err(err) => warn!(%err, "stage was finished while its job was running"),
            },
            StageOutcome::AwaitExternalFinish => {
                // Counted before the state flip so a concurrent finish always
                // sees the flag it has to clear.
                self.begin_external(pool);
                if self
                    .transition(StageState::Executing, StageState::AwaitingExternal)
                    .is_err()
                {
                    trace!(stage = %self.id(), "external completion arrived before the job returned");
                    self.end_external(pool);
                }
            }
        }
        outcome
    }

    /// Compare-and-swap the state. On failure returns the observed state.
    pub(crate) fn transition(
        &self,
        from: StageState,
        to: StageState,
    ) -> Result<(), StageState> {
        self.inner
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(StageState::from_u8)
    }

    /// Move an unqueued stage with no outstanding prerequisites to `Queued`.
    pub(crate) fn mark_queued(&self) -> StageResult<()> {
        let pending = self.prerequisite_count();
        if pending > 0 {
            return Err(StageError::PrerequisitesPending {
                stage: self.id(),
                pending,
            });
        }
        self.transition(StageState::NotQueued, StageState::Queued)
            .map_err(|state| self.state_error(state))
    }

    fn finish_from(
        &self,
        pool: &PoolHandle,
        allowed: &[StageState],
    ) -> StageResult<()> {
        let mut observed = self.state();
        for &from in allowed {
            match self.transition(from, StageState::Finished) {
                Ok(()) => {
                    self.end_external(pool);
                    return Ok(());
                }
                Err(state) => observed = state,
            }
        }
        Err(self.state_error(observed))
    }

    /// Count this stage as external work, once per deferral.
    fn begin_external(
        &self,
        pool: &PoolHandle,
    ) {
        if !self.inner.awaiting_external.swap(true, Ordering::AcqRel) {
            pool.external_started();
        }
    }

    fn end_external(
        &self,
        pool: &PoolHandle,
    ) {
        if self.inner.awaiting_external.swap(false, Ordering::AcqRel) {
            pool.external_finished();
        }
    }

    fn state_error(
        &self,
        state: StageState,
    ) -> StageError {
        match state {
            StageState::Finished => StageError::AlreadyFinished { stage: self.id() },
            state => StageError::AlreadyScheduled {
                stage: self.id(),
                state,
            },
        }
    }

    /// Detach every dependent and return those whose last prerequisite this was.
    pub(crate) fn release_dependents(&self) -> SmallVec<[Stage; 4]> {
        let dependents = std::mem::take(&mut *self.inner.dependents.lock());
        dependents
            .into_iter()
            .filter(|dependent| {
                dependent
                    .inner
                    .prerequisites
                    .fetch_sub(1, Ordering::AcqRel)
                    == 1
            })
            .collect()
    }
}

/// Stage builder for constructing stages with various options.
#[derive(Debug, Default)]
pub struct StageBuilder {
    name: Option<String>,
    priority: Priority,
    affinity: Affinity,
}

impl StageBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stage name used in logs.
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    #[inline]
    pub fn priority(
        mut self,
        priority: Priority,
    ) -> Self {
        self.priority = priority;
        self
    }

    #[inline]
    pub fn affinity(
        mut self,
        affinity: Affinity,
    ) -> Self {
        self.affinity = affinity;
        self
    }

    /// Build a stage running a closure.
    pub fn build_fn<F>(
        self,
        job: F,
    ) -> Stage
    where
        F: FnOnce(&mut StageContext<'_>) -> StageOutcome + Send + 'static,
    {
        self.finish(Some(Box::new(job)))
    }

    /// Build a stage running any [`Job`].
    pub fn build(
        self,
        job: impl Job,
    ) -> Stage {
        self.finish(Some(Box::new(job)))
    }

    /// Build a stage without work.
    pub fn build_pass_through(self) -> Stage {
        self.finish(None)
    }

    fn finish(
        self,
        job: Option<Box<dyn Job>>,
    ) -> Stage {
        let id = StageId::next();
        let pass_through = job.is_none();
        Stage {
            inner: Arc::new(StageInner {
                id,
                name: self.name.unwrap_or_else(|| id.to_string()),
                priority: self.priority,
                affinity: self.affinity,
                state: AtomicU8::new(StageState::NotQueued.as_u8()),
                prerequisites: AtomicU32::new(0),
                dependents: Mutex::new(SmallVec::new()),
                job: Mutex::new(job),
                pass_through,
                awaiting_external: AtomicBool::new(false),
            }),
        }
    }
}

/// What a running job can see of its surroundings.
pub struct StageContext<'a> {
    pool: &'a PoolHandle,
    stage: &'a Stage,
    deferred: bool,
}

impl<'a> StageContext<'a> {
    /// The pool running this stage. Use it to queue follow-up work.
    #[inline]
    pub fn pool(&self) -> &'a PoolHandle {
        self.pool
    }

    /// The stage being executed.
    #[inline]
    pub fn stage(&self) -> &'a Stage {
        self.stage
    }

    /// Index of the runner executing this stage, or `None` when a
    /// non-runner thread is lending a hand.
    #[inline]
    pub fn runner_index(&self) -> Option<usize> {
        self.pool.current_runner_index()
    }

    /// Defer completion to the returned token.
    ///
    /// The stage stays unfinished after the job returns until the token's
    /// [`finish`](ExternalCompletion::finish) is called (or it is dropped).
    /// Call at most once per execution.
    pub fn await_external(&mut self) -> ExternalCompletion {
        self.deferred = true;
        self.stage.begin_external(self.pool);
        ExternalCompletion {
            stage: self.stage.clone(),
            pool: self.pool.clone(),
            done: false,
        }
    }
}

/// One-shot token that finishes a stage whose job deferred completion.
///
/// Dropping an unfinished token finishes the stage as well, so a lost token
/// cannot stall the graph.
#[must_use = "dropping the token finishes the stage immediately"]
pub struct ExternalCompletion {
    stage: Stage,
    pool: PoolHandle,
    done: bool,
}

impl fmt::Debug for ExternalCompletion {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ExternalCompletion")
            .field("stage", &self.stage.id())
            .field("done", &self.done)
            .finish()
    }
}

impl ExternalCompletion {
    #[inline]
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Finish the stage and release its dependents.
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        match self
            .stage
            .finish_from(&self.pool, &[StageState::AwaitingExternal, StageState::Executing])
        {
            Ok(()) => self.pool.propagate(&self.stage),
            Err(err) => warn!(%err, "external completion for a stage that cannot finish"),
        }
    }
}

impl Drop for ExternalCompletion {
    fn drop(&mut self) {
        if !self.done {
            warn!(stage = %self.stage.id(), name = self.stage.name(), "completion token dropped without finish");
            self.complete();
        }
    }
}
