//! Work distribution across runner threads.
//!
//! Every runner owns a local [`ReadyQueue`]; stages made ready on a runner
//! land there. Stages queued from elsewhere go to one shared queue per
//! [`Affinity`]. A runner takes the highest-priority stage among its local
//! queue and the shared queues it is eligible for, then falls back to
//! stealing eligible stages from other runners.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::queue::ReadyQueue;
use super::stage::{Affinity, Stage};
use super::SchedulerStats;

/// Which runner indices serve which affinity class.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AffinityRanges {
    /// Runners that accept [`Affinity::Performance`] stages.
    pub performance: Range<usize>,
    /// Runners that accept [`Affinity::Efficiency`] stages.
    pub efficiency: Range<usize>,
    /// Runners that accept every stage regardless of class.
    pub allowed: Range<usize>,
}

impl AffinityRanges {
    /// Every runner accepts every stage.
    pub fn all(total: usize) -> Self {
        Self {
            performance: 0..total,
            efficiency: 0..total,
            allowed: 0..total,
        }
    }

    /// Whether runner `runner` may execute a stage of class `affinity`.
    #[inline]
    pub fn accepts(
        &self,
        runner: usize,
        affinity: Affinity,
    ) -> bool {
        match affinity {
            Affinity::Any => true,
            Affinity::Performance => self.performance.contains(&runner) || self.allowed.contains(&runner),
            Affinity::Efficiency => self.efficiency.contains(&runner) || self.allowed.contains(&runner),
        }
    }

    /// Whether any of `total` runners accepts `affinity`.
    pub fn has_acceptor(
        &self,
        total: usize,
        affinity: Affinity,
    ) -> bool {
        (0..total).any(|runner| self.accepts(runner, affinity))
    }
}

/// Local and shared queues plus victim selection.
#[derive(Debug)]
pub struct WorkStealer {
    /// Per-runner local queues; empty until runners start.
    locals: RwLock<Vec<Arc<ReadyQueue>>>,
    /// Shared queues indexed by [`Affinity::slot`].
    shared: [ReadyQueue; 3],
    ranges: RwLock<AffinityRanges>,
    use_stealing: bool,
    /// Random state for victim selection.
    rng_state: AtomicUsize,
}

impl WorkStealer {
    pub fn new(use_stealing: bool) -> Self {
        Self {
            locals: RwLock::new(Vec::new()),
            shared: Default::default(),
            ranges: RwLock::new(AffinityRanges::default()),
            use_stealing,
            rng_state: AtomicUsize::new(1),
        }
    }

    /// Create local queues for `count` runners.
    pub fn install_runners(
        &self,
        count: usize,
        ranges: AffinityRanges,
    ) {
        *self.locals.write() = (0..count).map(|_| Arc::new(ReadyQueue::new())).collect();
        *self.ranges.write() = ranges;
    }

    #[inline]
    pub fn num_runners(&self) -> usize {
        self.locals.read().len()
    }

    pub fn ranges(&self) -> AffinityRanges {
        self.ranges.read().clone()
    }

    #[inline]
    pub fn accepts(
        &self,
        runner: usize,
        affinity: Affinity,
    ) -> bool {
        self.ranges.read().accepts(runner, affinity)
    }

    /// Queue a stage for whichever eligible runner gets to it first.
    pub fn push_shared(
        &self,
        stage: Stage,
    ) {
        self.shared[stage.affinity().slot()].push(stage);
    }

    /// Queue a stage on `runner`'s local queue.
    ///
    /// Hands the stage back if the runner does not exist or may not run it.
    pub fn push_local(
        &self,
        runner: usize,
        stage: Stage,
    ) -> Result<(), Stage> {
        if !self.accepts(runner, stage.affinity()) {
            return Err(stage);
        }
        match self.locals.read().get(runner) {
            Some(queue) => {
                queue.push(stage);
                Ok(())
            }
            None => Err(stage),
        }
    }

    /// Next stage for runner `runner`.
    pub fn next_for_runner(
        &self,
        runner: usize,
        stats: &SchedulerStats,
    ) -> Option<Stage> {
        let locals = self.locals.read();
        let ranges = self.ranges.read();

        let mut candidates: Vec<&ReadyQueue> = Vec::with_capacity(4);
        if let Some(local) = locals.get(runner) {
            candidates.push(local.as_ref());
        }
        for affinity in Affinity::ALL {
            if ranges.accepts(runner, affinity) {
                candidates.push(&self.shared[affinity.slot()]);
            }
        }

        if let Some(stage) = Self::pop_best(&candidates) {
            return Some(stage);
        }
        if !self.use_stealing {
            return None;
        }
        self.steal(Some(runner), &locals, |stage| ranges.accepts(runner, stage.affinity()), stats)
    }

    /// Next stage for a thread that is not one of the runners.
    ///
    /// Such threads accept every affinity class.
    pub fn next_for_any(&self) -> Option<Stage> {
        let locals = self.locals.read();
        let candidates: Vec<&ReadyQueue> = self
            .shared
            .iter()
            .chain(locals.iter().map(|queue| queue.as_ref()))
            .collect();
        Self::pop_best(&candidates)
    }

    /// Pop from whichever candidate holds the highest-priority stage.
    /// Ties go to the earlier candidate.
    fn pop_best(candidates: &[&ReadyQueue]) -> Option<Stage> {
        let mut best: Option<(usize, _)> = None;
        for (index, queue) in candidates.iter().enumerate() {
            if let Some(priority) = queue.peek_priority() {
                if best.is_none_or(|(_, top)| priority > top) {
                    best = Some((index, priority));
                }
            }
        }

        if let Some((index, _)) = best {
            if let Some(stage) = candidates[index].pop() {
                return Some(stage);
            }
        }
        // Lost a race for the best one; take anything.
        candidates.iter().find_map(|queue| queue.pop())
    }

    fn steal(
        &self,
        thief: Option<usize>,
        locals: &[Arc<ReadyQueue>],
        eligible: impl Fn(&Stage) -> bool,
        stats: &SchedulerStats,
    ) -> Option<Stage> {
        let num_runners = locals.len();
        if num_runners == 0 || locals.iter().all(|queue| queue.is_empty()) {
            return None;
        }

        let start = self.next_rand() % num_runners;
        for offset in 0..num_runners {
            let victim = (start + offset) % num_runners;
            if Some(victim) == thief {
                continue;
            }
            if let Some(stage) = locals[victim].pop_eligible(&eligible) {
                stats.record_steal(true);
                return Some(stage);
            }
        }

        stats.record_steal(false);
        None
    }

    /// Whether runner `runner`'s own queue or an eligible shared queue holds work.
    pub fn has_work_for(
        &self,
        runner: usize,
    ) -> bool {
        let ranges = self.ranges.read();
        let shared = Affinity::ALL
            .iter()
            .any(|&affinity| ranges.accepts(runner, affinity) && !self.shared[affinity.slot()].is_empty());
        shared
            || self
                .locals
                .read()
                .get(runner)
                .is_some_and(|local| !local.is_empty())
    }

    /// Total number of queued stages.
    pub fn len(&self) -> usize {
        let shared: usize = self.shared.iter().map(ReadyQueue::len).sum();
        shared + self.locals.read().iter().map(|queue| queue.len()).sum::<usize>()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every queued stage.
    pub fn drain(&self) -> Vec<Stage> {
        let mut drained: Vec<Stage> = self.shared.iter().flat_map(ReadyQueue::drain).collect();
        for queue in self.locals.read().iter() {
            drained.extend(queue.drain());
        }
        drained
    }

    /// Simple LCG random number generator.
    #[inline]
    fn next_rand(&self) -> usize {
        // LCG parameters (from Numerical Recipes)
        let state = self.rng_state.fetch_add(1, Ordering::Relaxed);
        state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407)
            >> 16
    }
}

impl Default for WorkStealer {
    fn default() -> Self {
        Self::new(true)
    }
}
