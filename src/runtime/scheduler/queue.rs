//! Ready queue for the runner pool
//!
//! Multi-producer, multi-consumer queue of runnable stages. Stages come out
//! highest priority first and, within one priority, in the order they were
//! pushed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::stage::{Priority, Stage};

/// A thread-safe, priority-ordered queue of stages.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    /// One FIFO lane per priority in use.
    lanes: Mutex<BTreeMap<Priority, VecDeque<Stage>>>,
    /// Mirror of the total length, readable without the lock.
    len: AtomicUsize,
}

impl ReadyQueue {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a stage behind every queued stage of the same priority.
    pub fn push(
        &self,
        stage: Stage,
    ) {
        let mut lanes = self.lanes.lock();
        lanes.entry(stage.priority()).or_default().push_back(stage);
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    /// Pop the oldest stage of the highest priority.
    pub fn pop(&self) -> Option<Stage> {
        let mut lanes = self.lanes.lock();
        let mut lane = lanes.last_entry()?;
        let stage = lane.get_mut().pop_front();
        if lane.get().is_empty() {
            lane.remove();
        }
        if stage.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        stage
    }

    /// Pop the oldest stage of the highest priority that satisfies `eligible`.
    pub fn pop_eligible(
        &self,
        eligible: impl Fn(&Stage) -> bool,
    ) -> Option<Stage> {
        let mut lanes = self.lanes.lock();
        let mut found = None;
        for (priority, lane) in lanes.iter_mut().rev() {
            if let Some(position) = lane.iter().position(&eligible) {
                found = lane.remove(position).map(|stage| (*priority, stage));
                break;
            }
        }

        let (priority, stage) = found?;
        if lanes.get(&priority).is_some_and(VecDeque::is_empty) {
            lanes.remove(&priority);
        }
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(stage)
    }

    /// Priority of the stage [`pop`](Self::pop) would return.
    pub fn peek_priority(&self) -> Option<Priority> {
        self.lanes
            .lock()
            .last_key_value()
            .map(|(priority, _)| *priority)
    }

    /// Remove everything, in pop order.
    pub fn drain(&self) -> Vec<Stage> {
        let mut lanes = self.lanes.lock();
        let drained: Vec<Stage> = std::mem::take(&mut *lanes)
            .into_values()
            .rev()
            .flatten()
            .collect();
        self.len.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
