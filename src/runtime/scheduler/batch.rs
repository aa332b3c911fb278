//! Batches: sub-graphs with a single entry and a single exit.
//!
//! A [`Batch`] names the stage that starts a piece of work and the stage
//! that marks it done. Composition only ever rewires those two ends, so a
//! caller can extend a batch without knowing what is inside it.
//!
//! A default (invalid) batch means "nothing to wait for": it is what a loader
//! returns when it completed synchronously.

use super::errors::StageResult;
use super::stage::Stage;

/// Start/finish pair of a sub-graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use = "a batch does nothing until it is queued"]
pub struct Batch {
    start: Option<Stage>,
    finish: Option<Stage>,
}

impl Batch {
    /// A batch whose start and finish are the same stage.
    pub fn new(stage: Stage) -> Self {
        Self {
            start: Some(stage.clone()),
            finish: Some(stage),
        }
    }

    /// An empty batch: two pass-through stages, start before finish.
    pub fn intermediate() -> Self {
        let start = Stage::intermediate();
        let finish = Stage::intermediate();
        Self::link(&start, &finish);
        Self {
            start: Some(start),
            finish: Some(finish),
        }
    }

    /// Build a batch from explicit ends. The caller is responsible for
    /// `start` (transitively) preceding `finish`.
    pub fn from_parts(
        start: Stage,
        finish: Stage,
    ) -> Self {
        Self {
            start: Some(start),
            finish: Some(finish),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.start.is_some()
    }

    /// Stage to queue to run the batch.
    #[inline]
    pub fn start_stage(&self) -> Option<&Stage> {
        self.start.as_ref()
    }

    /// Stage that finishes once everything in the batch has.
    #[inline]
    pub fn finished_stage(&self) -> Option<&Stage> {
        self.finish.as_ref()
    }

    pub fn into_parts(self) -> Option<(Stage, Stage)> {
        self.start.zip(self.finish)
    }

    /// Append `next` so that it runs after everything already in the batch.
    ///
    /// The batch's finish becomes `next`'s finish. An invalid batch simply
    /// adopts `next`; an invalid `next` changes nothing.
    pub fn queue_as_new_finished_stage(
        &mut self,
        next: impl Into<Batch>,
    ) -> StageResult<()> {
        let next = next.into();
        let Some((next_start, next_finish)) = next.into_parts() else {
            return Ok(());
        };
        let Some(finish) = self.finish.as_ref() else {
            *self = Self::from_parts(next_start, next_finish);
            return Ok(());
        };

        finish.add_dependent(&next_start)?;
        self.finish = Some(next_finish);
        Ok(())
    }

    /// Fan `next` out from the batch's start: it runs after the start and
    /// before the finish, concurrently with everything else in between.
    ///
    /// When start and finish are the same stage a fresh pass-through finish
    /// is appended so that `next` has somewhere to join.
    pub fn queue_after_start_stage(
        &mut self,
        next: impl Into<Batch>,
    ) -> StageResult<()> {
        let next = next.into();
        let Some((next_start, next_finish)) = next.into_parts() else {
            return Ok(());
        };
        let (Some(start), Some(finish)) = (self.start.clone(), self.finish.clone()) else {
            *self = Self::from_parts(next_start, next_finish);
            return Ok(());
        };

        let finish = if start == finish {
            let join = Stage::intermediate();
            start.add_dependent(&join)?;
            self.finish = Some(join.clone());
            join
        } else {
            finish
        };

        start.add_dependent(&next_start)?;
        next_finish.add_dependent(&finish)?;
        Ok(())
    }

    fn link(
        before: &Stage,
        after: &Stage,
    ) {
        if let Err(err) = before.add_dependent(after) {
            tracing::error!(%err, "failed to link fresh stages");
        }
    }
}

impl From<Stage> for Batch {
    fn from(stage: Stage) -> Self {
        Self::new(stage)
    }
}

impl From<&Stage> for Batch {
    fn from(stage: &Stage) -> Self {
        Self::new(stage.clone())
    }
}
