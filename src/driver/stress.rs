//! Layered random DAG stress run.
//!
//! Builds `stages` stages spread over `layers` layers, wires every stage to
//! a few random stages of the previous layer, runs the graph to quiescence
//! and checks every edge was honoured.

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::runtime::scheduler::{Batch, PoolHandle, Priority, Stage, StageOutcome, StatsSnapshot};

/// Stress run parameters.
#[derive(Debug, Clone)]
pub struct StressOptions {
    pub stages: usize,
    pub layers: usize,
    /// Maximum prerequisites per stage.
    pub fan_in: usize,
    /// Busy work per stage.
    pub work: Duration,
    pub seed: Option<u64>,
    pub timeout: Duration,
}

impl Default for StressOptions {
    fn default() -> Self {
        Self {
            stages: 10_000,
            layers: 16,
            fan_in: 3,
            work: Duration::ZERO,
            seed: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Result of a stress run.
#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub seed: u64,
    pub stages: usize,
    pub layers: usize,
    pub edges: usize,
    /// Stages that did not run exactly once.
    pub miscounted: usize,
    /// Edges whose dependent started before its prerequisite finished.
    pub violations: usize,
    pub elapsed_ms: u128,
    pub scheduler: StatsSnapshot,
}

impl StressReport {
    #[inline]
    pub fn success(&self) -> bool {
        self.miscounted == 0 && self.violations == 0
    }
}

/// Per-stage execution record: run count plus start/end ticks of one
/// shared clock.
struct Trace {
    clock: AtomicUsize,
    runs: Vec<AtomicUsize>,
    started: Vec<AtomicUsize>,
    ended: Vec<AtomicUsize>,
}

impl Trace {
    fn new(stages: usize) -> Self {
        let column = || -> Vec<AtomicUsize> { (0..stages).map(|_| AtomicUsize::new(usize::MAX)).collect() };
        Self {
            clock: AtomicUsize::new(0),
            runs: (0..stages).map(|_| AtomicUsize::new(0)).collect(),
            started: column(),
            ended: column(),
        }
    }

    fn tick(&self) -> usize {
        self.clock.fetch_add(1, Ordering::AcqRel)
    }
}

/// Random layered DAG: `edges[i]` lists the prerequisites of stage `i`.
fn layered_edges(
    rng: &mut StdRng,
    stages: usize,
    layers: usize,
    fan_in: usize,
) -> Vec<SmallVec<[usize; 4]>> {
    let layer_of = |i: usize| i * layers / stages;
    let mut layer_start = vec![0usize; layers + 1];
    for i in 0..stages {
        layer_start[layer_of(i) + 1] = i + 1;
    }
    for l in 1..=layers {
        layer_start[l] = layer_start[l].max(layer_start[l - 1]);
    }

    (0..stages)
        .map(|i| {
            let layer = layer_of(i);
            let mut prerequisites = SmallVec::new();
            if layer == 0 {
                return prerequisites;
            }
            let previous = layer_start[layer - 1]..layer_start[layer];
            if previous.is_empty() {
                return prerequisites;
            }
            let count = rng.random_range(1..=fan_in.max(1));
            for _ in 0..count {
                let p = rng.random_range(previous.clone());
                if !prerequisites.contains(&p) {
                    prerequisites.push(p);
                }
            }
            prerequisites
        })
        .collect()
}

/// Build and run one random graph on `pool`, helping from this thread.
pub fn run(
    pool: &PoolHandle,
    options: &StressOptions,
) -> Result<StressReport> {
    if options.stages == 0 {
        bail!("stress run needs at least one stage");
    }
    let layers = options.layers.clamp(1, options.stages);
    let seed = options.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    debug!(seed, stages = options.stages, layers, "building stress graph");

    let edges = layered_edges(&mut rng, options.stages, layers, options.fan_in);
    let trace = Arc::new(Trace::new(options.stages));
    let work = options.work;

    let stages: Vec<Stage> = (0..options.stages)
        .map(|i| {
            let trace = trace.clone();
            Stage::builder()
                .name(format!("stress-{}", i))
                .priority(Priority::new(rng.random()))
                .build_fn(move |_| {
                    trace.started[i].store(trace.tick(), Ordering::Release);
                    trace.runs[i].fetch_add(1, Ordering::AcqRel);
                    if !work.is_zero() {
                        let until = Instant::now() + work;
                        while Instant::now() < until {
                            black_box(i);
                        }
                    }
                    trace.ended[i].store(trace.tick(), Ordering::Release);
                    StageOutcome::Finished
                })
        })
        .collect();

    let batch = Batch::intermediate();
    let (start, done) = batch
        .clone()
        .into_parts()
        .context("intermediate batch has no stages")?;
    let mut edge_count = 0;
    for (i, prerequisites) in edges.iter().enumerate() {
        if prerequisites.is_empty() {
            start.add_dependent(&stages[i])?;
        }
        for &p in prerequisites {
            stages[p].add_dependent(&stages[i])?;
            edge_count += 1;
        }
    }
    for stage in stages.iter().filter(|s| s.dependent_count() == 0) {
        stage.add_dependent(&done)?;
    }

    let started = Instant::now();
    let deadline = started + options.timeout;
    pool.queue_batch(batch)?;
    pool.run_until(|| done.is_finished() || Instant::now() >= deadline);
    let elapsed = started.elapsed();
    if !done.is_finished() {
        bail!(
            "stress graph did not finish within {:?} (seed {})",
            options.timeout,
            seed
        );
    }

    let miscounted = trace
        .runs
        .iter()
        .filter(|runs| runs.load(Ordering::Acquire) != 1)
        .count();
    let violations = edges
        .iter()
        .enumerate()
        .flat_map(|(i, prerequisites)| prerequisites.iter().map(move |&p| (p, i)))
        .filter(|&(p, i)| trace.ended[p].load(Ordering::Acquire) >= trace.started[i].load(Ordering::Acquire))
        .count();

    let report = StressReport {
        seed,
        stages: options.stages,
        layers,
        edges: edge_count,
        miscounted,
        violations,
        elapsed_ms: elapsed.as_millis(),
        scheduler: pool.stats().snapshot(),
    };
    if report.success() {
        info!(stages = report.stages, edges = report.edges, elapsed_ms = report.elapsed_ms, "stress run passed");
    } else {
        warn!(miscounted, violations, seed, "stress run found ordering errors");
    }
    Ok(report)
}
