//! Job graph scheduling across the public API.

use jobgraph::runtime::scheduler::{
    Affinity, Batch, Priority, RunnerPool, SchedulerConfig, Stage, StageOutcome,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Random DAG as (node count, edges from lower to higher index).
fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (2..40usize).prop_flat_map(|nodes| {
        let edge = (0..nodes, 0..nodes).prop_filter_map("self edge", |(a, b)| {
            if a == b {
                None
            } else {
                Some((a.min(b), a.max(b)))
            }
        });
        (Just(nodes), prop::collection::vec(edge, 0..nodes * 2))
    })
}

fn run_dag(
    pool: &RunnerPool,
    nodes: usize,
    edges: &[(usize, usize)],
) -> Vec<usize> {
    let order = Arc::new(Mutex::new(Vec::new()));
    let stages: Vec<Stage> = (0..nodes)
        .map(|i| {
            let order = order.clone();
            Stage::from_fn(Priority::new((i * 37 % 256) as u8), move |_| {
                order.lock().push(i);
                StageOutcome::Finished
            })
        })
        .collect();

    let mut seen = std::collections::HashSet::new();
    for &(a, b) in edges {
        if seen.insert((a, b)) {
            stages[a].add_dependent(&stages[b]).unwrap();
        }
    }

    let batch = Batch::intermediate();
    let (start, finish) = batch.clone().into_parts().unwrap();
    for stage in &stages {
        if stage.prerequisite_count() == 0 {
            start.add_dependent(stage).unwrap();
        }
        if stage.dependent_count() == 0 {
            stage.add_dependent(&finish).unwrap();
        }
    }

    pool.queue_batch(batch).unwrap();
    assert!(pool.run_until_idle(Duration::from_secs(10)));
    assert!(finish.is_finished());
    let order = order.lock().clone();
    order
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn random_dag_runs_each_stage_once_in_order((nodes, edges) in dag_strategy()) {
        let pool = RunnerPool::with_runners(3).unwrap();
        let order = run_dag(&pool, nodes, &edges);

        prop_assert_eq!(order.len(), nodes);
        let mut position = vec![usize::MAX; nodes];
        for (at, &node) in order.iter().enumerate() {
            prop_assert_eq!(position[node], usize::MAX, "stage {} ran twice", node);
            position[node] = at;
        }
        for &(a, b) in &edges {
            prop_assert!(position[a] < position[b], "edge {} -> {} violated", a, b);
        }
    }
}

#[test]
fn test_external_completion_gates_dependents() {
    let pool = RunnerPool::with_runners(2).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    let after = Arc::new(AtomicUsize::new(0));

    let waiting = Stage::from_fn(Priority::HIGH, move |ctx| {
        tx.send(ctx.await_external()).unwrap();
        StageOutcome::AwaitExternalFinish
    });
    let dependent = {
        let after = after.clone();
        Stage::from_fn(Priority::NORMAL, move |_| {
            after.fetch_add(1, Ordering::SeqCst);
            StageOutcome::Finished
        })
    };
    waiting.add_dependent(&dependent).unwrap();
    pool.queue(&waiting).unwrap();

    let token = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert!(pool.has_external_work_in_flight());

    std::thread::spawn(move || token.finish()).join().unwrap();
    assert!(pool.run_until_idle(Duration::from_secs(5)));
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn test_main_thread_helps_without_runners_accepting_work() {
    let config = SchedulerConfig {
        allow_all_work_on_all_runners: false,
        ..SchedulerConfig::with_runners(1)
    };
    let pool = RunnerPool::with_config(config).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let ran = ran.clone();
        let stage = Stage::builder()
            .affinity(Affinity::Efficiency)
            .build_fn(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                StageOutcome::Finished
            });
        pool.queue(&stage).unwrap();
    }

    assert!(pool.run_until_idle(Duration::from_secs(5)));
    assert_eq!(ran.load(Ordering::SeqCst), 16);
    assert!(pool.stats().snapshot().stages_run_cooperatively >= 16);
}
