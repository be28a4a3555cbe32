//! Partition workers and the barrier wait that ends a monitored run.

use super::barrier::{PartitionBarrier, SlotStatus};
use super::monitor::{ArrestSignal, SuspendMonitor};
use super::window::SuspendWindow;
use crate::engine::{PartitionState, QueryPlan};
use crate::error::{RatchetError, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a run over all partitions ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every partition consumed its whole range.
    Finished(Vec<PartitionState>),
    /// At least one partition stopped early at a safe point.
    Arrested {
        states: Vec<PartitionState>,
        forced: bool,
    },
}

/// Steps one partition until it finishes or the arrest signal is seen.
struct PartitionWorker {
    plan: Arc<QueryPlan>,
    signal: Arc<ArrestSignal>,
    barrier: Arc<PartitionBarrier>,
}

impl PartitionWorker {
    fn run(self, mut state: PartitionState) {
        loop {
            if state.finished {
                debug!("Partition {} finished at row {}", state.index, state.cursor);
                self.barrier.arrive_finished(state);
                return;
            }
            if self.signal.is_raised() {
                debug!("Partition {} arrested at row {}", state.index, state.cursor);
                self.barrier.arrive_arrested(state);
                return;
            }

            let index = state.index;
            let stepped = catch_unwind(AssertUnwindSafe(|| self.plan.step(&mut state)));
            match stepped {
                Ok(Ok(())) => self.barrier.publish(&state),
                Ok(Err(e)) => {
                    self.barrier.fail(index, e.to_string());
                    return;
                }
                Err(_) => {
                    self.barrier.fail(index, "partition worker panicked".to_string());
                    return;
                }
            }
        }
    }
}

/// Run `states` in parallel, one blocking worker per partition.
///
/// With a window, a monitor raises the arrest signal at its start offset; if
/// partitions have not all reached the barrier by its end offset, the latest
/// published states are returned as a forced arrest.
pub async fn run_partitions(
    plan: Arc<QueryPlan>,
    states: Vec<PartitionState>,
    window: Option<(SuspendWindow, Instant)>,
) -> Result<RunOutcome> {
    let signal = Arc::new(ArrestSignal::new());
    let barrier = Arc::new(PartitionBarrier::new(&states));

    let monitor = window.map(|(window, started)| {
        SuspendMonitor::spawn(window, started, signal.clone(), barrier.clone())
    });
    let end_deadline = window.map(|(window, started)| started + window.end());

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    for state in states.into_iter().filter(|s| !s.finished) {
        let worker = PartitionWorker {
            plan: plan.clone(),
            signal: signal.clone(),
            barrier: barrier.clone(),
        };
        handles.push(tokio::task::spawn_blocking(move || worker.run(state)));
    }
    debug!("Started {} partition workers", handles.len());

    let mut forced = false;
    let snapshot = loop {
        let snapshot = barrier.snapshot()?;
        if let Some((index, message)) = snapshot.failure() {
            signal.raise();
            return Err(RatchetError::Execution(format!(
                "partition {} failed: {}",
                index, message
            )));
        }
        if snapshot.all_arrived() {
            break snapshot;
        }

        let deadline = if signal.is_raised() { end_deadline } else { None };
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                forced = true;
                break snapshot;
            }
        }
        barrier.wait(deadline).await;
    };

    if let Some(monitor) = monitor {
        monitor.cancel();
    }

    if forced {
        let draining = snapshot.count(&SlotStatus::Running);
        warn!(
            "Suspend window closed with {} partitions still draining, forcing checkpoint",
            draining
        );
    } else {
        for handle in handles {
            if let Err(e) = handle.await {
                return Err(RatchetError::Execution(format!("partition worker: {}", e)));
            }
        }
    }

    let states = snapshot.states;
    if states.iter().all(|s| s.finished) {
        return Ok(RunOutcome::Finished(states));
    }
    info!(
        "Barrier reached: {} arrested, {} finished{}",
        states.iter().filter(|s| !s.finished).count(),
        states.iter().filter(|s| s.finished).count(),
        if forced { " (forced)" } else { "" }
    );
    Ok(RunOutcome::Arrested { states, forced })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::aggregate::{AggregateCall, AggregateKind, AggregateSink};
    use crate::engine::pipeline::{DrivingRelation, Finish, Sink};
    use polars::prelude::*;

    fn count_plan(rows: usize) -> QueryPlan {
        let frame = df!("t.v" => (0..rows as i64).collect::<Vec<_>>()).unwrap();
        QueryPlan {
            driving: DrivingRelation {
                name: "t".to_string(),
                frame,
                filter: None,
            },
            joins: vec![],
            sink: Sink::Aggregate(AggregateSink {
                keys: vec![],
                key_columns: vec![],
                calls: vec![AggregateCall {
                    kind: AggregateKind::CountStar,
                    input: None,
                    text: "count(*)".to_string(),
                    slot: 0,
                }],
            }),
            finish: Finish {
                having: None,
                project: Some(vec![col("__a0").alias("n")]),
                output_columns: vec!["n".to_string()],
                distinct: false,
                order: vec![],
                offset: 0,
                limit: None,
            },
            batch_rows: 16,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unmonitored_run_finishes_every_partition() {
        let plan = Arc::new(count_plan(1000));
        let states = plan.initial_states(3);
        let outcome = run_partitions(plan.clone(), states, None).await.unwrap();
        match outcome {
            RunOutcome::Finished(states) => {
                let out = plan.finalize(&states).unwrap();
                let n: Vec<Option<i64>> = out.column("n").unwrap().i64().unwrap().into_iter().collect();
                assert_eq!(n, vec![Some(1000)]);
            }
            other => panic!("expected finished run, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_window_at_zero_stops_on_batch_boundaries() {
        let plan = Arc::new(count_plan(1000));
        let states = plan.initial_states(2);
        let started = Instant::now();
        // Workers may finish before the monitor fires; both outcomes are valid.
        let window = SuspendWindow::new(0.0, 10.0).unwrap();
        match run_partitions(plan.clone(), states, Some((window, started))).await.unwrap() {
            RunOutcome::Arrested { states, forced } => {
                assert!(!forced);
                for state in &states {
                    assert!((state.cursor - state.start) % 16 == 0 || state.finished);
                }
            }
            RunOutcome::Finished(states) => assert!(states.iter().all(|s| s.finished)),
        }
    }
}
