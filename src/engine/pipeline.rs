//! Partitioned batch pipeline
//!
//! A `QueryPlan` is executed by stepping `PartitionState`s one driving batch
//! at a time. Everything a partition has done so far is captured by its
//! cursor and its buffered sink output, so a state can be cloned between two
//! steps, persisted, restored and stepped again without changing the final
//! result.

use super::aggregate::AggregateSink;
use crate::error::{RatchetError, Result};
use polars::prelude::*;
use tracing::debug;

/// The relation whose rows are partitioned and streamed in batches.
#[derive(Debug, Clone)]
pub struct DrivingRelation {
    pub name: String,
    pub frame: DataFrame,
    pub filter: Option<Expr>,
}

/// Inner hash join of the running batch against a prebuilt relation.
#[derive(Debug, Clone)]
pub struct JoinStep {
    pub relation: String,
    pub build: DataFrame,
    pub probe_keys: Vec<Expr>,
    pub probe_key_columns: Vec<String>,
    pub build_key_columns: Vec<String>,
    pub probe_index: String,
    pub build_index: String,
    pub filter: Option<Expr>,
}

/// Projection sink: buffers output rows (plus hidden ORDER BY columns).
#[derive(Debug, Clone)]
pub struct ProjectSink {
    pub exprs: Vec<Expr>,
    pub early_stop: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum Sink {
    Aggregate(AggregateSink),
    Project(ProjectSink),
}

impl Sink {
    fn consume(&self, batch: LazyFrame) -> Result<DataFrame> {
        match self {
            Sink::Aggregate(agg) => agg.partial(batch),
            Sink::Project(project) => Ok(batch.select(project.exprs.clone()).collect()?),
        }
    }

    fn absorb(&self, buffer: Option<DataFrame>, output: DataFrame) -> Result<DataFrame> {
        let stacked = match buffer {
            Some(buffer) => stack(buffer, &output)?,
            None => output,
        };
        match self {
            Sink::Aggregate(agg) => agg.merge(stacked),
            Sink::Project(project) => Ok(match project.early_stop {
                Some(rows) if stacked.height() > rows => stacked.head(Some(rows)),
                _ => stacked,
            }),
        }
    }

    fn satisfied(&self, buffer: Option<&DataFrame>) -> bool {
        match (self, buffer) {
            (Sink::Project(ProjectSink { early_stop: Some(rows), .. }), Some(buffer)) => {
                buffer.height() >= *rows
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub column: String,
    pub descending: bool,
}

/// Work done once every partition has finished.
#[derive(Debug, Clone)]
pub struct Finish {
    pub having: Option<Expr>,
    pub project: Option<Vec<Expr>>,
    pub output_columns: Vec<String>,
    pub distinct: bool,
    pub order: Vec<OrderKey>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Finish {
    fn apply(&self, mut frame: LazyFrame) -> Result<DataFrame> {
        if let Some(having) = &self.having {
            frame = frame.filter(having.clone());
        }
        if let Some(project) = &self.project {
            frame = frame.select(project.clone());
        }
        if self.distinct {
            frame = frame.unique_stable(Some(self.output_columns.clone()), UniqueKeepStrategy::First);
        }
        if !self.order.is_empty() {
            let by: Vec<Expr> = self.order.iter().map(|k| col(&k.column)).collect();
            let descending: Vec<bool> = self.order.iter().map(|k| k.descending).collect();
            frame = frame.sort_by_exprs(
                by,
                SortMultipleOptions::default()
                    .with_order_descendings(descending)
                    .with_nulls_last(true)
                    .with_maintain_order(true),
            );
        }
        if self.offset > 0 || self.limit.is_some() {
            let len = self.limit.map(|l| l as IdxSize).unwrap_or(IdxSize::MAX);
            frame = frame.slice(self.offset as i64, len);
        }
        let outputs: Vec<Expr> = self.output_columns.iter().map(|c| col(c)).collect();
        Ok(frame.select(outputs).collect()?)
    }
}

/// Progress of one partition over its contiguous driving range.
#[derive(Debug, Clone)]
pub struct PartitionState {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub cursor: usize,
    pub finished: bool,
    pub buffer: Option<DataFrame>,
}

impl PartitionState {
    pub fn buffered_rows(&self) -> usize {
        self.buffer.as_ref().map(|b| b.height()).unwrap_or(0)
    }

    /// Check a restored state against the range it claims to cover.
    pub fn validate(&self, total_rows: usize) -> Result<()> {
        if self.start > self.end || self.end > total_rows || self.cursor < self.start || self.cursor > self.end {
            return Err(RatchetError::Execution(format!(
                "Partition {} cursor {} outside range [{}, {}) of {} rows",
                self.index, self.cursor, self.start, self.end, total_rows
            )));
        }
        Ok(())
    }
}

/// An executable, checkpointable query.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub driving: DrivingRelation,
    pub joins: Vec<JoinStep>,
    pub sink: Sink,
    pub finish: Finish,
    pub batch_rows: usize,
}

impl QueryPlan {
    pub fn driving_rows(&self) -> usize {
        self.driving.frame.height()
    }

    /// Split the driving relation into `partitions` contiguous ranges.
    pub fn initial_states(&self, partitions: usize) -> Vec<PartitionState> {
        let partitions = partitions.max(1);
        let total = self.driving_rows();
        let chunk = total.div_ceil(partitions);
        (0..partitions)
            .map(|index| {
                let start = (index * chunk).min(total);
                let end = ((index + 1) * chunk).min(total);
                PartitionState {
                    index,
                    start,
                    end,
                    cursor: start,
                    finished: start == end,
                    buffer: None,
                }
            })
            .collect()
    }

    /// Process exactly one driving batch. A batch is the unit of interruption.
    pub fn step(&self, state: &mut PartitionState) -> Result<()> {
        if state.finished {
            return Ok(());
        }
        let len = (state.end - state.cursor).min(self.batch_rows.max(1));
        if len == 0 {
            state.finished = true;
            return Ok(());
        }

        let batch = self.driving.frame.slice(state.cursor as i64, len);
        let output = self.process_batch(batch)?;
        state.buffer = Some(self.sink.absorb(state.buffer.take(), output)?);
        state.cursor += len;

        if state.cursor >= state.end || self.sink.satisfied(state.buffer.as_ref()) {
            state.finished = true;
        }
        Ok(())
    }

    fn process_batch(&self, batch: DataFrame) -> Result<DataFrame> {
        let mut frame = batch.lazy();
        if let Some(filter) = &self.driving.filter {
            frame = frame.filter(filter.clone());
        }

        for join in &self.joins {
            let left_on: Vec<Expr> = join.probe_key_columns.iter().map(|c| col(c)).collect();
            let right_on: Vec<Expr> = join.build_key_columns.iter().map(|c| col(c)).collect();
            frame = frame
                .with_row_index(&join.probe_index, None)
                .with_columns(join.probe_keys.clone())
                .join(
                    join.build.clone().lazy(),
                    left_on,
                    right_on,
                    JoinArgs::new(JoinType::Inner),
                )
                .sort_by_exprs(
                    vec![col(&join.probe_index), col(&join.build_index)],
                    SortMultipleOptions::default().with_maintain_order(true),
                );
            if let Some(filter) = &join.filter {
                frame = frame.filter(filter.clone());
            }
        }

        self.sink.consume(frame)
    }

    /// Merge partition buffers in partition-index order and produce the result.
    pub fn finalize(&self, states: &[PartitionState]) -> Result<DataFrame> {
        let mut ordered: Vec<&PartitionState> = states.iter().collect();
        ordered.sort_by_key(|s| s.index);

        let mut merged: Option<DataFrame> = None;
        for state in ordered {
            if let Some(buffer) = &state.buffer {
                merged = Some(match merged {
                    Some(acc) => stack(acc, buffer)?,
                    None => buffer.clone(),
                });
            }
        }
        let merged = match merged {
            Some(frame) => frame,
            None => self.process_batch(self.driving.frame.slice(0, 0))?,
        };

        let frame = match &self.sink {
            Sink::Aggregate(agg) => agg.finish(agg.merge(merged)?),
            Sink::Project(_) => merged.lazy(),
        };
        let mut result = self.finish.apply(frame)?;
        result.as_single_chunk_par();
        Ok(result)
    }

    /// Run every partition to completion on the calling thread.
    pub fn run_sequential(&self, partitions: usize) -> Result<DataFrame> {
        let mut states = self.initial_states(partitions);
        for state in states.iter_mut() {
            while !state.finished {
                self.step(state)?;
            }
        }
        debug!(
            "Sequential run over {} ({} rows) finished",
            self.driving.name,
            self.driving_rows()
        );
        self.finalize(&states)
    }
}

/// Append `next` below `acc`, casting to `acc`'s column types where they differ.
pub fn stack(mut acc: DataFrame, next: &DataFrame) -> Result<DataFrame> {
    if acc.width() != next.width() {
        return Err(RatchetError::Execution(format!(
            "Cannot stack frames of width {} and {}",
            acc.width(),
            next.width()
        )));
    }
    let aligned = if acc.schema() == next.schema() {
        next.clone()
    } else {
        let casts: Vec<Expr> = acc
            .get_columns()
            .iter()
            .map(|s| col(s.name()).cast(s.dtype().clone()))
            .collect();
        next.clone().lazy().select(casts).collect()?
    };
    acc.vstack_mut(&aligned)?;
    Ok(acc)
}
