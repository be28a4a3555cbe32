//! Suspend/Resume Controller
//!
//! Runs a query definition in one of three modes. Setup statements always run
//! to completion; only the result-producing statement is executed on the
//! partitioned pipeline, where a suspend window may arrest it between batches
//! and a checkpoint captures each partition's cursor and buffered rows.

pub mod barrier;
pub mod checkpoint;
pub mod monitor;
pub mod runner;
pub mod window;

use crate::engine::{parse_statements, EngineOptions};
use crate::error::{RatchetError, Result};
use crate::session::ExecutionSession;
use checkpoint::{statement_fingerprint, CheckpointHeader, CheckpointStore, FORMAT_VERSION};
use chrono::Utc;
use polars::prelude::*;
use runner::{run_partitions, RunOutcome};
use sqlparser::ast::Statement;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;
pub use window::SuspendWindow;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    Plain,
    Suspend {
        window: SuspendWindow,
        location: PathBuf,
        partitioned: bool,
    },
    Resume {
        location: PathBuf,
        partitioned: bool,
    },
}

/// What a paused suspend run left behind.
#[derive(Debug, Clone)]
pub struct SuspendReport {
    pub checkpoint_id: Uuid,
    pub location: PathBuf,
    pub partitioned: bool,
    pub partitions: usize,
    pub arrested_partitions: usize,
    pub buffered_rows: usize,
    pub forced: bool,
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed(DataFrame),
    Paused(SuspendReport),
}

pub struct SuspendResumeController<'s> {
    session: &'s mut ExecutionSession,
}

impl<'s> SuspendResumeController<'s> {
    pub fn new(session: &'s mut ExecutionSession) -> Self {
        Self { session }
    }

    /// Execute a query definition; the last statement produces the result.
    pub async fn execute(
        &mut self,
        statements: &[String],
        mode: &ExecutionMode,
    ) -> Result<ExecutionOutcome> {
        let (last, setup) = statements.split_last().ok_or_else(|| {
            RatchetError::InvalidConfiguration("query definition has no statements".to_string())
        })?;
        let mut prelude = Vec::with_capacity(setup.len());
        for sql in setup {
            self.session.execute_sql(sql)?;
            prelude.extend(parse_statements(sql)?);
        }

        match mode {
            ExecutionMode::Plain => self.run_plain(last).await,
            ExecutionMode::Suspend {
                window,
                location,
                partitioned,
            } => {
                let store = CheckpointStore::new(location.clone(), *partitioned);
                self.run_suspend(&prelude, last, *window, store).await
            }
            ExecutionMode::Resume {
                location,
                partitioned,
            } => {
                let store = CheckpointStore::new(location.clone(), *partitioned);
                self.run_resume(&prelude, last, store).await
            }
        }
    }

    async fn run_plain(&mut self, sql: &str) -> Result<ExecutionOutcome> {
        let options = self.session.engine_options()?;
        if !is_single_query(sql) {
            let frame = self.session.execute_sql(sql)?.unwrap_or_default();
            return Ok(ExecutionOutcome::Completed(frame));
        }
        let prepared = self.session.prepare(sql, options)?;

        let plan = Arc::new(prepared.plan);
        let states = plan.initial_states(options.partitions);
        match run_partitions(plan.clone(), states, None).await? {
            RunOutcome::Finished(states) => Ok(ExecutionOutcome::Completed(plan.finalize(&states)?)),
            RunOutcome::Arrested { .. } => Err(RatchetError::Execution(
                "unmonitored run was arrested".to_string(),
            )),
        }
    }

    async fn run_suspend(
        &mut self,
        prelude: &[Statement],
        sql: &str,
        window: SuspendWindow,
        store: CheckpointStore,
    ) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        let options = self.session.engine_options()?;
        let prepared = self.session.prepare(sql, options)?;
        let fingerprint = statement_fingerprint(prelude, &prepared.statement);

        let plan = Arc::new(prepared.plan);
        let states = plan.initial_states(options.partitions);
        info!(
            "Suspend run: window [{:.3}s, {:.3}s], {} partitions over {} rows of {}",
            window.start().as_secs_f64(),
            window.end().as_secs_f64(),
            states.len(),
            plan.driving_rows(),
            plan.driving.name
        );

        let (states, forced) =
            match run_partitions(plan.clone(), states, Some((window, started))).await? {
                RunOutcome::Finished(states) => {
                    info!("Statement completed before the suspend window, no checkpoint written");
                    return Ok(ExecutionOutcome::Completed(plan.finalize(&states)?));
                }
                RunOutcome::Arrested { states, forced } => (states, forced),
            };

        let header = CheckpointHeader {
            format_version: FORMAT_VERSION,
            checkpoint_id: Uuid::new_v4(),
            created_at: Utc::now(),
            fingerprint,
            driving_relation: plan.driving.name.clone(),
            driving_rows: plan.driving_rows(),
            batch_rows: plan.batch_rows,
            partition_count: states.len(),
            forced,
            partitions: Vec::new(),
        };
        let report = SuspendReport {
            checkpoint_id: header.checkpoint_id,
            location: store.location().to_path_buf(),
            partitioned: store.is_partitioned(),
            partitions: states.len(),
            arrested_partitions: states.iter().filter(|s| !s.finished).count(),
            buffered_rows: states.iter().map(|s| s.buffered_rows()).sum(),
            forced,
        };
        store.write(header, &states)?;
        Ok(ExecutionOutcome::Paused(report))
    }

    async fn run_resume(
        &mut self,
        prelude: &[Statement],
        sql: &str,
        store: CheckpointStore,
    ) -> Result<ExecutionOutcome> {
        let checkpoint = store.load()?;
        let header = &checkpoint.header;

        let options = EngineOptions {
            partitions: header.partition_count,
            batch_rows: header.batch_rows,
        };
        let statement = self.session.parse_query(sql)?;
        let fingerprint = statement_fingerprint(prelude, &statement);
        if fingerprint != header.fingerprint {
            return Err(RatchetError::StatementMismatch {
                expected: header.fingerprint.clone(),
                actual: fingerprint,
            });
        }

        let plan = Arc::new(self.session.plan_query(&statement, options)?);
        if plan.driving.name != header.driving_relation || plan.driving_rows() != header.driving_rows {
            return Err(RatchetError::StatementMismatch {
                expected: format!("{} ({} rows)", header.driving_relation, header.driving_rows),
                actual: format!("{} ({} rows)", plan.driving.name, plan.driving_rows()),
            });
        }
        for state in &checkpoint.states {
            state.validate(plan.driving_rows())?;
        }

        info!(
            "Resuming checkpoint {}: {} of {} partitions unfinished",
            header.checkpoint_id,
            checkpoint.states.iter().filter(|s| !s.finished).count(),
            checkpoint.states.len()
        );
        match run_partitions(plan.clone(), checkpoint.states, None).await? {
            RunOutcome::Finished(states) => Ok(ExecutionOutcome::Completed(plan.finalize(&states)?)),
            RunOutcome::Arrested { .. } => Err(RatchetError::Execution(
                "resumed run was arrested".to_string(),
            )),
        }
    }
}

fn is_single_query(sql: &str) -> bool {
    matches!(
        parse_statements(sql).as_deref(),
        Ok([Statement::Query(_)])
    )
}
