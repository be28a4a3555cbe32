//! Execution Session
//!
//! Owns the table store, the views created by setup statements and the
//! resource configuration statements run under. Lifecycle is
//! open → configure → execute* → close; dropping an open session closes it.

pub mod catalog;

use crate::engine::{parse_statements, EngineOptions, Planner, QueryPlan, RelationProvider};
use crate::engine::expr::SubqueryEvaluator;
use crate::error::{RatchetError, Result};
use catalog::{MemoryStore, SqliteStore, TableEntry, TableStore};
use polars::prelude::*;
use sqlparser::ast::{ObjectName, ObjectType, Query, Statement};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where the session keeps its tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    InMemory,
    File(PathBuf),
}

impl DatabaseLocation {
    /// `memory` and `:memory:` select the in-memory store; anything else is a catalog file.
    pub fn parse(location: &str) -> Self {
        match location.trim() {
            "memory" | ":memory:" | "" => DatabaseLocation::InMemory,
            path => DatabaseLocation::File(PathBuf::from(path)),
        }
    }
}

impl fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseLocation::InMemory => write!(f, ":memory:"),
            DatabaseLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Resource settings applied by `configure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub thread_count: usize,
    pub spill_directory: PathBuf,
}

/// A parsed result-producing query and its plan.
pub struct PreparedQuery {
    pub statement: Statement,
    pub plan: QueryPlan,
}

pub struct ExecutionSession {
    location: DatabaseLocation,
    store: Option<Box<dyn TableStore>>,
    views: HashMap<String, Query>,
    config: Option<SessionConfig>,
    batch_rows: usize,
}

impl ExecutionSession {
    pub fn open(location: DatabaseLocation) -> Result<Self> {
        let store: Box<dyn TableStore> = match &location {
            DatabaseLocation::InMemory => Box::new(MemoryStore::new()),
            DatabaseLocation::File(path) => Box::new(SqliteStore::open(path)?),
        };
        info!("Session opened on {}", location);
        Ok(Self {
            location,
            store: Some(store),
            views: HashMap::new(),
            config: None,
            batch_rows: crate::engine::DEFAULT_BATCH_ROWS,
        })
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    pub fn is_closed(&self) -> bool {
        self.store.is_none()
    }

    /// Apply resource settings. Must run before any statement executes.
    ///
    /// The thread count becomes the partition count of every statement. The
    /// polars pool and spill settings are process-wide and are exported once,
    /// before any thread starts, from [`polars_environment`].
    pub fn configure(&mut self, thread_count: usize, spill_directory: &Path) -> Result<()> {
        self.ensure_open()?;
        if thread_count < 1 {
            return Err(RatchetError::InvalidConfiguration(format!(
                "thread count must be at least 1, got {}",
                thread_count
            )));
        }
        probe_writable(spill_directory)?;

        info!(
            "Session configured: {} threads, spill directory {}",
            thread_count,
            spill_directory.display()
        );
        self.config = Some(SessionConfig {
            thread_count,
            spill_directory: spill_directory.to_path_buf(),
        });
        Ok(())
    }

    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// Rows per driving batch, i.e. the distance between safe points.
    pub fn set_batch_rows(&mut self, batch_rows: usize) -> Result<()> {
        if batch_rows < 1 {
            return Err(RatchetError::InvalidConfiguration(
                "batch rows must be at least 1".to_string(),
            ));
        }
        self.batch_rows = batch_rows;
        Ok(())
    }

    /// Layout for statements run under the current configuration.
    pub fn engine_options(&self) -> Result<EngineOptions> {
        self.ensure_open()?;
        let config = self.config.as_ref().ok_or_else(|| {
            RatchetError::InvalidConfiguration(
                "session must be configured before executing statements".to_string(),
            )
        })?;
        Ok(EngineOptions {
            partitions: config.thread_count,
            batch_rows: self.batch_rows,
        })
    }

    pub fn table_entry(&self, name: &str) -> Result<Option<TableEntry>> {
        self.store()?.entry(&name.to_lowercase())
    }

    pub fn create_table(&mut self, name: &str, frame: DataFrame, source: &str) -> Result<TableEntry> {
        let name = name.to_lowercase();
        let entry = self.store_mut()?.put(&name, frame, source)?;
        debug!("Table {} stored ({} rows)", name, entry.rows);
        Ok(entry)
    }

    pub fn drop_table(&mut self, name: &str) -> Result<bool> {
        self.store_mut()?.remove(&name.to_lowercase())
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        self.store()?.names()
    }

    /// Run every statement in `sql` to completion; returns the last query's rows.
    pub fn execute_sql(&mut self, sql: &str) -> Result<Option<DataFrame>> {
        self.ensure_open()?;
        let mut last = None;
        for statement in parse_statements(sql)? {
            last = self.execute(&statement)?;
        }
        Ok(last)
    }

    pub fn execute(&mut self, statement: &Statement) -> Result<Option<DataFrame>> {
        let options = self.engine_options()?;
        match statement {
            Statement::Query(query) => {
                let frame = Planner::new(&*self, options).evaluate(query)?;
                Ok(Some(frame))
            }
            Statement::CreateView {
                name,
                query,
                or_replace,
                ..
            } => {
                let view = object_name(name)?;
                if !*or_replace && self.views.contains_key(&view) {
                    return Err(RatchetError::Execution(format!("view {} already exists", view)));
                }
                // Validate now so a broken view fails at creation.
                Planner::new(&*self, options).plan(query)?;
                debug!("View {} created", view);
                self.views.insert(view, query.as_ref().clone());
                Ok(None)
            }
            Statement::CreateTable {
                name,
                query: Some(query),
                if_not_exists,
                or_replace,
                ..
            } => {
                let table = object_name(name)?;
                if self.table_entry(&table)?.is_some() {
                    if *if_not_exists {
                        return Ok(None);
                    }
                    if !*or_replace {
                        return Err(RatchetError::Execution(format!(
                            "table {} already exists",
                            table
                        )));
                    }
                }
                let frame = Planner::new(&*self, options).evaluate(query)?;
                self.create_table(&table, frame, &format!("query: {}", query))?;
                Ok(None)
            }
            Statement::Drop {
                object_type,
                if_exists,
                names,
                ..
            } => {
                for name in names {
                    let target = object_name(name)?;
                    let removed = match object_type {
                        ObjectType::View => self.views.remove(&target).is_some(),
                        ObjectType::Table => self.drop_table(&target)?,
                        other => {
                            return Err(RatchetError::Unsupported(format!("DROP {}", other)))
                        }
                    };
                    if !removed && !*if_exists {
                        return Err(RatchetError::UnknownTable(target));
                    }
                }
                Ok(None)
            }
            other => Err(RatchetError::Unsupported(format!("statement {}", other))),
        }
    }

    /// Parse `sql` as exactly one query and plan it under `options`.
    pub fn prepare(&self, sql: &str, options: EngineOptions) -> Result<PreparedQuery> {
        let statement = self.parse_query(sql)?;
        let plan = self.plan_query(&statement, options)?;
        Ok(PreparedQuery { statement, plan })
    }

    /// Parse `sql` as exactly one query statement.
    pub fn parse_query(&self, sql: &str) -> Result<Statement> {
        self.ensure_open()?;
        let mut statements = parse_statements(sql)?;
        if statements.len() != 1 {
            return Err(RatchetError::Unsupported(format!(
                "expected one result-producing statement, found {}",
                statements.len()
            )));
        }
        let statement = statements.remove(0);
        if !matches!(statement, Statement::Query(_)) {
            return Err(RatchetError::Unsupported(format!(
                "only a query can be suspended or resumed, got {}",
                statement
            )));
        }
        Ok(statement)
    }

    pub fn plan_query(&self, statement: &Statement, options: EngineOptions) -> Result<QueryPlan> {
        self.ensure_open()?;
        match statement {
            Statement::Query(query) => Planner::new(self, options).plan(query),
            other => Err(RatchetError::Unsupported(format!("statement {}", other))),
        }
    }

    /// Release the table store. Safe exactly once; later calls fail.
    pub fn close(&mut self) -> Result<()> {
        match self.store.take() {
            Some(store) => {
                drop(store);
                self.views.clear();
                info!("Session on {} closed", self.location);
                Ok(())
            }
            None => Err(RatchetError::SessionClosed),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.store.is_none() {
            return Err(RatchetError::SessionClosed);
        }
        Ok(())
    }

    fn store(&self) -> Result<&dyn TableStore> {
        self.store.as_deref().ok_or(RatchetError::SessionClosed)
    }

    fn store_mut(&mut self) -> Result<&mut (dyn TableStore + 'static)> {
        self.store.as_deref_mut().ok_or(RatchetError::SessionClosed)
    }
}

impl RelationProvider for ExecutionSession {
    fn relation(&self, name: &str, options: &EngineOptions) -> Result<DataFrame> {
        if let Some(view) = self.views.get(name) {
            return Planner::new(self, *options).evaluate(view);
        }
        self.store()?.load(name)
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!("Failed to close session: {}", e);
            }
        }
    }
}

fn object_name(name: &ObjectName) -> Result<String> {
    name.0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .ok_or_else(|| RatchetError::Parse("empty object name".to_string()))
}

/// Process-wide polars settings for a run with `thread_count` workers.
///
/// Polars reads these once, when its thread pool first starts, so they are
/// exported before the async runtime spawns any worker.
pub fn polars_environment(thread_count: usize, spill_directory: &Path) -> Vec<(&'static str, String)> {
    vec![
        ("POLARS_MAX_THREADS", thread_count.max(1).to_string()),
        ("POLARS_TEMP_DIR", spill_directory.display().to_string()),
    ]
}

fn probe_writable(dir: &Path) -> Result<()> {
    let invalid = |e: std::io::Error| {
        RatchetError::InvalidConfiguration(format!(
            "spill directory {} is not writable: {}",
            dir.display(),
            e
        ))
    };
    std::fs::create_dir_all(dir).map_err(invalid)?;
    let probe = dir.join(format!(".ratchet-probe-{}", uuid::Uuid::new_v4()));
    std::fs::write(&probe, b"probe").map_err(invalid)?;
    std::fs::remove_file(&probe).map_err(invalid)?;
    Ok(())
}
