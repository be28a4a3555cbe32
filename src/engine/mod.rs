//! Statement engine
//!
//! A small analytical SQL engine over polars data frames whose execution is
//! a set of partitions stepped one driving batch at a time, so a running
//! query can be stopped between batches and continued later.

pub mod aggregate;
pub mod expr;
pub mod pipeline;
pub mod planner;

pub use pipeline::{PartitionState, QueryPlan};
pub use planner::{Planner, RelationProvider};

use crate::error::Result;
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

pub const DEFAULT_BATCH_ROWS: usize = 65_536;

/// Execution layout shared by a plan and everything evaluated while planning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub partitions: usize,
    pub batch_rows: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            batch_rows: DEFAULT_BATCH_ROWS,
        }
    }
}

/// Parse one SQL text into its statements.
pub fn parse_statements(sql: &str) -> Result<Vec<Statement>> {
    Ok(Parser::parse_sql(&GenericDialect {}, sql)?)
}
