//! Two-phase aggregation
//!
//! Each aggregate call is split into partial columns computed per batch,
//! merge expressions that fold partials together (across batches and across
//! partitions), and a final expression producing the SQL value. Partials are
//! plain columns, so a partition's running aggregation state can be stored in
//! a checkpoint as an ordinary data frame.

use super::expr::{function_args, ExprCompiler};
use crate::error::{RatchetError, Result};
use polars::prelude::*;
use sqlparser::ast::Function;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Sum,
    Count,
    CountStar,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Self::Sum),
            "count" => Some(Self::Count),
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            _ => None,
        }
    }
}

/// One aggregate call of a SELECT, with its hidden column layout.
#[derive(Debug, Clone)]
pub struct AggregateCall {
    pub kind: AggregateKind,
    pub input: Option<Expr>,
    pub text: String,
    pub slot: usize,
}

impl AggregateCall {
    /// Plan an aggregate call; its argument is compiled over the input scope.
    pub fn plan(function: &Function, slot: usize, compiler: &ExprCompiler<'_>) -> Result<Self> {
        let name = function.name.to_string().to_lowercase();
        let mut kind = AggregateKind::parse(&name)
            .ok_or_else(|| RatchetError::Unsupported(format!("aggregate {}", name)))?;
        if function.distinct {
            return Err(RatchetError::Unsupported(format!(
                "DISTINCT aggregate {}",
                function
            )));
        }

        let args = function_args(function);
        let input = match (kind, args.as_slice()) {
            (AggregateKind::Count, [None]) => {
                kind = AggregateKind::CountStar;
                None
            }
            (_, [Some(arg)]) => Some(compiler.compile(arg)?),
            _ => {
                return Err(RatchetError::Execution(format!(
                    "{} expects exactly one argument",
                    function
                )))
            }
        };

        Ok(Self {
            kind,
            input,
            text: function.to_string().to_lowercase(),
            slot,
        })
    }

    pub fn output_column(&self) -> String {
        format!("__a{}", self.slot)
    }

    fn value_column(&self) -> String {
        format!("__p{}_s", self.slot)
    }

    fn count_column(&self) -> String {
        format!("__p{}_c", self.slot)
    }

    fn input(&self) -> Result<Expr> {
        self.input
            .clone()
            .ok_or_else(|| RatchetError::Execution(format!("{} has no input", self.text)))
    }

    /// Expressions evaluated over one input batch.
    pub fn partial_exprs(&self) -> Result<Vec<Expr>> {
        let value = self.value_column();
        let count = self.count_column();
        Ok(match self.kind {
            AggregateKind::Sum => vec![
                self.input()?.sum().alias(&value),
                self.input()?.count().alias(&count),
            ],
            AggregateKind::Avg => vec![
                self.input()?.cast(DataType::Float64).sum().alias(&value),
                self.input()?.count().alias(&count),
            ],
            AggregateKind::Count => vec![self.input()?.count().alias(&count)],
            AggregateKind::CountStar => vec![len().alias(&count)],
            AggregateKind::Min => vec![self.input()?.min().alias(&value)],
            AggregateKind::Max => vec![self.input()?.max().alias(&value)],
        })
    }

    /// Expressions folding stacked partials into one partial per group.
    pub fn merge_exprs(&self) -> Vec<Expr> {
        let value = self.value_column();
        let count = self.count_column();
        match self.kind {
            AggregateKind::Sum | AggregateKind::Avg => vec![
                col(&value).sum().alias(&value),
                col(&count).sum().alias(&count),
            ],
            AggregateKind::Count | AggregateKind::CountStar => {
                vec![col(&count).sum().alias(&count)]
            }
            AggregateKind::Min => vec![col(&value).min().alias(&value)],
            AggregateKind::Max => vec![col(&value).max().alias(&value)],
        }
    }

    /// The SQL value of the aggregate, computed from a merged partial.
    pub fn final_expr(&self) -> Expr {
        let value = col(&self.value_column());
        let count = col(&self.count_column());
        let out = self.output_column();
        match self.kind {
            AggregateKind::Sum => when(count.eq(lit(0i64)))
                .then(lit(Null {}))
                .otherwise(value)
                .alias(&out),
            AggregateKind::Avg => when(count.clone().eq(lit(0i64)))
                .then(lit(Null {}))
                .otherwise(value / count.cast(DataType::Float64))
                .alias(&out),
            AggregateKind::Count | AggregateKind::CountStar => count.alias(&out),
            AggregateKind::Min | AggregateKind::Max => value.alias(&out),
        }
    }
}

/// Partial aggregation sink state layout.
#[derive(Debug, Clone)]
pub struct AggregateSink {
    pub keys: Vec<Expr>,
    pub key_columns: Vec<String>,
    pub calls: Vec<AggregateCall>,
}

impl AggregateSink {
    /// Aggregate one processed batch into a partial frame.
    pub fn partial(&self, batch: LazyFrame) -> Result<DataFrame> {
        let mut partials = Vec::new();
        for call in &self.calls {
            partials.extend(call.partial_exprs()?);
        }
        let frame = if self.keys.is_empty() {
            batch.select(partials).collect()?
        } else {
            batch
                .group_by_stable(self.keys.clone())
                .agg(partials)
                .collect()?
        };
        normalize_partials(frame)
    }

    /// Fold stacked partial rows into one row per group, keeping first-seen order.
    pub fn merge(&self, stacked: DataFrame) -> Result<DataFrame> {
        let merges: Vec<Expr> = self.calls.iter().flat_map(|c| c.merge_exprs()).collect();
        let frame = if self.key_columns.is_empty() {
            stacked.lazy().select(merges).collect()?
        } else {
            let keys: Vec<Expr> = self.key_columns.iter().map(|k| col(k)).collect();
            stacked.lazy().group_by_stable(keys).agg(merges).collect()?
        };
        normalize_partials(frame)
    }

    /// Attach the final aggregate value columns.
    pub fn finish(&self, merged: DataFrame) -> LazyFrame {
        let finals: Vec<Expr> = self.calls.iter().map(|c| c.final_expr()).collect();
        if finals.is_empty() {
            merged.lazy()
        } else {
            merged.lazy().with_columns(finals)
        }
    }
}

/// Widen partial columns so partials from any batch stack together.
fn normalize_partials(frame: DataFrame) -> Result<DataFrame> {
    let casts: Vec<Expr> = frame
        .get_columns()
        .iter()
        .filter(|s| s.name().starts_with("__p"))
        .filter_map(|s| {
            let target = match s.dtype() {
                DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64 => DataType::Int64,
                DataType::Float32 => DataType::Float64,
                _ => return None,
            };
            Some(col(s.name()).cast(target))
        })
        .collect();
    if casts.is_empty() {
        return Ok(frame);
    }
    Ok(frame.lazy().with_columns(casts).collect()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_call(slot: usize, input: &str) -> AggregateCall {
        AggregateCall {
            kind: AggregateKind::Sum,
            input: Some(col(input)),
            text: format!("sum({})", input),
            slot,
        }
    }

    #[test]
    fn test_partial_merge_matches_single_pass() {
        let sink = AggregateSink {
            keys: vec![col("flag").alias("__k0")],
            key_columns: vec!["__k0".to_string()],
            calls: vec![
                sum_call(0, "qty"),
                AggregateCall {
                    kind: AggregateKind::CountStar,
                    input: None,
                    text: "count(*)".to_string(),
                    slot: 1,
                },
                AggregateCall {
                    kind: AggregateKind::Avg,
                    input: Some(col("qty")),
                    text: "avg(qty)".to_string(),
                    slot: 2,
                },
            ],
        };

        let first = df!("flag" => ["A", "B", "A"], "qty" => [1i32, 2, 3]).unwrap();
        let second = df!("flag" => ["B", "C"], "qty" => [4i32, 5]).unwrap();

        let a = sink.partial(first.lazy()).unwrap();
        let b = sink.partial(second.lazy()).unwrap();
        let merged = sink.merge(a.vstack(&b).unwrap()).unwrap();
        let out = sink.finish(merged).collect().unwrap();

        let keys: Vec<Option<&str>> = out.column("__k0").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(keys, vec![Some("A"), Some("B"), Some("C")]);

        let sums: Vec<Option<i64>> = out.column("__a0").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(sums, vec![Some(4), Some(6), Some(5)]);

        let counts: Vec<Option<i64>> = out.column("__a1").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(counts, vec![Some(2), Some(2), Some(1)]);

        let avgs: Vec<Option<f64>> = out.column("__a2").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(avgs, vec![Some(2.0), Some(3.0), Some(5.0)]);
    }

    #[test]
    fn test_sum_over_empty_input_is_null() {
        let sink = AggregateSink {
            keys: vec![],
            key_columns: vec![],
            calls: vec![sum_call(0, "qty")],
        };
        let empty = df!("qty" => Vec::<f64>::new()).unwrap();
        let partial = sink.partial(empty.lazy()).unwrap();
        assert_eq!(partial.height(), 1);

        let out = sink.finish(sink.merge(partial).unwrap()).collect().unwrap();
        assert_eq!(out.column("__a0").unwrap().null_count(), 1);
    }
}
