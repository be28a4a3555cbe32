//! Expression compilation
//!
//! Translates `sqlparser` expressions into polars expressions over the
//! qualified column names of a FROM scope (`binding.column`). The same
//! compiler runs in two modes: over raw input batches, and over merged
//! aggregation output where aggregate calls and GROUP BY expressions have
//! already been materialized into hidden columns.

use crate::error::{RatchetError, Result};
use chrono::{Datelike, Months, NaiveDate};
use polars::prelude::*;
use sqlparser::ast::{
    BinaryOperator, DataType as SqlDataType, DateTimeField, Expr as SqlExpr, Function,
    FunctionArg, FunctionArgExpr, Ident, Interval, Query, UnaryOperator, Value,
};

/// Column layout of one relation bound in a FROM clause.
#[derive(Debug, Clone)]
pub struct BindingSchema {
    /// Lowercase binding name (alias or table name).
    pub name: String,
    /// Original column names with their types.
    pub columns: Vec<(String, DataType)>,
}

impl BindingSchema {
    pub fn qualified(&self, column: &str) -> String {
        qualified_name(&self.name, column)
    }

    fn find(&self, column: &str) -> Option<&(String, DataType)> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
    }
}

pub fn qualified_name(binding: &str, column: &str) -> String {
    format!("{}.{}", binding, column)
}

/// A column reference resolved against a scope.
#[derive(Debug, Clone)]
pub struct ResolvedColumn {
    pub binding: usize,
    pub qualified: String,
    pub name: String,
    pub dtype: DataType,
}

/// The set of relations visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub bindings: Vec<BindingSchema>,
}

impl Scope {
    pub fn new(bindings: Vec<BindingSchema>) -> Self {
        Self { bindings }
    }

    pub fn resolve(&self, idents: &[Ident]) -> Result<ResolvedColumn> {
        match idents {
            [column] => {
                let mut found = None;
                for (idx, binding) in self.bindings.iter().enumerate() {
                    if let Some((name, dtype)) = binding.find(&column.value) {
                        if found.is_some() {
                            return Err(RatchetError::Execution(format!(
                                "Ambiguous column reference: {}",
                                column.value
                            )));
                        }
                        found = Some(ResolvedColumn {
                            binding: idx,
                            qualified: binding.qualified(name),
                            name: name.clone(),
                            dtype: dtype.clone(),
                        });
                    }
                }
                found.ok_or_else(|| RatchetError::UnknownColumn(column.value.clone()))
            }
            [.., relation, column] => {
                let relation = relation.value.to_lowercase();
                let (idx, binding) = self
                    .bindings
                    .iter()
                    .enumerate()
                    .find(|(_, b)| b.name == relation)
                    .ok_or_else(|| RatchetError::UnknownTable(relation.clone()))?;
                let (name, dtype) = binding.find(&column.value).ok_or_else(|| {
                    RatchetError::UnknownColumn(format!("{}.{}", relation, column.value))
                })?;
                Ok(ResolvedColumn {
                    binding: idx,
                    qualified: binding.qualified(name),
                    name: name.clone(),
                    dtype: dtype.clone(),
                })
            }
            [] => Err(RatchetError::Parse("empty identifier".to_string())),
        }
    }
}

/// Evaluates uncorrelated subqueries during compilation.
pub trait SubqueryEvaluator {
    fn evaluate(&self, query: &Query) -> Result<DataFrame>;
}

/// A GROUP BY expression materialized as a hidden key column.
#[derive(Debug, Clone)]
pub struct GroupKey {
    pub column: String,
    pub resolved: Option<String>,
    pub text: String,
}

/// An aggregate call materialized as a hidden column after merging.
#[derive(Debug, Clone)]
pub struct AggregateSlot {
    pub column: String,
    pub text: String,
}

/// Mappings available once aggregation has run.
#[derive(Debug, Clone, Default)]
pub struct PostAggregate {
    pub keys: Vec<GroupKey>,
    pub aggregates: Vec<AggregateSlot>,
}

pub const AGGREGATE_FUNCTIONS: [&str; 5] = ["sum", "count", "avg", "min", "max"];

pub fn is_aggregate_call(function: &Function) -> bool {
    let name = function.name.to_string().to_lowercase();
    AGGREGATE_FUNCTIONS.contains(&name.as_str()) && function.over.is_none()
}

/// Normalized text used to match expressions across clauses.
pub fn expr_text(expr: &SqlExpr) -> String {
    expr.to_string().to_lowercase()
}

/// Compiles SQL expressions against a scope.
pub struct ExprCompiler<'a> {
    scope: &'a Scope,
    subqueries: &'a dyn SubqueryEvaluator,
    post: Option<&'a PostAggregate>,
}

impl<'a> ExprCompiler<'a> {
    pub fn new(scope: &'a Scope, subqueries: &'a dyn SubqueryEvaluator) -> Self {
        Self {
            scope,
            subqueries,
            post: None,
        }
    }

    pub fn post_aggregate(
        scope: &'a Scope,
        subqueries: &'a dyn SubqueryEvaluator,
        post: &'a PostAggregate,
    ) -> Self {
        Self {
            scope,
            subqueries,
            post: Some(post),
        }
    }

    pub fn compile(&self, expr: &SqlExpr) -> Result<Expr> {
        if let Some(post) = self.post {
            if let Some(mapped) = self.map_post_aggregate(post, expr)? {
                return Ok(mapped);
            }
        }

        if let Some(date) = fold_date(expr) {
            return Ok(date_literal(date));
        }

        match expr {
            SqlExpr::Identifier(ident) => self.column(std::slice::from_ref(ident)),
            SqlExpr::CompoundIdentifier(idents) => self.column(idents),
            SqlExpr::Value(value) => value_literal(value),
            SqlExpr::Nested(inner) => self.compile(inner),
            SqlExpr::UnaryOp { op, expr: inner } => match op {
                UnaryOperator::Not => Ok(self.compile(inner)?.not()),
                UnaryOperator::Plus => self.compile(inner),
                UnaryOperator::Minus => match inner.as_ref() {
                    SqlExpr::Value(Value::Number(n, _)) => number_literal(&format!("-{}", n)),
                    _ => Ok(lit(0i64) - self.compile(inner)?),
                },
                other => Err(RatchetError::Unsupported(format!("unary operator {}", other))),
            },
            SqlExpr::BinaryOp { left, op, right } => self.binary(left, op, right),
            SqlExpr::IsNull(inner) => Ok(self.compile(inner)?.is_null()),
            SqlExpr::IsNotNull(inner) => Ok(self.compile(inner)?.is_not_null()),
            SqlExpr::Between {
                expr: inner,
                negated,
                low,
                high,
            } => {
                let hint = self.static_dtype(inner);
                let value = self.compile(inner)?;
                let low = self.compile_hinted(low, hint.as_ref())?;
                let high = self.compile_hinted(high, hint.as_ref())?;
                let between = value.clone().gt_eq(low).and(value.lt_eq(high));
                Ok(if *negated { between.not() } else { between })
            }
            SqlExpr::InList {
                expr: inner,
                list,
                negated,
            } => {
                if list.is_empty() {
                    return Ok(lit(*negated));
                }
                let hint = self.static_dtype(inner);
                let value = self.compile(inner)?;
                let mut any: Option<Expr> = None;
                for item in list {
                    let eq = value.clone().eq(self.compile_hinted(item, hint.as_ref())?);
                    any = Some(match any {
                        Some(acc) => acc.or(eq),
                        None => eq,
                    });
                }
                let any = any.unwrap_or_else(|| lit(false));
                Ok(if *negated { any.not() } else { any })
            }
            SqlExpr::InSubquery {
                expr: inner,
                subquery,
                negated,
            } => {
                let frame = self.subqueries.evaluate(subquery)?;
                if frame.width() != 1 {
                    return Err(RatchetError::Execution(format!(
                        "IN subquery must return one column, got {}",
                        frame.width()
                    )));
                }
                let mut values = frame.get_columns()[0].clone();
                if let Some(dtype) = self.static_dtype(inner) {
                    values = values.cast(&dtype)?;
                }
                let membership = self.compile(inner)?.is_in(lit(values));
                Ok(if *negated {
                    membership.not()
                } else {
                    membership
                })
            }
            SqlExpr::Subquery(subquery) => {
                let frame = self.subqueries.evaluate(subquery)?;
                if frame.width() != 1 || frame.height() > 1 {
                    return Err(RatchetError::Execution(format!(
                        "Scalar subquery returned {} rows x {} columns",
                        frame.height(),
                        frame.width()
                    )));
                }
                if frame.height() == 0 {
                    return Ok(lit(Null {}));
                }
                Ok(lit(frame.get_columns()[0].clone()))
            }
            SqlExpr::Like {
                negated,
                expr: inner,
                pattern,
                escape_char,
            } => self.like(inner, pattern, *escape_char, *negated, false),
            SqlExpr::ILike {
                negated,
                expr: inner,
                pattern,
                escape_char,
            } => self.like(inner, pattern, *escape_char, *negated, true),
            SqlExpr::Case {
                operand,
                conditions,
                results,
                else_result,
            } => {
                let mut acc = match else_result {
                    Some(otherwise) => self.compile(otherwise)?,
                    None => lit(Null {}),
                };
                for (condition, result) in conditions.iter().zip(results.iter()).rev() {
                    let condition = match operand {
                        Some(operand) => self.compile(operand)?.eq(self.compile(condition)?),
                        None => self.compile(condition)?,
                    };
                    acc = when(condition).then(self.compile(result)?).otherwise(acc);
                }
                Ok(acc)
            }
            SqlExpr::Extract { field, expr: inner } => {
                let value = self.compile(inner)?;
                match field {
                    DateTimeField::Year => Ok(value.dt().year()),
                    DateTimeField::Month => Ok(value.dt().month()),
                    DateTimeField::Day => Ok(value.dt().day()),
                    other => Err(RatchetError::Unsupported(format!("EXTRACT({})", other))),
                }
            }
            SqlExpr::Cast {
                expr: inner,
                data_type,
                ..
            } => {
                let target = map_sql_type(data_type)?;
                Ok(self.compile(inner)?.cast(target))
            }
            SqlExpr::Function(function) => {
                if is_aggregate_call(function) {
                    Err(RatchetError::Execution(format!(
                        "Aggregate {} is not allowed here",
                        function
                    )))
                } else {
                    Err(RatchetError::Unsupported(format!("function {}", function.name)))
                }
            }
            SqlExpr::Exists { .. } => Err(RatchetError::Unsupported("EXISTS".to_string())),
            other => Err(RatchetError::Unsupported(format!("expression {}", other))),
        }
    }

    /// Compiles a string literal as a date when the other operand is date-typed.
    fn compile_hinted(&self, expr: &SqlExpr, hint: Option<&DataType>) -> Result<Expr> {
        if let (Some(DataType::Date), SqlExpr::Value(Value::SingleQuotedString(s))) = (hint, expr) {
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Ok(date_literal(date));
            }
        }
        self.compile(expr)
    }

    fn column(&self, idents: &[Ident]) -> Result<Expr> {
        if self.post.is_some() {
            // Columns that survive aggregation were mapped in map_post_aggregate.
            let resolved = self.scope.resolve(idents)?;
            return Err(RatchetError::Execution(format!(
                "Column {} must appear in GROUP BY or be used in an aggregate",
                resolved.name
            )));
        }
        let resolved = self.scope.resolve(idents)?;
        Ok(col(&resolved.qualified))
    }

    fn binary(&self, left: &SqlExpr, op: &BinaryOperator, right: &SqlExpr) -> Result<Expr> {
        let comparison = matches!(
            op,
            BinaryOperator::Eq
                | BinaryOperator::NotEq
                | BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq
        );
        let (l, r) = if comparison {
            let left_hint = self.static_dtype(left);
            let right_hint = self.static_dtype(right);
            (
                self.compile_hinted(left, right_hint.as_ref())?,
                self.compile_hinted(right, left_hint.as_ref())?,
            )
        } else {
            (self.compile(left)?, self.compile(right)?)
        };

        Ok(match op {
            BinaryOperator::Plus => l + r,
            BinaryOperator::Minus => l - r,
            BinaryOperator::Multiply => l * r,
            BinaryOperator::Divide => l.cast(DataType::Float64) / r.cast(DataType::Float64),
            BinaryOperator::Modulo => l % r,
            BinaryOperator::Eq => l.eq(r),
            BinaryOperator::NotEq => l.neq(r),
            BinaryOperator::Lt => l.lt(r),
            BinaryOperator::LtEq => l.lt_eq(r),
            BinaryOperator::Gt => l.gt(r),
            BinaryOperator::GtEq => l.gt_eq(r),
            BinaryOperator::And => l.and(r),
            BinaryOperator::Or => l.or(r),
            other => {
                return Err(RatchetError::Unsupported(format!(
                    "binary operator {}",
                    other
                )))
            }
        })
    }

    fn like(
        &self,
        expr: &SqlExpr,
        pattern: &SqlExpr,
        escape: Option<char>,
        negated: bool,
        case_insensitive: bool,
    ) -> Result<Expr> {
        let pattern = match pattern {
            SqlExpr::Value(Value::SingleQuotedString(p)) => p,
            other => {
                return Err(RatchetError::Unsupported(format!(
                    "non-literal LIKE pattern {}",
                    other
                )))
            }
        };
        let mut regex = like_to_regex(pattern, escape);
        if case_insensitive {
            regex = format!("(?i){}", regex);
        }
        let matched = self.compile(expr)?.str().contains(lit(regex), true);
        Ok(if negated { matched.not() } else { matched })
    }

    fn map_post_aggregate(&self, post: &PostAggregate, expr: &SqlExpr) -> Result<Option<Expr>> {
        if let SqlExpr::Function(function) = expr {
            if is_aggregate_call(function) {
                let text = expr_text(expr);
                let slot = post
                    .aggregates
                    .iter()
                    .find(|slot| slot.text == text)
                    .ok_or_else(|| {
                        RatchetError::Execution(format!("Aggregate {} was not planned", expr))
                    })?;
                return Ok(Some(col(&slot.column)));
            }
        }

        let resolved = match expr {
            SqlExpr::Identifier(ident) => {
                Some(self.scope.resolve(std::slice::from_ref(ident))?.qualified)
            }
            SqlExpr::CompoundIdentifier(idents) => Some(self.scope.resolve(idents)?.qualified),
            _ => None,
        };
        let text = expr_text(expr);
        let key = post.keys.iter().find(|key| match (&resolved, &key.resolved) {
            (Some(a), Some(b)) => a == b,
            _ => key.text == text,
        });
        Ok(key.map(|key| col(&key.column)))
    }

    /// Type of an expression when it can be known before execution.
    pub fn static_dtype(&self, expr: &SqlExpr) -> Option<DataType> {
        if fold_date(expr).is_some() {
            return Some(DataType::Date);
        }
        match expr {
            SqlExpr::Identifier(ident) => self
                .scope
                .resolve(std::slice::from_ref(ident))
                .ok()
                .map(|c| c.dtype),
            SqlExpr::CompoundIdentifier(idents) => self.scope.resolve(idents).ok().map(|c| c.dtype),
            SqlExpr::Cast { data_type, .. } => map_sql_type(data_type).ok(),
            SqlExpr::Nested(inner) => self.static_dtype(inner),
            SqlExpr::Extract { .. } => Some(DataType::Int32),
            _ => None,
        }
    }
}

/// Collects aggregate calls (outermost only) in evaluation order.
pub fn collect_aggregates<'e>(expr: &'e SqlExpr, out: &mut Vec<&'e Function>) -> Result<()> {
    match expr {
        SqlExpr::Function(function) if is_aggregate_call(function) => {
            for arg in function_args(function) {
                if let Some(inner) = arg {
                    let mut nested = Vec::new();
                    collect_aggregates(inner, &mut nested)?;
                    if !nested.is_empty() {
                        return Err(RatchetError::Execution(format!(
                            "Nested aggregate in {}",
                            function
                        )));
                    }
                }
            }
            out.push(function);
        }
        SqlExpr::Function(function) => {
            for arg in function_args(function).into_iter().flatten() {
                collect_aggregates(arg, out)?;
            }
        }
        SqlExpr::BinaryOp { left, right, .. } => {
            collect_aggregates(left, out)?;
            collect_aggregates(right, out)?;
        }
        SqlExpr::UnaryOp { expr, .. }
        | SqlExpr::Nested(expr)
        | SqlExpr::IsNull(expr)
        | SqlExpr::IsNotNull(expr)
        | SqlExpr::Cast { expr, .. }
        | SqlExpr::Extract { expr, .. } => collect_aggregates(expr, out)?,
        SqlExpr::Between {
            expr, low, high, ..
        } => {
            collect_aggregates(expr, out)?;
            collect_aggregates(low, out)?;
            collect_aggregates(high, out)?;
        }
        SqlExpr::InList { expr, list, .. } => {
            collect_aggregates(expr, out)?;
            for item in list {
                collect_aggregates(item, out)?;
            }
        }
        SqlExpr::InSubquery { expr, .. } => collect_aggregates(expr, out)?,
        SqlExpr::Like { expr, pattern, .. } | SqlExpr::ILike { expr, pattern, .. } => {
            collect_aggregates(expr, out)?;
            collect_aggregates(pattern, out)?;
        }
        SqlExpr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                collect_aggregates(operand, out)?;
            }
            for item in conditions.iter().chain(results.iter()) {
                collect_aggregates(item, out)?;
            }
            if let Some(otherwise) = else_result {
                collect_aggregates(otherwise, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Collects every column reference outside of subqueries.
pub fn collect_columns<'e>(expr: &'e SqlExpr, out: &mut Vec<&'e [Ident]>) {
    match expr {
        SqlExpr::Identifier(ident) => out.push(std::slice::from_ref(ident)),
        SqlExpr::CompoundIdentifier(idents) => out.push(idents),
        SqlExpr::Function(function) => {
            for arg in function_args(function).into_iter().flatten() {
                collect_columns(arg, out);
            }
        }
        SqlExpr::BinaryOp { left, right, .. } => {
            collect_columns(left, out);
            collect_columns(right, out);
        }
        SqlExpr::UnaryOp { expr, .. }
        | SqlExpr::Nested(expr)
        | SqlExpr::IsNull(expr)
        | SqlExpr::IsNotNull(expr)
        | SqlExpr::Cast { expr, .. }
        | SqlExpr::Extract { expr, .. }
        | SqlExpr::InSubquery { expr, .. } => collect_columns(expr, out),
        SqlExpr::Between {
            expr, low, high, ..
        } => {
            collect_columns(expr, out);
            collect_columns(low, out);
            collect_columns(high, out);
        }
        SqlExpr::InList { expr, list, .. } => {
            collect_columns(expr, out);
            for item in list {
                collect_columns(item, out);
            }
        }
        SqlExpr::Like { expr, pattern, .. } | SqlExpr::ILike { expr, pattern, .. } => {
            collect_columns(expr, out);
            collect_columns(pattern, out);
        }
        SqlExpr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                collect_columns(operand, out);
            }
            for item in conditions.iter().chain(results.iter()) {
                collect_columns(item, out);
            }
            if let Some(otherwise) = else_result {
                collect_columns(otherwise, out);
            }
        }
        _ => {}
    }
}

/// Positional argument expressions; `None` stands for `*`.
pub fn function_args(function: &Function) -> Vec<Option<&SqlExpr>> {
    function
        .args
        .iter()
        .map(|arg| match arg {
            FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
            | FunctionArg::Named {
                arg: FunctionArgExpr::Expr(e),
                ..
            } => Some(e),
            _ => None,
        })
        .collect()
}

/// Splits a predicate into its top-level AND terms.
pub fn split_conjuncts(expr: &SqlExpr, out: &mut Vec<SqlExpr>) {
    match expr {
        SqlExpr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            split_conjuncts(left, out);
            split_conjuncts(right, out);
        }
        SqlExpr::Nested(inner) if matches!(inner.as_ref(), SqlExpr::BinaryOp { op: BinaryOperator::And, .. }) => {
            split_conjuncts(inner, out)
        }
        other => out.push(other.clone()),
    }
}

/// Translates a SQL LIKE pattern into an anchored regular expression.
pub fn like_to_regex(pattern: &str, escape: Option<char>) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if Some(c) == escape {
            if let Some(next) = chars.next() {
                regex.push_str(&regex::escape(&next.to_string()));
            }
            continue;
        }
        match c {
            '%' => regex.push_str("(?s:.*)"),
            '_' => regex.push_str("(?s:.)"),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}

/// Constant-folds date literals and date ± interval arithmetic.
pub fn fold_date(expr: &SqlExpr) -> Option<NaiveDate> {
    match expr {
        SqlExpr::TypedString {
            data_type: SqlDataType::Date,
            value,
        } => NaiveDate::parse_from_str(value, "%Y-%m-%d").ok(),
        SqlExpr::Cast {
            expr,
            data_type: SqlDataType::Date,
            ..
        } => match expr.as_ref() {
            SqlExpr::Value(Value::SingleQuotedString(s)) => {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
            }
            _ => None,
        },
        SqlExpr::Nested(inner) => fold_date(inner),
        SqlExpr::BinaryOp { left, op, right } => {
            let sign = match op {
                BinaryOperator::Plus => 1,
                BinaryOperator::Minus => -1,
                _ => return None,
            };
            let base = fold_date(left)?;
            let (amount, unit) = match right.as_ref() {
                SqlExpr::Interval(interval) => interval_parts(interval)?,
                _ => return None,
            };
            shift_date(base, sign * amount, &unit)
        }
        _ => None,
    }
}

fn interval_parts(interval: &Interval) -> Option<(i64, DateTimeField)> {
    let raw = match interval.value.as_ref() {
        SqlExpr::Value(Value::SingleQuotedString(s)) => s.clone(),
        SqlExpr::Value(Value::Number(n, _)) => n.clone(),
        _ => return None,
    };
    let mut parts = raw.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = match (&interval.leading_field, parts.next()) {
        (Some(field), _) => field.clone(),
        (None, Some(word)) => match word.to_lowercase().trim_end_matches('s') {
            "year" => DateTimeField::Year,
            "month" => DateTimeField::Month,
            "day" => DateTimeField::Day,
            _ => return None,
        },
        (None, None) => DateTimeField::Day,
    };
    Some((amount, unit))
}

fn shift_date(base: NaiveDate, amount: i64, unit: &DateTimeField) -> Option<NaiveDate> {
    match unit {
        DateTimeField::Day => base.checked_add_signed(chrono::Duration::days(amount)),
        DateTimeField::Month | DateTimeField::Year => {
            let months = if matches!(unit, DateTimeField::Year) {
                amount * 12
            } else {
                amount
            };
            let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
            if months >= 0 {
                base.checked_add_months(magnitude)
            } else {
                base.checked_sub_months(magnitude)
            }
        }
        _ => None,
    }
}

pub fn date_literal(date: NaiveDate) -> Expr {
    let days = date.num_days_from_ce() - EPOCH_DAYS_FROM_CE;
    lit(days).cast(DataType::Date)
}

const EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn number_literal(text: &str) -> Result<Expr> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(lit(int));
    }
    text.parse::<f64>()
        .map(lit)
        .map_err(|_| RatchetError::Parse(format!("invalid number literal {}", text)))
}

fn value_literal(value: &Value) -> Result<Expr> {
    match value {
        Value::Number(n, _) => number_literal(n),
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(lit(s.clone())),
        Value::Boolean(b) => Ok(lit(*b)),
        Value::Null => Ok(lit(Null {})),
        other => Err(RatchetError::Unsupported(format!("literal {}", other))),
    }
}

pub fn map_sql_type(data_type: &SqlDataType) -> Result<DataType> {
    match data_type {
        SqlDataType::Date => Ok(DataType::Date),
        SqlDataType::Int(_)
        | SqlDataType::Integer(_)
        | SqlDataType::BigInt(_)
        | SqlDataType::SmallInt(_)
        | SqlDataType::TinyInt(_) => Ok(DataType::Int64),
        SqlDataType::Double
        | SqlDataType::DoublePrecision
        | SqlDataType::Float(_)
        | SqlDataType::Real
        | SqlDataType::Decimal(_)
        | SqlDataType::Numeric(_) => Ok(DataType::Float64),
        SqlDataType::Varchar(_) | SqlDataType::Char(_) | SqlDataType::Text => Ok(DataType::String),
        SqlDataType::Boolean => Ok(DataType::Boolean),
        other => Err(RatchetError::Unsupported(format!("CAST to {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;

    fn parse_expr(sql: &str) -> SqlExpr {
        let dialect = GenericDialect {};
        Parser::new(&dialect)
            .try_with_sql(sql)
            .unwrap()
            .parse_expr()
            .unwrap()
    }

    struct NoSubqueries;

    impl SubqueryEvaluator for NoSubqueries {
        fn evaluate(&self, _query: &Query) -> Result<DataFrame> {
            Err(RatchetError::Unsupported("subquery".to_string()))
        }
    }

    fn scope() -> Scope {
        Scope::new(vec![BindingSchema {
            name: "lineitem".to_string(),
            columns: vec![
                ("l_quantity".to_string(), DataType::Int64),
                ("l_shipdate".to_string(), DataType::Date),
                ("l_comment".to_string(), DataType::String),
            ],
        }])
    }

    #[test]
    fn test_like_to_regex() {
        assert_eq!(like_to_regex("PROMO%", None), "^PROMO(?s:.*)$");
        assert_eq!(like_to_regex("%BRASS", None), "^(?s:.*)BRASS$");
        assert_eq!(like_to_regex("a_c", None), "^a(?s:.)c$");
        assert_eq!(like_to_regex("50!%", Some('!')), "^50%$");
        assert_eq!(like_to_regex("1.5", None), "^1\\.5$");
    }

    #[test]
    fn test_fold_date_interval() {
        let expr = parse_expr("date '1998-12-01' - interval '90' day");
        assert_eq!(fold_date(&expr), NaiveDate::from_ymd_opt(1998, 9, 2));

        let expr = parse_expr("date '1994-01-01' + interval '1' year");
        assert_eq!(fold_date(&expr), NaiveDate::from_ymd_opt(1995, 1, 1));

        let expr = parse_expr("date '1995-01-31' + interval '1' month");
        assert_eq!(fold_date(&expr), NaiveDate::from_ymd_opt(1995, 2, 28));
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let scope = scope();
        let resolved = scope
            .resolve(&[Ident::new("LINEITEM"), Ident::new("L_QUANTITY")])
            .unwrap();
        assert_eq!(resolved.qualified, "lineitem.l_quantity");

        let err = scope.resolve(&[Ident::new("o_orderkey")]).unwrap_err();
        assert!(matches!(err, RatchetError::UnknownColumn(_)));
    }

    #[test]
    fn test_compile_filters_rows() {
        let scope = scope();
        let compiler = ExprCompiler::new(&scope, &NoSubqueries);
        let frame = df!(
            "lineitem.l_quantity" => [1i64, 20, 30],
            "lineitem.l_shipdate" => [
                NaiveDate::from_ymd_opt(1994, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(1995, 6, 1).unwrap(),
                NaiveDate::from_ymd_opt(1996, 1, 1).unwrap(),
            ],
            "lineitem.l_comment" => ["fast", "slow special", "special"]
        )
        .unwrap();

        let predicate = compiler
            .compile(&parse_expr(
                "L_SHIPDATE >= '1995-01-01' AND l_quantity BETWEEN 10 AND 25",
            ))
            .unwrap();
        let filtered = frame.clone().lazy().filter(predicate).collect().unwrap();
        assert_eq!(filtered.height(), 1);

        let predicate = compiler
            .compile(&parse_expr("l_comment LIKE '%special'"))
            .unwrap();
        let filtered = frame.lazy().filter(predicate).collect().unwrap();
        assert_eq!(filtered.height(), 2);
    }

    #[test]
    fn test_collect_aggregates_rejects_nesting() {
        let expr = parse_expr("sum(max(l_quantity))");
        let mut out = Vec::new();
        assert!(collect_aggregates(&expr, &mut out).is_err());

        let expr = parse_expr("100.0 * sum(a) / sum(b)");
        let mut out = Vec::new();
        collect_aggregates(&expr, &mut out).unwrap();
        assert_eq!(out.len(), 2);
    }
}
