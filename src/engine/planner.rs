//! Query planning
//!
//! Binds the FROM clause, pushes single-relation predicates down, picks the
//! largest relation as the driving relation and joins the rest greedily along
//! equality predicates. Build sides, CTEs, derived tables and uncorrelated
//! subqueries are evaluated here, so a plan only carries data frames and
//! polars expressions.

use super::aggregate::{AggregateCall, AggregateSink};
use super::expr::{
    collect_aggregates, collect_columns, expr_text, qualified_name, split_conjuncts,
    AggregateSlot, BindingSchema, ExprCompiler, GroupKey, PostAggregate, Scope,
    SubqueryEvaluator,
};
use super::pipeline::{
    DrivingRelation, Finish, JoinStep, OrderKey, ProjectSink, QueryPlan, Sink,
};
use super::EngineOptions;
use crate::error::{RatchetError, Result};
use polars::prelude::*;
use sqlparser::ast::{
    BinaryOperator, Distinct, Expr as SqlExpr, Function, GroupByExpr, Ident, JoinConstraint,
    JoinOperator, OrderByExpr, Query, Select, SelectItem, SetExpr, TableFactor, Value,
};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Source of base tables and views for planning.
pub trait RelationProvider {
    /// Look up a relation by lowercase name.
    fn relation(&self, name: &str, options: &EngineOptions) -> Result<DataFrame>;
}

struct BoundRelation {
    schema: BindingSchema,
    frame: DataFrame,
}

enum OrderTarget {
    Output(usize),
    Expr(SqlExpr),
}

pub struct Planner<'a> {
    provider: &'a dyn RelationProvider,
    options: EngineOptions,
    ctes: HashMap<String, DataFrame>,
}

impl<'a> Planner<'a> {
    pub fn new(provider: &'a dyn RelationProvider, options: EngineOptions) -> Self {
        Self {
            provider,
            options,
            ctes: HashMap::new(),
        }
    }

    fn scoped(&self) -> Planner<'a> {
        Planner {
            provider: self.provider,
            options: self.options,
            ctes: self.ctes.clone(),
        }
    }

    /// Plan a query into an executable pipeline.
    pub fn plan(&self, query: &Query) -> Result<QueryPlan> {
        let mut scoped = self.scoped();
        if let Some(with) = &query.with {
            if with.recursive {
                return Err(RatchetError::Unsupported("WITH RECURSIVE".to_string()));
            }
            for cte in &with.cte_tables {
                let frame = scoped.evaluate(&cte.query)?;
                let frame = rename_columns(frame, &cte.alias.columns)?;
                scoped
                    .ctes
                    .insert(cte.alias.name.value.to_lowercase(), frame);
            }
        }

        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select.as_ref(),
            SetExpr::Query(inner) if query.order_by.is_empty() && query.limit.is_none() => {
                return scoped.plan(inner)
            }
            other => {
                return Err(RatchetError::Unsupported(format!("query body {}", other)))
            }
        };

        let limit = match &query.limit {
            Some(expr) => Some(literal_usize(expr, "LIMIT")?),
            None => None,
        };
        let offset = match &query.offset {
            Some(offset) => literal_usize(&offset.value, "OFFSET")?,
            None => 0,
        };
        scoped.plan_select(select, &query.order_by, limit, offset)
    }

    fn plan_select(
        &self,
        select: &Select,
        order_by: &[OrderByExpr],
        limit: Option<usize>,
        offset: usize,
    ) -> Result<QueryPlan> {
        let (relations, mut conjuncts) = self.bind_from(select)?;
        if let Some(selection) = &select.selection {
            split_conjuncts(selection, &mut conjuncts);
        }

        let scope = Scope::new(relations.iter().map(|r| r.schema.clone()).collect());
        let compiler = ExprCompiler::new(&scope, self);

        let mut local: Vec<Vec<Expr>> = vec![Vec::new(); relations.len()];
        let mut constant: Vec<Expr> = Vec::new();
        let mut pending: Vec<(BTreeSet<usize>, SqlExpr)> = Vec::new();
        for conjunct in conjuncts {
            let refs = referenced(&scope, &conjunct)?;
            match refs.len() {
                0 => constant.push(compiler.compile(&conjunct)?),
                1 => {
                    if let Some(&idx) = refs.iter().next() {
                        local[idx].push(compiler.compile(&conjunct)?);
                    }
                }
                _ => pending.push((refs, conjunct)),
            }
        }

        let driving = relations
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, r)| r.frame.height())
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        let mut joined: BTreeSet<usize> = BTreeSet::from([driving]);
        let mut joins = Vec::new();
        while joined.len() < relations.len() {
            let (candidate, keys, used) = next_join(&scope, &relations, &joined, &pending)?;
            let step = joins.len();

            let mut probe_keys = Vec::new();
            let mut probe_key_columns = Vec::new();
            let mut build_keys = Vec::new();
            let mut build_key_columns = Vec::new();
            for (j, (probe, build)) in keys.iter().enumerate() {
                let mut probe_expr = compiler.compile(probe)?;
                let mut build_expr = compiler.compile(build)?;
                if let Some(common) =
                    join_key_type(compiler.static_dtype(probe), compiler.static_dtype(build))
                {
                    probe_expr = probe_expr.cast(common.clone());
                    build_expr = build_expr.cast(common);
                }
                let probe_column = format!("__lk{}_{}", step, j);
                let build_column = format!("__rk{}_{}", step, j);
                probe_keys.push(probe_expr.alias(&probe_column));
                build_keys.push(build_expr.alias(&build_column));
                probe_key_columns.push(probe_column);
                build_key_columns.push(build_column);
            }

            let build_index = format!("__b{}", step);
            let mut build = relations[candidate].frame.clone().lazy();
            if let Some(filter) = conjunction(std::mem::take(&mut local[candidate])) {
                build = build.filter(filter);
            }
            let build = build
                .with_row_index(&build_index, None)
                .with_columns(build_keys)
                .collect()?;

            let mut remaining = Vec::new();
            for (idx, entry) in pending.into_iter().enumerate() {
                if !used.contains(&idx) {
                    remaining.push(entry);
                }
            }
            joined.insert(candidate);

            let mut residual = Vec::new();
            pending = Vec::new();
            for (refs, conjunct) in remaining {
                if refs.is_subset(&joined) {
                    residual.push(compiler.compile(&conjunct)?);
                } else {
                    pending.push((refs, conjunct));
                }
            }

            debug!(
                "Join step {}: {} ({} build rows, {} keys)",
                step,
                relations[candidate].schema.name,
                build.height(),
                keys.len()
            );
            joins.push(JoinStep {
                relation: relations[candidate].schema.name.clone(),
                build,
                probe_keys,
                probe_key_columns,
                build_key_columns,
                probe_index: format!("__p{}", step),
                build_index,
                filter: conjunction(residual),
            });
        }

        let mut driving_filters = std::mem::take(&mut local[driving]);
        driving_filters.extend(constant);
        let driving_relation = DrivingRelation {
            name: relations[driving].schema.name.clone(),
            frame: relations[driving].frame.clone(),
            filter: conjunction(driving_filters),
        };

        let (sink, finish) =
            self.plan_output(select, order_by, limit, offset, &scope, &compiler)?;

        debug!(
            "Planned query: driving {} ({} rows), {} join steps",
            driving_relation.name,
            driving_relation.frame.height(),
            joins.len()
        );
        Ok(QueryPlan {
            driving: driving_relation,
            joins,
            sink,
            finish,
            batch_rows: self.options.batch_rows,
        })
    }

    fn bind_from(&self, select: &Select) -> Result<(Vec<BoundRelation>, Vec<SqlExpr>)> {
        let mut relations = Vec::new();
        let mut conjuncts = Vec::new();
        for item in &select.from {
            relations.push(self.bind(&item.relation, relations.len())?);
            for join in &item.joins {
                relations.push(self.bind(&join.relation, relations.len())?);
                match &join.join_operator {
                    JoinOperator::Inner(JoinConstraint::On(on)) => {
                        split_conjuncts(on, &mut conjuncts)
                    }
                    JoinOperator::Inner(JoinConstraint::None) | JoinOperator::CrossJoin => {}
                    other => {
                        return Err(RatchetError::Unsupported(format!("join {:?}", other)))
                    }
                }
            }
        }

        if relations.is_empty() {
            let frame = df!("__dual" => [0i32])?;
            relations.push(BoundRelation {
                schema: BindingSchema {
                    name: "__dual".to_string(),
                    columns: Vec::new(),
                },
                frame,
            });
        }

        let mut seen = BTreeSet::new();
        for relation in &relations {
            if !seen.insert(relation.schema.name.clone()) {
                return Err(RatchetError::Execution(format!(
                    "Duplicate relation name {} in FROM",
                    relation.schema.name
                )));
            }
        }
        Ok((relations, conjuncts))
    }

    fn bind(&self, factor: &TableFactor, position: usize) -> Result<BoundRelation> {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                let table = name
                    .0
                    .last()
                    .map(|ident| ident.value.to_lowercase())
                    .ok_or_else(|| RatchetError::Parse("empty table name".to_string()))?;
                let frame = match self.ctes.get(&table) {
                    Some(frame) => frame.clone(),
                    None => self.provider.relation(&table, &self.options)?,
                };
                let (binding, columns) = match alias {
                    Some(alias) => (alias.name.value.to_lowercase(), alias.columns.as_slice()),
                    None => (table, &[][..]),
                };
                qualify(binding, frame, columns)
            }
            TableFactor::Derived {
                lateral,
                subquery,
                alias,
            } => {
                if *lateral {
                    return Err(RatchetError::Unsupported("LATERAL".to_string()));
                }
                let frame = self.evaluate(subquery)?;
                let (binding, columns) = match alias {
                    Some(alias) => (alias.name.value.to_lowercase(), alias.columns.as_slice()),
                    None => (format!("__subquery{}", position), &[][..]),
                };
                qualify(binding, frame, columns)
            }
            other => Err(RatchetError::Unsupported(format!("FROM item {}", other))),
        }
    }

    fn plan_output(
        &self,
        select: &Select,
        order_by: &[OrderByExpr],
        limit: Option<usize>,
        offset: usize,
        scope: &Scope,
        compiler: &ExprCompiler<'_>,
    ) -> Result<(Sink, Finish)> {
        let distinct = match &select.distinct {
            None => false,
            Some(Distinct::Distinct) => true,
            Some(Distinct::On(_)) => {
                return Err(RatchetError::Unsupported("DISTINCT ON".to_string()))
            }
        };

        let items = expand_projection(&select.projection, scope)?;
        let names = unique_names(items.iter().map(|(_, name)| name.clone()));

        let mut targets = Vec::new();
        for item in order_by {
            targets.push((order_target(&item.expr, &names)?, item.asc == Some(false)));
        }

        let group_exprs = match &select.group_by {
            GroupByExpr::Expressions(exprs) => exprs.clone(),
            GroupByExpr::All => return Err(RatchetError::Unsupported("GROUP BY ALL".to_string())),
        };

        let mut functions: Vec<&Function> = Vec::new();
        for (expr, _) in &items {
            collect_aggregates(expr, &mut functions)?;
        }
        if let Some(having) = &select.having {
            collect_aggregates(having, &mut functions)?;
        }
        for (target, _) in &targets {
            if let OrderTarget::Expr(expr) = target {
                collect_aggregates(expr, &mut functions)?;
            }
        }

        let aggregating =
            !group_exprs.is_empty() || !functions.is_empty() || select.having.is_some();

        let mut order = Vec::new();
        let mut hidden = Vec::new();
        for (i, (target, descending)) in targets.iter().enumerate() {
            match target {
                OrderTarget::Output(idx) => order.push(OrderKey {
                    column: names[*idx].clone(),
                    descending: *descending,
                }),
                OrderTarget::Expr(expr) => {
                    let column = format!("__o{}", i);
                    hidden.push((expr, column.clone()));
                    order.push(OrderKey {
                        column,
                        descending: *descending,
                    });
                }
            }
        }

        if !aggregating {
            let mut exprs = Vec::new();
            for ((expr, _), name) in items.iter().zip(&names) {
                exprs.push(compiler.compile(expr)?.alias(name));
            }
            for (expr, column) in &hidden {
                exprs.push(compiler.compile(expr)?.alias(column));
            }
            let early_stop = if order.is_empty() && !distinct {
                limit.map(|l| l + offset)
            } else {
                None
            };
            let finish = Finish {
                having: None,
                project: None,
                output_columns: names,
                distinct,
                order,
                offset,
                limit,
            };
            return Ok((Sink::Project(ProjectSink { exprs, early_stop }), finish));
        }

        let mut post = PostAggregate::default();
        let mut keys = Vec::new();
        for (i, expr) in group_exprs.iter().enumerate() {
            let expr = group_target(expr, &items, &names, scope)?;
            let column = format!("__k{}", i);
            keys.push(compiler.compile(&expr)?.alias(&column));
            let resolved = match &expr {
                SqlExpr::Identifier(ident) => {
                    Some(scope.resolve(std::slice::from_ref(ident))?.qualified)
                }
                SqlExpr::CompoundIdentifier(idents) => Some(scope.resolve(idents)?.qualified),
                _ => None,
            };
            post.keys.push(GroupKey {
                column,
                resolved,
                text: expr_text(&expr),
            });
        }

        let mut calls: Vec<AggregateCall> = Vec::new();
        for function in functions {
            let text = function.to_string().to_lowercase();
            if calls.iter().any(|c| c.text == text) {
                continue;
            }
            let call = AggregateCall::plan(function, calls.len(), compiler)?;
            post.aggregates.push(AggregateSlot {
                column: call.output_column(),
                text: call.text.clone(),
            });
            calls.push(call);
        }

        let post_compiler = ExprCompiler::post_aggregate(scope, self, &post);
        let mut project = Vec::new();
        for ((expr, _), name) in items.iter().zip(&names) {
            project.push(post_compiler.compile(expr)?.alias(name));
        }
        for (expr, column) in &hidden {
            project.push(post_compiler.compile(expr)?.alias(column));
        }
        let having = match &select.having {
            Some(having) => Some(post_compiler.compile(having)?),
            None => None,
        };

        let key_columns = post.keys.iter().map(|k| k.column.clone()).collect();
        let sink = Sink::Aggregate(AggregateSink {
            keys,
            key_columns,
            calls,
        });
        let finish = Finish {
            having,
            project: Some(project),
            output_columns: names,
            distinct,
            order,
            offset,
            limit,
        };
        Ok((sink, finish))
    }
}

impl SubqueryEvaluator for Planner<'_> {
    fn evaluate(&self, query: &Query) -> Result<DataFrame> {
        self.plan(query)?.run_sequential(self.options.partitions)
    }
}

fn next_join(
    scope: &Scope,
    relations: &[BoundRelation],
    joined: &BTreeSet<usize>,
    pending: &[(BTreeSet<usize>, SqlExpr)],
) -> Result<(usize, Vec<(SqlExpr, SqlExpr)>, BTreeSet<usize>)> {
    for candidate in 0..relations.len() {
        if joined.contains(&candidate) {
            continue;
        }
        let mut keys = Vec::new();
        let mut used = BTreeSet::new();
        for (idx, (_, conjunct)) in pending.iter().enumerate() {
            if let Some(pair) = equi_join_key(scope, conjunct, joined, candidate)? {
                keys.push(pair);
                used.insert(idx);
            }
        }
        if !keys.is_empty() {
            return Ok((candidate, keys, used));
        }
    }

    let unjoined: Vec<&str> = (0..relations.len())
        .filter(|idx| !joined.contains(idx))
        .map(|idx| relations[idx].schema.name.as_str())
        .collect();
    Err(RatchetError::Unsupported(format!(
        "cross join with {} (no equality predicate connects it)",
        unjoined.join(", ")
    )))
}

/// Split `probe = build` where probe only touches joined relations.
fn equi_join_key(
    scope: &Scope,
    conjunct: &SqlExpr,
    joined: &BTreeSet<usize>,
    candidate: usize,
) -> Result<Option<(SqlExpr, SqlExpr)>> {
    let (left, right) = match conjunct {
        SqlExpr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => (left.as_ref(), right.as_ref()),
        _ => return Ok(None),
    };
    let left_refs = referenced(scope, left)?;
    let right_refs = referenced(scope, right)?;
    let only_candidate = |refs: &BTreeSet<usize>| refs.len() == 1 && refs.contains(&candidate);
    let probe_side = |refs: &BTreeSet<usize>| !refs.is_empty() && refs.is_subset(joined);

    if probe_side(&left_refs) && only_candidate(&right_refs) {
        Ok(Some((left.clone(), right.clone())))
    } else if probe_side(&right_refs) && only_candidate(&left_refs) {
        Ok(Some((right.clone(), left.clone())))
    } else {
        Ok(None)
    }
}

fn referenced(scope: &Scope, expr: &SqlExpr) -> Result<BTreeSet<usize>> {
    let mut columns = Vec::new();
    collect_columns(expr, &mut columns);
    columns
        .into_iter()
        .map(|idents| scope.resolve(idents).map(|c| c.binding))
        .collect()
}

fn join_key_type(probe: Option<DataType>, build: Option<DataType>) -> Option<DataType> {
    let (probe, build) = (probe?, build?);
    if probe == build {
        return None;
    }
    if probe.is_integer() && build.is_integer() {
        Some(DataType::Int64)
    } else if probe.is_numeric() && build.is_numeric() {
        Some(DataType::Float64)
    } else {
        Some(DataType::String)
    }
}

fn conjunction(exprs: Vec<Expr>) -> Option<Expr> {
    exprs.into_iter().reduce(|acc, e| acc.and(e))
}

fn literal_usize(expr: &SqlExpr, clause: &str) -> Result<usize> {
    match expr {
        SqlExpr::Value(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| RatchetError::Parse(format!("invalid {} {}", clause, n))),
        other => Err(RatchetError::Unsupported(format!("{} {}", clause, other))),
    }
}

fn qualify(binding: String, frame: DataFrame, renames: &[Ident]) -> Result<BoundRelation> {
    let mut columns = Vec::new();
    let mut exprs = Vec::new();
    for (i, series) in frame.get_columns().iter().enumerate() {
        let name = renames
            .get(i)
            .map(|ident| ident.value.clone())
            .unwrap_or_else(|| series.name().to_string());
        exprs.push(col(series.name()).alias(&qualified_name(&binding, &name)));
        columns.push((name, series.dtype().clone()));
    }
    let frame = frame.lazy().select(exprs).collect()?;
    Ok(BoundRelation {
        schema: BindingSchema {
            name: binding,
            columns,
        },
        frame,
    })
}

fn rename_columns(frame: DataFrame, renames: &[Ident]) -> Result<DataFrame> {
    if renames.is_empty() {
        return Ok(frame);
    }
    let exprs: Vec<Expr> = frame
        .get_columns()
        .iter()
        .enumerate()
        .map(|(i, series)| match renames.get(i) {
            Some(ident) => col(series.name()).alias(&ident.value),
            None => col(series.name()),
        })
        .collect();
    Ok(frame.lazy().select(exprs).collect()?)
}

fn expand_projection(projection: &[SelectItem], scope: &Scope) -> Result<Vec<(SqlExpr, String)>> {
    let mut items = Vec::new();
    for item in projection {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                let name = match expr {
                    SqlExpr::Identifier(ident) => {
                        scope.resolve(std::slice::from_ref(ident))?.name
                    }
                    SqlExpr::CompoundIdentifier(idents) => scope.resolve(idents)?.name,
                    other => other.to_string(),
                };
                items.push((expr.clone(), name));
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                items.push((expr.clone(), alias.value.clone()))
            }
            SelectItem::Wildcard(_) => {
                for binding in &scope.bindings {
                    push_binding_columns(binding, &mut items);
                }
            }
            SelectItem::QualifiedWildcard(name, _) => {
                let target = name
                    .0
                    .last()
                    .map(|ident| ident.value.to_lowercase())
                    .unwrap_or_default();
                let binding = scope
                    .bindings
                    .iter()
                    .find(|b| b.name == target)
                    .ok_or_else(|| RatchetError::UnknownTable(target.clone()))?;
                push_binding_columns(binding, &mut items);
            }
        }
    }
    Ok(items)
}

fn push_binding_columns(binding: &BindingSchema, items: &mut Vec<(SqlExpr, String)>) {
    for (column, _) in &binding.columns {
        let expr = SqlExpr::CompoundIdentifier(vec![
            Ident::new(binding.name.clone()),
            Ident::new(column.clone()),
        ]);
        items.push((expr, column.clone()));
    }
}

/// Output names made unique by suffixing repeats with `_1`, `_2`, ...
fn unique_names(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for name in names {
        let mut candidate = name.clone();
        let mut n = 1;
        while out.contains(&candidate) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        out.push(candidate);
    }
    out
}

fn output_position(names: &[String], ident: &Ident) -> Option<usize> {
    names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(&ident.value))
}

fn ordinal(expr: &SqlExpr, len: usize, clause: &str) -> Result<Option<usize>> {
    match expr {
        SqlExpr::Value(Value::Number(n, _)) => {
            let position: usize = n
                .parse()
                .map_err(|_| RatchetError::Parse(format!("invalid {} position {}", clause, n)))?;
            if position == 0 || position > len {
                return Err(RatchetError::Execution(format!(
                    "{} position {} is not in the select list",
                    clause, position
                )));
            }
            Ok(Some(position - 1))
        }
        _ => Ok(None),
    }
}

fn order_target(expr: &SqlExpr, names: &[String]) -> Result<OrderTarget> {
    if let Some(idx) = ordinal(expr, names.len(), "ORDER BY")? {
        return Ok(OrderTarget::Output(idx));
    }
    if let SqlExpr::Identifier(ident) = expr {
        if let Some(idx) = output_position(names, ident) {
            return Ok(OrderTarget::Output(idx));
        }
    }
    Ok(OrderTarget::Expr(expr.clone()))
}

fn group_target(
    expr: &SqlExpr,
    items: &[(SqlExpr, String)],
    names: &[String],
    scope: &Scope,
) -> Result<SqlExpr> {
    if let Some(idx) = ordinal(expr, items.len(), "GROUP BY")? {
        return Ok(items[idx].0.clone());
    }
    if let SqlExpr::Identifier(ident) = expr {
        if scope.resolve(std::slice::from_ref(ident)).is_err() {
            if let Some(idx) = output_position(names, ident) {
                return Ok(items[idx].0.clone());
            }
        }
    }
    Ok(expr.clone())
}
