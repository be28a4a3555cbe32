//! Query Registry
//!
//! Maps a benchmark's query identifiers to ordered statement lists. The last
//! statement of a definition produces the result; earlier ones are setup
//! (view creation and the like) and always run to completion.

pub mod tpcds;
pub mod tpch;

use crate::config::Benchmark;
use crate::error::{RatchetError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use strsim::jaro_winkler;

lazy_static! {
    static ref QUERY_ID: Regex = Regex::new(r"^q\d+$").unwrap();
}

/// Similarity above which an unknown identifier gets a suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefinition {
    pub id: String,
    pub statements: Vec<String>,
}

impl QueryDefinition {
    /// The statement whose output is the query's result.
    pub fn result_statement(&self) -> &str {
        self.statements.last().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    queries: BTreeMap<String, QueryDefinition>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_benchmark(benchmark: Benchmark) -> Result<Self> {
        let table = match benchmark {
            Benchmark::Tpch => tpch::QUERIES,
            Benchmark::Tpcds => tpcds::QUERIES,
        };
        let mut registry = Self::new();
        for (id, statements) in table {
            registry.register(id, statements)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, id: &str, statements: &[&str]) -> Result<()> {
        let id = id.trim().to_lowercase();
        if !QUERY_ID.is_match(&id) {
            return Err(RatchetError::InvalidConfiguration(format!(
                "query identifier {:?} must look like q<number>",
                id
            )));
        }
        let statements: Vec<String> = statements
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if statements.is_empty() {
            return Err(RatchetError::InvalidConfiguration(format!(
                "query {} has no statements",
                id
            )));
        }
        if self.queries.contains_key(&id) {
            return Err(RatchetError::InvalidConfiguration(format!(
                "query {} registered twice",
                id
            )));
        }
        self.queries
            .insert(id.clone(), QueryDefinition { id, statements });
        Ok(())
    }

    /// Look up a definition, case-insensitively.
    pub fn resolve(&self, id: &str) -> Result<&QueryDefinition> {
        let key = id.trim().to_lowercase();
        if let Some(definition) = self.queries.get(&key) {
            return Ok(definition);
        }
        let suggestion = self
            .queries
            .keys()
            .map(|known| (known, jaro_winkler(&key, known)))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(known, _)| known.clone());
        Err(RatchetError::UnknownQuery(match suggestion {
            Some(known) => format!("{} (did you mean {}?)", id, known),
            None => id.to_string(),
        }))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.queries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parse_statements;
    use sqlparser::ast::Statement;

    #[test]
    fn test_resolve_case_insensitive() {
        let registry = QueryRegistry::for_benchmark(Benchmark::Tpch).unwrap();
        let q5 = registry.resolve("Q5").unwrap();
        assert_eq!(q5.id, "q5");
        assert_eq!(q5.statements.len(), 1);
        assert!(q5.result_statement().contains("R_NAME = 'ASIA'"));
    }

    #[test]
    fn test_unknown_query() {
        let registry = QueryRegistry::for_benchmark(Benchmark::Tpch).unwrap();
        match registry.resolve("q99") {
            Err(RatchetError::UnknownQuery(message)) => assert!(message.starts_with("q99")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            registry.resolve("nonsense"),
            Err(RatchetError::UnknownQuery(_))
        ));
    }

    #[test]
    fn test_register_rejects_bad_definitions() {
        let mut registry = QueryRegistry::new();
        assert!(registry.register("query1", &["SELECT 1"]).is_err());
        assert!(registry.register("q1", &["  "]).is_err());
        registry.register("q1", &["SELECT 1"]).unwrap();
        assert!(registry.register("Q1", &["SELECT 2"]).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_every_statement_parses() {
        for benchmark in [Benchmark::Tpch, Benchmark::Tpcds] {
            let registry = QueryRegistry::for_benchmark(benchmark).unwrap();
            assert!(!registry.is_empty());
            for id in registry.ids() {
                let definition = registry.resolve(id).unwrap();
                for sql in &definition.statements {
                    let parsed = parse_statements(sql)
                        .unwrap_or_else(|e| panic!("{} {} failed to parse: {}", benchmark, id, e));
                    assert_eq!(parsed.len(), 1, "{} {}", benchmark, id);
                }
                let last = parse_statements(definition.result_statement()).unwrap();
                assert!(
                    matches!(last[0], Statement::Query(_)),
                    "{} {} must end with a query",
                    benchmark,
                    id
                );
            }
        }
    }

    #[test]
    fn test_q15_sets_up_view() {
        let registry = QueryRegistry::for_benchmark(Benchmark::Tpch).unwrap();
        let q15 = registry.resolve("q15").unwrap();
        assert_eq!(q15.statements.len(), 2);
        assert!(q15.statements[0].starts_with("CREATE OR REPLACE VIEW revenue0"));
    }
}
