//! Dataset Materializer
//!
//! Loads benchmark tables from `<data_folder>/<table>.parquet` (or `.csv`)
//! into the session's table store. Tables already present are left alone
//! unless a refresh is forced, after checking that their stored schema still
//! matches the source file.

use crate::error::{RatchetError, Result};
use crate::session::catalog::ColumnSignature;
use crate::session::ExecutionSession;
use itertools::Itertools;
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// What one materialization pass did, table by table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializationReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<String>,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
    Parquet,
    Csv,
}

/// A located source file for one table.
#[derive(Debug, Clone)]
struct TableSource {
    path: PathBuf,
    format: SourceFormat,
}

impl TableSource {
    fn scan(&self) -> Result<LazyFrame> {
        let lf = match self.format {
            SourceFormat::Parquet => LazyFrame::scan_parquet(&self.path, Default::default())?,
            SourceFormat::Csv => LazyCsvReader::new(&self.path).finish()?,
        };
        Ok(lf)
    }

    fn signature(&self) -> Result<Vec<ColumnSignature>> {
        let schema = self.scan()?.schema()?;
        Ok(schema
            .iter()
            .map(|(name, dtype)| ColumnSignature {
                name: name.to_string(),
                dtype: dtype.to_string(),
            })
            .collect())
    }

    fn read(&self) -> Result<DataFrame> {
        Ok(self.scan()?.collect()?)
    }
}

pub struct DatasetMaterializer {
    data_folder: PathBuf,
}

impl DatasetMaterializer {
    pub fn new(data_folder: impl Into<PathBuf>) -> Self {
        Self {
            data_folder: data_folder.into(),
        }
    }

    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    /// Ensure every named table exists in the session.
    ///
    /// With `force_refresh` any existing table is dropped and reloaded.
    /// Otherwise an existing table is kept as long as its schema signature
    /// equals the source's; a differing signature is a `SchemaMismatch`.
    pub fn materialize(
        &self,
        session: &mut ExecutionSession,
        tables: &[&str],
        force_refresh: bool,
    ) -> Result<MaterializationReport> {
        let mut report = MaterializationReport::default();

        for table in tables {
            let name = table.to_lowercase();
            let source = self.locate(&name)?;

            if force_refresh && session.drop_table(&name)? {
                info!("Dropped table {} for refresh", name);
                report.dropped.push(name.clone());
            }

            if let Some(entry) = session.table_entry(&name)? {
                let expected = source.signature()?;
                if entry.signature != expected {
                    return Err(RatchetError::SchemaMismatch {
                        table: name,
                        detail: describe_mismatch(&entry.signature, &expected),
                    });
                }
                debug!("Table {} already materialized ({} rows)", name, entry.rows);
                report.skipped.push(name);
                continue;
            }

            let frame = source.read()?;
            let entry = session.create_table(&name, frame, &source.path.display().to_string())?;
            info!(
                "Materialized table {} from {} ({} rows)",
                name,
                source.path.display(),
                entry.rows
            );
            report.loaded.push(name);
        }

        Ok(report)
    }

    fn locate(&self, table: &str) -> Result<TableSource> {
        let parquet = self.data_folder.join(format!("{}.parquet", table));
        if parquet.is_file() {
            return Ok(TableSource {
                path: parquet,
                format: SourceFormat::Parquet,
            });
        }
        let csv = self.data_folder.join(format!("{}.csv", table));
        if csv.is_file() {
            return Ok(TableSource {
                path: csv,
                format: SourceFormat::Csv,
            });
        }
        Err(RatchetError::SourceNotFound {
            table: table.to_string(),
            path: parquet,
        })
    }
}

fn describe_mismatch(stored: &[ColumnSignature], source: &[ColumnSignature]) -> String {
    let render = |columns: &[ColumnSignature]| {
        columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.dtype))
            .join(", ")
    };
    format!("stored [{}] vs source [{}]", render(stored), render(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DatabaseLocation;
    use std::fs::File;
    use tempfile::TempDir;

    fn write_parquet(dir: &Path, name: &str, mut frame: DataFrame) {
        let file = File::create(dir.join(format!("{}.parquet", name))).unwrap();
        ParquetWriter::new(file).finish(&mut frame).unwrap();
    }

    fn session(tmp: &TempDir) -> ExecutionSession {
        let mut session = ExecutionSession::open(DatabaseLocation::InMemory).unwrap();
        session.configure(1, &tmp.path().join("spill")).unwrap();
        session
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        write_parquet(
            tmp.path(),
            "region",
            df!("r_regionkey" => &[0i64, 1, 2], "r_name" => &["AFRICA", "AMERICA", "ASIA"])
                .unwrap(),
        );
        let mut session = session(&tmp);
        let materializer = DatasetMaterializer::new(tmp.path());

        let first = materializer.materialize(&mut session, &["region"], false).unwrap();
        assert_eq!(first.loaded, vec!["region".to_string()]);

        let second = materializer.materialize(&mut session, &["region"], false).unwrap();
        assert!(second.loaded.is_empty());
        assert_eq!(second.skipped, vec!["region".to_string()]);
        assert_eq!(session.table_entry("region").unwrap().unwrap().rows, 3);
    }

    #[test]
    fn test_missing_source() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp);
        let materializer = DatasetMaterializer::new(tmp.path());
        match materializer.materialize(&mut session, &["nation"], false) {
            Err(RatchetError::SourceNotFound { table, .. }) => assert_eq!(table, "nation"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_csv_fallback() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("nation.csv"), "n_nationkey,n_name\n0,ALGERIA\n1,ARGENTINA\n")
            .unwrap();
        let mut session = session(&tmp);
        let report = DatasetMaterializer::new(tmp.path())
            .materialize(&mut session, &["nation"], false)
            .unwrap();
        assert_eq!(report.loaded, vec!["nation".to_string()]);
        assert_eq!(session.table_entry("nation").unwrap().unwrap().rows, 2);
    }

    #[test]
    fn test_schema_mismatch_and_refresh() {
        let tmp = TempDir::new().unwrap();
        let mut session = session(&tmp);
        session
            .create_table(
                "customer",
                df!("c_custkey" => &[1i64], "c_name" => &["stale"]).unwrap(),
                "old",
            )
            .unwrap();
        write_parquet(
            tmp.path(),
            "customer",
            df!(
                "c_custkey" => &[1i64, 2],
                "c_name" => &["a", "b"],
                "c_nationkey" => &[3i64, 4]
            )
            .unwrap(),
        );
        let materializer = DatasetMaterializer::new(tmp.path());

        assert!(matches!(
            materializer.materialize(&mut session, &["customer"], false),
            Err(RatchetError::SchemaMismatch { .. })
        ));

        let report = materializer.materialize(&mut session, &["customer"], true).unwrap();
        assert_eq!(report.dropped, vec!["customer".to_string()]);
        assert_eq!(report.loaded, vec!["customer".to_string()]);
        assert_eq!(session.table_entry("customer").unwrap().unwrap().rows, 2);
    }
}
