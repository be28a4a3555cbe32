//! Table stores
//!
//! - `MemoryStore`: tables live in process memory for one invocation.
//! - `SqliteStore`: a SQLite catalog file records every table's source,
//!   schema signature and row count; data is kept as Parquet next to it in
//!   `<database>.tables/`, so later invocations see earlier loads.

use crate::error::{RatchetError, Result};
use chrono::Utc;
use polars::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// One column of a schema signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSignature {
    pub name: String,
    pub dtype: String,
}

/// Ordered column names and types of a frame.
pub fn signature_of(frame: &DataFrame) -> Vec<ColumnSignature> {
    frame
        .get_columns()
        .iter()
        .map(|s| ColumnSignature {
            name: s.name().to_string(),
            dtype: s.dtype().to_string(),
        })
        .collect()
}

/// Catalog record of a materialized table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub source: String,
    pub signature: Vec<ColumnSignature>,
    pub rows: usize,
    pub loaded_at: String,
}

/// Storage for the tables of an execution session.
pub trait TableStore: Send {
    fn entry(&self, name: &str) -> Result<Option<TableEntry>>;
    fn load(&self, name: &str) -> Result<DataFrame>;
    fn put(&mut self, name: &str, frame: DataFrame, source: &str) -> Result<TableEntry>;
    /// Returns whether a table was removed.
    fn remove(&mut self, name: &str) -> Result<bool>;
    fn names(&self) -> Result<Vec<String>>;
}

fn new_entry(name: &str, frame: &DataFrame, source: &str) -> TableEntry {
    TableEntry {
        name: name.to_string(),
        source: source.to_string(),
        signature: signature_of(frame),
        rows: frame.height(),
        loaded_at: Utc::now().to_rfc3339(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: HashMap<String, (TableEntry, DataFrame)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableStore for MemoryStore {
    fn entry(&self, name: &str) -> Result<Option<TableEntry>> {
        Ok(self.tables.get(name).map(|(entry, _)| entry.clone()))
    }

    fn load(&self, name: &str) -> Result<DataFrame> {
        self.tables
            .get(name)
            .map(|(_, frame)| frame.clone())
            .ok_or_else(|| RatchetError::UnknownTable(name.to_string()))
    }

    fn put(&mut self, name: &str, frame: DataFrame, source: &str) -> Result<TableEntry> {
        let entry = new_entry(name, &frame, source);
        self.tables.insert(name.to_string(), (entry.clone(), frame));
        Ok(entry)
    }

    fn remove(&mut self, name: &str) -> Result<bool> {
        Ok(self.tables.remove(name).is_some())
    }

    fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// SQLite catalog with Parquet table data.
pub struct SqliteStore {
    db: Mutex<Connection>,
    data_dir: PathBuf,
    frames: Mutex<HashMap<String, DataFrame>>,
}

impl SqliteStore {
    /// Open or create the catalog at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut data_dir = path.clone().into_os_string();
        data_dir.push(".tables");
        let data_dir = PathBuf::from(data_dir);
        std::fs::create_dir_all(&data_dir)?;

        let db = Connection::open(&path)?;
        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS tables (
                name TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                signature TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                loaded_at TEXT NOT NULL
            )
            "#,
            [],
        )?;
        info!("Opened table catalog at {}", path.display());

        Ok(Self {
            db: Mutex::new(db),
            data_dir,
            frames: Mutex::new(HashMap::new()),
        })
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.parquet", name))
    }

    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| RatchetError::Catalog("catalog connection lock poisoned".to_string()))
    }

    fn frames(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DataFrame>>> {
        self.frames
            .lock()
            .map_err(|_| RatchetError::Catalog("table cache lock poisoned".to_string()))
    }
}

impl TableStore for SqliteStore {
    fn entry(&self, name: &str) -> Result<Option<TableEntry>> {
        let db = self.db()?;
        let row = db
            .query_row(
                "SELECT name, source, signature, row_count, loaded_at FROM tables WHERE name = ?1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((name, source, signature, rows, loaded_at)) => Ok(Some(TableEntry {
                name,
                source,
                signature: serde_json::from_str(&signature)?,
                rows: rows.max(0) as usize,
                loaded_at,
            })),
            None => Ok(None),
        }
    }

    fn load(&self, name: &str) -> Result<DataFrame> {
        if let Some(frame) = self.frames()?.get(name) {
            return Ok(frame.clone());
        }
        if self.entry(name)?.is_none() {
            return Err(RatchetError::UnknownTable(name.to_string()));
        }
        let path = self.data_path(name);
        let file = File::open(&path).map_err(|e| {
            RatchetError::Catalog(format!("table data {} unreadable: {}", path.display(), e))
        })?;
        let frame = ParquetReader::new(file).finish()?;
        debug!("Loaded table {} ({} rows) from {}", name, frame.height(), path.display());
        self.frames()?.insert(name.to_string(), frame.clone());
        Ok(frame)
    }

    fn put(&mut self, name: &str, mut frame: DataFrame, source: &str) -> Result<TableEntry> {
        let entry = new_entry(name, &frame, source);
        let path = self.data_path(name);
        let tmp = self.data_dir.join(format!(".{}.parquet.tmp", name));
        {
            let mut file = File::create(&tmp)?;
            ParquetWriter::new(&mut file).finish(&mut frame)?;
        }
        std::fs::rename(&tmp, &path)?;

        self.db()?.execute(
            r#"
            INSERT OR REPLACE INTO tables (name, source, signature, row_count, loaded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                entry.name,
                entry.source,
                serde_json::to_string(&entry.signature)?,
                entry.rows as i64,
                entry.loaded_at,
            ],
        )?;
        self.frames()?.insert(name.to_string(), frame);
        Ok(entry)
    }

    fn remove(&mut self, name: &str) -> Result<bool> {
        let removed = self
            .db()?
            .execute("DELETE FROM tables WHERE name = ?1", params![name])?;
        self.frames()?.remove(name);
        let path = self.data_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(removed > 0)
    }

    fn names(&self) -> Result<Vec<String>> {
        let db = self.db()?;
        let mut stmt = db.prepare("SELECT name FROM tables ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }
}
