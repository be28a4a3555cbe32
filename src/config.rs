use crate::engine::DEFAULT_BATCH_ROWS;
use crate::error::{RatchetError, Result};
use crate::session::DatabaseLocation;
use crate::suspend::{ExecutionMode, SuspendWindow};
use clap::{Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;

/// Benchmark whose tables and queries are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Benchmark {
    Tpch,
    Tpcds,
}

impl Benchmark {
    pub fn tables(&self) -> &'static [&'static str] {
        match self {
            Benchmark::Tpch => &TPCH_TABLES,
            Benchmark::Tpcds => &TPCDS_TABLES,
        }
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Benchmark::Tpch => write!(f, "tpch"),
            Benchmark::Tpcds => write!(f, "tpcds"),
        }
    }
}

pub const TPCH_TABLES: [&str; 8] = [
    "customer", "lineitem", "nation", "orders", "part", "partsupp", "region", "supplier",
];

pub const TPCDS_TABLES: [&str; 25] = [
    "call_center",
    "catalog_page",
    "catalog_returns",
    "catalog_sales",
    "customer",
    "customer_address",
    "customer_demographics",
    "date_dim",
    "household_demographics",
    "income_band",
    "inventory",
    "item",
    "promotion",
    "reason",
    "ship_mode",
    "store",
    "store_returns",
    "store_sales",
    "time_dim",
    "warehouse",
    "web_page",
    "web_returns",
    "web_sales",
    "web_site",
    "dbgen_version",
];

#[derive(Parser, Debug, Clone)]
#[command(name = "ratchet")]
#[command(about = "TPC-H/TPC-DS benchmark driver with query suspend and resume")]
#[command(rename_all = "snake_case")]
pub struct Args {
    /// Query identifier, e.g. q1
    #[arg(long)]
    pub query: String,

    /// "memory" or a catalog file path
    #[arg(long)]
    pub database: String,

    /// Directory holding <table>.parquet (or .csv) source files
    #[arg(long)]
    pub data_folder: PathBuf,

    /// Drop and reload tables even if they exist
    #[arg(long)]
    pub update_table: bool,

    /// Spill/temp directory
    #[arg(long)]
    pub tmp_folder: PathBuf,

    /// Worker thread count
    #[arg(long, default_value_t = 1)]
    pub thread: usize,

    #[arg(long)]
    pub suspend_query: bool,

    /// Seconds after statement start at which to arrest execution
    #[arg(long)]
    pub suspend_start_time: Option<f64>,

    /// Seconds after statement start by which the checkpoint must be written
    #[arg(long)]
    pub suspend_end_time: Option<f64>,

    #[arg(long)]
    pub suspend_location: Option<PathBuf>,

    #[arg(long)]
    pub resume_query: bool,

    #[arg(long)]
    pub resume_location: Option<PathBuf>,

    /// One checkpoint descriptor per partition instead of a single file
    #[arg(long)]
    pub partition_suspend_resume: bool,

    #[arg(long, value_enum, default_value_t = Benchmark::Tpch)]
    pub benchmark: Benchmark,
}

/// Validated settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub query: String,
    pub database: DatabaseLocation,
    pub data_folder: PathBuf,
    pub update_table: bool,
    pub tmp_folder: PathBuf,
    pub threads: usize,
    pub benchmark: Benchmark,
    pub batch_rows: usize,
    pub mode: ExecutionMode,
}

impl RunConfig {
    /// Validate parsed arguments; `RATCHET_BATCH_ROWS` overrides the batch size.
    pub fn from_args(args: Args) -> Result<Self> {
        let batch_rows = match std::env::var("RATCHET_BATCH_ROWS") {
            Ok(raw) => raw.trim().parse::<usize>().ok().filter(|n| *n > 0).ok_or_else(|| {
                RatchetError::InvalidConfiguration(format!(
                    "RATCHET_BATCH_ROWS must be a positive integer, got {:?}",
                    raw
                ))
            })?,
            Err(_) => DEFAULT_BATCH_ROWS,
        };
        Self::with_batch_rows(args, batch_rows)
    }

    pub fn with_batch_rows(args: Args, batch_rows: usize) -> Result<Self> {
        if args.thread < 1 {
            return Err(RatchetError::InvalidConfiguration(
                "--thread must be at least 1".to_string(),
            ));
        }
        let mode = execution_mode(&args)?;
        Ok(Self {
            query: args.query.trim().to_lowercase(),
            database: DatabaseLocation::parse(&args.database),
            data_folder: args.data_folder,
            update_table: args.update_table,
            tmp_folder: args.tmp_folder,
            threads: args.thread,
            benchmark: args.benchmark,
            batch_rows,
            mode,
        })
    }
}

fn execution_mode(args: &Args) -> Result<ExecutionMode> {
    let partitioned = args.partition_suspend_resume;
    match (args.suspend_query, args.resume_query) {
        (true, true) => Err(RatchetError::InvalidConfiguration(
            "--suspend_query and --resume_query are mutually exclusive".to_string(),
        )),
        (true, false) => {
            let (start, end) = match (args.suspend_start_time, args.suspend_end_time) {
                (Some(start), Some(end)) => (start, end),
                _ => {
                    return Err(RatchetError::InvalidConfiguration(
                        "--suspend_query needs --suspend_start_time and --suspend_end_time"
                            .to_string(),
                    ))
                }
            };
            let window = SuspendWindow::new(start, end)?;
            let location = args.suspend_location.clone().ok_or_else(|| {
                RatchetError::InvalidConfiguration(
                    "--suspend_query needs --suspend_location".to_string(),
                )
            })?;
            Ok(ExecutionMode::Suspend {
                window,
                location,
                partitioned,
            })
        }
        (false, true) => {
            let location = args.resume_location.clone().ok_or_else(|| {
                RatchetError::InvalidConfiguration(
                    "--resume_query needs --resume_location".to_string(),
                )
            })?;
            Ok(ExecutionMode::Resume {
                location,
                partitioned,
            })
        }
        (false, false) => Ok(ExecutionMode::Plain),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "ratchet",
            "--query",
            "Q6",
            "--database",
            "memory",
            "--data_folder",
            "/data/sf1",
            "--tmp_folder",
            "/tmp/ratchet",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_plain_defaults() {
        let config = RunConfig::with_batch_rows(parse(&[]), 1024).unwrap();
        assert_eq!(config.query, "q6");
        assert_eq!(config.threads, 1);
        assert_eq!(config.database, DatabaseLocation::InMemory);
        assert_eq!(config.benchmark, Benchmark::Tpch);
        assert_eq!(config.mode, ExecutionMode::Plain);
    }

    #[test]
    fn test_suspend_mode() {
        let args = parse(&[
            "--suspend_query",
            "--suspend_start_time",
            "1.0",
            "--suspend_end_time",
            "1.5",
            "--suspend_location",
            "/tmp/ckpt",
            "--partition_suspend_resume",
            "--thread",
            "4",
        ]);
        let config = RunConfig::with_batch_rows(args, 1024).unwrap();
        assert_eq!(config.threads, 4);
        match config.mode {
            ExecutionMode::Suspend {
                window,
                location,
                partitioned,
            } => {
                assert_eq!(window, SuspendWindow::new(1.0, 1.5).unwrap());
                assert_eq!(location, PathBuf::from("/tmp/ckpt"));
                assert!(partitioned);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_invalid_combinations() {
        let both = parse(&["--suspend_query", "--resume_query", "--resume_location", "x"]);
        assert!(matches!(
            RunConfig::with_batch_rows(both, 1),
            Err(RatchetError::InvalidConfiguration(_))
        ));

        let no_location = parse(&["--resume_query"]);
        assert!(matches!(
            RunConfig::with_batch_rows(no_location, 1),
            Err(RatchetError::InvalidConfiguration(_))
        ));

        let backwards = parse(&[
            "--suspend_query",
            "--suspend_start_time",
            "2",
            "--suspend_end_time",
            "1",
            "--suspend_location",
            "x",
        ]);
        assert!(matches!(
            RunConfig::with_batch_rows(backwards, 1),
            Err(RatchetError::SuspendWindowInvalid { .. })
        ));

        let zero_threads = parse(&["--thread", "0"]);
        assert!(matches!(
            RunConfig::with_batch_rows(zero_threads, 1),
            Err(RatchetError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_benchmark_tables() {
        assert_eq!(Benchmark::Tpch.tables().len(), 8);
        assert_eq!(Benchmark::Tpcds.tables().len(), 25);
        assert!(Benchmark::Tpcds.tables().contains(&"store_sales"));
    }
}
