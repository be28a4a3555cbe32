use chrono::Utc;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ratchet_bench::config::Benchmark;
use ratchet_bench::engine::{parse_statements, EngineOptions};
use ratchet_bench::materializer::DatasetMaterializer;
use ratchet_bench::queries::QueryRegistry;
use ratchet_bench::session::{DatabaseLocation, ExecutionSession};
use ratchet_bench::suspend::checkpoint::{
    statement_fingerprint, CheckpointHeader, CheckpointStore, FORMAT_VERSION,
};
use ratchet_bench::suspend::{ExecutionMode, ExecutionOutcome, SuspendResumeController, SuspendWindow};
use ratchet_bench::RatchetError;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use uuid::Uuid;

const TABLES: [&str; 4] = ["customer", "orders", "lineitem", "supplier"];
const THREADS: usize = 4;
const BATCH_ROWS: usize = 64;

/// Days since the epoch for 1992-01-01 and 1998-12-31.
const FIRST_DAY: i32 = 8035;
const LAST_DAY: i32 = 10591;

fn write_parquet(dir: &Path, name: &str, mut frame: DataFrame) {
    let file = File::create(dir.join(format!("{}.parquet", name))).unwrap();
    ParquetWriter::new(file).finish(&mut frame).unwrap();
}

fn dates(name: &str, days: Vec<i32>) -> Series {
    Series::new(name, days).cast(&DataType::Date).unwrap()
}

fn customer_frame(rows: i64) -> DataFrame {
    let segments = ["BUILDING", "AUTOMOBILE", "MACHINERY"];
    df!(
        "c_custkey" => (1..=rows).collect::<Vec<_>>(),
        "c_name" => (1..=rows).map(|k| format!("Customer#{:09}", k)).collect::<Vec<_>>(),
        "c_mktsegment" => (1..=rows).map(|k| segments[(k % 3) as usize]).collect::<Vec<_>>(),
        "c_nationkey" => (1..=rows).map(|k| k % 5).collect::<Vec<_>>()
    )
    .unwrap()
}

/// A small TPC-H shaped dataset: enough rows for dozens of batches.
fn write_dataset(dir: &Path) {
    let mut rng = StdRng::seed_from_u64(7);

    write_parquet(dir, "customer", customer_frame(60));

    let orders = 500i64;
    let orderdates: Vec<i32> = (0..orders).map(|_| rng.gen_range(FIRST_DAY..=LAST_DAY)).collect();
    let orders_frame = DataFrame::new(vec![
        Series::new("o_orderkey", (1..=orders).collect::<Vec<_>>()),
        Series::new(
            "o_custkey",
            (0..orders).map(|_| rng.gen_range(1..=60i64)).collect::<Vec<_>>(),
        ),
        dates("o_orderdate", orderdates),
        Series::new("o_shippriority", vec![0i64; orders as usize]),
    ])
    .unwrap();
    write_parquet(dir, "orders", orders_frame);

    let lines = 4000usize;
    let mut orderkey = Vec::with_capacity(lines);
    let mut suppkey = Vec::with_capacity(lines);
    let mut quantity = Vec::with_capacity(lines);
    let mut price = Vec::with_capacity(lines);
    let mut discount = Vec::with_capacity(lines);
    let mut tax = Vec::with_capacity(lines);
    let mut shipdate = Vec::with_capacity(lines);
    let mut returnflag = Vec::with_capacity(lines);
    let mut linestatus = Vec::with_capacity(lines);
    for _ in 0..lines {
        orderkey.push(rng.gen_range(1..=orders));
        suppkey.push(rng.gen_range(1..=20i64));
        let qty = rng.gen_range(1..=50) as f64;
        quantity.push(qty);
        price.push(qty * rng.gen_range(900..=2000) as f64 / 100.0);
        discount.push(rng.gen_range(0..=10) as f64 / 100.0);
        tax.push(rng.gen_range(0..=8) as f64 / 100.0);
        shipdate.push(rng.gen_range(FIRST_DAY..=LAST_DAY));
        returnflag.push(["A", "N", "R"][rng.gen_range(0..3)]);
        linestatus.push(["F", "O"][rng.gen_range(0..2)]);
    }
    let lineitem = DataFrame::new(vec![
        Series::new("l_orderkey", orderkey),
        Series::new("l_suppkey", suppkey),
        Series::new("l_quantity", quantity),
        Series::new("l_extendedprice", price),
        Series::new("l_discount", discount),
        Series::new("l_tax", tax),
        dates("l_shipdate", shipdate),
        Series::new("l_returnflag", returnflag),
        Series::new("l_linestatus", linestatus),
    ])
    .unwrap();
    write_parquet(dir, "lineitem", lineitem);

    let suppliers = 20i64;
    let supplier = df!(
        "s_suppkey" => (1..=suppliers).collect::<Vec<_>>(),
        "s_name" => (1..=suppliers).map(|k| format!("Supplier#{:09}", k)).collect::<Vec<_>>(),
        "s_address" => (1..=suppliers).map(|k| format!("{} Main St", k)).collect::<Vec<_>>(),
        "s_phone" => (1..=suppliers).map(|k| format!("10-555-{:04}", k)).collect::<Vec<_>>()
    )
    .unwrap();
    write_parquet(dir, "supplier", supplier);
}

struct Fixture {
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("data")).unwrap();
        write_dataset(&tmp.path().join("data"));
        Self { tmp }
    }

    fn data(&self) -> PathBuf {
        self.tmp.path().join("data")
    }

    fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    fn session(&self) -> ExecutionSession {
        self.session_with(BATCH_ROWS)
    }

    fn session_with(&self, batch_rows: usize) -> ExecutionSession {
        let mut session = ExecutionSession::open(DatabaseLocation::InMemory).unwrap();
        session.set_batch_rows(batch_rows).unwrap();
        session.configure(THREADS, &self.path("spill")).unwrap();
        DatasetMaterializer::new(self.data())
            .materialize(&mut session, &TABLES, false)
            .unwrap();
        session
    }
}

fn tpch(id: &str) -> Vec<String> {
    QueryRegistry::for_benchmark(Benchmark::Tpch)
        .unwrap()
        .resolve(id)
        .unwrap()
        .statements
        .clone()
}

async fn execute(
    session: &mut ExecutionSession,
    statements: &[String],
    mode: ExecutionMode,
) -> ratchet_bench::Result<ExecutionOutcome> {
    SuspendResumeController::new(session)
        .execute(statements, &mode)
        .await
}

async fn plain(fixture: &Fixture, statements: &[String]) -> DataFrame {
    plain_with(fixture, statements, BATCH_ROWS).await
}

async fn plain_with(fixture: &Fixture, statements: &[String], batch_rows: usize) -> DataFrame {
    let mut session = fixture.session_with(batch_rows);
    match execute(&mut session, statements, ExecutionMode::Plain).await.unwrap() {
        ExecutionOutcome::Completed(frame) => frame,
        other => panic!("plain run did not complete: {:?}", other),
    }
}

fn assert_same(expected: &DataFrame, actual: &DataFrame) {
    assert!(
        expected.equals_missing(actual),
        "results differ\nexpected: {:?}\nactual: {:?}",
        expected,
        actual
    );
}

/// Suspend in `window`, then resume in a fresh session; returns the final rows.
async fn suspend_then_resume(
    fixture: &Fixture,
    statements: &[String],
    window: SuspendWindow,
    location: PathBuf,
    partitioned: bool,
) -> DataFrame {
    let mut session = fixture.session();
    let suspended = execute(
        &mut session,
        statements,
        ExecutionMode::Suspend {
            window,
            location: location.clone(),
            partitioned,
        },
    )
    .await
    .unwrap();
    match suspended {
        ExecutionOutcome::Completed(frame) => {
            assert!(!location.exists());
            frame
        }
        ExecutionOutcome::Paused(report) => {
            assert!(location.exists());
            assert!(report.partitions > 0);
            let mut resumed = fixture.session();
            match execute(
                &mut resumed,
                statements,
                ExecutionMode::Resume {
                    location,
                    partitioned,
                },
            )
            .await
            .unwrap()
            {
                ExecutionOutcome::Completed(frame) => frame,
                other => panic!("resume did not complete: {:?}", other),
            }
        }
    }
}

/// Write a checkpoint by hand after stepping some partitions a few batches.
fn manual_checkpoint(
    fixture: &Fixture,
    statements: &[String],
    steps: &[usize],
    store: &CheckpointStore,
) {
    let mut session = fixture.session();
    let (sql, setup) = statements.split_last().unwrap();
    let mut prelude = Vec::new();
    for text in setup {
        session.execute_sql(text).unwrap();
        prelude.extend(parse_statements(text).unwrap());
    }
    let options = EngineOptions {
        partitions: THREADS,
        batch_rows: BATCH_ROWS,
    };
    let prepared = session.prepare(sql, options).unwrap();
    let plan = prepared.plan;
    let mut states = plan.initial_states(THREADS);
    for (state, count) in states.iter_mut().zip(steps) {
        for _ in 0..*count {
            if !state.finished {
                plan.step(state).unwrap();
            }
        }
    }
    let header = CheckpointHeader {
        format_version: FORMAT_VERSION,
        checkpoint_id: Uuid::new_v4(),
        created_at: Utc::now(),
        fingerprint: statement_fingerprint(&prelude, &prepared.statement),
        driving_relation: plan.driving.name.clone(),
        driving_rows: plan.driving_rows(),
        batch_rows: plan.batch_rows,
        partition_count: states.len(),
        forced: false,
        partitions: Vec::new(),
    };
    store.write(header, &states).unwrap();
}

async fn resume(fixture: &Fixture, statements: &[String], location: PathBuf, partitioned: bool) -> ratchet_bench::Result<ExecutionOutcome> {
    let mut session = fixture.session();
    execute(
        &mut session,
        statements,
        ExecutionMode::Resume {
            location,
            partitioned,
        },
    )
    .await
}

fn completed(outcome: ExecutionOutcome) -> DataFrame {
    match outcome {
        ExecutionOutcome::Completed(frame) => frame,
        other => panic!("expected a result, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspend_resume_matches_plain() {
    let fixture = Fixture::new();
    let window = SuspendWindow::new(0.0, 30.0).unwrap();
    for id in ["q1", "q3", "q6", "q15"] {
        let statements = tpch(id);
        let expected = plain(&fixture, &statements).await;
        let actual = suspend_then_resume(
            &fixture,
            &statements,
            window,
            fixture.path(&format!("{}.ckpt", id)),
            false,
        )
        .await;
        assert_same(&expected, &actual);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mid_window_suspend_pauses_and_resumes() {
    let fixture = Fixture::new();
    let statements = tpch("q3");

    // One row per batch spreads the statement over thousands of safe points.
    let started = Instant::now();
    let expected = plain_with(&fixture, &statements, 1).await;
    let natural = started.elapsed().as_secs_f64();
    let window = SuspendWindow::new(natural * 0.3, natural * 0.6).unwrap();

    for (location, partitioned) in [(fixture.path("mid.ckpt"), false), (fixture.path("mid"), true)] {
        let mut session = fixture.session_with(1);
        let outcome = execute(
            &mut session,
            &statements,
            ExecutionMode::Suspend {
                window,
                location: location.clone(),
                partitioned,
            },
        )
        .await
        .unwrap();
        match outcome {
            ExecutionOutcome::Paused(report) => {
                assert_eq!(report.partitions, THREADS);
                assert!(report.arrested_partitions > 0);
                assert!(location.exists());
            }
            other => panic!("expected a pause inside the window, got {:?}", other),
        }

        let actual = completed(resume(&fixture, &statements, location, partitioned).await.unwrap());
        assert_same(&expected, &actual);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forced_checkpoint_resumes_to_same_rows() {
    let fixture = Fixture::new();
    let statements = vec![
        "SELECT l_orderkey, l_quantity, l_shipdate FROM lineitem \
         WHERE l_quantity > 45 ORDER BY l_orderkey, l_shipdate"
            .to_string(),
    ];
    let expected = plain(&fixture, &statements).await;
    let window = SuspendWindow::new(0.0, 0.0).unwrap();
    let actual =
        suspend_then_resume(&fixture, &statements, window, fixture.path("forced"), true).await;
    assert_same(&expected, &actual);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partitioned_and_single_layouts_agree() {
    let fixture = Fixture::new();
    let sql = tpch("q3").pop().unwrap();
    let statements = vec![sql.clone()];
    let expected = plain(&fixture, &statements).await;

    let single = CheckpointStore::new(fixture.path("single.ckpt"), false);
    let partitioned = CheckpointStore::new(fixture.path("parts"), true);
    manual_checkpoint(&fixture, &statements, &[3, 0, 7, 100], &single);
    manual_checkpoint(&fixture, &statements, &[3, 0, 7, 100], &partitioned);
    assert!(partitioned.descriptor_path(3).is_file());

    let from_single = completed(
        resume(&fixture, &statements, fixture.path("single.ckpt"), false)
            .await
            .unwrap(),
    );
    let from_parts = completed(
        resume(&fixture, &statements, fixture.path("parts"), true)
            .await
            .unwrap(),
    );
    assert_same(&expected, &from_single);
    assert_same(&from_single, &from_parts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_window_completes_without_checkpoint() {
    let fixture = Fixture::new();
    let statements = tpch("q6");
    let expected = plain(&fixture, &statements).await;

    let location = fixture.path("late.ckpt");
    let mut session = fixture.session();
    let outcome = execute(
        &mut session,
        &statements,
        ExecutionMode::Suspend {
            window: SuspendWindow::new(3600.0, 3600.0).unwrap(),
            location: location.clone(),
            partitioned: false,
        },
    )
    .await
    .unwrap();
    assert_same(&expected, &completed(outcome));
    assert!(!location.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_without_artifacts_is_corrupt() {
    let fixture = Fixture::new();
    let statements = tpch("q6");
    std::fs::create_dir_all(fixture.path("empty")).unwrap();

    assert!(matches!(
        resume(&fixture, &statements, fixture.path("empty"), true).await,
        Err(RatchetError::CheckpointCorrupt { .. })
    ));
    assert!(matches!(
        resume(&fixture, &statements, fixture.path("nothing.ckpt"), false).await,
        Err(RatchetError::CheckpointCorrupt { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_descriptor_is_partition_mismatch() {
    let fixture = Fixture::new();
    let sql = tpch("q6").pop().unwrap();
    let store = CheckpointStore::new(fixture.path("parts"), true);
    manual_checkpoint(&fixture, &[sql.clone()], &[1, 1, 1, 1], &store);
    std::fs::remove_file(store.descriptor_path(2)).unwrap();

    match resume(&fixture, &[sql], fixture.path("parts"), true).await {
        Err(RatchetError::PartitionCountMismatch {
            expected, found, ..
        }) => {
            assert_eq!(expected, THREADS);
            assert_eq!(found, THREADS - 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_with_other_statement_is_rejected() {
    let fixture = Fixture::new();
    let q6 = tpch("q6").pop().unwrap();
    let store = CheckpointStore::new(fixture.path("q6.ckpt"), false);
    manual_checkpoint(&fixture, &[q6], &[2, 2, 2, 2], &store);

    assert!(matches!(
        resume(&fixture, &tpch("q1"), fixture.path("q6.ckpt"), false).await,
        Err(RatchetError::StatementMismatch { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_with_redefined_view_is_rejected() {
    let fixture = Fixture::new();
    let statements = tpch("q15");
    let store = CheckpointStore::new(fixture.path("q15.ckpt"), false);
    manual_checkpoint(&fixture, &statements, &[1, 1, 1, 1], &store);

    let mut redefined = statements.clone();
    redefined[0] = redefined[0].replace("1996-01-01", "1995-01-01");
    assert_ne!(redefined[0], statements[0]);
    assert!(matches!(
        resume(&fixture, &redefined, fixture.path("q15.ckpt"), false).await,
        Err(RatchetError::StatementMismatch { .. })
    ));

    let expected = plain(&fixture, &statements).await;
    let actual = completed(
        resume(&fixture, &statements, fixture.path("q15.ckpt"), false)
            .await
            .unwrap(),
    );
    assert_same(&expected, &actual);
}

#[tokio::test]
async fn test_update_table_reloads_stale_table() {
    let fixture = Fixture::new();
    let database = DatabaseLocation::File(fixture.path("bench.db"));
    let materializer = DatasetMaterializer::new(fixture.data());

    {
        let mut session = ExecutionSession::open(database.clone()).unwrap();
        session.configure(1, &fixture.path("spill")).unwrap();
        let report = materializer.materialize(&mut session, &TABLES, false).unwrap();
        assert_eq!(report.loaded.len(), TABLES.len());
        session.close().unwrap();
    }

    // The source grows; the stored table is now stale.
    write_parquet(&fixture.data(), "customer", customer_frame(90));

    let mut session = ExecutionSession::open(database).unwrap();
    session.configure(1, &fixture.path("spill")).unwrap();

    let report = materializer.materialize(&mut session, &TABLES, false).unwrap();
    assert!(report.loaded.is_empty());
    assert_eq!(session.table_entry("customer").unwrap().unwrap().rows, 60);

    let report = materializer.materialize(&mut session, &["customer"], true).unwrap();
    assert_eq!(report.dropped, vec!["customer".to_string()]);
    assert_eq!(report.loaded, vec!["customer".to_string()]);
    assert_eq!(session.table_entry("customer").unwrap().unwrap().rows, 90);

    let counted = session
        .execute_sql("SELECT count(*) AS n FROM customer")
        .unwrap()
        .unwrap();
    let n: Vec<Option<i64>> = counted.column("n").unwrap().i64().unwrap().into_iter().collect();
    assert_eq!(n, vec![Some(90)]);
}

#[tokio::test]
async fn test_closed_session_rejects_work() {
    let fixture = Fixture::new();
    let mut session = fixture.session();
    session.close().unwrap();
    assert!(matches!(session.close(), Err(RatchetError::SessionClosed)));
    assert!(matches!(
        execute(&mut session, &tpch("q6"), ExecutionMode::Plain).await,
        Err(RatchetError::SessionClosed)
    ));
}
