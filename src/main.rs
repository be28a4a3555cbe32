use anyhow::Result;
use clap::Parser;
use ratchet_bench::config::{Args, RunConfig};
use ratchet_bench::materializer::DatasetMaterializer;
use ratchet_bench::queries::QueryRegistry;
use ratchet_bench::report::ResultReporter;
use ratchet_bench::session::{polars_environment, ExecutionSession};
use ratchet_bench::suspend::SuspendResumeController;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = RunConfig::from_args(Args::parse())?;

    // Still single-threaded here; the runtime below starts the workers.
    for (key, value) in polars_environment(config.threads, &config.tmp_folder) {
        std::env::set_var(key, value);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ratchet-worker")
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: RunConfig) -> Result<()> {
    let reporter = ResultReporter::start();

    info!("Ratchet starting...");
    info!("Benchmark: {}, query: {}", config.benchmark, config.query);

    let registry = QueryRegistry::for_benchmark(config.benchmark)?;
    let definition = registry.resolve(&config.query)?;

    let mut session = ExecutionSession::open(config.database.clone())?;
    session.set_batch_rows(config.batch_rows)?;
    session.configure(config.threads, &config.tmp_folder)?;

    let report = DatasetMaterializer::new(&config.data_folder).materialize(
        &mut session,
        config.benchmark.tables(),
        config.update_table,
    )?;
    info!(
        "Tables: {} loaded, {} already present, {} dropped",
        report.loaded.len(),
        report.skipped.len(),
        report.dropped.len()
    );

    let outcome = SuspendResumeController::new(&mut session)
        .execute(&definition.statements, &config.mode)
        .await?;

    let stdout = std::io::stdout();
    reporter.render(&outcome, &mut stdout.lock())?;

    session.close()?;
    Ok(())
}
