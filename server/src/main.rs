use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use printfarm_ledger_engine::config::Config;
use printfarm_ledger_engine::db::pg::PgRepos;
use printfarm_ledger_engine::estimator::GcodeEstimator;
use printfarm_ledger_engine::settlement::EventProcessor;
use printfarm_ledger_engine::{db, ingest};

/// `engine migrate|ingest|process|all` (spec §6). Exit codes: 0 success,
/// 1 config error, 2 unrecoverable runtime error.
#[derive(Parser)]
#[command(name = "printfarm-ledger", about = "Print-farm material settlement engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations and exit.
    Migrate,
    /// Run the per-printer MQTT subscribers and the raw/normalized event writer.
    Ingest,
    /// Run the settlement event processor loop.
    Process,
    /// Run the ingestor and the event processor in one process.
    All,
}

enum RunError {
    Config(String),
    Runtime(String),
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "printfarm_ledger_engine=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return ExitCode::from(2);
        }
    };

    match rt.block_on(run(cli.command, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Config(msg)) => {
            tracing::error!(error = %msg, "configuration error");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(msg)) => {
            tracing::error!(error = %msg, "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}

async fn run(command: Command, config: Config) -> Result<(), RunError> {
    let pool = db::connect(&config.database_url).await.map_err(|e| RunError::Config(e.to_string()))?;

    match command {
        Command::Migrate => {
            db::migrate(&pool).await.map_err(|e| RunError::Runtime(e.to_string()))?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Command::Ingest => {
            db::migrate(&pool).await.map_err(|e| RunError::Runtime(e.to_string()))?;
            let repos = PgRepos::new(pool);
            let estimator = Arc::new(GcodeEstimator::default());
            let ingestor = ingest::Ingestor::new(repos, config.app_secret_key.clone(), config.allow_insecure_mqtt_tls);
            ingestor.run(estimator).await.map_err(|e| RunError::Runtime(e.to_string()))
        }
        Command::Process => {
            db::migrate(&pool).await.map_err(|e| RunError::Runtime(e.to_string()))?;
            let repos = PgRepos::new(pool);
            run_event_processor(repos, config.material_ams_calibration_enabled).await
        }
        Command::All => {
            db::migrate(&pool).await.map_err(|e| RunError::Runtime(e.to_string()))?;
            let ingest_repos = PgRepos::new(pool.clone());
            let process_repos = PgRepos::new(pool);
            let estimator = Arc::new(GcodeEstimator::default());
            let ingestor = ingest::Ingestor::new(ingest_repos, config.app_secret_key.clone(), config.allow_insecure_mqtt_tls);
            let ams_enabled = config.material_ams_calibration_enabled;

            let ingest_handle = tokio::spawn(async move { ingestor.run(estimator).await.map_err(|e| e.to_string()) });
            let process_handle = tokio::spawn(async move { run_event_processor(process_repos, ams_enabled).await });

            let ingest_res = ingest_handle.await.map_err(|e| RunError::Runtime(e.to_string()))?;
            ingest_res.map_err(RunError::Runtime)?;
            process_handle.await.map_err(|e| RunError::Runtime(e.to_string()))?
        }
    }
}

/// Spec §5: "Event Processor loop that polls the normalized events table
/// every ~2 seconds, processing at most 500 events per tick."
async fn run_event_processor(repos: PgRepos, ams_calibration_enabled: bool) -> Result<(), RunError> {
    let mut processor = EventProcessor::new(repos, ams_calibration_enabled);
    loop {
        match processor.tick().await {
            Ok(n) if n > 0 => tracing::debug!(processed = n, "settlement tick"),
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "settlement tick failed, continuing"),
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
