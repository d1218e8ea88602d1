pub mod adapters;
pub mod dashboard;
pub mod db;
pub mod errors;
pub mod harness;
pub mod models;
pub mod policy;
pub mod runner;
pub mod server;
pub mod settings;
pub mod streaming;
pub mod voice;

use adapters::openai::ChatCompletionsRuntime;
use adapters::tools::ToolBox;
use db::{Database, QueryExecutor};
use errors::{AppError, AppResult};
use runner::RunnerCore;
use server::AppState;
use settings::Settings;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub async fn run() -> anyhow::Result<()> {
    let (settings, ignored_overrides) = Settings::load()?;
    init_tracing(&settings)?;
    for note in &ignored_overrides {
        tracing::warn!(note = %note, "ignored configuration override");
    }

    let database = Database::bootstrap(&settings.database_path)?;
    tracing::info!(path = %database.path().display(), "database ready");
    let executor: Arc<dyn QueryExecutor> = Arc::new(database);

    let api_key = settings.require_llm_key()?;
    let runtime = ChatCompletionsRuntime::new(&settings.llm, api_key, ToolBox::new(Arc::clone(&executor)))?;
    let runner = RunnerCore::new(Arc::new(runtime), executor);
    let state = AppState::new(runner, Arc::new(settings.clone()))?;

    let listener = tokio::net::TcpListener::bind(settings.bind_addr.as_str()).await?;
    tracing::info!(addr = %settings.bind_addr, model = %settings.llm.model, "financeflip listening");
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("financeflip stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing(settings: &Settings) -> AppResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level));

    match &settings.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "financeflip.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).json().try_init(),
    }
    .map_err(|error| AppError::Internal(error.to_string()))
}
