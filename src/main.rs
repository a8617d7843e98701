use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod db;
mod ingest;
mod llm;
mod pipeline;
mod sql;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs, Command, LogFormat};
use crate::db::db_pool::build_pool;
use crate::db::handle::DatabaseHandle;
use crate::llm::LlmManager;
use crate::pipeline::{Pipeline, QueryResponse};
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::Text);
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    init_tracing(config.log_format);
    config.llm.check_api_key();

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm = Arc::new(LlmManager::new(&config.llm)?);
    let pipeline = Pipeline::new(llm, config.llm.timeout(), &config.query)?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, pipeline).await,
        Command::Ask {
            database,
            max_retries,
            question,
        } => ask(&config, &pipeline, database, max_retries, &question).await,
    }
}

async fn serve(
    config: AppConfig,
    pipeline: Pipeline,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Ensure data directory exists
    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    let state = Arc::new(AppState::new(config, pipeline));
    if let Err(e) = state.registry.scan().await {
        error!("Failed to scan data directory: {}", e);
    }

    info!(
        "Starting nl-sql server on {}:{}",
        state.config.web.host, state.config.web.port
    );
    match web::run_server(state).await {
        Ok(()) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Answers one question against a local file and prints the JSON outcome.
async fn ask(
    config: &AppConfig,
    pipeline: &Pipeline,
    database: PathBuf,
    max_retries: Option<u32>,
    question: &str,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if !database.is_file() {
        return Err(format!("Database file not found: {}", database.display()).into());
    }
    let name = database
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("database")
        .to_string();

    let pool = build_pool(
        database,
        1,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?;
    let handle = DatabaseHandle::checkout(&name, &pool).await?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling question");
            on_ctrl_c.cancel();
        }
    });

    let max_retries = max_retries.unwrap_or_else(|| pipeline.default_max_retries());
    let result = pipeline
        .answer_question(&handle, question, max_retries, &cancel)
        .await;
    let succeeded = result.is_ok();

    println!("{}", serde_json::to_string_pretty(&QueryResponse::from(result))?);
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
