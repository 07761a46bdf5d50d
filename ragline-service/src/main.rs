use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod api;
mod config;
mod credentials;
mod error;
mod extraction;
mod metrics;
mod process_registry;
mod progress;
mod service;
mod stage;

use crate::config::StaticConfig;
use crate::credentials::EnvCredentials;
use crate::progress::{CANCELLED_EXIT_CODE, ProgressFn};
use crate::service::PipelineService;
use crate::stage::{SessionStore, StageContext, StageKind, execute_stage, is_cancellation};

#[derive(Parser)]
#[command(name = "ragline-service", version, about = "Document processing pipeline service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service with its queue workers (the default).
    Serve,
    /// Run one pipeline stage in this process, printing progress markers on
    /// stdout. This is what the tracked-subprocess transport invokes.
    RunStage {
        #[arg(value_enum)]
        stage: StageKind,

        /// Session the stage belongs to.
        #[arg(long)]
        session: String,

        /// Session directory; defaults to the configured upload directory
        /// plus the session id.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            init_logging(false);
            serve().await
        }
        Command::RunStage {
            stage,
            session,
            dir,
        } => {
            // Markers own stdout; logs go to stderr.
            init_logging(true);
            run_stage(stage, session, dir).await
        }
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting ragline service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = Arc::new(StaticConfig::load()?);
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Static configuration loaded"
    );

    std::fs::create_dir_all(&config.storage.data_dir)?;
    std::fs::create_dir_all(&config.storage.upload_dir)?;

    let metrics_handle = metrics::install();

    let service = Arc::new(PipelineService::new(config.clone())?);
    info!(path = %config.database_path().display(), "Service database initialized");

    let shutdown = CancellationToken::new();
    service.start_workers(shutdown.clone());

    let app = api::router(service, metrics_handle);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;
    shutdown.cancel();
    Ok(())
}

async fn run_stage(
    stage: StageKind,
    session: String,
    dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(StaticConfig::load()?);
    let sessions = SessionStore::open(&config.database_path())?;

    let session_dir = dir.unwrap_or_else(|| config.session_dir(&session));
    let ctx = StageContext {
        config: config.clone(),
        session_id: session.clone(),
        session_dir,
        credentials: Arc::new(EnvCredentials),
        ocr_limiter: Arc::new(Semaphore::new(config.extraction.ocr_concurrent_calls)),
    };

    let progress: ProgressFn = Arc::new(|event| {
        if let Some(marker) = event.to_marker() {
            println!("{marker}");
        }
    });

    // A stop request reaches this process as SIGTERM; translate it into
    // cooperative cancellation so the checkpoint stays consistent.
    let cancel = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm_cancel = cancel.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        info!("SIGTERM received; cancelling stage");
        sigterm_cancel.cancel();
    });

    match execute_stage(stage, &ctx, &sessions, progress, cancel).await {
        Ok(result) => {
            info!(stage = stage.as_str(), %result, "Stage run complete");
            Ok(())
        }
        Err(ref e) if is_cancellation(e) => {
            info!(stage = stage.as_str(), "Stage run cancelled");
            std::process::exit(CANCELLED_EXIT_CODE);
        }
        Err(e) => {
            error!(stage = stage.as_str(), error = %e, "Stage run failed");
            std::process::exit(1);
        }
    }
}

fn init_logging(to_stderr: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ragline_service=info"));

    if to_stderr {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .event_format(format)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().event_format(format))
            .with(filter)
            .init();
    }
}
