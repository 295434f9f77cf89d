use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thinktank_core::capabilities::{CapabilityProvider, OpenAiProvider, PromptLibrary};
use thinktank_core::pipeline::{Orchestrator, PipelineConfig};
use thinktank_core::state::{RunRecorder, ThinkTankDb};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;

use config::{EnvConfig, PersistedConfig};

#[derive(Parser, Clone)]
#[command(author, version, about = "ThinkTank - AI project planning pipeline")]
struct Args {
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand, Clone)]
enum CliCommand {
    /// Start the HTTP server (default)
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// SQLite database path
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Run the pipeline on one message and print the result (no server)
    Run {
        /// The chat message, e.g. a project goal
        message: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Print a stored run
    Status {
        id: i64,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

/// Everything a command needs, built from file and environment
struct Runtime {
    db: Arc<ThinkTankDb>,
    pipeline: PipelineConfig,
    provider: Arc<dyn CapabilityProvider>,
}

async fn bootstrap(db_flag: Option<PathBuf>) -> anyhow::Result<Runtime> {
    let path = config::db_path(db_flag);
    let db = Arc::new(
        ThinkTankDb::open_at(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?,
    );

    match db.seed_prompts() {
        Ok(count) if count > 0 => tracing::info!("Seeded {} default prompts", count),
        Ok(_) => {}
        Err(e) => tracing::warn!("Failed to seed prompts: {:#}", e),
    }

    let persisted = PersistedConfig::load().await;
    let model = persisted.model_config(&EnvConfig::from_env())?;
    if model.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; provider calls will fail");
    }
    tracing::info!(provider = ?model.provider, model = %model.model, "Provider configured");

    let provider: Arc<dyn CapabilityProvider> = Arc::new(OpenAiProvider::new(model)?);

    Ok(Runtime {
        db,
        pipeline: persisted.pipeline_config(),
        provider,
    })
}

async fn serve(port: u16, db_flag: Option<PathBuf>) -> anyhow::Result<()> {
    let runtime = bootstrap(db_flag).await?;
    let shutdown = CancellationToken::new();

    let state = api::AppState::new(
        runtime.db,
        runtime.pipeline,
        runtime.provider,
        shutdown.clone(),
    )?;
    let app = api::router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("ThinkTank server running at http://{}", addr);
    tracing::info!("Routes: /workflow/chat, /workflow/status/:id, /workflow/runs/:id, /workflow/events, /prompts, /config, /ping");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down; cancelling in-flight runs");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

async fn run_once(message: String, db_flag: Option<PathBuf>) -> anyhow::Result<()> {
    let runtime = bootstrap(db_flag).await?;
    let prompts = PromptLibrary::load(&runtime.db)?;
    let orchestrator = Orchestrator::new(runtime.pipeline, runtime.provider, prompts)
        .with_recorder(RunRecorder::sqlite(&runtime.db));

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let bundle = orchestrator.handle_message(&message, &cancel).await;

    println!("{}", bundle.aggregate_result);
    for warning in &bundle.warnings {
        eprintln!("warning: {}", warning);
    }
    if let Some(id) = bundle.run_id {
        eprintln!("run {} ({})", id, bundle.status.as_str());
    }
    if let Some(failure) = &bundle.failure {
        anyhow::bail!("run failed ({}): {}", failure.reason, failure.message);
    }
    Ok(())
}

fn print_status(id: i64, db_flag: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config::db_path(db_flag);
    let db = ThinkTankDb::open_at(&path)
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    let detail = RunRecorder::sqlite(&db).detail(id)?;
    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "thinktank_server=info,thinktank_core=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match args.command {
        Some(CliCommand::Serve { port, db }) => serve(port, db).await,
        Some(CliCommand::Run { message, db }) => run_once(message, db).await,
        Some(CliCommand::Status { id, db }) => print_status(id, db),
        None => serve(8080, None).await,
    }
}
