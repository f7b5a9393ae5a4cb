//! Agent Pipeline
//!
//! Serves the pipeline HTTP API with the agents running in-process, or runs a
//! single pipeline from the command line.

use agent_pipeline::app::App;
use agent_pipeline::cli::{Cli, Command, RunArgs};
use agent_pipeline::config::{Config, ConfigLoader};
use agent_pipeline::llm::HttpCompletionClient;
use agent_pipeline::logging::init_tracing;
use agent_pipeline::pipeline::{BudgetRequest, CreatePipeline, EventKind};
use agent_pipeline::server::start_server_with_retry;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log, cli.verbose)?;

    // SAFETY: set at startup before any other threads are spawned.
    if let Some(config_path) = &cli.config {
        unsafe {
            std::env::set_var("AGENT_PIPELINE_CONFIG_PATH", config_path);
        }
    }
    let mut loader = ConfigLoader::load()?;
    if let Some(path) = loader.config_path() {
        info!("Using config {}", path.display());
    }

    let config = loader.config_mut();
    if let Some(db_path) = &cli.database {
        config.server.db_path = db_path.into();
    }
    if let Some(workspace) = &cli.workspace {
        config.server.workspace_root = workspace.into();
    }
    if let Some(port) = cli.port {
        config.http.port = port;
    }
    let config = loader.into_config();

    match cli.command {
        Some(Command::Run(args)) => run_pipeline(config, args).await,
        Some(Command::Serve) | None => serve(config).await,
    }
}

fn build_app(config: Config) -> Result<App> {
    let client = HttpCompletionClient::from_config(&config.llm)?;
    if !agent_pipeline::llm::CompletionClient::is_configured(&client) {
        warn!(
            "No API key in ${}; completion calls will be rejected upstream",
            config.llm.api_key_env
        );
    }
    App::build(config, Arc::new(client))
}

async fn serve(config: Config) -> Result<()> {
    let app = build_app(config)?;
    app.start_agents();
    let server = start_server_with_retry(app.app_state(), &app.config.http);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    server.shutdown();
    app.shutdown_agents().await;
    Ok(())
}

async fn run_pipeline(config: Config, args: RunArgs) -> Result<()> {
    let plan_context = match &args.plan_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading plan file {}", path.display()))?,
        ),
        None => None,
    };

    let app = build_app(config)?;
    let pipeline = app.orchestrator.create_pipeline(CreatePipeline {
        prompt: args.prompt,
        mode: Some(args.mode.into()),
        plan_context,
        budget: Some(BudgetRequest {
            max_time_ms: args.max_time_ms,
            max_calls: args.max_calls,
        }),
        metadata: None,
        requested_by: Some("cli".to_string()),
    })?;
    let mut events = app.orchestrator.subscribe(pipeline.id);
    println!("{}", serde_json::to_string(&pipeline)?);
    app.start_agents();

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if matches!(
                        event.kind,
                        EventKind::StagingReady | EventKind::Completed | EventKind::Failed
                    ) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    app.shutdown_agents().await;
    let pipeline = app.orchestrator.get(pipeline.id)?;
    info!(
        pipeline_id = pipeline.id,
        status = pipeline.status.as_str(),
        "Pipeline run finished"
    );
    Ok(())
}
