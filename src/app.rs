//! Service assembly: store, gateways, orchestrator and agent runtimes.

use crate::agents::{agent_by_name, AgentContext, AgentRuntime, AgentServices};
use crate::config::Config;
use crate::db::Database;
use crate::llm::{CompletionClient, LlmGateway};
use crate::logging::LogLevelFilter;
use crate::pipeline::Orchestrator;
use crate::server::AppState;
use crate::tools::{ToolGateway, Workspace};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Every long-lived service, constructed once and shared by reference.
pub struct App {
    pub config: Config,
    pub db: Database,
    pub tools: Arc<ToolGateway>,
    pub llm: Arc<LlmGateway>,
    pub orchestrator: Arc<Orchestrator>,
    pub runtimes: Vec<Arc<AgentRuntime>>,
}

impl App {
    /// Open the configured database and assemble the services.
    pub fn build(config: Config, client: Arc<dyn CompletionClient>) -> Result<Self> {
        config.ensure_db_dir()?;
        let db = Database::open(&config.server.db_path)?;
        Self::with_database(config, db, client)
    }

    pub fn with_database(config: Config, db: Database, client: Arc<dyn CompletionClient>) -> Result<Self> {
        let workspace = Workspace::new(config.server.workspace_root.clone());
        let tools = Arc::new(ToolGateway::new(db.clone(), workspace, &config)?);
        tools.sync_registry(&config.rbac)?;

        let llm = Arc::new(LlmGateway::new(client, tools.clone(), config.llm.clone()));
        let orchestrator = Arc::new(Orchestrator::new(db.clone(), tools.clone(), config.budget)?);

        let services = AgentServices {
            db: db.clone(),
            tools: tools.clone(),
            llm: llm.clone(),
            coordinator: orchestrator.clone(),
            protected_paths: config.server.protected_paths.clone(),
            log_filter: Arc::new(LogLevelFilter::new(config.agents.log_level)),
        };
        let poll_interval = Duration::from_millis(config.agents.poll_interval_ms);

        let mut runtimes = Vec::new();
        for name in &config.agents.enabled {
            let Some(agent) = agent_by_name(name) else {
                warn!(agent = %name, "Unknown agent in config; skipping");
                continue;
            };
            let cx = AgentContext::new(services.clone(), agent.name());
            runtimes.push(Arc::new(AgentRuntime::new(agent, cx, poll_interval)));
        }
        info!(agents = runtimes.len(), model = %llm.metrics().model, "Services ready");

        Ok(Self {
            config,
            db,
            tools,
            llm,
            orchestrator,
            runtimes,
        })
    }

    pub fn start_agents(&self) {
        for runtime in &self.runtimes {
            runtime.start();
        }
    }

    pub async fn shutdown_agents(&self) {
        for runtime in &self.runtimes {
            runtime.stop();
        }
        for runtime in &self.runtimes {
            runtime.shutdown().await;
        }
    }

    /// One poll of every agent in order. Returns how many tasks were processed.
    pub async fn poll_agents_once(&self) -> Result<usize> {
        let mut processed = 0;
        for runtime in &self.runtimes {
            if runtime.poll_once().await?.is_some() {
                processed += 1;
            }
        }
        Ok(processed)
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            orchestrator: self.orchestrator.clone(),
            llm: self.llm.clone(),
            runtimes: Arc::new(self.runtimes.clone()),
            status_interval: Duration::from_millis(self.config.http.status_interval_ms),
        }
    }
}
