//! Agent runtime loop, reasoning calls and context enrichment.
//!
//! Runtimes are started for real with a short poll interval; the completion
//! client answers every call with one fixed reply.

use agent_pipeline::agents::{Agent, AgentContext, AgentRuntime, AgentServices};
use agent_pipeline::app::App;
use agent_pipeline::config::{Config, PolicyEffect, PolicyRule};
use agent_pipeline::db::Database;
use agent_pipeline::llm::{Completion, CompletionClient, CompletionRequest, GenerateOptions};
use agent_pipeline::logging::{LogLevel, LogLevelFilter};
use agent_pipeline::pipeline::CreatePipeline;
use agent_pipeline::tools::ToolContext;
use agent_pipeline::types::{Phase, Pipeline, PipelineMode, PipelineStatus, Task, TaskStatus};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const DESIGN_REPLY: &str = r#"{"summary":"Points ledger"}"#;

struct ReplyClient {
    reply: std::result::Result<String, String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ReplyClient {
    fn ok(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing(error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CompletionClient for ReplyClient {
    fn model(&self) -> &str {
        "reply"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        self.requests.lock().unwrap().push(request);
        match &self.reply {
            Ok(text) => Ok(Completion {
                text: text.clone(),
                total_tokens: 7,
            }),
            Err(error) => Err(anyhow!("{}", error)),
        }
    }
}

/// Process panics instead of working.
struct CrashingAgent;

#[async_trait]
impl Agent for CrashingAgent {
    fn name(&self) -> &'static str {
        "crasher"
    }

    fn display_name(&self) -> &'static str {
        "Crasher"
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["design"]
    }

    fn can_handle(&self, task: &Task) -> bool {
        task.phase() == Some(Phase::Design)
    }

    async fn process(&self, _task: &Task, _cx: &AgentContext) -> Result<()> {
        panic!("crasher exploded");
    }
}

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.server.workspace_root = dir.path().to_path_buf();
    config.agents.poll_interval_ms = 10;
    config
}

fn setup_with(config: Config, client: ReplyClient) -> (App, Arc<ReplyClient>) {
    let client = Arc::new(client);
    let app = App::with_database(config, Database::open_in_memory().unwrap(), client.clone())
        .unwrap();
    (app, client)
}

fn setup(client: ReplyClient) -> (TempDir, App, Arc<ReplyClient>) {
    let dir = tempfile::tempdir().unwrap();
    let (app, client) = setup_with(test_config(&dir), client);
    (dir, app, client)
}

fn runtime<'a>(app: &'a App, name: &str) -> &'a Arc<AgentRuntime> {
    app.runtimes.iter().find(|r| r.name() == name).unwrap()
}

fn create(app: &App) -> Pipeline {
    app.orchestrator
        .create_pipeline(CreatePipeline {
            prompt: "Add a loyalty points module".to_string(),
            mode: Some(PipelineMode::Act),
            plan_context: None,
            budget: None,
            metadata: None,
            requested_by: None,
        })
        .unwrap()
}

fn current_phase(app: &App, pipeline_id: i64) -> Option<Phase> {
    app.orchestrator.get(pipeline_id).unwrap().current_phase
}

/// Poll `check` for up to two seconds.
async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn stopped_runtime_leaves_new_work_alone() {
    let (_dir, app, _client) = setup(ReplyClient::ok(DESIGN_REPLY));
    let architect = runtime(&app, "architect");

    architect.start();
    architect.start();
    assert!(architect.is_running());

    let first = create(&app);
    assert!(wait_until(|| current_phase(&app, first.id) == Some(Phase::Codegen)).await);

    architect.stop();
    architect.shutdown().await;
    assert!(!architect.is_running());

    let second = create(&app);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let tasks = app.db.list_tasks_for_pipeline(second.id).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(architect.status().processed, 1);
}

#[tokio::test]
async fn restart_right_after_stop_keeps_polling() {
    let (_dir, app, _client) = setup(ReplyClient::ok(DESIGN_REPLY));
    let architect = runtime(&app, "architect");

    architect.start();
    architect.stop();
    architect.start();
    assert!(architect.is_running());

    let pipeline = create(&app);
    assert!(wait_until(|| current_phase(&app, pipeline.id) == Some(Phase::Codegen)).await);
    assert!(architect.is_running());

    architect.shutdown().await;
    assert!(!architect.is_running());
}

#[tokio::test]
async fn panicking_agent_fails_its_task_and_the_loop_survives() {
    let (_dir, app, _client) = setup(ReplyClient::ok(DESIGN_REPLY));
    let services = AgentServices {
        db: app.db.clone(),
        tools: app.tools.clone(),
        llm: app.llm.clone(),
        coordinator: app.orchestrator.clone(),
        protected_paths: Vec::new(),
        log_filter: Arc::new(LogLevelFilter::default()),
    };
    let crasher = AgentRuntime::new(
        Arc::new(CrashingAgent),
        AgentContext::new(services, "crasher"),
        Duration::from_millis(10),
    );

    let first = create(&app);
    let task_id = crasher.poll_once().await.unwrap().unwrap();

    let task = app.db.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("agent panicked while processing"));
    let pipeline = app.orchestrator.get(first.id).unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Failed);
    assert!(pipeline.error.unwrap().starts_with("design failed"));
    assert_eq!(crasher.status().failed, 1);

    crasher.start();
    let second = create(&app);
    assert!(
        wait_until(|| app.orchestrator.get(second.id).unwrap().status == PipelineStatus::Failed)
            .await
    );
    assert!(wait_until(|| crasher.status().failed == 2).await);
    assert!(crasher.is_running());
    crasher.shutdown().await;
}

#[tokio::test]
async fn think_parses_structured_replies() {
    let reply = "```json\n{\"thought\":\"read the ledger\",\"action\":\"read_file\",\
                 \"action_input\":{\"path\":\"src/lib.rs\"},\"finished\":false}\n```";
    let (_dir, app, client) = setup(ReplyClient::ok(reply));

    let thought = app
        .llm
        .think(&ToolContext::new("architect"), "You plan work.", "What now?")
        .await;
    assert_eq!(thought.thought, "read the ledger");
    assert_eq!(thought.action.as_deref(), Some("read_file"));
    assert_eq!(thought.action_input.as_ref().unwrap()["path"], "src/lib.rs");
    assert!(!thought.finished);
    assert!(thought.error().is_none());

    let requests = client.requests.lock().unwrap();
    assert!(requests[0].json_mode);
    assert!(requests[0].system.starts_with("You plan work."));
    assert!(requests[0].system.contains("\"finished\""));
}

#[tokio::test]
async fn think_turns_bad_replies_into_finished_thoughts() {
    let (_dir, app, _client) = setup(ReplyClient::ok("I am not sure what to do"));
    let thought = app
        .llm
        .think(&ToolContext::new("architect"), "You plan work.", "What now?")
        .await;
    assert!(thought.finished);
    assert!(thought.error().unwrap().contains("not valid JSON"));
    assert_eq!(app.llm.metrics().error_count, 1);

    let (_dir, app, _client) = setup(ReplyClient::failing("upstream returned 503"));
    let thought = app
        .llm
        .think(&ToolContext::new("architect"), "You plan work.", "What now?")
        .await;
    assert!(thought.finished);
    assert!(thought.error().unwrap().contains("upstream returned 503"));
    assert_eq!(app.llm.metrics().error_count, 1);
    assert_eq!(app.llm.metrics().call_count, 1);
}

#[tokio::test]
async fn enrichment_appends_matching_snippets() {
    let (dir, app, client) = setup(ReplyClient::ok("done"));
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/loyalty.rs"), "pub struct LoyaltyLedger;\n").unwrap();
    let ctx = ToolContext::new("architect");

    let extra = app.llm.enrich_with_context(&ctx, "Extend the loyalty ledger").await;
    assert!(extra.starts_with("\n\n## Relevant code in the workspace\n"));
    assert!(extra.contains("src/loyalty.rs:1 - pub struct LoyaltyLedger;"));

    assert!(app.llm.enrich_with_context(&ctx, "Rename widgets").await.is_empty());

    app.llm
        .generate(&ctx, "system", "Extend the loyalty ledger", GenerateOptions::default())
        .await
        .unwrap();
    let requests = client.requests.lock().unwrap();
    assert!(requests[0].user.starts_with("Extend the loyalty ledger\n\n## Relevant code"));
}

#[tokio::test]
async fn denied_search_falls_back_to_the_bare_prompt() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("loyalty.rs"), "pub struct LoyaltyLedger;\n").unwrap();
    let mut config = test_config(&dir);
    config.governance.push(PolicyRule {
        name: "no-search".into(),
        tools: vec!["search_code".into()],
        effect: PolicyEffect::Deny,
        ..Default::default()
    });
    let (app, client) = setup_with(config, ReplyClient::ok("done"));
    let ctx = ToolContext::new("architect");

    assert!(app.llm.enrich_with_context(&ctx, "Extend the loyalty ledger").await.is_empty());

    app.llm
        .generate(&ctx, "system", "Extend the loyalty ledger", GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(client.requests.lock().unwrap()[0].user, "Extend the loyalty ledger");
}

#[tokio::test]
async fn agent_log_level_filters_mirrored_entries() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.agents.log_level = LogLevel::Warning;
    let (app, _client) = setup_with(config, ReplyClient::ok(DESIGN_REPLY));

    let pipeline = create(&app);
    runtime(&app, "architect").poll_once().await.unwrap().unwrap();
    assert_eq!(current_phase(&app, pipeline.id), Some(Phase::Codegen));

    let audits = app.db.list_audit_for_pipeline(pipeline.id).unwrap();
    assert!(audits.iter().any(|r| r.action == "search_code"));
    assert!(audits.iter().all(|r| r.decision != "logged"));
    assert!(app.db.get_actions_for_pipeline(pipeline.id).unwrap().is_empty());
}
