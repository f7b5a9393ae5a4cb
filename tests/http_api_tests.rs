//! HTTP API tests against a server bound to an ephemeral port.

use agent_pipeline::app::App;
use agent_pipeline::config::Config;
use agent_pipeline::db::Database;
use agent_pipeline::llm::{Completion, CompletionClient, CompletionRequest};
use agent_pipeline::server::start_server;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::oneshot;

struct FixedClient;

#[async_trait]
impl CompletionClient for FixedClient {
    fn model(&self) -> &str {
        "fixed"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let text = if request.system.contains("senior engineer") {
            json!({
                "summary": "Points module",
                "files": [{ "path": "src/points.rs", "content": "pub fn earn() {}" }],
            })
            .to_string()
        } else {
            json!({ "summary": "Points module design" }).to_string()
        };
        Ok(Completion {
            text,
            total_tokens: 10,
        })
    }
}

struct Server {
    dir: TempDir,
    _shutdown: oneshot::Sender<()>,
    app: App,
    base: String,
    http: reqwest::Client,
}

async fn start() -> Server {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.server.workspace_root = dir.path().to_path_buf();
    let app = App::with_database(config, Database::open_in_memory().unwrap(), Arc::new(FixedClient))
        .unwrap();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (shutdown, bound) = start_server(app.app_state(), addr).await.unwrap();
    Server {
        dir,
        _shutdown: shutdown,
        app,
        base: format!("http://{}/api", bound),
        http: reqwest::Client::new(),
    }
}

impl Server {
    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Option<Value>) -> (u16, Value) {
        let mut request = self.http.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

#[tokio::test]
async fn health_and_catalogue_endpoints() {
    let server = start().await;

    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");

    let (_, tools) = server.get("/tools?mode=plan").await;
    let names: Vec<&str> = tools
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"read_file"));
    assert!(!names.contains(&"write_file"));

    let (_, agents) = server.get("/agents").await;
    assert_eq!(agents.as_array().unwrap().len(), 5);

    let (_, metrics) = server.get("/llm/metrics").await;
    assert_eq!(metrics["model"], "fixed");
}

#[tokio::test]
async fn review_flow_over_http() {
    let server = start().await;

    let (status, created) = server
        .post(
            "/pipelines",
            Some(json!({ "prompt": "Add loyalty points", "budget": { "maxCalls": 10 } })),
        )
        .await;
    assert_eq!(status, 201);
    let id = created["id"].as_i64().unwrap();
    assert_eq!(created["status"], "running");
    assert_eq!(created["budget"]["max_calls"], 10);

    for _ in 0..5 {
        server.app.poll_agents_once().await.unwrap();
    }

    let (_, details) = server.get(&format!("/pipelines/{}", id)).await;
    assert_eq!(details["status"], "staging_review");
    assert_eq!(details["staged_changes"].as_array().unwrap().len(), 1);

    let (_, list) = server.get("/pipelines?limit=5").await;
    assert_eq!(list[0]["has_pending_changes"], true);

    let (status, approved) = server.post(&format!("/pipelines/{}/approve", id), None).await;
    assert_eq!(status, 200);
    assert_eq!(approved["applied"], json!(["src/points.rs"]));
    assert!(server.dir.path().join("src/points.rs").exists());

    let (status, body) = server.post(&format!("/pipelines/{}/approve", id), None).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

    let (status, rolled_back) = server
        .post(
            &format!("/pipelines/{}/rollback", id),
            Some(json!({ "reviewedBy": "alice" })),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(rolled_back["restored"], json!(["src/points.rs"]));
    assert!(!server.dir.path().join("src/points.rs").exists());

    let (status, body) = server.post(&format!("/pipelines/{}/rollback", id), None).await;
    assert_eq!(status, 409);
    assert_eq!(body["error"]["code"], "ROLLBACK_UNAVAILABLE");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let server = start().await;

    let (status, body) = server.get("/pipelines/404").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "PIPELINE_NOT_FOUND");

    let (status, body) = server.post("/pipelines", Some(json!({ "prompt": "hi" }))).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["field"], "prompt");
}

#[tokio::test]
async fn mode_and_terminal_endpoints() {
    let server = start().await;
    let (_, created) = server
        .post("/pipelines", Some(json!({ "prompt": "Add loyalty points" })))
        .await;
    let id = created["id"].as_i64().unwrap();

    let (_, mode) = server.get(&format!("/pipelines/{}/mode", id)).await;
    assert_eq!(mode["mode"], "act");

    let (status, mode) = server
        .post(&format!("/pipelines/{}/mode", id), Some(json!({ "mode": "plan" })))
        .await;
    assert_eq!(status, 200);
    assert_eq!(mode["mode"], "plan");
    assert!(server.app.tools.plan_mode(Some(id)));

    let (status, transcript) = server.get(&format!("/pipelines/{}/terminal", id)).await;
    assert_eq!(status, 200);
    assert!(transcript.as_array().unwrap().is_empty());
}
