//! Integration tests for the tool gateway.
//!
//! Each check that can refuse a call (plan mode, RBAC, governance, parameter
//! validation) is exercised against a temporary workspace, together with the
//! audit and transcript side effects of executed calls.

use agent_pipeline::config::{Config, PolicyEffect, PolicyRule};
use agent_pipeline::db::Database;
use agent_pipeline::tools::{ToolContext, ToolGateway, Workspace};
use agent_pipeline::types::PipelineMode;
use serde_json::json;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    db: Database,
    gateway: ToolGateway,
}

fn setup(config: Config) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let gateway = ToolGateway::new(db.clone(), Workspace::new(dir.path()), &config).unwrap();
    gateway.sync_registry(&config.rbac).unwrap();
    Fixture {
        _dir: dir,
        db,
        gateway,
    }
}

fn ctx(agent: &str, pipeline_id: i64) -> ToolContext {
    ToolContext::new(agent).with_pipeline(pipeline_id)
}

#[tokio::test]
async fn plan_mode_blocks_mutating_tools_without_side_effects() {
    let f = setup(Config::default());
    f.gateway.open_scope(1, true);

    let result = f
        .gateway
        .invoke(
            &ctx("generator", 1),
            "write_file",
            json!({"path": "src/loyalty.rs", "content": "pub fn points() {}"}),
        )
        .await;

    assert!(!result.success);
    assert!(result.is_denied());
    assert_eq!(result.denial.as_ref().unwrap().code(), "PLAN_MODE_BLOCKED");
    assert!(result.error.unwrap().starts_with("PLAN_MODE_BLOCKED"));
    assert!(!f.gateway.workspace().resolve("src/loyalty.rs").unwrap().exists());
    assert!(f.db.list_audit_for_pipeline(1).unwrap().is_empty());
}

#[tokio::test]
async fn plan_mode_allows_read_only_tools() {
    let f = setup(Config::default());
    f.gateway.open_scope(1, true);
    f.gateway.workspace().write("README.md", "hello").await.unwrap();

    let result = f
        .gateway
        .invoke(&ctx("architect", 1), "read_file", json!({"path": "README.md"}))
        .await;
    assert!(result.success);
    assert_eq!(result.output, "hello");
    assert_eq!(result.data.unwrap()["exists"], true);
}

#[tokio::test]
async fn plan_mode_is_scoped_per_pipeline() {
    let f = setup(Config::default());
    f.gateway.open_scope(1, true);
    f.gateway.open_scope(2, false);

    let blocked = f
        .gateway
        .invoke(&ctx("stager", 1), "write_file", json!({"path": "a.txt", "content": "a"}))
        .await;
    let allowed = f
        .gateway
        .invoke(&ctx("stager", 2), "write_file", json!({"path": "b.txt", "content": "b"}))
        .await;

    assert!(blocked.is_denied());
    assert!(allowed.success);
    assert!(!f.gateway.workspace().resolve("a.txt").unwrap().exists());
    assert_eq!(f.gateway.workspace().read("b.txt").await.unwrap().as_deref(), Some("b"));

    // Switching modes takes effect on the next call.
    f.gateway.set_plan_mode(1, false);
    let now_allowed = f
        .gateway
        .invoke(&ctx("stager", 1), "write_file", json!({"path": "a.txt", "content": "a"}))
        .await;
    assert!(now_allowed.success);
}

#[tokio::test]
async fn plan_mode_hides_mutating_tools_from_listings() {
    let f = setup(Config::default());
    let plan: Vec<&str> = f
        .gateway
        .tools_for_mode(PipelineMode::Plan)
        .iter()
        .map(|d| d.name)
        .collect();
    assert!(plan.contains(&"read_file"));
    assert!(plan.contains(&"search_code"));
    assert!(!plan.contains(&"write_file"));
    assert!(!plan.contains(&"run_command"));

    let act = f.gateway.tools_for_mode(PipelineMode::Act);
    assert_eq!(act.len(), 6);

    let catalogue = f.gateway.describe_tools(PipelineMode::Plan);
    assert!(catalogue.starts_with("## Available tools"));
    assert!(!catalogue.contains("write_file"));
}

#[tokio::test]
async fn rbac_restricts_tools_to_listed_agents() {
    let mut config = Config::default();
    config
        .rbac
        .insert("write_file".into(), vec!["stager".into()]);
    let f = setup(config);
    f.gateway.open_scope(1, false);

    let denied = f
        .gateway
        .invoke(&ctx("generator", 1), "write_file", json!({"path": "x.rs", "content": ""}))
        .await;
    assert_eq!(denied.denial.as_ref().unwrap().code(), "RBAC_DENIED");
    assert!(f.db.list_audit_for_pipeline(1).unwrap().is_empty());

    let allowed = f
        .gateway
        .invoke(&ctx("stager", 1), "write_file", json!({"path": "x.rs", "content": ""}))
        .await;
    assert!(allowed.success);

    // Tools without an entry in the map stay open to everyone.
    let read = f
        .gateway
        .invoke(&ctx("generator", 1), "read_file", json!({"path": "x.rs"}))
        .await;
    assert!(read.success);
}

#[tokio::test]
async fn rbac_changes_in_the_registry_apply_immediately() {
    let f = setup(Config::default());
    f.db
        .set_tool_allowed_agents("list_directory", Some(&["architect".to_string()][..]))
        .unwrap();

    let denied = f
        .gateway
        .invoke(&ToolContext::new("evolution"), "list_directory", json!({}))
        .await;
    assert_eq!(denied.denial.unwrap().code(), "RBAC_DENIED");

    f.db.set_tool_allowed_agents("list_directory", None).unwrap();
    let allowed = f
        .gateway
        .invoke(&ToolContext::new("evolution"), "list_directory", json!({}))
        .await;
    assert!(allowed.success);
}

#[tokio::test]
async fn governance_rules_deny_matching_targets() {
    let mut config = Config::default();
    config.governance.push(PolicyRule {
        name: "no-secrets".into(),
        tools: vec!["read_file".into(), "write_file".into()],
        target_pattern: Some(r"\.env$".into()),
        effect: PolicyEffect::Deny,
        reason: Some("secrets stay out of prompts".into()),
        ..Default::default()
    });
    let f = setup(config);
    f.gateway.workspace().write(".env", "TOKEN=1").await.unwrap();

    let denied = f
        .gateway
        .invoke(&ctx("architect", 3), "read_file", json!({"path": ".env"}))
        .await;
    assert!(!denied.success);
    assert_eq!(denied.output, "");
    let error = denied.error.unwrap();
    assert!(error.starts_with("GOVERNANCE_DENIED"));
    assert!(error.contains("secrets stay out of prompts"));

    let allowed = f
        .gateway
        .invoke(&ctx("architect", 3), "read_file", json!({"path": "missing.txt"}))
        .await;
    assert!(!allowed.is_denied());
    assert_eq!(allowed.data.unwrap()["exists"], false);
}

#[test]
fn broken_deny_pattern_refuses_to_build_the_gateway() {
    let mut config = Config::default();
    config.governance.push(PolicyRule {
        name: "no-shell".into(),
        tools: vec!["run_command".into()],
        target_pattern: Some("(rm|echo".into()),
        effect: PolicyEffect::Deny,
        ..Default::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();

    let err = ToolGateway::new(db, Workspace::new(dir.path()), &config)
        .err()
        .unwrap();
    assert!(format!("{:#}", err).contains("no-shell"));
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn invalid_params_are_rejected_before_execution() {
    let f = setup(Config::default());

    let missing = f
        .gateway
        .invoke(&ToolContext::new("generator"), "write_file", json!({"path": "a.rs"}))
        .await;
    assert_eq!(missing.denial.as_ref().unwrap().code(), "INVALID_PARAMS");
    assert!(missing.error.unwrap().contains("content is required"));

    let mistyped = f
        .gateway
        .invoke(&ToolContext::new("architect"), "search_code", json!({"query": 7}))
        .await;
    assert_eq!(mistyped.denial.unwrap().code(), "INVALID_PARAMS");

    assert!(!f.gateway.workspace().resolve("a.rs").unwrap().exists());
    assert!(f.db.list_audit_for_action("write_file").unwrap().is_empty());
}

#[tokio::test]
async fn unknown_tools_are_denied() {
    let f = setup(Config::default());
    let result = f
        .gateway
        .invoke(&ToolContext::new("architect"), "delete_everything", json!({}))
        .await;
    assert_eq!(result.denial.unwrap().code(), "TOOL_NOT_FOUND");
}

#[tokio::test]
async fn executed_calls_write_exactly_one_audit_record() {
    let f = setup(Config::default());
    f.gateway.open_scope(5, false);

    f.gateway
        .invoke(&ctx("generator", 5), "write_file", json!({"path": "src/a.rs", "content": "fn a() {}"}))
        .await;
    f.gateway
        .invoke(&ctx("architect", 5), "read_file", json!({"path": "nope.rs"}))
        .await;

    let records = f.db.list_audit_for_pipeline(5).unwrap();
    assert_eq!(records.len(), 2);

    let write = records.iter().find(|r| r.action == "write_file").unwrap();
    assert_eq!(write.agent_name, "generator");
    assert_eq!(write.target, "src/a.rs");
    assert_eq!(write.decision, "executed");

    let read = records.iter().find(|r| r.action == "read_file").unwrap();
    assert_eq!(read.decision, "failed");
    assert!(read.justification.as_deref().unwrap().contains("file not found"));
}

#[tokio::test]
async fn shell_tools_append_to_the_pipeline_transcript() {
    let f = setup(Config::default());
    f.gateway.open_scope(7, false);
    f.gateway.open_scope(8, false);

    let result = f
        .gateway
        .invoke(&ctx("validator", 7), "run_command", json!({"command": "echo transcript-check"}))
        .await;
    assert!(result.success);
    assert!(result.output.contains("transcript-check"));

    let typecheck = f
        .gateway
        .invoke(&ctx("validator", 7), "typecheck", json!({}))
        .await;
    assert!(typecheck.success);
    assert_eq!(typecheck.data.unwrap()["skipped"], true);

    // Non-shell tools leave no transcript entry.
    f.gateway
        .invoke(&ctx("validator", 7), "list_directory", json!({}))
        .await;

    let transcript = f.gateway.transcript(7);
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].tool, "run_command");
    assert_eq!(transcript[0].command, "echo transcript-check");
    assert!(transcript[0].output.contains("transcript-check"));
    assert_eq!(transcript[1].tool, "typecheck");
    assert!(f.gateway.transcript(8).is_empty());
}

#[tokio::test]
async fn failing_commands_are_recorded_as_failures() {
    let f = setup(Config::default());
    f.gateway.open_scope(9, false);

    let result = f
        .gateway
        .invoke(&ctx("validator", 9), "run_command", json!({"command": "exit 4"}))
        .await;
    assert!(!result.success);
    assert!(!result.is_denied());
    assert_eq!(result.data.unwrap()["exit_code"], 4);

    let transcript = f.gateway.transcript(9);
    assert_eq!(transcript.len(), 1);
    assert!(!transcript[0].success);
    assert_eq!(f.db.list_audit_for_pipeline(9).unwrap()[0].decision, "failed");
}

#[tokio::test]
async fn paths_outside_the_workspace_fail() {
    let f = setup(Config::default());
    let result = f
        .gateway
        .invoke(
            &ToolContext::new("generator"),
            "write_file",
            json!({"path": "../escape.txt", "content": "x"}),
        )
        .await;
    assert!(!result.success);
    assert!(!result.is_denied());
    assert!(result.error.unwrap().contains("escapes the workspace"));
}

#[tokio::test]
async fn releasing_a_scope_drops_its_state() {
    let f = setup(Config::default());
    f.gateway.open_scope(11, true);
    assert!(f.gateway.has_scope(11));
    assert!(f.gateway.plan_mode(Some(11)));

    f.gateway.release_scope(11);
    assert!(!f.gateway.has_scope(11));
    assert!(!f.gateway.plan_mode(Some(11)));
    assert!(!f.gateway.plan_mode(None));
}
