//! Design phase: turns the prompt into a specification.

use super::{matches_phase, Agent, AgentContext};
use crate::llm::{extract_json, extract_keywords, GenerateOptions};
use crate::types::{Phase, PipelineMode, Task};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

const SYSTEM_PROMPT: &str = "You are a software architect. Given a feature request and \
excerpts of the existing code base, write a concise technical specification as a JSON \
object with the keys \"summary\", \"components\", \"files\" (paths to create or modify) \
and \"risks\".";

pub struct ArchitectAgent;

#[async_trait]
impl Agent for ArchitectAgent {
    fn name(&self) -> &'static str {
        "architect"
    }

    fn display_name(&self) -> &'static str {
        "Architect"
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["design", "code_search", "specification"]
    }

    fn can_handle(&self, task: &Task) -> bool {
        matches_phase(task, Phase::Design, self.name())
    }

    async fn process(&self, task: &Task, cx: &AgentContext) -> Result<()> {
        let keywords = extract_keywords(&task.description);
        let mut code_context = String::new();
        if !keywords.is_empty() {
            let query: Vec<&str> = keywords.iter().take(3).map(String::as_str).collect();
            let search = cx
                .invoke(task, "search_code", json!({ "query": query.join("|"), "max_results": 10 }))
                .await;
            if search.success {
                code_context = search.output;
            }
            cx.log(
                task,
                "search_code",
                &format!("Searching the workspace for {}", query.join(", ")),
                Some(if code_context.is_empty() { "no matches" } else { &code_context }),
            );
        }

        let listing = cx.invoke(task, "list_directory", json!({ "path": "." })).await;
        let project_context = if listing.success {
            listing.output
        } else {
            String::new()
        };

        let mode = task.context.mode.unwrap_or_default();
        let mut user = format!("## Feature request\n{}\n", task.description);
        if !project_context.is_empty() {
            user.push_str(&format!("\n## Workspace layout\n{}\n", project_context));
        }
        if !code_context.is_empty() {
            user.push_str(&format!("\n## Matching code\n{}\n", code_context));
        }
        user.push('\n');
        user.push_str(&cx.services.tools.describe_tools(mode));

        let text = cx
            .services
            .llm
            .generate(
                &cx.tool_ctx(task),
                SYSTEM_PROMPT,
                &user,
                GenerateOptions {
                    json_mode: true,
                    ..Default::default()
                },
            )
            .await?;
        let spec = extract_json(&text).unwrap_or_else(|| json!({ "raw": text }));
        let summary = spec
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("Specification drafted")
            .to_string();

        cx.add_artifact(
            task,
            "spec",
            "specification.json",
            &serde_json::to_string_pretty(&spec)?,
            Some(json!({ "version": 1, "has_context": !code_context.is_empty() })),
        )?;
        cx.add_artifact(
            task,
            "doc",
            "project-context.md",
            &format!("# Project context\n\n```\n{}\n```\n", project_context),
            None,
        )?;
        cx.log(task, "specification", &summary, None);

        let thought = match mode {
            PipelineMode::Plan => format!("Planned design: {}", summary),
            PipelineMode::Act => summary,
        };
        cx.finish(task, Some(Phase::Codegen), &thought, json!({ "spec": spec }))
    }
}
