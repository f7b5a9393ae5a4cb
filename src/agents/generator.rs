//! Code generation phase.

use super::{matches_phase, Agent, AgentContext, GeneratedCode};
use crate::llm::{extract_json, GenerateOptions};
use crate::types::{Phase, Task};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;

const SYSTEM_PROMPT: &str = "You are a senior engineer. Implement the specification. \
Respond with a JSON object {\"summary\": string, \"files\": [{\"path\": string, \
\"content\": string}]} where every path is relative to the workspace root and every \
content is the complete file.";

pub struct GeneratorAgent;

/// The request as shaped at creation (plan context included) plus the design.
pub fn codegen_prompt(request: &str, spec: &str) -> String {
    format!("## Request\n{}\n\n## Specification\n{}\n", request.trim(), spec)
}

#[async_trait]
impl Agent for GeneratorAgent {
    fn name(&self) -> &'static str {
        "generator"
    }

    fn display_name(&self) -> &'static str {
        "Generator"
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["codegen"]
    }

    fn can_handle(&self, task: &Task) -> bool {
        matches_phase(task, Phase::Codegen, self.name())
    }

    async fn process(&self, task: &Task, cx: &AgentContext) -> Result<()> {
        let spec = cx.require_artifact(task, "spec")?;
        let user = codegen_prompt(&task.description, &spec.content);

        let text = cx
            .services
            .llm
            .generate(
                &cx.tool_ctx(task),
                SYSTEM_PROMPT,
                &user,
                GenerateOptions {
                    json_mode: true,
                    enrich: false,
                    ..Default::default()
                },
            )
            .await?;
        let value = extract_json(&text).context("generator response contained no JSON object")?;
        let code: GeneratedCode =
            serde_json::from_value(value).context("generator response has the wrong shape")?;
        if code.files.is_empty() {
            bail!("generator produced no files");
        }

        let paths: Vec<&str> = code.files.iter().map(|f| f.path.as_str()).collect();
        cx.add_artifact(
            task,
            "code",
            "generated-files.json",
            &serde_json::to_string_pretty(&code)?,
            Some(json!({ "file_count": code.files.len() })),
        )?;
        cx.log(
            task,
            "generate",
            &format!("Generated {} file(s)", code.files.len()),
            Some(&paths.join(", ")),
        );

        let thought = if code.summary.is_empty() {
            format!("Generated {} file(s)", code.files.len())
        } else {
            code.summary.clone()
        };
        cx.finish(task, Some(Phase::Validation), &thought, json!({ "files": paths }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codegen_prompt_carries_request_and_spec() {
        let prompt = codegen_prompt(
            "Implement the following request.\n\n## Approved plan\nUse a BTreeMap ledger\n",
            "{\"summary\":\"ledger\"}",
        );
        assert!(prompt.starts_with("## Request\nImplement the following request."));
        assert!(prompt.contains("Use a BTreeMap ledger\n\n## Specification\n{\"summary\""));
    }
}
