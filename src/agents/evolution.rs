//! Final phase: records what the pipeline learned.

use super::{matches_phase, Agent, AgentContext};
use crate::llm::GenerateOptions;
use crate::types::{Phase, StagedStatus, Task};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::fmt::Write as _;

const SYSTEM_PROMPT: &str = "You review finished automation runs. In a few bullet points, \
note what went well, what was rejected by reviewers, and what to do differently next time.";

pub struct EvolutionAgent;

#[async_trait]
impl Agent for EvolutionAgent {
    fn name(&self) -> &'static str {
        "evolution"
    }

    fn display_name(&self) -> &'static str {
        "Evolution"
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["evolution", "learning"]
    }

    fn can_handle(&self, task: &Task) -> bool {
        matches_phase(task, Phase::Evolution, self.name())
    }

    async fn process(&self, task: &Task, cx: &AgentContext) -> Result<()> {
        let pipeline_id = cx.pipeline_id(task)?;
        let db = &cx.services.db;

        let mut summary = format!("## Request\n{}\n\n## Decisions\n", task.description);
        for action in db.get_actions_for_pipeline(pipeline_id)? {
            let _ = writeln!(summary, "- [{}] {}: {}", action.agent_name, action.action, action.thought);
        }
        summary.push_str("\n## Staged changes\n");
        let staged = db.list_staged_changes(pipeline_id)?;
        for change in &staged {
            let _ = writeln!(summary, "- {} {}", change.file_path, change.status.as_str());
        }
        let applied = staged
            .iter()
            .filter(|c| c.status == StagedStatus::Applied)
            .count();

        let learnings = cx
            .services
            .llm
            .generate(
                &cx.tool_ctx(task),
                SYSTEM_PROMPT,
                &summary,
                GenerateOptions {
                    enrich: false,
                    ..Default::default()
                },
            )
            .await?;

        cx.add_artifact(
            task,
            "learnings",
            "learnings.md",
            &format!("# Learnings\n\n{}\n", learnings.trim()),
            Some(json!({ "staged": staged.len(), "applied": applied })),
        )?;
        cx.log(task, "learn", "Recorded learnings", None);

        cx.finish(
            task,
            None,
            &format!("Recorded learnings ({} of {} changes applied)", applied, staged.len()),
            json!({ "applied": applied }),
        )
    }
}
