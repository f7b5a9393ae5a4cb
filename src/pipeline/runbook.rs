//! Human-readable summary of a pipeline run.

use crate::db::Database;
use crate::types::{Budget, Phase, Pipeline, PipelineMode, PipelineStatus, ReviewAction};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, Serialize)]
pub struct RunbookContext {
    pub prompt: String,
    pub mode: PipelineMode,
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_context: Option<String>,
    pub correlation_id: String,
    pub budget: Budget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub phase: Option<Phase>,
    pub agent: String,
    pub action: String,
    pub thought: String,
    pub at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub score: i64,
    pub valid: bool,
    pub gates: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalSummary {
    pub reviewer: String,
    pub applied: Vec<String>,
    pub errors: Vec<String>,
    pub at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Runbook {
    pub pipeline_id: i64,
    pub context: RunbookContext,
    pub decisions: Vec<Decision>,
    pub validation: Option<ValidationSummary>,
    pub approval: Option<ApprovalSummary>,
}

impl Runbook {
    pub fn build(db: &Database, pipeline: &Pipeline) -> Result<Self> {
        let phases: HashMap<i64, Option<Phase>> = db
            .list_tasks_for_pipeline(pipeline.id)?
            .into_iter()
            .map(|t| (t.id, t.phase()))
            .collect();

        let decisions = db
            .get_actions_for_pipeline(pipeline.id)?
            .into_iter()
            .map(|log| Decision {
                phase: phases.get(&log.task_id).copied().flatten(),
                agent: log.agent_name,
                action: log.action,
                thought: log.thought,
                at: log.created_at,
            })
            .collect();

        let validation = db
            .latest_pipeline_artifact(pipeline.id, "validation")?
            .and_then(|a| serde_json::from_str::<Value>(&a.content).ok())
            .map(|report| ValidationSummary {
                score: report.get("score").and_then(Value::as_i64).unwrap_or(0),
                valid: report.get("valid").and_then(Value::as_bool).unwrap_or(false),
                gates: report
                    .get("gates")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            });

        let approval = db
            .list_reviews(pipeline.id)?
            .into_iter()
            .rfind(|r| r.action == ReviewAction::Approve)
            .map(|r| ApprovalSummary {
                reviewer: r.reviewer,
                applied: r.files,
                errors: r.errors,
                at: r.created_at,
            });

        Ok(Self {
            pipeline_id: pipeline.id,
            context: RunbookContext {
                prompt: pipeline.prompt.clone(),
                mode: pipeline.mode,
                status: pipeline.status,
                plan_context: pipeline
                    .metadata
                    .get("plan_context")
                    .and_then(Value::as_str)
                    .map(String::from),
                correlation_id: pipeline.correlation_id.clone(),
                budget: pipeline.budget,
                error: pipeline.error.clone(),
            },
            decisions,
            validation,
            approval,
        })
    }

    pub fn to_markdown(&self) -> String {
        let ctx = &self.context;
        let mut out = format!("# Runbook: pipeline {}\n\n## Context\n", self.pipeline_id);
        let _ = writeln!(out, "- Prompt: {}", ctx.prompt);
        let _ = writeln!(out, "- Mode: {}", ctx.mode.as_str());
        let _ = writeln!(out, "- Status: {}", ctx.status.as_str());
        let _ = writeln!(out, "- Correlation: {}", ctx.correlation_id);
        let _ = writeln!(
            out,
            "- Budget: {}/{} calls, {}/{} ms{}",
            ctx.budget.used_calls,
            ctx.budget.max_calls,
            ctx.budget.used_time_ms,
            ctx.budget.max_time_ms,
            if ctx.budget.exceeded { " (exceeded)" } else { "" }
        );
        if let Some(error) = &ctx.error {
            let _ = writeln!(out, "- Error: {}", error);
        }

        out.push_str("\n## Decisions\n");
        if self.decisions.is_empty() {
            out.push_str("_none_\n");
        }
        for (i, d) in self.decisions.iter().enumerate() {
            let phase = d.phase.map(|p| p.as_str()).unwrap_or("-");
            let _ = writeln!(out, "{}. [{}] {} {}: {}", i + 1, phase, d.agent, d.action, d.thought);
        }

        out.push_str("\n## Validation\n");
        match &self.validation {
            Some(v) => {
                let _ = writeln!(out, "Score {} ({})", v.score, if v.valid { "valid" } else { "invalid" });
                for gate in &v.gates {
                    let name = gate.get("name").and_then(Value::as_str).unwrap_or("?");
                    let passed = gate.get("passed").and_then(Value::as_bool).unwrap_or(false);
                    let _ = writeln!(out, "- {} {}", if passed { "[x]" } else { "[ ]" }, name);
                }
            }
            None => out.push_str("_not run_\n"),
        }

        out.push_str("\n## Approval\n");
        match &self.approval {
            Some(a) => {
                let _ = writeln!(out, "Reviewed by {}", a.reviewer);
                for file in &a.applied {
                    let _ = writeln!(out, "- applied {}", file);
                }
                for error in &a.errors {
                    let _ = writeln!(out, "- error {}", error);
                }
            }
            None => out.push_str("_pending_\n"),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewTask, TaskContext};
    use serde_json::json;

    #[test]
    fn test_runbook_collects_decisions_validation_and_approval() {
        let db = Database::open_in_memory().unwrap();
        let pipeline = db
            .insert_pipeline("Add points", PipelineMode::Act, Budget::new(1000, 5), json!({}), "t")
            .unwrap();
        let task = db
            .create_task(NewTask {
                title: "Validate".into(),
                context: TaskContext::for_phase(Phase::Validation, pipeline.id, PipelineMode::Act),
                ..Default::default()
            })
            .unwrap();
        db.log_action(task.id, "validator", "validate", "Score 100", None).unwrap();
        db.add_artifact(
            task.id,
            "validation",
            "validation-report.json",
            r#"{"valid":true,"score":100,"gates":[{"name":"has_files","passed":true}]}"#,
            "validator",
            None,
        )
        .unwrap();
        db.record_review(pipeline.id, "ana", ReviewAction::Approve, &["a.rs".into()], &[])
            .unwrap();

        let runbook = Runbook::build(&db, &pipeline).unwrap();
        assert_eq!(runbook.decisions.len(), 1);
        assert_eq!(runbook.decisions[0].phase, Some(Phase::Validation));
        assert_eq!(runbook.validation.as_ref().unwrap().score, 100);
        assert_eq!(runbook.approval.as_ref().unwrap().applied, vec!["a.rs"]);

        let md = runbook.to_markdown();
        assert!(md.contains("1. [validation] validator validate: Score 100"));
        assert!(md.contains("- [x] has_files"));
        assert!(md.contains("Reviewed by ana"));
    }
}
