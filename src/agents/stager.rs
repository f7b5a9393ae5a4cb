//! Staging phase: turns validated files into reviewable changes.

use super::{matches_phase, Agent, AgentContext, GeneratedCode, GeneratedFile};
use crate::tools::ToolResult;
use crate::types::{Phase, ProposedChange, Task};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt::Write as _;

pub struct StagerAgent;

/// Markdown plan listing what act mode would change.
pub fn implementation_plan(prompt: &str, code: &GeneratedCode, existing: &[bool]) -> String {
    let mut out = String::from("# Implementation plan\n\n");
    let _ = writeln!(out, "## Request\n{}\n", prompt.trim());
    if !code.summary.is_empty() {
        let _ = writeln!(out, "## Summary\n{}\n", code.summary);
    }
    out.push_str("## Changes\n");
    for (file, exists) in code.files.iter().zip(existing) {
        let verb = if *exists { "modify" } else { "create" };
        let _ = writeln!(out, "- {} `{}` ({} lines)", verb, file.path, file.content.lines().count());
    }
    out
}

/// Prior state of a target file as seen through `read_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Absent,
    Present(String),
    /// The file may exist but its content could not be captured.
    Unreadable(String),
}

impl Snapshot {
    pub fn exists(&self) -> bool {
        !matches!(self, Snapshot::Absent)
    }

    pub fn into_change(self, file: &GeneratedFile) -> ProposedChange {
        match self {
            Snapshot::Absent => ProposedChange::create(&file.path, &file.content),
            Snapshot::Present(original) => {
                ProposedChange::modify(&file.path, &file.content, Some(original))
            }
            Snapshot::Unreadable(_) => ProposedChange::modify(&file.path, &file.content, None),
        }
    }
}

/// Only a completed read that reports `exists: false` counts as absent.
pub fn classify_read(result: &ToolResult) -> Snapshot {
    let exists = result
        .data
        .as_ref()
        .and_then(|d| d.get("exists"))
        .and_then(Value::as_bool);
    match (result.success, exists) {
        (true, Some(true)) => Snapshot::Present(result.output.clone()),
        (false, Some(false)) if !result.is_denied() => Snapshot::Absent,
        _ => Snapshot::Unreadable(
            result
                .error
                .clone()
                .unwrap_or_else(|| "read_file returned no snapshot".to_string()),
        ),
    }
}

async fn snapshot(cx: &AgentContext, task: &Task, file: &GeneratedFile) -> Snapshot {
    let read = cx.invoke(task, "read_file", json!({ "path": file.path })).await;
    let snapshot = classify_read(&read);
    if let Snapshot::Unreadable(reason) = &snapshot {
        cx.log(
            task,
            "snapshot",
            &format!("No snapshot for {}; rollback will skip it", file.path),
            Some(reason.as_str()),
        );
    }
    snapshot
}

#[async_trait]
impl Agent for StagerAgent {
    fn name(&self) -> &'static str {
        "stager"
    }

    fn display_name(&self) -> &'static str {
        "Stager"
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["staging", "planning"]
    }

    fn can_handle(&self, task: &Task) -> bool {
        matches_phase(task, Phase::Staging, self.name())
    }

    async fn process(&self, task: &Task, cx: &AgentContext) -> Result<()> {
        let code = GeneratedCode::from_artifact(&cx.require_artifact(task, "code")?)?;

        let mut originals = Vec::with_capacity(code.files.len());
        for file in &code.files {
            originals.push(snapshot(cx, task, file).await);
        }

        if task.context.is_plan_mode() {
            let existing: Vec<bool> = originals.iter().map(Snapshot::exists).collect();
            let plan = implementation_plan(&task.description, &code, &existing);
            cx.add_artifact(
                task,
                "plan",
                "implementation_plan.md",
                &plan,
                Some(json!({ "file_count": code.files.len() })),
            )?;
            cx.log(task, "plan", "Wrote implementation plan", None);
            return cx.finish(
                task,
                Some(Phase::Evolution),
                &format!("Planned {} change(s)", code.files.len()),
                json!({ "planned": code.files.len() }),
            );
        }

        let changes: Vec<ProposedChange> = code
            .files
            .iter()
            .zip(originals)
            .map(|(file, snapshot)| snapshot.into_change(file))
            .collect();

        let staged = cx.services.coordinator.stage_changes(task, changes)?;
        let summary: Vec<Value> = staged
            .iter()
            .map(|c| json!({ "id": c.id, "file_path": c.file_path, "action": c.action.as_str() }))
            .collect();
        cx.add_artifact(
            task,
            "staging",
            "staged-changes.json",
            &serde_json::to_string_pretty(&summary)?,
            Some(json!({ "count": staged.len() })),
        )?;
        cx.log(
            task,
            "stage",
            &format!("Staged {} change(s) for review", staged.len()),
            None,
        );

        cx.finish(
            task,
            Some(Phase::Evolution),
            &format!("Staged {} change(s)", staged.len()),
            json!({ "staged": staged.len() }),
        )
    }
}
