//! Pipeline state machine: phases, budget, staging review and rollback.

use super::events::{EventBus, EventKind, PipelineEvent};
use super::runbook::Runbook;
use crate::agents::PhaseCoordinator;
use crate::config::BudgetConfig;
use crate::db::{now_ms, Database};
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::tools::{ToolGateway, TranscriptEntry};
use crate::types::{
    ActionLog, Artifact, Budget, NewTask, Phase, PhaseStatus, Pipeline, PipelineMode,
    PipelineStatus, ProposedChange, ReviewAction, ReviewRecord, StagedAction, StagedChange, Task,
    TaskContext,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{info, warn};

const MIN_PROMPT_CHARS: usize = 5;
const DEFAULT_REVIEWER: &str = "api";

/// Optional per-pipeline budget override.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BudgetRequest {
    #[serde(default, alias = "maxTimeMs")]
    pub max_time_ms: Option<i64>,
    #[serde(default, alias = "maxCalls")]
    pub max_calls: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePipeline {
    pub prompt: String,
    #[serde(default)]
    pub mode: Option<PipelineMode>,
    #[serde(default, alias = "planContext")]
    pub plan_context: Option<String>,
    #[serde(default)]
    pub budget: Option<BudgetRequest>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, alias = "requestedBy")]
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default, alias = "selectedFiles")]
    pub selected_files: Option<Vec<String>>,
    #[serde(default, alias = "reviewedBy")]
    pub reviewed_by: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApproveOutcome {
    pub applied: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RejectOutcome {
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackOutcome {
    pub restored: Vec<String>,
    /// Applied rows whose prior content was not retained.
    pub unavailable: Vec<String>,
    pub errors: Vec<String>,
}

/// A pipeline with its blackboard trail.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDetails {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub tasks: Vec<Task>,
    pub staged_changes: Vec<StagedChange>,
    pub logs: Vec<ActionLog>,
    pub artifacts: Vec<Artifact>,
    pub reviews: Vec<ReviewRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    #[serde(flatten)]
    pub pipeline: Pipeline,
    pub has_pending_changes: bool,
    pub pending_staging_count: i64,
}

/// Wrap the request according to the pipeline mode.
pub fn shape_prompt(prompt: &str, mode: PipelineMode, plan_context: Option<&str>) -> String {
    let prompt = prompt.trim();
    match (mode, plan_context.map(str::trim).filter(|c| !c.is_empty())) {
        (PipelineMode::Plan, _) => format!(
            "PLANNING ONLY. Use read-only tools; do not modify any file. \
             Produce an implementation_plan.md describing the changes needed for:\n\n{}",
            prompt
        ),
        (PipelineMode::Act, Some(plan)) => format!(
            "Implement the following request, following the approved plan.\n\n\
             ## Request\n{}\n\n## Approved plan\n{}",
            prompt, plan
        ),
        (PipelineMode::Act, None) => prompt.to_string(),
    }
}

#[derive(Clone, Copy)]
enum Handoff {
    /// The chain ended: complete the pipeline, or hold it for review.
    Finish,
    /// Staging produced pending rows; evolution waits for review.
    Review,
    Seed(Phase),
    /// Pipeline already terminal; nothing to do.
    Ignore,
}

/// Terminal or review status once no further phase will run.
fn settle(pipeline: &mut Pipeline, pending: i64, now: i64) {
    if pending > 0 {
        pipeline.status = PipelineStatus::StagingReview;
    } else {
        pipeline.status = PipelineStatus::Completed;
        pipeline.completed_at = Some(now);
    }
}

/// Owns pipeline lifecycles. Agents reach it through [`PhaseCoordinator`].
pub struct Orchestrator {
    db: Database,
    tools: Arc<ToolGateway>,
    events: EventBus,
    defaults: BudgetConfig,
    /// Start of each invocation whose time is not yet in `used_time_ms`.
    in_flight: Mutex<HashMap<i64, Instant>>,
}

impl Orchestrator {
    /// Build the orchestrator and reopen tool scopes of unfinished pipelines.
    pub fn new(db: Database, tools: Arc<ToolGateway>, defaults: BudgetConfig) -> Result<Self> {
        let open = db.list_open_pipelines()?;
        for pipeline in &open {
            tools.open_scope(pipeline.id, pipeline.mode == PipelineMode::Plan);
        }
        if !open.is_empty() {
            info!(count = open.len(), "Restored pipeline scopes");
        }
        Ok(Self {
            db,
            tools,
            events: EventBus::new(),
            defaults,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn tools(&self) -> &Arc<ToolGateway> {
        &self.tools
    }

    pub fn subscribe(&self, pipeline_id: i64) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe(pipeline_id)
    }

    fn publish(&self, kind: EventKind, pipeline: &Pipeline, phase: Option<Phase>) {
        self.events.publish(PipelineEvent::new(kind, pipeline, phase));
    }

    fn require(&self, pipeline_id: i64) -> ApiResult<Pipeline> {
        self.db
            .get_pipeline(pipeline_id)?
            .ok_or_else(|| ApiError::pipeline_not_found(pipeline_id))
    }

    fn update(&self, pipeline_id: i64, f: impl FnOnce(&mut Pipeline) -> Result<()>) -> Result<Pipeline> {
        self.db
            .update_pipeline(pipeline_id, f)?
            .ok_or_else(|| ApiError::pipeline_not_found(pipeline_id).into())
    }

    // Creation

    pub fn create_pipeline(&self, request: CreatePipeline) -> ApiResult<Pipeline> {
        if request.prompt.trim().chars().count() < MIN_PROMPT_CHARS {
            return Err(ApiError::validation(
                "prompt",
                format!("prompt must be at least {} characters", MIN_PROMPT_CHARS),
            ));
        }
        let mode = request.mode.unwrap_or_default();

        let overrides = request.budget.unwrap_or_default();
        let max_time_ms = overrides.max_time_ms.unwrap_or(self.defaults.max_time_ms);
        let max_calls = overrides.max_calls.unwrap_or(self.defaults.max_calls);
        if max_time_ms <= 0 {
            return Err(ApiError::invalid_value("budget.max_time_ms", "must be positive"));
        }
        if max_calls <= 0 {
            return Err(ApiError::invalid_value("budget.max_calls", "must be positive"));
        }

        let mut metadata = match request.metadata {
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => return Err(ApiError::invalid_value("metadata", "must be an object")),
            None => json!({}),
        };
        if let Some(plan) = &request.plan_context {
            metadata["plan_context"] = json!(plan);
        }

        let requested_by = request.requested_by.as_deref().unwrap_or(DEFAULT_REVIEWER);
        let pipeline = self.db.insert_pipeline(
            request.prompt.trim(),
            mode,
            Budget::new(max_time_ms, max_calls),
            metadata,
            requested_by,
        )?;
        self.tools.open_scope(pipeline.id, mode == PipelineMode::Plan);

        let description = shape_prompt(&pipeline.prompt, mode, request.plan_context.as_deref());
        let (pipeline, _) = self.seed_phase(&pipeline, Phase::Design, None, description)?;
        info!(
            pipeline_id = pipeline.id,
            mode = mode.as_str(),
            correlation_id = %pipeline.correlation_id,
            "Pipeline created"
        );
        Ok(pipeline)
    }

    /// Create the seed task of `phase` and mark the phase running.
    fn seed_phase(
        &self,
        pipeline: &Pipeline,
        phase: Phase,
        parent: Option<i64>,
        description: String,
    ) -> Result<(Pipeline, Task)> {
        let task = self.db.create_task(NewTask {
            title: phase.seed_title().to_string(),
            description,
            assigned_agent: None,
            context: TaskContext::for_phase(phase, pipeline.id, pipeline.mode),
            depends_on: parent.into_iter().collect(),
        })?;

        let now = now_ms();
        let updated = self.update(pipeline.id, |p| {
            let record = p.phases.entry(phase).or_default();
            record.status = PhaseStatus::Running;
            record.started_at = Some(now);
            p.current_phase = Some(phase);
            p.status = PipelineStatus::Running;
            Ok(())
        })?;
        info!(pipeline_id = pipeline.id, task_id = task.id, phase = %phase, "Phase started");
        self.publish(EventKind::PhaseStarted, &updated, Some(phase));
        Ok((updated, task))
    }

    fn complete_pipeline(&self, pipeline_id: i64) -> Result<Pipeline> {
        let now = now_ms();
        let pipeline = self.update(pipeline_id, |p| {
            p.status = PipelineStatus::Completed;
            p.completed_at = Some(now);
            Ok(())
        })?;
        self.announce_settled(&pipeline);
        Ok(pipeline)
    }

    /// Events and cleanup after a pipeline stops advancing.
    fn announce_settled(&self, pipeline: &Pipeline) {
        match pipeline.status {
            PipelineStatus::Completed => {
                self.tools.release_scope(pipeline.id);
                info!(
                    pipeline_id = pipeline.id,
                    budget_exceeded = pipeline.budget.exceeded,
                    "Pipeline completed"
                );
                self.publish(EventKind::Completed, pipeline, None);
            }
            PipelineStatus::StagingReview => {
                info!(pipeline_id = pipeline.id, "Pipeline awaiting staging review");
                self.publish(EventKind::StagingReady, pipeline, pipeline.current_phase);
            }
            _ => {}
        }
    }

    /// Resume the chain once no staged row is pending.
    fn after_review(&self, pipeline_id: i64) -> Result<Pipeline> {
        let pipeline = self.require(pipeline_id)?;
        if pipeline.status != PipelineStatus::StagingReview
            || self.db.count_pending_staged(pipeline_id)? > 0
        {
            return Ok(pipeline);
        }

        let staging_task = pipeline
            .metadata
            .get("staging_task_id")
            .and_then(Value::as_i64)
            .map(|id| self.db.get_task(id))
            .transpose()?
            .flatten();

        match staging_task {
            Some(task) if pipeline.budget.has_headroom() => self
                .seed_phase(&pipeline, Phase::Evolution, Some(task.id), task.description)
                .map(|(pipeline, _)| pipeline),
            _ => {
                if !pipeline.budget.has_headroom() {
                    self.update(pipeline_id, |p| {
                        p.budget.exceeded = true;
                        Ok(())
                    })?;
                }
                self.complete_pipeline(pipeline_id)
            }
        }
    }

    // Review

    /// Apply all pending rows or the selected subset. Each write stands alone.
    pub async fn approve(&self, pipeline_id: i64, request: ApproveRequest) -> ApiResult<ApproveOutcome> {
        let pipeline = self.require(pipeline_id)?;
        if pipeline.status != PipelineStatus::StagingReview {
            return Err(ApiError::invalid_transition(
                pipeline_id,
                pipeline.status.as_str(),
                "approve",
            ));
        }
        let pending = self.db.pending_staged_changes(pipeline_id)?;
        if pending.is_empty() {
            return Err(ApiError::nothing_pending(pipeline_id));
        }

        let workspace = self.tools.workspace();
        let mut outcome = ApproveOutcome::default();

        let targets: Vec<&StagedChange> = match &request.selected_files {
            None => pending.iter().collect(),
            Some(selected) if selected.is_empty() => {
                return Err(ApiError::validation(
                    "selected_files",
                    "selected_files must name at least one file",
                ));
            }
            Some(selected) => {
                let mut targets = Vec::new();
                for name in selected {
                    let wanted = workspace.normalize(name).ok();
                    let row = pending
                        .iter()
                        .find(|c| wanted.is_some() && workspace.normalize(&c.file_path).ok() == wanted);
                    match row {
                        Some(row) if !targets.iter().any(|t: &&StagedChange| t.id == row.id) => {
                            targets.push(row)
                        }
                        Some(_) => {}
                        None => outcome
                            .errors
                            .push(format!("{}: not a pending staged change", name)),
                    }
                }
                targets
            }
        };

        for change in targets {
            if let Err(e) = workspace.write(&change.file_path, &change.content).await {
                warn!(pipeline_id, file = %change.file_path, error = %e, "Staged write failed");
                outcome.errors.push(format!("{}: {:#}", change.file_path, e));
                continue;
            }
            match self.db.mark_staged_applied(change.id) {
                Ok(seq) => {
                    info!(pipeline_id, file = %change.file_path, seq, "Staged change applied");
                    outcome.applied.push(change.file_path.clone());
                }
                Err(e) => outcome.errors.push(format!("{}: {:#}", change.file_path, e)),
            }
        }

        let reviewer = request.reviewed_by.as_deref().unwrap_or(DEFAULT_REVIEWER);
        self.db.record_review(
            pipeline_id,
            reviewer,
            ReviewAction::Approve,
            &outcome.applied,
            &outcome.errors,
        )?;
        if !outcome.errors.is_empty() {
            warn!(
                pipeline_id,
                code = ?ErrorCode::PartialApply,
                failed = outcome.errors.len(),
                "Approval applied with errors"
            );
        }

        self.after_review(pipeline_id)?;
        Ok(outcome)
    }

    /// Reject every pending row. Nothing touches the filesystem.
    pub fn reject(&self, pipeline_id: i64, reviewed_by: Option<&str>) -> ApiResult<RejectOutcome> {
        let pipeline = self.require(pipeline_id)?;
        if !matches!(
            pipeline.status,
            PipelineStatus::StagingReview | PipelineStatus::Failed
        ) {
            return Err(ApiError::invalid_transition(
                pipeline_id,
                pipeline.status.as_str(),
                "reject",
            ));
        }
        let rejected = self.db.reject_pending_staged(pipeline_id)?;
        if rejected.is_empty() {
            return Err(ApiError::nothing_pending(pipeline_id));
        }
        let files: Vec<String> = rejected.into_iter().map(|c| c.file_path).collect();
        self.db.record_review(
            pipeline_id,
            reviewed_by.unwrap_or(DEFAULT_REVIEWER),
            ReviewAction::Reject,
            &files,
            &[],
        )?;
        info!(pipeline_id, count = files.len(), "Staged changes rejected");

        self.after_review(pipeline_id)?;
        Ok(RejectOutcome { rejected: files })
    }

    /// Undo applied rows, newest application first.
    pub async fn rollback(&self, pipeline_id: i64, reviewed_by: Option<&str>) -> ApiResult<RollbackOutcome> {
        self.require(pipeline_id)?;
        let candidates = self.db.rollback_candidates(pipeline_id)?;
        if candidates.is_empty() {
            return Err(ApiError::new(
                ErrorCode::RollbackUnavailable,
                format!("Pipeline {} has no applied changes to roll back", pipeline_id),
            ));
        }

        let workspace = self.tools.workspace();
        let mut outcome = RollbackOutcome::default();
        for change in &candidates {
            let result = match (change.action, &change.original_content) {
                (StagedAction::Modify, Some(original)) => {
                    workspace.write(&change.file_path, original).await
                }
                (StagedAction::Create, _) => workspace.remove(&change.file_path).await,
                (StagedAction::Modify, None) => {
                    outcome.unavailable.push(change.file_path.clone());
                    continue;
                }
            };
            match result.and_then(|_| self.db.mark_staged_rolled_back(change.id)) {
                Ok(()) => {
                    if !outcome.restored.contains(&change.file_path) {
                        outcome.restored.push(change.file_path.clone());
                    }
                }
                Err(e) => {
                    warn!(pipeline_id, file = %change.file_path, error = %e, "Rollback write failed");
                    outcome.errors.push(format!("{}: {:#}", change.file_path, e));
                }
            }
        }

        let mut errors = outcome.errors.clone();
        errors.extend(
            outcome
                .unavailable
                .iter()
                .map(|f| format!("{}: no retained snapshot", f)),
        );
        self.db.record_review(
            pipeline_id,
            reviewed_by.unwrap_or(DEFAULT_REVIEWER),
            ReviewAction::Rollback,
            &outcome.restored,
            &errors,
        )?;

        let pipeline = self.require(pipeline_id)?;
        info!(pipeline_id, restored = outcome.restored.len(), "Pipeline rolled back");
        self.publish(EventKind::RolledBack, &pipeline, None);
        Ok(outcome)
    }

    // Queries

    pub fn get(&self, pipeline_id: i64) -> ApiResult<Pipeline> {
        self.require(pipeline_id)
    }

    pub fn details(&self, pipeline_id: i64) -> ApiResult<PipelineDetails> {
        let pipeline = self.require(pipeline_id)?;
        Ok(PipelineDetails {
            tasks: self.db.list_tasks_for_pipeline(pipeline_id)?,
            staged_changes: self.db.list_staged_changes(pipeline_id)?,
            logs: self.db.get_actions_for_pipeline(pipeline_id)?,
            artifacts: self.db.get_artifacts_for_pipeline(pipeline_id)?,
            reviews: self.db.list_reviews(pipeline_id)?,
            pipeline,
        })
    }

    pub fn list_recent(&self, limit: usize) -> ApiResult<Vec<PipelineSummary>> {
        let mut summaries = Vec::new();
        for pipeline in self.db.list_pipelines(limit)? {
            let pending = self.db.count_pending_staged(pipeline.id)?;
            summaries.push(PipelineSummary {
                pipeline,
                has_pending_changes: pending > 0,
                pending_staging_count: pending,
            });
        }
        Ok(summaries)
    }

    pub fn staging(&self, pipeline_id: i64) -> ApiResult<Vec<StagedChange>> {
        self.require(pipeline_id)?;
        Ok(self.db.list_staged_changes(pipeline_id)?)
    }

    pub fn runbook(&self, pipeline_id: i64) -> ApiResult<Runbook> {
        let pipeline = self.require(pipeline_id)?;
        Ok(Runbook::build(&self.db, &pipeline)?)
    }

    pub fn get_mode(&self, pipeline_id: i64) -> ApiResult<PipelineMode> {
        Ok(self.require(pipeline_id)?.mode)
    }

    /// Switch a running pipeline between plan and act.
    pub fn set_mode(&self, pipeline_id: i64, mode: PipelineMode) -> ApiResult<Pipeline> {
        let pipeline = self.require(pipeline_id)?;
        if pipeline.status.is_terminal() {
            return Err(ApiError::invalid_transition(
                pipeline_id,
                pipeline.status.as_str(),
                "change the mode of",
            ));
        }
        let pipeline = self.update(pipeline_id, |p| {
            p.mode = mode;
            Ok(())
        })?;
        self.tools.set_plan_mode(pipeline_id, mode == PipelineMode::Plan);
        info!(pipeline_id, mode = mode.as_str(), "Pipeline mode changed");
        Ok(pipeline)
    }

    pub fn transcript(&self, pipeline_id: i64) -> ApiResult<Vec<TranscriptEntry>> {
        self.require(pipeline_id)?;
        Ok(self.tools.transcript(pipeline_id))
    }
}

impl PhaseCoordinator for Orchestrator {
    fn admit(&self, task: &Task) -> bool {
        let Some(pipeline_id) = task.pipeline_id else {
            return true;
        };
        let pipeline = match self.db.get_pipeline(pipeline_id) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return false,
            Err(e) => {
                warn!(pipeline_id, error = %e, "Budget lookup failed; admitting task");
                return true;
            }
        };
        if pipeline.status.is_terminal() {
            return false;
        }
        if pipeline.budget.has_headroom() {
            return true;
        }

        warn!(pipeline_id, task_id = task.id, "Budget exhausted; refusing invocation");
        let phase = task.phase();
        let pending = self.db.count_pending_staged(pipeline_id).unwrap_or(0);
        let now = now_ms();
        match self.update(pipeline_id, |p| {
            p.budget.exceeded = true;
            if let Some(phase) = phase
                && let Some(record) = p.phases.get_mut(&phase)
                && record.status == PhaseStatus::Running
            {
                record.status = PhaseStatus::Pending;
                record.started_at = None;
            }
            settle(p, pending, now);
            Ok(())
        }) {
            Ok(pipeline) => self.announce_settled(&pipeline),
            Err(e) => warn!(pipeline_id, error = %e, "Failed to settle pipeline over budget"),
        }
        false
    }

    fn invocation_started(&self, task: &Task) {
        let Some(pipeline_id) = task.pipeline_id else {
            return;
        };
        self.in_flight.lock().unwrap().insert(task.id, Instant::now());
        if let Err(e) = self.db.update_pipeline(pipeline_id, |p| {
            p.budget.used_calls += 1;
            Ok(())
        }) {
            warn!(pipeline_id, error = %e, "Failed to count invocation");
        }
    }

    fn invocation_finished(&self, task: &Task, duration_ms: i64) {
        let Some(pipeline_id) = task.pipeline_id else {
            return;
        };
        self.in_flight.lock().unwrap().remove(&task.id);
        if let Err(e) = self.db.update_pipeline(pipeline_id, |p| {
            let budget = &mut p.budget;
            budget.used_time_ms += duration_ms;
            if budget.used_time_ms > budget.max_time_ms || budget.used_calls > budget.max_calls {
                budget.exceeded = true;
            }
            Ok(())
        }) {
            warn!(pipeline_id, error = %e, "Failed to record invocation time");
        }
    }

    fn task_failed(&self, task: &Task, reason: &str) {
        let Some(pipeline_id) = task.pipeline_id else {
            return;
        };
        let phase = task.phase();
        let now = now_ms();
        let message = match phase {
            Some(phase) => format!("{} failed: {}", phase, reason),
            None => format!("task {} failed: {}", task.id, reason),
        };

        let mut changed = false;
        let updated = self.db.update_pipeline(pipeline_id, |p| {
            if p.status.is_terminal() {
                return Ok(());
            }
            if let Some(phase) = phase {
                let record = p.phases.entry(phase).or_default();
                record.status = PhaseStatus::Failed;
                record.completed_at = Some(now);
                record.duration_ms = record.started_at.map(|s| now - s);
                record.error = Some(reason.to_string());
            }
            p.status = PipelineStatus::Failed;
            p.error = Some(message.clone());
            p.completed_at = Some(now);
            changed = true;
            Ok(())
        });

        match updated {
            Ok(Some(pipeline)) if changed => {
                self.tools.release_scope(pipeline_id);
                warn!(pipeline_id, task_id = task.id, error = %message, "Pipeline failed");
                self.publish(EventKind::Failed, &pipeline, phase);
            }
            Ok(_) => {}
            Err(e) => warn!(pipeline_id, error = %e, "Failed to record pipeline failure"),
        }
    }

    fn advance(&self, task: &Task, next: Option<Phase>, thought: &str) -> Result<Option<Task>> {
        let (Some(pipeline_id), Some(phase)) = (task.pipeline_id, task.phase()) else {
            return Ok(None);
        };
        let pending = self.db.count_pending_staged(pipeline_id)?;
        let now = now_ms();
        let in_flight_ms = self
            .in_flight
            .lock()
            .unwrap()
            .get(&task.id)
            .map_or(0, |started| started.elapsed().as_millis() as i64);

        let mut handoff = Handoff::Ignore;
        let pipeline = self.update(pipeline_id, |p| {
            if p.status.is_terminal() {
                return Ok(());
            }
            let record = p.phases.entry(phase).or_default();
            record.status = PhaseStatus::Completed;
            record.completed_at = Some(now);
            record.duration_ms = record.started_at.map(|s| now - s);
            record.thought = Some(thought.to_string());

            handoff = match next {
                None => Handoff::Finish,
                Some(_) if phase == Phase::Staging && pending > 0 => {
                    match p.metadata.as_object_mut() {
                        Some(map) => {
                            map.insert("staging_task_id".into(), json!(task.id));
                        }
                        None => p.metadata = json!({ "staging_task_id": task.id }),
                    }
                    Handoff::Review
                }
                Some(_) if !p.budget.has_headroom_after(in_flight_ms) => {
                    p.budget.exceeded = true;
                    Handoff::Finish
                }
                Some(next) => Handoff::Seed(next),
            };
            match handoff {
                Handoff::Finish => settle(p, pending, now),
                Handoff::Review => p.status = PipelineStatus::StagingReview,
                _ => {}
            }
            Ok(())
        })?;

        if matches!(handoff, Handoff::Ignore) {
            return Ok(None);
        }
        info!(pipeline_id, task_id = task.id, phase = %phase, "Phase completed");
        self.publish(EventKind::PhaseCompleted, &pipeline, Some(phase));

        match handoff {
            Handoff::Seed(next) => {
                let (_, seeded) =
                    self.seed_phase(&pipeline, next, Some(task.id), task.description.clone())?;
                Ok(Some(seeded))
            }
            Handoff::Finish | Handoff::Review => {
                if pipeline.budget.exceeded {
                    warn!(pipeline_id, "Budget exceeded; no further phase scheduled");
                }
                self.announce_settled(&pipeline);
                Ok(None)
            }
            Handoff::Ignore => Ok(None),
        }
    }

    fn stage_changes(&self, task: &Task, changes: Vec<ProposedChange>) -> Result<Vec<StagedChange>> {
        let Some(pipeline_id) = task.pipeline_id else {
            anyhow::bail!("Task {} does not belong to a pipeline", task.id);
        };
        let mut staged = Vec::with_capacity(changes.len());
        for change in &changes {
            staged.push(self.db.insert_staged_change(pipeline_id, change)?);
        }
        info!(pipeline_id, count = staged.len(), "Changes staged");
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_prompt_by_mode() {
        assert_eq!(shape_prompt("  Add points ", PipelineMode::Act, None), "Add points");
        assert_eq!(shape_prompt("Add points", PipelineMode::Act, Some("  ")), "Add points");

        let planned = shape_prompt("Add points", PipelineMode::Plan, None);
        assert!(planned.starts_with("PLANNING ONLY"));
        assert!(planned.contains("implementation_plan.md"));
        assert!(planned.ends_with("Add points"));

        let act = shape_prompt("Add points", PipelineMode::Act, Some("1. ledger"));
        assert!(act.contains("## Approved plan\n1. ledger"));
    }

    #[test]
    fn test_settle_prefers_review_when_rows_pending() {
        let db = Database::open_in_memory().unwrap();
        let mut p = db
            .insert_pipeline("prompt", PipelineMode::Act, Budget::new(10, 1), json!({}), "t")
            .unwrap();
        settle(&mut p, 2, 5);
        assert_eq!(p.status, PipelineStatus::StagingReview);
        assert!(p.completed_at.is_none());
        settle(&mut p, 0, 5);
        assert_eq!(p.status, PipelineStatus::Completed);
        assert_eq!(p.completed_at, Some(5));
    }
}
