//! Core types for the pipeline orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Lifecycle of a blackboard task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "claimed" => Some(TaskStatus::Claimed),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Whether the task is held by an agent.
    pub fn is_owned(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }
}

/// Pipeline phases in their fixed execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Design,
    Codegen,
    Validation,
    Staging,
    Evolution,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Design,
        Phase::Codegen,
        Phase::Validation,
        Phase::Staging,
        Phase::Evolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Design => "design",
            Phase::Codegen => "codegen",
            Phase::Validation => "validation",
            Phase::Staging => "staging",
            Phase::Evolution => "evolution",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "design" => Some(Phase::Design),
            "codegen" => Some(Phase::Codegen),
            "validation" => Some(Phase::Validation),
            "staging" => Some(Phase::Staging),
            "evolution" => Some(Phase::Evolution),
            _ => None,
        }
    }

    /// The phase that follows this one, if any.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Design => Some(Phase::Codegen),
            Phase::Codegen => Some(Phase::Validation),
            Phase::Validation => Some(Phase::Staging),
            Phase::Staging => Some(Phase::Evolution),
            Phase::Evolution => None,
        }
    }

    /// Title given to the seed task of this phase.
    pub fn seed_title(&self) -> &'static str {
        match self {
            Phase::Design => "Design specification",
            Phase::Codegen => "Generate code",
            Phase::Validation => "Validate generated code",
            Phase::Staging => "Stage changes for review",
            Phase::Evolution => "Record learnings",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured task context: the phase tag plus arbitrary metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PipelineMode>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskContext {
    pub fn for_phase(phase: Phase, pipeline_id: i64, mode: PipelineMode) -> Self {
        Self {
            phase: Some(phase),
            pipeline_id: Some(pipeline_id),
            mode: Some(mode),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn is_plan_mode(&self) -> bool {
        self.mode == Some(PipelineMode::Plan)
    }
}

/// A task on the blackboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub context: TaskContext,
    pub depends_on: Vec<i64>,
    pub pipeline_id: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub claimed_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn phase(&self) -> Option<Phase> {
        self.context.phase
    }
}

/// Input for creating a blackboard task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub assigned_agent: Option<String>,
    pub context: TaskContext,
    pub depends_on: Vec<i64>,
}

/// An append-only output attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub task_id: i64,
    pub artifact_type: String,
    pub name: String,
    pub content: String,
    pub created_by: String,
    pub metadata: Value,
    pub created_at: i64,
}

/// One step of agent reasoning recorded against a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: i64,
    pub task_id: i64,
    pub agent_name: String,
    pub action: String,
    pub thought: String,
    pub observation: Option<String>,
    pub created_at: i64,
}

/// Whether a pipeline may mutate the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Plan,
    #[default]
    Act,
}

impl PipelineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineMode::Plan => "plan",
            PipelineMode::Act => "act",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(PipelineMode::Plan),
            "act" => Some(PipelineMode::Act),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Queued,
    Running,
    StagingReview,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Queued => "queued",
            PipelineStatus::Running => "running",
            PipelineStatus::StagingReview => "staging_review",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(PipelineStatus::Queued),
            "running" => Some(PipelineStatus::Running),
            "staging_review" => Some(PipelineStatus::StagingReview),
            "completed" => Some(PipelineStatus::Completed),
            "failed" => Some(PipelineStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStatus::Completed | PipelineStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-phase progress record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type PhaseMap = BTreeMap<Phase, PhaseRecord>;

/// Fresh phase map with every phase pending.
pub fn initial_phases() -> PhaseMap {
    Phase::ALL
        .iter()
        .map(|p| (*p, PhaseRecord::default()))
        .collect()
}

/// Soft resource cap for a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_time_ms: i64,
    pub max_calls: i64,
    #[serde(default)]
    pub used_time_ms: i64,
    #[serde(default)]
    pub used_calls: i64,
    #[serde(default)]
    pub exceeded: bool,
}

impl Budget {
    pub fn new(max_time_ms: i64, max_calls: i64) -> Self {
        Self {
            max_time_ms,
            max_calls,
            used_time_ms: 0,
            used_calls: 0,
            exceeded: false,
        }
    }

    /// Whether another agent invocation may be scheduled.
    pub fn has_headroom(&self) -> bool {
        self.has_headroom_after(0)
    }

    /// Like [`Budget::has_headroom`], counting `in_flight_ms` not yet recorded.
    pub fn has_headroom_after(&self, in_flight_ms: i64) -> bool {
        !self.exceeded
            && self.used_time_ms + in_flight_ms < self.max_time_ms
            && self.used_calls < self.max_calls
    }
}

/// A pipeline run from prompt to reviewed changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: i64,
    pub prompt: String,
    pub mode: PipelineMode,
    pub status: PipelineStatus,
    pub current_phase: Option<Phase>,
    pub phases: PhaseMap,
    pub budget: Budget,
    pub correlation_id: String,
    pub metadata: Value,
    pub requested_by: String,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedAction {
    Create,
    Modify,
}

impl StagedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedAction::Create => "create",
            StagedAction::Modify => "modify",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "create" => Some(StagedAction::Create),
            "modify" => Some(StagedAction::Modify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagedStatus {
    Pending,
    Applied,
    Rejected,
}

impl StagedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedStatus::Pending => "pending",
            StagedStatus::Applied => "applied",
            StagedStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StagedStatus::Pending),
            "applied" => Some(StagedStatus::Applied),
            "rejected" => Some(StagedStatus::Rejected),
            _ => None,
        }
    }
}

/// A proposed file mutation held for review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedChange {
    pub id: i64,
    pub pipeline_id: i64,
    pub file_path: String,
    pub action: StagedAction,
    /// Snapshot of the file before the change; `None` when the file did not exist.
    pub original_content: Option<String>,
    pub content: String,
    pub status: StagedStatus,
    pub applied_at: Option<i64>,
    /// Order in which rows were applied across the pipeline.
    pub apply_seq: Option<i64>,
    pub rolled_back_at: Option<i64>,
    pub created_at: i64,
}

/// Input for staging a file mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedChange {
    pub file_path: String,
    pub action: StagedAction,
    pub content: String,
    pub original_content: Option<String>,
}

impl ProposedChange {
    /// A file that did not exist before the change.
    pub fn create(file_path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            action: StagedAction::Create,
            content: content.into(),
            original_content: None,
        }
    }

    /// A change to an existing file. `original` is `None` when it could not be read.
    pub fn modify(
        file_path: impl Into<String>,
        content: impl Into<String>,
        original: Option<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            action: StagedAction::Modify,
            content: content.into(),
            original_content: original,
        }
    }
}

/// Append-only governance audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub agent_name: String,
    pub action: String,
    pub target: String,
    pub decision: String,
    pub justification: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub task_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub created_at: i64,
}

/// Input for appending an audit row.
#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    pub agent_name: String,
    pub action: String,
    pub target: String,
    pub decision: String,
    pub justification: Option<String>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub task_id: Option<i64>,
    pub pipeline_id: Option<i64>,
}

/// Persisted tool metadata used for RBAC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRegistryEntry {
    pub name: String,
    pub category: String,
    pub read_only: bool,
    pub description: String,
    /// `None` or empty means any agent may call the tool.
    pub allowed_agents: Option<Vec<String>>,
}

impl ToolRegistryEntry {
    pub fn permits(&self, agent: &str) -> bool {
        match &self.allowed_agents {
            None => true,
            Some(list) if list.is_empty() => true,
            Some(list) => list.iter().any(|a| a == agent || a == "*"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    Rollback,
}

impl ReviewAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewAction::Approve => "approve",
            ReviewAction::Reject => "reject",
            ReviewAction::Rollback => "rollback",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(ReviewAction::Approve),
            "reject" => Some(ReviewAction::Reject),
            "rollback" => Some(ReviewAction::Rollback),
            _ => None,
        }
    }
}

/// A human decision over a pipeline's staged changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: i64,
    pub pipeline_id: i64,
    pub reviewer: String,
    pub action: ReviewAction,
    pub files: Vec<String>,
    pub errors: Vec<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_phase_order() {
        let mut phase = Phase::Design;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            seen.push(next);
            phase = next;
        }
        assert_eq!(seen, Phase::ALL.to_vec());
    }

    #[test]
    fn test_task_context_flattens_metadata() {
        let ctx = TaskContext::for_phase(Phase::Codegen, 7, PipelineMode::Act)
            .with_extra("attempt", json!(2));
        let value = serde_json::to_value(&ctx).unwrap();
        assert_eq!(value["phase"], "codegen");
        assert_eq!(value["pipeline_id"], 7);
        assert_eq!(value["attempt"], 2);

        let back: TaskContext = serde_json::from_value(value).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_budget_headroom() {
        let mut budget = Budget::new(1_000, 1);
        assert!(budget.has_headroom());
        budget.used_calls = 1;
        assert!(!budget.has_headroom());

        let mut budget = Budget::new(1_000, 10);
        budget.used_time_ms = 1_000;
        assert!(!budget.has_headroom());

        let mut budget = Budget::new(1_000, 10);
        budget.used_time_ms = 600;
        assert!(budget.has_headroom_after(399));
        assert!(!budget.has_headroom_after(400));
    }

    #[test]
    fn test_registry_entry_permits() {
        let mut entry = ToolRegistryEntry {
            name: "write_file".into(),
            category: "files".into(),
            read_only: false,
            description: String::new(),
            allowed_agents: None,
        };
        assert!(entry.permits("anyone"));

        entry.allowed_agents = Some(vec![]);
        assert!(entry.permits("anyone"));

        entry.allowed_agents = Some(vec!["generator".into()]);
        assert!(entry.permits("generator"));
        assert!(!entry.permits("architect"));

        entry.allowed_agents = Some(vec!["*".into()]);
        assert!(entry.permits("architect"));
    }

    #[test]
    fn test_phase_map_serializes_with_phase_keys() {
        let phases = initial_phases();
        let value = serde_json::to_value(&phases).unwrap();
        assert_eq!(value["design"]["status"], "pending");
        assert_eq!(value["evolution"]["status"], "pending");
    }
}
