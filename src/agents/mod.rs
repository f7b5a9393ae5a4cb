//! Phase agents and the runtime that drives them.
//!
//! Agents never talk to each other. They poll the blackboard, claim a task
//! they can handle, do their work through the tool and LLM gateways, and
//! hand off to the next phase through a [`PhaseCoordinator`].

mod architect;
mod evolution;
mod generator;
mod runtime;
mod stager;
mod validator;

pub use architect::ArchitectAgent;
pub use evolution::EvolutionAgent;
pub use generator::GeneratorAgent;
pub use runtime::{AgentRuntime, AgentStatus, SKIPPED_REASON};
pub use stager::StagerAgent;
pub use validator::ValidatorAgent;

use crate::db::Database;
use crate::llm::LlmGateway;
use crate::logging::{AgentLogger, LogLevelFilter};
use crate::tools::{ToolContext, ToolGateway, ToolResult};
use crate::types::{Artifact, Phase, ProposedChange, StagedChange, Task};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Pipeline-side hooks the runtime and agents call into.
pub trait PhaseCoordinator: Send + Sync {
    /// Whether a claimed task may be processed. A refusal settles the
    /// pipeline when its budget is spent.
    fn admit(&self, task: &Task) -> bool;

    /// A claimed task is about to be processed.
    fn invocation_started(&self, task: &Task);

    /// Processing of a task ended, successfully or not.
    fn invocation_finished(&self, task: &Task, duration_ms: i64);

    /// Processing of a task failed.
    fn task_failed(&self, task: &Task, reason: &str);

    /// Close the task's phase and seed `next`, if the budget allows.
    ///
    /// Returns the new seed task, if one was created.
    fn advance(&self, task: &Task, next: Option<Phase>, thought: &str) -> Result<Option<Task>>;

    /// Persist proposed file mutations for review.
    fn stage_changes(&self, task: &Task, changes: Vec<ProposedChange>) -> Result<Vec<StagedChange>>;
}

/// Services shared by every agent.
#[derive(Clone)]
pub struct AgentServices {
    pub db: Database,
    pub tools: Arc<ToolGateway>,
    pub llm: Arc<LlmGateway>,
    pub coordinator: Arc<dyn PhaseCoordinator>,
    pub protected_paths: Vec<String>,
    /// Shared by every agent logger so the level can change at runtime.
    pub log_filter: Arc<LogLevelFilter>,
}

/// Per-agent handle on the shared services.
#[derive(Clone)]
pub struct AgentContext {
    pub services: AgentServices,
    pub logger: AgentLogger,
}

impl AgentContext {
    pub fn new(services: AgentServices, agent: &str) -> Self {
        let logger = AgentLogger::new(services.db.clone(), agent)
            .with_level_filter(services.log_filter.clone());
        Self { services, logger }
    }

    pub fn agent(&self) -> &str {
        self.logger.agent()
    }

    pub fn tool_ctx(&self, task: &Task) -> ToolContext {
        ToolContext::for_task(self.agent(), task)
    }

    pub async fn invoke(&self, task: &Task, tool: &str, params: Value) -> ToolResult {
        self.services
            .tools
            .invoke(&self.tool_ctx(task), tool, params)
            .await
    }

    pub fn log(&self, task: &Task, action: &str, thought: &str, observation: Option<&str>) {
        self.logger.log(task, action, thought, observation);
    }

    pub fn add_artifact(
        &self,
        task: &Task,
        artifact_type: &str,
        name: &str,
        content: &str,
        metadata: Option<Value>,
    ) -> Result<Artifact> {
        self.services
            .db
            .add_artifact(task.id, artifact_type, name, content, self.agent(), metadata)
    }

    pub fn pipeline_id(&self, task: &Task) -> Result<i64> {
        task.pipeline_id
            .or(task.context.pipeline_id)
            .ok_or_else(|| anyhow!("Task {} does not belong to a pipeline", task.id))
    }

    /// Latest artifact of a type produced earlier in the task's pipeline.
    pub fn require_artifact(&self, task: &Task, artifact_type: &str) -> Result<Artifact> {
        let pipeline_id = self.pipeline_id(task)?;
        self.services
            .db
            .latest_pipeline_artifact(pipeline_id, artifact_type)?
            .ok_or_else(|| anyhow!("No {} artifact in pipeline {}", artifact_type, pipeline_id))
    }

    /// Hand off to the next phase and complete this task.
    pub fn finish(
        &self,
        task: &Task,
        next: Option<Phase>,
        thought: &str,
        result: Value,
    ) -> Result<()> {
        self.services.coordinator.advance(task, next, thought)?;
        self.services
            .db
            .complete_task(task.id, self.agent(), Some(&result))?;
        Ok(())
    }
}

/// A blackboard worker.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [&'static str];

    fn can_handle(&self, task: &Task) -> bool;

    async fn process(&self, task: &Task, cx: &AgentContext) -> Result<()>;
}

/// Build an agent by name.
pub fn agent_by_name(name: &str) -> Option<Arc<dyn Agent>> {
    let agent: Arc<dyn Agent> = match name {
        "architect" => Arc::new(ArchitectAgent),
        "generator" => Arc::new(GeneratorAgent),
        "validator" => Arc::new(ValidatorAgent),
        "stager" => Arc::new(StagerAgent),
        "evolution" => Arc::new(EvolutionAgent),
        _ => return None,
    };
    Some(agent)
}

/// True when the task is tagged with `phase` or explicitly assigned to `agent`.
pub(crate) fn matches_phase(task: &Task, phase: Phase, agent: &str) -> bool {
    task.phase() == Some(phase) || task.assigned_agent.as_deref() == Some(agent)
}

/// One file proposed by the generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Generator output persisted as the `code` artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedCode {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
}

impl GeneratedCode {
    pub fn from_artifact(artifact: &Artifact) -> Result<Self> {
        serde_json::from_str(&artifact.content)
            .map_err(|e| anyhow!("code artifact {} is malformed: {}", artifact.id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PipelineMode, TaskContext, TaskStatus};

    fn task(phase: Option<Phase>, assigned: Option<&str>) -> Task {
        Task {
            id: 1,
            title: "t".into(),
            description: String::new(),
            status: TaskStatus::Pending,
            assigned_agent: assigned.map(String::from),
            context: TaskContext {
                phase,
                pipeline_id: Some(1),
                mode: Some(PipelineMode::Act),
                extra: Default::default(),
            },
            depends_on: vec![],
            pipeline_id: Some(1),
            result: None,
            error: None,
            created_at: 0,
            updated_at: 0,
            claimed_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_agents_match_their_phase() {
        let design = task(Some(Phase::Design), None);
        let codegen = task(Some(Phase::Codegen), None);
        assert!(ArchitectAgent.can_handle(&design));
        assert!(!ArchitectAgent.can_handle(&codegen));
        assert!(GeneratorAgent.can_handle(&codegen));
        assert!(ArchitectAgent.can_handle(&task(None, Some("architect"))));
        assert!(ValidatorAgent.can_handle(&task(Some(Phase::Validation), None)));
        assert!(StagerAgent.can_handle(&task(Some(Phase::Staging), None)));
        assert!(EvolutionAgent.can_handle(&task(Some(Phase::Evolution), None)));
    }

    #[test]
    fn test_agent_by_name() {
        for name in crate::config::DEFAULT_AGENTS {
            assert_eq!(agent_by_name(name).unwrap().name(), name);
        }
        assert!(agent_by_name("nobody").is_none());
    }
}
