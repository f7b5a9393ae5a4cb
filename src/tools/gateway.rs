//! The single invocation point for agent tools.

use super::command::{RunCommand, Typecheck};
use super::files::{ListDirectory, ReadFile, WriteFile};
use super::scope::{PipelineScope, TranscriptEntry};
use super::search::SearchCode;
use super::{
    validate_params, PolicyDecision, PolicyEvaluator, PolicyRequest, RulePolicyEvaluator, Tool,
    ToolContext, ToolDescriptor, ToolEnv, ToolResult, Workspace,
};
use crate::config::{Config, ToolsConfig};
use crate::db::{now_ms, Database};
use crate::error::Denial;
use crate::logging::clip;
use crate::types::{AuditEntry, PipelineMode};
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Tool registry plus per-pipeline plan-mode and transcript state.
pub struct ToolGateway {
    db: Database,
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
    env: ToolEnv,
    policy: Arc<dyn PolicyEvaluator>,
    scopes: Mutex<HashMap<i64, PipelineScope>>,
}

/// The value governance sees as the target of a call.
fn call_target(params: &Value, tool: &str) -> String {
    ["path", "file", "command"]
        .iter()
        .find_map(|key| params.get(*key).and_then(|v| v.as_str()))
        .unwrap_or(tool)
        .to_string()
}

impl ToolGateway {
    /// Gateway with the built-in tools and the configured governance rules.
    pub fn new(db: Database, workspace: Workspace, config: &Config) -> Result<Self> {
        let mut gateway = Self {
            db,
            tools: BTreeMap::new(),
            env: ToolEnv {
                workspace,
                config: config.tools.clone(),
            },
            policy: Arc::new(RulePolicyEvaluator::new(&config.governance)?),
            scopes: Mutex::new(HashMap::new()),
        };
        gateway.register(Arc::new(ReadFile));
        gateway.register(Arc::new(WriteFile));
        gateway.register(Arc::new(ListDirectory));
        gateway.register(Arc::new(SearchCode));
        gateway.register(Arc::new(RunCommand));
        gateway.register(Arc::new(Typecheck));
        Ok(gateway)
    }

    /// Replace the governance evaluator.
    pub fn with_policy(mut self, policy: Arc<dyn PolicyEvaluator>) -> Self {
        self.policy = policy;
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn workspace(&self) -> &Workspace {
        &self.env.workspace
    }

    pub fn tools_config(&self) -> &ToolsConfig {
        &self.env.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Persist every registered tool and apply RBAC lists.
    pub fn sync_registry(&self, rbac: &BTreeMap<String, Vec<String>>) -> Result<()> {
        for tool in self.tools.values() {
            self.db
                .upsert_tool(tool.name(), tool.category(), tool.read_only(), tool.description())?;
        }
        for (name, agents) in rbac {
            self.db.set_tool_allowed_agents(name, Some(agents.as_slice()))?;
        }
        info!(tools = self.tools.len(), rbac_rules = rbac.len(), "Tool registry synced");
        Ok(())
    }

    // Pipeline scopes

    /// Create the gateway state of a pipeline.
    pub fn open_scope(&self, pipeline_id: i64, plan_mode: bool) {
        let scope = PipelineScope::new(
            plan_mode,
            self.env.config.transcript_cap,
            self.env.config.transcript_keep,
        );
        self.scopes.lock().unwrap().insert(pipeline_id, scope);
    }

    /// Drop the gateway state of a finished pipeline.
    pub fn release_scope(&self, pipeline_id: i64) {
        if self.scopes.lock().unwrap().remove(&pipeline_id).is_some() {
            debug!(pipeline_id, "Released tool scope");
        }
    }

    pub fn has_scope(&self, pipeline_id: i64) -> bool {
        self.scopes.lock().unwrap().contains_key(&pipeline_id)
    }

    pub fn set_plan_mode(&self, pipeline_id: i64, plan_mode: bool) {
        let mut scopes = self.scopes.lock().unwrap();
        match scopes.get_mut(&pipeline_id) {
            Some(scope) => scope.plan_mode = plan_mode,
            None => {
                scopes.insert(
                    pipeline_id,
                    PipelineScope::new(
                        plan_mode,
                        self.env.config.transcript_cap,
                        self.env.config.transcript_keep,
                    ),
                );
            }
        }
    }

    /// Plan flag of a pipeline; calls outside any pipeline are never in plan mode.
    pub fn plan_mode(&self, pipeline_id: Option<i64>) -> bool {
        let Some(id) = pipeline_id else {
            return false;
        };
        self.scopes
            .lock()
            .unwrap()
            .get(&id)
            .map(|s| s.plan_mode)
            .unwrap_or(false)
    }

    pub fn transcript(&self, pipeline_id: i64) -> Vec<TranscriptEntry> {
        self.scopes
            .lock()
            .unwrap()
            .get(&pipeline_id)
            .map(|s| s.transcript.entries())
            .unwrap_or_default()
    }

    fn append_transcript(&self, pipeline_id: i64, entry: TranscriptEntry) {
        if let Some(scope) = self.scopes.lock().unwrap().get_mut(&pipeline_id) {
            scope.transcript.push(entry);
        }
    }

    // Listings

    /// Tools usable in a mode. Plan mode hides mutating tools.
    pub fn tools_for_mode(&self, mode: PipelineMode) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .filter(|t| mode == PipelineMode::Act || t.read_only())
            .map(|t| t.descriptor())
            .collect()
    }

    /// Markdown catalogue of the tools usable in a mode, grouped by category.
    pub fn describe_tools(&self, mode: PipelineMode) -> String {
        let mut by_category: BTreeMap<&str, Vec<ToolDescriptor>> = BTreeMap::new();
        for descriptor in self.tools_for_mode(mode) {
            by_category
                .entry(descriptor.category)
                .or_default()
                .push(descriptor);
        }

        let mut out = String::from("## Available tools\n");
        for (category, tools) in by_category {
            let _ = writeln!(out, "\n### {}", category);
            for tool in tools {
                let access = if tool.read_only { "read-only" } else { "mutating" };
                let _ = writeln!(out, "\n#### {} ({})\n{}", tool.name, access, tool.description);
                for param in &tool.params {
                    let need = if param.required { "required" } else { "optional" };
                    let _ = writeln!(
                        out,
                        "- `{}` ({}, {}): {}",
                        param.name,
                        param.kind.as_str(),
                        need,
                        param.description
                    );
                }
            }
        }
        out
    }

    // Invocation

    fn rbac_allows(&self, tool: &str, agent: &str) -> bool {
        match self.db.get_tool_entry(tool) {
            Ok(Some(entry)) => entry.permits(agent),
            Ok(None) => true,
            Err(e) => {
                warn!(tool, agent, error = %e, "RBAC lookup failed; allowing call");
                true
            }
        }
    }

    /// Run a tool after plan-mode, RBAC, governance and parameter checks.
    ///
    /// A denied call has no side effects. An executed call writes exactly
    /// one audit record.
    pub async fn invoke(&self, ctx: &ToolContext, tool_name: &str, params: Value) -> ToolResult {
        let Some(tool) = self.tools.get(tool_name).cloned() else {
            return self.deny(ctx, Denial::ToolNotFound {
                tool: tool_name.to_string(),
            });
        };

        if !tool.read_only() && self.plan_mode(ctx.pipeline_id) {
            return self.deny(ctx, Denial::PlanModeBlocked {
                tool: tool_name.to_string(),
            });
        }

        if !self.rbac_allows(tool_name, &ctx.agent) {
            return self.deny(ctx, Denial::RbacDenied {
                agent: ctx.agent.clone(),
                tool: tool_name.to_string(),
            });
        }

        let target = call_target(&params, tool_name);
        let request = PolicyRequest {
            agent: &ctx.agent,
            tool: tool_name,
            target: &target,
            params: &params,
        };
        if let PolicyDecision::Deny { policy, reason } = self.policy.evaluate(&request).await {
            return self.deny(ctx, Denial::GovernanceDenied { policy, reason });
        }

        if let Err(reason) = validate_params(tool.params(), &params) {
            return self.deny(ctx, Denial::InvalidParams { reason });
        }

        let started = Instant::now();
        let outcome = tool.execute(&self.env, &params).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let result = match outcome {
            Ok(output) => ToolResult {
                success: output.success,
                output: output.output,
                data: output.data,
                error: output.error,
                denial: None,
                duration_ms,
            },
            Err(e) => ToolResult {
                success: false,
                output: String::new(),
                data: None,
                error: Some(format!("{:#}", e)),
                denial: None,
                duration_ms,
            },
        };

        debug!(
            agent = %ctx.agent,
            tool = tool_name,
            pipeline_id = ?ctx.pipeline_id,
            success = result.success,
            duration_ms,
            "Tool executed"
        );

        if tool.records_transcript()
            && let Some(pipeline_id) = ctx.pipeline_id
        {
            let command = params
                .get("command")
                .and_then(|v| v.as_str())
                .unwrap_or(tool_name)
                .to_string();
            let mut output = result.output.clone();
            if let Some(error) = &result.error {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(error);
            }
            self.append_transcript(
                pipeline_id,
                TranscriptEntry {
                    tool: tool_name.to_string(),
                    agent: ctx.agent.clone(),
                    command,
                    output: clip(&output, self.env.config.max_output_chars).to_string(),
                    success: result.success,
                    timestamp: now_ms(),
                },
            );
        }

        let entry = AuditEntry {
            agent_name: ctx.agent.clone(),
            action: tool_name.to_string(),
            target,
            decision: if result.success { "executed" } else { "failed" }.to_string(),
            justification: match &result.error {
                Some(error) => Some(error.clone()),
                None => Some(format!("completed in {}ms", duration_ms)),
            },
            input: Some(params),
            output: Some(json!({ "success": result.success, "duration_ms": duration_ms })),
            task_id: ctx.task_id,
            pipeline_id: ctx.pipeline_id,
        };
        if let Err(e) = self.db.record_audit(&entry) {
            warn!(tool = tool_name, error = %e, "Failed to write audit record");
        }

        result
    }

    fn deny(&self, ctx: &ToolContext, denial: Denial) -> ToolResult {
        warn!(
            agent = %ctx.agent,
            pipeline_id = ?ctx.pipeline_id,
            code = denial.code(),
            "Tool call denied: {}",
            denial
        );
        ToolResult::denied(denial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_target_prefers_path_then_file_then_command() {
        assert_eq!(call_target(&json!({"path": "a", "command": "c"}), "t"), "a");
        assert_eq!(call_target(&json!({"file": "f"}), "t"), "f");
        assert_eq!(call_target(&json!({"command": "ls"}), "t"), "ls");
        assert_eq!(call_target(&json!({}), "typecheck"), "typecheck");
    }
}
