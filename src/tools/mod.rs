//! Tool gateway and built-in tools.
//!
//! Every capability an agent can use goes through [`ToolGateway::invoke`],
//! which applies plan-mode, RBAC, governance and parameter checks before
//! running the tool and writing its audit record.

pub mod command;
pub mod files;
mod gateway;
pub mod governance;
pub mod scope;
pub mod search;

pub use files::Workspace;
pub use gateway::ToolGateway;
pub use governance::{PolicyDecision, PolicyEvaluator, PolicyRequest, RulePolicyEvaluator};
pub use scope::{Transcript, TranscriptEntry};

use crate::config::ToolsConfig;
use crate::error::Denial;
use crate::types::Task;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Who is calling a tool, and on behalf of which pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub agent: String,
    pub pipeline_id: Option<i64>,
    pub task_id: Option<i64>,
}

impl ToolContext {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            pipeline_id: None,
            task_id: None,
        }
    }

    /// Context for an agent working on a blackboard task.
    pub fn for_task(agent: impl Into<String>, task: &Task) -> Self {
        Self {
            agent: agent.into(),
            pipeline_id: task.pipeline_id.or(task.context.pipeline_id),
            task_id: Some(task.id),
        }
    }

    pub fn with_pipeline(mut self, pipeline_id: i64) -> Self {
        self.pipeline_id = Some(pipeline_id);
        self
    }
}

/// Result of a gateway invocation. Denials are reported here, not as `Err`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denial: Option<Denial>,
    pub duration_ms: i64,
}

impl ToolResult {
    pub fn denied(denial: Denial) -> Self {
        Self {
            success: false,
            output: String::new(),
            data: None,
            error: Some(denial.to_string()),
            denial: Some(denial),
            duration_ms: 0,
        }
    }

    pub fn is_denied(&self) -> bool {
        self.denial.is_some()
    }
}

/// What a tool returns from a completed run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    pub data: Option<Value>,
    /// Set when the run completed but did not succeed, e.g. a non-zero exit.
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
            error: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Shared environment handed to every tool run.
#[derive(Debug, Clone)]
pub struct ToolEnv {
    pub workspace: Workspace,
    pub config: ToolsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Boolean => "boolean",
        }
    }
}

/// Declared parameter of a tool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

impl ParamSpec {
    pub const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// Check `params` against a tool's declared parameters.
///
/// Unknown keys are ignored. Null counts as absent.
pub fn validate_params(specs: &[ParamSpec], params: &Value) -> Result<(), String> {
    let map = match params {
        Value::Object(map) => map,
        Value::Null if specs.iter().all(|s| !s.required) => return Ok(()),
        _ => return Err("params must be an object".to_string()),
    };

    for spec in specs {
        match map.get(spec.name) {
            None | Some(Value::Null) => {
                if spec.required {
                    return Err(format!("{} is required", spec.name));
                }
            }
            Some(value) => {
                if !spec.kind.matches(value) {
                    return Err(format!("{} must be a {}", spec.name, spec.kind.as_str()));
                }
            }
        }
    }
    Ok(())
}

/// Serializable tool description for listings and prompts.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub category: &'static str,
    pub read_only: bool,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
}

/// A named capability callable through the gateway.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn category(&self) -> &'static str;

    /// Read-only tools stay available in plan mode.
    fn read_only(&self) -> bool;

    fn description(&self) -> &'static str;

    fn params(&self) -> &'static [ParamSpec];

    /// Shell and verification tools append to the pipeline transcript.
    fn records_transcript(&self) -> bool {
        false
    }

    async fn execute(&self, env: &ToolEnv, params: &Value) -> anyhow::Result<ToolOutput>;

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name(),
            category: self.category(),
            read_only: self.read_only(),
            description: self.description(),
            params: self.params().to_vec(),
        }
    }
}

/// Get a string parameter.
pub fn get_string(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(|v| v.as_str()).map(String::from)
}

/// Get an integer parameter.
pub fn get_i64(params: &Value, key: &str) -> Option<i64> {
    params.get(key).and_then(|v| v.as_i64())
}

/// Get a boolean parameter.
pub fn get_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SPECS: &[ParamSpec] = &[
        ParamSpec::required("path", ParamKind::String, "file path"),
        ParamSpec::optional("max_results", ParamKind::Integer, "limit"),
    ];

    #[test]
    fn test_validate_params_accepts_valid() {
        assert!(validate_params(SPECS, &json!({"path": "a.rs"})).is_ok());
        assert!(validate_params(SPECS, &json!({"path": "a.rs", "max_results": 3})).is_ok());
        assert!(validate_params(SPECS, &json!({"path": "a.rs", "extra": true})).is_ok());
    }

    #[test]
    fn test_validate_params_rejects_missing_and_mistyped() {
        assert_eq!(
            validate_params(SPECS, &json!({})).unwrap_err(),
            "path is required"
        );
        assert_eq!(
            validate_params(SPECS, &json!({"path": null})).unwrap_err(),
            "path is required"
        );
        assert_eq!(
            validate_params(SPECS, &json!({"path": 5})).unwrap_err(),
            "path must be a string"
        );
        assert!(validate_params(SPECS, &json!("a.rs")).is_err());
    }

    #[test]
    fn test_validate_params_null_without_required() {
        let optional_only = &[ParamSpec::optional("path", ParamKind::String, "dir")];
        assert!(validate_params(optional_only, &Value::Null).is_ok());
    }
}
