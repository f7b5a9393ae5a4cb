//! Configuration types and structures.

use crate::logging::LogLevel;
use anyhow::{Context, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default port for the HTTP API.
pub const DEFAULT_HTTP_PORT: u16 = 31995;

/// Agents started by default, in phase order.
pub const DEFAULT_AGENTS: [&str; 5] = ["architect", "generator", "validator", "stager", "evolution"];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Root directory that tools read from and approved changes are written to.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Workspace-relative path prefixes generated code may not touch.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workspace_root: default_workspace_root(),
            protected_paths: default_protected_paths(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("agent-pipeline/pipeline.db")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_protected_paths() -> Vec<String> {
    vec![".git".to_string(), ".env".to_string(), "agent-pipeline".to_string()]
}

/// HTTP API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Interval of the status push on event streams (default: 5000).
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,

    /// Initial retry delay in milliseconds when binding fails (default: 15000).
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Jitter range in milliseconds for retry delay (default: 5000, meaning ±5s).
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    /// Maximum retry interval in milliseconds (default: 240000 = 4 minutes).
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Exponential backoff multiplier (default: 2.0).
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_http_port(),
            status_interval_ms: default_status_interval_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            retry_max_ms: default_retry_max_ms(),
            retry_multiplier: default_retry_multiplier(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_status_interval_ms() -> u64 {
    5_000
}

fn default_retry_initial_ms() -> u64 {
    15_000 // 15 seconds
}

fn default_retry_jitter_ms() -> u64 {
    5_000 // ±5 seconds
}

fn default_retry_max_ms() -> u64 {
    240_000 // 4 minutes
}

fn default_retry_multiplier() -> f64 {
    2.0
}

/// Agent runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Poll interval for each agent loop (default: 2000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Names of the agents to start.
    #[serde(default = "default_enabled_agents")]
    pub enabled: Vec<String>,

    /// Lowest level mirrored into action logs and the audit trail (default: info).
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            enabled: default_enabled_agents(),
            log_level: LogLevel::default(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_enabled_agents() -> Vec<String> {
    DEFAULT_AGENTS.iter().map(|s| s.to_string()).collect()
}

/// Default budget applied when a pipeline request carries none.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_time_ms")]
    pub max_time_ms: i64,

    #[serde(default = "default_max_calls")]
    pub max_calls: i64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_time_ms: default_max_time_ms(),
            max_calls: default_max_calls(),
        }
    }
}

fn default_max_time_ms() -> i64 {
    600_000 // 10 minutes
}

fn default_max_calls() -> i64 {
    50
}

/// Language-model completion service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Token limit for structured reasoning calls.
    #[serde(default = "default_think_max_tokens")]
    pub think_max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,

    /// Append code-search snippets to prompts before dispatch.
    #[serde(default = "default_true")]
    pub enrich_context: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            think_max_tokens: default_think_max_tokens(),
            temperature: default_temperature(),
            timeout_ms: default_llm_timeout_ms(),
            enrich_context: true,
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    8_000
}

fn default_think_max_tokens() -> u32 {
    4_000
}

fn default_temperature() -> f32 {
    0.2
}

fn default_llm_timeout_ms() -> u64 {
    120_000
}

fn default_true() -> bool {
    true
}

/// Built-in tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Timeout for shell commands (default: 60000).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Command run by the `typecheck` tool, e.g. `cargo check --quiet`.
    #[serde(default)]
    pub typecheck_command: Option<String>,

    /// Transcript size that triggers trimming (default: 500).
    #[serde(default = "default_transcript_cap")]
    pub transcript_cap: usize,

    /// Entries kept after trimming (default: 250).
    #[serde(default = "default_transcript_keep")]
    pub transcript_keep: usize,

    /// Command output kept per transcript entry (default: 5000).
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,

    /// Files larger than this are skipped by code search.
    #[serde(default = "default_search_max_file_bytes")]
    pub search_max_file_bytes: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            typecheck_command: None,
            transcript_cap: default_transcript_cap(),
            transcript_keep: default_transcript_keep(),
            max_output_chars: default_max_output_chars(),
            search_max_file_bytes: default_search_max_file_bytes(),
        }
    }
}

fn default_command_timeout_ms() -> u64 {
    60_000
}

fn default_transcript_cap() -> usize {
    500
}

fn default_transcript_keep() -> usize {
    250
}

fn default_max_output_chars() -> usize {
    5_000
}

fn default_search_max_file_bytes() -> u64 {
    512 * 1024
}

/// Outcome of a matching governance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEffect {
    Allow,
    #[default]
    Deny,
}

/// A governance rule. Empty `agents` or `tools` match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,

    #[serde(default)]
    pub agents: Vec<String>,

    #[serde(default)]
    pub tools: Vec<String>,

    /// Regex matched against the call target (path, file, or command).
    #[serde(default)]
    pub target_pattern: Option<String>,

    #[serde(default)]
    pub effect: PolicyEffect,

    #[serde(default)]
    pub reason: Option<String>,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    /// Ordered governance rules; first match wins.
    #[serde(default)]
    pub governance: Vec<PolicyRule>,

    /// Tool name to allowed agent names.
    #[serde(default)]
    pub rbac: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Load configuration from a single YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Reject settings that would otherwise be silently ignored at runtime.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.governance {
            if let Some(pattern) = &rule.target_pattern {
                Regex::new(pattern).with_context(|| {
                    format!("governance rule '{}' has an invalid target_pattern", rule.name)
                })?;
            }
        }
        Ok(())
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.http.port, DEFAULT_HTTP_PORT);
        assert_eq!(config.agents.poll_interval_ms, 2_000);
        assert_eq!(config.agents.enabled.len(), 5);
        assert_eq!(config.tools.transcript_cap, 500);
        assert_eq!(config.tools.transcript_keep, 250);
        assert_eq!(config.llm.max_tokens, 8_000);
        assert!(config.governance.is_empty());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
llm:
  model: local-model
governance:
  - name: no-secrets
    target_pattern: "\\.env$"
    reason: secrets stay put
rbac:
  write_file: [generator, stager]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.model, "local-model");
        assert_eq!(config.llm.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.governance[0].effect, PolicyEffect::Deny);
        assert_eq!(config.rbac["write_file"], vec!["generator", "stager"]);
        assert_eq!(config.budget.max_calls, 50);
        assert_eq!(config.agents.log_level, LogLevel::Info);
    }

    #[test]
    fn test_agent_log_level_and_pattern_validation() {
        let yaml = "agents:\n  log_level: warn\ngovernance:\n  - name: broken\n    target_pattern: \"[\"\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.agents.log_level, LogLevel::Warning);
        assert_eq!(config.agents.enabled.len(), 5);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(Config::default().validate().is_ok());
    }
}
