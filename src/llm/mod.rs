//! Language-model completion gateway.
//!
//! Wraps a [`CompletionClient`] with code-search context enrichment, a
//! structured reasoning call, and call metrics.

mod client;

pub use client::{Completion, CompletionClient, CompletionRequest, HttpCompletionClient};

use crate::config::LlmConfig;
use crate::db::now_ms;
use crate::tools::{ToolContext, ToolGateway};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_KEYWORDS: usize = 5;
const MIN_KEYWORD_CHARS: usize = 5;
const MAX_CONTEXT_SNIPPETS: usize = 5;

/// Per-call overrides. Unset fields use the configured defaults.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub json_mode: bool,
    /// Append code-search context to the user prompt.
    pub enrich: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            json_mode: false,
            enrich: true,
        }
    }
}

/// Structured reasoning step returned by [`LlmGateway::think`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentThought {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, alias = "actionInput")]
    pub action_input: Option<Value>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub result: Option<Value>,
}

impl AgentThought {
    /// A finished thought carrying an error instead of a result.
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            thought: format!("Reasoning failed: {}", error),
            action: None,
            action_input: None,
            finished: true,
            result: Some(json!({ "error": error })),
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.get("error"))
            .and_then(|e| e.as_str())
    }
}

/// Snapshot of gateway usage.
#[derive(Debug, Clone, Serialize)]
pub struct LlmMetrics {
    pub model: String,
    pub call_count: u64,
    pub token_count: u64,
    pub error_count: u64,
    pub last_call_at: Option<i64>,
    pub started_at: i64,
    pub uptime_ms: i64,
    pub healthy: bool,
}

/// Salient words of a prompt used as a code-search query.
///
/// Words are stripped to alphanumerics, must be longer than four chars, and
/// are deduplicated case-insensitively. At most five are kept.
pub fn extract_keywords(prompt: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for word in prompt.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if cleaned.chars().count() < MIN_KEYWORD_CHARS {
            continue;
        }
        if keywords.iter().any(|k| k.eq_ignore_ascii_case(&cleaned)) {
            continue;
        }
        keywords.push(cleaned);
        if keywords.len() == MAX_KEYWORDS {
            break;
        }
    }
    keywords
}

/// Pull a JSON object out of model output, tolerating code fences and prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// Facade over the completion service shared by all agents.
pub struct LlmGateway {
    client: Arc<dyn CompletionClient>,
    tools: Arc<ToolGateway>,
    config: LlmConfig,
    call_count: AtomicU64,
    token_count: AtomicU64,
    error_count: AtomicU64,
    last_call_at: AtomicI64,
    started_at: i64,
}

impl LlmGateway {
    pub fn new(client: Arc<dyn CompletionClient>, tools: Arc<ToolGateway>, config: LlmConfig) -> Self {
        Self {
            client,
            tools,
            config,
            call_count: AtomicU64::new(0),
            token_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_call_at: AtomicI64::new(0),
            started_at: now_ms(),
        }
    }

    /// Code-search snippets relevant to `prompt`, formatted for appending.
    ///
    /// Returns an empty string when nothing is found or the search fails.
    pub async fn enrich_with_context(&self, ctx: &ToolContext, prompt: &str) -> String {
        let keywords = extract_keywords(prompt);
        if keywords.is_empty() {
            return String::new();
        }

        let params = json!({
            "query": keywords.join("|"),
            "max_results": MAX_CONTEXT_SNIPPETS,
        });
        let result = self.tools.invoke(ctx, "search_code", params).await;
        if !result.success {
            debug!(agent = %ctx.agent, error = ?result.error, "Context enrichment skipped");
            return String::new();
        }

        let snippets: Vec<&str> = result
            .output
            .lines()
            .filter(|l| !l.trim().is_empty())
            .take(MAX_CONTEXT_SNIPPETS)
            .collect();
        if snippets.is_empty() {
            return String::new();
        }
        format!("\n\n## Relevant code in the workspace\n{}", snippets.join("\n"))
    }

    /// Single completion call returning the raw text.
    pub async fn generate(
        &self,
        ctx: &ToolContext,
        system: &str,
        user: &str,
        options: GenerateOptions,
    ) -> Result<String> {
        let mut prompt = user.to_string();
        if options.enrich && self.config.enrich_context {
            prompt.push_str(&self.enrich_with_context(ctx, user).await);
        }

        let request = CompletionRequest {
            system: system.to_string(),
            user: prompt,
            max_tokens: options.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: options.temperature.unwrap_or(self.config.temperature),
            json_mode: options.json_mode,
        };

        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.last_call_at.store(now_ms(), Ordering::Relaxed);

        match self.client.complete(request).await {
            Ok(completion) => {
                self.token_count
                    .fetch_add(completion.total_tokens, Ordering::Relaxed);
                debug!(
                    agent = %ctx.agent,
                    tokens = completion.total_tokens,
                    "Completion received"
                );
                Ok(completion.text)
            }
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(agent = %ctx.agent, error = %e, "Completion failed");
                Err(e)
            }
        }
    }

    /// Structured reasoning step. Never fails: upstream errors and
    /// unparseable responses become a finished thought carrying the error.
    pub async fn think(&self, ctx: &ToolContext, system: &str, context: &str) -> AgentThought {
        let system = format!(
            "{}\n\nRespond with a single JSON object with the keys \
             \"thought\", \"action\", \"action_input\", \"finished\" and \"result\".",
            system
        );
        let options = GenerateOptions {
            max_tokens: Some(self.config.think_max_tokens),
            temperature: None,
            json_mode: true,
            enrich: true,
        };

        let text = match self.generate(ctx, &system, context, options).await {
            Ok(text) => text,
            Err(e) => return AgentThought::failed(format!("{:#}", e)),
        };

        let parsed = match extract_json(&text) {
            Some(value) => serde_json::from_value::<AgentThought>(value)
                .map_err(|e| format!("response is not a thought: {}", e)),
            None => Err("response was not valid JSON".to_string()),
        };
        parsed.unwrap_or_else(|error| {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            AgentThought::failed(error)
        })
    }

    pub fn metrics(&self) -> LlmMetrics {
        let now = now_ms();
        let last = self.last_call_at.load(Ordering::Relaxed);
        LlmMetrics {
            model: self.client.model().to_string(),
            call_count: self.call_count.load(Ordering::Relaxed),
            token_count: self.token_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_call_at: (last > 0).then_some(last),
            started_at: self.started_at,
            uptime_ms: now - self.started_at,
            healthy: self.client.is_configured(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keywords() {
        let keywords = extract_keywords("Add a loyalty points module, with loyalty tiers and rewards");
        assert_eq!(keywords, vec!["loyalty", "points", "module", "tiers", "rewards"]);
    }

    #[test]
    fn test_extract_keywords_caps_at_five() {
        let keywords = extract_keywords("alpha bravo charlie delta echoes foxtrot");
        assert_eq!(keywords.len(), 5);
        assert_eq!(keywords[4], "echoes");
        assert!(extract_keywords("a be cat dog").is_empty());
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json(r#"{"a":1}"#).unwrap()["a"], 1);
        let fenced = "Here you go:\n```json\n{\"files\": []}\n```";
        assert!(extract_json(fenced).unwrap()["files"].is_array());
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("[1,2]").is_none());
    }

    #[test]
    fn test_thought_accepts_camel_case_action_input() {
        let thought: AgentThought =
            serde_json::from_str(r#"{"thought":"t","actionInput":{"x":1},"finished":false}"#).unwrap();
        assert_eq!(thought.action_input.unwrap()["x"], 1);
        assert!(AgentThought::failed("boom").finished);
        assert_eq!(AgentThought::failed("boom").error(), Some("boom"));
    }
}
