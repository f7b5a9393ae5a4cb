//! Governance policy evaluation for tool calls.

use crate::config::{PolicyEffect, PolicyRule};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde_json::Value;

/// A tool call presented to the policy evaluator.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRequest<'a> {
    pub agent: &'a str,
    pub tool: &'a str,
    pub target: &'a str,
    pub params: &'a Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { policy: String, reason: String },
}

/// Decides whether an agent may perform a tool call on a target.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, request: &PolicyRequest<'_>) -> PolicyDecision;
}

struct CompiledRule {
    rule: PolicyRule,
    target: Option<Regex>,
}

impl CompiledRule {
    fn matches(&self, request: &PolicyRequest<'_>) -> bool {
        let agent_ok =
            self.rule.agents.is_empty() || self.rule.agents.iter().any(|a| a == request.agent || a == "*");
        let tool_ok =
            self.rule.tools.is_empty() || self.rule.tools.iter().any(|t| t == request.tool || t == "*");
        let target_ok = self
            .target
            .as_ref()
            .is_none_or(|re| re.is_match(request.target));
        agent_ok && tool_ok && target_ok
    }
}

/// Evaluates the configured rule list. The first matching rule decides;
/// no match allows.
pub struct RulePolicyEvaluator {
    rules: Vec<CompiledRule>,
}

impl RulePolicyEvaluator {
    /// Compile every rule. A pattern that does not compile is an error.
    pub fn new(rules: &[PolicyRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let target = rule
                    .target_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .with_context(|| {
                        format!("governance rule '{}' has an invalid target_pattern", rule.name)
                    })?;
                Ok(CompiledRule {
                    rule: rule.clone(),
                    target,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[async_trait]
impl PolicyEvaluator for RulePolicyEvaluator {
    async fn evaluate(&self, request: &PolicyRequest<'_>) -> PolicyDecision {
        let Some(compiled) = self.rules.iter().find(|r| r.matches(request)) else {
            return PolicyDecision::Allow;
        };
        match compiled.rule.effect {
            PolicyEffect::Allow => PolicyDecision::Allow,
            PolicyEffect::Deny => PolicyDecision::Deny {
                policy: compiled.rule.name.clone(),
                reason: compiled
                    .rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("denied by policy {}", compiled.rule.name)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(name: &str, effect: PolicyEffect) -> PolicyRule {
        PolicyRule {
            name: name.into(),
            effect,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let mut allow_docs = rule("allow-docs", PolicyEffect::Allow);
        allow_docs.target_pattern = Some(r"^docs/".into());
        let mut deny_writes = rule("no-writes", PolicyEffect::Deny);
        deny_writes.tools = vec!["write_file".into()];

        let evaluator = RulePolicyEvaluator::new(&[allow_docs, deny_writes]).unwrap();
        let params = json!({});

        let docs = PolicyRequest {
            agent: "generator",
            tool: "write_file",
            target: "docs/readme.md",
            params: &params,
        };
        assert_eq!(evaluator.evaluate(&docs).await, PolicyDecision::Allow);

        let src = PolicyRequest {
            target: "src/lib.rs",
            ..docs
        };
        match evaluator.evaluate(&src).await {
            PolicyDecision::Deny { policy, .. } => assert_eq!(policy, "no-writes"),
            other => panic!("expected deny, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_agent_filter_and_no_match() {
        let mut deny = rule("architect-readonly", PolicyEffect::Deny);
        deny.agents = vec!["architect".into()];
        deny.reason = Some("architects only read".into());
        let evaluator = RulePolicyEvaluator::new(&[deny]).unwrap();
        let params = json!({});

        let request = PolicyRequest {
            agent: "generator",
            tool: "run_command",
            target: "ls",
            params: &params,
        };
        assert_eq!(evaluator.evaluate(&request).await, PolicyDecision::Allow);

        let request = PolicyRequest {
            agent: "architect",
            ..request
        };
        assert_eq!(
            evaluator.evaluate(&request).await,
            PolicyDecision::Deny {
                policy: "architect-readonly".into(),
                reason: "architects only read".into(),
            }
        );
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let mut bad = rule("no-shell", PolicyEffect::Deny);
        bad.target_pattern = Some("(rm|echo".into());
        let err = RulePolicyEvaluator::new(&[bad, rule("ok", PolicyEffect::Deny)])
            .err()
            .unwrap();
        assert!(err.to_string().contains("no-shell"));

        let evaluator = RulePolicyEvaluator::new(&[rule("ok", PolicyEffect::Deny)]).unwrap();
        assert_eq!(evaluator.len(), 1);
    }
}
