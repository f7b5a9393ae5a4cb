//! Validation phase: gates generated files before staging.

use super::{matches_phase, Agent, AgentContext, GeneratedCode, GeneratedFile};
use crate::tools::Workspace;
use crate::types::{Phase, Task};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

/// Outcome of one validation gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    pub name: &'static str,
    pub passed: bool,
    /// Advisory gates are reported but never block.
    pub advisory: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl GateResult {
    fn new(name: &'static str, issues: Vec<String>) -> Self {
        Self {
            name,
            passed: issues.is_empty(),
            advisory: false,
            issues,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub score: u32,
    pub gates: Vec<GateResult>,
    pub issues: Vec<String>,
}

impl ValidationReport {
    fn from_gates(gates: Vec<GateResult>) -> Self {
        let passed = gates.iter().filter(|g| g.passed).count();
        let score = if gates.is_empty() {
            0
        } else {
            (passed * 100 / gates.len()) as u32
        };
        let valid = gates.iter().all(|g| g.passed || g.advisory);
        let issues = gates
            .iter()
            .flat_map(|g| g.issues.iter().map(move |i| format!("{}: {}", g.name, i)))
            .collect();
        Self {
            valid,
            score,
            gates,
            issues,
        }
    }
}

/// Static gates over the generated files.
pub fn static_gates(files: &[GeneratedFile], workspace: &Workspace, protected: &[String]) -> Vec<GateResult> {
    let has_files = if files.is_empty() {
        vec!["no files were generated".to_string()]
    } else {
        vec![]
    };

    let mut outside = Vec::new();
    let mut guarded = Vec::new();
    let mut empty = Vec::new();
    for file in files {
        if workspace.normalize(&file.path).is_err() {
            outside.push(file.path.clone());
        } else if workspace.is_protected(&file.path, protected) {
            guarded.push(file.path.clone());
        }
        if file.content.trim().is_empty() {
            empty.push(file.path.clone());
        }
    }

    vec![
        GateResult::new("has_files", has_files),
        GateResult::new("paths_in_workspace", outside),
        GateResult::new("not_protected", guarded),
        GateResult::new("non_empty_content", empty),
    ]
}

pub struct ValidatorAgent;

#[async_trait]
impl Agent for ValidatorAgent {
    fn name(&self) -> &'static str {
        "validator"
    }

    fn display_name(&self) -> &'static str {
        "Validator"
    }

    fn capabilities(&self) -> &'static [&'static str] {
        &["validation", "typecheck"]
    }

    fn can_handle(&self, task: &Task) -> bool {
        matches_phase(task, Phase::Validation, self.name())
    }

    async fn process(&self, task: &Task, cx: &AgentContext) -> Result<()> {
        let code = GeneratedCode::from_artifact(&cx.require_artifact(task, "code")?)?;
        let mut gates = static_gates(
            &code.files,
            cx.services.tools.workspace(),
            &cx.services.protected_paths,
        );

        let typecheck = cx.invoke(task, "typecheck", json!({})).await;
        let mut typecheck_gate = GateResult::new(
            "typecheck",
            match (&typecheck.error, typecheck.success) {
                (_, true) => vec![],
                (Some(error), false) => vec![error.clone()],
                (None, false) => vec!["typecheck failed".to_string()],
            },
        );
        typecheck_gate.advisory = true;
        gates.push(typecheck_gate);

        let report = ValidationReport::from_gates(gates);
        cx.add_artifact(
            task,
            "validation",
            "validation-report.json",
            &serde_json::to_string_pretty(&report)?,
            Some(json!({ "score": report.score, "valid": report.valid })),
        )?;
        cx.log(
            task,
            "validate",
            &format!("Validation score {}", report.score),
            Some(&report.issues.join("\n")),
        );

        if !report.valid {
            bail!("validation failed: {}", report.issues.join("; "));
        }

        cx.finish(
            task,
            Some(Phase::Staging),
            &format!("Validation passed with score {}", report.score),
            json!({ "score": report.score, "valid": true }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &str) -> GeneratedFile {
        GeneratedFile {
            path: path.into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_static_gates_flag_bad_paths() {
        let ws = Workspace::new("/tmp/ws");
        let protected = vec![".git".to_string()];
        let files = vec![
            file("src/loyalty.rs", "pub struct Points;"),
            file("../escape.rs", "x"),
            file(".git/config", "x"),
            file("empty.rs", "  "),
        ];
        let gates = static_gates(&files, &ws, &protected);
        let failed: Vec<&str> = gates.iter().filter(|g| !g.passed).map(|g| g.name).collect();
        assert_eq!(failed, vec!["paths_in_workspace", "not_protected", "non_empty_content"]);

        let report = ValidationReport::from_gates(gates);
        assert!(!report.valid);
        assert_eq!(report.score, 25);
        assert_eq!(report.issues.len(), 3);
    }

    #[test]
    fn test_advisory_gate_does_not_block() {
        let ws = Workspace::new("/tmp/ws");
        let mut gates = static_gates(&[file("a.rs", "fn a() {}")], &ws, &[]);
        let mut tc = GateResult::new("typecheck", vec!["exit 1".into()]);
        tc.advisory = true;
        gates.push(tc);
        let report = ValidationReport::from_gates(gates);
        assert!(report.valid);
        assert_eq!(report.score, 80);
    }

    #[test]
    fn test_no_files_is_invalid() {
        let ws = Workspace::new("/tmp/ws");
        let report = ValidationReport::from_gates(static_gates(&[], &ws, &[]));
        assert!(!report.valid);
    }
}
