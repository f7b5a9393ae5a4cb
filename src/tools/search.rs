//! Code search over the workspace.

use super::{get_i64, get_string, ParamKind, ParamSpec, Tool, ToolEnv, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex_lite::Regex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

const DEFAULT_MAX_RESULTS: usize = 20;
const SNIPPET_CHARS: usize = 200;
const SKIPPED_DIRS: &[&str] = &["target", "node_modules", "dist", "build"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchMatch {
    pub file: String,
    pub line: usize,
    pub snippet: String,
}

/// Build a case-insensitive matcher. Queries that are not valid regexes are
/// matched literally.
pub fn build_matcher(query: &str) -> Result<Regex> {
    Regex::new(&format!("(?i){}", query))
        .or_else(|_| Regex::new(&format!("(?i){}", regex_lite::escape(query))))
        .context("building search pattern")
}

fn is_skipped(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && (name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()))
}

/// Search files under `dir` and rank them by hit count, then path.
pub fn search_dir(
    root: &Path,
    dir: &Path,
    matcher: &Regex,
    max_results: usize,
    max_file_bytes: u64,
) -> Vec<SearchMatch> {
    let mut per_file: Vec<(String, Vec<SearchMatch>)> = Vec::new();

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        if entry.metadata().map(|m| m.len() > max_file_bytes).unwrap_or(true) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");

        let hits: Vec<SearchMatch> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| matcher.is_match(line))
            .map(|(idx, line)| SearchMatch {
                file: rel.clone(),
                line: idx + 1,
                snippet: crate::logging::clip(line.trim(), SNIPPET_CHARS).to_string(),
            })
            .collect();
        if !hits.is_empty() {
            per_file.push((rel, hits));
        }
    }

    per_file.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
    per_file
        .into_iter()
        .flat_map(|(_, hits)| hits)
        .take(max_results)
        .collect()
}

pub struct SearchCode;

const SEARCH_CODE_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("query", ParamKind::String, "Regex or literal text to find"),
    ParamSpec::optional("path", ParamKind::String, "Workspace-relative directory to search"),
    ParamSpec::optional("max_results", ParamKind::Integer, "Maximum matches (default: 20)"),
];

#[async_trait]
impl Tool for SearchCode {
    fn name(&self) -> &'static str {
        "search_code"
    }

    fn category(&self) -> &'static str {
        "search"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "Search workspace files and return ranked file:line matches"
    }

    fn params(&self) -> &'static [ParamSpec] {
        SEARCH_CODE_PARAMS
    }

    async fn execute(&self, env: &ToolEnv, params: &Value) -> Result<ToolOutput> {
        let query = get_string(params, "query").unwrap_or_default();
        let max_results = get_i64(params, "max_results")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let root: PathBuf = env.workspace.root().to_path_buf();
        let dir = match get_string(params, "path") {
            Some(rel) if !rel.trim().is_empty() => env.workspace.resolve(&rel)?,
            _ => root.clone(),
        };
        let matcher = build_matcher(&query)?;
        let max_file_bytes = env.config.search_max_file_bytes;

        let matches = tokio::task::spawn_blocking(move || {
            search_dir(&root, &dir, &matcher, max_results, max_file_bytes)
        })
        .await
        .context("search task panicked")?;

        let output = matches
            .iter()
            .map(|m| format!("{}:{} - {}", m.file, m.line, m.snippet))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ToolOutput::ok(output).with_data(serde_json::to_value(&matches)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_search_ranks_by_hits_and_skips_hidden() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("src/a.rs"), "fn points() {}\n").unwrap();
        std::fs::write(root.join("src/b.rs"), "// Points\nlet points = 1;\n").unwrap();
        std::fs::write(root.join(".git/config"), "points").unwrap();

        let matcher = build_matcher("points").unwrap();
        let matches = search_dir(root, root, &matcher, 10, 1024 * 1024);

        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].file, "src/b.rs");
        assert_eq!(matches[0].line, 1);
        assert_eq!(matches[2].file, "src/a.rs");
        assert!(matches.iter().all(|m| !m.file.starts_with(".git")));
    }

    #[test]
    fn test_invalid_regex_falls_back_to_literal() {
        let matcher = build_matcher("fn (").unwrap();
        assert!(matcher.is_match("pub FN (x)"));
    }
}
