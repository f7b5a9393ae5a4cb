//! Workspace file access and the file tools.

use super::{get_string, ParamKind, ParamSpec, Tool, ToolEnv, ToolOutput};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};

/// Directory tree that tools and approved changes are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a workspace-relative path, rejecting anything that escapes the root.
    pub fn normalize(&self, rel: &str) -> Result<PathBuf> {
        let rel = rel.trim();
        if rel.is_empty() {
            bail!("path is empty");
        }
        let path = Path::new(rel);
        let path = if path.is_absolute() {
            match path.strip_prefix(&self.root) {
                Ok(stripped) => stripped,
                Err(_) => bail!("path {} is outside the workspace", rel),
            }
        } else {
            path
        };

        let mut normalized = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        bail!("path {} escapes the workspace", rel);
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    bail!("path {} is outside the workspace", rel)
                }
            }
        }
        Ok(normalized)
    }

    /// Absolute location of a workspace-relative path.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        Ok(self.root.join(self.normalize(rel)?))
    }

    /// Whether `rel` falls under one of the protected prefixes.
    pub fn is_protected(&self, rel: &str, protected: &[String]) -> bool {
        let Ok(path) = self.normalize(rel) else {
            return true;
        };
        protected
            .iter()
            .filter_map(|p| self.normalize(p).ok())
            .any(|prefix| path.starts_with(&prefix))
    }

    /// Read a file, returning `None` if it does not exist.
    pub async fn read(&self, rel: &str) -> Result<Option<String>> {
        let path = self.resolve(rel)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Write a file, creating parent directories.
    pub async fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Remove a file. Missing files are not an error.
    pub async fn remove(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}

pub struct ReadFile;

const READ_FILE_PARAMS: &[ParamSpec] = &[ParamSpec::required(
    "path",
    ParamKind::String,
    "Workspace-relative file path",
)];

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn category(&self) -> &'static str {
        "files"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "Read a file from the workspace"
    }

    fn params(&self) -> &'static [ParamSpec] {
        READ_FILE_PARAMS
    }

    async fn execute(&self, env: &ToolEnv, params: &Value) -> Result<ToolOutput> {
        let path = get_string(params, "path").unwrap_or_default();
        match env.workspace.read(&path).await? {
            Some(content) => Ok(ToolOutput::ok(content).with_data(json!({ "exists": true }))),
            None => Ok(
                ToolOutput::failed("", format!("file not found: {}", path))
                    .with_data(json!({ "exists": false })),
            ),
        }
    }
}

pub struct WriteFile;

const WRITE_FILE_PARAMS: &[ParamSpec] = &[
    ParamSpec::required("path", ParamKind::String, "Workspace-relative file path"),
    ParamSpec::required("content", ParamKind::String, "Full new file content"),
];

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn category(&self) -> &'static str {
        "files"
    }

    fn read_only(&self) -> bool {
        false
    }

    fn description(&self) -> &'static str {
        "Write a file in the workspace, creating parent directories"
    }

    fn params(&self) -> &'static [ParamSpec] {
        WRITE_FILE_PARAMS
    }

    async fn execute(&self, env: &ToolEnv, params: &Value) -> Result<ToolOutput> {
        let path = get_string(params, "path").unwrap_or_default();
        let content = get_string(params, "content").unwrap_or_default();
        env.workspace.write(&path, &content).await?;
        Ok(ToolOutput::ok(format!("wrote {} bytes to {}", content.len(), path)))
    }
}

pub struct ListDirectory;

const LIST_DIRECTORY_PARAMS: &[ParamSpec] = &[ParamSpec::optional(
    "path",
    ParamKind::String,
    "Workspace-relative directory (default: workspace root)",
)];

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &'static str {
        "list_directory"
    }

    fn category(&self) -> &'static str {
        "files"
    }

    fn read_only(&self) -> bool {
        true
    }

    fn description(&self) -> &'static str {
        "List entries of a workspace directory"
    }

    fn params(&self) -> &'static [ParamSpec] {
        LIST_DIRECTORY_PARAMS
    }

    async fn execute(&self, env: &ToolEnv, params: &Value) -> Result<ToolOutput> {
        let dir = match get_string(params, "path") {
            Some(rel) if !rel.trim().is_empty() && rel.trim() != "." => env.workspace.resolve(&rel)?,
            _ => env.workspace.root().to_path_buf(),
        };

        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();

        Ok(ToolOutput::ok(entries.join("\n")).with_data(json!({ "entries": entries })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_contains_paths() {
        let ws = Workspace::new("/work");
        assert_eq!(ws.normalize("src/lib.rs").unwrap(), PathBuf::from("src/lib.rs"));
        assert_eq!(ws.normalize("./src/../Cargo.toml").unwrap(), PathBuf::from("Cargo.toml"));
        assert_eq!(ws.normalize("/work/src/a.rs").unwrap(), PathBuf::from("src/a.rs"));
        assert!(ws.normalize("../etc/passwd").is_err());
        assert!(ws.normalize("src/../../x").is_err());
        assert!(ws.normalize("/etc/passwd").is_err());
        assert!(ws.normalize("  ").is_err());
    }

    #[test]
    fn test_protected_prefixes() {
        let ws = Workspace::new("/work");
        let protected = vec![".git".to_string(), "config/secrets".to_string()];
        assert!(ws.is_protected(".git/HEAD", &protected));
        assert!(ws.is_protected("./config/secrets/key.pem", &protected));
        assert!(!ws.is_protected("config/app.yaml", &protected));
        assert!(!ws.is_protected(".gitignore", &protected));
        assert!(ws.is_protected("../outside", &protected));
    }

    #[tokio::test]
    async fn test_read_write_remove() {
        let temp = TempDir::new().unwrap();
        let ws = Workspace::new(temp.path());

        assert_eq!(ws.read("a/b.txt").await.unwrap(), None);
        ws.write("a/b.txt", "hello").await.unwrap();
        assert_eq!(ws.read("a/b.txt").await.unwrap().as_deref(), Some("hello"));
        ws.remove("a/b.txt").await.unwrap();
        assert_eq!(ws.read("a/b.txt").await.unwrap(), None);
        ws.remove("a/b.txt").await.unwrap();
    }
}
