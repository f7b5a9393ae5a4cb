//! Configuration loader with tier-based merging.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Embedded defaults (lowest priority)
    Defaults = 0,
    /// Project-level config ($CWD/agent-pipeline/)
    Project = 1,
    /// User-level config (~/.agent-pipeline/)
    User = 2,
    /// Environment variables (highest priority)
    Environment = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
        }
    }
}

/// Directories searched for `config.yaml`.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::discover()
    }
}

impl ConfigPaths {
    /// Discover configuration paths from environment and defaults.
    pub fn discover() -> Self {
        let user_dir = std::env::var("AGENT_PIPELINE_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".agent-pipeline")));

        let project_dir = std::env::var("AGENT_PIPELINE_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("agent-pipeline")));

        Self {
            project_dir,
            user_dir,
        }
    }

    /// Create paths with explicit directories.
    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }
}

/// Configuration loader that handles tier-based merging.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Highest-priority config file that contributed, if any
    config_path: Option<PathBuf>,
}

fn read_yaml_tier(dir: &Path, tier: ConfigTier) -> Option<(Value, PathBuf)> {
    let file = dir.join("config.yaml");
    if !file.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(&file) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %file.display(), %tier, error = %e, "Failed to read config file");
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Some((value, file)),
        Err(e) => {
            warn!(path = %file.display(), %tier, error = %e, "Ignoring malformed config file");
            None
        }
    }
}

impl ConfigLoader {
    /// Load configuration from all tiers with proper merging.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(ConfigPaths::discover())
    }

    /// Load configuration with explicit paths.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        if let Ok(explicit_path) = std::env::var("AGENT_PIPELINE_CONFIG_PATH") {
            let path = PathBuf::from(&explicit_path);
            let mut config = Config::load(&path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            Self::apply_env_overrides(&mut config);
            config.validate()?;
            return Ok(Self {
                paths,
                config,
                config_path: Some(path),
            });
        }

        let mut configs: Vec<Value> = Vec::new();
        let mut config_path = None;

        if let Ok(default_json) = serde_json::to_value(Config::default()) {
            configs.push(default_json);
        }

        if let Some(dir) = paths.project_dir.as_deref()
            && let Some((value, file)) = read_yaml_tier(dir, ConfigTier::Project)
        {
            configs.push(value);
            config_path = Some(file);
        }

        if let Some(dir) = paths.user_dir.as_deref()
            && let Some((value, file)) = read_yaml_tier(dir, ConfigTier::User)
        {
            configs.push(value);
            config_path = Some(file);
        }

        let merged = deep_merge_all(configs);
        let mut config: Config = serde_json::from_value(merged)?;

        Self::apply_env_overrides(&mut config);
        config.validate()?;

        Ok(Self {
            paths,
            config,
            config_path,
        })
    }

    /// Apply environment variable overrides to config.
    fn apply_env_overrides(config: &mut Config) {
        if let Ok(db_path) = std::env::var("AGENT_PIPELINE_DB_PATH") {
            config.server.db_path = PathBuf::from(db_path);
        }

        if let Ok(workspace) = std::env::var("AGENT_PIPELINE_WORKSPACE") {
            config.server.workspace_root = PathBuf::from(workspace);
        }

        if let Ok(port) = std::env::var("AGENT_PIPELINE_PORT") {
            match port.parse() {
                Ok(port) => config.http.port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid AGENT_PIPELINE_PORT"),
            }
        }

        if let Ok(model) = std::env::var("AGENT_PIPELINE_LLM_MODEL") {
            config.llm.model = model;
        }

        if let Ok(base_url) = std::env::var("AGENT_PIPELINE_LLM_BASE_URL") {
            config.llm.base_url = base_url;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Get the config file path that was used.
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}
