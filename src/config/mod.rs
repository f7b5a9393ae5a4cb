//! Tiered configuration.
//!
//! Merged field by field from, lowest priority first:
//! 1. **Defaults** - compiled in
//! 2. **Project** - `$CWD/agent-pipeline/config.yaml`
//! 3. **User** - `~/.agent-pipeline/config.yaml`
//! 4. **Environment** - variables below
//!
//! ## Environment Variables
//! - `AGENT_PIPELINE_CONFIG_PATH` - Explicit config file (overrides all tiers)
//! - `AGENT_PIPELINE_DB_PATH` - Database path
//! - `AGENT_PIPELINE_WORKSPACE` - Workspace root
//! - `AGENT_PIPELINE_PORT` - HTTP port
//! - `AGENT_PIPELINE_LLM_MODEL` - Completion model
//! - `AGENT_PIPELINE_LLM_BASE_URL` - Completion API base URL
//! - `AGENT_PIPELINE_USER_DIR` / `AGENT_PIPELINE_PROJECT_DIR` - Tier directories

mod loader;
mod merge;
mod types;

pub use loader::{ConfigLoader, ConfigPaths, ConfigTier};
pub use merge::deep_merge;
pub use types::*;
