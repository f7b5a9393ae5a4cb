//! Agent logging.
//!
//! An [`AgentLogger`] sends each agent step to three places:
//! - tracing (stderr/file)
//! - the blackboard action log of the task
//! - the governance audit trail, with decision `logged`
//!
//! [`init_tracing`] installs the process-wide subscriber.

use crate::db::Database;
use crate::types::{AuditEntry, Task};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the global subscriber.
///
/// `target` is `0|off`, `1|stdout`, `2|stderr` or a file name opened for
/// append. `RUST_LOG`, when set, takes precedence over `verbose`.
pub fn init_tracing(target: &str, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    match target {
        "0" | "off" => {}
        "1" | "stdout" => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            let file = OpenOptions::new().create(true).append(true).open(filename)?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

/// Audit target keeps this many chars of the thought.
const AUDIT_TARGET_CHARS: usize = 200;
/// Audit justification keeps this many chars of the observation.
const AUDIT_JUSTIFICATION_CHARS: usize = 500;

/// Severity of an agent log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    #[default]
    Info = 1,
    #[serde(alias = "warn")]
    Warning = 2,
    Error = 3,
}

impl LogLevel {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            _ => LogLevel::Error,
        }
    }

    pub fn to_tracing(self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warning => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Atomic level filter deciding which entries are mirrored to the blackboard.
pub struct LogLevelFilter(AtomicU8);

impl LogLevelFilter {
    pub fn new(level: LogLevel) -> Self {
        Self(AtomicU8::new(level as u8))
    }

    pub fn get(&self) -> LogLevel {
        LogLevel::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: LogLevel) {
        self.0.store(level as u8, Ordering::Relaxed);
    }

    pub fn should_log(&self, level: LogLevel) -> bool {
        level as u8 >= self.0.load(Ordering::Relaxed)
    }
}

impl Default for LogLevelFilter {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

/// Return at most `max` chars of `s`, cut on a char boundary.
pub fn clip(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Per-agent logger mirroring steps into the blackboard and audit trail.
#[derive(Clone)]
pub struct AgentLogger {
    db: Database,
    agent: String,
    level_filter: Arc<LogLevelFilter>,
}

impl AgentLogger {
    pub fn new(db: Database, agent: impl Into<String>) -> Self {
        Self {
            db,
            agent: agent.into(),
            level_filter: Arc::new(LogLevelFilter::default()),
        }
    }

    pub fn with_level_filter(mut self, filter: Arc<LogLevelFilter>) -> Self {
        self.level_filter = filter;
        self
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Record an informational step against a task.
    pub fn log(&self, task: &Task, action: &str, thought: &str, observation: Option<&str>) {
        self.log_at(LogLevel::Info, task, action, thought, observation);
    }

    /// Record a step at the given level.
    ///
    /// Store failures are reported through tracing and never returned.
    pub fn log_at(
        &self,
        level: LogLevel,
        task: &Task,
        action: &str,
        thought: &str,
        observation: Option<&str>,
    ) {
        let agent = self.agent.as_str();
        match level.to_tracing() {
            Level::ERROR => tracing::error!(agent, task_id = task.id, action, "{}", thought),
            Level::WARN => tracing::warn!(agent, task_id = task.id, action, "{}", thought),
            Level::INFO => tracing::info!(agent, task_id = task.id, action, "{}", thought),
            _ => tracing::debug!(agent, task_id = task.id, action, "{}", thought),
        }

        if !self.level_filter.should_log(level) {
            return;
        }

        if let Err(e) = self.db.log_action(task.id, agent, action, thought, observation) {
            tracing::warn!(agent, task_id = task.id, error = %e, "Failed to write action log");
        }

        let entry = AuditEntry {
            agent_name: agent.to_string(),
            action: action.to_string(),
            target: clip(thought, AUDIT_TARGET_CHARS).to_string(),
            decision: "logged".to_string(),
            justification: observation.map(|o| clip(o, AUDIT_JUSTIFICATION_CHARS).to_string()),
            input: None,
            output: None,
            task_id: Some(task.id),
            pipeline_id: task.pipeline_id,
        };
        if let Err(e) = self.db.record_audit(&entry) {
            tracing::warn!(agent, task_id = task.id, error = %e, "Failed to write audit record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewTask;

    #[test]
    fn test_level_filter() {
        let filter = LogLevelFilter::new(LogLevel::Warning);
        assert!(!filter.should_log(LogLevel::Debug));
        assert!(!filter.should_log(LogLevel::Info));
        assert!(filter.should_log(LogLevel::Warning));
        assert!(filter.should_log(LogLevel::Error));

        filter.set(LogLevel::Debug);
        assert_eq!(filter.get(), LogLevel::Debug);
        assert!(filter.should_log(LogLevel::Debug));
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), "hé");
        assert_eq!(clip("abc", 10), "abc");
        assert_eq!(clip("", 3), "");
    }

    #[test]
    fn test_logger_mirrors_to_blackboard_and_audit() {
        let db = Database::open_in_memory().unwrap();
        let task = db
            .create_task(NewTask {
                title: "t".into(),
                ..Default::default()
            })
            .unwrap();

        let long_thought = "x".repeat(300);
        let logger = AgentLogger::new(db.clone(), "architect");
        logger.log(&task, "search", &long_thought, Some("found 3 files"));
        logger.log_at(LogLevel::Debug, &task, "noise", "filtered", None);

        let logs = db.get_actions_for_task(task.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].agent_name, "architect");

        let audit = db.list_audit_for_action("search").unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].decision, "logged");
        assert_eq!(audit[0].target.chars().count(), 200);
        assert_eq!(audit[0].justification.as_deref(), Some("found 3 files"));
    }
}
