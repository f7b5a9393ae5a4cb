//! CLI command definitions.

use crate::types::PipelineMode;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Blackboard-driven multi-agent pipeline orchestrator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Workspace root that tools operate on (overrides config)
    #[arg(short, long, global = true)]
    pub workspace: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP API and the agents (default if no subcommand given)
    Serve,

    /// Run one pipeline in-process and stream its events to stdout
    Run(RunArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ModeArg {
    Plan,
    #[default]
    Act,
}

impl From<ModeArg> for PipelineMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Plan => PipelineMode::Plan,
            ModeArg::Act => PipelineMode::Act,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Feature request
    pub prompt: String,

    #[arg(long, value_enum, default_value_t = ModeArg::Act)]
    pub mode: ModeArg,

    /// File whose content is passed as the approved plan
    #[arg(long)]
    pub plan_file: Option<PathBuf>,

    #[arg(long)]
    pub max_calls: Option<i64>,

    #[arg(long)]
    pub max_time_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::parse_from([
            "agent-pipeline",
            "--port",
            "4000",
            "run",
            "Add a loyalty points module",
            "--mode",
            "plan",
            "--max-calls",
            "3",
        ]);
        assert_eq!(cli.port, Some(4000));
        match cli.command {
            Some(Command::Run(args)) => {
                assert_eq!(args.prompt, "Add a loyalty points module");
                assert_eq!(PipelineMode::from(args.mode), PipelineMode::Plan);
                assert_eq!(args.max_calls, Some(3));
                assert!(args.plan_file.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::parse_from(["agent-pipeline"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log, "2");
    }
}
