//! Agent Pipeline Library
//!
//! Multi-agent pipeline orchestration over a SQLite blackboard. This module
//! exports the core components for testing and integration.

pub mod agents;
pub mod app;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod tools;
pub mod types;
