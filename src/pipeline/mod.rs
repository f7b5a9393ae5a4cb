//! Pipeline orchestration.
//!
//! A pipeline moves through design, codegen, validation, staging and
//! evolution. Each phase is a seed task on the blackboard; agents hand off
//! through the [`Orchestrator`], which also owns the budget, the staged
//! change review and the event bus.

mod events;
mod orchestrator;
mod runbook;

pub use events::{EventBus, EventKind, PipelineEvent};
pub use orchestrator::{
    shape_prompt, ApproveOutcome, ApproveRequest, BudgetRequest, CreatePipeline, Orchestrator,
    PipelineDetails, PipelineSummary, RejectOutcome, RollbackOutcome,
};
pub use runbook::{ApprovalSummary, Decision, Runbook, RunbookContext, ValidationSummary};
