//! Quill coordination library
//!
//! Deterministic building blocks for the quill writing pipeline. Nothing in
//! this crate talks to a model: every function here is either pure or only
//! sleeps (retry backoff), so the decisions it makes are reproducible and can
//! be replayed offline.
//!
//! # Modules
//!
//! - `graph`: stage specifications and the static edge table
//! - `state`: the per-run `WorkflowState` aggregate and its execution history
//! - `quality`: quality assessments, the accept/revise/abandon gate and
//!   revision progress traces
//! - `decision`: parsing, validation and fallback for next-stage decisions
//! - `retry`: bounded exponential backoff for transient failures
//! - `lifecycle`: the engine state machine with its legal transition table
//! - `errors`: error taxonomy and terminal reasons

#![allow(clippy::uninlined_format_args)]

pub mod decision;
pub mod errors;
pub mod graph;
pub mod json;
pub mod lifecycle;
pub mod quality;
pub mod retry;
pub mod state;

// Re-export key graph types
pub use graph::{GraphError, OutputSchema, StageGraph, StageSpec, Successor};

// Re-export key state types
pub use state::{Artifact, ExecutionOutcome, ExecutionRecord, WorkflowState};

// Re-export quality types
pub use quality::{
    select_targets, AbandonReason, GateConfig, GateVerdict, QualityAssessment, QualityGate,
    RevisionProgress, RevisionStep,
};

// Re-export decision types
pub use decision::{
    fallback_decision, parse_decision, parse_plan, plan_schema, validate_plan, ActionDecision,
    DecisionError,
    DecisionOrigin, FallbackKind, ProposedStage, MAX_PROPOSALS,
};

// Re-export retry types
pub use retry::{run_with_retry, RetryDisposition, RetryError, RetryPolicy};

// Re-export lifecycle types
pub use lifecycle::{EngineState, IllegalTransition, Lifecycle, TransitionRecord};

// Re-export error types
pub use errors::{ErrorClass, ErrorKind, StageError, TerminalReason};
