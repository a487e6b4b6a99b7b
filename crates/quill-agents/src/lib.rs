//! Async runtime for the quill writing pipeline.
//!
//! The deterministic pieces (stage graph, quality gate, decision validation,
//! retry arithmetic, lifecycle) live in `quill_coordination`; this crate wires
//! them to the external collaborators and drives runs.

pub mod collaborators;
pub mod config;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod pipeline;
pub mod profile;
pub mod prompts;
pub mod provider;
pub mod report;
pub mod revision;
pub mod selector;
pub mod telemetry;

pub use collaborators::{
    ContextSnapshot, Evaluator, GenerationError, GenerationRequest, Generator, ProfileBlob,
    ProfileStore, ProfileStoreError, Reasoner, ReasoningError,
};
pub use config::{ConfigError, EngineConfig, ProviderConfig};
pub use engine::{Collaborators, RunRequest, WorkflowEngine};
pub use evaluator::GeneratorEvaluator;
pub use executor::{ExecutorLimits, StageDirective, StageExecutor, StageResult};
pub use profile::{DirProfileStore, InMemoryProfileStore, UserProfile};
pub use provider::OpenAiCompatProvider;
pub use report::{DecisionRecord, RunReport};
pub use revision::{RevisionController, RevisionEnd, RevisionOutcome};
pub use selector::{ActionSelector, SelectorConfig};
