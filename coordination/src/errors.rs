//! Error taxonomy with retry classification.
//!
//! Every failure the engine can observe is tagged with an [`ErrorKind`].
//! Callers ask `is_transient()` instead of matching on messages.
//!
//! | Kind               | Class                 | Retried |
//! |--------------------|-----------------------|---------|
//! | `Timeout`          | transient generation  | yes     |
//! | `MalformedOutput`  | transient generation  | yes     |
//! | `RateLimited`      | transient generation  | yes     |
//! | `Transport`        | transient generation  | yes     |
//! | `PermanentRefusal` | fatal generation      | no      |
//! | `Unsatisfiable`    | fatal generation      | no      |
//! | `RetriesExhausted` | fatal generation      | no      |
//! | `Precondition`     | precondition          | no      |
//! | `RunLimitExceeded` | run limit             | no      |
//! | `Cancelled`        | cancelled             | no      |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fine-grained classification of a single failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The collaborator call exceeded its per-call timeout.
    Timeout,
    /// The collaborator answered but the payload failed schema validation.
    MalformedOutput,
    /// The backend asked us to slow down.
    RateLimited,
    /// Network or connection level failure.
    Transport,
    /// The collaborator explicitly refused the request for good.
    PermanentRefusal,
    /// The requested output schema cannot be satisfied.
    Unsatisfiable,
    /// Transient failures persisted past the retry budget.
    RetriesExhausted,
    /// Required state is missing; indicates a graph construction bug.
    Precondition,
    /// The run-level execution cap or a stage attempt budget was exhausted.
    RunLimitExceeded,
    /// The run was cancelled by its owner.
    Cancelled,
}

/// Coarse error classes used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientGeneration,
    FatalGeneration,
    Precondition,
    RunLimitExceeded,
    Cancelled,
}

impl ErrorKind {
    /// Whether a retry with the same input may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::MalformedOutput | Self::RateLimited | Self::Transport
        )
    }

    pub fn class(self) -> ErrorClass {
        match self {
            Self::Timeout | Self::MalformedOutput | Self::RateLimited | Self::Transport => {
                ErrorClass::TransientGeneration
            }
            Self::PermanentRefusal | Self::Unsatisfiable | Self::RetriesExhausted => {
                ErrorClass::FatalGeneration
            }
            Self::Precondition => ErrorClass::Precondition,
            Self::RunLimitExceeded => ErrorClass::RunLimitExceeded,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::MalformedOutput => write!(f, "malformed_output"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Transport => write!(f, "transport"),
            Self::PermanentRefusal => write!(f, "permanent_refusal"),
            Self::Unsatisfiable => write!(f, "unsatisfiable"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::Precondition => write!(f, "precondition"),
            Self::RunLimitExceeded => write!(f, "run_limit_exceeded"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientGeneration => write!(f, "TransientGenerationError"),
            Self::FatalGeneration => write!(f, "FatalGenerationError"),
            Self::Precondition => write!(f, "PreconditionError"),
            Self::RunLimitExceeded => write!(f, "RunLimitExceeded"),
            Self::Cancelled => write!(f, "CancelledError"),
        }
    }
}

/// A classified failure of one stage attempt.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind} in stage '{stage}': {message}")]
pub struct StageError {
    pub stage: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(stage: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            kind,
            message: message.into(),
        }
    }

    /// Required inputs are missing from the state.
    pub fn precondition(stage: impl Into<String>, missing: &[String]) -> Self {
        Self::new(
            stage,
            ErrorKind::Precondition,
            format!("missing required inputs: {}", missing.join(", ")),
        )
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Re-classify the last transient failure once the retry budget is spent.
    pub fn exhausted(self, attempts: u32) -> Self {
        Self {
            message: format!(
                "gave up after {} attempts, last error {}: {}",
                attempts, self.kind, self.message
            ),
            kind: ErrorKind::RetriesExhausted,
            stage: self.stage,
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Success,
    AbandonedAfterMaxAttempts,
    AbandonedPlateau,
    FatalError,
    Cancelled,
    RunLimitExceeded,
}

impl TerminalReason {
    /// Map a fatal stage error to the reason reported for the run.
    pub fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::RunLimitExceeded => Self::RunLimitExceeded,
            ErrorKind::Cancelled => Self::Cancelled,
            _ => Self::FatalError,
        }
    }

    /// Abandonment is a successful termination path, not an error.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::FatalError | Self::Cancelled | Self::RunLimitExceeded
        )
    }

    /// Human-readable sentence for user-facing output.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Success => "all stages completed and passed their quality gates",
            Self::AbandonedAfterMaxAttempts => {
                "a quality-gated stage used all of its attempts; returning the best artifact"
            }
            Self::AbandonedPlateau => {
                "revision scores stopped improving; returning the best artifact"
            }
            Self::FatalError => "a stage failed with a non-retryable error",
            Self::Cancelled => "the run was cancelled",
            Self::RunLimitExceeded => "the run hit its execution limit",
        }
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::AbandonedAfterMaxAttempts => write!(f, "abandoned_after_max_attempts"),
            Self::AbandonedPlateau => write!(f, "abandoned_plateau"),
            Self::FatalError => write!(f, "fatal_error"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RunLimitExceeded => write!(f, "run_limit_exceeded"),
        }
    }
}
