//! Engine lifecycle: explicit run states and legal transition guards.
//!
//! Every run starts at `NotStarted` and ends in exactly one of the three
//! terminal states. The engine calls `advance()` to move between states; each
//! call validates the edge and appends it to the transition log, so a finished
//! run can be replayed state by state.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The set of engine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Created, seed inputs not yet loaded.
    NotStarted,
    /// Executing stages along static or selected edges.
    Running,
    /// A quality-gated stage produced an artifact that is being evaluated or revised.
    AwaitingRevision,
    /// The final stage produced an artifact and nothing was abandoned on the way.
    TerminalSuccess,
    /// The final stage was reached, but some gated stage gave up before its threshold.
    TerminalAbandoned,
    /// A fatal error, cancellation, or run limit stopped the run.
    TerminalFatal,
}

impl EngineState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::TerminalSuccess | Self::TerminalAbandoned | Self::TerminalFatal
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::AwaitingRevision => write!(f, "awaiting_revision"),
            Self::TerminalSuccess => write!(f, "terminal_success"),
            Self::TerminalAbandoned => write!(f, "terminal_abandoned"),
            Self::TerminalFatal => write!(f, "terminal_fatal"),
        }
    }
}

/// Legal transitions between engine states.
///
/// ```text
/// NotStarted       → Running
/// Running          → Running | AwaitingRevision | TerminalSuccess | TerminalAbandoned
/// AwaitingRevision → Running | AwaitingRevision
/// (any non-terminal) → TerminalFatal
/// ```
fn is_legal_transition(from: EngineState, to: EngineState) -> bool {
    use EngineState::*;

    if to == TerminalFatal && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (NotStarted, Running)
            | (Running, Running)
            | (Running, AwaitingRevision)
            | (Running, TerminalSuccess)
            | (Running, TerminalAbandoned)
            // accept or abandon: continue with the best artifact
            | (AwaitingRevision, Running)
            // revise
            | (AwaitingRevision, AwaitingRevision)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: EngineState,
    pub to: EngineState,
    /// Stage executions completed at the time of the transition.
    pub step: usize,
    /// Milliseconds since the lifecycle was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal state transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: EngineState,
    pub to: EngineState,
}

/// The engine state machine for one run.
#[derive(Debug)]
pub struct Lifecycle {
    current: EngineState,
    step: usize,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            current: EngineState::NotStarted,
            step: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> EngineState {
        self.current
    }

    /// Update the execution counter stamped onto subsequent transitions.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    /// Attempt to move to `to`, recording the edge when it is legal.
    pub fn advance(&mut self, to: EngineState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            from = %self.current,
            to = %to,
            step = self.step,
            reason = reason.unwrap_or(""),
            "State transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            step: self.step,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Transition to `TerminalFatal` from any non-terminal state.
    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(EngineState::TerminalFatal, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }

    /// One-line history, e.g. `not_started → terminal_success [running → ...]`.
    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut out = format!(
            "{} → {} ({} transitions)",
            EngineState::NotStarted,
            self.current,
            self.transitions.len()
        );
        if !states.is_empty() {
            out.push_str(&format!(" [{}]", states.join(" → ")));
        }
        out
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_not_started() {
        let lc = Lifecycle::new();
        assert_eq!(lc.current(), EngineState::NotStarted);
        assert!(!lc.is_terminal());
        assert!(lc.transitions().is_empty());
    }

    #[test]
    fn test_happy_path_with_revision() {
        let mut lc = Lifecycle::new();
        lc.advance(EngineState::Running, Some("seeded")).unwrap();
        lc.set_step(2);
        lc.advance(EngineState::AwaitingRevision, Some("draft")).unwrap();
        lc.advance(EngineState::AwaitingRevision, Some("revise")).unwrap();
        lc.advance(EngineState::Running, Some("accept")).unwrap();
        lc.advance(EngineState::TerminalSuccess, None).unwrap();

        assert!(lc.is_terminal());
        assert_eq!(lc.transitions().len(), 5);
        assert_eq!(lc.transitions()[1].step, 2);
        assert_eq!(lc.transitions()[2].reason.as_deref(), Some("revise"));
    }

    #[test]
    fn test_illegal_transitions() {
        let mut lc = Lifecycle::new();
        let err = lc.advance(EngineState::TerminalSuccess, None).unwrap_err();
        assert_eq!(err.from, EngineState::NotStarted);
        assert_eq!(
            err.to_string(),
            "Illegal state transition: not_started → terminal_success"
        );

        lc.advance(EngineState::Running, None).unwrap();
        lc.advance(EngineState::AwaitingRevision, None).unwrap();
        // Must return to running before finishing.
        assert!(lc.advance(EngineState::TerminalSuccess, None).is_err());
        assert!(lc.advance(EngineState::TerminalAbandoned, None).is_err());
    }

    #[test]
    fn test_fail_from_any_non_terminal() {
        for setup in [
            vec![],
            vec![EngineState::Running],
            vec![EngineState::Running, EngineState::AwaitingRevision],
        ] {
            let mut lc = Lifecycle::new();
            for s in setup {
                lc.advance(s, None).unwrap();
            }
            lc.fail("boom").unwrap();
            assert_eq!(lc.current(), EngineState::TerminalFatal);
        }
    }

    #[test]
    fn test_terminal_is_sticky() {
        let mut lc = Lifecycle::new();
        lc.advance(EngineState::Running, None).unwrap();
        lc.advance(EngineState::TerminalAbandoned, None).unwrap();
        assert!(lc.fail("late").is_err());
        assert!(lc.advance(EngineState::Running, None).is_err());
    }

    #[test]
    fn test_summary() {
        let mut lc = Lifecycle::new();
        lc.advance(EngineState::Running, None).unwrap();
        lc.fail("cancelled").unwrap();
        let summary = lc.summary();
        assert!(summary.starts_with("not_started → terminal_fatal"));
        assert!(summary.contains("[running → terminal_fatal]"));
    }
}
