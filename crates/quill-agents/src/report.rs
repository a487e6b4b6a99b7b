//! Run report: everything a caller gets back from one engine run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quill_coordination::{
    ActionDecision, Artifact, EngineState, ExecutionRecord, RevisionProgress, StageError,
    TerminalReason, TransitionRecord,
};

/// Decision taken at one conditional edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Stage whose successor was chosen.
    pub from_stage: String,
    pub decision: ActionDecision,
}

/// Outcome of a run: final artifact, terminal reason, and the full trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub terminal_state: EngineState,
    pub terminal_reason: TerminalReason,
    /// Human-readable explanation of the terminal reason.
    pub message: String,
    /// Output of the final stage, or the latest artifact produced when the
    /// run stopped early.
    pub final_artifact: Option<Artifact>,
    pub execution_trace: Vec<ExecutionRecord>,
    pub transitions: Vec<TransitionRecord>,
    /// Revision trace per gated stage, in the order the cycles ran.
    pub revisions: Vec<RevisionProgress>,
    pub decisions: Vec<DecisionRecord>,
    pub attempt_count: BTreeMap<String, u32>,
    pub total_executions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.terminal_reason == TerminalReason::Success
    }

    /// Abandonment still yields a usable artifact; only error reasons fail.
    pub fn is_error(&self) -> bool {
        self.terminal_reason.is_error()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Highest score recorded for `stage` across its revision cycles.
    pub fn best_score(&self, stage: &str) -> Option<f64> {
        self.revisions
            .iter()
            .filter(|p| p.stage == stage)
            .filter_map(RevisionProgress::best_score)
            .reduce(f64::max)
    }

    /// One-paragraph summary for terminal output.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "run {} finished {} ({}): {}",
            self.run_id, self.terminal_state, self.terminal_reason, self.message
        );
        out.push_str(&format!(
            "\n  executions: {}, transitions: {}, decisions: {}",
            self.total_executions,
            self.transitions.len(),
            self.decisions.len()
        ));
        for progress in &self.revisions {
            let scores: Vec<String> = progress
                .steps
                .iter()
                .map(|s| format!("{:.1}", s.new_score))
                .collect();
            out.push_str(&format!("\n  {} scores: {}", progress.stage, scores.join(" → ")));
        }
        if let Some(error) = &self.error {
            out.push_str(&format!("\n  error: {error}"));
        }
        out
    }
}
