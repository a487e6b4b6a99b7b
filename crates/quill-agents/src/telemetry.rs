//! Run report sinks: a pretty JSON file per run and an append-only JSONL log.
//!
//! Both are best effort. A failed write is logged and never changes the run outcome.

use std::io::Write;
use std::path::Path;

use tracing::{info, warn};

use crate::report::RunReport;

/// Write `report` as pretty-printed JSON to `path`.
pub fn write_report(report: &RunReport, path: &Path) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => match std::fs::write(path, json) {
            Ok(()) => info!(path = %path.display(), run_id = %report.run_id, "Wrote run report"),
            Err(e) => warn!("Failed to write run report: {e}"),
        },
        Err(e) => warn!("Failed to serialize run report: {e}"),
    }
}

/// Append `report` as one JSON line to `path`.
pub fn append_report(report: &RunReport, path: &Path) {
    match serde_json::to_string(report) {
        Ok(json) => match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{json}") {
                    warn!("Failed to append telemetry: {e}");
                } else {
                    info!(path = %path.display(), "Appended run telemetry");
                }
            }
            Err(e) => warn!("Failed to open telemetry file: {e}"),
        },
        Err(e) => warn!("Failed to serialize telemetry: {e}"),
    }
}

/// Read every report from a JSONL log, skipping unreadable lines.
pub fn read_reports(path: &Path) -> Vec<RunReport> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Skipping malformed telemetry line: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use quill_coordination::{EngineState, TerminalReason};
    use std::collections::BTreeMap;

    fn report(run_id: &str) -> RunReport {
        RunReport {
            run_id: run_id.into(),
            user_id: None,
            terminal_state: EngineState::TerminalSuccess,
            terminal_reason: TerminalReason::Success,
            message: TerminalReason::Success.describe().into(),
            final_artifact: None,
            execution_trace: Vec::new(),
            transitions: Vec::new(),
            revisions: Vec::new(),
            decisions: Vec::new(),
            attempt_count: BTreeMap::new(),
            total_executions: 0,
            error: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        append_report(&report("a"), &path);
        append_report(&report("b"), &path);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "not json"))
            .unwrap();

        let reports = read_reports(&path);
        let ids: Vec<&str> = reports.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_write_report_pretty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        write_report(&report("x"), &path);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"terminal_reason\": \"success\""));
        assert!(text.contains("\"terminal_state\": \"terminal_success\""));
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_reports(&dir.path().join("absent.jsonl")).is_empty());
    }
}
