//! Progress streaming and escalation management.
//!
//! Events append to a JSONL file under the session directory, flushed
//! per event so `tail -f` sees them immediately, and rotated to `.1`
//! when the file exceeds its size cap. The escalation budget bounds how
//! much re-work the map phase may buy at a stronger model tier.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde_json::json;

use crate::core::constants::DEFAULT_PROGRESS_MAX_SIZE;
use crate::core::result::FailureType;

/// Decides whether a failure warrants model escalation.
///
/// Only quality/complexity failures escalate, and never before the
/// second attempt; timeouts, parse errors, rate limits and unknown
/// failures are excluded because a stronger model does not fix them.
#[must_use]
pub fn should_escalate(failure_type: FailureType, attempt: usize) -> bool {
    match failure_type {
        FailureType::QualityLow | FailureType::Complexity => attempt >= 2,
        FailureType::Timeout
        | FailureType::ParseError
        | FailureType::RateLimit
        | FailureType::Unknown => false,
    }
}

/// Classifies a failure from its error message and response length.
#[must_use]
pub fn classify_failure(error_message: Option<&str>, response_length: usize) -> FailureType {
    let lower = error_message.map(str::to_lowercase).unwrap_or_default();

    if lower.contains("timeout") || lower.contains("timed out") {
        return FailureType::Timeout;
    }
    if lower.contains("rate limit") || lower.contains("rate_limit") {
        return FailureType::RateLimit;
    }
    if lower.contains("json") || lower.contains("parse") || lower.contains("format") {
        return FailureType::ParseError;
    }
    if lower.contains("complex") || lower.contains("too large") {
        return FailureType::Complexity;
    }

    // No response at all reads as a connection problem; a very short one
    // means the model answered but poorly.
    if response_length == 0 {
        FailureType::Unknown
    } else if response_length < 50 {
        FailureType::QualityLow
    } else {
        FailureType::Unknown
    }
}

/// Tracks escalation spend against the configured budget.
#[derive(Debug, Clone)]
pub struct EscalationBudget {
    max_escalation_ratio: f64,
    max_cost_usd: f64,
    escalation_count: usize,
    total_chunks: usize,
    estimated_cost: f64,
}

impl EscalationBudget {
    /// Creates a budget with the given limits.
    #[must_use]
    pub const fn new(max_escalation_ratio: f64, max_cost_usd: f64) -> Self {
        Self {
            max_escalation_ratio,
            max_cost_usd,
            escalation_count: 0,
            total_chunks: 0,
            estimated_cost: 0.0,
        }
    }

    /// Sets the total chunk count used for the ratio check.
    pub const fn set_total_chunks(&mut self, total: usize) {
        self.total_chunks = total;
    }

    /// Whether another escalation fits in the budget.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn can_escalate(&self) -> bool {
        if self.total_chunks == 0 {
            return true;
        }
        let ratio_ok =
            (self.escalation_count as f64 / self.total_chunks as f64) < self.max_escalation_ratio;
        let cost_ok = self.estimated_cost < self.max_cost_usd;
        ratio_ok && cost_ok
    }

    /// Records one escalation and its estimated cost.
    pub fn record_escalation(&mut self, estimated_cost: f64) {
        self.escalation_count += 1;
        self.estimated_cost += estimated_cost;
    }

    /// Escalations recorded so far.
    #[must_use]
    pub const fn escalation_count(&self) -> usize {
        self.escalation_count
    }

    /// Estimated spend so far.
    #[must_use]
    pub const fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }
}

impl Default for EscalationBudget {
    fn default() -> Self {
        Self::new(0.15, 5.0)
    }
}

/// Append-only JSONL progress log with size-capped rotation.
pub struct ProgressWriter {
    progress_file: PathBuf,
    max_size: u64,
    file: Option<File>,
    current_size: u64,
}

impl ProgressWriter {
    /// Opens (or creates) the progress log in a session directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened for append.
    pub fn open(session_dir: &Path) -> std::io::Result<Self> {
        Self::open_with_max_size(session_dir, DEFAULT_PROGRESS_MAX_SIZE)
    }

    /// Opens with a custom rotation threshold.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened for append.
    pub fn open_with_max_size(session_dir: &Path, max_size: u64) -> std::io::Result<Self> {
        let progress_file = session_dir.join("progress.jsonl");
        let current_size = std::fs::metadata(&progress_file).map_or(0, |m| m.len());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&progress_file)?;
        Ok(Self {
            progress_file,
            max_size,
            file: Some(file),
            current_size,
        })
    }

    /// Emits one event with an ISO-8601 local timestamp, flushing for
    /// immediate `tail -f` visibility.
    pub fn emit(&mut self, event_type: &str, data: serde_json::Value) {
        let mut event = json!({
            "type": event_type,
            "ts": Local::now().to_rfc3339(),
        });
        if let (Some(event_map), Some(data_map)) = (event.as_object_mut(), data.as_object()) {
            for (key, value) in data_map {
                event_map.insert(key.clone(), value.clone());
            }
        }

        let line = format!("{event}\n");
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if file.write_all(line.as_bytes()).is_err() {
            return;
        }
        let _ = file.flush();

        self.current_size += line.len() as u64;
        self.rotate_if_needed();
    }

    /// Emits a batch-start event.
    pub fn emit_batch_start(&mut self, batch: usize, total: usize, chunks: usize) {
        self.emit(
            "batch_start",
            json!({"batch": batch, "total": total, "chunks": chunks}),
        );
    }

    /// Emits a batch-end event.
    pub fn emit_batch_end(&mut self, batch: usize, success: usize, failed: usize) {
        self.emit(
            "batch_end",
            json!({"batch": batch, "success": success, "failed": failed}),
        );
    }

    /// Emits a chunk-completion event.
    pub fn emit_chunk_complete(&mut self, chunk_id: &str, findings: usize, status: &str) {
        self.emit(
            "chunk_complete",
            json!({"chunk_id": chunk_id, "findings": findings, "status": status}),
        );
    }

    /// Emits a finding event (point truncated to 100 characters).
    pub fn emit_finding(&mut self, chunk_id: &str, point: &str, confidence: &str) {
        let point: String = point.chars().take(100).collect();
        self.emit(
            "finding",
            json!({"chunk_id": chunk_id, "point": point, "confidence": confidence}),
        );
    }

    /// Emits a model-escalation event.
    pub fn emit_escalation(&mut self, chunk_id: &str, from_model: &str, to_model: &str) {
        self.emit(
            "escalation",
            json!({"chunk_id": chunk_id, "from": from_model, "to": to_model}),
        );
    }

    /// Rotates to `.1` (replacing any prior `.1`) past the size cap.
    fn rotate_if_needed(&mut self) {
        if self.current_size < self.max_size {
            return;
        }

        self.file = None;
        let rotated = self.progress_file.with_extension("jsonl.1");
        let _ = std::fs::remove_file(&rotated);
        if let Err(e) = std::fs::rename(&self.progress_file, &rotated) {
            tracing::warn!(error = %e, "progress rotation failed");
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.progress_file)
        {
            Ok(file) => {
                self.file = Some(file);
                self.current_size = 0;
            }
            Err(e) => tracing::warn!(error = %e, "progress reopen failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case(FailureType::QualityLow, 1, false; "quality first attempt")]
    #[test_case(FailureType::QualityLow, 2, true; "quality second attempt")]
    #[test_case(FailureType::Complexity, 3, true; "complexity later attempt")]
    #[test_case(FailureType::Timeout, 5, false; "timeout never")]
    #[test_case(FailureType::ParseError, 5, false; "parse error never")]
    #[test_case(FailureType::RateLimit, 5, false; "rate limit never")]
    #[test_case(FailureType::Unknown, 5, false; "unknown never")]
    fn test_should_escalate(failure: FailureType, attempt: usize, expected: bool) {
        assert_eq!(should_escalate(failure, attempt), expected);
    }

    #[test]
    fn test_classify_failure_messages() {
        assert_eq!(
            classify_failure(Some("request timed out"), 100),
            FailureType::Timeout
        );
        assert_eq!(
            classify_failure(Some("429 rate limit hit"), 100),
            FailureType::RateLimit
        );
        assert_eq!(
            classify_failure(Some("invalid JSON in response"), 100),
            FailureType::ParseError
        );
        assert_eq!(
            classify_failure(Some("chunk too large for model"), 100),
            FailureType::Complexity
        );
    }

    #[test]
    fn test_classify_failure_by_length() {
        assert_eq!(classify_failure(None, 0), FailureType::Unknown);
        assert_eq!(classify_failure(None, 10), FailureType::QualityLow);
        assert_eq!(classify_failure(None, 500), FailureType::Unknown);
    }

    #[test]
    fn test_budget_ratio_limit() {
        let mut budget = EscalationBudget::new(0.15, 5.0);
        budget.set_total_chunks(100);
        assert!(budget.can_escalate());
        for _ in 0..15 {
            budget.record_escalation(0.01);
        }
        // 15/100 reaches the 0.15 ratio: no longer under the limit.
        assert!(!budget.can_escalate());
    }

    #[test]
    fn test_budget_cost_limit() {
        let mut budget = EscalationBudget::new(0.9, 5.0);
        budget.set_total_chunks(1000);
        budget.record_escalation(5.0);
        assert!(!budget.can_escalate());
    }

    #[test]
    fn test_budget_no_chunks_always_allows() {
        let budget = EscalationBudget::default();
        assert!(budget.can_escalate());
    }

    #[test]
    fn test_events_append_as_jsonl() {
        let dir = TempDir::new().unwrap();
        let mut writer = ProgressWriter::open(dir.path()).unwrap();
        writer.emit_batch_start(1, 3, 4);
        writer.emit_chunk_complete("aaaa1111", 2, "completed");
        writer.emit_batch_end(1, 4, 0);
        drop(writer);

        let content = std::fs::read_to_string(dir.path().join("progress.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "batch_start");
        assert_eq!(first["batch"], 1);
        assert!(first["ts"].is_string());

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "chunk_complete");
        assert_eq!(second["chunk_id"], "aaaa1111");
    }

    #[test]
    fn test_finding_point_truncated() {
        let dir = TempDir::new().unwrap();
        let mut writer = ProgressWriter::open(dir.path()).unwrap();
        let long_point = "p".repeat(500);
        writer.emit_finding("cafe0001", &long_point, "high");
        drop(writer);

        let content = std::fs::read_to_string(dir.path().join("progress.jsonl")).unwrap();
        let event: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(event["point"].as_str().unwrap().len(), 100);
    }

    #[test]
    fn test_rotation_renames_to_dot_one() {
        let dir = TempDir::new().unwrap();
        let mut writer = ProgressWriter::open_with_max_size(dir.path(), 200).unwrap();
        for i in 0..10 {
            writer.emit("batch_start", json!({"batch": i, "pad": "x".repeat(40)}));
        }
        drop(writer);

        assert!(dir.path().join("progress.jsonl.1").exists());
        assert!(dir.path().join("progress.jsonl").exists());
        // The live file restarted after rotation, so it is small.
        let live = std::fs::metadata(dir.path().join("progress.jsonl")).unwrap();
        assert!(live.len() < 1000);
    }

    #[test]
    fn test_existing_size_counts_toward_rotation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("progress.jsonl"), "x".repeat(150)).unwrap();
        let mut writer = ProgressWriter::open_with_max_size(dir.path(), 200).unwrap();
        writer.emit("batch_end", json!({"batch": 1, "pad": "y".repeat(80)}));
        drop(writer);
        assert!(dir.path().join("progress.jsonl.1").exists());
    }
}
