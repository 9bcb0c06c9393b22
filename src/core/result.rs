//! Chunk results and failure classification types.

use serde::{Deserialize, Serialize};

use crate::core::finding::Finding;

/// Status of a chunk result.
///
/// `Placeholder` and `Pending` are stand-ins that never block
/// re-processing; a real result (`Completed`, `Partial`, `Failed`)
/// supersedes them. A `Failed` result is only superseded by an explicit
/// escalation retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// A complete analysis result.
    Completed,
    /// The analyser answered but could not finish.
    Partial,
    /// Dispatch or analysis failed.
    Failed,
    /// Stand-in emitted when no external analyser is attached.
    Placeholder,
    /// Queued but not yet analysed.
    Pending,
}

impl ResultStatus {
    /// Whether this status represents a real analyser response.
    #[must_use]
    pub const fn is_real(self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

/// Result of analysing one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    /// Chunk this result belongs to.
    pub chunk_id: String,

    /// Result status.
    pub status: ResultStatus,

    /// Findings reported for the chunk.
    #[serde(default)]
    pub findings: Vec<Finding>,

    /// Information the analyser reported as missing.
    #[serde(default)]
    pub missing_info: Vec<String>,

    /// Follow-up queries the analyser suggested.
    #[serde(default)]
    pub suggested_queries: Vec<String>,

    /// Partial answer text, when the status is `Partial`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_answer: Option<String>,

    /// Error description, when the status is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkResult {
    /// Creates a placeholder result for a chunk.
    #[must_use]
    pub fn placeholder(chunk_id: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            status: ResultStatus::Placeholder,
            findings: Vec::new(),
            missing_info: Vec::new(),
            suggested_queries: Vec::new(),
            partial_answer: None,
            error: None,
        }
    }

    /// Creates a failed result with an error message.
    #[must_use]
    pub fn failed(chunk_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            status: ResultStatus::Failed,
            findings: Vec::new(),
            missing_info: Vec::new(),
            suggested_queries: Vec::new(),
            partial_answer: None,
            error: Some(error.into()),
        }
    }

    /// Creates a completed result carrying findings.
    #[must_use]
    pub fn completed(chunk_id: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            status: ResultStatus::Completed,
            findings,
            missing_info: Vec::new(),
            suggested_queries: Vec::new(),
            partial_answer: None,
            error: None,
        }
    }
}

/// Classification of a chunk failure, used by the escalation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Dispatch timed out.
    Timeout,
    /// The response could not be parsed.
    ParseError,
    /// The external model reported rate limiting.
    RateLimit,
    /// The response was too thin to be useful.
    QualityLow,
    /// The chunk was too complex for the current tier.
    Complexity,
    /// Anything else.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::finding::Confidence;

    #[test]
    fn test_real_statuses() {
        assert!(ResultStatus::Completed.is_real());
        assert!(ResultStatus::Partial.is_real());
        assert!(ResultStatus::Failed.is_real());
        assert!(!ResultStatus::Placeholder.is_real());
        assert!(!ResultStatus::Pending.is_real());
    }

    #[test]
    fn test_placeholder_constructor() {
        let result = ChunkResult::placeholder("0a1b2c3d");
        assert_eq!(result.status, ResultStatus::Placeholder);
        assert!(result.findings.is_empty());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_failed_constructor() {
        let result = ChunkResult::failed("0a1b2c3d", "timeout after 300s");
        assert_eq!(result.status, ResultStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("timeout after 300s"));
    }

    #[test]
    fn test_completed_constructor() {
        let findings = vec![Finding::new("found it", Confidence::High)];
        let result = ChunkResult::completed("0a1b2c3d", findings);
        assert_eq!(result.status, ResultStatus::Completed);
        assert_eq!(result.findings.len(), 1);
    }

    #[test]
    fn test_result_serde_round_trip() {
        let result = ChunkResult::completed(
            "cafebabe",
            vec![Finding::new("x", Confidence::Medium)],
        );
        let json = serde_json::to_string(&result).unwrap();
        let back: ChunkResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&ResultStatus::Placeholder).unwrap(),
            "\"placeholder\""
        );
    }

    #[test]
    fn test_failure_type_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&FailureType::QualityLow).unwrap(),
            "\"quality_low\""
        );
        assert_eq!(
            serde_json::to_string(&FailureType::ParseError).unwrap(),
            "\"parse_error\""
        );
    }
}
