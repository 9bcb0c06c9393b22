//! Finding records reported by the external analyser.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Confidence level attached to a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// High confidence.
    High,
    /// Medium confidence.
    Medium,
    /// Low confidence (also the mapping for unknown values).
    #[default]
    Low,
}

impl Confidence {
    /// Numeric score used when merging duplicate findings.
    #[must_use]
    pub const fn score(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    /// Parses a confidence value case-insensitively; unknown values map
    /// to `Low` so they never outrank a known level.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// A single point of evidence reported for a chunk.
///
/// A `NEEDS_VERIFICATION` prefix on `point` (with or without a colon) is
/// recognised by the aggregator, which sets `verification_required` and
/// strips the prefix from the stored text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// The claim being made.
    pub point: String,

    /// Supporting evidence (usually a quote from the chunk).
    #[serde(default)]
    pub evidence: String,

    /// Confidence level.
    #[serde(default)]
    pub confidence: Confidence,

    /// Optional location map (`file`, `line`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<BTreeMap<String, serde_json::Value>>,

    /// Whether the finding needs human verification.
    #[serde(default)]
    pub verification_required: bool,
}

impl Finding {
    /// Creates a finding with the given point and confidence.
    #[must_use]
    pub fn new(point: impl Into<String>, confidence: Confidence) -> Self {
        Self {
            point: point.into(),
            evidence: String::new(),
            confidence,
            location: None,
            verification_required: false,
        }
    }

    /// Sets the evidence text.
    #[must_use]
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    /// File referenced by the location map, if any.
    #[must_use]
    pub fn location_file(&self) -> Option<String> {
        self.location.as_ref().and_then(|loc| {
            loc.get("file").map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_scores() {
        assert_eq!(Confidence::High.score(), 3);
        assert_eq!(Confidence::Medium.score(), 2);
        assert_eq!(Confidence::Low.score(), 1);
    }

    #[test]
    fn test_confidence_parse_unknown_maps_to_low() {
        assert_eq!(Confidence::parse("HIGH"), Confidence::High);
        assert_eq!(Confidence::parse("Medium"), Confidence::Medium);
        assert_eq!(Confidence::parse("certain"), Confidence::Low);
        assert_eq!(Confidence::parse(""), Confidence::Low);
    }

    #[test]
    fn test_finding_deserialization_with_defaults() {
        let json = r#"{"point": "uses unwrap in hot path"}"#;
        let finding: Finding = serde_json::from_str(json).unwrap();
        assert_eq!(finding.confidence, Confidence::Low);
        assert!(finding.evidence.is_empty());
        assert!(!finding.verification_required);
    }

    #[test]
    fn test_location_file_extraction() {
        let json = r#"{
            "point": "config loaded at startup",
            "location": {"file": "src/config.rs", "line": 12}
        }"#;
        let finding: Finding = serde_json::from_str(json).unwrap();
        assert_eq!(finding.location_file().as_deref(), Some("src/config.rs"));
    }

    #[test]
    fn test_builder_helpers() {
        let finding = Finding::new("greets the world", Confidence::Medium)
            .with_evidence("hello world");
        assert_eq!(finding.point, "greets the world");
        assert_eq!(finding.evidence, "hello world");
    }
}
