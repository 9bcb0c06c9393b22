//! Session configuration.
//!
//! An explicit struct with the full option surface; unknown keys are
//! rejected on load so stale or mistyped configuration fails fast.

use serde::{Deserialize, Serialize};

use crate::core::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_LAZY_DEPTH, DEFAULT_LAZY_FILE_LIMIT, MAX_CHUNK_OVERLAP,
    MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::error::{ChunkingError, ConfigError, Result};

/// Context composition strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Concatenate all non-pruned files.
    #[default]
    Full,
    /// Structure only; no content loading.
    Lazy,
    /// Load only the listed target paths.
    Targeted,
}

/// Specialised analysis profile used in prompt generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// General-purpose analysis.
    #[default]
    General,
    /// Security review focus.
    Security,
    /// Architecture review focus.
    Architecture,
    /// Performance review focus.
    Performance,
}

impl AgentType {
    /// Parses an agent type from its CLI spelling.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidModel`] for unknown names.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "general" => Ok(Self::General),
            "security" => Ok(Self::Security),
            "architecture" => Ok(Self::Architecture),
            "performance" => Ok(Self::Performance),
            other => Err(ConfigError::InvalidModel {
                name: other.to_string(),
            }
            .into()),
        }
    }

    /// Label used in prompts and serialisation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Security => "security",
            Self::Architecture => "architecture",
            Self::Performance => "performance",
        }
    }
}

/// Session configuration record.
///
/// Serialised inside the state file. `deny_unknown_fields` keeps loads
/// strict: a key this version does not understand is a config error, not
/// a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScanConfig {
    /// Characters per chunk (50 000–300 000).
    pub chunk_size: usize,
    /// Overlap between chunks (0–50 000, strictly less than `chunk_size`).
    pub chunk_overlap: usize,
    /// Maximum chunks dispatched per batch.
    pub max_parallel_agents: usize,
    /// Retry attempts for atomic writes.
    pub retry_count: usize,
    /// Per-chunk dispatch timeout in seconds.
    pub timeout_seconds: u64,
    /// Whether adaptive chunk sizing was applied at init.
    pub adaptive_chunking: bool,
    /// Content type detected by adaptive sizing.
    pub detected_content_type: Option<String>,
    /// Whether failed chunks may escalate to a stronger model tier.
    pub escalation_enabled: bool,
    /// Maximum fraction of chunks that may escalate.
    pub max_escalation_ratio: f64,
    /// Maximum estimated escalation cost in USD.
    pub max_escalation_cost_usd: f64,
    /// Whether incremental re-analysis is enabled.
    pub incremental_enabled: bool,
    /// Previous session hash used for delta computation.
    pub previous_session: Option<String>,
    /// Changed + added file count from the last delta.
    pub changed_file_count: usize,
    /// Deleted file count from the last delta.
    pub deleted_file_count: usize,
    /// Context composition strategy.
    pub scan_mode: ScanMode,
    /// Directory depth limit for lazy traversal.
    pub lazy_depth: usize,
    /// Entry limit for lazy traversal.
    pub lazy_file_limit: usize,
    /// Target paths for targeted mode.
    pub target_paths: Vec<String>,
    /// Analysis specialisation.
    pub agent_type: AgentType,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: 0,
            max_parallel_agents: 4,
            retry_count: 3,
            timeout_seconds: 300,
            adaptive_chunking: false,
            detected_content_type: None,
            escalation_enabled: false,
            max_escalation_ratio: 0.15,
            max_escalation_cost_usd: 5.0,
            incremental_enabled: false,
            previous_session: None,
            changed_file_count: 0,
            deleted_file_count: 0,
            scan_mode: ScanMode::Full,
            lazy_depth: DEFAULT_LAZY_DEPTH,
            lazy_file_limit: DEFAULT_LAZY_FILE_LIMIT,
            target_paths: Vec::new(),
            agent_type: AgentType::General,
        }
    }
}

impl ScanConfig {
    /// Validates chunk geometry and budget ranges.
    ///
    /// # Errors
    ///
    /// Returns a [`ChunkingError`] for size/overlap violations and a
    /// [`ConfigError`] for bad budget settings.
    pub fn validate(&self) -> Result<()> {
        validate_chunk_geometry(self.chunk_size, self.chunk_overlap)?;

        if self.max_parallel_agents == 0 {
            return Err(ConfigError::Invalid {
                reason: "max_parallel_agents must be > 0".to_string(),
            }
            .into());
        }
        if !(0.0..=1.0).contains(&self.max_escalation_ratio) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "max_escalation_ratio must be within 0.0-1.0, got {}",
                    self.max_escalation_ratio
                ),
            }
            .into());
        }
        if self.max_escalation_cost_usd < 0.0 {
            return Err(ConfigError::Invalid {
                reason: "max_escalation_cost_usd must be non-negative".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Validates a chunk size / overlap pair against the permitted ranges.
///
/// # Errors
///
/// Returns [`ChunkingError::InvalidChunkSize`] or
/// [`ChunkingError::InvalidOverlap`].
pub fn validate_chunk_geometry(size: usize, overlap: usize) -> Result<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
        return Err(ChunkingError::InvalidChunkSize { size }.into());
    }
    if overlap > MAX_CHUNK_OVERLAP || overlap >= size {
        return Err(ChunkingError::InvalidOverlap { overlap, size }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ScanConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.scan_mode, ScanMode::Full);
    }

    #[test]
    fn test_chunk_size_below_minimum_rejected() {
        assert!(validate_chunk_geometry(49_999, 0).is_err());
    }

    #[test]
    fn test_chunk_size_above_maximum_rejected() {
        assert!(validate_chunk_geometry(300_001, 0).is_err());
    }

    #[test]
    fn test_chunk_size_bounds_accepted() {
        assert!(validate_chunk_geometry(50_000, 0).is_ok());
        assert!(validate_chunk_geometry(300_000, 0).is_ok());
    }

    #[test]
    fn test_overlap_must_be_below_size() {
        assert!(validate_chunk_geometry(50_000, 50_000).is_err());
        assert!(validate_chunk_geometry(60_000, 50_000).is_ok());
    }

    #[test]
    fn test_overlap_above_cap_rejected() {
        assert!(validate_chunk_geometry(300_000, 50_001).is_err());
    }

    #[test]
    fn test_zero_parallel_agents_rejected() {
        let config = ScanConfig {
            max_parallel_agents: 0,
            ..ScanConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_escalation_ratio_range() {
        let config = ScanConfig {
            max_escalation_ratio: 1.5,
            ..ScanConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let config = ScanConfig {
            scan_mode: ScanMode::Targeted,
            target_paths: vec!["src".to_string()],
            agent_type: AgentType::Security,
            ..ScanConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ScanConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scan_mode, ScanMode::Targeted);
        assert_eq!(back.agent_type, AgentType::Security);
        assert_eq!(back.target_paths, vec!["src".to_string()]);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let json = r#"{"chunk_size": 150000, "mystery_knob": true}"#;
        let result: std::result::Result<ScanConfig, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn test_agent_type_parse() {
        assert_eq!(AgentType::parse("security").unwrap(), AgentType::Security);
        assert_eq!(AgentType::parse("GENERAL").unwrap(), AgentType::General);
        assert!(AgentType::parse("wizard").is_err());
    }
}
