//! The serialised session record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::chunk::ChunkInfo;
use crate::core::config::ScanConfig;
use crate::core::result::ChunkResult;

/// Current state-file schema version.
pub const STATE_VERSION: u32 = 2;

/// Phase of a session's lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Context loaded, nothing chunked yet.
    #[default]
    Initialized,
    /// Chunks have been materialised.
    Chunking,
    /// Map phase in progress.
    Map,
    /// Reduce phase in progress.
    Reduce,
    /// Final answer produced.
    Completed,
}

impl Phase {
    /// Parses a phase label.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "initialized" => Some(Self::Initialized),
            "chunking" => Some(Self::Chunking),
            "map" => Some(Self::Map),
            "reduce" => Some(Self::Reduce),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Chunking => "chunking",
            Self::Map => "map",
            Self::Reduce => "reduce",
            Self::Completed => "completed",
        }
    }
}

/// Metadata about the loaded context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    /// Absolute context path.
    pub path: String,
    /// When the context was loaded.
    pub loaded_at: DateTime<Utc>,
    /// Composed context size in bytes.
    pub total_size: usize,
    /// Whether the context path is a directory.
    pub is_directory: bool,
    /// Number of files composed into the context.
    pub file_count: usize,
}

/// The full serialised session record.
///
/// Unknown fields are ignored on load, which is what keeps old binaries
/// able to read state written by newer ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanState {
    /// Schema version.
    pub version: u32,
    /// Session identifier (equals the session hash).
    pub session_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Session configuration.
    pub config: ScanConfig,
    /// Context metadata.
    pub context_meta: Option<ContextMetadata>,
    /// The analysis query.
    pub query: Option<String>,
    /// Chunk index.
    pub chunks: Vec<ChunkInfo>,
    /// Chunk results.
    pub results: Vec<ChunkResult>,
    /// Scratch buffers accumulated during the REPL session.
    pub buffers: Vec<String>,
    /// Lifecycle phase.
    pub phase: Phase,
    /// Completed-chunk fraction as a percentage.
    pub progress_percent: f64,
    /// Final answer; non-null exactly when `phase` is `Completed`.
    pub final_answer: Option<String>,
}

impl Default for ScanState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            session_id: String::new(),
            created_at: now,
            updated_at: now,
            config: ScanConfig::default(),
            context_meta: None,
            query: None,
            chunks: Vec::new(),
            results: Vec::new(),
            buffers: Vec::new(),
            phase: Phase::Initialized,
            progress_percent: 0.0,
            final_answer: None,
        }
    }
}

impl ScanState {
    /// Creates a fresh state record for a session.
    #[must_use]
    pub fn new(session_id: impl Into<String>, config: ScanConfig) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            ..Self::default()
        }
    }

    /// Recomputes `progress_percent` from the result list.
    ///
    /// Progress counts chunks with a real result against the total chunk
    /// count; placeholders and pendings do not advance it.
    #[allow(clippy::cast_precision_loss)]
    pub fn recompute_progress(&mut self) {
        let total = self.chunks.len();
        if total == 0 {
            self.progress_percent = 0.0;
            return;
        }
        let done = self
            .chunks
            .iter()
            .filter(|c| {
                self.results
                    .iter()
                    .any(|r| r.chunk_id == c.chunk_id && r.status.is_real())
            })
            .count();
        self.progress_percent = done as f64 / total as f64 * 100.0;
    }

    /// Marks the session complete with its final answer.
    pub fn set_final_answer(&mut self, answer: impl Into<String>) {
        self.final_answer = Some(answer.into());
        self.phase = Phase::Completed;
        self.progress_percent = 100.0;
    }
}
