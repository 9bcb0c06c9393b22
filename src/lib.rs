//! # DeepScan-RS
//!
//! Session engine for analysing large bodies of source text.
//!
//! DeepScan splits content that exceeds any single model context window
//! into semantically meaningful chunks, farms the chunks out for
//! independent analysis by an external model, and merges the per-chunk
//! findings into a coherent answer. Sessions are persistent, crash-safe,
//! resumable, and re-analysable incrementally when only a subset of
//! files changes.
//!
//! ## Components
//!
//! - **Chunking**: AST-guided, gap-coalescing splitting with text
//!   fallback ([`chunker`])
//! - **Sessions**: atomic, path-hardened state persistence ([`state`])
//! - **Map/reduce**: batched dispatch with checkpointing, cancellation
//!   and an escalation budget ([`driver`])
//! - **Incremental**: content-addressed manifests and deltas
//!   ([`incremental`])
//! - **Aggregation**: dedup, contradiction detection, relevance ranking
//!   ([`aggregate`])
//! - **Sandbox**: structurally validated, subprocess-isolated evaluation
//!   of untrusted REPL code ([`sandbox`])

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
// Note: unsafe is needed for memory-mapped I/O (memmap2)
#![warn(unsafe_code)]

pub mod aggregate;
pub mod cancel;
pub mod checkpoint;
pub mod chunker;
pub mod cli;
pub mod core;
pub mod driver;
pub mod error;
pub mod grep;
pub mod incremental;
pub mod io;
pub mod progress;
pub mod prompt;
pub mod sandbox;
pub mod state;
pub mod walker;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorCategory, ErrorCode, ErrorContext, Result};

// Re-export core domain types
pub use core::{
    AgentType, ChunkInfo, ChunkResult, Confidence, Finding, Phase, ResultStatus, ScanConfig,
    ScanMode, ScanState,
};

// Re-export the session engine surface
pub use checkpoint::{Checkpoint, CheckpointManager, atomic_write};
pub use driver::{AnalysisBackend, MapOptions, MapOutcome, MapReduceDriver};
pub use state::{InitOptions, StateManager, default_cache_root, list_sessions};

// Re-export chunking types
pub use chunker::{ChunkBudget, SemanticChunk, chunk_file, chunk_source, chunk_spans};

// Re-export aggregation types
pub use aggregate::{AggregationResult, Aggregator, FinalMarkerType, has_final_marker};

// Re-export sandbox types
pub use sandbox::{HelperDispatcher, HelperRequest, SandboxExecutor};

// Re-export incremental types
pub use incremental::{FileDelta, FileHashManifest, HashAlgorithm};

// Re-export CLI types
pub use cli::{Cli, Commands, execute, expand_shortcuts};
