//! Core domain models for DeepScan.
//!
//! This module contains the fundamental data structures used throughout
//! the session engine: configuration, chunk records, findings, chunk
//! results and the serialised state. These are pure domain models with no
//! I/O dependencies.

pub mod chunk;
pub mod config;
pub mod constants;
pub mod finding;
pub mod result;
pub mod session;
pub mod state;

pub use chunk::{ChunkInfo, ChunkState, compute_chunk_id};
pub use config::{AgentType, ScanConfig, ScanMode, validate_chunk_geometry};
pub use constants::ContentType;
pub use finding::{Confidence, Finding};
pub use result::{ChunkResult, FailureType, ResultStatus};
pub use session::{generate_session_hash, validate_session_hash};
pub use state::{ContextMetadata, Phase, ScanState, STATE_VERSION};
