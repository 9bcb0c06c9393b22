//! Chunk records.
//!
//! A chunk is a contiguous byte range of the composed context (or of a
//! single source file under semantic chunking), materialised under the
//! session directory and identified by a deterministic 8-hex digest of
//! `(relative_path, start_line, content)`.

use serde::{Deserialize, Serialize};

/// Processing status of a chunk in the map phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// A real result exists.
    Completed,
    /// Dispatch failed; only escalation may retry.
    Failed,
}

/// A chunk of the analysis context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Deterministic 8-hex identifier.
    pub chunk_id: String,

    /// Path of the materialised chunk file under the session directory.
    pub file_path: String,

    /// Start byte offset in the source.
    pub start_offset: usize,

    /// End byte offset in the source (exclusive).
    pub end_offset: usize,

    /// Content size in bytes.
    pub size: usize,

    /// Map-phase status.
    #[serde(default)]
    pub status: ChunkState,

    /// Semantic node label (`function_item`, `gap_content`,
    /// `syntax_error_block`, `fallback_split`, `depth_limit_fallback`, …).
    #[serde(default)]
    pub node_kind: Option<String>,

    /// Language tag when the chunk came from the semantic chunker.
    #[serde(default)]
    pub language: Option<String>,

    /// Whether this chunk was produced by a fallback path.
    #[serde(default)]
    pub is_fallback: bool,

    /// 1-based first line of the chunk in its source file.
    #[serde(default)]
    pub start_line: usize,

    /// 1-based last line of the chunk in its source file.
    #[serde(default)]
    pub end_line: usize,
}

impl ChunkInfo {
    /// Creates a chunk record for a character-range chunk of the context.
    #[must_use]
    pub fn from_span(chunk_id: String, file_path: String, start: usize, end: usize) -> Self {
        Self {
            chunk_id,
            file_path,
            start_offset: start,
            end_offset: end,
            size: end - start,
            status: ChunkState::Pending,
            node_kind: None,
            language: None,
            is_fallback: false,
            start_line: 0,
            end_line: 0,
        }
    }
}

/// Computes the deterministic chunk id.
///
/// Always 8 lowercase hex characters; the same
/// `(relative_path, start_line, content)` triple yields the same id,
/// which is what makes cached results reusable across runs.
#[must_use]
pub fn compute_chunk_id(relative_path: &str, start_line: usize, content: &str) -> String {
    let mut buf = Vec::with_capacity(relative_path.len() + content.len() + 24);
    buf.extend_from_slice(relative_path.as_bytes());
    buf.push(0);
    buf.extend_from_slice(start_line.to_le_bytes().as_slice());
    buf.push(0);
    buf.extend_from_slice(content.as_bytes());

    let digest = xxhash_rust::xxh3::xxh3_64(&buf);
    format!("{:08x}", (digest & 0xffff_ffff) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_deterministic() {
        let a = compute_chunk_id("src/main.rs", 10, "fn main() {}");
        let b = compute_chunk_id("src/main.rs", 10, "fn main() {}");
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunk_id_is_8_hex() {
        let id = compute_chunk_id("a.txt", 1, "hello world");
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_chunk_id_sensitive_to_inputs() {
        let base = compute_chunk_id("a.txt", 1, "hello");
        assert_ne!(base, compute_chunk_id("b.txt", 1, "hello"));
        assert_ne!(base, compute_chunk_id("a.txt", 2, "hello"));
        assert_ne!(base, compute_chunk_id("a.txt", 1, "hello!"));
    }

    #[test]
    fn test_chunk_id_no_delimiter_collision() {
        // Path/content boundaries are NUL-separated, so shifting a byte
        // between fields changes the id.
        let a = compute_chunk_id("ab", 0, "c");
        let b = compute_chunk_id("a", 0, "bc");
        assert_ne!(a, b);
    }

    #[test]
    fn test_from_span() {
        let chunk = ChunkInfo::from_span(
            "00c0ffee".to_string(),
            "chunks/chunk_0000.txt".to_string(),
            5,
            25,
        );
        assert_eq!(chunk.size, 20);
        assert_eq!(chunk.status, ChunkState::Pending);
        assert!(!chunk.is_fallback);
    }

    #[test]
    fn test_chunk_state_serde_lowercase() {
        let json = serde_json::to_string(&ChunkState::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let back: ChunkState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(back, ChunkState::Failed);
    }

    #[test]
    fn test_chunk_info_serde_defaults() {
        // Older state files carry only the core fields.
        let json = r#"{
            "chunk_id": "deadbeef",
            "file_path": "chunks/chunk_0001.txt",
            "start_offset": 0,
            "end_offset": 10,
            "size": 10
        }"#;
        let chunk: ChunkInfo = serde_json::from_str(json).unwrap();
        assert_eq!(chunk.status, ChunkState::Pending);
        assert!(chunk.node_kind.is_none());
        assert_eq!(chunk.start_line, 0);
    }
}
