//! Semantic chunking for DeepScan.
//!
//! Two strategies cover every input:
//!
//! - **Semantic**: AST-guided, gap-coalescing splitting that keeps
//!   functions and classes whole while preserving every byte of the
//!   original file ([`semantic::chunk_source`]).
//! - **Text fallback**: line-aware splitting with an overlap window,
//!   used for unknown languages and parse failures ([`text::split_lines`]).

pub mod language;
pub mod semantic;
pub mod text;

use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::core::config::validate_chunk_geometry;
use crate::error::Result;
use crate::incremental::{ChunkFileMapping, ChunkSpan};
use crate::walker::default_should_prune;

pub use language::Language;
pub use semantic::{TOKEN_SAFETY_MARGIN, chunk_file, chunk_source};
pub use text::{DEFAULT_OVERLAP_LINES, split_lines};

/// Default recursion depth limit for the semantic walk.
pub const DEFAULT_MAX_DEPTH: usize = 50;

/// A chunk produced by the semantic or fallback chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticChunk {
    /// Deterministic 8-hex identifier.
    pub chunk_id: String,
    /// Chunk content.
    pub content: String,
    /// Relative path of the source file.
    pub rel_path: String,
    /// 1-based first line.
    pub start_line: usize,
    /// 1-based last line.
    pub end_line: usize,
    /// Start byte in the source file.
    pub start_byte: usize,
    /// End byte in the source file (exclusive).
    pub end_byte: usize,
    /// Semantic node label (`function_item`, `gap_content`, …).
    pub node_kind: String,
    /// Language tag, when parsed.
    pub language: Option<String>,
    /// Whether a fallback path produced this chunk.
    pub is_fallback: bool,
}

/// Budgets applied to the semantic walk.
#[derive(Debug, Clone)]
pub struct ChunkBudget {
    /// Per-chunk character budget.
    pub max_chars: usize,
    /// Per-chunk token budget (before the safety margin).
    pub max_tokens: usize,
    /// Maximum recursion depth.
    pub max_depth: usize,
}

impl ChunkBudget {
    /// Budget derived from a chunk size, with tokens estimated at four
    /// characters each.
    #[must_use]
    pub const fn from_chunk_size(max_chars: usize) -> Self {
        Self {
            max_chars,
            max_tokens: max_chars / 4,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Estimates the token count of a piece of text.
///
/// One token per four characters, reduced by 20% when whitespace density
/// exceeds 30% (heavily indented or padded text tokenises denser).
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
pub fn estimate_tokens(content: &str) -> usize {
    if content.is_empty() {
        return 0;
    }
    let base = content.len().div_ceil(4);
    if whitespace_density(content) > 0.3 {
        (base as f64 * 0.8) as usize
    } else {
        base
    }
}

/// Fraction of characters that are whitespace.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn whitespace_density(content: &str) -> f64 {
    if content.is_empty() {
        return 0.0;
    }
    let ws = content.chars().filter(|c| c.is_whitespace()).count();
    ws as f64 / content.chars().count() as f64
}

/// Computes character-range chunk boundaries over a content length.
///
/// # Errors
///
/// Returns a chunking error when the geometry is outside the permitted
/// ranges (size 50 000–300 000, overlap 0–50 000 and below the size).
pub fn chunk_spans(content_len: usize, size: usize, overlap: usize) -> Result<Vec<(usize, usize)>> {
    validate_chunk_geometry(size, overlap)?;

    let mut spans = Vec::new();
    if content_len == 0 {
        return Ok(spans);
    }

    let step = size - overlap;
    let mut start = 0;
    loop {
        let end = (start + size).min(content_len);
        spans.push((start, end));
        if end >= content_len {
            break;
        }
        start += step;
    }
    Ok(spans)
}

/// Extensions handed to the semantic chunker during directory chunking.
const SEMANTIC_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "tsx", "jsx", "java", "go", "rs", "c", "cpp", "h", "hpp",
];

/// Chunks every recognised source file under a directory.
///
/// Files that fail to parse fall back to text chunking per file; files
/// the fallback also cannot handle are skipped with a warning. Returns
/// the chunks together with the file-to-chunk mapping used by
/// incremental re-analysis.
#[must_use]
pub fn chunk_directory(
    root: &Path,
    budget: &ChunkBudget,
) -> (Vec<SemanticChunk>, ChunkFileMapping) {
    let mut chunks = Vec::new();
    let mut mapping = ChunkFileMapping::default();

    let entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !default_should_prune(e.path()));

    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }
        let has_semantic_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SEMANTIC_EXTENSIONS.contains(&e.to_lowercase().as_str()));
        if !has_semantic_ext {
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .map_or_else(|_| path.display().to_string(), |r| r.display().to_string())
            .replace('\\', "/");

        match chunk_file(path, &rel, budget) {
            Ok(file_chunks) => {
                for chunk in &file_chunks {
                    mapping.record(
                        &rel,
                        ChunkSpan {
                            chunk_id: chunk.chunk_id.clone(),
                            start_offset: chunk.start_byte,
                            end_offset: chunk.end_byte,
                        },
                    );
                }
                chunks.extend(file_chunks);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "chunking failed, skipping file");
            }
        }
    }

    (chunks, mapping)
}
