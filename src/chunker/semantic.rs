//! AST-guided semantic chunking.
//!
//! Walks the syntax tree with a "last processed byte" cursor. Scope and
//! compound nodes that fit the budget are emitted whole; oversized ones
//! are recursed into. Bytes between recognised nodes coalesce into
//! `gap_content` chunks, so the concatenation of all chunk contents, in
//! order, equals the original file exactly.

use std::path::Path;

use crate::core::constants::MAX_CHUNK_SIZE;
use crate::error::{ChunkingError, Result, StateError};

use super::language::{Language, is_compound_kind, is_scope_kind};
use super::text::{DEFAULT_OVERLAP_LINES, split_lines};
use super::{ChunkBudget, SemanticChunk, estimate_tokens};

/// Fraction of the raw token budget a chunk may actually use.
pub const TOKEN_SAFETY_MARGIN: f64 = 0.8;

/// Chunks a single source file.
///
/// Unknown languages and parse failures degrade to the line-aware text
/// fallback (with the default overlap window); syntax errors inside an
/// otherwise parseable file surface as `syntax_error_block` chunks.
///
/// # Errors
///
/// Returns [`StateError::Io`] if the file cannot be read and
/// [`ChunkingError::ChunkTooLarge`] if the requested budget exceeds the
/// permitted maximum.
pub fn chunk_file(path: &Path, rel_path: &str, budget: &ChunkBudget) -> Result<Vec<SemanticChunk>> {
    let content = std::fs::read_to_string(path).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    chunk_source(&content, rel_path, Language::from_path(path), budget)
}

/// Chunks in-memory source content.
///
/// # Errors
///
/// Returns [`ChunkingError::ChunkTooLarge`] if the budget exceeds the
/// permitted maximum chunk size.
pub fn chunk_source(
    content: &str,
    rel_path: &str,
    language: Option<Language>,
    budget: &ChunkBudget,
) -> Result<Vec<SemanticChunk>> {
    if budget.max_chars > MAX_CHUNK_SIZE {
        return Err(ChunkingError::ChunkTooLarge {
            size: budget.max_chars,
            max: MAX_CHUNK_SIZE,
        }
        .into());
    }
    if content.is_empty() {
        return Ok(Vec::new());
    }

    let Some(language) = language else {
        return Ok(text_fallback(content, rel_path, budget));
    };

    let mut parser = tree_sitter::Parser::new();
    if parser.set_language(&language.grammar()).is_err() {
        tracing::warn!(language = language.as_str(), "grammar rejected, using text fallback");
        return Ok(text_fallback(content, rel_path, budget));
    }

    let Some(tree) = parser.parse(content, None) else {
        tracing::debug!(path = rel_path, "parse returned no tree, using text fallback");
        return Ok(text_fallback(content, rel_path, budget));
    };

    let mut walker = Walker {
        source: content,
        rel_path,
        lang_tag: language.as_str(),
        budget,
        cursor: 0,
        cursor_row: 0,
        chunks: Vec::new(),
    };

    let root = tree.root_node();
    walker.walk(root, 0);
    walker.flush_gap(content.len(), root.end_position().row);

    Ok(walker.chunks)
}

fn text_fallback(content: &str, rel_path: &str, budget: &ChunkBudget) -> Vec<SemanticChunk> {
    split_lines(
        content,
        rel_path,
        1,
        budget.max_chars,
        DEFAULT_OVERLAP_LINES,
        "fallback_split",
        None,
        0,
    )
}

struct Walker<'a> {
    source: &'a str,
    rel_path: &'a str,
    lang_tag: &'a str,
    budget: &'a ChunkBudget,
    /// Last processed byte.
    cursor: usize,
    /// 0-based row of the cursor position.
    cursor_row: usize,
    chunks: Vec<SemanticChunk>,
}

impl Walker<'_> {
    fn walk(&mut self, node: tree_sitter::Node<'_>, depth: usize) {
        for i in 0..node.named_child_count() {
            let Some(child) = node.named_child(i) else {
                continue;
            };

            if child.is_error() || child.kind() == "ERROR" {
                self.emit_node(child, "syntax_error_block");
                continue;
            }

            let kind = child.kind();
            if is_scope_kind(kind) || is_compound_kind(kind) {
                if self.fits(child) {
                    self.emit_node(child, kind);
                } else if depth + 1 > self.budget.max_depth {
                    self.emit_node(child, "depth_limit_fallback");
                } else {
                    self.walk(child, depth + 1);
                }
            }
            // Anything else stays in the gap stream and coalesces.
        }
    }

    /// Whether a node fits the character budget and the effective token
    /// budget (80% of the raw token limit).
    fn fits(&self, node: tree_sitter::Node<'_>) -> bool {
        let len = node.end_byte() - node.start_byte();
        if len > self.budget.max_chars {
            return false;
        }
        let content = &self.source[node.start_byte()..node.end_byte()];
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let effective = (self.budget.max_tokens as f64 * TOKEN_SAFETY_MARGIN) as usize;
        estimate_tokens(content) <= effective
    }

    /// Emits any pending gap content up to `until_byte`.
    fn flush_gap(&mut self, until_byte: usize, until_row: usize) {
        if until_byte <= self.cursor {
            return;
        }
        let gap = &self.source[self.cursor..until_byte];
        let start_line = self.cursor_row + 1;

        if gap.len() > self.budget.max_chars {
            self.chunks.extend(split_lines(
                gap,
                self.rel_path,
                start_line,
                self.budget.max_chars,
                0,
                "gap_content",
                Some(self.lang_tag),
                self.cursor,
            ));
        } else {
            self.chunks.push(SemanticChunk {
                chunk_id: crate::core::chunk::compute_chunk_id(self.rel_path, start_line, gap),
                content: gap.to_string(),
                rel_path: self.rel_path.to_string(),
                start_line,
                end_line: (until_row + 1).max(start_line),
                start_byte: self.cursor,
                end_byte: until_byte,
                node_kind: "gap_content".to_string(),
                language: Some(self.lang_tag.to_string()),
                is_fallback: false,
            });
        }

        self.cursor = until_byte;
        self.cursor_row = until_row;
    }

    /// Emits a node as a chunk (line-split when oversized) after
    /// flushing the gap before it.
    fn emit_node(&mut self, node: tree_sitter::Node<'_>, label: &str) {
        self.flush_gap(node.start_byte(), node.start_position().row);

        let content = &self.source[node.start_byte()..node.end_byte()];
        // Line numbers come from the parser's node points, not from
        // scanning the buffer.
        let start_line = node.start_position().row + 1;
        let end_line = node.end_position().row + 1;

        if content.len() > self.budget.max_chars {
            self.chunks.extend(split_lines(
                content,
                self.rel_path,
                start_line,
                self.budget.max_chars,
                0,
                label,
                Some(self.lang_tag),
                node.start_byte(),
            ));
        } else if !content.is_empty() {
            self.chunks.push(SemanticChunk {
                chunk_id: crate::core::chunk::compute_chunk_id(self.rel_path, start_line, content),
                content: content.to_string(),
                rel_path: self.rel_path.to_string(),
                start_line,
                end_line,
                start_byte: node.start_byte(),
                end_byte: node.end_byte(),
                node_kind: label.to_string(),
                language: Some(self.lang_tag.to_string()),
                is_fallback: label == "depth_limit_fallback",
            });
        }

        self.cursor = node.end_byte();
        self.cursor_row = node.end_position().row;
    }
}
