//! Line-aware text fallback chunking.
//!
//! Used when a file has no grammar or fails to parse, and for splitting
//! oversized gap/error regions inside the semantic walk. Splitting is by
//! whole lines where possible; a single line longer than the budget is
//! hard-split at character boundaries.

use crate::core::chunk::compute_chunk_id;

use super::SemanticChunk;

/// Default overlap window between fallback chunks, in lines.
pub const DEFAULT_OVERLAP_LINES: usize = 5;

/// Splits `content` into line-aligned pieces of at most `max_chars`.
///
/// With `overlap_lines == 0` the concatenation of the produced chunk
/// contents equals `content` exactly. A non-zero overlap repeats the
/// trailing lines of each chunk at the head of the next to preserve
/// context across chunk boundaries.
#[must_use]
#[allow(clippy::too_many_arguments)]
pub fn split_lines(
    content: &str,
    rel_path: &str,
    first_line: usize,
    max_chars: usize,
    overlap_lines: usize,
    label: &str,
    language: Option<&str>,
    base_offset: usize,
) -> Vec<SemanticChunk> {
    if content.is_empty() || max_chars == 0 {
        return Vec::new();
    }

    // Split preserving terminators so concatenation stays byte-exact.
    let lines = split_keeping_newlines(content);
    let mut chunks = Vec::new();

    let mut index = 0usize;
    let mut line_number = first_line;
    let mut byte_offset = 0usize;

    while index < lines.len() {
        let line = lines[index];

        if line.len() > max_chars {
            // Oversized single line: hard-split at char boundaries.
            let mut rest = line;
            let mut piece_offset = byte_offset;
            while !rest.is_empty() {
                let mut cut = floor_char_boundary(rest, max_chars.min(rest.len()));
                if cut == 0 {
                    cut = ceil_char_boundary(rest, 1);
                }
                let (head, tail) = rest.split_at(cut);
                chunks.push(make_chunk(
                    head,
                    rel_path,
                    line_number,
                    line_number,
                    label,
                    language,
                    base_offset + piece_offset,
                    overlap_lines > 0,
                ));
                piece_offset += head.len();
                rest = tail;
            }
            byte_offset += line.len();
            index += 1;
            line_number += 1;
            continue;
        }

        // Accumulate whole lines up to the budget.
        let piece_start_line = line_number;
        let piece_start_byte = byte_offset;
        let start_index = index;
        let mut piece_len = 0usize;
        while index < lines.len()
            && lines[index].len() <= max_chars
            && (piece_len == 0 || piece_len + lines[index].len() <= max_chars)
        {
            piece_len += lines[index].len();
            index += 1;
            line_number += 1;
        }

        let piece: String = lines[start_index..index].concat();
        let newline_count = piece.matches('\n').count();
        let piece_end_line = if piece.ends_with('\n') && newline_count > 0 {
            piece_start_line + newline_count - 1
        } else {
            piece_start_line + newline_count
        };

        chunks.push(make_chunk(
            &piece,
            rel_path,
            piece_start_line,
            piece_end_line,
            label,
            language,
            base_offset + piece_start_byte,
            overlap_lines > 0,
        ));
        byte_offset = piece_start_byte + piece.len();

        // Step back for the overlap window, but always make progress.
        let lines_taken = index - start_index;
        if overlap_lines > 0 && index < lines.len() && lines_taken > overlap_lines {
            index -= overlap_lines;
            line_number -= overlap_lines;
            byte_offset -= lines[index..index + overlap_lines]
                .iter()
                .map(|l| l.len())
                .sum::<usize>();
        }
    }

    chunks
}

#[allow(clippy::too_many_arguments)]
fn make_chunk(
    content: &str,
    rel_path: &str,
    start_line: usize,
    end_line: usize,
    label: &str,
    language: Option<&str>,
    start_byte: usize,
    overlapped: bool,
) -> SemanticChunk {
    SemanticChunk {
        chunk_id: compute_chunk_id(rel_path, start_line, content),
        content: content.to_string(),
        rel_path: rel_path.to_string(),
        start_line,
        end_line,
        start_byte,
        end_byte: start_byte + content.len(),
        node_kind: label.to_string(),
        language: language.map(str::to_string),
        is_fallback: overlapped
            || label == "fallback_split"
            || label == "depth_limit_fallback",
    }
}

/// Splits into lines, each retaining its trailing `\n` when present.
fn split_keeping_newlines(content: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (idx, _) in content.match_indices('\n') {
        lines.push(&content[start..=idx]);
        start = idx + 1;
    }
    if start < content.len() {
        lines.push(&content[start..]);
    }
    lines
}

/// Largest byte index `<= pos` that falls on a char boundary.
fn floor_char_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut boundary = pos;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

/// Smallest byte index `>= pos` that falls on a char boundary.
fn ceil_char_boundary(s: &str, pos: usize) -> usize {
    let mut boundary = pos;
    while boundary < s.len() && !s.is_char_boundary(boundary) {
        boundary += 1;
    }
    boundary
}
