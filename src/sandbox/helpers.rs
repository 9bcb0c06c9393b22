//! Helper capability table.
//!
//! Helpers are the bridge between sandboxed code and the session: an
//! enumerated set of capabilities, each with a typed request, dispatched
//! by the evaluator to whatever implements [`HelperDispatcher`] (in
//! practice the state manager). The worker process has no dispatcher, so
//! helper calls only work on the in-process execution path.

use crate::core::constants::{DEFAULT_CHUNK_SIZE, GREP_TIMEOUT};
use crate::error::SandboxError;

use super::eval::Value;

/// Names resolvable as helpers inside the sandbox.
pub const HELPER_NAMES: &[&str] = &[
    "peek",
    "peek_head",
    "peek_tail",
    "grep",
    "grep_file",
    "chunk_indices",
    "write_chunks",
    "add_buffer",
    "get_buffers",
    "clear_buffers",
    "add_result",
    "add_results_from_file",
    "set_phase",
    "set_final_answer",
    "get_status",
    "context_length",
    "is_lazy_mode",
    "get_tree_view",
    "preview_dir",
    "load_file",
];

/// Whether a name refers to a helper capability.
#[must_use]
pub fn is_helper_name(name: &str) -> bool {
    HELPER_NAMES.contains(&name)
}

/// Whether a piece of code mentions any helper name.
///
/// Used to pick the execution venue: helper-free code goes to the
/// killable worker process, helper code runs in-process where the state
/// manager is reachable.
#[must_use]
pub fn references_helpers(code: &str) -> bool {
    HELPER_NAMES.iter().any(|name| {
        code.match_indices(name).any(|(idx, _)| {
            let before_ok = idx == 0
                || !code[..idx]
                    .chars()
                    .next_back()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_');
            let after = idx + name.len();
            let after_ok = !code[after..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_');
            before_ok && after_ok
        })
    })
}

/// Typed helper requests.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperRequest {
    /// View a slice of the context.
    Peek {
        /// Start index (negative counts from the end).
        start: i64,
        /// End index; `None` means start + 3000.
        end: Option<i64>,
    },
    /// First `n` characters.
    PeekHead {
        /// Character count.
        n: usize,
    },
    /// Last `n` characters.
    PeekTail {
        /// Character count.
        n: usize,
    },
    /// Regex search over the context.
    Grep {
        /// Pattern.
        pattern: String,
        /// Result cap.
        max_matches: usize,
        /// Context window around matches.
        window: usize,
        /// Timeout in seconds.
        timeout: u64,
    },
    /// Regex search over one file.
    GrepFile {
        /// Pattern.
        pattern: String,
        /// Relative file path.
        path: String,
        /// Result cap.
        max_matches: usize,
        /// Context window around matches.
        window: usize,
    },
    /// Compute chunk boundaries without writing.
    ChunkIndices {
        /// Chunk size in characters.
        size: usize,
        /// Overlap in characters.
        overlap: usize,
    },
    /// Materialise chunks under the session directory.
    WriteChunks {
        /// Output directory relative to the session directory.
        out_dir: Option<String>,
        /// Chunk size in characters.
        size: usize,
        /// Overlap in characters.
        overlap: usize,
        /// Use AST-guided semantic chunking.
        semantic: bool,
    },
    /// Append to the scratch buffers.
    AddBuffer {
        /// Text to append.
        text: String,
    },
    /// Read the scratch buffers.
    GetBuffers,
    /// Clear the scratch buffers.
    ClearBuffers,
    /// Record a chunk result.
    AddResult {
        /// Result record as JSON.
        result: serde_json::Value,
    },
    /// Import chunk results from a JSON file.
    AddResultsFromFile {
        /// Path to the JSON file.
        path: String,
    },
    /// Update the session phase.
    SetPhase {
        /// New phase label.
        phase: String,
    },
    /// Record the final answer and complete the session.
    SetFinalAnswer {
        /// Final answer text.
        answer: String,
    },
    /// Session status summary.
    GetStatus,
    /// Length of the loaded context.
    ContextLength,
    /// Whether lazy mode is active.
    IsLazyMode,
    /// Directory tree view.
    GetTreeView,
    /// Tree view of a subdirectory.
    PreviewDir {
        /// Relative path within the context.
        subpath: String,
        /// Depth limit.
        max_depth: usize,
        /// Entry limit.
        max_files: usize,
    },
    /// Load one file's content.
    LoadFile {
        /// Relative path within the context.
        path: String,
    },
}

/// Receiver for helper requests.
pub trait HelperDispatcher {
    /// Executes a helper request, returning its JSON response.
    ///
    /// # Errors
    ///
    /// Propagates the underlying session error (lazy-mode refusals, size
    /// caps, grep rejections, …).
    fn dispatch(&mut self, request: HelperRequest) -> crate::error::Result<serde_json::Value>;
}

fn arg_err(message: impl Into<String>) -> SandboxError {
    SandboxError::Eval {
        message: message.into(),
    }
}

fn get_arg<'a>(
    _name: &str,
    position: usize,
    kw: &str,
    args: &'a [Value],
    kwargs: &'a [(String, Value)],
) -> Option<&'a Value> {
    args.get(position)
        .or_else(|| kwargs.iter().find(|(k, _)| k == kw).map(|(_, v)| v))
}

fn int_of(value: &Value, what: &str) -> Result<i64, SandboxError> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(arg_err(format!("{what} must be an integer, got {}", other.repr()))),
    }
}

fn usize_of(value: &Value, what: &str) -> Result<usize, SandboxError> {
    let i = int_of(value, what)?;
    usize::try_from(i).map_err(|_| arg_err(format!("{what} must be non-negative")))
}

fn str_of(value: &Value, what: &str) -> Result<String, SandboxError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(arg_err(format!("{what} must be a string, got {}", other.repr()))),
    }
}

/// Builds a typed helper request from call-site arguments.
///
/// # Errors
///
/// Returns an evaluation error for unknown helpers or malformed
/// arguments.
#[allow(clippy::too_many_lines)]
pub fn build_request(
    name: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<HelperRequest, SandboxError> {
    match name {
        "peek" => {
            let start = get_arg(name, 0, "start", args, kwargs)
                .map_or(Ok(0), |v| int_of(v, "start"))?;
            let end = get_arg(name, 1, "end", args, kwargs)
                .map(|v| int_of(v, "end"))
                .transpose()?;
            Ok(HelperRequest::Peek { start, end })
        }
        "peek_head" => {
            let n = get_arg(name, 0, "n", args, kwargs)
                .map_or(Ok(3000), |v| usize_of(v, "n"))?;
            Ok(HelperRequest::PeekHead { n })
        }
        "peek_tail" => {
            let n = get_arg(name, 0, "n", args, kwargs)
                .map_or(Ok(3000), |v| usize_of(v, "n"))?;
            Ok(HelperRequest::PeekTail { n })
        }
        "grep" => {
            let pattern = get_arg(name, 0, "pattern", args, kwargs)
                .ok_or_else(|| arg_err("grep() requires a pattern"))
                .and_then(|v| str_of(v, "pattern"))?;
            let max_matches = get_arg(name, 1, "max_matches", args, kwargs)
                .map_or(Ok(20), |v| usize_of(v, "max_matches"))?;
            let window = get_arg(name, 2, "window", args, kwargs)
                .map_or(Ok(100), |v| usize_of(v, "window"))?;
            Ok(HelperRequest::Grep {
                pattern,
                max_matches,
                window,
                timeout: GREP_TIMEOUT,
            })
        }
        "grep_file" => {
            let pattern = get_arg(name, 0, "pattern", args, kwargs)
                .ok_or_else(|| arg_err("grep_file() requires a pattern"))
                .and_then(|v| str_of(v, "pattern"))?;
            let path = get_arg(name, 1, "filepath", args, kwargs)
                .ok_or_else(|| arg_err("grep_file() requires a file path"))
                .and_then(|v| str_of(v, "filepath"))?;
            let max_matches = get_arg(name, 2, "max_matches", args, kwargs)
                .map_or(Ok(20), |v| usize_of(v, "max_matches"))?;
            let window = get_arg(name, 3, "window", args, kwargs)
                .map_or(Ok(100), |v| usize_of(v, "window"))?;
            Ok(HelperRequest::GrepFile {
                pattern,
                path,
                max_matches,
                window,
            })
        }
        "chunk_indices" => {
            let size = get_arg(name, 0, "size", args, kwargs)
                .map_or(Ok(DEFAULT_CHUNK_SIZE), |v| usize_of(v, "size"))?;
            let overlap = get_arg(name, 1, "overlap", args, kwargs)
                .map_or(Ok(0), |v| usize_of(v, "overlap"))?;
            Ok(HelperRequest::ChunkIndices { size, overlap })
        }
        "write_chunks" => {
            let out_dir = get_arg(name, 0, "out_dir", args, kwargs)
                .map(|v| match v {
                    Value::None => Ok(None),
                    other => str_of(other, "out_dir").map(Some),
                })
                .transpose()?
                .flatten();
            let size = get_arg(name, 1, "size", args, kwargs)
                .map_or(Ok(DEFAULT_CHUNK_SIZE), |v| usize_of(v, "size"))?;
            let overlap = get_arg(name, 2, "overlap", args, kwargs)
                .map_or(Ok(0), |v| usize_of(v, "overlap"))?;
            let semantic = get_arg(name, 3, "semantic", args, kwargs)
                .is_some_and(Value::truthy);
            Ok(HelperRequest::WriteChunks {
                out_dir,
                size,
                overlap,
                semantic,
            })
        }
        "add_buffer" => {
            let text = get_arg(name, 0, "text", args, kwargs)
                .ok_or_else(|| arg_err("add_buffer() requires text"))
                .map(|v| v.to_display())?;
            Ok(HelperRequest::AddBuffer { text })
        }
        "get_buffers" => Ok(HelperRequest::GetBuffers),
        "clear_buffers" => Ok(HelperRequest::ClearBuffers),
        "add_result" => {
            let result = get_arg(name, 0, "result", args, kwargs)
                .ok_or_else(|| arg_err("add_result() requires a result dict"))
                .map(Value::to_json)?;
            Ok(HelperRequest::AddResult { result })
        }
        "add_results_from_file" => {
            let path = get_arg(name, 0, "file_path", args, kwargs)
                .ok_or_else(|| arg_err("add_results_from_file() requires a path"))
                .and_then(|v| str_of(v, "file_path"))?;
            Ok(HelperRequest::AddResultsFromFile { path })
        }
        "set_phase" => {
            let phase = get_arg(name, 0, "phase", args, kwargs)
                .ok_or_else(|| arg_err("set_phase() requires a phase"))
                .and_then(|v| str_of(v, "phase"))?;
            Ok(HelperRequest::SetPhase { phase })
        }
        "set_final_answer" => {
            let answer = get_arg(name, 0, "answer", args, kwargs)
                .ok_or_else(|| arg_err("set_final_answer() requires an answer"))
                .map(|v| v.to_display())?;
            Ok(HelperRequest::SetFinalAnswer { answer })
        }
        "get_status" => Ok(HelperRequest::GetStatus),
        "context_length" => Ok(HelperRequest::ContextLength),
        "is_lazy_mode" => Ok(HelperRequest::IsLazyMode),
        "get_tree_view" => Ok(HelperRequest::GetTreeView),
        "preview_dir" => {
            let subpath = get_arg(name, 0, "subpath", args, kwargs)
                .ok_or_else(|| arg_err("preview_dir() requires a path"))
                .and_then(|v| str_of(v, "subpath"))?;
            let max_depth = get_arg(name, 1, "max_depth", args, kwargs)
                .map_or(Ok(2), |v| usize_of(v, "max_depth"))?;
            let max_files = get_arg(name, 2, "max_files", args, kwargs)
                .map_or(Ok(30), |v| usize_of(v, "max_files"))?;
            Ok(HelperRequest::PreviewDir {
                subpath,
                max_depth,
                max_files,
            })
        }
        "load_file" => {
            let path = get_arg(name, 0, "filepath", args, kwargs)
                .ok_or_else(|| arg_err("load_file() requires a path"))
                .and_then(|v| str_of(v, "filepath"))?;
            Ok(HelperRequest::LoadFile { path })
        }
        other => Err(arg_err(format!("unknown helper: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_names_resolve() {
        assert!(is_helper_name("peek"));
        assert!(is_helper_name("write_chunks"));
        assert!(!is_helper_name("eval"));
    }

    #[test]
    fn test_references_helpers_word_boundaries() {
        assert!(references_helpers("peek(0, 10)"));
        assert!(references_helpers("x = context_length()"));
        // Substrings inside longer identifiers do not count.
        assert!(!references_helpers("peeking = 1"));
        assert!(!references_helpers("my_peek_head_thing = 2"));
        assert!(!references_helpers("x = 1 + 2"));
    }

    #[test]
    fn test_build_peek_defaults() {
        let req = build_request("peek", &[], &[]).unwrap();
        assert_eq!(req, HelperRequest::Peek { start: 0, end: None });
    }

    #[test]
    fn test_build_grep_with_kwargs() {
        let req = build_request(
            "grep",
            &[Value::Str("fn main".to_string())],
            &[("max_matches".to_string(), Value::Int(5))],
        )
        .unwrap();
        let HelperRequest::Grep {
            pattern,
            max_matches,
            window,
            ..
        } = req
        else {
            panic!("expected grep request");
        };
        assert_eq!(pattern, "fn main");
        assert_eq!(max_matches, 5);
        assert_eq!(window, 100);
    }

    #[test]
    fn test_build_grep_missing_pattern() {
        assert!(build_request("grep", &[], &[]).is_err());
    }

    #[test]
    fn test_build_chunk_indices_defaults() {
        let req = build_request("chunk_indices", &[], &[]).unwrap();
        assert_eq!(
            req,
            HelperRequest::ChunkIndices {
                size: DEFAULT_CHUNK_SIZE,
                overlap: 0
            }
        );
    }

    #[test]
    fn test_build_write_chunks_semantic_kwarg() {
        let req = build_request(
            "write_chunks",
            &[],
            &[("semantic".to_string(), Value::Bool(true))],
        )
        .unwrap();
        let HelperRequest::WriteChunks { semantic, out_dir, .. } = req else {
            panic!("expected write_chunks request");
        };
        assert!(semantic);
        assert!(out_dir.is_none());
    }

    #[test]
    fn test_build_unknown_helper() {
        assert!(build_request("transmogrify", &[], &[]).is_err());
    }

    #[test]
    fn test_bad_argument_types_rejected() {
        assert!(build_request("peek", &[Value::Str("zero".to_string())], &[]).is_err());
        assert!(
            build_request("load_file", &[Value::Int(7)], &[]).is_err()
        );
    }
}
