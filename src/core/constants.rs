//! Shared constants and small utility functions.
//!
//! Bottom layer of the dependency graph: size limits, timeout formulae,
//! the adaptive chunk-size table and output truncation. No imports from
//! other DeepScan modules.

use unicode_segmentation::UnicodeSegmentation;

/// Default sandbox execution timeout in seconds.
pub const DEFAULT_EXEC_TIMEOUT: u64 = 30;

/// Minimum chunking timeout in seconds.
pub const MIN_CHUNKING_TIMEOUT: u64 = 30;

/// Maximum chunking timeout in seconds.
pub const MAX_CHUNKING_TIMEOUT: u64 = 600;

/// Additional chunking timeout per megabyte of context.
pub const TIMEOUT_PER_MB: u64 = 10;

/// Grep worker timeout in seconds.
pub const GREP_TIMEOUT: u64 = 10;

/// Maximum content size the grep worker accepts (5 MiB).
pub const MAX_GREP_CONTENT_SIZE: usize = 5 * 1024 * 1024;

/// Budget for helper outputs returned to the REPL (characters).
pub const MAX_CONTEXT_PREVIEW: usize = 10_000;

/// Maximum sandbox code length in bytes.
pub const MAX_CODE_LENGTH: usize = 100_000;

/// Per-file size cap during context loading (10 MiB).
pub const MAX_SINGLE_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Total context size cap (50 MiB).
pub const MAX_TOTAL_CONTEXT_SIZE: usize = 50 * 1024 * 1024;

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 150_000;

/// Minimum permitted chunk size.
pub const MIN_CHUNK_SIZE: usize = 50_000;

/// Maximum permitted chunk size.
pub const MAX_CHUNK_SIZE: usize = 300_000;

/// Maximum permitted chunk overlap.
pub const MAX_CHUNK_OVERLAP: usize = 50_000;

/// Chunk count above which a warning is printed.
pub const MAX_RECOMMENDED_CHUNKS: usize = 500;

/// Chunk count above which chunking is refused outright.
pub const MAX_ABSOLUTE_CHUNKS: usize = 2_000;

/// Progress log size limit before rotation (10 MiB).
pub const DEFAULT_PROGRESS_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Poll interval for `progress --watch` in seconds.
pub const WATCH_POLL_INTERVAL: u64 = 2;

/// Default maximum directory depth for lazy traversal.
pub const DEFAULT_LAZY_DEPTH: usize = 3;

/// Default entry limit for lazy traversal.
pub const DEFAULT_LAZY_FILE_LIMIT: usize = 500;

/// Safety cap on tree-view rendering (entries).
pub const DEFAULT_TREE_VIEW_LIMIT: usize = 10_000;

/// Checkpoint write limit: above this a warning is logged (20 MiB).
pub const MAX_CHECKPOINT_WRITE_SIZE: u64 = 20 * 1024 * 1024;

/// Checkpoint read limit: above this loading is refused (100 MiB).
///
/// Asymmetric with the write limit so legacy checkpoints written before
/// the warning threshold existed can still be loaded.
pub const MAX_CHECKPOINT_READ_SIZE: u64 = 100 * 1024 * 1024;

/// Session garbage-collection age threshold in days.
pub const DEFAULT_GC_MAX_AGE_DAYS: u64 = 7;

/// Session garbage-collection total cache size budget (1 GiB).
pub const DEFAULT_GC_MAX_TOTAL_BYTES: u64 = 1024 * 1024 * 1024;

/// Broad content categories used for adaptive chunk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Source code files.
    Code,
    /// Configuration files.
    Config,
    /// Documentation and prose.
    Documentation,
}

impl ContentType {
    /// Recommended chunk size for this content type.
    #[must_use]
    pub const fn recommended_chunk_size(self) -> usize {
        match self {
            Self::Code => 100_000,
            Self::Config => 80_000,
            Self::Documentation => 200_000,
        }
    }

    /// Label stored in the configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Config => "config",
            Self::Documentation => "documentation",
        }
    }
}

const CODE_EXTENSIONS: &[&str] = &[
    ".rs", ".py", ".js", ".jsx", ".ts", ".tsx", ".go", ".java", ".c", ".cpp", ".cc", ".h", ".hpp",
    ".rb", ".php", ".cs", ".kt", ".swift", ".scala", ".sh",
];

const CONFIG_EXTENSIONS: &[&str] = &[
    ".json", ".yaml", ".yml", ".toml", ".ini", ".cfg", ".conf", ".env", ".properties", ".xml",
];

/// Detects the dominant content type from the file extensions seen while
/// composing a context. Ties resolve towards code, the most common case.
#[must_use]
pub fn detect_content_type(extensions: &[String]) -> ContentType {
    let mut code = 0usize;
    let mut config = 0usize;
    let mut docs = 0usize;

    for ext in extensions {
        let ext = ext.to_lowercase();
        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            code += 1;
        } else if CONFIG_EXTENSIONS.contains(&ext.as_str()) {
            config += 1;
        } else {
            docs += 1;
        }
    }

    if code >= config && code >= docs {
        ContentType::Code
    } else if config >= docs {
        ContentType::Config
    } else {
        ContentType::Documentation
    }
}

/// Computes the chunking timeout from the context size.
///
/// `MIN_CHUNKING_TIMEOUT + TIMEOUT_PER_MB` per megabyte, clamped to
/// `MAX_CHUNKING_TIMEOUT`.
#[must_use]
pub fn calculate_chunking_timeout(context_bytes: usize) -> u64 {
    let mb = (context_bytes / (1024 * 1024)) as u64;
    (MIN_CHUNKING_TIMEOUT + mb * TIMEOUT_PER_MB).min(MAX_CHUNKING_TIMEOUT)
}

/// Truncates output to a budget, grapheme-safe, appending an elision
/// marker that names how much was dropped.
#[must_use]
pub fn truncate_output(s: &str, max_chars: usize) -> String {
    let total = s.graphemes(true).count();
    if total <= max_chars {
        return s.to_string();
    }

    let kept: String = s.graphemes(true).take(max_chars).collect();
    format!("{kept}\n... [truncated {} chars]", total - max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_timeout_small_context() {
        assert_eq!(calculate_chunking_timeout(1024), MIN_CHUNKING_TIMEOUT);
    }

    #[test]
    fn test_chunking_timeout_scales_per_mb() {
        let five_mb = 5 * 1024 * 1024;
        assert_eq!(
            calculate_chunking_timeout(five_mb),
            MIN_CHUNKING_TIMEOUT + 5 * TIMEOUT_PER_MB
        );
    }

    #[test]
    fn test_chunking_timeout_capped() {
        let huge = 1024 * 1024 * 1024;
        assert_eq!(calculate_chunking_timeout(huge), MAX_CHUNKING_TIMEOUT);
    }

    #[test]
    fn test_truncate_output_under_budget() {
        assert_eq!(truncate_output("short", 100), "short");
    }

    #[test]
    fn test_truncate_output_over_budget() {
        let out = truncate_output("abcdefghij", 4);
        assert!(out.starts_with("abcd"));
        assert!(out.contains("truncated 6 chars"));
    }

    #[test]
    fn test_truncate_output_grapheme_safe() {
        // Family emoji is a single grapheme built from multiple scalars.
        let s = "👨‍👩‍👧x";
        let out = truncate_output(s, 1);
        assert!(out.starts_with("👨‍👩‍👧"));
    }

    #[test]
    fn test_detect_content_type_code_dominant() {
        let exts = vec![".rs".to_string(), ".rs".to_string(), ".md".to_string()];
        assert_eq!(detect_content_type(&exts), ContentType::Code);
    }

    #[test]
    fn test_detect_content_type_config() {
        let exts = vec![".yaml".to_string(), ".toml".to_string()];
        assert_eq!(detect_content_type(&exts), ContentType::Config);
    }

    #[test]
    fn test_detect_content_type_docs() {
        let exts = vec![".md".to_string(), ".txt".to_string()];
        assert_eq!(detect_content_type(&exts), ContentType::Documentation);
    }

    #[test]
    fn test_recommended_sizes() {
        assert_eq!(ContentType::Code.recommended_chunk_size(), 100_000);
        assert_eq!(ContentType::Config.recommended_chunk_size(), 80_000);
        assert_eq!(ContentType::Documentation.recommended_chunk_size(), 200_000);
    }
}
