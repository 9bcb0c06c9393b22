//! ReDoS-screened, size-capped, timeout-bounded regex search.
//!
//! Two layers: a heuristic screen over the pattern (nested quantifiers
//! and friends are refused before anything runs), then execution on a
//! dedicated thread with a hard wall-clock timeout. The regex engine is
//! linear-time, so the screen plus the timeout is the whole defence; the
//! rejection and timeout contracts match what callers of the original
//! process-isolated worker expect.

use std::sync::OnceLock;
use std::sync::mpsc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::constants::{GREP_TIMEOUT, MAX_GREP_CONTENT_SIZE};
use crate::error::{GrepError, Result};

/// Default cap on returned matches.
pub const DEFAULT_MAX_MATCHES: usize = 20;

/// Default context window around each match, in characters.
pub const DEFAULT_WINDOW: usize = 100;

/// Shapes that suggest catastrophic backtracking in common engines.
const REDOS_SHAPES: &[&str] = &[
    // (a+)+ , (a*)* , (a+)* , (a*)+
    r"\([^)]*[+*]\)[+*]",
    // (?:...)+ and (?:...)* with an inner quantifier
    r"\(\?:[^)]*[+*]\)[+*]",
    // Named-group variants: (?P<x>a+)+
    r"\(\?P?<[^>]*>[^)]*[+*]\)[+*]",
    // Repeated alternation where a branch itself repeats: (a+|b)+
    r"\([^)]*[+*][^)]*\|[^)]*\)[+*]",
    r"\([^)]*\|[^)]*[+*][^)]*\)[+*]",
    // Character-class nested quantifiers: ([a-z]+)+
    r"\(\[[^\]]*\][+*]\)[+*]",
    // Unbounded repetition braces on a group: (a+){2,}
    r"\([^)]*[+*]\)\{\d+,\}?",
];

fn redos_screens() -> &'static Vec<Regex> {
    static SCREENS: OnceLock<Vec<Regex>> = OnceLock::new();
    SCREENS.get_or_init(|| {
        REDOS_SHAPES
            .iter()
            .filter_map(|shape| Regex::new(shape).ok())
            .collect()
    })
}

/// Whether a pattern passes the ReDoS heuristic screen.
#[must_use]
pub fn is_safe_regex(pattern: &str) -> bool {
    !redos_screens().iter().any(|screen| screen.is_match(pattern))
}

/// A single grep match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrepMatch {
    /// Matched text.
    pub r#match: String,
    /// `[start, end)` byte span in the content.
    pub span: (usize, usize),
    /// Match with surrounding context.
    pub snippet: String,
}

/// Searches `content` for `pattern` with ReDoS screening and a timeout.
///
/// # Errors
///
/// - [`GrepError::DangerousPattern`] when the screen matches (no search
///   is started);
/// - [`GrepError::ContentTooLarge`] past the 5 MiB cap, with
///   alternatives named in the message;
/// - [`GrepError::InvalidPattern`] when the pattern fails to compile;
/// - [`GrepError::Timeout`] when the search thread misses the deadline.
pub fn safe_grep(
    pattern: &str,
    content: &str,
    max_matches: usize,
    window: usize,
    timeout_secs: u64,
) -> Result<Vec<GrepMatch>> {
    if !is_safe_regex(pattern) {
        return Err(GrepError::DangerousPattern.into());
    }

    if content.len() > MAX_GREP_CONTENT_SIZE {
        return Err(GrepError::ContentTooLarge {
            size: content.len(),
            limit: MAX_GREP_CONTENT_SIZE,
        }
        .into());
    }

    let regex = Regex::new(pattern).map_err(|e| GrepError::InvalidPattern {
        reason: e.to_string(),
    })?;

    let owned_content = content.to_string();
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("grep-worker".to_string())
        .spawn(move || {
            let matches = run_search(&regex, &owned_content, max_matches, window);
            let _ = tx.send(matches);
        });
    if let Err(e) = spawned {
        return Err(GrepError::InvalidPattern {
            reason: format!("worker thread failed to start: {e}"),
        }
        .into());
    }

    match rx.recv_timeout(Duration::from_secs(timeout_secs)) {
        Ok(matches) => Ok(matches),
        Err(_) => Err(GrepError::Timeout {
            seconds: timeout_secs,
        }
        .into()),
    }
}

/// [`safe_grep`] with the default caps and timeout.
///
/// # Errors
///
/// Same as [`safe_grep`].
pub fn safe_grep_default(pattern: &str, content: &str) -> Result<Vec<GrepMatch>> {
    safe_grep(
        pattern,
        content,
        DEFAULT_MAX_MATCHES,
        DEFAULT_WINDOW,
        GREP_TIMEOUT,
    )
}

fn run_search(regex: &Regex, content: &str, max_matches: usize, window: usize) -> Vec<GrepMatch> {
    let mut matches = Vec::new();
    for found in regex.find_iter(content) {
        let (start, end) = (found.start(), found.end());
        let snippet_start = floor_boundary(content, start.saturating_sub(window));
        let snippet_end = ceil_boundary(content, (end + window).min(content.len()));

        matches.push(GrepMatch {
            r#match: found.as_str().to_string(),
            span: (start, end),
            snippet: content[snippet_start..snippet_end].to_string(),
        });

        if matches.len() >= max_matches {
            break;
        }
    }
    matches
}

fn floor_boundary(s: &str, mut pos: usize) -> usize {
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_boundary(s: &str, mut pos: usize) -> usize {
    while pos < s.len() && !s.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("(a+)+$"; "classic nested plus")]
    #[test_case("(a*)*"; "nested star")]
    #[test_case("(?:ab+)+"; "non capturing nested")]
    #[test_case("(?P<name>x+)+"; "named group nested")]
    #[test_case("([a-z]+)+"; "char class nested")]
    #[test_case("(\\d+){3,}"; "unbounded braces")]
    fn test_redos_shapes_rejected(pattern: &str) {
        assert!(!is_safe_regex(pattern));
        let err = safe_grep(pattern, "benign content", 20, 100, 10).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Grep(GrepError::DangerousPattern)
        ));
    }

    #[test_case("fn main"; "literal")]
    #[test_case(r"\bfn\s+\w+"; "word patterns")]
    #[test_case("a+b*c?"; "plain quantifiers")]
    #[test_case("(abc)"; "plain group")]
    fn test_safe_patterns_accepted(pattern: &str) {
        assert!(is_safe_regex(pattern));
    }

    #[test]
    fn test_basic_match_with_snippet() {
        let content = "prefix text fn main() { body } suffix text";
        let matches = safe_grep("fn main", content, 20, 5, 10).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].r#match, "fn main");
        assert_eq!(matches[0].span, (12, 19));
        assert!(matches[0].snippet.contains("fn main"));
        assert!(matches[0].snippet.len() > "fn main".len());
    }

    #[test]
    fn test_max_matches_cap() {
        let content = "x ".repeat(100);
        let matches = safe_grep("x", &content, 7, 2, 10).unwrap();
        assert_eq!(matches.len(), 7);
    }

    #[test]
    fn test_no_matches() {
        let matches = safe_grep_default("zebra", "no stripes here").unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = safe_grep("[unclosed", "content", 20, 100, 10).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Grep(GrepError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_content_size_cap() {
        let content = "y".repeat(MAX_GREP_CONTENT_SIZE + 1);
        let err = safe_grep("y", &content, 1, 0, 10).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("grep_file"));
        assert!(message.contains("--target"));
    }

    #[test]
    fn test_content_at_exact_limit_succeeds() {
        let content = "z".repeat(MAX_GREP_CONTENT_SIZE);
        let matches = safe_grep("z", &content, 1, 0, 10).unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn test_snippet_respects_utf8_boundaries() {
        let content = "ééééé needle ééééé";
        let matches = safe_grep("needle", content, 1, 3, 10).unwrap();
        assert_eq!(matches.len(), 1);
        // Snippet extraction must not split a multi-byte character.
        assert!(matches[0].snippet.contains("needle"));
    }

    #[test]
    fn test_match_serialisation_shape() {
        let matches = safe_grep("b", "abc", 1, 1, 10).unwrap();
        let json = serde_json::to_value(&matches[0]).unwrap();
        assert_eq!(json["match"], "b");
        assert_eq!(json["span"][0], 1);
        assert_eq!(json["span"][1], 2);
        assert!(json["snippet"].is_string());
    }
}
