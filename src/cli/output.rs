//! Output formatting for CLI commands.
//!
//! Supports text and JSON output. Everything user-controlled passes
//! through the terminal escape so responses cannot inject control
//! sequences into the renderer.

use std::fmt::Write;

use crate::core::state::ScanState;
use crate::error::{Error, ErrorContext, escape_terminal};
use crate::state::{GcOutcome, SessionSummary};
use crate::walker::format_size;

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output.
    Json,
}

impl OutputFormat {
    /// Parses the format from its CLI spelling.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Renders an error for the terminal or as JSON.
#[must_use]
pub fn format_error(
    error: &Error,
    context: &ErrorContext,
    verbose: bool,
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Text => error.render(context, verbose),
        OutputFormat::Json => serde_json::json!({
            "error_code": error.code().code_str(),
            "title": error.code().title(),
            "category": error.category().as_str(),
            "message": error.to_string(),
            "doc_url": error.code().doc_url(),
            "exit_code": error.exit_code(),
        })
        .to_string(),
    }
}

/// Formats a session status summary.
#[must_use]
pub fn format_status(hash: &str, state: &ScanState, format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return serde_json::json!({
            "session": hash,
            "phase": state.phase.as_str(),
            "progress_percent": state.progress_percent,
            "query": state.query,
            "context_size": state.context_meta.as_ref().map_or(0, |m| m.total_size),
            "file_count": state.context_meta.as_ref().map_or(0, |m| m.file_count),
            "chunks": state.chunks.len(),
            "results": state.results.len(),
            "scan_mode": state.config.scan_mode,
            "final_answer": state.final_answer,
        })
        .to_string();
    }

    let mut output = String::new();
    output.push_str("DeepScan Session Status\n");
    output.push_str("=======================\n\n");
    let _ = writeln!(output, "  Session:   {hash}");
    let _ = writeln!(output, "  Phase:     {}", state.phase.as_str());
    let _ = writeln!(output, "  Progress:  {:.1}%", state.progress_percent);
    if let Some(query) = &state.query {
        let _ = writeln!(output, "  Query:     {}", escape_terminal(query));
    }
    if let Some(meta) = &state.context_meta {
        let _ = writeln!(output, "  Context:   {}", escape_terminal(&meta.path));
        let _ = writeln!(
            output,
            "  Size:      {} ({} files)",
            format_size(meta.total_size as u64),
            meta.file_count
        );
    }
    let _ = writeln!(output, "  Chunks:    {}", state.chunks.len());
    let _ = writeln!(output, "  Results:   {}", state.results.len());
    if state.config.incremental_enabled {
        let _ = writeln!(
            output,
            "  Delta:     {} changed, {} deleted",
            state.config.changed_file_count, state.config.deleted_file_count
        );
    }
    if let Some(answer) = &state.final_answer {
        let _ = writeln!(output, "\n{}", escape_terminal(answer));
    }
    output
}

/// Formats the session list.
#[must_use]
pub fn format_session_list(sessions: &[SessionSummary], format: OutputFormat) -> String {
    if format == OutputFormat::Json {
        return serde_json::to_string_pretty(sessions).unwrap_or_else(|_| "[]".to_string());
    }

    if sessions.is_empty() {
        return "No sessions found.\n".to_string();
    }

    let mut output = String::new();
    let _ = writeln!(
        output,
        "{:<40} {:<12} {:>9} {:>8} {:>8}",
        "Session", "Phase", "Progress", "Chunks", "Results"
    );
    output.push_str(&"-".repeat(82));
    output.push('\n');
    for session in sessions {
        let _ = writeln!(
            output,
            "{:<40} {:<12} {:>8.1}% {:>8} {:>8}",
            truncate(&session.hash, 40),
            session.phase,
            session.progress,
            session.chunks,
            session.results
        );
    }
    output
}

/// Formats a garbage-collection outcome.
#[must_use]
pub fn format_gc_outcome(outcome: GcOutcome, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            serde_json::to_string(&outcome).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Text => format!(
            "Deleted {} session(s), freed {}\n",
            outcome.deleted,
            format_size(outcome.freed_bytes)
        ),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max.saturating_sub(3);
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ScanConfig;

    fn state() -> ScanState {
        let mut state = ScanState::new("deepscan_1_aa", ScanConfig::default());
        state.query = Some("where is auth?".to_string());
        state
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(OutputFormat::parse("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("text"), OutputFormat::Text);
        assert_eq!(OutputFormat::parse("anything"), OutputFormat::Text);
    }

    #[test]
    fn test_status_text_contains_fields() {
        let out = format_status("deepscan_1_aa", &state(), OutputFormat::Text);
        assert!(out.contains("deepscan_1_aa"));
        assert!(out.contains("initialized"));
        assert!(out.contains("where is auth?"));
    }

    #[test]
    fn test_status_json_is_parseable() {
        let out = format_status("deepscan_1_aa", &state(), OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["session"], "deepscan_1_aa");
        assert_eq!(value["phase"], "initialized");
    }

    #[test]
    fn test_status_escapes_query() {
        let mut s = state();
        s.query = Some("evil\x1b[2Jquery".to_string());
        let out = format_status("h", &s, OutputFormat::Text);
        assert!(!out.contains('\x1b'));
    }

    #[test]
    fn test_session_list_empty() {
        let out = format_session_list(&[], OutputFormat::Text);
        assert!(out.contains("No sessions"));
    }

    #[test]
    fn test_session_list_rows() {
        let sessions = vec![SessionSummary {
            hash: "deepscan_1_aa".to_string(),
            phase: "map".to_string(),
            progress: 50.0,
            context_size: 1024,
            chunks: 4,
            results: 2,
            modified: 0,
        }];
        let out = format_session_list(&sessions, OutputFormat::Text);
        assert!(out.contains("deepscan_1_aa"));
        assert!(out.contains("map"));
        assert!(out.contains("50.0%"));
    }

    #[test]
    fn test_error_json_shape() {
        let err: Error = crate::error::ChunkingError::NoChunks.into();
        let out = format_error(&err, &ErrorContext::default(), false, OutputFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["error_code"], "DS-202");
        assert_eq!(value["exit_code"], 4);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly_ten", 11), "exactly_ten");
        assert_eq!(truncate("much_longer_than_allowed", 10), "much_lo...");
    }
}
