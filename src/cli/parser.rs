//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros, plus the shortcut
//! expansion applied before parsing (`?`, `!`, `+`, `x`, and a bare
//! existing path standing in for `init`).

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// DeepScan-RS: session engine for analysing large source trees.
///
/// Splits oversized contexts into semantic chunks, dispatches them to an
/// external model, and merges the findings.
#[derive(Parser, Debug)]
#[command(name = "deepscan-rs")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Cache root holding session directories.
    ///
    /// Defaults to the per-user cache directory (`…/deepscan`).
    #[arg(long, env = "DEEPSCAN_CACHE_ROOT")]
    pub cache_root: Option<PathBuf>,

    /// Enable verbose output (category, docs URL, cause chain).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Resolved cache root.
    #[must_use]
    pub fn resolved_cache_root(&self) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(crate::state::default_cache_root)
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a session over a file or directory.
    Init {
        /// Path to analyse.
        path: PathBuf,

        /// Analysis query.
        #[arg(short, long)]
        query: Option<String>,

        /// Auto-detect content type and pick a chunk size.
        #[arg(long)]
        adaptive: bool,

        /// Enable incremental re-analysis.
        #[arg(long)]
        incremental: bool,

        /// Previous session hash for delta computation.
        #[arg(long, requires = "incremental")]
        previous_session: Option<String>,

        /// Structure-only mode: no content loading.
        #[arg(long)]
        lazy: bool,

        /// Target paths (repeatable; switches to targeted mode).
        #[arg(long = "target")]
        target: Vec<String>,

        /// Directory depth limit for lazy traversal.
        #[arg(long)]
        depth: Option<usize>,

        /// Analysis profile (general, security, architecture, performance).
        #[arg(long, default_value = "general")]
        agent_type: String,

        /// Replace an existing active session.
        #[arg(long)]
        force: bool,
    },

    /// Summarise the current session.
    Status,

    /// Summarise all sessions, newest first.
    List,

    /// Set the current session (defaults to the most recent).
    Resume {
        /// Session hash.
        hash: Option<String>,
    },

    /// Delete a session directory.
    Abort {
        /// Session hash.
        hash: String,
    },

    /// Garbage-collect old sessions.
    Clean {
        /// Age threshold in days.
        #[arg(long = "older-than")]
        older_than: Option<u64>,
    },

    /// Evaluate sandboxed code against the current session.
    Exec {
        /// Code to evaluate.
        #[arg(short = 'c', long = "code")]
        code: String,

        /// Execution timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Dispatch chunks for analysis (or print their prompts).
    Map {
        /// Print prompts instead of dispatching.
        #[arg(short, long)]
        instructions: bool,

        /// Re-queue eligible failed chunks at a stronger tier.
        #[arg(long)]
        escalate: bool,

        /// Write prompts to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Batch size override.
        #[arg(long)]
        batch: Option<usize>,

        /// Cap on chunks processed this run.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show analysis progress.
    Progress {
        /// Poll until the session completes.
        #[arg(short, long)]
        watch: bool,
    },

    /// Aggregate results into the final answer.
    Reduce,

    /// Export results as JSON.
    #[command(name = "export-results")]
    ExportResults {
        /// Output file path.
        path: PathBuf,
    },

    /// Destroy the current session.
    Reset,
}

/// Expands shortcut forms before clap parsing.
///
/// `?` → `status`; `! CODE` → `exec -c CODE`; `+ [hash]` → `resume`;
/// `x [hash]` → `abort`; a first argument naming an existing path →
/// `init <path>`.
#[must_use]
pub fn expand_shortcuts(args: Vec<String>) -> Vec<String> {
    let Some(first) = args.get(1).cloned() else {
        return args;
    };

    let mut expanded = vec![args[0].clone()];
    match first.as_str() {
        "?" => {
            expanded.push("status".to_string());
            expanded.extend(args.into_iter().skip(2));
        }
        "!" => {
            expanded.push("exec".to_string());
            expanded.push("-c".to_string());
            // Everything after `!` joins into one code argument.
            let code = args[2..].join(" ");
            expanded.push(code);
        }
        "+" => {
            expanded.push("resume".to_string());
            expanded.extend(args.into_iter().skip(2));
        }
        "x" => {
            expanded.push("abort".to_string());
            expanded.extend(args.into_iter().skip(2));
        }
        other if !other.starts_with('-') && Path::new(other).exists() && !is_subcommand(other) => {
            expanded.push("init".to_string());
            expanded.extend(args.into_iter().skip(1));
        }
        _ => return args,
    }
    expanded
}

fn is_subcommand(word: &str) -> bool {
    matches!(
        word,
        "init"
            | "status"
            | "list"
            | "resume"
            | "abort"
            | "clean"
            | "exec"
            | "map"
            | "progress"
            | "reduce"
            | "export-results"
            | "reset"
            | "help"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_question_mark_expands_to_status() {
        let out = expand_shortcuts(args(&["deepscan-rs", "?"]));
        assert_eq!(out, args(&["deepscan-rs", "status"]));
    }

    #[test]
    fn test_bang_expands_to_exec() {
        let out = expand_shortcuts(args(&["deepscan-rs", "!", "peek(0,", "100)"]));
        assert_eq!(
            out,
            args(&["deepscan-rs", "exec", "-c", "peek(0, 100)"])
        );
    }

    #[test]
    fn test_plus_expands_to_resume() {
        let out = expand_shortcuts(args(&["deepscan-rs", "+", "deepscan_1_aa"]));
        assert_eq!(out, args(&["deepscan-rs", "resume", "deepscan_1_aa"]));
        let out = expand_shortcuts(args(&["deepscan-rs", "+"]));
        assert_eq!(out, args(&["deepscan-rs", "resume"]));
    }

    #[test]
    fn test_x_expands_to_abort() {
        let out = expand_shortcuts(args(&["deepscan-rs", "x", "deepscan_1_aa"]));
        assert_eq!(out, args(&["deepscan-rs", "abort", "deepscan_1_aa"]));
    }

    #[test]
    fn test_existing_path_expands_to_init() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().display().to_string();
        let out = expand_shortcuts(args(&["deepscan-rs", &path, "-q", "what?"]));
        assert_eq!(out[1], "init");
        assert_eq!(out[2], path);
        assert_eq!(out[3], "-q");
    }

    #[test]
    fn test_ordinary_commands_pass_through() {
        let input = args(&["deepscan-rs", "status"]);
        assert_eq!(expand_shortcuts(input.clone()), input);
        let input = args(&["deepscan-rs", "map", "--escalate"]);
        assert_eq!(expand_shortcuts(input.clone()), input);
    }

    #[test]
    fn test_missing_path_not_expanded() {
        let input = args(&["deepscan-rs", "/definitely/not/a/path"]);
        assert_eq!(expand_shortcuts(input.clone()), input);
    }

    #[test]
    fn test_parse_init_flags() {
        let cli = Cli::try_parse_from([
            "deepscan-rs",
            "init",
            "/tmp",
            "-q",
            "where is auth?",
            "--adaptive",
            "--incremental",
            "--previous-session",
            "deepscan_1_aa",
            "--lazy",
            "--target",
            "src",
            "--target",
            "docs",
            "--depth",
            "2",
            "--agent-type",
            "security",
            "--force",
        ])
        .unwrap();
        let Commands::Init {
            query,
            adaptive,
            incremental,
            previous_session,
            lazy,
            target,
            depth,
            agent_type,
            force,
            ..
        } = cli.command
        else {
            panic!("expected init");
        };
        assert_eq!(query.as_deref(), Some("where is auth?"));
        assert!(adaptive && incremental && lazy && force);
        assert_eq!(previous_session.as_deref(), Some("deepscan_1_aa"));
        assert_eq!(target, vec!["src".to_string(), "docs".to_string()]);
        assert_eq!(depth, Some(2));
        assert_eq!(agent_type, "security");
    }

    #[test]
    fn test_previous_session_requires_incremental() {
        let result = Cli::try_parse_from([
            "deepscan-rs",
            "init",
            "/tmp",
            "--previous-session",
            "deepscan_1_aa",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_exec_and_map() {
        let cli =
            Cli::try_parse_from(["deepscan-rs", "exec", "-c", "x = 42", "--timeout", "5"])
                .unwrap();
        assert!(matches!(cli.command, Commands::Exec { .. }));

        let cli = Cli::try_parse_from([
            "deepscan-rs",
            "map",
            "--instructions",
            "--batch",
            "2",
            "--limit",
            "10",
        ])
        .unwrap();
        let Commands::Map {
            instructions,
            batch,
            limit,
            escalate,
            ..
        } = cli.command
        else {
            panic!("expected map");
        };
        assert!(instructions);
        assert!(!escalate);
        assert_eq!(batch, Some(2));
        assert_eq!(limit, Some(10));
    }
}
