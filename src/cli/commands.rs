//! CLI command implementations.
//!
//! Contains the business logic for each command. Commands resolve the
//! current session through the marker file, construct the state manager
//! and driver, and format results for the terminal.

use std::fmt::Write as FmtWrite;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use crate::cancel;
use crate::cli::output::{OutputFormat, format_gc_outcome, format_session_list, format_status};
use crate::cli::parser::{Cli, Commands};
use crate::core::config::AgentType;
use crate::core::constants::WATCH_POLL_INTERVAL;
use crate::core::session::validate_session_hash;
use crate::core::state::Phase;
use crate::driver::{MapOptions, MapReduceDriver};
use crate::error::{CancelKind, Result, StateError, SystemError};
use crate::incremental::IncrementalAnalyzer;
use crate::prompt::generate_subagent_prompt;
use crate::sandbox::{self, HelperDispatcher};
use crate::state::{
    InitOptions, StateManager, current_session_hash, gc_clean_sessions, list_sessions,
    set_current_session_hash,
};

/// Executes a parsed CLI invocation.
///
/// # Errors
///
/// Propagates command failures; the binary maps them to exit codes.
pub fn execute(cli: &Cli) -> Result<String> {
    let format = OutputFormat::parse(&cli.format);
    let cache_root = cli.resolved_cache_root();

    match &cli.command {
        Commands::Init {
            path,
            query,
            adaptive,
            incremental,
            previous_session,
            lazy,
            target,
            depth,
            agent_type,
            force,
        } => cmd_init(
            &cache_root,
            path,
            &InitOptions {
                query: query.clone(),
                adaptive: *adaptive,
                incremental: *incremental,
                previous_session: previous_session.clone(),
                lazy: *lazy,
                targets: if target.is_empty() {
                    None
                } else {
                    Some(target.clone())
                },
                depth: *depth,
                agent_type: AgentType::parse(agent_type)?,
            },
            *force,
            format,
        ),
        Commands::Status => cmd_status(&cache_root, format),
        Commands::List => Ok(format_session_list(&list_sessions(&cache_root), format)),
        Commands::Resume { hash } => cmd_resume(&cache_root, hash.as_deref()),
        Commands::Abort { hash } => cmd_abort(&cache_root, hash),
        Commands::Clean { older_than } => cmd_clean(&cache_root, *older_than, format),
        Commands::Exec { code, timeout } => cmd_exec(&cache_root, code, *timeout),
        Commands::Map {
            instructions,
            escalate,
            output,
            batch,
            limit,
        } => cmd_map(
            &cache_root,
            *instructions,
            output.as_deref(),
            &MapOptions {
                batch_size: *batch,
                limit: *limit,
                escalate: *escalate,
            },
        ),
        Commands::Progress { watch } => cmd_progress(&cache_root, *watch, format),
        Commands::Reduce => cmd_reduce(&cache_root),
        Commands::ExportResults { path } => cmd_export_results(&cache_root, path),
        Commands::Reset => cmd_reset(&cache_root),
    }
}

fn current_manager(cache_root: &Path) -> Result<StateManager> {
    let hash = current_session_hash(cache_root).ok_or_else(|| StateError::SessionNotFound {
        hash: "<current>".to_string(),
    })?;
    let mut manager = StateManager::new(Some(&hash), cache_root.to_path_buf())?;
    manager.load()?;
    Ok(manager)
}

fn cmd_init(
    cache_root: &Path,
    path: &Path,
    options: &InitOptions,
    force: bool,
    format: OutputFormat,
) -> Result<String> {
    if !force
        && let Some(active) = current_session_hash(cache_root)
        && cache_root
            .join(&active)
            .join(crate::state::STATE_FILE)
            .exists()
    {
        return Err(SystemError::Internal {
            message: format!(
                "session {active} is already active; pass --force to start a new one \
                 or `abort {active}` first"
            ),
        }
        .into());
    }

    let mut manager = StateManager::new(None, cache_root.to_path_buf())?;
    manager.init(&path.display().to_string(), options)?;

    let state = manager.state().ok_or_else(|| SystemError::Internal {
        message: "state missing after init".to_string(),
    })?;
    Ok(format_status(manager.session_hash(), state, format))
}

fn cmd_status(cache_root: &Path, format: OutputFormat) -> Result<String> {
    let manager = current_manager(cache_root)?;
    let state = manager.state().ok_or_else(|| SystemError::Internal {
        message: "state missing".to_string(),
    })?;
    Ok(format_status(manager.session_hash(), state, format))
}

fn cmd_resume(cache_root: &Path, hash: Option<&str>) -> Result<String> {
    let hash = match hash {
        Some(hash) => {
            if !validate_session_hash(hash) {
                return Err(StateError::InvalidSessionHash {
                    hash: hash.to_string(),
                }
                .into());
            }
            hash.to_string()
        }
        None => list_sessions(cache_root)
            .first()
            .map(|s| s.hash.clone())
            .ok_or_else(|| StateError::SessionNotFound {
                hash: "<most recent>".to_string(),
            })?,
    };

    if !cache_root
        .join(&hash)
        .join(crate::state::STATE_FILE)
        .exists()
    {
        return Err(StateError::SessionNotFound { hash }.into());
    }

    set_current_session_hash(cache_root, &hash)?;
    Ok(format!("Current session: {hash}\n"))
}

fn cmd_abort(cache_root: &Path, hash: &str) -> Result<String> {
    let mut manager = StateManager::new(Some(hash), cache_root.to_path_buf())?;
    if !manager.state_dir().exists() {
        return Err(StateError::SessionNotFound {
            hash: hash.to_string(),
        }
        .into());
    }
    manager.reset()?;
    Ok(format!("Aborted session: {hash}\n"))
}

fn cmd_clean(cache_root: &Path, older_than: Option<u64>, format: OutputFormat) -> Result<String> {
    let outcome = gc_clean_sessions(
        cache_root,
        older_than.unwrap_or(crate::core::constants::DEFAULT_GC_MAX_AGE_DAYS),
        crate::core::constants::DEFAULT_GC_MAX_TOTAL_BYTES,
    );
    Ok(format_gc_outcome(outcome, format))
}

fn cmd_exec(cache_root: &Path, code: &str, timeout: Option<u64>) -> Result<String> {
    // Helpers need a session; helper-free code works without one.
    let mut manager = current_manager(cache_root).ok();

    sandbox::with_global_executor(timeout, |executor| {
        let dispatcher = manager.as_mut().map(|m| m as &mut dyn HelperDispatcher);
        let outcome = executor.execute(code, dispatcher)?;
        Ok(format!("{}\n", outcome.repr))
    })
}

fn cmd_map(
    cache_root: &Path,
    instructions: bool,
    output: Option<&Path>,
    options: &MapOptions,
) -> Result<String> {
    let mut manager = current_manager(cache_root)?;

    if instructions {
        return print_instructions(&manager, output, options);
    }

    cancel::manager().setup();
    let mut driver = MapReduceDriver::new(&mut manager, cache_root)?;
    let outcome = driver.run_map(None, options)?;

    if outcome.cancelled {
        cancel::CancellationManager::show_resume_instructions(manager.session_hash());
        return Err(SystemError::Cancelled {
            kind: CancelKind::Graceful,
        }
        .into());
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Processed {} chunk(s) in {} batch(es).",
        outcome.processed, outcome.batches
    );
    if outcome.placeholders && outcome.processed > 0 {
        let _ = writeln!(
            out,
            "No external model attached: placeholder results were recorded. \
             Feed real results via exec -c \"add_results_from_file('...')\" \
             or re-run map with a driver."
        );
    }
    if outcome.went_sequential {
        let _ = writeln!(out, "High failure rate: switched to sequential mode.");
    }
    Ok(out)
}

fn print_instructions(
    manager: &StateManager,
    output: Option<&Path>,
    options: &MapOptions,
) -> Result<String> {
    let Some(state) = manager.state() else {
        return Err(crate::error::ChunkingError::NoChunks.into());
    };
    if state.chunks.is_empty() {
        return Err(crate::error::ChunkingError::NoChunks.into());
    }

    let query = state.query.clone().unwrap_or_default();
    let agent_type = state.config.agent_type;
    let mut prompts = String::new();
    let limit = options.limit.unwrap_or(usize::MAX);

    for chunk in state.chunks.iter().take(limit) {
        let content = std::fs::read_to_string(&chunk.file_path).unwrap_or_default();
        let prompt = generate_subagent_prompt(chunk, &content, &query, agent_type);
        let _ = writeln!(
            prompts,
            "===== PROMPT for chunk {} =====\n{prompt}\n",
            chunk.chunk_id
        );
    }

    match output {
        Some(path) => {
            std::fs::write(path, &prompts).map_err(|e| StateError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(format!("Wrote prompts to {}\n", path.display()))
        }
        None => Ok(prompts),
    }
}

fn cmd_progress(cache_root: &Path, watch: bool, format: OutputFormat) -> Result<String> {
    let mut manager = current_manager(cache_root)?;

    if watch {
        cancel::manager().setup();
        let mut stdout = std::io::stdout();
        loop {
            let state = manager.state().ok_or_else(|| SystemError::Internal {
                message: "state missing".to_string(),
            })?;
            let line = format!(
                "phase={} progress={:.1}% results={}\n",
                state.phase.as_str(),
                state.progress_percent,
                state.results.len()
            );
            let _ = stdout.write_all(line.as_bytes());
            let _ = stdout.flush();

            if state.phase == Phase::Completed || cancel::manager().is_cancelled() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_secs(WATCH_POLL_INTERVAL));
            manager.load()?;
        }
        return Ok(String::new());
    }

    let state = manager.state().ok_or_else(|| SystemError::Internal {
        message: "state missing".to_string(),
    })?;
    let mut out = format_status(manager.session_hash(), state, format);

    // Tail of the event log for quick inspection.
    let log_path = manager.state_dir().join("progress.jsonl");
    if let Ok(log) = std::fs::read_to_string(&log_path) {
        let lines: Vec<&str> = log.lines().collect();
        let tail = lines.iter().rev().take(10).rev();
        out.push_str("\nRecent events:\n");
        for line in tail {
            let _ = writeln!(out, "  {line}");
        }
    }
    Ok(out)
}

fn cmd_reduce(cache_root: &Path) -> Result<String> {
    let mut manager = current_manager(cache_root)?;
    let deleted = deleted_files_for(&manager, cache_root);
    let mut driver = MapReduceDriver::new(&mut manager, cache_root)?;
    let (_aggregation, summary) = driver.run_reduce(deleted.as_deref())?;
    Ok(summary)
}

/// Recomputes the deleted-file set for the ghost filter by comparing the
/// previous session's manifest with this session's.
fn deleted_files_for(manager: &StateManager, cache_root: &Path) -> Option<Vec<String>> {
    let state = manager.state()?;
    if !state.config.incremental_enabled {
        return None;
    }
    let previous = state.config.previous_session.as_deref()?;

    let prev_manifest = IncrementalAnalyzer::new(previous, cache_root)
        .ok()?
        .load_manifest()?;
    let curr_manifest = IncrementalAnalyzer::new(manager.session_hash(), cache_root)
        .ok()?
        .load_manifest()?;

    let delta = curr_manifest.compare_with(&prev_manifest);
    if delta.deleted_files.is_empty() {
        None
    } else {
        Some(delta.deleted_files)
    }
}

fn cmd_export_results(cache_root: &Path, path: &Path) -> Result<String> {
    let manager = current_manager(cache_root)?;
    let state = manager.state().ok_or_else(|| SystemError::Internal {
        message: "state missing".to_string(),
    })?;

    let export = serde_json::json!({
        "session_id": state.session_id,
        "query": state.query,
        "phase": state.phase.as_str(),
        "chunks": state.chunks,
        "results": state.results,
        "final_answer": state.final_answer,
    });
    std::fs::write(path, serde_json::to_string_pretty(&export)?).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(format!("Exported results to {}\n", path.display()))
}

fn cmd_reset(cache_root: &Path) -> Result<String> {
    let mut manager = current_manager(cache_root)?;
    let hash = manager.session_hash().to_string();
    manager.reset()?;
    Ok(format!("Destroyed session: {hash}\n"))
}

/// Builds the `PathBuf` for a session's directory (tests and tooling).
#[must_use]
pub fn session_dir(cache_root: &Path, hash: &str) -> PathBuf {
    cache_root.join(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_session(cache: &Path, files: &[(&str, &str)]) -> (TempDir, String) {
        let ctx = TempDir::new().unwrap();
        for (name, content) in files {
            std::fs::write(ctx.path().join(name), content).unwrap();
        }
        let mut manager = StateManager::new(None, cache.to_path_buf()).unwrap();
        manager
            .init(
                &ctx.path().display().to_string(),
                &InitOptions {
                    query: Some("what is here?".to_string()),
                    ..InitOptions::default()
                },
            )
            .unwrap();
        let hash = manager.session_hash().to_string();
        (ctx, hash)
    }

    #[test]
    fn test_status_without_session_errors() {
        let cache = TempDir::new().unwrap();
        let err = cmd_status(cache.path(), OutputFormat::Text).unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_status_after_init() {
        let cache = TempDir::new().unwrap();
        let (_ctx, hash) = init_session(cache.path(), &[("a.txt", "hello")]);
        let out = cmd_status(cache.path(), OutputFormat::Text).unwrap();
        assert!(out.contains(&hash));
        assert!(out.contains("what is here?"));
    }

    #[test]
    fn test_resume_sets_marker_and_validates() {
        let cache = TempDir::new().unwrap();
        let (_ctx, hash) = init_session(cache.path(), &[("a.txt", "x")]);

        let out = cmd_resume(cache.path(), Some(&hash)).unwrap();
        assert!(out.contains(&hash));

        assert!(cmd_resume(cache.path(), Some("no_such_session")).is_err());
        assert!(cmd_resume(cache.path(), Some("../bad")).is_err());
    }

    #[test]
    fn test_resume_defaults_to_most_recent() {
        let cache = TempDir::new().unwrap();
        let (_ctx, hash) = init_session(cache.path(), &[("a.txt", "x")]);
        let out = cmd_resume(cache.path(), None).unwrap();
        assert!(out.contains(&hash));
    }

    #[test]
    fn test_abort_removes_session() {
        let cache = TempDir::new().unwrap();
        let (_ctx, hash) = init_session(cache.path(), &[("a.txt", "x")]);
        let out = cmd_abort(cache.path(), &hash).unwrap();
        assert!(out.contains("Aborted"));
        assert!(!cache.path().join(&hash).exists());
        assert!(cmd_abort(cache.path(), &hash).is_err());
    }

    #[test]
    fn test_init_refuses_second_session_without_force() {
        let cache = TempDir::new().unwrap();
        let (ctx, _hash) = init_session(cache.path(), &[("a.txt", "x")]);

        let err = cmd_init(
            cache.path(),
            ctx.path(),
            &InitOptions::default(),
            false,
            OutputFormat::Text,
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 1);

        // --force replaces the active session.
        let out = cmd_init(
            cache.path(),
            ctx.path(),
            &InitOptions::default(),
            true,
            OutputFormat::Text,
        )
        .unwrap();
        assert!(out.contains("Phase"));
    }

    #[test]
    fn test_exec_forbidden_code_exit_one() {
        // Forbidden code is rejected before any worker could spawn, so
        // this is safe in unit tests without the built binary.
        let cache = TempDir::new().unwrap();
        let err = cmd_exec(cache.path(), "import os", None).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        sandbox::reset_global_state();
    }

    #[test]
    fn test_exec_with_helpers_uses_session() {
        let cache = TempDir::new().unwrap();
        let (_ctx, _hash) = init_session(cache.path(), &[("a.txt", "hello world")]);
        let out = cmd_exec(cache.path(), "context_length()", None).unwrap();
        let n: i64 = out.trim().parse().unwrap();
        assert!(n > 0);
        sandbox::reset_global_state();
    }

    #[test]
    fn test_map_instructions_prints_prompts() {
        let cache = TempDir::new().unwrap();
        let (_ctx, _hash) = init_session(cache.path(), &[("a.txt", "hello world")]);
        // Chunk first.
        cmd_exec(cache.path(), "write_chunks(size=50000)", None).unwrap();

        let out = cmd_map(cache.path(), true, None, &MapOptions::default()).unwrap();
        assert!(out.contains("===== PROMPT for chunk"));
        assert!(out.contains("<DATA_CONTEXT>"));
        assert!(out.contains("what is here?"));
        sandbox::reset_global_state();
    }

    #[test]
    fn test_map_without_chunks_errors() {
        let cache = TempDir::new().unwrap();
        let (_ctx, _hash) = init_session(cache.path(), &[("a.txt", "x")]);
        let err = cmd_map(cache.path(), false, None, &MapOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_export_results_writes_json() {
        let cache = TempDir::new().unwrap();
        let (_ctx, hash) = init_session(cache.path(), &[("a.txt", "x")]);
        let out_file = cache.path().join("export.json");
        cmd_export_results(cache.path(), &out_file).unwrap();
        let exported: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out_file).unwrap()).unwrap();
        assert_eq!(exported["session_id"], hash.as_str());
        assert_eq!(exported["query"], "what is here?");
    }

    #[test]
    fn test_reset_destroys_current_session() {
        let cache = TempDir::new().unwrap();
        let (_ctx, hash) = init_session(cache.path(), &[("a.txt", "x")]);
        let out = cmd_reset(cache.path()).unwrap();
        assert!(out.contains(&hash));
        assert!(cmd_status(cache.path(), OutputFormat::Text).is_err());
    }

    #[test]
    fn test_clean_reports_outcome() {
        let cache = TempDir::new().unwrap();
        let out = cmd_clean(cache.path(), Some(1), OutputFormat::Text).unwrap();
        assert!(out.contains("Deleted 0"));
    }

    #[test]
    fn test_session_dir_helper() {
        assert_eq!(
            session_dir(Path::new("/cache"), "abc"),
            PathBuf::from("/cache/abc")
        );
    }
}
