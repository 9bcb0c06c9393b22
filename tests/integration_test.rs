//! Integration tests for DeepScan-RS.
//!
//! End-to-end flows through the library surface: init, chunk, map with
//! a scripted backend, reduce, incremental re-analysis, and the binary
//! surface (shortcuts, exec rejection, exit codes).

#![allow(clippy::expect_used)]

use std::fs;
use std::path::Path;

use deepscan_rs::core::result::ResultStatus;
use deepscan_rs::driver::{AnalysisBackend, MapOptions, MapReduceDriver};
use deepscan_rs::error::Result;
use deepscan_rs::sandbox::{HelperDispatcher, HelperRequest};
use deepscan_rs::state::{InitOptions, StateManager, current_session_hash};
use deepscan_rs::{Phase, has_final_marker};
use tempfile::TempDir;

/// Backend that answers every chunk with the same finding.
struct EchoBackend {
    point: String,
}

impl AnalysisBackend for EchoBackend {
    fn dispatch(&self, _prompt: &str, _escalated: bool) -> Result<String> {
        Ok(format!(
            r#"{{"chunk_id": "any", "status": "completed",
                "findings": [{{"point": "{}", "confidence": "medium"}}]}}"#,
            self.point
        ))
    }
}

/// Backend whose findings mention a named file in the evidence.
struct EvidenceBackend {
    evidence: String,
}

impl AnalysisBackend for EvidenceBackend {
    fn dispatch(&self, _prompt: &str, _escalated: bool) -> Result<String> {
        Ok(format!(
            r#"{{"chunk_id": "any", "status": "completed",
                "findings": [{{"point": "stale helper logic",
                               "evidence": "{}",
                               "confidence": "low"}}]}}"#,
            self.evidence
        ))
    }
}

fn write_files(dir: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir failed");
        }
        fs::write(path, content).expect("write failed");
    }
}

fn init_and_chunk(cache: &Path, ctx: &Path, options: InitOptions) -> StateManager {
    let mut manager = StateManager::new(None, cache.to_path_buf()).expect("manager");
    manager
        .init(&ctx.display().to_string(), &options)
        .expect("init failed");
    manager
        .dispatch(HelperRequest::WriteChunks {
            out_dir: None,
            size: 50_000,
            overlap: 0,
            semantic: false,
        })
        .expect("write_chunks failed");
    manager
}

#[test]
fn test_scenario_incremental_dedup() {
    // Two files with identical content; the same finding for each chunk
    // deduplicates to one aggregated finding with support_count 2.
    let cache = TempDir::new().expect("cache");
    let ctx = TempDir::new().expect("ctx");
    write_files(ctx.path(), &[("a.txt", "hello world"), ("b.txt", "hello world")]);

    let mut manager = StateManager::new(None, cache.path().to_path_buf()).expect("manager");
    manager
        .init(
            &ctx.path().display().to_string(),
            &InitOptions {
                query: Some("greeting".to_string()),
                ..InitOptions::default()
            },
        )
        .expect("init");

    manager
        .dispatch(HelperRequest::WriteChunks {
            out_dir: None,
            size: 50_000,
            overlap: 0,
            semantic: false,
        })
        .expect("chunks");

    // Both tiny files land in one chunk; feed one result per source
    // file the way an external driver reporting per-file would.
    for chunk_id in ["chunk_file_a", "chunk_file_b"] {
        manager
            .dispatch(HelperRequest::AddResult {
                result: serde_json::json!({
                    "chunk_id": chunk_id,
                    "status": "completed",
                    "findings": [
                        {"point": "greets the world", "confidence": "medium"}
                    ],
                }),
            })
            .expect("add_result");
    }

    let state = manager.state().expect("state");
    let results: Vec<_> = state.results.clone();
    let aggregation = deepscan_rs::Aggregator::default().aggregate(&results, "greeting", None);

    assert_eq!(aggregation.total_findings, 2);
    assert_eq!(aggregation.unique_findings, 1);
    assert!((aggregation.deduplication_ratio - 0.5).abs() < f64::EPSILON);
    assert_eq!(aggregation.aggregated_findings[0].support_count, 2);
}

#[test]
fn test_scenario_ghost_filter() {
    // A finding whose evidence references a deleted file is dropped.
    let cache = TempDir::new().expect("cache");
    let ctx = TempDir::new().expect("ctx");
    write_files(ctx.path(), &[("a.py", "print('a')"), ("b.py", "print('b')")]);

    let mut first = StateManager::new(None, cache.path().to_path_buf()).expect("manager");
    first
        .init(
            &ctx.path().display().to_string(),
            &InitOptions {
                incremental: true,
                ..InitOptions::default()
            },
        )
        .expect("first init");
    let first_hash = first.session_hash().to_string();

    fs::remove_file(ctx.path().join("b.py")).expect("rm");

    let mut second = StateManager::new(None, cache.path().to_path_buf()).expect("manager");
    second
        .init(
            &ctx.path().display().to_string(),
            &InitOptions {
                incremental: true,
                previous_session: Some(first_hash),
                query: Some("stale code".to_string()),
                ..InitOptions::default()
            },
        )
        .expect("second init");
    let delta = second.file_delta().expect("delta").clone();
    assert_eq!(delta.deleted_files, vec!["b.py".to_string()]);

    second
        .dispatch(HelperRequest::WriteChunks {
            out_dir: None,
            size: 50_000,
            overlap: 0,
            semantic: false,
        })
        .expect("chunks");

    let backend = EvidenceBackend {
        evidence: "defined in b.py line 1".to_string(),
    };
    let mut driver = MapReduceDriver::new(&mut second, cache.path()).expect("driver");
    driver
        .run_map(Some(&backend), &MapOptions::default())
        .expect("map");

    let (aggregation, _summary) = driver
        .run_reduce(Some(&delta.deleted_files))
        .expect("reduce");
    assert_eq!(aggregation.filtered_deleted_files, 1);
    assert_eq!(aggregation.total_findings, 0);
}

#[test]
fn test_full_map_reduce_flow() {
    let cache = TempDir::new().expect("cache");
    let ctx = TempDir::new().expect("ctx");
    let body = "the configuration loads at startup ".repeat(2000);
    write_files(ctx.path(), &[("config.txt", body.as_str())]);

    let mut manager = init_and_chunk(
        cache.path(),
        ctx.path(),
        InitOptions {
            query: Some("how is configuration loaded".to_string()),
            ..InitOptions::default()
        },
    );

    let backend = EchoBackend {
        point: "configuration is loaded at startup".to_string(),
    };
    let mut driver = MapReduceDriver::new(&mut manager, cache.path()).expect("driver");
    let outcome = driver
        .run_map(Some(&backend), &MapOptions::default())
        .expect("map");
    assert!(outcome.processed >= 1);
    assert!(!outcome.cancelled);

    let (aggregation, summary) = driver.run_reduce(None).expect("reduce");
    assert!(aggregation.unique_findings >= 1);
    assert!(summary.contains("Total findings"));

    let state = manager.state().expect("state");
    assert_eq!(state.phase, Phase::Completed);
    assert!(state.final_answer.is_some());
    assert!((state.progress_percent - 100.0).abs() < f64::EPSILON);
}

#[test]
fn test_session_resume_after_interruption() {
    // A second manager over the same hash picks up saved state,
    // checkpoint included.
    let cache = TempDir::new().expect("cache");
    let ctx = TempDir::new().expect("ctx");
    write_files(ctx.path(), &[("a.txt", "persistent content")]);

    let hash = {
        let mut manager = init_and_chunk(cache.path(), ctx.path(), InitOptions::default());
        let mut driver = MapReduceDriver::new(&mut manager, cache.path()).expect("driver");
        driver.run_map(None, &MapOptions::default()).expect("map");
        manager.session_hash().to_string()
    };

    let mut resumed =
        StateManager::new(Some(&hash), cache.path().to_path_buf()).expect("manager");
    let state = resumed.load().expect("load");
    assert_eq!(state.phase, Phase::Map);
    assert_eq!(state.results.len(), 1);
    assert_eq!(state.results[0].status, ResultStatus::Placeholder);

    let checkpoints =
        deepscan_rs::CheckpointManager::new(&hash, cache.path()).expect("checkpoints");
    let checkpoint = checkpoints
        .load_checkpoint()
        .expect("load checkpoint")
        .expect("checkpoint exists");
    assert_eq!(checkpoint.session_id, hash);
    assert_eq!(checkpoint.batch_index, 0);
}

#[test]
fn test_state_file_layout() {
    let cache = TempDir::new().expect("cache");
    let ctx = TempDir::new().expect("ctx");
    write_files(ctx.path(), &[("a.txt", "layout check")]);

    let manager = init_and_chunk(cache.path(), ctx.path(), InitOptions::default());
    let session_dir = manager.state_dir();

    assert!(session_dir.join("state.json").exists());
    assert!(session_dir.join("chunks").is_dir());
    assert!(session_dir.join("results").is_dir());
    assert!(session_dir.join("logs").is_dir());
    assert!(session_dir.join("chunks/chunk_0000.txt").exists());
    assert_eq!(
        current_session_hash(cache.path()).as_deref(),
        Some(manager.session_hash())
    );

    // State file round-trips through serde unchanged.
    let raw = fs::read_to_string(session_dir.join("state.json")).expect("read state");
    let parsed: deepscan_rs::ScanState = serde_json::from_str(&raw).expect("parse state");
    assert_eq!(parsed.session_id, manager.session_hash());
}

#[test]
fn test_final_markers_recognised() {
    for body in [
        "FINAL({\"answer\": 42})",
        "FINAL_VAR(summary)",
        "NEEDS_MORE(\"missing the schema files\")",
        "UNABLE(\"binary content\")",
    ] {
        assert!(has_final_marker(body), "{body}");
    }
    assert!(!has_final_marker("nothing to see"));
}

// ---------------------------------------------------------------------------
// Binary surface
// ---------------------------------------------------------------------------

mod binary {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn cmd(cache: &TempDir) -> Command {
        let mut cmd = Command::cargo_bin("deepscan-rs").expect("binary builds");
        cmd.env("DEEPSCAN_CACHE_ROOT", cache.path());
        cmd
    }

    #[test]
    fn test_exec_sandbox_rejection_exits_one() {
        let cache = TempDir::new().expect("cache");
        cmd(&cache)
            .args(["exec", "-c", "__import__('os').system('rm -rf /')"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("DS-506"));
    }

    #[test]
    fn test_exec_worker_round_trip() {
        let cache = TempDir::new().expect("cache");
        cmd(&cache)
            .args(["exec", "-c", "x = 42; x"])
            .assert()
            .success()
            .stdout(predicate::str::contains("42"));
    }

    #[test]
    fn test_status_without_session_exits_five() {
        let cache = TempDir::new().expect("cache");
        cmd(&cache).arg("status").assert().code(5);
    }

    #[test]
    fn test_init_status_list_flow() {
        let cache = TempDir::new().expect("cache");
        let ctx = TempDir::new().expect("ctx");
        std::fs::write(ctx.path().join("a.txt"), "hello").expect("write");

        cmd(&cache)
            .args(["init", &ctx.path().display().to_string(), "-q", "what?"])
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));

        cmd(&cache)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("what?"));

        cmd(&cache)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));
    }

    #[test]
    fn test_init_twice_without_force_fails() {
        let cache = TempDir::new().expect("cache");
        let ctx = TempDir::new().expect("ctx");
        std::fs::write(ctx.path().join("a.txt"), "hello").expect("write");
        let ctx_arg = ctx.path().display().to_string();

        cmd(&cache).args(["init", &ctx_arg]).assert().success();
        cmd(&cache).args(["init", &ctx_arg]).assert().code(1);
        cmd(&cache)
            .args(["init", &ctx_arg, "--force"])
            .assert()
            .success();
    }

    #[test]
    fn test_question_shortcut_is_status() {
        let cache = TempDir::new().expect("cache");
        // No session: the `?` shortcut behaves exactly like `status`.
        cmd(&cache).arg("?").assert().code(5);
    }

    #[test]
    fn test_grep_redos_rejected_via_exec() {
        let cache = TempDir::new().expect("cache");
        let ctx = TempDir::new().expect("ctx");
        std::fs::write(ctx.path().join("a.txt"), "benign content").expect("write");

        cmd(&cache)
            .args(["init", &ctx.path().display().to_string()])
            .assert()
            .success();

        cmd(&cache)
            .args(["exec", "-c", "grep('(a+)+$')"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("nested quantifiers"));
    }

    #[test]
    fn test_invalid_session_hash_rejected() {
        let cache = TempDir::new().expect("cache");
        cmd(&cache)
            .args(["abort", "../../etc"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("DS-002"));
    }
}
