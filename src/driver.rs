//! Map/reduce driver.
//!
//! Owns batching, cancellation polling, checkpoint cadence, placeholder
//! and real-result reconciliation, the sequential fallback, and the
//! escalation budget. The external model is reached only through
//! [`AnalysisBackend`]; without one, every chunk produces a placeholder
//! result that a later run with a live backend supersedes.

use rayon::prelude::*;

use crate::aggregate::{AggregationResult, Aggregator, format_summary};
use crate::cancel::manager as cancel_manager;
use crate::checkpoint::{CANCELLED_BATCH_SENTINEL, CheckpointManager};
use crate::core::chunk::{ChunkInfo, ChunkState};
use crate::core::result::{ChunkResult, ResultStatus};
use crate::core::state::Phase;
use crate::error::{ChunkingError, ConfigError, Result};
use crate::progress::{EscalationBudget, ProgressWriter, classify_failure, should_escalate};
use crate::prompt::{create_sequential_prompt, generate_subagent_prompt, parse_subagent_response};
use crate::state::StateManager;

/// Model tier labels used in escalation events.
const BASE_MODEL: &str = "base-tier";
const ESCALATED_MODEL: &str = "escalated-tier";

/// Estimated cost per escalated chunk, in USD.
const ESCALATION_COST_ESTIMATE: f64 = 0.01;

/// Interface to the external model.
///
/// Implementations dispatch one prompt and return the raw response text;
/// the driver owns prompt construction and response parsing.
pub trait AnalysisBackend: Sync {
    /// Dispatches a prompt, optionally at the escalated tier.
    ///
    /// # Errors
    ///
    /// Any transport or model failure; the driver converts it into a
    /// failed chunk result rather than aborting the batch.
    fn dispatch(&self, prompt: &str, escalated: bool) -> Result<String>;
}

/// Options for a map run.
#[derive(Debug, Clone, Default)]
pub struct MapOptions {
    /// Batch size override (defaults to `max_parallel_agents`).
    pub batch_size: Option<usize>,
    /// Cap on the number of chunks processed this run.
    pub limit: Option<usize>,
    /// Re-queue eligible failed chunks at the escalated tier.
    pub escalate: bool,
}

/// Outcome of a map run.
#[derive(Debug, Clone, Default)]
pub struct MapOutcome {
    /// Chunks processed this run.
    pub processed: usize,
    /// Batches completed.
    pub batches: usize,
    /// Whether the run stopped at a cancellation boundary.
    pub cancelled: bool,
    /// Whether results are placeholders (no backend attached).
    pub placeholders: bool,
    /// Whether the sequential fallback engaged.
    pub went_sequential: bool,
}

/// Drives the map and reduce phases over a session.
pub struct MapReduceDriver<'a> {
    manager: &'a mut StateManager,
    checkpoints: CheckpointManager,
}

impl<'a> MapReduceDriver<'a> {
    /// Creates a driver over a state manager.
    ///
    /// # Errors
    ///
    /// Propagates checkpoint-manager construction failures (invalid
    /// session hash, traversal).
    pub fn new(manager: &'a mut StateManager, cache_root: &std::path::Path) -> Result<Self> {
        let checkpoints = CheckpointManager::new(manager.session_hash(), cache_root)?;
        Ok(Self {
            manager,
            checkpoints,
        })
    }

    /// Runs the map phase.
    ///
    /// # Errors
    ///
    /// [`ChunkingError::NoChunks`] when nothing was chunked yet;
    /// escalation without remaining budget surfaces as a config error.
    #[allow(clippy::too_many_lines)]
    pub fn run_map(
        &mut self,
        backend: Option<&dyn AnalysisBackend>,
        options: &MapOptions,
    ) -> Result<MapOutcome> {
        let Some(state) = self.manager.state() else {
            return Err(ChunkingError::NoChunks.into());
        };
        if state.chunks.is_empty() {
            return Err(ChunkingError::NoChunks.into());
        }

        let batch_size = options
            .batch_size
            .unwrap_or(state.config.max_parallel_agents)
            .max(1);
        let query = state.query.clone().unwrap_or_default();
        let agent_type = state.config.agent_type;

        let mut pending = if options.escalate {
            self.select_escalation_chunks()?
        } else {
            self.select_unprocessed_chunks()
        };
        if let Some(limit) = options.limit {
            pending.truncate(limit);
        }

        if pending.is_empty() {
            return Ok(MapOutcome::default());
        }

        if let Some(state) = self.manager.state_mut() {
            state.phase = Phase::Map;
        }
        self.manager.save()?;

        let mut progress = ProgressWriter::open(self.manager.state_dir()).ok();
        let total_batches = pending.len().div_ceil(batch_size);
        let cancel = cancel_manager();

        let mut outcome = MapOutcome {
            placeholders: backend.is_none(),
            ..MapOutcome::default()
        };
        let mut sequential_mode = false;
        let mut consecutive_bad_batches = 0usize;

        for (batch_index, batch) in pending.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            if let Some(progress) = progress.as_mut() {
                progress.emit_batch_start(batch_index, total_batches, batch.len());
            }

            let results = run_batch(
                batch,
                backend,
                &query,
                agent_type,
                sequential_mode,
                options.escalate,
            );

            let failed = results
                .iter()
                .filter(|r| r.status == ResultStatus::Failed)
                .count();
            let succeeded = results.len() - failed;

            for result in results {
                if let Some(progress) = progress.as_mut() {
                    progress.emit_chunk_complete(
                        &result.chunk_id,
                        result.findings.len(),
                        match result.status {
                            ResultStatus::Completed => "completed",
                            ResultStatus::Partial => "partial",
                            ResultStatus::Failed => "failed",
                            ResultStatus::Placeholder => "placeholder",
                            ResultStatus::Pending => "pending",
                        },
                    );
                    for finding in &result.findings {
                        progress.emit_finding(
                            &result.chunk_id,
                            &finding.point,
                            finding.confidence.as_str(),
                        );
                    }
                }
                if let Some(state) = self.manager.state_mut() {
                    reconcile_result(state, result);
                }
                outcome.processed += 1;
            }

            if let Some(state) = self.manager.state_mut() {
                state.recompute_progress();
            }

            // Checkpoint cadence: after every batch.
            if let Some(state) = self.manager.state() {
                let index = i64::try_from(batch_index).unwrap_or(i64::MAX);
                if let Err(e) = self.checkpoints.save_checkpoint(state, index, Some(cancel)) {
                    tracing::warn!(error = %e, "checkpoint save failed");
                }
            }
            self.manager.save()?;

            if let Some(progress) = progress.as_mut() {
                progress.emit_batch_end(batch_index, succeeded, failed);
            }
            outcome.batches += 1;

            // Two consecutive majority-failed batches switch the rest of
            // the run to sequential mode.
            if failed * 2 > batch.len() {
                consecutive_bad_batches += 1;
                if consecutive_bad_batches >= 2 && !sequential_mode {
                    tracing::warn!("batch failure rate high, switching to sequential mode");
                    sequential_mode = true;
                    outcome.went_sequential = true;
                }
            } else {
                consecutive_bad_batches = 0;
            }
        }

        if outcome.cancelled {
            // Cancelled save: sentinel batch index, then disarm the
            // watchdog so the graceful window cannot force-quit a saved
            // session.
            if let Some(state) = self.manager.state() {
                let _ = self
                    .checkpoints
                    .save_checkpoint(state, CANCELLED_BATCH_SENTINEL, Some(cancel));
            }
            self.manager.save()?;
            cancel.mark_completed();
        }

        Ok(outcome)
    }

    /// Chunks whose id has no real result yet. Placeholder and pending
    /// results do not block re-processing.
    fn select_unprocessed_chunks(&self) -> Vec<ChunkInfo> {
        let Some(state) = self.manager.state() else {
            return Vec::new();
        };

        let mut chunks: Vec<ChunkInfo> = state
            .chunks
            .iter()
            .filter(|chunk| {
                !state
                    .results
                    .iter()
                    .any(|r| r.chunk_id == chunk.chunk_id && r.status.is_real())
            })
            .cloned()
            .collect();

        // Incremental runs only re-dispatch chunks covering changed
        // files, when a mapping is available.
        if state.config.incremental_enabled
            && let Some(delta) = self.manager.file_delta()
        {
            let mut changed = delta.changed_files.clone();
            changed.extend(delta.added_files.iter().cloned());
            let affected = self.manager.chunks_to_reanalyze(&changed);
            if !affected.is_empty() {
                chunks.retain(|c| affected.contains(&c.chunk_id));
            }
        }

        chunks
    }

    /// Failed chunks eligible for escalation, bounded by the budget.
    fn select_escalation_chunks(&self) -> Result<Vec<ChunkInfo>> {
        let Some(state) = self.manager.state() else {
            return Ok(Vec::new());
        };

        let mut budget = EscalationBudget::new(
            state.config.max_escalation_ratio,
            state.config.max_escalation_cost_usd,
        );
        budget.set_total_chunks(state.chunks.len());

        let failed: Vec<(&ChunkInfo, &ChunkResult)> = state
            .chunks
            .iter()
            .filter_map(|chunk| {
                state
                    .results
                    .iter()
                    .find(|r| r.chunk_id == chunk.chunk_id && r.status == ResultStatus::Failed)
                    .map(|result| (chunk, result))
            })
            .collect();

        if failed.is_empty() {
            return Ok(Vec::new());
        }

        let mut selected = Vec::new();
        for (chunk, result) in &failed {
            let failure = classify_failure(result.error.as_deref(), 0);
            // Escalation is the explicit retry path, so this is always
            // at least the second attempt.
            if !should_escalate(failure, 2) {
                tracing::debug!(
                    chunk_id = chunk.chunk_id,
                    ?failure,
                    "failure class not eligible for escalation"
                );
                continue;
            }
            if !budget.can_escalate() {
                tracing::warn!(chunk_id = chunk.chunk_id, "escalation budget exhausted");
                continue;
            }
            budget.record_escalation(ESCALATION_COST_ESTIMATE);
            selected.push((*chunk).clone());
        }

        if selected.is_empty() && !budget.can_escalate() {
            return Err(ConfigError::EscalationBudgetExceeded {
                escalated: budget.escalation_count(),
                total: state.chunks.len(),
                cost: budget.estimated_cost(),
            }
            .into());
        }

        if !selected.is_empty()
            && let Ok(mut progress) = ProgressWriter::open(self.manager.state_dir())
        {
            for chunk in &selected {
                progress.emit_escalation(&chunk.chunk_id, BASE_MODEL, ESCALATED_MODEL);
            }
        }

        Ok(selected)
    }

    /// Runs the reduce phase.
    ///
    /// Placeholder and pending results are filtered first; if nothing
    /// real remains the reduce fails loudly instead of producing an
    /// empty answer.
    ///
    /// # Errors
    ///
    /// [`ChunkingError::ResultValidation`] when only placeholders exist.
    pub fn run_reduce(
        &mut self,
        deleted_files: Option<&[String]>,
    ) -> Result<(AggregationResult, String)> {
        let Some(state) = self.manager.state() else {
            return Err(ChunkingError::NoChunks.into());
        };

        let real_results: Vec<ChunkResult> = state
            .results
            .iter()
            .filter(|r| r.status.is_real())
            .cloned()
            .collect();

        if real_results.is_empty() {
            return Err(ChunkingError::ResultValidation {
                reason: "all results are placeholders; run map against a live model first"
                    .to_string(),
            }
            .into());
        }

        let query = state.query.clone().unwrap_or_default();

        if let Some(state) = self.manager.state_mut() {
            state.phase = Phase::Reduce;
        }
        self.manager.save()?;

        let aggregation = Aggregator::default().aggregate(&real_results, &query, deleted_files);
        let summary = format_summary(&aggregation, 10);

        if let Some(state) = self.manager.state_mut() {
            state.set_final_answer(summary.clone());
        }
        self.manager.save()?;
        self.checkpoints.clear_checkpoint();

        Ok((aggregation, summary))
    }
}

/// Processes one batch, in parallel (preferred) or sequentially.
fn run_batch(
    batch: &[ChunkInfo],
    backend: Option<&dyn AnalysisBackend>,
    query: &str,
    agent_type: crate::core::config::AgentType,
    sequential: bool,
    escalated: bool,
) -> Vec<ChunkResult> {
    let Some(backend) = backend else {
        return batch
            .iter()
            .map(|chunk| ChunkResult::placeholder(&chunk.chunk_id))
            .collect();
    };

    let process = |chunk: &ChunkInfo| -> ChunkResult {
        let content = match std::fs::read_to_string(&chunk.file_path) {
            Ok(content) => content,
            Err(e) => {
                return ChunkResult::failed(
                    &chunk.chunk_id,
                    format!("chunk content unreadable: {e}"),
                );
            }
        };
        let prompt = if sequential {
            create_sequential_prompt(chunk, &content, query)
        } else {
            generate_subagent_prompt(chunk, &content, query, agent_type)
        };
        match backend.dispatch(&prompt, escalated) {
            Ok(response) => parse_subagent_response(&chunk.chunk_id, &response),
            Err(e) => ChunkResult::failed(&chunk.chunk_id, e.to_string()),
        }
    };

    if sequential {
        batch.iter().map(process).collect()
    } else {
        batch.par_iter().map(process).collect()
    }
}

/// Applies the reconciliation rule for one incoming result.
///
/// Real results (success or failure) replace every prior entry for the
/// chunk; placeholder/pending results replace only their own kind and
/// never displace a real result.
pub fn reconcile_result(state: &mut crate::core::state::ScanState, incoming: ChunkResult) {
    let chunk_id = incoming.chunk_id.clone();

    if incoming.status.is_real() {
        state.results.retain(|r| r.chunk_id != chunk_id);
        let chunk_state = match incoming.status {
            ResultStatus::Failed => ChunkState::Failed,
            _ => ChunkState::Completed,
        };
        for chunk in &mut state.chunks {
            if chunk.chunk_id == chunk_id {
                chunk.status = chunk_state;
            }
        }
        state.results.push(incoming);
        return;
    }

    // Placeholder/pending: never supersede a real result.
    let has_real = state
        .results
        .iter()
        .any(|r| r.chunk_id == chunk_id && r.status.is_real());
    if has_real {
        return;
    }
    state
        .results
        .retain(|r| !(r.chunk_id == chunk_id && !r.status.is_real()));
    state.results.push(incoming);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ScanConfig;
    use crate::core::state::ScanState;
    use crate::sandbox::{HelperDispatcher, HelperRequest};
    use crate::state::InitOptions;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedBackend {
        responses: Mutex<Vec<String>>,
        dispatches: AtomicUsize,
        fail_all: bool,
    }

    impl ScriptedBackend {
        fn completing(point: &str) -> Self {
            Self {
                responses: Mutex::new(vec![format!(
                    r#"{{"chunk_id": "x", "status": "completed",
                        "findings": [{{"point": "{point}", "confidence": "medium"}}]}}"#
                )]),
                dispatches: AtomicUsize::new(0),
                fail_all: false,
            }
        }

        fn failing() -> Self {
            Self {
                responses: Mutex::new(Vec::new()),
                dispatches: AtomicUsize::new(0),
                fail_all: true,
            }
        }
    }

    impl AnalysisBackend for ScriptedBackend {
        fn dispatch(&self, _prompt: &str, _escalated: bool) -> Result<String> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            if self.fail_all {
                return Ok("the response is not json at all".to_string());
            }
            let responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            Ok(responses.first().cloned().unwrap_or_default())
        }
    }

    fn session(files: &[(&str, &str)]) -> (TempDir, TempDir, StateManager) {
        let cache = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        for (name, content) in files {
            let path = ctx.path().join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, content).unwrap();
        }
        let mut mgr =
            StateManager::new(Some("driver_test"), cache.path().to_path_buf()).unwrap();
        mgr.init(&ctx.path().display().to_string(), &InitOptions::default())
            .unwrap();
        mgr.dispatch(HelperRequest::WriteChunks {
            out_dir: None,
            size: 50_000,
            overlap: 0,
            semantic: false,
        })
        .unwrap();
        (cache, ctx, mgr)
    }

    #[test]
    fn test_map_without_backend_produces_placeholders() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "hello world")]);
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let outcome = driver.run_map(None, &MapOptions::default()).unwrap();

        assert!(outcome.placeholders);
        assert_eq!(outcome.processed, 1);
        let state = mgr.state().unwrap();
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].status, ResultStatus::Placeholder);
        assert_eq!(state.phase, Phase::Map);
        // Placeholders never advance progress.
        assert!(state.progress_percent.abs() < f64::EPSILON);
    }

    #[test]
    fn test_map_with_backend_supersedes_placeholders() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "hello world")]);
        {
            let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
            driver.run_map(None, &MapOptions::default()).unwrap();
        }

        let backend = ScriptedBackend::completing("greets the world");
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let outcome = driver
            .run_map(Some(&backend), &MapOptions::default())
            .unwrap();

        assert!(!outcome.placeholders);
        let state = mgr.state().unwrap();
        // The placeholder was replaced, not duplicated.
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].status, ResultStatus::Completed);
        assert!((state.progress_percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_map_writes_checkpoint_and_progress_log() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "content here")]);
        let backend = ScriptedBackend::completing("notes content");
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        driver
            .run_map(Some(&backend), &MapOptions::default())
            .unwrap();

        let session_dir = cache.path().join("driver_test");
        assert!(session_dir.join("checkpoint.json").exists());
        let log = std::fs::read_to_string(session_dir.join("progress.jsonl")).unwrap();
        assert!(log.contains("batch_start"));
        assert!(log.contains("chunk_complete"));
        assert!(log.contains("batch_end"));
        assert!(log.contains("finding"));
    }

    #[test]
    fn test_map_skips_chunks_with_real_results() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "hello world")]);
        let backend = ScriptedBackend::completing("first pass");
        {
            let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
            driver
                .run_map(Some(&backend), &MapOptions::default())
                .unwrap();
        }

        let second = ScriptedBackend::completing("second pass");
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let outcome = driver.run_map(Some(&second), &MapOptions::default()).unwrap();
        assert_eq!(outcome.processed, 0);
        assert_eq!(second.dispatches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_map_without_chunks_errors() {
        crate::cancel::reset_global();
        let cache = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        std::fs::write(ctx.path().join("a.txt"), "x").unwrap();
        let mut mgr = StateManager::new(Some("nochunks"), cache.path().to_path_buf()).unwrap();
        mgr.init(&ctx.path().display().to_string(), &InitOptions::default())
            .unwrap();

        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let err = driver.run_map(None, &MapOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Chunking(ChunkingError::NoChunks)
        ));
    }

    #[test]
    fn test_reduce_refuses_placeholder_only() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "hello world")]);
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        driver.run_map(None, &MapOptions::default()).unwrap();

        let err = driver.run_reduce(None).unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn test_reduce_aggregates_and_completes() {
        crate::cancel::reset_global();
        // Large context spanning several chunks; the scripted backend
        // reports the same finding everywhere, which must deduplicate.
        let a = "hello world ".repeat(5000);
        let b = "different words ".repeat(5000);
        let (cache, _ctx, mut mgr) = session(&[("a.txt", a.as_str()), ("b.txt", b.as_str())]);
        let backend = ScriptedBackend::completing("greets the world");
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        driver
            .run_map(Some(&backend), &MapOptions::default())
            .unwrap();

        let (aggregation, summary) = driver.run_reduce(None).unwrap();
        assert!(aggregation.total_findings >= 1);
        assert!(aggregation.unique_findings <= aggregation.total_findings);
        assert!(summary.contains("DeepScan Results Summary"));

        let state = mgr.state().unwrap();
        assert_eq!(state.phase, Phase::Completed);
        assert!(state.final_answer.is_some());
    }

    #[test]
    fn test_failed_results_are_terminal_for_plain_map() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "hello world")]);
        let backend = ScriptedBackend::failing();
        {
            let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
            driver
                .run_map(Some(&backend), &MapOptions::default())
                .unwrap();
        }
        assert_eq!(
            mgr.state().unwrap().results[0].status,
            ResultStatus::Failed
        );

        // A plain re-run does not touch failed chunks.
        let retry = ScriptedBackend::completing("should not run");
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let outcome = driver.run_map(Some(&retry), &MapOptions::default()).unwrap();
        assert_eq!(outcome.processed, 0);
    }

    #[test]
    fn test_reconcile_rules() {
        let mut state = ScanState::new("s", ScanConfig::default());

        // placeholder then real: real wins.
        reconcile_result(&mut state, ChunkResult::placeholder("aa"));
        assert_eq!(state.results.len(), 1);
        reconcile_result(&mut state, ChunkResult::completed("aa", vec![]));
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].status, ResultStatus::Completed);

        // real then placeholder: placeholder is dropped.
        reconcile_result(&mut state, ChunkResult::placeholder("aa"));
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].status, ResultStatus::Completed);

        // failed then real (escalation path): real wins.
        reconcile_result(&mut state, ChunkResult::failed("bb", "boom"));
        reconcile_result(&mut state, ChunkResult::completed("bb", vec![]));
        let bb: Vec<&ChunkResult> =
            state.results.iter().filter(|r| r.chunk_id == "bb").collect();
        assert_eq!(bb.len(), 1);
        assert_eq!(bb[0].status, ResultStatus::Completed);
    }

    #[test]
    fn test_reconcile_updates_chunk_status() {
        let mut state = ScanState::new("s", ScanConfig::default());
        state.chunks.push(crate::core::chunk::ChunkInfo::from_span(
            "cc".to_string(),
            "chunks/cc.txt".to_string(),
            0,
            10,
        ));

        reconcile_result(&mut state, ChunkResult::failed("cc", "x"));
        assert_eq!(state.chunks[0].status, ChunkState::Failed);

        reconcile_result(&mut state, ChunkResult::completed("cc", vec![]));
        assert_eq!(state.chunks[0].status, ChunkState::Completed);
    }

    #[test]
    fn test_escalation_selects_only_eligible_failures() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "hello world")]);
        // Seed a failed result whose classification (timeout) is never
        // eligible for escalation.
        let chunk_id = mgr.state().unwrap().chunks[0].chunk_id.clone();
        if let Some(state) = mgr.state_mut() {
            reconcile_result(
                state,
                ChunkResult::failed(&chunk_id, "request timed out after 300s"),
            );
        }
        mgr.save().unwrap();

        let backend = ScriptedBackend::completing("retry result");
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let outcome = driver
            .run_map(
                Some(&backend),
                &MapOptions {
                    escalate: true,
                    ..MapOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.processed, 0);
    }

    #[test]
    fn test_escalation_retries_quality_failures() {
        crate::cancel::reset_global();
        let (cache, _ctx, mut mgr) = session(&[("a.txt", "hello world")]);
        let chunk_id = mgr.state().unwrap().chunks[0].chunk_id.clone();
        if let Some(state) = mgr.state_mut() {
            reconcile_result(
                state,
                ChunkResult::failed(&chunk_id, "response too complex for tier"),
            );
        }
        mgr.save().unwrap();

        let backend = ScriptedBackend::completing("escalated result");
        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let outcome = driver
            .run_map(
                Some(&backend),
                &MapOptions {
                    escalate: true,
                    ..MapOptions::default()
                },
            )
            .unwrap();

        assert_eq!(outcome.processed, 1);
        let state = mgr.state().unwrap();
        assert_eq!(state.results.len(), 1);
        assert_eq!(state.results[0].status, ResultStatus::Completed);

        // The escalation event was logged.
        let log = std::fs::read_to_string(
            cache.path().join("driver_test").join("progress.jsonl"),
        )
        .unwrap();
        assert!(log.contains("escalation"));
    }

    #[test]
    fn test_limit_caps_processed_chunks() {
        crate::cancel::reset_global();
        let big = "word ".repeat(30_000); // ~150k chars -> multiple chunks at 50k
        let (cache, _ctx, mut mgr) = session(&[("a.txt", big.as_str())]);
        assert!(mgr.state().unwrap().chunks.len() > 1);

        let mut driver = MapReduceDriver::new(&mut mgr, cache.path()).unwrap();
        let outcome = driver
            .run_map(
                None,
                &MapOptions {
                    limit: Some(1),
                    ..MapOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.processed, 1);
    }
}
