//! Session state management.
//!
//! The state manager exclusively owns the on-disk session directory and
//! the in-memory state record. It composes the analysis context in one
//! of three modes (full, lazy, targeted), enforces the per-file and
//! total size caps, honours `.deepscanignore`, and implements the helper
//! capability table the sandbox dispatches into.
//!
//! Path hardening: session hashes are grammar-validated before any
//! filesystem access, every write lands inside the cache root (checked
//! on canonical forms), and symlinks are never followed.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;
use walkdir::WalkDir;

use crate::chunker::{ChunkBudget, chunk_directory, chunk_spans};
use crate::checkpoint::{DEFAULT_RETRY_DELAY, DEFAULT_WRITE_RETRIES, atomic_write};
use crate::core::chunk::{ChunkInfo, compute_chunk_id};
use crate::core::config::{AgentType, ScanConfig, ScanMode, validate_chunk_geometry};
use crate::core::constants::{
    DEFAULT_LAZY_DEPTH, DEFAULT_LAZY_FILE_LIMIT, MAX_ABSOLUTE_CHUNKS, MAX_CONTEXT_PREVIEW,
    MAX_RECOMMENDED_CHUNKS, MAX_SINGLE_FILE_SIZE, MAX_TOTAL_CONTEXT_SIZE, detect_content_type,
    truncate_output,
};
use crate::core::result::ChunkResult;
use crate::core::session::{generate_session_hash, validate_session_hash};
use crate::core::state::{ContextMetadata, Phase, ScanState};
use crate::error::{Result, StateError};
use crate::grep::safe_grep;
use crate::incremental::{
    ChunkFileMapping, ChunkSpan, FileDelta, FileHashManifest, HashAlgorithm, IncrementalAnalyzer,
};
use crate::sandbox::{HelperDispatcher, HelperRequest};
use crate::walker::{TreeViewOptions, default_should_prune, generate_tree_view};

/// State file name inside a session directory.
pub const STATE_FILE: &str = "state.json";

/// Marker file holding the current session hash.
pub const CURRENT_SESSION_MARKER: &str = ".current_session";

/// Ignore file name looked up at the context root.
pub const IGNORE_FILE: &str = ".deepscanignore";

/// Default cache root under the per-user cache directory.
#[must_use]
pub fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deepscan")
}

/// Custom ignore rules parsed from `.deepscanignore`.
#[derive(Default)]
pub struct IgnoreRules {
    dirs: BTreeSet<String>,
    globs: Option<GlobSet>,
    glob_count: usize,
}

impl IgnoreRules {
    /// Parses ignore rules from file content.
    ///
    /// `#` comments and blank lines are skipped, trailing `/` is
    /// stripped; a line containing `*` or `?` becomes a glob matched
    /// against the relative path, anything else is a directory name
    /// matched against any path component.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut dirs = BTreeSet::new();
        let mut builder = GlobSetBuilder::new();
        let mut glob_count = 0usize;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.trim_end_matches('/');
            if line.contains('*') || line.contains('?') {
                match Glob::new(line) {
                    Ok(glob) => {
                        builder.add(glob);
                        glob_count += 1;
                    }
                    Err(e) => {
                        tracing::debug!(pattern = line, error = %e, "ignoring bad glob");
                    }
                }
            } else {
                dirs.insert(line.to_string());
            }
        }

        Self {
            dirs,
            globs: builder.build().ok(),
            glob_count,
        }
    }

    /// Loads rules from the ignore file at a context root, if present.
    #[must_use]
    pub fn load(context_root: &Path) -> Self {
        fs::read_to_string(context_root.join(IGNORE_FILE))
            .map(|content| Self::parse(&content))
            .unwrap_or_default()
    }

    /// Whether any custom rules were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.glob_count == 0
    }

    /// Count of (directory, glob) rules.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        (self.dirs.len(), self.glob_count)
    }

    /// Whether a path should be skipped, combining the default prune
    /// set, custom directory names, and glob patterns.
    #[must_use]
    pub fn should_skip(&self, path: &Path, root: Option<&Path>) -> bool {
        for component in path.components() {
            let name = component.as_os_str().to_string_lossy();
            if crate::walker::DEFAULT_PRUNE_DIRS.contains(&name.as_ref())
                || self.dirs.contains(name.as_ref())
            {
                return true;
            }
        }
        if let (Some(globs), Some(root)) = (self.globs.as_ref(), root)
            && let Ok(rel) = path.strip_prefix(root)
            && globs.is_match(rel)
        {
            return true;
        }
        false
    }
}

/// Options accepted by [`StateManager::init`].
#[derive(Default)]
pub struct InitOptions {
    /// Initial analysis query.
    pub query: Option<String>,
    /// Auto-detect content type and pick a chunk size.
    pub adaptive: bool,
    /// Enable incremental re-analysis.
    pub incremental: bool,
    /// Previous session for delta computation.
    pub previous_session: Option<String>,
    /// Structure-only mode.
    pub lazy: bool,
    /// Target paths (switches to targeted mode when non-empty).
    pub targets: Option<Vec<String>>,
    /// Lazy traversal depth.
    pub depth: Option<usize>,
    /// Analysis specialisation.
    pub agent_type: AgentType,
}

/// Summary row for `list`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    /// Session hash (directory name).
    pub hash: String,
    /// Lifecycle phase.
    pub phase: String,
    /// Progress percentage.
    pub progress: f64,
    /// Context size in bytes.
    pub context_size: usize,
    /// Chunk count.
    pub chunks: usize,
    /// Result count.
    pub results: usize,
    /// State file modification time (unix seconds).
    pub modified: i64,
}

/// Outcome of a garbage-collection pass.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct GcOutcome {
    /// Sessions deleted.
    pub deleted: usize,
    /// Bytes freed.
    pub freed_bytes: u64,
}

/// Owns the session directory and the in-memory state record.
pub struct StateManager {
    session_hash: String,
    cache_root: PathBuf,
    state_dir: PathBuf,
    state_file: PathBuf,
    state: Option<ScanState>,
    context_content: Option<String>,
    context_root: Option<PathBuf>,
    lazy_tree_view: String,
    ignore: IgnoreRules,
    file_delta: Option<FileDelta>,
    chunk_mapping: ChunkFileMapping,
    save_lock: Mutex<()>,
}

impl StateManager {
    /// Creates a manager for an existing or fresh session.
    ///
    /// # Errors
    ///
    /// Rejects hashes outside the grammar before any directory is
    /// created, and session paths that escape the cache root.
    pub fn new(session_hash: Option<&str>, cache_root: PathBuf) -> Result<Self> {
        let session_hash = match session_hash {
            Some(hash) => {
                if !validate_session_hash(hash) {
                    return Err(StateError::InvalidSessionHash {
                        hash: hash.to_string(),
                    }
                    .into());
                }
                hash.to_string()
            }
            None => generate_session_hash(),
        };

        let state_dir = cache_root.join(&session_hash);
        if let (Ok(resolved), Ok(root)) = (state_dir.canonicalize(), cache_root.canonicalize())
            && resolved.strip_prefix(&root).is_err()
        {
            return Err(StateError::PathTraversal {
                path: state_dir.display().to_string(),
            }
            .into());
        }

        let state_file = state_dir.join(STATE_FILE);
        Ok(Self {
            session_hash,
            cache_root,
            state_dir,
            state_file,
            state: None,
            context_content: None,
            context_root: None,
            lazy_tree_view: String::new(),
            ignore: IgnoreRules::default(),
            file_delta: None,
            chunk_mapping: ChunkFileMapping::default(),
            save_lock: Mutex::new(()),
        })
    }

    /// The session hash.
    #[must_use]
    pub fn session_hash(&self) -> &str {
        &self.session_hash
    }

    /// The session directory.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// The in-memory state, if loaded or initialised.
    #[must_use]
    pub fn state(&self) -> Option<&ScanState> {
        self.state.as_ref()
    }

    /// Mutable access to the state record.
    pub fn state_mut(&mut self) -> Option<&mut ScanState> {
        self.state.as_mut()
    }

    /// The file delta computed at init when incremental mode is on.
    #[must_use]
    pub fn file_delta(&self) -> Option<&FileDelta> {
        self.file_delta.as_ref()
    }

    /// The lazy-mode tree view (empty outside lazy mode).
    #[must_use]
    pub fn lazy_tree_view(&self) -> &str {
        &self.lazy_tree_view
    }

    /// Chunk ids that cover the given changed files.
    #[must_use]
    pub fn chunks_to_reanalyze(&self, changed: &[String]) -> BTreeSet<String> {
        self.chunk_mapping
            .chunks_for_paths(changed.iter().map(String::as_str))
    }

    fn ensure_dirs(&self) -> Result<()> {
        for sub in ["chunks", "results", "logs"] {
            let dir = self.state_dir.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StateError::CacheDir {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Writes content under the session directory with containment
    /// enforcement on canonical paths.
    fn safe_write(&self, path: &Path, content: &str) -> Result<()> {
        let parent = path.parent().unwrap_or(&self.state_dir);
        fs::create_dir_all(parent).map_err(|e| StateError::CacheDir {
            path: parent.display().to_string(),
            reason: e.to_string(),
        })?;

        let resolved_parent = parent.canonicalize().map_err(|e| StateError::Io {
            path: parent.display().to_string(),
            reason: e.to_string(),
        })?;
        let allowed = self.cache_root.canonicalize().map_err(|e| StateError::Io {
            path: self.cache_root.display().to_string(),
            reason: e.to_string(),
        })?;
        if resolved_parent.strip_prefix(&allowed).is_err() {
            return Err(StateError::PathTraversal {
                path: path.display().to_string(),
            }
            .into());
        }

        fs::write(path, content).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Loads the state record from disk.
    ///
    /// # Errors
    ///
    /// [`StateError::NotInitialized`] when no state file exists;
    /// corruption surfaces as a state error.
    pub fn load(&mut self) -> Result<&ScanState> {
        let _guard = self.save_lock.lock();
        if !self.state_file.exists() {
            return Err(StateError::NotInitialized {
                hash: self.session_hash.clone(),
            }
            .into());
        }
        let content = fs::read_to_string(&self.state_file).map_err(|e| StateError::Io {
            path: self.state_file.display().to_string(),
            reason: e.to_string(),
        })?;
        let state: ScanState = serde_json::from_str(&content)?;

        // Re-establish the context root and ignore rules for helpers.
        if let Some(meta) = &state.context_meta {
            let path = PathBuf::from(&meta.path);
            let root = if path.is_dir() {
                path
            } else {
                path.parent().map(Path::to_path_buf).unwrap_or(path)
            };
            self.ignore = IgnoreRules::load(&root);
            self.context_root = Some(root);
        }

        Ok(&*self.state.insert(state))
    }

    /// Saves the state record atomically.
    ///
    /// # Errors
    ///
    /// Propagates atomic-write failures.
    pub fn save(&mut self) -> Result<()> {
        let _guard = self.save_lock.lock();
        self.ensure_dirs()?;
        let Some(state) = self.state.as_mut() else {
            return Err(StateError::EmptyContext.into());
        };
        state.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(state)?;
        atomic_write(
            &self.state_file,
            &json,
            DEFAULT_WRITE_RETRIES,
            DEFAULT_RETRY_DELAY,
            Some(crate::cancel::manager()),
        )
    }

    /// Initialises a new session over a context path.
    ///
    /// # Errors
    ///
    /// Validation errors for missing paths and oversized contexts;
    /// anything the chosen mode's composition rejects.
    #[allow(clippy::too_many_lines)]
    pub fn init(&mut self, context_path: &str, options: &InitOptions) -> Result<&ScanState> {
        self.ensure_dirs()?;

        let path = PathBuf::from(context_path);
        if !path.exists() {
            return Err(StateError::ContextPathNotFound {
                path: context_path.to_string(),
            }
            .into());
        }

        let context_root = if path.is_dir() {
            path.clone()
        } else {
            path.parent().map_or_else(|| path.clone(), Path::to_path_buf)
        };
        self.ignore = IgnoreRules::load(&context_root);
        if !self.ignore.is_empty() {
            let (dirs, globs) = self.ignore.counts();
            tracing::info!(dirs, globs, "loaded {IGNORE_FILE}");
        }
        self.context_root = Some(context_root);

        let targets = options.targets.as_deref().filter(|t| {
            if t.is_empty() {
                tracing::warn!(
                    "empty target list provided - falling back to full mode; \
                     use --target PATH to specify files or directories"
                );
                false
            } else {
                true
            }
        });

        let effective_depth = options.depth.unwrap_or(DEFAULT_LAZY_DEPTH);
        let mut file_extensions: Vec<String> = Vec::new();

        let (content, is_directory, file_count) = if options.lazy {
            self.compose_lazy(&path, effective_depth, &mut file_extensions)
        } else if let Some(targets) = targets {
            self.compose_targeted(&path, targets, &mut file_extensions)?
        } else {
            self.compose_full(&path, &mut file_extensions)?
        };

        let mut config = ScanConfig::default();
        if options.adaptive && !file_extensions.is_empty() {
            let content_type = detect_content_type(&file_extensions);
            config.adaptive_chunking = true;
            config.detected_content_type = Some(content_type.as_str().to_string());
            config.chunk_size = content_type.recommended_chunk_size();
        }
        if targets.is_some() {
            config.scan_mode = ScanMode::Targeted;
            config.target_paths = options.targets.clone().unwrap_or_default();
        } else if options.lazy {
            config.scan_mode = ScanMode::Lazy;
        }
        if let Some(depth) = options.depth {
            config.lazy_depth = depth;
        }
        config.lazy_file_limit = DEFAULT_LAZY_FILE_LIMIT;
        config.agent_type = options.agent_type;

        let mut state = ScanState::new(self.session_hash.clone(), config);
        state.context_meta = Some(ContextMetadata {
            path: path
                .canonicalize()
                .unwrap_or_else(|_| path.clone())
                .display()
                .to_string(),
            loaded_at: Utc::now(),
            total_size: content.len(),
            is_directory,
            file_count,
        });
        state.query = options.query.clone();
        state.phase = Phase::Initialized;

        self.context_content = Some(content);
        self.state = Some(state);

        // Incremental re-analysis: manifest, delta, counts.
        if options.incremental && is_directory {
            match self.compute_incremental(&path, options.previous_session.as_deref()) {
                Ok(delta) => {
                    if let Some(state) = self.state.as_mut() {
                        state.config.incremental_enabled = true;
                        state.config.previous_session = options.previous_session.clone();
                        state.config.changed_file_count = delta.reanalysis_count();
                        state.config.deleted_file_count = delta.deleted_files.len();
                    }
                    self.file_delta = Some(delta);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "incremental analysis failed, using full analysis");
                    self.file_delta = None;
                }
            }
        }

        self.save()?;
        set_current_session_hash(&self.cache_root, &self.session_hash)?;

        self.state.as_ref().ok_or_else(|| {
            crate::error::SystemError::Internal {
                message: "state missing after init".to_string(),
            }
            .into()
        })
    }

    fn compose_lazy(
        &mut self,
        path: &Path,
        depth: usize,
        extensions: &mut Vec<String>,
    ) -> (String, bool, usize) {
        if path.is_file() {
            if let Some(ext) = path.extension() {
                extensions.push(format!(".{}", ext.to_string_lossy().to_lowercase()));
            }
            let size = fs::metadata(path).map_or(0, |m| m.len());
            self.lazy_tree_view = format!(
                "{} ({size} bytes)",
                path.file_name().map_or_else(
                    || path.display().to_string(),
                    |n| n.to_string_lossy().to_string()
                )
            );
            (String::new(), false, 1)
        } else {
            self.lazy_tree_view = generate_tree_view(
                path,
                &TreeViewOptions {
                    max_depth: Some(depth),
                    max_entries: Some(DEFAULT_LAZY_FILE_LIMIT),
                    should_prune: Some(Box::new(default_should_prune)),
                    show_size: true,
                    show_hidden: false,
                },
            );
            // Approximate: one "(size)" annotation per file line.
            let file_count = self.lazy_tree_view.matches('(').count().saturating_sub(1);
            (String::new(), true, file_count)
        }
    }

    fn compose_targeted(
        &mut self,
        path: &Path,
        targets: &[String],
        extensions: &mut Vec<String>,
    ) -> Result<(String, bool, usize)> {
        let mut parts: Vec<String> = Vec::new();
        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        let mut total_size = 0usize;
        let mut file_count = 0usize;
        let resolved_context = path.canonicalize().map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        'targets: for target in targets {
            if target.trim().is_empty() {
                continue;
            }
            let target_path = path.join(target);

            // Containment check on canonical forms.
            let Ok(resolved) = target_path.canonicalize() else {
                continue;
            };
            if resolved.strip_prefix(&resolved_context).is_err() {
                tracing::warn!(target, "target escapes the context path, skipping");
                continue;
            }
            if target_path.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
                continue;
            }

            if target_path.is_file() {
                if !append_file(
                    &target_path,
                    path,
                    &mut parts,
                    &mut seen,
                    &mut total_size,
                    &mut file_count,
                    extensions,
                    true,
                ) {
                    break 'targets;
                }
            } else if target_path.is_dir() {
                let entries = WalkDir::new(&target_path)
                    .follow_links(false)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_entry(|e| !default_should_prune(e.path()));
                for entry in entries.filter_map(std::result::Result::ok) {
                    if !entry.file_type().is_file() || entry.path_is_symlink() {
                        continue;
                    }
                    if self
                        .ignore
                        .should_skip(entry.path(), self.context_root.as_deref())
                    {
                        continue;
                    }
                    if !append_file(
                        entry.path(),
                        path,
                        &mut parts,
                        &mut seen,
                        &mut total_size,
                        &mut file_count,
                        extensions,
                        false,
                    ) {
                        break 'targets;
                    }
                }
            }
        }

        Ok((parts.concat(), path.is_dir(), file_count))
    }

    fn compose_full(
        &mut self,
        path: &Path,
        extensions: &mut Vec<String>,
    ) -> Result<(String, bool, usize)> {
        if path.is_file() {
            let size = fs::metadata(path).map_or(0, |m| m.len());
            if size > MAX_SINGLE_FILE_SIZE {
                return Err(StateError::FileTooLarge {
                    path: path.display().to_string(),
                    size,
                    limit: MAX_SINGLE_FILE_SIZE,
                }
                .into());
            }
            if let Some(ext) = path.extension() {
                extensions.push(format!(".{}", ext.to_string_lossy().to_lowercase()));
            }
            let content = crate::io::read_file_lossy(path)?;
            return Ok((content, false, 1));
        }

        let mut parts: Vec<String> = Vec::new();
        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();
        let mut total_size = 0usize;
        let mut file_count = 0usize;

        let entries = WalkDir::new(path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !default_should_prune(e.path()));
        for entry in entries.filter_map(std::result::Result::ok) {
            if !entry.file_type().is_file() || entry.path_is_symlink() {
                continue;
            }
            if self
                .ignore
                .should_skip(entry.path(), self.context_root.as_deref())
            {
                continue;
            }
            if !append_file(
                entry.path(),
                path,
                &mut parts,
                &mut seen,
                &mut total_size,
                &mut file_count,
                extensions,
                false,
            ) {
                break;
            }
        }

        let content = parts.concat();
        if content.len() > MAX_TOTAL_CONTEXT_SIZE {
            return Err(StateError::ContextTooLarge {
                size: content.len(),
                limit: MAX_TOTAL_CONTEXT_SIZE,
            }
            .into());
        }
        Ok((content, true, file_count))
    }

    fn compute_incremental(
        &mut self,
        path: &Path,
        previous_session: Option<&str>,
    ) -> Result<FileDelta> {
        let ignore = &self.ignore;
        let root = self.context_root.clone();
        let skip = |p: &Path| ignore.should_skip(p, root.as_deref());
        let current = FileHashManifest::from_directory(path, HashAlgorithm::default(), Some(&skip));

        let previous = previous_session.and_then(|session| {
            IncrementalAnalyzer::new(session, &self.cache_root)
                .ok()
                .and_then(|analyzer| analyzer.load_manifest())
        });

        let delta = previous.map_or_else(
            || FileDelta {
                added_files: current.file_hashes.keys().cloned().collect(),
                ..FileDelta::default()
            },
            |previous| current.compare_with(&previous),
        );

        let analyzer = IncrementalAnalyzer::new(&self.session_hash, &self.cache_root)?;
        analyzer.save_manifest(&current)?;
        Ok(delta)
    }

    /// Returns the loaded context content, reloading from disk when the
    /// manager was resumed. Lazy mode always yields an empty context.
    ///
    /// # Errors
    ///
    /// Validation errors when the recorded context path is missing,
    /// contains traversal components, or is a symlink.
    pub fn get_context(&mut self) -> Result<String> {
        if let Some(content) = &self.context_content {
            return Ok(content.clone());
        }

        let (scan_mode, meta, targets) = {
            let Some(state) = self.state.as_ref() else {
                return Err(StateError::EmptyContext.into());
            };
            let Some(meta) = state.context_meta.clone() else {
                return Err(StateError::EmptyContext.into());
            };
            (
                state.config.scan_mode,
                meta,
                state.config.target_paths.clone(),
            )
        };

        if scan_mode == ScanMode::Lazy {
            self.context_content = Some(String::new());
            return Ok(String::new());
        }

        let path = PathBuf::from(&meta.path);
        if meta.path.contains("..") {
            return Err(StateError::PathTraversal { path: meta.path }.into());
        }
        if path.symlink_metadata().is_ok_and(|m| m.file_type().is_symlink()) {
            return Err(StateError::PathTraversal {
                path: meta.path.clone(),
            }
            .into());
        }
        if !path.exists() {
            return Err(StateError::ContextPathNotFound { path: meta.path }.into());
        }

        let mut extensions = Vec::new();
        let (content, _, _) = if scan_mode == ScanMode::Targeted {
            self.compose_targeted(&path, &targets, &mut extensions)?
        } else {
            self.compose_full(&path, &mut extensions)?
        };
        self.context_content = Some(content.clone());
        Ok(content)
    }

    /// Whether the session runs in lazy mode.
    #[must_use]
    pub fn is_lazy_mode(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.config.scan_mode == ScanMode::Lazy)
    }

    /// Removes the session directory and forgets the state.
    ///
    /// # Errors
    ///
    /// Propagates directory-removal failures.
    pub fn reset(&mut self) -> Result<()> {
        if self.state_dir.exists() {
            fs::remove_dir_all(&self.state_dir).map_err(|e| StateError::Io {
                path: self.state_dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        self.state = None;
        self.context_content = None;
        clear_current_session_if(&self.cache_root, &self.session_hash);
        Ok(())
    }

    // -- helper implementations ------------------------------------------

    fn lazy_guard(&self, operation: &str, hint: &str) -> Result<()> {
        if self.is_lazy_mode() {
            return Err(StateError::LazyModeRequired {
                operation: operation.to_string(),
                recovery_hint: hint.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn helper_peek(&mut self, start: i64, end: Option<i64>) -> Result<String> {
        if self.is_lazy_mode() {
            return Ok(
                "[LAZY MODE] Global context is not loaded.\n\
                 Use get_tree_view() to see file structure.\n\
                 Use load_file('path/to/file') to view specific content."
                    .to_string(),
            );
        }
        let content = self.get_context()?;
        let len = i64::try_from(content.len()).unwrap_or(i64::MAX);
        let start = if start < 0 {
            (len + start).max(0)
        } else {
            start.min(len)
        };
        let end = end.map_or_else(|| (start + 3000).min(len), |e| e.clamp(start, len));
        #[allow(clippy::cast_sign_loss)]
        let (start, end) = (start as usize, end as usize);
        let start = floor_char_boundary(&content, start);
        let end = floor_char_boundary(&content, end);
        Ok(truncate_output(&content[start..end], MAX_CONTEXT_PREVIEW))
    }

    fn helper_write_chunks(
        &mut self,
        out_dir: Option<&str>,
        size: usize,
        overlap: usize,
        semantic: bool,
    ) -> Result<Vec<String>> {
        if !semantic {
            self.lazy_guard(
                "write_chunks()",
                "Use semantic=True for AST-based chunking, or use targeted/full mode.",
            )?;
        }

        let out_path = match out_dir {
            Some(dir) => {
                // Reject escapes lexically before anything is created.
                let rel = Path::new(dir);
                if rel.is_absolute()
                    || rel
                        .components()
                        .any(|c| matches!(c, std::path::Component::ParentDir))
                {
                    return Err(StateError::PathTraversal {
                        path: dir.to_string(),
                    }
                    .into());
                }
                let candidate = self.state_dir.join(rel);
                fs::create_dir_all(&candidate).map_err(|e| StateError::CacheDir {
                    path: candidate.display().to_string(),
                    reason: e.to_string(),
                })?;
                let resolved = candidate.canonicalize().map_err(|e| StateError::Io {
                    path: candidate.display().to_string(),
                    reason: e.to_string(),
                })?;
                let state_resolved =
                    self.state_dir.canonicalize().map_err(|e| StateError::Io {
                        path: self.state_dir.display().to_string(),
                        reason: e.to_string(),
                    })?;
                if resolved.strip_prefix(&state_resolved).is_err() {
                    return Err(StateError::PathTraversal {
                        path: dir.to_string(),
                    }
                    .into());
                }
                candidate
            }
            None => self.state_dir.join("chunks"),
        };
        fs::create_dir_all(&out_path).map_err(|e| StateError::CacheDir {
            path: out_path.display().to_string(),
            reason: e.to_string(),
        })?;

        // Semantic path: AST-chunk source files under the context root.
        if semantic {
            validate_chunk_geometry(size, overlap)?;
            if let Some(root) = self.context_root.clone()
                && root.is_dir()
            {
                let budget = ChunkBudget::from_chunk_size(size);
                let (semantic_chunks, mapping) = chunk_directory(&root, &budget);
                if !semantic_chunks.is_empty() {
                    check_chunk_count(semantic_chunks.len(), size)?;
                    let mut paths = Vec::with_capacity(semantic_chunks.len());
                    let mut infos = Vec::with_capacity(semantic_chunks.len());
                    for (i, chunk) in semantic_chunks.iter().enumerate() {
                        let chunk_file = out_path.join(format!("chunk_{i:04}.txt"));
                        self.safe_write(&chunk_file, &chunk.content)?;
                        paths.push(chunk_file.display().to_string());
                        infos.push(ChunkInfo {
                            chunk_id: chunk.chunk_id.clone(),
                            file_path: chunk_file.display().to_string(),
                            start_offset: chunk.start_byte,
                            end_offset: chunk.end_byte,
                            size: chunk.content.len(),
                            status: crate::core::chunk::ChunkState::Pending,
                            node_kind: Some(chunk.node_kind.clone()),
                            language: chunk.language.clone(),
                            is_fallback: chunk.is_fallback,
                            start_line: chunk.start_line,
                            end_line: chunk.end_line,
                        });
                    }
                    self.chunk_mapping = mapping;
                    if let Some(state) = self.state.as_mut() {
                        state.chunks = infos;
                        state.phase = Phase::Chunking;
                        state.config.chunk_size = size;
                        state.config.chunk_overlap = 0;
                    }
                    self.save()?;
                    return Ok(paths);
                }
            }
            tracing::warn!("semantic chunking found nothing, falling back to character spans");
        }

        // Character-span fallback over the composed context.
        let content = self.get_context()?;
        let spans = chunk_spans(content.len(), size, overlap)?;
        check_chunk_count(spans.len(), size)?;

        let mut paths = Vec::with_capacity(spans.len());
        let mut infos = Vec::with_capacity(spans.len());
        let mut mapping = ChunkFileMapping::default();
        for (i, (start, end)) in spans.iter().enumerate() {
            let chunk_file = out_path.join(format!("chunk_{i:04}.txt"));
            let start_b = floor_char_boundary(&content, *start);
            let end_b = floor_char_boundary(&content, *end);
            let chunk_content = &content[start_b..end_b];
            self.safe_write(&chunk_file, chunk_content)?;
            paths.push(chunk_file.display().to_string());

            let chunk_id = compute_chunk_id("context", *start, chunk_content);
            mapping.record(
                "context",
                ChunkSpan {
                    chunk_id: chunk_id.clone(),
                    start_offset: *start,
                    end_offset: *end,
                },
            );
            infos.push(ChunkInfo::from_span(
                chunk_id,
                chunk_file.display().to_string(),
                *start,
                *end,
            ));
        }

        self.chunk_mapping = mapping;
        if let Some(state) = self.state.as_mut() {
            state.chunks = infos;
            state.phase = Phase::Chunking;
            state.config.chunk_size = size;
            state.config.chunk_overlap = overlap;
        }
        self.save()?;
        Ok(paths)
    }

    fn helper_load_file(&self, filepath: &str) -> String {
        let Some(root) = self.context_root.as_ref() else {
            return "No context loaded".to_string();
        };
        let target = root.join(filepath);
        if !target.exists() {
            return format!("File not found: {filepath}");
        }
        if !target.is_file() {
            return format!("Not a file: {filepath}");
        }
        let Ok(resolved) = target.canonicalize() else {
            return format!("Cannot access: {filepath}");
        };
        let Ok(resolved_root) = root.canonicalize() else {
            return "No context loaded".to_string();
        };
        if resolved.strip_prefix(&resolved_root).is_err() {
            return format!("Path outside context: {filepath}");
        }

        let size = fs::metadata(&target).map_or(0, |m| m.len());
        if size > MAX_SINGLE_FILE_SIZE {
            return format!(
                "File too large: {filepath} ({size} bytes, max {MAX_SINGLE_FILE_SIZE})"
            );
        }
        if let Ok(head) = crate::io::read_head(&target, 8192)
            && crate::io::looks_binary(&head)
        {
            return format!("[BINARY FILE] Cannot display binary content: {filepath}");
        }

        match crate::io::read_file_lossy(&target) {
            Ok(content) => truncate_output(&content, MAX_CONTEXT_PREVIEW),
            Err(e) => format!("Error reading file: {e}"),
        }
    }

    fn helper_preview_dir(&self, subpath: &str, max_depth: usize, max_files: usize) -> String {
        let Some(root) = self.context_root.as_ref() else {
            return "No context loaded".to_string();
        };
        let target = root.join(subpath);
        if !target.exists() {
            return format!("Path not found: {subpath}");
        }
        if !target.is_dir() {
            let size = fs::metadata(&target).map_or(0, |m| m.len());
            return format!("File: {subpath} ({size} bytes)");
        }
        if let (Ok(resolved), Ok(resolved_root)) = (target.canonicalize(), root.canonicalize())
            && resolved.strip_prefix(&resolved_root).is_err()
        {
            return format!("Path outside context: {subpath}");
        }
        generate_tree_view(
            &target,
            &TreeViewOptions {
                max_depth: Some(max_depth),
                max_entries: Some(max_files),
                should_prune: Some(Box::new(default_should_prune)),
                show_size: true,
                show_hidden: false,
            },
        )
    }

    fn helper_tree_view(&self) -> String {
        if !self.lazy_tree_view.is_empty() {
            return self.lazy_tree_view.clone();
        }
        let Some(state) = self.state.as_ref() else {
            return "No context loaded".to_string();
        };
        let Some(meta) = state.context_meta.as_ref() else {
            return "No context loaded".to_string();
        };
        let path = PathBuf::from(&meta.path);
        if path.is_dir() {
            generate_tree_view(
                &path,
                &TreeViewOptions {
                    max_depth: Some(state.config.lazy_depth),
                    max_entries: Some(state.config.lazy_file_limit),
                    should_prune: Some(Box::new(default_should_prune)),
                    show_size: true,
                    show_hidden: false,
                },
            )
        } else {
            let size = fs::metadata(&path).map_or(0, |m| m.len());
            format!(
                "{} ({size} bytes)",
                path.file_name()
                    .map_or_else(|| meta.path.clone(), |n| n.to_string_lossy().to_string())
            )
        }
    }

    fn helper_status(&self) -> serde_json::Value {
        self.state.as_ref().map_or_else(
            || json!({"status": "not_initialized"}),
            |state| {
                json!({
                    "session_id": state.session_id,
                    "phase": state.phase.as_str(),
                    "context_size": state.context_meta.as_ref().map_or(0, |m| m.total_size),
                    "total_chunks": state.chunks.len(),
                    "progress_percent": state.progress_percent,
                })
            },
        )
    }

    fn helper_add_result(&mut self, result: serde_json::Value) -> Result<()> {
        let parsed: ChunkResult = serde_json::from_value(result).map_err(|e| {
            crate::error::ChunkingError::ResultValidation {
                reason: e.to_string(),
            }
        })?;
        if let Some(state) = self.state.as_mut() {
            state.results.push(parsed);
            state.recompute_progress();
        }
        self.save()
    }

    fn helper_add_results_from_file(&mut self, file_path: &str) -> serde_json::Value {
        let path = PathBuf::from(file_path);
        if !path.exists() {
            return json!({"added": 0, "errors": [format!("File not found: {file_path}")]});
        }

        // Results may only be imported from the context or the session
        // directory.
        let allowed_roots: Vec<PathBuf> = [self.context_root.clone(), Some(self.state_dir.clone())]
            .into_iter()
            .flatten()
            .filter_map(|p| p.canonicalize().ok())
            .collect();
        let Ok(resolved) = path.canonicalize() else {
            return json!({"added": 0, "errors": ["Path validation failed"]});
        };
        if !allowed_roots
            .iter()
            .any(|root| resolved.strip_prefix(root).is_ok())
        {
            return json!({
                "added": 0,
                "errors": ["Path security: file must be within context or session directory"],
            });
        }

        let size = fs::metadata(&path).map_or(0, |m| m.len());
        if size > MAX_SINGLE_FILE_SIZE {
            return json!({
                "added": 0,
                "errors": [format!("File too large: {size} bytes (max {MAX_SINGLE_FILE_SIZE})")],
            });
        }

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                return json!({"added": 0, "errors": [format!("Cannot read file: {e}")]});
            }
        };
        let data: serde_json::Value = match serde_json::from_str(&content) {
            Ok(data) => data,
            Err(e) => return json!({"added": 0, "errors": [format!("Invalid JSON: {e}")]}),
        };

        let items = match data {
            serde_json::Value::Array(items) => items,
            single => vec![single],
        };

        let mut added = 0usize;
        let mut errors: Vec<String> = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            match self.helper_add_result(item) {
                Ok(()) => added += 1,
                Err(e) => errors.push(format!("Result {i}: {e}")),
            }
        }
        if errors.is_empty() {
            json!({"added": added, "errors": serde_json::Value::Null})
        } else {
            json!({"added": added, "errors": errors})
        }
    }
}

impl HelperDispatcher for StateManager {
    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, request: HelperRequest) -> Result<serde_json::Value> {
        match request {
            HelperRequest::Peek { start, end } => {
                Ok(json!(self.helper_peek(start, end)?))
            }
            HelperRequest::PeekHead { n } => {
                let n = i64::try_from(n.min(MAX_CONTEXT_PREVIEW)).unwrap_or(i64::MAX);
                Ok(json!(self.helper_peek(0, Some(n))?))
            }
            HelperRequest::PeekTail { n } => {
                let n = i64::try_from(n.min(MAX_CONTEXT_PREVIEW)).unwrap_or(i64::MAX);
                Ok(json!(self.helper_peek(-n, None)?))
            }
            HelperRequest::Grep {
                pattern,
                max_matches,
                window,
                timeout,
            } => {
                self.lazy_guard(
                    "grep()",
                    "Use grep_file(pattern, 'path/to/file') to search specific files, \
                     or use get_tree_view() to find files first.",
                )?;
                let content = self.get_context()?;
                let matches = safe_grep(&pattern, &content, max_matches, window, timeout)?;
                Ok(serde_json::to_value(matches)?)
            }
            HelperRequest::GrepFile {
                pattern,
                path,
                max_matches,
                window,
            } => {
                let content = self.helper_load_file(&path);
                for (marker, code) in [
                    ("[BINARY FILE]", "BINARY_FILE"),
                    ("File not found:", "FILE_NOT_FOUND"),
                    ("Not a file:", "NOT_A_FILE"),
                    ("Path outside context:", "PATH_SECURITY"),
                    ("File too large:", "FILE_TOO_LARGE"),
                    ("Error reading file:", "READ_ERROR"),
                    ("No context loaded", "NO_CONTEXT"),
                ] {
                    if content.starts_with(marker) {
                        return Ok(json!([{"error": code, "message": content}]));
                    }
                }
                let matches = safe_grep(
                    &pattern,
                    &content,
                    max_matches,
                    window,
                    crate::core::constants::GREP_TIMEOUT,
                )?;
                Ok(serde_json::to_value(matches)?)
            }
            HelperRequest::ChunkIndices { size, overlap } => {
                self.lazy_guard(
                    "chunk_indices()",
                    "Use targeted mode (--target) or full initialisation to enable chunking.",
                )?;
                let content = self.get_context()?;
                let spans = chunk_spans(content.len(), size, overlap)?;
                Ok(serde_json::to_value(spans)?)
            }
            HelperRequest::WriteChunks {
                out_dir,
                size,
                overlap,
                semantic,
            } => {
                let paths =
                    self.helper_write_chunks(out_dir.as_deref(), size, overlap, semantic)?;
                Ok(json!(paths))
            }
            HelperRequest::AddBuffer { text } => {
                if let Some(state) = self.state.as_mut() {
                    state.buffers.push(text);
                }
                self.save()?;
                Ok(serde_json::Value::Null)
            }
            HelperRequest::GetBuffers => {
                let buffers = self
                    .state
                    .as_ref()
                    .map(|s| s.buffers.clone())
                    .unwrap_or_default();
                Ok(json!(buffers))
            }
            HelperRequest::ClearBuffers => {
                if let Some(state) = self.state.as_mut() {
                    state.buffers.clear();
                }
                self.save()?;
                Ok(serde_json::Value::Null)
            }
            HelperRequest::AddResult { result } => {
                self.helper_add_result(result)?;
                Ok(serde_json::Value::Null)
            }
            HelperRequest::AddResultsFromFile { path } => {
                Ok(self.helper_add_results_from_file(&path))
            }
            HelperRequest::SetPhase { phase } => {
                let parsed = Phase::parse(&phase).ok_or_else(|| {
                    crate::error::ChunkingError::ResultValidation {
                        reason: format!("unknown phase: {phase}"),
                    }
                })?;
                if let Some(state) = self.state.as_mut() {
                    state.phase = parsed;
                }
                self.save()?;
                Ok(serde_json::Value::Null)
            }
            HelperRequest::SetFinalAnswer { answer } => {
                if let Some(state) = self.state.as_mut() {
                    state.set_final_answer(answer);
                }
                self.save()?;
                Ok(serde_json::Value::Null)
            }
            HelperRequest::GetStatus => Ok(self.helper_status()),
            HelperRequest::ContextLength => {
                let content = self.get_context()?;
                Ok(json!(content.len()))
            }
            HelperRequest::IsLazyMode => Ok(json!(self.is_lazy_mode())),
            HelperRequest::GetTreeView => Ok(json!(self.helper_tree_view())),
            HelperRequest::PreviewDir {
                subpath,
                max_depth,
                max_files,
            } => Ok(json!(self.helper_preview_dir(&subpath, max_depth, max_files))),
            HelperRequest::LoadFile { path } => Ok(json!(self.helper_load_file(&path))),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn append_file(
    file: &Path,
    context_path: &Path,
    parts: &mut Vec<String>,
    seen: &mut BTreeSet<PathBuf>,
    total_size: &mut usize,
    file_count: &mut usize,
    extensions: &mut Vec<String>,
    warn_on_oversize: bool,
) -> bool {
    if seen.contains(file) {
        return true;
    }
    seen.insert(file.to_path_buf());

    let size = fs::metadata(file).map_or(0, |m| m.len());
    if size > MAX_SINGLE_FILE_SIZE {
        if warn_on_oversize {
            tracing::warn!(path = %file.display(), size, "skipping targeted file (too large)");
        }
        return true;
    }

    let Ok(content) = crate::io::read_file_lossy(file) else {
        return true;
    };

    let rel = file
        .strip_prefix(context_path)
        .map_or_else(|_| file.display().to_string(), |r| r.display().to_string());
    // Header and footer bytes count against the total-size cap the same
    // way in every mode.
    let header = format!("=== FILE: {rel} ===\n");
    let footer = "\n\n";
    let entry_size = header.len() + content.len() + footer.len();
    if *total_size + entry_size > MAX_TOTAL_CONTEXT_SIZE {
        return false;
    }

    *total_size += entry_size;
    parts.push(header);
    parts.push(content);
    parts.push(footer.to_string());
    *file_count += 1;
    if let Some(ext) = file.extension() {
        extensions.push(format!(".{}", ext.to_string_lossy().to_lowercase()));
    }
    true
}

fn check_chunk_count(count: usize, size: usize) -> Result<()> {
    if count > MAX_ABSOLUTE_CHUNKS {
        return Err(crate::error::ChunkingError::TooManyChunks {
            count,
            limit: MAX_ABSOLUTE_CHUNKS,
        }
        .into());
    }
    if count > MAX_RECOMMENDED_CHUNKS {
        tracing::warn!(
            count,
            size,
            "high chunk count; consider --lazy, --target, or a larger chunk size"
        );
    }
    Ok(())
}

fn floor_char_boundary(s: &str, mut pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

// -- cross-invocation session discovery ---------------------------------

/// Reads the current-session marker.
#[must_use]
pub fn current_session_hash(cache_root: &Path) -> Option<String> {
    let content = fs::read_to_string(cache_root.join(CURRENT_SESSION_MARKER)).ok()?;
    let hash = content.trim().to_string();
    validate_session_hash(&hash).then_some(hash)
}

/// Sets the current-session marker atomically (temp file then rename).
///
/// # Errors
///
/// Propagates I/O failures.
pub fn set_current_session_hash(cache_root: &Path, session_hash: &str) -> Result<()> {
    fs::create_dir_all(cache_root).map_err(|e| StateError::CacheDir {
        path: cache_root.display().to_string(),
        reason: e.to_string(),
    })?;
    let marker = cache_root.join(CURRENT_SESSION_MARKER);
    let tmp = tempfile::NamedTempFile::new_in(cache_root).map_err(|e| StateError::Io {
        path: cache_root.display().to_string(),
        reason: e.to_string(),
    })?;
    fs::write(tmp.path(), session_hash).map_err(|e| StateError::Io {
        path: tmp.path().display().to_string(),
        reason: e.to_string(),
    })?;
    tmp.persist(&marker).map_err(|e| StateError::Io {
        path: marker.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn clear_current_session_if(cache_root: &Path, session_hash: &str) {
    if current_session_hash(cache_root).as_deref() == Some(session_hash) {
        let _ = fs::remove_file(cache_root.join(CURRENT_SESSION_MARKER));
    }
}

/// Lists all sessions under the cache root, newest first.
#[must_use]
pub fn list_sessions(cache_root: &Path) -> Vec<SessionSummary> {
    let Ok(entries) = fs::read_dir(cache_root) else {
        return Vec::new();
    };

    let mut sessions: Vec<SessionSummary> = Vec::new();
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let state_file = path.join(STATE_FILE);
        let Ok(content) = fs::read_to_string(&state_file) else {
            continue;
        };
        let Ok(state) = serde_json::from_str::<ScanState>(&content) else {
            continue;
        };
        let modified = fs::metadata(&state_file)
            .and_then(|m| m.modified())
            .map(|t| chrono::DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);

        sessions.push(SessionSummary {
            hash: entry.file_name().to_string_lossy().to_string(),
            phase: state.phase.as_str().to_string(),
            progress: state.progress_percent,
            context_size: state.context_meta.as_ref().map_or(0, |m| m.total_size),
            chunks: state.chunks.len(),
            results: state.results.len(),
            modified,
        });
    }

    sessions.sort_by_key(|s| std::cmp::Reverse(s.modified));
    sessions
}

/// Removes sessions older than the TTL, then evicts least-recently-used
/// sessions until the cache fits the size budget.
#[must_use]
pub fn gc_clean_sessions(cache_root: &Path, max_age_days: u64, max_total_bytes: u64) -> GcOutcome {
    let Ok(entries) = fs::read_dir(cache_root) else {
        return GcOutcome {
            deleted: 0,
            freed_bytes: 0,
        };
    };

    struct SessionDisk {
        path: PathBuf,
        modified: i64,
        size: u64,
    }

    let now = Utc::now().timestamp();
    let max_age_secs = i64::try_from(max_age_days * 24 * 3600).unwrap_or(i64::MAX);

    let mut sessions: Vec<SessionDisk> = Vec::new();
    for entry in entries.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if !path.is_dir() || !path.join(STATE_FILE).exists() {
            continue;
        }
        let modified = fs::metadata(path.join(STATE_FILE))
            .and_then(|m| m.modified())
            .map(|t| chrono::DateTime::<Utc>::from(t).timestamp())
            .unwrap_or(0);
        let size = dir_size(&path);
        sessions.push(SessionDisk {
            path,
            modified,
            size,
        });
    }

    // Oldest first for LRU eviction.
    sessions.sort_by_key(|s| s.modified);
    let mut total_size: u64 = sessions.iter().map(|s| s.size).sum();

    let mut deleted = 0usize;
    let mut freed_bytes = 0u64;
    for session in &sessions {
        let too_old = now - session.modified > max_age_secs;
        let over_budget = total_size > max_total_bytes;
        if !(too_old || over_budget) {
            continue;
        }
        if fs::remove_dir_all(&session.path).is_ok() {
            deleted += 1;
            freed_bytes += session.size;
            total_size = total_size.saturating_sub(session.size);
        }
    }

    GcOutcome {
        deleted,
        freed_bytes,
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
