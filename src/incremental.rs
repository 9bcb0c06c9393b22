//! Incremental re-analysis support.
//!
//! Tracks content-addressed file digests across sessions so only changed
//! files are re-processed. Symlinks are skipped, paths are stored
//! relative to the context root with forward slashes, and session hashes
//! are validated before any filesystem access.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::core::session::validate_session_hash;
use crate::error::{Result, StateError};
use crate::walker::default_should_prune;

/// File name of the manifest inside a session directory.
pub const MANIFEST_FILE: &str = "file_hashes.json";

/// Supported digest algorithms.
///
/// xxHash3 is roughly an order of magnitude faster than SHA-256 and is
/// the default; SHA-256 remains available where cryptographic strength
/// is wanted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Fast 64-bit xxHash3.
    #[default]
    Xxh3,
    /// Cryptographic SHA-256 fallback.
    Sha256,
}

impl HashAlgorithm {
    /// Label stored in the manifest.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Xxh3 => "xxh3",
            Self::Sha256 => "sha256",
        }
    }
}

/// Computes the digest of a file's contents.
///
/// # Errors
///
/// Returns [`StateError::Io`] if the file cannot be read.
pub fn compute_file_hash(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    Ok(match algorithm {
        HashAlgorithm::Xxh3 => format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&bytes)),
        HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(&bytes)),
    })
}

/// Normalises a path for manifest keys: forward slashes only.
#[must_use]
pub fn normalize_manifest_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Delta between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDelta {
    /// Present in both manifests with differing digests.
    #[serde(default)]
    pub changed_files: Vec<String>,
    /// Present only in the current manifest.
    #[serde(default)]
    pub added_files: Vec<String>,
    /// Present only in the previous manifest.
    #[serde(default)]
    pub deleted_files: Vec<String>,
}

impl FileDelta {
    /// Total count of files needing re-analysis.
    #[must_use]
    pub fn reanalysis_count(&self) -> usize {
        self.changed_files.len() + self.added_files.len()
    }

    /// Whether nothing changed between the manifests.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed_files.is_empty()
            && self.added_files.is_empty()
            && self.deleted_files.is_empty()
    }
}

/// Mapping from relative paths to content digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashManifest {
    /// Digest algorithm used for every entry.
    pub algorithm: HashAlgorithm,
    /// When the manifest was computed.
    pub created_at: DateTime<Utc>,
    /// Relative path (forward slashes) to digest.
    pub file_hashes: BTreeMap<String, String>,
}

impl FileHashManifest {
    /// Computes a manifest over a directory tree.
    ///
    /// Skips symlinks, the default prune directories, and any path the
    /// extra predicate rejects. Unreadable files are skipped with a
    /// debug log rather than failing the whole manifest.
    #[must_use]
    pub fn from_directory(
        root: &Path,
        algorithm: HashAlgorithm,
        extra_ignore: Option<&dyn Fn(&Path) -> bool>,
    ) -> Self {
        let mut file_hashes = BTreeMap::new();

        let entries = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !default_should_prune(e.path()));

        for entry in entries.filter_map(std::result::Result::ok) {
            let path = entry.path();
            if !entry.file_type().is_file() || entry.path_is_symlink() {
                continue;
            }
            if extra_ignore.is_some_and(|ignore| ignore(path)) {
                continue;
            }

            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            match compute_file_hash(path, algorithm) {
                Ok(digest) => {
                    file_hashes.insert(normalize_manifest_path(rel), digest);
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "hash failed, skipping");
                }
            }
        }

        Self {
            algorithm,
            created_at: Utc::now(),
            file_hashes,
        }
    }

    /// Computes the delta from a previous manifest to this one.
    #[must_use]
    pub fn compare_with(&self, previous: &Self) -> FileDelta {
        let mut delta = FileDelta::default();

        for (path, digest) in &self.file_hashes {
            match previous.file_hashes.get(path) {
                Some(prev_digest) if prev_digest != digest => {
                    delta.changed_files.push(path.clone());
                }
                Some(_) => {}
                None => delta.added_files.push(path.clone()),
            }
        }
        for path in previous.file_hashes.keys() {
            if !self.file_hashes.contains_key(path) {
                delta.deleted_files.push(path.clone());
            }
        }

        delta
    }
}

/// Spans of a file covered by chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    /// Chunk identifier.
    pub chunk_id: String,
    /// Start offset of the file's bytes inside the chunk source.
    pub start_offset: usize,
    /// End offset (exclusive).
    pub end_offset: usize,
}

/// Mapping from relative file paths to the chunks that contain them.
///
/// Used after a delta to decide which chunks must be re-analysed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFileMapping {
    /// Relative path to covering chunk spans.
    pub mapping: BTreeMap<String, Vec<ChunkSpan>>,
}

impl ChunkFileMapping {
    /// Records that a chunk covers a span of a file.
    pub fn record(&mut self, rel_path: &str, span: ChunkSpan) {
        self.mapping
            .entry(rel_path.replace('\\', "/"))
            .or_default()
            .push(span);
    }

    /// Chunk ids that must be re-analysed for the given changed paths.
    #[must_use]
    pub fn chunks_for_paths<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for path in paths {
            if let Some(spans) = self.mapping.get(&path.replace('\\', "/")) {
                for span in spans {
                    ids.insert(span.chunk_id.clone());
                }
            }
        }
        ids
    }
}

/// Manifest persistence for a session.
pub struct IncrementalAnalyzer {
    manifest_file: PathBuf,
}

impl IncrementalAnalyzer {
    /// Creates an analyzer for a session under the cache root.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidSessionHash`] for hashes failing the
    /// grammar and [`StateError::PathTraversal`] when the session
    /// directory resolves outside the cache root.
    pub fn new(session_hash: &str, cache_root: &Path) -> Result<Self> {
        if !validate_session_hash(session_hash) {
            return Err(StateError::InvalidSessionHash {
                hash: session_hash.to_string(),
            }
            .into());
        }

        let session_dir = cache_root.join(session_hash);
        if let (Ok(resolved), Ok(root)) = (session_dir.canonicalize(), cache_root.canonicalize())
            && resolved.strip_prefix(&root).is_err()
        {
            return Err(StateError::PathTraversal {
                path: session_dir.display().to_string(),
            }
            .into());
        }

        Ok(Self {
            manifest_file: session_dir.join(MANIFEST_FILE),
        })
    }

    /// Saves a manifest into the session directory.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] on write failure.
    pub fn save_manifest(&self, manifest: &FileHashManifest) -> Result<()> {
        if let Some(parent) = self.manifest_file.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::CacheDir {
                path: parent.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        let json = serde_json::to_string_pretty(manifest)?;
        fs::write(&self.manifest_file, json).map_err(|e| StateError::Io {
            path: self.manifest_file.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    /// Loads the manifest saved for this session, if one exists.
    #[must_use]
    pub fn load_manifest(&self) -> Option<FileHashManifest> {
        let content = fs::read_to_string(&self.manifest_file).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(error = %e, "manifest unreadable, ignoring");
                None
            }
        }
    }
}
