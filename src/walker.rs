//! Iterator-based directory tree walker.
//!
//! Yields entries lazily with pruning, depth and entry limits, and never
//! follows symbolic links (a symlink to a directory is a leaf). A
//! companion renderer produces an ASCII tree view with a summary footer.
//!
//! Ordering within a directory: directories first, then files, both
//! case-insensitively lexicographic. The prune predicate runs before
//! sorting so skipped subtrees cost nothing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::core::constants::DEFAULT_TREE_VIEW_LIMIT;

/// Tree-drawing connectors.
const TREE_BRANCH: &str = "├── ";
const TREE_LAST: &str = "└── ";
const TREE_VERTICAL: &str = "│   ";
const TREE_EMPTY: &str = "    ";

/// Directories pruned by default (unioned with user ignore rules).
pub const DEFAULT_PRUNE_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    ".svn",
    ".hg",
    "__pycache__",
    ".venv",
    "venv",
    ".env",
    "env",
    ".tox",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "target",
    "vendor",
];

/// Default pruning predicate: skips common large directories.
#[must_use]
pub fn default_should_prune(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| DEFAULT_PRUNE_DIRS.contains(&name))
}

/// An entry yielded by [`TreeWalker`].
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Absolute path of the entry.
    pub path: PathBuf,
    /// Base name.
    pub name: String,
    /// Whether this entry is a directory (symlinks never count).
    pub is_dir: bool,
    /// File size in bytes (0 for directories).
    pub size: u64,
    /// Last modification time in UTC.
    pub mtime: DateTime<Utc>,
    /// Depth relative to the start path (0 = direct child).
    pub depth: usize,
}

/// Boxed prune predicate: returns `true` to skip an entry entirely.
pub type PrunePredicate<'a> = Box<dyn Fn(&Path) -> bool + 'a>;

/// Lazy depth-first directory walker.
///
/// Directories are yielded before their contents. Permission and other OS
/// errors on a subtree are logged at debug level and the subtree is
/// skipped; they never abort the walk. The entry limit counts both files
/// and directories, and reaching it ends iteration cleanly.
pub struct TreeWalker<'a> {
    start_path: PathBuf,
    started: bool,
    stack: Vec<std::vec::IntoIter<FileEntry>>,
    max_depth: Option<usize>,
    max_entries: Option<usize>,
    prune: Option<PrunePredicate<'a>>,
    yielded: usize,
}

impl<'a> TreeWalker<'a> {
    /// Creates a walker rooted at `start_path`. The root directory is
    /// not read until the first `next()` call, so builder options apply
    /// to every level including the top.
    #[must_use]
    pub fn new(start_path: &Path) -> Self {
        Self {
            start_path: start_path.to_path_buf(),
            started: false,
            stack: Vec::new(),
            max_depth: None,
            max_entries: None,
            prune: None,
            yielded: 0,
        }
    }

    /// Limits traversal depth (0 = only direct children).
    #[must_use]
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Limits the number of yielded entries (files and directories both
    /// count).
    #[must_use]
    pub fn max_entries(mut self, limit: usize) -> Self {
        self.max_entries = Some(limit);
        self
    }

    /// Sets the prune predicate. Pruned entries are dropped before
    /// sorting and pruned directories are never entered.
    #[must_use]
    pub fn prune(mut self, predicate: impl Fn(&Path) -> bool + 'a) -> Self {
        self.prune = Some(Box::new(predicate));
        self
    }

    /// Reads one directory level: prune, then sort (dirs first,
    /// case-insensitive name order).
    fn read_sorted(&self, dir: &Path, depth: usize) -> Vec<FileEntry> {
        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "skipping unreadable directory");
                return Vec::new();
            }
        };

        let mut entries: Vec<FileEntry> = Vec::new();
        for entry in read {
            let Ok(entry) = entry else { continue };
            let path = entry.path();

            if self.prune.as_ref().is_some_and(|p| p(&path)) {
                continue;
            }

            // symlink_metadata never follows links, so a symlinked
            // directory reports as a non-directory leaf here.
            let Ok(meta) = fs::symlink_metadata(&path) else {
                tracing::debug!(path = %path.display(), "stat failed, skipping entry");
                continue;
            };
            let is_dir = meta.is_dir();
            let size = if is_dir { 0 } else { meta.len() };
            let mtime = meta
                .modified()
                .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path,
                is_dir,
                size,
                mtime,
                depth,
            });
        }

        entries.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        entries
    }
}

impl Iterator for TreeWalker<'_> {
    type Item = FileEntry;

    fn next(&mut self) -> Option<FileEntry> {
        if !self.started {
            self.started = true;
            let first = self.read_sorted(&self.start_path.clone(), 0);
            self.stack.push(first.into_iter());
        }

        if self
            .max_entries
            .is_some_and(|limit| self.yielded >= limit)
        {
            return None;
        }

        loop {
            let frame = self.stack.last_mut()?;
            let Some(entry) = frame.next() else {
                self.stack.pop();
                continue;
            };

            if entry.is_dir
                && self.max_depth.is_none_or(|max| entry.depth < max)
            {
                let children = self.read_sorted(&entry.path, entry.depth + 1);
                self.stack.push(children.into_iter());
            }

            self.yielded += 1;
            return Some(entry);
        }
    }
}

/// Formats a byte count as a short human-readable string.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_size(size_bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;

    if size_bytes < KIB {
        format!("{size_bytes}B")
    } else if size_bytes < MIB {
        format!("{:.1}KB", size_bytes as f64 / KIB as f64)
    } else if size_bytes < GIB {
        format!("{:.1}MB", size_bytes as f64 / MIB as f64)
    } else {
        format!("{:.1}GB", size_bytes as f64 / GIB as f64)
    }
}

/// Options for [`generate_tree_view`].
#[derive(Default)]
pub struct TreeViewOptions<'a> {
    /// Maximum traversal depth.
    pub max_depth: Option<usize>,
    /// Maximum entries (capped at [`DEFAULT_TREE_VIEW_LIMIT`]).
    pub max_entries: Option<usize>,
    /// Additional pruning predicate.
    pub should_prune: Option<PrunePredicate<'a>>,
    /// Append file sizes to entries.
    pub show_size: bool,
    /// Include dotfiles.
    pub show_hidden: bool,
}

/// Renders an ASCII tree view of a directory.
///
/// Applies a hard safety cap of [`DEFAULT_TREE_VIEW_LIMIT`] entries and
/// appends a summary line with file count and total size.
#[must_use]
pub fn generate_tree_view(start_path: &Path, options: &TreeViewOptions<'_>) -> String {
    let effective_limit = options
        .max_entries
        .map_or(DEFAULT_TREE_VIEW_LIMIT, |m| m.min(DEFAULT_TREE_VIEW_LIMIT));

    let show_hidden = options.show_hidden;
    let user_prune = options.should_prune.as_ref();
    let combined_prune = |path: &Path| -> bool {
        if !show_hidden
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
        {
            return true;
        }
        user_prune.is_some_and(|p| p(path))
    };

    let mut walker = TreeWalker::new(start_path)
        .max_entries(effective_limit)
        .prune(combined_prune);
    if let Some(depth) = options.max_depth {
        walker = walker.max_depth(depth);
    }
    let entries: Vec<FileEntry> = walker.collect();
    let truncated = entries.len() >= effective_limit;

    let root_name = start_path
        .file_name()
        .map_or_else(|| start_path.display().to_string(), |n| n.to_string_lossy().to_string());
    let mut lines = vec![format!("{root_name}/")];

    // Group children by parent so each entry knows whether it is the
    // last sibling at its level.
    let mut parent_children: HashMap<PathBuf, Vec<&FileEntry>> = HashMap::new();
    for entry in &entries {
        if let Some(parent) = entry.path.parent() {
            parent_children
                .entry(parent.to_path_buf())
                .or_default()
                .push(entry);
        }
    }

    let mut depth_last: HashMap<usize, bool> = HashMap::new();
    let mut file_count = 0usize;
    let mut total_size = 0u64;

    for entry in &entries {
        let siblings = entry
            .path
            .parent()
            .and_then(|p| parent_children.get(p));
        let is_last = siblings
            .and_then(|s| s.last())
            .is_some_and(|last| std::ptr::eq(*last, entry));
        depth_last.insert(entry.depth, is_last);

        let mut prefix = String::new();
        for d in 0..entry.depth {
            if depth_last.get(&d).copied().unwrap_or(false) {
                prefix.push_str(TREE_EMPTY);
            } else {
                prefix.push_str(TREE_VERTICAL);
            }
        }
        prefix.push_str(if is_last { TREE_LAST } else { TREE_BRANCH });

        if entry.is_dir {
            lines.push(format!("{prefix}{}/", entry.name));
        } else {
            file_count += 1;
            total_size += entry.size;
            if options.show_size {
                lines.push(format!("{prefix}{} ({})", entry.name, format_size(entry.size)));
            } else {
                lines.push(format!("{prefix}{}", entry.name));
            }
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "Stats: {file_count} files, {} total",
        format_size(total_size)
    ));
    if let Some(depth) = options.max_depth {
        lines.push(format!("   Max depth: {depth}"));
    }
    if truncated {
        lines.push(format!("   Truncated at {effective_limit} entries"));
    }

    lines.join("\n")
}
