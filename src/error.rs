//! Error types for DeepScan operations.
//!
//! Every error in the crate carries a stable code (`DS-NNN`), a category
//! that determines the process exit code, and an optional remediation
//! template rendered below the error message. The hierarchy uses
//! `thiserror` sub-enums per subsystem, rolled up into [`Error`].

use thiserror::Error;

/// Result type alias for DeepScan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error code categories.
///
/// The category determines the process exit code. User cancellation is
/// the single exception: it always maps to 130 regardless of category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Input validation failures (bad paths, hashes, sizes).
    Validation,
    /// Parse failures (syntax trees, JSON, checkpoints, responses).
    Parsing,
    /// Chunking and aggregation failures.
    Chunking,
    /// Resource failures (missing files, size caps, cache directory).
    Resource,
    /// Configuration failures.
    Config,
    /// System and internal failures.
    System,
}

impl ErrorCategory {
    /// Process exit code for this category.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Validation => 2,
            Self::Parsing => 3,
            Self::Chunking => 4,
            Self::Resource => 5,
            Self::Config => 6,
            Self::System => 1,
        }
    }

    /// Category name used in verbose output and JSON serialisation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Parsing => "parsing",
            Self::Chunking => "chunking",
            Self::Resource => "resource",
            Self::Config => "config",
            Self::System => "system",
        }
    }
}

/// Stable error codes.
///
/// Display form is `DS-NNN`. Code ranges mirror the categories:
/// 0xx validation, 1xx parsing, 2xx chunking, 3xx resource, 4xx config,
/// 5xx system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ErrorCode {
    InvalidContextPath,
    InvalidSessionHash,
    MissingQuery,
    InvalidChunkSize,
    OverlapExceedsSize,
    EmptyContext,
    LazyModeRequired,
    AstParseFailed,
    JsonDecodeError,
    EncodingError,
    SubagentParseFailed,
    CheckpointCorrupt,
    ChunkTooLarge,
    NoChunksCreated,
    AggregationConflict,
    ResultValidationFailed,
    BatchFailed,
    ChunkCountExceeded,
    FileNotFound,
    PermissionDenied,
    FileTooLarge,
    ContextTooLarge,
    CacheDirError,
    SessionNotFound,
    InvalidConfigFile,
    MissingRequiredSetting,
    InvalidModelSetting,
    EscalationBudgetExceeded,
    InternalError,
    StateCorruption,
    TimeoutError,
    RateLimitError,
    CancelledByUser,
    SandboxRejected,
}

impl ErrorCode {
    /// Numeric error code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::InvalidContextPath => 1,
            Self::InvalidSessionHash => 2,
            Self::MissingQuery => 3,
            Self::InvalidChunkSize => 4,
            Self::OverlapExceedsSize => 5,
            Self::EmptyContext => 6,
            Self::LazyModeRequired => 7,
            Self::AstParseFailed => 101,
            Self::JsonDecodeError => 102,
            Self::EncodingError => 103,
            Self::SubagentParseFailed => 104,
            Self::CheckpointCorrupt => 105,
            Self::ChunkTooLarge => 201,
            Self::NoChunksCreated => 202,
            Self::AggregationConflict => 203,
            Self::ResultValidationFailed => 204,
            Self::BatchFailed => 205,
            Self::ChunkCountExceeded => 206,
            Self::FileNotFound => 301,
            Self::PermissionDenied => 302,
            Self::FileTooLarge => 303,
            Self::ContextTooLarge => 304,
            Self::CacheDirError => 305,
            Self::SessionNotFound => 306,
            Self::InvalidConfigFile => 401,
            Self::MissingRequiredSetting => 402,
            Self::InvalidModelSetting => 403,
            Self::EscalationBudgetExceeded => 404,
            Self::InternalError => 501,
            Self::StateCorruption => 502,
            Self::TimeoutError => 503,
            Self::RateLimitError => 504,
            Self::CancelledByUser => 505,
            Self::SandboxRejected => 506,
        }
    }

    /// Formatted code string (`DS-NNN`).
    #[must_use]
    pub fn code_str(self) -> String {
        format!("DS-{:03}", self.code())
    }

    /// Human-readable title.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::InvalidContextPath => "Invalid Context Path",
            Self::InvalidSessionHash => "Invalid Session Hash",
            Self::MissingQuery => "Missing Query",
            Self::InvalidChunkSize => "Invalid Chunk Size",
            Self::OverlapExceedsSize => "Overlap Exceeds Size",
            Self::EmptyContext => "Empty Context",
            Self::LazyModeRequired => "Lazy Mode Required",
            Self::AstParseFailed => "AST Parse Failed",
            Self::JsonDecodeError => "JSON Decode Error",
            Self::EncodingError => "Encoding Error",
            Self::SubagentParseFailed => "Sub-agent Parse Failed",
            Self::CheckpointCorrupt => "Checkpoint Corrupt",
            Self::ChunkTooLarge => "Chunk Too Large",
            Self::NoChunksCreated => "No Chunks Created",
            Self::AggregationConflict => "Aggregation Conflict",
            Self::ResultValidationFailed => "Result Validation Failed",
            Self::BatchFailed => "Batch Failed",
            Self::ChunkCountExceeded => "Chunk Count Exceeded",
            Self::FileNotFound => "File Not Found",
            Self::PermissionDenied => "Permission Denied",
            Self::FileTooLarge => "File Too Large",
            Self::ContextTooLarge => "Context Too Large",
            Self::CacheDirError => "Cache Directory Error",
            Self::SessionNotFound => "Session Not Found",
            Self::InvalidConfigFile => "Invalid Config File",
            Self::MissingRequiredSetting => "Missing Required Setting",
            Self::InvalidModelSetting => "Invalid Model Setting",
            Self::EscalationBudgetExceeded => "Escalation Budget Exceeded",
            Self::InternalError => "Internal Error",
            Self::StateCorruption => "State Corruption",
            Self::TimeoutError => "Timeout Error",
            Self::RateLimitError => "Rate Limit Error",
            Self::CancelledByUser => "Cancelled By User",
            Self::SandboxRejected => "Sandbox Rejected",
        }
    }

    /// Error category (drives the exit code).
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self.code() {
            1..=99 => ErrorCategory::Validation,
            101..=199 => ErrorCategory::Parsing,
            201..=299 => ErrorCategory::Chunking,
            301..=399 => ErrorCategory::Resource,
            401..=499 => ErrorCategory::Config,
            _ => ErrorCategory::System,
        }
    }

    /// Documentation URL for this code.
    #[must_use]
    pub fn doc_url(self) -> String {
        format!("https://deepscan.io/docs/errors/{}", self.code_str())
    }

    /// Remediation template, if one exists.
    ///
    /// Placeholders `{file_path}`, `{session_id}`, `{chunk_id}`,
    /// `{expected}` and `{actual}` are filled from the error context.
    #[must_use]
    pub const fn remediation(self) -> Option<&'static str> {
        match self {
            Self::InvalidContextPath => {
                Some("Verify the path exists and is readable: {file_path}")
            }
            Self::InvalidSessionHash => Some(
                "Session hashes may only contain letters, digits, '-' and '_'. \
                 Run `deepscan-rs list` to see valid sessions.",
            ),
            Self::MissingQuery => {
                Some("Provide a query with `-q \"your question\"` at init time.")
            }
            Self::InvalidChunkSize => {
                Some("Chunk size must be between 50000 and 300000 characters.")
            }
            Self::OverlapExceedsSize => {
                Some("Reduce the overlap below the chunk size (max 50000).")
            }
            Self::LazyModeRequired => Some(
                "This operation needs loaded content. Re-initialise without \
                 --lazy, or use targeted mode (--target PATH).",
            ),
            Self::CheckpointCorrupt => Some(
                "Delete the checkpoint and restart the phase: the session \
                 state itself is unaffected.",
            ),
            Self::NoChunksCreated => Some(
                "Run the chunking step before map: `deepscan-rs exec -c \
                 \"write_chunks()\"`.",
            ),
            Self::ChunkCountExceeded => Some(
                "Use --lazy or --target to reduce scope, or increase the \
                 chunk size (current limit produces too many chunks).",
            ),
            Self::BatchFailed => Some(
                "Retry with sequential processing, or reduce scope with \
                 --target.",
            ),
            Self::ContextTooLarge => Some(
                "Use --lazy mode for structure-only analysis, or --target to \
                 narrow the context.",
            ),
            Self::SessionNotFound => Some(
                "Run `deepscan-rs list` for available sessions, or \
                 `deepscan-rs init <path>` to start a new one.",
            ),
            Self::EscalationBudgetExceeded => Some(
                "Raise the budget limits in the configuration, or accept the \
                 failed chunks and re-run reduce.",
            ),
            Self::CancelledByUser => {
                Some("Resume with: deepscan-rs resume {session_id}")
            }
            _ => None,
        }
    }
}

/// Context attached to errors for remediation rendering and debugging.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// File involved, if any.
    pub file_path: Option<String>,
    /// Chunk involved, if any.
    pub chunk_id: Option<String>,
    /// Session involved, if any.
    pub session_id: Option<String>,
    /// What was expected.
    pub expected: Option<String>,
    /// What was observed.
    pub actual: Option<String>,
}

impl ErrorContext {
    /// Context carrying only a file path.
    #[must_use]
    pub fn for_file(path: impl Into<String>) -> Self {
        Self {
            file_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Context carrying only a session id.
    #[must_use]
    pub fn for_session(session: impl Into<String>) -> Self {
        Self {
            session_id: Some(session.into()),
            ..Self::default()
        }
    }

    fn fill(&self, template: &str) -> String {
        let mut out = template.to_string();
        let pairs = [
            ("{file_path}", self.file_path.as_deref()),
            ("{chunk_id}", self.chunk_id.as_deref()),
            ("{session_id}", self.session_id.as_deref()),
            ("{expected}", self.expected.as_deref()),
            ("{actual}", self.actual.as_deref()),
        ];
        for (placeholder, value) in pairs {
            if out.contains(placeholder) {
                out = out.replace(placeholder, value.unwrap_or("<unknown>"));
            }
        }
        out
    }
}

/// How a cancellation was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// First interrupt: finish the current unit of work and flush state.
    Graceful,
    /// Second interrupt or watchdog expiry: terminate immediately.
    Forced,
}

/// State and session management errors.
#[derive(Error, Debug)]
pub enum StateError {
    /// Context path does not exist.
    #[error("context path not found: {path}")]
    ContextPathNotFound {
        /// Path that was not found.
        path: String,
    },

    /// Session hash failed grammar validation.
    #[error("invalid session hash: {hash:?}")]
    InvalidSessionHash {
        /// Offending hash.
        hash: String,
    },

    /// Resolved path escapes the cache root.
    #[error("path traversal denied: {path}")]
    PathTraversal {
        /// Path that was denied.
        path: String,
    },

    /// A single file exceeds the per-file size cap.
    #[error("file too large: {path} ({size} bytes, max {limit})")]
    FileTooLarge {
        /// Offending file.
        path: String,
        /// Observed size.
        size: u64,
        /// Maximum allowed size.
        limit: u64,
    },

    /// The composed context exceeds the total size cap.
    #[error("total context too large: {size} bytes (max {limit})")]
    ContextTooLarge {
        /// Observed size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// No session exists for the given hash.
    #[error("session not found: {hash}")]
    SessionNotFound {
        /// Requested session hash.
        hash: String,
    },

    /// No state file present; session was never initialised.
    #[error("no state found for session {hash}; run: deepscan-rs init <path>")]
    NotInitialized {
        /// Session hash.
        hash: String,
    },

    /// The context loaded to zero bytes.
    #[error("context is empty")]
    EmptyContext,

    /// Operation requires loaded content but the session is in lazy mode.
    #[error("{operation} requires loaded context (lazy mode active). {recovery_hint}")]
    LazyModeRequired {
        /// Operation that was refused.
        operation: String,
        /// How to recover.
        recovery_hint: String,
    },

    /// Cache directory could not be created or resolved.
    #[error("cache directory error: {path}: {reason}")]
    CacheDir {
        /// Directory path.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// Generic I/O failure during a state operation.
    #[error("I/O error on {path}: {reason}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying reason.
        reason: String,
    },
}

impl StateError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ContextPathNotFound { .. } => ErrorCode::InvalidContextPath,
            Self::InvalidSessionHash { .. } | Self::PathTraversal { .. } => {
                ErrorCode::InvalidSessionHash
            }
            Self::FileTooLarge { .. } => ErrorCode::FileTooLarge,
            Self::ContextTooLarge { .. } => ErrorCode::ContextTooLarge,
            Self::SessionNotFound { .. } | Self::NotInitialized { .. } => {
                ErrorCode::SessionNotFound
            }
            Self::EmptyContext => ErrorCode::EmptyContext,
            Self::LazyModeRequired { .. } => ErrorCode::LazyModeRequired,
            Self::CacheDir { .. } => ErrorCode::CacheDirError,
            Self::Io { .. } => ErrorCode::PermissionDenied,
        }
    }
}

/// Chunking and aggregation errors.
#[derive(Error, Debug)]
pub enum ChunkingError {
    /// Chunk size outside the 50 000–300 000 range.
    #[error("chunk_size must be 50000-300000, got {size}")]
    InvalidChunkSize {
        /// Requested size.
        size: usize,
    },

    /// Overlap outside 0–50 000 or not strictly below the chunk size.
    #[error("chunk_overlap {overlap} must be 0-50000 and < chunk_size {size}")]
    InvalidOverlap {
        /// Requested overlap.
        overlap: usize,
        /// Chunk size it was checked against.
        size: usize,
    },

    /// A produced chunk exceeds the maximum.
    #[error("chunk size {size} exceeds maximum {max}")]
    ChunkTooLarge {
        /// Actual chunk size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Chunking produced nothing to analyse.
    #[error("no chunks created")]
    NoChunks,

    /// Chunk count tripped the safety circuit breaker.
    #[error("chunk count {count} exceeds safety limit {limit}")]
    TooManyChunks {
        /// Produced chunk count.
        count: usize,
        /// Absolute limit.
        limit: usize,
    },

    /// Syntax tree construction failed.
    #[error("syntax parse failed for {path}: {reason}")]
    AstParse {
        /// File that failed to parse.
        path: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// A map batch failed wholesale.
    #[error("batch {batch} failed: {reason}")]
    BatchFailed {
        /// Batch index.
        batch: usize,
        /// Failure description.
        reason: String,
    },

    /// A chunk result failed validation.
    #[error("result validation failed: {reason}")]
    ResultValidation {
        /// Validation diagnostic.
        reason: String,
    },
}

impl ChunkingError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidChunkSize { .. } => ErrorCode::InvalidChunkSize,
            Self::InvalidOverlap { .. } => ErrorCode::OverlapExceedsSize,
            Self::ChunkTooLarge { .. } => ErrorCode::ChunkTooLarge,
            Self::NoChunks => ErrorCode::NoChunksCreated,
            Self::TooManyChunks { .. } => ErrorCode::ChunkCountExceeded,
            Self::AstParse { .. } => ErrorCode::AstParseFailed,
            Self::BatchFailed { .. } => ErrorCode::BatchFailed,
            Self::ResultValidation { .. } => ErrorCode::ResultValidationFailed,
        }
    }
}

/// Sandbox executor errors.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Code exceeds the length pre-filter.
    #[error("code too long: {len} bytes (max {limit})")]
    CodeTooLong {
        /// Submitted length.
        len: usize,
        /// Maximum allowed length.
        limit: usize,
    },

    /// The forbidden-pattern scan matched.
    #[error("forbidden pattern rejected: {description}")]
    ForbiddenPattern {
        /// Human description of the matched pattern class.
        description: String,
    },

    /// A syntax-tree node kind outside the allow-list.
    #[error("forbidden construct: {kind}")]
    ForbiddenNode {
        /// Node kind that was denied.
        kind: String,
    },

    /// An attribute name rejected by the post-filter.
    #[error("forbidden attribute access: {name}")]
    ForbiddenAttribute {
        /// Attribute name.
        name: String,
    },

    /// The expression failed to parse.
    #[error("syntax error: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },

    /// Runtime evaluation failure inside the sandbox.
    #[error("evaluation error: {message}")]
    Eval {
        /// Evaluator diagnostic.
        message: String,
    },

    /// Execution exceeded the timeout; the worker was recycled.
    #[error("execution timed out after {seconds}s; worker terminated and restarted")]
    Timeout {
        /// Configured timeout.
        seconds: u64,
    },

    /// The worker process died unexpectedly.
    #[error("sandbox worker failed: {reason}")]
    Worker {
        /// Failure description.
        reason: String,
    },
}

impl SandboxError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::TimeoutError,
            Self::Worker { .. } => ErrorCode::InternalError,
            _ => ErrorCode::SandboxRejected,
        }
    }
}

/// Grep worker errors.
#[derive(Error, Debug)]
pub enum GrepError {
    /// Pattern matched the ReDoS heuristic list.
    #[error(
        "potentially dangerous regex rejected: pattern contains nested \
         quantifiers or similar ReDoS risks"
    )]
    DangerousPattern,

    /// Content exceeds the grep size cap.
    #[error(
        "content too large for grep: {size} bytes (max {limit}). \
         Alternatives: grep_file() for single files, --lazy mode with \
         load_file(), or --target to limit scope"
    )]
    ContentTooLarge {
        /// Content size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// Regex execution exceeded the timeout.
    #[error("regex execution timed out after {seconds}s")]
    Timeout {
        /// Configured timeout.
        seconds: u64,
    },

    /// Pattern failed to compile.
    #[error("invalid regex pattern: {reason}")]
    InvalidPattern {
        /// Compiler diagnostic.
        reason: String,
    },
}

impl GrepError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::DangerousPattern => ErrorCode::SandboxRejected,
            Self::ContentTooLarge { .. } => ErrorCode::ContextTooLarge,
            Self::Timeout { .. } => ErrorCode::TimeoutError,
            Self::InvalidPattern { .. } => ErrorCode::SubagentParseFailed,
        }
    }
}

/// Checkpoint errors.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Checkpoint file exceeds the absolute read limit.
    #[error("checkpoint too large: {size} bytes exceeds {limit} byte limit")]
    TooLarge {
        /// File size.
        size: u64,
        /// Read limit.
        limit: u64,
    },

    /// Checkpoint content failed to deserialise.
    #[error("checkpoint corrupt: {reason}")]
    Corrupt {
        /// Parse diagnostic.
        reason: String,
    },

    /// Atomic write failed after all retries.
    #[error("checkpoint write failed: {path}: {reason}")]
    WriteFailed {
        /// Target path.
        path: String,
        /// Underlying reason.
        reason: String,
    },
}

impl CheckpointError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TooLarge { .. } | Self::Corrupt { .. } => ErrorCode::CheckpointCorrupt,
            Self::WriteFailed { .. } => ErrorCode::CacheDirError,
        }
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration failed to load or validate.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Validation diagnostic.
        reason: String,
    },

    /// A required setting is absent.
    #[error("missing required setting: {name}")]
    MissingSetting {
        /// Setting name.
        name: String,
    },

    /// An unknown model tier was requested.
    #[error("unknown model setting: {name}")]
    InvalidModel {
        /// Model name.
        name: String,
    },

    /// Escalation was requested past the configured budget.
    #[error("escalation budget exhausted ({escalated}/{total} chunks, ${cost:.2} estimated)")]
    EscalationBudgetExceeded {
        /// Chunks already escalated.
        escalated: usize,
        /// Total chunk count.
        total: usize,
        /// Estimated cost so far.
        cost: f64,
    },
}

impl ConfigError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Invalid { .. } => ErrorCode::InvalidConfigFile,
            Self::MissingSetting { .. } => ErrorCode::MissingRequiredSetting,
            Self::InvalidModel { .. } => ErrorCode::InvalidModelSetting,
            Self::EscalationBudgetExceeded { .. } => ErrorCode::EscalationBudgetExceeded,
        }
    }
}

/// System and internal errors.
#[derive(Error, Debug)]
pub enum SystemError {
    /// Unclassified internal failure.
    #[error("internal error: {message}")]
    Internal {
        /// Failure description.
        message: String,
    },

    /// State record failed an integrity check.
    #[error("state corruption: {reason}")]
    StateCorruption {
        /// Diagnostic.
        reason: String,
    },

    /// An operation timed out.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// What timed out.
        operation: String,
        /// Configured timeout.
        seconds: u64,
    },

    /// The external model reported rate limiting.
    #[error("rate limited by external model")]
    RateLimit,

    /// The user cancelled the operation.
    #[error("operation cancelled by user")]
    Cancelled {
        /// Delivery mode of the cancellation.
        kind: CancelKind,
    },
}

impl SystemError {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::InternalError,
            Self::StateCorruption { .. } => ErrorCode::StateCorruption,
            Self::Timeout { .. } => ErrorCode::TimeoutError,
            Self::RateLimit => ErrorCode::RateLimitError,
            Self::Cancelled { .. } => ErrorCode::CancelledByUser,
        }
    }
}

/// Comprehensive error type for DeepScan operations.
#[derive(Error, Debug)]
pub enum Error {
    /// State and session management errors.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Chunking and aggregation errors.
    #[error("chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    /// Sandbox executor errors.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    /// Grep worker errors.
    #[error("grep error: {0}")]
    Grep(#[from] GrepError),

    /// Checkpoint errors.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Configuration errors.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// System and internal errors.
    #[error("system error: {0}")]
    System(#[from] SystemError),
}

impl Error {
    /// Stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::State(e) => e.code(),
            Self::Chunking(e) => e.code(),
            Self::Sandbox(e) => e.code(),
            Self::Grep(e) => e.code(),
            Self::Checkpoint(e) => e.code(),
            Self::Config(e) => e.code(),
            Self::System(e) => e.code(),
        }
    }

    /// Error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    /// Process exit code. User cancellation uniquely maps to 130.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if matches!(self.code(), ErrorCode::CancelledByUser) {
            130
        } else {
            self.category().exit_code()
        }
    }

    /// Whether this error represents a user cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::System(SystemError::Cancelled { .. }))
    }

    /// Renders the error for terminal display.
    ///
    /// One line of the form `[DS-NNN] Title: message`, an optional `File:`
    /// context line, and the remediation template when one exists. Verbose
    /// mode adds category, documentation URL and the cause chain. All
    /// user-controlled text is escaped to keep control sequences out of
    /// the terminal.
    #[must_use]
    pub fn render(&self, context: &ErrorContext, verbose: bool) -> String {
        let code = self.code();
        let mut lines = vec![format!(
            "[{}] {}: {}",
            code.code_str(),
            code.title(),
            escape_terminal(&self.to_string())
        )];

        if let Some(path) = &context.file_path {
            lines.push(format!("  File: {}", escape_terminal(path)));
        }
        if let Some(chunk) = &context.chunk_id {
            lines.push(format!("  Chunk: {}", escape_terminal(chunk)));
        }
        if let (Some(expected), Some(actual)) = (&context.expected, &context.actual) {
            lines.push(format!("  Expected: {}", escape_terminal(expected)));
            lines.push(format!("  Actual: {}", escape_terminal(actual)));
        }

        if verbose {
            lines.push(format!("  Category: {}", self.category().as_str()));
            lines.push(format!("  Docs: {}", code.doc_url()));
            let mut source = std::error::Error::source(self);
            while let Some(cause) = source {
                lines.push(format!(
                    "  Caused by: {}",
                    escape_terminal(&cause.to_string())
                ));
                source = cause.source();
            }
        }

        if let Some(template) = code.remediation() {
            lines.push(String::new());
            lines.push(format!("  Remediation: {}", context.fill(template)));
        }

        lines.join("\n")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::State(StateError::Io {
            path: String::new(),
            reason: err.to_string(),
        })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::System(SystemError::StateCorruption {
            reason: err.to_string(),
        })
    }
}

/// Strips control characters that could inject markup or cursor movement
/// into the terminal renderer. Newlines and tabs are preserved.
#[must_use]
pub fn escape_terminal(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
