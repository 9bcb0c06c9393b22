//! Session hash generation and validation.
//!
//! Session hashes name directories under the cache root, so they are
//! validated against a strict grammar before they ever touch the
//! filesystem.

use std::sync::OnceLock;

use regex::Regex;

/// Grammar for session hashes: `^[A-Za-z0-9_-]+$`.
fn session_hash_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[A-Za-z0-9_-]+$").unwrap()
    })
}

/// Validates a session hash against the grammar.
///
/// Rejects empty strings, anything outside `[A-Za-z0-9_-]`, and any hash
/// containing `..` or a path separator. Hashes that fail here must never
/// be used to build a filesystem path.
#[must_use]
pub fn validate_session_hash(session_hash: &str) -> bool {
    if session_hash.is_empty() {
        return false;
    }
    if !session_hash_pattern().is_match(session_hash) {
        return false;
    }
    if session_hash.contains("..") || session_hash.contains('/') || session_hash.contains('\\') {
        return false;
    }
    true
}

/// Generates a fresh session hash: `deepscan_<unix_ts>_<16 hex>`.
///
/// The entropy suffix mixes the nanosecond clock and the process id, which
/// is enough to keep concurrent invocations on one host from colliding.
#[must_use]
pub fn generate_session_hash() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let entropy = xxhash_rust::xxh3::xxh3_64(
        format!("{}:{}", now.as_nanos(), std::process::id()).as_bytes(),
    );
    format!("deepscan_{}_{entropy:016x}", now.as_secs())
}
