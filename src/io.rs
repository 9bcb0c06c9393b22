//! File reading with memory mapping for large files.

// Memory mapping requires unsafe but is read-only here.
#![allow(unsafe_code)]

use std::fs::File;
use std::io::Read;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Result, StateError};

/// Threshold above which files are memory-mapped (1 MiB).
const MMAP_THRESHOLD: u64 = 1024 * 1024;

/// Reads a file to a string, replacing invalid UTF-8.
///
/// Files past the mmap threshold are memory-mapped instead of buffered
/// through the heap twice.
///
/// # Errors
///
/// Returns [`StateError::Io`] if the file cannot be opened or read.
pub fn read_file_lossy(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let size = file
        .metadata()
        .map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .len();

    if size >= MMAP_THRESHOLD {
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: format!("mmap failed: {e}"),
        })?;
        Ok(String::from_utf8_lossy(&mmap).into_owned())
    } else {
        let mut buf = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        file.read_to_end(&mut buf).map_err(|e| StateError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Reads the first `limit` bytes of a file.
///
/// # Errors
///
/// Returns [`StateError::Io`] on open/read failure.
pub fn read_head(path: &Path, limit: usize) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut buf = Vec::with_capacity(limit);
    let mut handle = file.take(limit as u64);
    handle.read_to_end(&mut buf).map_err(|e| StateError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(buf)
}

/// Whether a file looks binary: a NUL byte in its first 8 KiB.
#[must_use]
pub fn looks_binary(head: &[u8]) -> bool {
    head.contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_read_small_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, "hello").unwrap();
        assert_eq!(read_file_lossy(&path).unwrap(), "hello");
    }

    #[test]
    fn test_read_large_file_uses_mmap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("large.txt");
        let content = "z".repeat((MMAP_THRESHOLD + 10) as usize);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        drop(file);
        assert_eq!(read_file_lossy(&path).unwrap().len(), content.len());
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, [b'a', 0xff, 0xfe, b'b']).unwrap();
        let content = read_file_lossy(&path).unwrap();
        assert!(content.starts_with('a'));
        assert!(content.ends_with('b'));
        assert!(content.contains('\u{fffd}'));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(read_file_lossy(Path::new("/no/such/deepscan/file")).is_err());
    }

    #[test]
    fn test_read_head_and_binary_detection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mixed.bin");
        std::fs::write(&path, b"text\x00binary").unwrap();
        let head = read_head(&path, 8192).unwrap();
        assert!(looks_binary(&head));

        let text_path = dir.path().join("plain.txt");
        std::fs::write(&text_path, "just text").unwrap();
        assert!(!looks_binary(&read_head(&text_path, 8192).unwrap()));
    }
}
