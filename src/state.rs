//! Persistent per-device configuration blob.
//!
//! Read once at device startup, rewritten on a `config-set` command.
//! Writes are atomic: content lands in a temp file beside the target,
//! then `rename`s over it, so a crash mid-write never leaves a
//! truncated blob behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read config blob {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write config blob {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

pub fn blob_path(state_directory: &str, shelf: u16, slot: u8) -> PathBuf {
    Path::new(state_directory).join(format!("{shelf}-{slot}.cfg"))
}

/// Reads the config blob for `(shelf, slot)`, if one exists. Absence is
/// not an error: a freshly configured export has none yet.
pub fn load(state_directory: &str, shelf: u16, slot: u8) -> Result<Option<Vec<u8>>, StateError> {
    let path = blob_path(state_directory, shelf, slot);
    match fs::read(&path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StateError::Read { path, source }),
    }
}

/// Atomically persists `data` as the config blob for `(shelf, slot)`.
pub fn store(state_directory: &str, shelf: u16, slot: u8, data: &[u8]) -> Result<(), StateError> {
    let path = blob_path(state_directory, shelf, slot);
    let tmp_path = path.with_extension("cfg.tmp");

    let write = || -> io::Result<()> {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(data)?;
        f.sync_all()?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    };

    write().map_err(|source| StateError::Write {
        path: path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_blob_is_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(dir.path().to_str().unwrap(), 1, 2).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        store(dir_str, 1, 2, b"hello config").unwrap();
        let data = load(dir_str, 1, 2).unwrap().unwrap();
        assert_eq!(data, b"hello config");
    }

    #[test]
    fn store_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        store(dir_str, 5, 6, b"x").unwrap();
        let tmp = blob_path(dir_str, 5, 6).with_extension("cfg.tmp");
        assert!(!tmp.exists());
    }

    #[test]
    fn overwrite_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let dir_str = dir.path().to_str().unwrap();
        store(dir_str, 1, 1, b"first").unwrap();
        store(dir_str, 1, 1, b"second").unwrap();
        assert_eq!(load(dir_str, 1, 1).unwrap().unwrap(), b"second");
    }
}
