//! Atomic JSON file persistence (§5 "JSON document files").
//!
//! Grounded on `original_source/backend/file_utils.py::atomic_write_json`:
//! write to a temp file in the same directory, flush, fsync, then rename.
//! `rename` within one filesystem is atomic, so a concurrent reader never
//! observes a half-written file.

use std::io::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path.parent().context("path has no parent directory")?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .context("creating temp file for atomic write")?;
    let body = serde_json::to_vec_pretty(value)?;
    tmp.write_all(&body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let body = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn round_trips_through_temp_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thing.json");
        atomic_write_json(&path, &json!({"a": 1})).unwrap();
        let read: Value = read_json(&path).unwrap().unwrap();
        assert_eq!(read["a"], 1);
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Option<Value> = read_json(&path).unwrap();
        assert!(read.is_none());
    }
}
