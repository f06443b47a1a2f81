//! Atomic on-disk persistence: every write goes to a temp file in the same
//! directory, then renames over the target, so a crash mid-write never
//! leaves a truncated file behind.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write as _;
use std::path::Path;

pub fn write_json_atomic<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {:?}", parent))?;
    }
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value).context("serializing to json")?;

    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("creating temp file {:?}", tmp_path))?;
    file.write_all(&json)
        .with_context(|| format!("writing temp file {:?}", tmp_path))?;
    file.sync_all().context("syncing temp file")?;
    drop(file);

    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {:?} to {:?}", tmp_path, path))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_slice(&data).with_context(|| format!("parsing json in {:?}", path))
}

pub fn read_json_or_default<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> T {
    read_json(path).unwrap_or_default()
}

/// Append one JSON line to `path`, creating it (and parent directories) if
/// necessary. Used for append-only logs (snapshots, phase events).
pub fn append_jsonl<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating directory {:?}", parent))?;
    }
    let mut line = serde_json::to_vec(value).context("serializing jsonl record")?;
    line.push(b'\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {:?} for append", path))?;
    file.write_all(&line)
        .with_context(|| format!("appending to {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: i32,
        b: String,
    }

    #[test]
    fn write_then_read_json_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let value = Sample { a: 1, b: "hi".into() };
        write_json_atomic(&path, &value).unwrap();
        let read: Sample = read_json(&path).unwrap();
        assert_eq!(read, value);
    }

    #[test]
    fn read_json_or_default_falls_back_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Sample = read_json_or_default(&path);
        assert_eq!(read, Sample { a: 0, b: String::new() });
    }

    #[test]
    fn append_jsonl_accumulates_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &Sample { a: 1, b: "x".into() }).unwrap();
        append_jsonl(&path, &Sample { a: 2, b: "y".into() }).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
