//! On-disk layout of the desired room set.
//!
//! Writes go to `<path>.tmp`, are fsynced, then renamed over `<path>` so a
//! reader never observes a partially written file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredFile {
    pub schema: u32,
    pub account: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("desired-state path is empty")]
    EmptyPath,
    #[error("expected account is empty")]
    EmptyAccount,
    #[error("{} belongs to account {found:?}, expected {expected:?}", path.display())]
    AccountMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },
    #[error("{} has unsupported schema {schema} (supported: {SCHEMA_VERSION})", path.display())]
    UnsupportedSchema { path: PathBuf, schema: u32 },
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode desired state: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("desired-state writer task failed: {0}")]
    WriterTask(#[source] tokio::task::JoinError),
}

impl StoreError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            StoreError::EmptyPath => "empty_path",
            StoreError::EmptyAccount => "empty_account",
            StoreError::AccountMismatch { .. } => "account_mismatch",
            StoreError::UnsupportedSchema { .. } => "unsupported_schema",
            StoreError::Io { .. } => "io",
            StoreError::Decode { .. } => "decode",
            StoreError::Encode(_) => "encode",
            StoreError::WriterTask(_) => "writer_task",
        }
    }
}

fn io_err(action: &'static str, path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Reads the file at `path`; `Ok(None)` when it does not exist.
pub fn load(path: &Path) -> Result<Option<DesiredFile>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err("read", path, err)),
    };
    let file: DesiredFile = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    if file.schema > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            path: path.to_path_buf(),
            schema: file.schema,
        });
    }
    Ok(Some(file))
}

/// Replaces the file at `path` atomically.
pub fn write_atomic(path: &Path, file: &DesiredFile) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|err| io_err("create directory", dir, err))?;

    let mut data = serde_json::to_vec_pretty(file).map_err(StoreError::Encode)?;
    data.push(b'\n');

    let tmp = tmp_path(path);
    let mut handle = File::create(&tmp).map_err(|err| io_err("create", &tmp, err))?;
    handle.write_all(&data).map_err(|err| io_err("write", &tmp, err))?;
    handle.sync_all().map_err(|err| io_err("fsync", &tmp, err))?;
    drop(handle);

    fs::rename(&tmp, path).map_err(|err| io_err("rename", path, err))?;

    #[cfg(unix)]
    {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(account: &str, channels: &[&str]) -> DesiredFile {
        DesiredFile {
            schema: SCHEMA_VERSION,
            account: account.into(),
            updated_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("timestamp"),
            channels: channels.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load(&dir.path().join("channels.json")).expect("load").is_none());
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("channels.json");
        let file = sample("alice", &["#a", "#b"]);
        write_atomic(&path, &file).expect("write");
        assert_eq!(load(&path).expect("load"), Some(file));
        assert!(!tmp_path(&path).exists());

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"updated_at\": \"2023-11-14T22:13:20Z\""), "{raw}");
    }

    #[test]
    fn interrupted_write_leaves_previous_file_intact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("channels.json");
        let committed = sample("alice", &["#a"]);
        write_atomic(&path, &committed).expect("write");

        // A crash between writing the temp file and renaming it.
        fs::write(tmp_path(&path), b"{\"schema\": 1, \"acc").expect("partial tmp");
        assert_eq!(load(&path).expect("load"), Some(committed));

        let next = sample("alice", &["#a", "#b"]);
        write_atomic(&path, &next).expect("rewrite over stale tmp");
        assert_eq!(load(&path).expect("load"), Some(next));
    }

    #[test]
    fn rejects_newer_schema_and_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("channels.json");
        let mut file = sample("alice", &[]);
        file.schema = SCHEMA_VERSION + 1;
        write_atomic(&path, &file).expect("write");
        assert!(matches!(
            load(&path),
            Err(StoreError::UnsupportedSchema { schema: 2, .. })
        ));

        fs::write(&path, b"not json").expect("write");
        assert!(matches!(load(&path), Err(StoreError::Decode { .. })));
    }
}
