//! Append-only JSONL journal with file locking.
//!
//! Each entry is one JSON line. Appends take an exclusive lock on the file
//! and are synced to disk before returning, so a record that was
//! acknowledged survives a crash. A torn final line left by a crash during
//! an append is dropped on replay.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::warn;

/// Errors raised by the journal
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed journal line {line} in {path}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
}

/// File-backed JSONL journal
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Open a journal, creating its parent directory
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        Ok(Self { path })
    }

    /// Path to the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and sync it to disk
    pub async fn append<T: Serialize>(&self, entry: &T) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.write_synced(line).await
    }

    /// Append raw bytes under the file lock and sync them to disk
    async fn write_synced(&self, bytes: Vec<u8>) -> Result<(), JournalError> {
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<(), JournalError> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

            file.lock_exclusive()?;
            let written = file.write_all(&bytes).and_then(|_| file.sync_data());
            let unlocked = file.unlock();

            written?;
            unlocked?;
            Ok(())
        })
        .await
        .map_err(|e| JournalError::Io(std::io::Error::other(e)))?
    }

    /// Replay all entries in order.
    ///
    /// A final line without a trailing newline that does not parse is the
    /// remains of an append cut short by a crash. It was never acknowledged,
    /// so it is cut off the file and skipped. Malformed lines anywhere else
    /// are an error.
    pub async fn replay<T: DeserializeOwned>(&self) -> Result<Vec<T>, JournalError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read(&self.path).await?;
        let mut entries = Vec::new();
        let mut offset = 0;

        for (index, segment) in content.split_inclusive(|b| *b == b'\n').enumerate() {
            let line_start = offset;
            offset += segment.len();

            let terminated = segment.ends_with(b"\n");
            let line = segment.strip_suffix(b"\n").unwrap_or(segment);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice(line) {
                Ok(entry) => {
                    entries.push(entry);
                    if !terminated {
                        // Complete record, only the newline was lost
                        self.write_synced(b"\n".to_vec()).await?;
                    }
                }
                Err(source) if !terminated => {
                    warn!(
                        path = %self.path.display(),
                        line = index + 1,
                        error = %source,
                        "Dropping torn journal tail"
                    );
                    self.truncate(line_start as u64).await?;
                }
                Err(source) => {
                    return Err(JournalError::Malformed {
                        path: self.path.clone(),
                        line: index + 1,
                        source,
                    })
                }
            }
        }

        Ok(entries)
    }

    async fn truncate(&self, len: u64) -> Result<(), JournalError> {
        let file = fs::OpenOptions::new().write(true).open(&self.path).await?;
        file.set_len(len).await?;
        file.sync_all().await?;
        Ok(())
    }
}
