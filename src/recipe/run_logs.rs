//! Recipe execution logs.
//!
//! Every execution owns an append-only log addressed by entry index: the
//! cursor of an entry is the number of entries before it. Appends are
//! broadcast to per-execution subscribers; a subscriber that lags behind
//! catches up with `read` from the last cursor it saw. When a mirror
//! directory is configured, entries are also written as JSONL so logs can be
//! replayed after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::error::AppError;

/// Smallest page a reader may ask for.
const MIN_READ_BYTES: u64 = 4 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipeLogStream {
    System,
    Progress,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeLogEntry {
    pub timestamp: String,
    pub stream: RecipeLogStream,
    #[serde(default)]
    pub step_id: Option<String>,
    pub message: String,
}

impl RecipeLogEntry {
    pub fn new(stream: RecipeLogStream, step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            timestamp: now_rfc3339(),
            stream,
            step_id: step_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn system(step_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::new(RecipeLogStream::System, step_id, message)
    }

    fn weight(&self) -> u64 {
        serde_json::to_string(self)
            .map(|s| s.len() as u64 + 1)
            .unwrap_or(self.message.len() as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeLogChunk {
    pub execution_id: String,
    pub cursor: u64,
    pub next_cursor: u64,
    pub eof: bool,
    pub entries: Vec<RecipeLogEntry>,
}

/// Pushed to subscribers on every append.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogAppended {
    pub execution_id: String,
    /// Cursor of the first entry in `entries`
    pub cursor: u64,
    pub entries: Vec<RecipeLogEntry>,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

struct LogChannel {
    entries: Mutex<Vec<RecipeLogEntry>>,
    tx: broadcast::Sender<LogAppended>,
}

pub struct RunLogs {
    channels: RwLock<HashMap<String, Arc<LogChannel>>>,
    mirror_dir: Option<PathBuf>,
    default_max_bytes: u64,
    capacity: usize,
}

impl RunLogs {
    pub fn new(mirror_dir: Option<PathBuf>, default_max_bytes: u64, capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            mirror_dir,
            default_max_bytes,
            capacity: capacity.max(1),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None, 256 * 1024, 1024)
    }

    fn log_path(&self, execution_id: &str) -> Option<PathBuf> {
        self.mirror_dir
            .as_ref()
            .map(|dir| dir.join(format!("interactive-{}.jsonl", execution_id)))
    }

    /// Create the channel for an execution. Existing channels are kept.
    pub async fn open(&self, execution_id: &str) -> Result<(), AppError> {
        if execution_id.trim().is_empty() {
            return Err(AppError::invalid_input("execution_id is required"));
        }
        let mut channels = self.channels.write().await;
        if channels.contains_key(execution_id) {
            return Ok(());
        }

        // Replay a mirrored log left by an earlier process.
        let entries = match self.log_path(execution_id) {
            Some(path) => read_jsonl(&path).await?,
            None => Vec::new(),
        };
        let (tx, _) = broadcast::channel(self.capacity);
        channels.insert(
            execution_id.to_string(),
            Arc::new(LogChannel {
                entries: Mutex::new(entries),
                tx,
            }),
        );
        Ok(())
    }

    async fn channel(&self, execution_id: &str) -> Result<Arc<LogChannel>, AppError> {
        self.channels
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("No log for execution {execution_id}")))
    }

    /// Append entries and return the next cursor.
    pub async fn append(
        &self,
        execution_id: &str,
        new_entries: Vec<RecipeLogEntry>,
    ) -> Result<u64, AppError> {
        let channel = self.channel(execution_id).await?;
        let mut entries = channel.entries.lock().await;
        let cursor = entries.len() as u64;
        if new_entries.is_empty() {
            return Ok(cursor);
        }

        if let Some(path) = self.log_path(execution_id) {
            if let Err(e) = append_jsonl(&path, &new_entries).await {
                tracing::warn!(execution_id, "failed to mirror run log: {}", e.message);
            }
        }

        entries.extend(new_entries.iter().cloned());
        let next = entries.len() as u64;
        // No subscribers is fine.
        let _ = channel.tx.send(LogAppended {
            execution_id: execution_id.to_string(),
            cursor,
            entries: new_entries,
        });
        Ok(next)
    }

    pub async fn append_one(&self, execution_id: &str, entry: RecipeLogEntry) -> Result<u64, AppError> {
        self.append(execution_id, vec![entry]).await
    }

    /// Read entries from `cursor` up to about `max_bytes`; at least one entry
    /// is returned whenever one exists at `cursor`.
    pub async fn read(
        &self,
        execution_id: &str,
        cursor: Option<u64>,
        max_bytes: Option<u64>,
    ) -> Result<RecipeLogChunk, AppError> {
        let channel = self.channel(execution_id).await?;
        let entries = channel.entries.lock().await;
        let cursor = cursor.unwrap_or(0);
        let max_bytes = max_bytes.unwrap_or(self.default_max_bytes).max(MIN_READ_BYTES);
        let total = entries.len() as u64;

        let mut out = Vec::new();
        let mut bytes_read: u64 = 0;
        let mut next = cursor.min(total);
        while next < total {
            let entry = &entries[next as usize];
            let weight = entry.weight();
            if !out.is_empty() && bytes_read.saturating_add(weight) > max_bytes {
                break;
            }
            bytes_read = bytes_read.saturating_add(weight);
            out.push(entry.clone());
            next += 1;
        }

        Ok(RecipeLogChunk {
            execution_id: execution_id.to_string(),
            cursor,
            next_cursor: next.max(cursor.min(total)),
            eof: next >= total,
            entries: out,
        })
    }

    /// Last `limit` entries.
    pub async fn tail(&self, execution_id: &str, limit: usize) -> Result<Vec<RecipeLogEntry>, AppError> {
        let channel = self.channel(execution_id).await?;
        let entries = channel.entries.lock().await;
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }

    /// Drop all entries; the next append starts at cursor 0.
    pub async fn clear(&self, execution_id: &str) -> Result<(), AppError> {
        let channel = self.channel(execution_id).await?;
        let mut entries = channel.entries.lock().await;
        entries.clear();
        if let Some(path) = self.log_path(execution_id) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    pub async fn subscribe(&self, execution_id: &str) -> Result<broadcast::Receiver<LogAppended>, AppError> {
        Ok(self.channel(execution_id).await?.tx.subscribe())
    }
}

async fn append_jsonl(path: &Path, entries: &[RecipeLogEntry]) -> Result<(), AppError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&serde_json::to_string(entry)?);
        buf.push('\n');
    }
    f.write_all(buf.as_bytes()).await?;
    Ok(())
}

async fn read_jsonl(path: &Path) -> Result<Vec<RecipeLogEntry>, AppError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut entries = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| AppError::io(format!("Failed to read log file: {e}")))?
    {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<RecipeLogEntry>(trimmed) {
            Ok(entry) => entries.push(entry),
            Err(_) => entries.push(RecipeLogEntry::system(None, trimmed)),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(i: usize) -> RecipeLogEntry {
        RecipeLogEntry::new(RecipeLogStream::Stdout, Some("s"), format!("line {i} {}", "x".repeat(200)))
    }

    #[tokio::test]
    async fn test_chained_reads_equal_tail() {
        let logs = RunLogs::in_memory();
        logs.open("e1").await.unwrap();
        for i in 0..100 {
            logs.append_one("e1", line(i)).await.unwrap();
        }

        let mut cursor = 0;
        let mut collected = Vec::new();
        loop {
            let chunk = logs.read("e1", Some(cursor), Some(MIN_READ_BYTES)).await.unwrap();
            assert_eq!(chunk.cursor, cursor);
            collected.extend(chunk.entries);
            cursor = chunk.next_cursor;
            if chunk.eof {
                break;
            }
        }
        assert_eq!(cursor, 100);
        assert_eq!(collected, logs.tail("e1", 100).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_returns_at_least_one_oversized_entry() {
        let logs = RunLogs::in_memory();
        logs.open("e1").await.unwrap();
        let big = RecipeLogEntry::system(None, "y".repeat(10 * 1024));
        logs.append("e1", vec![big.clone(), line(1)]).await.unwrap();

        let chunk = logs.read("e1", None, Some(1)).await.unwrap();
        assert_eq!(chunk.entries, vec![big]);
        assert_eq!(chunk.next_cursor, 1);
        assert!(!chunk.eof);
    }

    #[tokio::test]
    async fn test_clear_resets_cursor() {
        let logs = RunLogs::in_memory();
        logs.open("e1").await.unwrap();
        logs.append("e1", vec![line(0), line(1)]).await.unwrap();
        logs.clear("e1").await.unwrap();

        let chunk = logs.read("e1", Some(2), None).await.unwrap();
        assert!(chunk.eof);
        assert!(chunk.entries.is_empty());
        assert_eq!(logs.append_one("e1", line(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_appends_with_cursor() {
        let logs = RunLogs::in_memory();
        logs.open("e1").await.unwrap();
        logs.append_one("e1", line(0)).await.unwrap();
        let mut rx = logs.subscribe("e1").await.unwrap();
        logs.append("e1", vec![line(1), line(2)]).await.unwrap();

        let note = rx.recv().await.unwrap();
        assert_eq!(note.cursor, 1);
        assert_eq!(note.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_execution_is_not_found() {
        let logs = RunLogs::in_memory();
        assert_eq!(logs.tail("nope", 5).await.unwrap_err().code, "not_found");
    }

    #[tokio::test]
    async fn test_mirror_is_replayed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunLogs::new(Some(dir.path().to_path_buf()), 256 * 1024, 16);
        first.open("e1").await.unwrap();
        first.append("e1", vec![line(0), line(1)]).await.unwrap();

        let second = RunLogs::new(Some(dir.path().to_path_buf()), 256 * 1024, 16);
        second.open("e1").await.unwrap();
        assert_eq!(second.tail("e1", 10).await.unwrap().len(), 2);
    }
}
