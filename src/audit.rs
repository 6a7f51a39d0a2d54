use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::resolution::ProviderId;

const BUFFER_FILE: &str = "geocode-attempts.jsonl";
const DEFAULT_BATCH_SIZE: usize = 16;
const MAX_PENDING_EVENTS: usize = 10_000;

/// One line of the attempt log: a provider stage or a cache decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    pub attempts: u32,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AttemptEvent {
    pub fn new(
        query: impl Into<String>,
        provider: Option<ProviderId>,
        attempts: u32,
        outcome: impl Into<String>,
        detail: Option<String>,
    ) -> Self {
        Self {
            query: query.into(),
            provider,
            attempts,
            outcome: outcome.into(),
            detail,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only JSONL record of provider attempts with size-based rotation.
///
/// Failing to write never fails a resolution: `record` logs the error and
/// keeps the events queued for the next flush.
#[derive(Clone)]
pub struct AttemptLog {
    queue: Arc<Mutex<Vec<AttemptEvent>>>,
    buffer_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl AttemptLog {
    pub fn new<P: AsRef<Path>>(
        log_dir: P,
        max_file_bytes: u64,
        max_file_count: usize,
    ) -> AppResult<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)?;
        let buffer_path = log_dir.join(BUFFER_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&buffer_path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            buffer_path,
            batch_size: DEFAULT_BATCH_SIZE,
            max_file_bytes: max_file_bytes.max(1),
            max_file_count: max_file_count.max(1),
        })
    }

    /// `None` when no audit directory is configured.
    pub fn from_config(config: &AppConfig) -> AppResult<Option<Self>> {
        config
            .audit_log_dir
            .as_ref()
            .map(|dir| {
                Self::new(
                    dir,
                    config.audit_buffer_max_bytes,
                    config.audit_buffer_max_files,
                )
            })
            .transpose()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn record(&self, event: AttemptEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_PENDING_EVENTS {
            queue.remove(0);
        }
        queue.push(event);
        if queue.len() < self.batch_size {
            return;
        }
        if let Err(err) = self.persist_locked(&mut queue) {
            warn!(
                target: "attempt_log",
                error = %err,
                pending = queue.len(),
                "failed to write attempt log; will retry on next flush"
            );
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn buffer_path(&self) -> &Path {
        &self.buffer_path
    }

    fn persist_locked(&self, queue: &mut Vec<AttemptEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut chunk = Vec::with_capacity(queue.len() * 160);
        for event in queue.iter() {
            serde_json::to_writer(&mut chunk, event)?;
            chunk.push(b'\n');
        }

        let active_bytes = fs::metadata(&self.buffer_path)
            .map(|meta| meta.len())
            .unwrap_or(0);
        if active_bytes > 0 && active_bytes + chunk.len() as u64 > self.max_file_bytes {
            self.close_segment()?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.buffer_path)?;
        file.write_all(&chunk)?;
        queue.clear();
        Ok(())
    }

    /// Retires the active file. Retired files are named after the first event
    /// they hold, so a directory listing reads as a timeline of attempts.
    fn close_segment(&self) -> AppResult<()> {
        if self.max_file_count <= 1 {
            File::create(&self.buffer_path)?;
            return Ok(());
        }

        let opened_at = self.first_logged_at().unwrap_or_else(Utc::now);
        let stamp = opened_at.format("%Y%m%dT%H%M%S%3f").to_string();
        let retired = (0..1000)
            .map(|seq| {
                self.log_dir()
                    .join(format!("{}-{stamp}-{seq:03}.jsonl", self.buffer_stem()))
            })
            .find(|candidate| !candidate.exists())
            .unwrap_or_else(|| self.log_dir().join(format!("{}-{stamp}.jsonl", self.buffer_stem())));
        fs::rename(&self.buffer_path, &retired)?;
        debug!(
            target: "attempt_log",
            retired = %retired.display(),
            "attempt log segment closed"
        );
        self.prune_segments()
    }

    fn first_logged_at(&self) -> Option<DateTime<Utc>> {
        let mut line = String::new();
        BufReader::new(File::open(&self.buffer_path).ok()?)
            .read_line(&mut line)
            .ok()?;
        serde_json::from_str::<AttemptEvent>(&line)
            .ok()
            .map(|event| event.timestamp)
    }

    fn prune_segments(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.buffer_stem());
        let mut segments = fs::read_dir(self.log_dir())?
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().to_string();
                (name.starts_with(&prefix) && name.ends_with(".jsonl")).then_some(name)
            })
            .collect::<Vec<_>>();

        // oldest first
        segments.sort();
        let keep = self.max_file_count.saturating_sub(1);
        let excess = segments.len().saturating_sub(keep);
        for name in segments.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(self.log_dir().join(&name)) {
                warn!(target: "attempt_log", file = %name, error = %err, "could not prune attempt log");
            }
        }
        Ok(())
    }

    fn log_dir(&self) -> &Path {
        self.buffer_path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn buffer_stem(&self) -> String {
        self.buffer_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "geocode-attempts".into())
    }
}

impl Drop for AttemptLog {
    fn drop(&mut self) {
        // only the last clone writes what is left
        if Arc::strong_count(&self.queue) == 1 {
            if let Err(err) = self.flush() {
                warn!(target: "attempt_log", error = %err, "dropping unwritten attempt events");
            }
        }
    }
}
