//! Run statistics.
//!
//! Counts what a sequencing run consumed and produced. Counters are atomic
//! so worker threads can record without locking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Counters of one sequencing run.
#[derive(Debug)]
pub struct RunLog {
    /// Identifier of this run
    run_id: Uuid,
    /// Events read from the input
    events_read: AtomicU64,
    /// Events skipped because they could not be keyed or timestamped
    events_rejected: AtomicU64,
    /// Session windows aggregated
    windows_completed: AtomicU64,
    /// Sequences emitted
    sequences_emitted: AtomicU64,
    /// Run start time
    started_at: DateTime<Utc>,
    /// Totals of earlier runs
    previous: PersistedStats,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl RunLog {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            events_read: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            windows_completed: AtomicU64::new(0),
            sequences_emitted: AtomicU64::new(0),
            started_at: Utc::now(),
            previous: PersistedStats::default(),
            persist_path: None,
        }
    }

    /// Create a run log that accumulates into a stats file.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            warn!(error = %e, "Could not load previous run stats");
        }

        log
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record_events_read(&self, count: u64) {
        self.events_read.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_event_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_completed(&self) {
        self.windows_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sequences_emitted(&self, count: u64) {
        self.sequences_emitted.fetch_add(count, Ordering::Relaxed);
    }

    /// Get the counters of this run.
    pub fn stats(&self) -> RunStats {
        RunStats {
            run_id: self.run_id,
            events_read: self.events_read.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            windows_completed: self.windows_completed.load(Ordering::Relaxed),
            sequences_emitted: self.sequences_emitted.load(Ordering::Relaxed),
            started_at: self.started_at,
            duration_ms: (Utc::now() - self.started_at).num_milliseconds().max(0) as u64,
        }
    }

    /// Totals over earlier runs plus this one.
    pub fn totals(&self) -> PersistedStats {
        let stats = self.stats();
        PersistedStats {
            runs: self.previous.runs + 1,
            events_read: self.previous.events_read + stats.events_read,
            events_rejected: self.previous.events_rejected + stats.events_rejected,
            windows_completed: self.previous.windows_completed + stats.windows_completed,
            sequences_emitted: self.previous.sequences_emitted + stats.sequences_emitted,
            last_run_id: Some(self.run_id),
            last_updated: Some(Utc::now()),
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Run {}:\n\
             - Events read: {}\n\
             - Events rejected: {}\n\
             - Windows completed: {}\n\
             - Sequences emitted: {}\n\
             - Duration: {} ms",
            stats.run_id,
            stats.events_read,
            stats.events_rejected,
            stats.windows_completed,
            stats.sequences_emitted,
            stats.duration_ms
        )
    }

    /// Save accumulated totals to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let json = serde_json::to_string_pretty(&self.totals()).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                self.previous = PersistedStats::read(path)?;
            }
        }
        Ok(())
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one run's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub events_read: u64,
    pub events_rejected: u64,
    pub windows_completed: u64,
    pub sequences_emitted: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Totals across runs, as stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedStats {
    pub runs: u64,
    pub events_read: u64,
    pub events_rejected: u64,
    pub windows_completed: u64,
    pub sequences_emitted: u64,
    #[serde(default)]
    pub last_run_id: Option<Uuid>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl PersistedStats {
    /// Read stored totals from a file.
    pub fn read(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(std::io::Error::other)
    }
}

/// Thread-safe shared run log.
pub type SharedRunLog = Arc<RunLog>;

pub fn create_shared_log() -> SharedRunLog {
    Arc::new(RunLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedRunLog {
    Arc::new(RunLog::with_persistence(path))
}
