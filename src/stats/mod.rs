//! Run statistics for the standard sequencer.
//!
//! Tracks per-run counters and keeps running totals on disk.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, PersistedStats, RunLog, RunStats,
    SharedRunLog,
};
