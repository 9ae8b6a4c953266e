//! Standard Sequencer - session-windowed sequence construction.
//!
//! This library turns a stream of irregular, keyed events into fixed-length
//! sequences on a uniform time grid, ready to be fed to sequence models.
//!
//! # Pipeline
//!
//! 1. **Keying**: every event is assigned its category (or a shared default
//!    group) and a parsed UTC timestamp
//! 2. **Windowing**: events of one key form session windows, split wherever
//!    two consecutive events are further apart than the gap threshold
//! 3. **Combining**: each session is resampled onto a fixed-rate grid with a
//!    per-feature aggregation method, gaps are filled per feature, and
//!    fixed-length sequences are cut from the grid
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Standard Sequencer                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │    JSONL    │──▶│   Keying &  │──▶│   Session   │       │
//! │  │   Reader    │   │  Timestamps │   │   Windows   │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │                                             │               │
//! │                                             ▼               │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │   Export    │◀──│  Sequences  │◀──│  Resample & │       │
//! │  │ (JSON/JSONL)│   │  (L, shift) │   │    Fill     │       │
//! │  └─────────────┘   └─────────────┘   └─────────────┘       │
//! │         │                                                   │
//! │         ▼                                                   │
//! │  ┌─────────────┐                                            │
//! │  │  Run Stats  │                                            │
//! │  └─────────────┘                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use standard_sequencer::{Event, FeatureSpec, SequencerConfig, StandardSequencer};
//!
//! let features = FeatureSpec::new()
//!     .with("ts", "string")
//!     .with("speed", "float32");
//! let config = SequencerConfig::new("ts").with_sequence(2, 1);
//! let sequencer = StandardSequencer::new(config, &features).unwrap();
//!
//! let events = vec![
//!     Event::new().with("ts", "2021-01-01 00:00:00").with("speed", 3.0),
//!     Event::new().with("ts", "2021-01-01 00:00:02").with("speed", 5.0),
//! ];
//! let sequences = sequencer.process_batch(events).unwrap();
//! assert_eq!(sequences.len(), 2);
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod event;
pub mod export;
pub mod runner;
pub mod stats;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, SequencerConfig};
pub use self::core::{
    CombineFn, FeatureSpec, PolicyEntry, PolicyTable, Sequence, SequenceCombine,
    StandardSequencer,
};
pub use error::{Result, SequencerError};
pub use event::{Event, JsonlReader, Value};
pub use export::{ExportBatch, ExportFormat};
pub use runner::RunOptions;
pub use stats::{RunLog, SharedRunLog};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_package() {
        assert!(!VERSION.is_empty());
        assert_eq!(export::PRODUCER_NAME, env!("CARGO_PKG_NAME"));
    }
}
