//! Core functionality of the standard sequencer.
//!
//! This module contains:
//! - Schema inference from a declared feature spec
//! - Resampling and filling methods, and policy resolution
//! - Keying, timestamping and session windowing
//! - Grid resampling and sequence extraction

pub mod combine;
pub mod grid;
pub mod methods;
pub mod policy;
pub mod schema;
pub mod sequence;
pub mod sequencer;
pub mod windowing;

// Re-export commonly used types
pub use combine::{CombineFn, SequenceCombine, SessionBuffer};
pub use grid::{resample, ResampledGrid, ScalarRow};
pub use methods::{FillMethod, MethodRegistry, MethodSpec, OutputType, ResampleMethod};
pub use policy::{default_table, FeaturePolicy, PolicyEntry, PolicyTable, ResolvedPolicies};
pub use schema::{infer_schema, FeatureKind, FeatureSpec, Schema};
pub use sequence::{sequence_count, Sequence, Sequences};
pub use sequencer::StandardSequencer;
pub use windowing::{
    GroupKey, SessionWindow, Sessions, TimestampedEvent, WindowManager, DEFAULT_CATEGORY,
    TIMESTAMP_FORMAT,
};
