//! Event input for the sequencer.
//!
//! This module provides the raw event representation and a reader that
//! streams events from newline-delimited JSON.

pub mod reader;
pub mod types;

// Re-export commonly used types
pub use reader::{JsonlReader, ReadError, ReadItem};
pub use types::{Cell, Event, Value};
