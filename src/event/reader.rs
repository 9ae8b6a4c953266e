//! Newline-delimited JSON event reader.
//!
//! Lines are parsed on a background thread and handed over through a bounded
//! channel, so a slow consumer applies backpressure to the reader.

use crate::error::Result;
use crate::event::types::Event;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Default capacity of the reader channel.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// A line that could not be turned into an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ReadError {
    pub line: usize,
    pub message: String,
}

/// Item delivered by the reader channel.
pub type ReadItem = std::result::Result<Event, ReadError>;

/// Streams events out of a JSON Lines source.
pub struct JsonlReader {
    receiver: Receiver<ReadItem>,
    handle: Option<JoinHandle<()>>,
}

impl JsonlReader {
    /// Open a file and start reading it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::from_reader(BufReader::new(file), DEFAULT_CAPACITY))
    }

    /// Start reading from any buffered source.
    pub fn from_reader<R>(reader: R, capacity: usize) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (sender, receiver) = bounded(capacity.max(1));
        let handle = thread::spawn(move || read_lines(reader, sender));
        Self {
            receiver,
            handle: Some(handle),
        }
    }

    /// Get the receiver for parsed events.
    pub fn receiver(&self) -> &Receiver<ReadItem> {
        &self.receiver
    }
}

impl Iterator for JsonlReader {
    type Item = ReadItem;

    fn next(&mut self) -> Option<Self::Item> {
        match self.receiver.recv() {
            Ok(item) => Some(item),
            Err(_) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                None
            }
        }
    }
}

fn read_lines<R: BufRead>(reader: R, sender: Sender<ReadItem>) {
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let item = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => serde_json::from_str::<Event>(&line).map_err(|e| ReadError {
                line: line_no,
                message: e.to_string(),
            }),
            Err(e) => {
                let _ = sender.send(Err(ReadError {
                    line: line_no,
                    message: e.to_string(),
                }));
                break;
            }
        };

        // Receiver dropped; nobody is listening anymore.
        if sender.send(item).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::types::Value;
    use std::io::Cursor;

    #[test]
    fn test_reads_events_and_skips_blank_lines() {
        let input = "{\"ts\": \"2021-01-01T00:00:00Z\", \"v\": [1]}\n\n{\"ts\": \"2021-01-01T00:00:01Z\", \"v\": 2}\n";
        let reader = JsonlReader::from_reader(Cursor::new(input.to_string()), 4);
        let events: Vec<ReadItem> = reader.collect();

        assert_eq!(events.len(), 2);
        let second = events[1].as_ref().unwrap();
        assert_eq!(second.scalar("v").unwrap(), Some(&Value::Int(2)));
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let input = "{\"v\": 1}\nnot json\n{\"v\": 3}\n";
        let reader = JsonlReader::from_reader(Cursor::new(input.to_string()), 1);
        let items: Vec<ReadItem> = reader.collect();

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert_eq!(items[1].as_ref().unwrap_err().line, 2);
        assert!(items[2].is_ok());
    }
}
