//! Fixed-length sequence extraction from a resampled grid.

use crate::core::grid::ResampledGrid;
use crate::event::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fixed-length slice of one session's grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Category of the session, if events are grouped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Grid time of the session's first row
    pub window_start: DateTime<Utc>,

    /// Position of this sequence within its session
    pub index: usize,

    /// Grid time of the first row
    pub start: DateTime<Utc>,

    /// Feature columns, all of the same length
    pub features: BTreeMap<String, Vec<Value>>,
}

impl Sequence {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.features.values().next().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.features.get(name).map(Vec::as_slice)
    }
}

/// Number of sequences of `length` rows, `shift` rows apart, in `rows` rows.
pub fn sequence_count(rows: usize, length: usize, shift: usize) -> usize {
    if length == 0 || shift == 0 || rows < length {
        return 0;
    }
    (rows - length) / shift + 1
}

/// Lazily extracted sequences of one session.
///
/// Sequence `i` holds grid rows `[i * shift, i * shift + length)`.
#[derive(Debug, Clone)]
pub struct Sequences {
    grid: ResampledGrid,
    category: Option<String>,
    length: usize,
    shift: usize,
    next: usize,
    count: usize,
}

impl Sequences {
    pub fn new(grid: ResampledGrid, category: Option<String>, length: usize, shift: usize) -> Self {
        let count = sequence_count(grid.rows(), length, shift);
        Self {
            grid,
            category,
            length,
            shift,
            next: 0,
            count,
        }
    }

    pub fn empty() -> Self {
        Self::new(ResampledGrid::default(), None, 1, 1)
    }

    /// The grid sequences are drawn from.
    pub fn grid(&self) -> &ResampledGrid {
        &self.grid
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }
}

impl Iterator for Sequences {
    type Item = Sequence;

    fn next(&mut self) -> Option<Sequence> {
        if self.next >= self.count {
            return None;
        }

        let index = self.next;
        let first = index * self.shift;
        self.next += 1;

        Some(Sequence {
            category: self.category.clone(),
            window_start: self.grid.index[0],
            index,
            start: self.grid.index[first],
            features: self.grid.slice(first..first + self.length),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Sequences {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn grid(rows: usize) -> ResampledGrid {
        let origin = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        ResampledGrid {
            index: (0..rows)
                .map(|i| origin + Duration::seconds(i as i64))
                .collect(),
            columns: BTreeMap::from([(
                "v".to_string(),
                (0..rows).map(|i| Value::Int(i as i64)).collect(),
            )]),
        }
    }

    #[test]
    fn test_sequence_count() {
        assert_eq!(sequence_count(5, 3, 1), 3);
        assert_eq!(sequence_count(5, 3, 2), 2);
        assert_eq!(sequence_count(5, 5, 1), 1);
        assert_eq!(sequence_count(2, 3, 1), 0);
        assert_eq!(sequence_count(10, 4, 3), 3);
    }

    #[test]
    fn test_windows_of_rows() {
        let sequences: Vec<Sequence> = Sequences::new(grid(5), Some("A".into()), 3, 1).collect();

        assert_eq!(sequences.len(), 3);
        for (i, seq) in sequences.iter().enumerate() {
            assert_eq!(seq.index, i);
            assert_eq!(seq.len(), 3);
            assert_eq!(seq.category.as_deref(), Some("A"));
            assert_eq!(
                seq.column("v").unwrap(),
                &[
                    Value::Int(i as i64),
                    Value::Int(i as i64 + 1),
                    Value::Int(i as i64 + 2)
                ]
            );
        }
        assert_eq!(sequences[2].start, grid(5).index[2]);
        assert!(sequences.iter().all(|s| s.window_start == grid(5).index[0]));
    }

    #[test]
    fn test_shift_skips_rows() {
        let starts: Vec<Value> = Sequences::new(grid(7), None, 2, 3)
            .map(|s| s.features["v"][0].clone())
            .collect();
        assert_eq!(starts, vec![Value::Int(0), Value::Int(3)]);
    }

    #[test]
    fn test_short_session_yields_nothing() {
        let mut sequences = Sequences::new(grid(2), None, 3, 1);
        assert_eq!(sequences.len(), 0);
        assert!(sequences.next().is_none());
        assert_eq!(Sequences::empty().count(), 0);
    }

    #[test]
    fn test_exact_size() {
        let mut sequences = Sequences::new(grid(6), None, 2, 2);
        assert_eq!(sequences.len(), 3);
        sequences.next();
        assert_eq!(sequences.len(), 2);
    }
}
