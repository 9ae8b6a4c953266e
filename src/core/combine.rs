//! Per-session aggregation into sequences.
//!
//! Aggregation follows the four-phase combine protocol of dataflow engines:
//! accumulators are created empty, receive inputs, may be merged in any
//! grouping or order, and are finally turned into output. Because merging
//! only concatenates rows and extraction sorts them deterministically, the
//! output does not depend on how the runtime partitioned a session.

use crate::config::SequencerConfig;
use crate::core::grid::{resample, ScalarRow};
use crate::core::policy::ResolvedPolicies;
use crate::core::sequence::Sequences;
use crate::core::windowing::TimestampedEvent;
use crate::error::{Result, SequencerError};
use crate::event::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// The four-phase combine protocol.
pub trait CombineFn {
    type Input;
    type Accumulator;
    type Output;
    type Error;

    fn create_accumulator(&self) -> Self::Accumulator;

    fn add_input(&self, accumulator: Self::Accumulator, input: Self::Input) -> Self::Accumulator;

    /// Merge partial accumulators. Must be associative and commutative.
    fn merge_accumulators<I>(&self, accumulators: I) -> Self::Accumulator
    where
        I: IntoIterator<Item = Self::Accumulator>;

    fn extract_output(
        &self,
        accumulator: Self::Accumulator,
    ) -> std::result::Result<Self::Output, Self::Error>;

    /// Combine a complete set of inputs in one pass.
    fn apply<I>(&self, inputs: I) -> std::result::Result<Self::Output, Self::Error>
    where
        I: IntoIterator<Item = Self::Input>,
    {
        let accumulator = inputs
            .into_iter()
            .fold(self.create_accumulator(), |acc, input| self.add_input(acc, input));
        self.extract_output(accumulator)
    }
}

/// Rows collected for one session, in no particular order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionBuffer {
    pub rows: Vec<TimestampedEvent>,
}

impl SessionBuffer {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Turns the events of one session into its sequences.
#[derive(Debug, Clone)]
pub struct SequenceCombine {
    config: Arc<SequencerConfig>,
    policies: Arc<ResolvedPolicies>,
}

impl SequenceCombine {
    pub fn new(config: Arc<SequencerConfig>, policies: Arc<ResolvedPolicies>) -> Self {
        Self { config, policies }
    }

    pub fn policies(&self) -> &ResolvedPolicies {
        &self.policies
    }

    fn sorted_rows(&self, rows: Vec<TimestampedEvent>) -> Result<Vec<ScalarRow>> {
        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row
                .event
                .into_cells()
                .into_iter()
                .map(|(feature, cell)| {
                    let value = cell.into_scalar(&feature)?;
                    Ok((feature, value))
                })
                .collect::<Result<BTreeMap<String, Value>>>()?;
            let canonical = serde_json::to_string(&values)?;
            keyed.push((
                canonical,
                ScalarRow {
                    timestamp: row.timestamp,
                    values,
                },
            ));
        }

        keyed.sort_by(|(a_key, a), (b_key, b)| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a_key.cmp(b_key))
        });
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }

    fn category_of(&self, rows: &[ScalarRow]) -> Result<Option<String>> {
        let Some(column) = self.config.category_column.as_deref() else {
            return Ok(None);
        };

        rows.first()
            .and_then(|row| row.values.get(column))
            .and_then(Value::to_text)
            .map(Some)
            .ok_or_else(|| SequencerError::MissingColumn(column.to_string()))
    }
}

impl CombineFn for SequenceCombine {
    type Input = TimestampedEvent;
    type Accumulator = SessionBuffer;
    type Output = Sequences;
    type Error = SequencerError;

    fn create_accumulator(&self) -> SessionBuffer {
        SessionBuffer::default()
    }

    fn add_input(&self, mut accumulator: SessionBuffer, input: TimestampedEvent) -> SessionBuffer {
        accumulator.rows.push(input);
        accumulator
    }

    fn merge_accumulators<I>(&self, accumulators: I) -> SessionBuffer
    where
        I: IntoIterator<Item = SessionBuffer>,
    {
        let rows = accumulators.into_iter().flat_map(|acc| acc.rows).collect();
        SessionBuffer { rows }
    }

    fn extract_output(&self, accumulator: SessionBuffer) -> Result<Sequences> {
        if accumulator.is_empty() {
            return Ok(Sequences::empty());
        }

        let event_count = accumulator.len();
        let rows = self.sorted_rows(accumulator.rows)?;
        let category = self.category_of(&rows)?;

        let mut grid = resample(&rows, self.config.resampling_rate_ms(), &self.policies)?;
        grid.fill(&self.policies)?;
        grid.attach_required(
            &self.config.timestamp_column,
            &self.config.epoch_column(),
            self.config
                .category_column
                .as_deref()
                .zip(category.as_deref()),
        );
        grid.sort_by_index();

        let sequences = Sequences::new(
            grid,
            category,
            self.config.sequence_length,
            self.config.sequence_shift,
        );
        debug!(
            events = event_count,
            rows = sequences.grid().rows(),
            sequences = sequences.len(),
            category = sequences.category().unwrap_or("-"),
            "Session resampled"
        );

        Ok(sequences)
    }
}
