//! The standard sequencer: keying, windowing and combining wired together.

use crate::config::SequencerConfig;
use crate::core::combine::{CombineFn, SequenceCombine};
use crate::core::policy::{default_table, ResolvedPolicies};
use crate::core::schema::{infer_schema, FeatureSpec, Schema};
use crate::core::sequence::Sequence;
use crate::core::windowing::{self, GroupKey, Sessions, TimestampedEvent, WindowManager};
use crate::error::Result;
use crate::event::Event;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::info;

/// Builds fixed-length sequences from raw events.
///
/// Policies are resolved once on construction; an invalid configuration
/// fails here rather than while processing data.
#[derive(Debug, Clone)]
pub struct StandardSequencer {
    config: Arc<SequencerConfig>,
    schema: Schema,
    policies: Arc<ResolvedPolicies>,
    timezone: Tz,
}

impl StandardSequencer {
    pub fn new(config: SequencerConfig, features: &FeatureSpec) -> Result<Self> {
        config.validate()?;
        let timezone = config.timezone()?;
        let schema = infer_schema(features);

        let mut excluded = vec![config.timestamp_column.as_str()];
        if let Some(category) = config.category_column.as_deref() {
            excluded.push(category);
        }

        let defaults = config.defaults.clone().unwrap_or_else(default_table);
        let policies = ResolvedPolicies::resolve(&config.overwrite, &defaults, &schema, &excluded)?;

        info!(
            features = policies.len(),
            declared = schema.len(),
            rate_ms = config.resampling_rate_ms(),
            gap_ms = config.gap_threshold.as_millis() as u64,
            "Sequencer initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            schema,
            policies: Arc::new(policies),
            timezone,
        })
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn policies(&self) -> &ResolvedPolicies {
        &self.policies
    }

    /// Grouping key of an event.
    pub fn add_key(&self, event: &Event) -> Result<GroupKey> {
        windowing::add_key(event, self.config.category_column.as_deref())
    }

    /// Parsed UTC timestamp of an event.
    pub fn add_timestamp(&self, event: &Event) -> Result<DateTime<Utc>> {
        windowing::add_timestamp(event, &self.config.timestamp_column, self.timezone)
    }

    /// Key and timestamp an event.
    pub fn prepare(&self, event: Event) -> Result<(GroupKey, TimestampedEvent)> {
        let key = self.add_key(&event)?;
        let timestamp = self.add_timestamp(&event)?;
        Ok((key, TimestampedEvent::new(timestamp, event)))
    }

    /// Session window function.
    pub fn window(&self) -> Sessions {
        Sessions::new(self.config.gap_threshold_chrono())
    }

    /// Window manager for incremental ingestion.
    pub fn window_manager(&self) -> WindowManager {
        WindowManager::new(self.config.gap_threshold_chrono())
    }

    /// Per-session aggregation function.
    pub fn combine_fn(&self) -> SequenceCombine {
        SequenceCombine::new(Arc::clone(&self.config), Arc::clone(&self.policies))
    }

    /// Sequence a finite batch of events on the calling thread.
    ///
    /// Sequences are returned grouped by session, sessions ordered by key
    /// then start time.
    pub fn process_batch<I>(&self, events: I) -> Result<Vec<Sequence>>
    where
        I: IntoIterator<Item = Event>,
    {
        let keyed = events
            .into_iter()
            .map(|event| self.prepare(event))
            .collect::<Result<Vec<_>>>()?;

        let combine = self.combine_fn();
        let mut sequences = Vec::new();
        for window in self.window().assign(keyed) {
            sequences.extend(combine.apply(window.events)?);
        }
        Ok(sequences)
    }
}
