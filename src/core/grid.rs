//! Uniform time grid construction.
//!
//! A session's rows are projected onto bins of `rate_ms` milliseconds. Bins
//! are aligned to midnight UTC of the session's first day, closed on the
//! left and labelled by their start. Every bin between the first and the
//! last observation is kept, even when no feature was observed in it.

use crate::core::policy::ResolvedPolicies;
use crate::core::windowing::{epoch_seconds, format_timestamp};
use crate::error::{Result, SequencerError};
use crate::event::Value;
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// One session row after cell unwrapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarRow {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, Value>,
}

/// A uniform, column-oriented time series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResampledGrid {
    /// Bin start of every row
    pub index: Vec<DateTime<Utc>>,
    /// One column per feature, each as long as the index
    pub columns: BTreeMap<String, Vec<Value>>,
}

impl ResampledGrid {
    pub fn rows(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.index.first().copied()
    }

    /// Sort rows by time, ascending.
    pub fn sort_by_index(&mut self) {
        if self.index.windows(2).all(|w| w[0] <= w[1]) {
            return;
        }

        let mut order: Vec<usize> = (0..self.index.len()).collect();
        order.sort_by_key(|&i| self.index[i]);

        self.index = order.iter().map(|&i| self.index[i]).collect();
        for column in self.columns.values_mut() {
            *column = order.iter().map(|&i| column[i].clone()).collect();
        }
    }

    /// Copy a contiguous range of rows out of every column.
    pub fn slice(&self, rows: Range<usize>) -> BTreeMap<String, Vec<Value>> {
        self.columns
            .iter()
            .map(|(name, column)| (name.clone(), column[rows.clone()].to_vec()))
            .collect()
    }

    /// Fill missing grid points per feature with the resolved filling method.
    pub fn fill(&mut self, policies: &ResolvedPolicies) -> Result<()> {
        for (feature, column) in self.columns.iter_mut() {
            if let Some(method) = policies.get(feature).and_then(|p| p.fill.as_ref()) {
                method.fill(column, feature)?;
            }
        }
        Ok(())
    }

    /// Add the category column and both timestamp representations.
    pub fn attach_required(
        &mut self,
        timestamp_column: &str,
        epoch_column: &str,
        category: Option<(&str, &str)>,
    ) {
        let rows = self.rows();

        if let Some((column, value)) = category {
            self.columns
                .insert(column.to_string(), vec![Value::Text(value.to_string()); rows]);
        }

        self.columns.insert(
            timestamp_column.to_string(),
            self.index
                .iter()
                .map(|ts| Value::Text(format_timestamp(*ts)))
                .collect(),
        );
        self.columns.insert(
            epoch_column.to_string(),
            self.index
                .iter()
                .map(|ts| Value::Float(epoch_seconds(*ts)))
                .collect(),
        );
    }
}

fn origin_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&ts.date_naive().and_time(NaiveTime::MIN))
}

fn bin_offset(ts: DateTime<Utc>, origin: DateTime<Utc>, rate_ms: i64) -> i64 {
    (ts - origin).num_milliseconds().div_euclid(rate_ms)
}

/// Resample rows onto a grid with one column per resolved feature.
///
/// Features without a value in the session become all-missing columns
/// before aggregation. Every column is coerced to the output type of its
/// resampling method.
pub fn resample(rows: &[ScalarRow], rate_ms: i64, policies: &ResolvedPolicies) -> Result<ResampledGrid> {
    let Some(first) = rows.iter().map(|r| r.timestamp).min() else {
        return Ok(ResampledGrid::default());
    };
    let last = rows.iter().map(|r| r.timestamp).max().unwrap_or(first);

    let origin = origin_of(first);
    if rate_ms <= 0 {
        return Err(SequencerError::Config(format!(
            "resampling rate must be positive, got {rate_ms} ms"
        )));
    }
    let first_bin = bin_offset(first, origin, rate_ms);
    let bins = usize::try_from(bin_offset(last, origin, rate_ms) - first_bin + 1).map_err(|_| {
        SequencerError::Config(format!("session cannot be gridded at {rate_ms} ms"))
    })?;

    let index = (0..bins)
        .map(|i| origin + Duration::milliseconds((first_bin + i as i64) * rate_ms))
        .collect();

    let slots: Vec<usize> = rows
        .iter()
        .map(|r| (bin_offset(r.timestamp, origin, rate_ms) - first_bin) as usize)
        .collect();

    let mut columns = BTreeMap::new();
    for (feature, policy) in policies.iter() {
        let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); bins];
        for (row, &slot) in rows.iter().zip(&slots) {
            if let Some(value) = row.values.get(feature) {
                buckets[slot].push(value.clone());
            }
        }

        let column = buckets
            .iter()
            .map(|bucket| {
                let value = policy.resample.aggregate(bucket, feature)?;
                policy.output.coerce(value, feature)
            })
            .collect::<Result<Vec<Value>>>()?;
        columns.insert(feature.to_string(), column);
    }

    Ok(ResampledGrid { index, columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::methods::{FillMethod, MethodSpec};
    use crate::core::policy::{default_table, PolicyEntry, PolicyTable};
    use crate::core::schema::{infer_schema, FeatureSpec};
    use crate::error::SequencerError;
    use serde_json::json;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + Duration::milliseconds(millis)
    }

    fn row(millis: i64, values: &[(&str, Value)]) -> ScalarRow {
        ScalarRow {
            timestamp: at(millis),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    fn policies(overrides: PolicyTable) -> ResolvedPolicies {
        let schema = infer_schema(
            &FeatureSpec::new()
                .with("v", "float32")
                .with("n", "int64")
                .with("label", "string"),
        );
        ResolvedPolicies::resolve(&overrides, &default_table(), &schema, &[]).unwrap()
    }

    #[test]
    fn test_grid_covers_span() {
        let rows = vec![
            row(0, &[("v", Value::Float(1.0))]),
            row(400, &[("v", Value::Float(3.0))]),
            row(4_000, &[("v", Value::Float(5.0))]),
        ];
        let grid = resample(&rows, 1000, &policies(PolicyTable::new())).unwrap();

        assert_eq!(grid.rows(), 5);
        assert_eq!(grid.index[0], at(0));
        assert_eq!(grid.index[4], at(4_000));
        assert_eq!(
            grid.column("v").unwrap(),
            &[
                Value::Float(2.0),
                Value::Missing,
                Value::Missing,
                Value::Missing,
                Value::Float(5.0)
            ]
        );
    }

    #[test]
    fn test_bins_align_to_day_start() {
        let rows = vec![row(1_700, &[("v", Value::Float(1.0))]), row(2_300, &[("v", Value::Float(2.0))])];
        let grid = resample(&rows, 1000, &policies(PolicyTable::new())).unwrap();

        assert_eq!(grid.index, vec![at(1_000), at(2_000)]);
    }

    #[test]
    fn test_absent_feature_is_all_missing() {
        let rows = vec![row(0, &[("v", Value::Float(1.0))]), row(2_000, &[])];
        let grid = resample(&rows, 1000, &policies(PolicyTable::new())).unwrap();

        assert!(grid.column("label").unwrap().iter().all(Value::is_missing));
        assert!(grid.column("n").unwrap().iter().all(Value::is_missing));
    }

    #[test]
    fn test_output_type_coercion() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "v".to_string(),
            PolicyEntry::default().resample(MethodSpec::new("count")),
        );
        overrides.insert(
            "n".to_string(),
            PolicyEntry::default().resample(MethodSpec::new("max")),
        );
        let rows = vec![
            row(0, &[("v", Value::Float(1.5)), ("n", Value::Float(2.0))]),
            row(10, &[("v", Value::Float(2.5)), ("n", Value::Int(7))]),
        ];
        let grid = resample(&rows, 1000, &policies(overrides)).unwrap();

        assert_eq!(grid.column("v").unwrap(), &[Value::Int(2)]);
        assert_eq!(grid.column("n").unwrap(), &[Value::Int(7)]);
    }

    #[test]
    fn test_coercion_failure_is_fatal() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "n".to_string(),
            PolicyEntry::default().resample(MethodSpec::new("last")),
        );
        let rows = vec![row(0, &[("n", Value::Float(2.5))])];

        let err = resample(&rows, 1000, &policies(overrides)).unwrap_err();
        assert!(matches!(err, SequencerError::Coercion { .. }));
    }

    #[test]
    fn test_fill_only_touches_missing_points() {
        let mut overrides = PolicyTable::new();
        overrides.insert(
            "v".to_string(),
            PolicyEntry::default()
                .fill(MethodSpec::new("custom").with_param("custom_value", json!(9.0))),
        );
        let policies = policies(overrides);
        assert_eq!(
            policies.get("v").unwrap().fill,
            Some(FillMethod::Custom(Value::Float(9.0)))
        );

        let rows = vec![
            row(0, &[("v", Value::Float(1.0))]),
            row(2_000, &[("v", Value::Float(3.0))]),
        ];
        let mut grid = resample(&rows, 1000, &policies).unwrap();
        let before = grid.column("v").unwrap().to_vec();
        grid.fill(&policies).unwrap();
        let after = grid.column("v").unwrap();

        for (b, a) in before.iter().zip(after) {
            if !b.is_missing() {
                assert_eq!(a, b);
            }
        }
        assert_eq!(after[1], Value::Float(9.0));
    }

    #[test]
    fn test_attach_required_columns() {
        let rows = vec![row(0, &[("v", Value::Float(1.0))]), row(1_000, &[])];
        let mut grid = resample(&rows, 1000, &policies(PolicyTable::new())).unwrap();
        grid.attach_required("ts", "ts_epoch", Some(("cat", "A")));

        assert_eq!(
            grid.column("cat").unwrap(),
            &[Value::Text("A".into()), Value::Text("A".into())]
        );
        assert_eq!(
            grid.column("ts").unwrap()[1],
            Value::Text("2021-01-01 00:00:01.000000 UTC".into())
        );
        assert_eq!(
            grid.column("ts_epoch").unwrap()[0],
            Value::Float(at(0).timestamp() as f64)
        );
    }

    #[test]
    fn test_sort_by_index() {
        let mut grid = ResampledGrid {
            index: vec![at(2_000), at(0), at(1_000)],
            columns: BTreeMap::from([(
                "v".to_string(),
                vec![Value::Int(2), Value::Int(0), Value::Int(1)],
            )]),
        };
        grid.sort_by_index();

        assert_eq!(grid.index, vec![at(0), at(1_000), at(2_000)]);
        assert_eq!(
            grid.column("v").unwrap(),
            &[Value::Int(0), Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn test_empty_session() {
        let grid = resample(&[], 1000, &policies(PolicyTable::new())).unwrap();
        assert!(grid.is_empty());
    }
}
