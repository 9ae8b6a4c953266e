//! Keying, timestamping and session windowing.
//!
//! Every event gets a grouping key (its category, or a shared default
//! group) and a UTC timestamp. Events of the same key are grouped into
//! session windows: two consecutive events share a window iff the gap
//! between them is at most the gap threshold.

use crate::error::{Result, SequencerError};
use crate::event::{Event, Value};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Key shared by all events when no category column is configured.
pub const DEFAULT_CATEGORY: &str = "__default__";

/// Layout of formatted grid timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f UTC";

/// Grouping key of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn default_group() -> Self {
        Self(DEFAULT_CATEGORY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_CATEGORY
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Assign the grouping key of an event.
pub fn add_key(event: &Event, category_column: Option<&str>) -> Result<GroupKey> {
    let Some(column) = category_column else {
        return Ok(GroupKey::default_group());
    };

    event
        .scalar(column)?
        .and_then(Value::to_text)
        .map(GroupKey)
        .ok_or_else(|| SequencerError::MissingColumn(column.to_string()))
}

/// Parse the configured timestamp column of an event.
pub fn add_timestamp(event: &Event, column: &str, tz: Tz) -> Result<DateTime<Utc>> {
    match event.scalar(column)? {
        Some(value) if !value.is_missing() => parse_timestamp(value, tz),
        _ => Err(SequencerError::MissingColumn(column.to_string())),
    }
}

/// Parse a cell into an absolute UTC instant.
///
/// Text goes through [`parse_timestamp_str`]; numbers are epoch seconds.
pub fn parse_timestamp(value: &Value, tz: Tz) -> Result<DateTime<Utc>> {
    let invalid = |reason: &str| SequencerError::Timestamp {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    match value {
        Value::Text(s) => parse_timestamp_str(s, tz),
        Value::Int(secs) => Utc
            .timestamp_opt(*secs, 0)
            .single()
            .ok_or_else(|| invalid("epoch seconds out of range")),
        Value::Float(secs) if secs.is_finite() => Utc
            .timestamp_millis_opt((secs * 1000.0).round() as i64)
            .single()
            .ok_or_else(|| invalid("epoch seconds out of range")),
        _ => Err(invalid("expected text or epoch seconds")),
    }
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S%.f",
    "%Y%m%dT%H%M%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d"];

const UTC_SUFFIXES: &[&str] = &[" UTC", " GMT", " Z", "Z"];

/// Parse a timestamp string.
///
/// Accepts RFC 3339, RFC 2822, explicit offsets, a trailing `UTC`/`GMT`
/// zone name and common naive layouts. Naive values are interpreted in `tz`.
pub fn parse_timestamp_str(raw: &str, tz: Tz) -> Result<DateTime<Utc>> {
    let s = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for suffix in UTC_SUFFIXES {
        if let Some(naive) = s.strip_suffix(suffix).and_then(parse_naive) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Some(naive) = parse_naive(s) {
        return match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => Err(SequencerError::Timestamp {
                value: raw.to_string(),
                reason: format!("local time does not exist in {tz}"),
            }),
        };
    }

    Err(SequencerError::Timestamp {
        value: raw.to_string(),
        reason: "unrecognised date/time format".to_string(),
    })
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Format a grid timestamp.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Seconds since the Unix epoch, at millisecond precision.
pub fn epoch_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

/// An event together with its parsed timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl TimestampedEvent {
    pub fn new(timestamp: DateTime<Utc>, event: Event) -> Self {
        Self { timestamp, event }
    }
}

/// A session window of same-key events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWindow {
    /// Grouping key shared by all events
    pub key: GroupKey,
    /// Timestamp of the earliest event
    pub start: DateTime<Utc>,
    /// Timestamp of the latest event
    pub end: DateTime<Utc>,
    /// Events in arrival order
    pub events: Vec<TimestampedEvent>,
}

impl SessionWindow {
    /// Create a singleton window.
    pub fn new(key: GroupKey, event: TimestampedEvent) -> Self {
        Self {
            key,
            start: event.timestamp,
            end: event.timestamp,
            events: vec![event],
        }
    }

    /// Whether an event at `timestamp` belongs to this window.
    ///
    /// Bounds beyond the representable time range are open.
    pub fn accepts(&self, timestamp: DateTime<Utc>, gap_threshold: Duration) -> bool {
        let after_start = self
            .start
            .checked_sub_signed(gap_threshold)
            .map_or(true, |lower| timestamp >= lower);
        let before_end = self
            .end
            .checked_add_signed(gap_threshold)
            .map_or(true, |upper| timestamp <= upper);
        after_start && before_end
    }

    /// Whether no event at or after `watermark` can join this window.
    pub fn is_closed_by(&self, watermark: DateTime<Utc>, gap_threshold: Duration) -> bool {
        self.end
            .checked_add_signed(gap_threshold)
            .is_some_and(|upper| upper < watermark)
    }

    /// Add an event to this window.
    pub fn push(&mut self, event: TimestampedEvent) {
        self.start = self.start.min(event.timestamp);
        self.end = self.end.max(event.timestamp);
        self.events.push(event);
    }

    /// Merge another window of the same key into this one.
    pub fn absorb(&mut self, other: SessionWindow) {
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
        self.events.extend(other.events);
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the duration of this window in seconds.
    pub fn duration_secs(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }
}

/// Session window function with a fixed gap threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sessions {
    gap_threshold: Duration,
}

impl Sessions {
    pub fn new(gap_threshold: Duration) -> Self {
        Self { gap_threshold }
    }

    pub fn gap_threshold(&self) -> Duration {
        self.gap_threshold
    }

    /// Group a finite batch of keyed events into windows.
    pub fn assign<I>(&self, events: I) -> Vec<SessionWindow>
    where
        I: IntoIterator<Item = (GroupKey, TimestampedEvent)>,
    {
        let mut manager = WindowManager::new(self.gap_threshold);
        for (key, event) in events {
            manager.process_event(key, event);
        }
        manager.flush();
        manager.take_completed_windows()
    }
}

/// Manages open session windows for incremental ingestion.
///
/// Watermarks are tracked per key, so a key whose events arrive behind
/// another key's never has its windows closed early.
pub struct WindowManager {
    /// Gap threshold for session boundaries
    gap_threshold: Duration,
    /// Open windows per key, ordered by start
    open: HashMap<GroupKey, Vec<SessionWindow>>,
    /// Completed windows ready for processing
    completed: Vec<SessionWindow>,
    /// Latest watermark seen per key
    watermarks: HashMap<GroupKey, DateTime<Utc>>,
}

impl WindowManager {
    pub fn new(gap_threshold: Duration) -> Self {
        Self {
            gap_threshold,
            open: HashMap::new(),
            completed: Vec::new(),
            watermarks: HashMap::new(),
        }
    }

    /// Process an incoming keyed event.
    ///
    /// The event joins every open window of its key within the gap
    /// threshold; if it bridges several windows they are merged.
    pub fn process_event(&mut self, key: GroupKey, event: TimestampedEvent) {
        let gap = self.gap_threshold;

        if let Some(&watermark) = self.watermarks.get(&key) {
            let late = event
                .timestamp
                .checked_add_signed(gap)
                .is_some_and(|reach| reach < watermark);
            if late {
                warn!(key = %key, timestamp = %event.timestamp, "Late event behind watermark opens a new window");
            }
        }

        let windows = self.open.entry(key.clone()).or_default();
        let (matching, mut rest): (Vec<_>, Vec<_>) = std::mem::take(windows)
            .into_iter()
            .partition(|w| w.accepts(event.timestamp, gap));

        let mut merged = SessionWindow::new(key, event);
        for window in matching {
            merged.absorb(window);
        }

        let pos = rest.partition_point(|w| w.start < merged.start);
        rest.insert(pos, merged);
        *windows = rest;
    }

    /// Complete every window of `key` that can no longer grow.
    ///
    /// Assumes no future event of `key` is older than `watermark`. Other
    /// keys are left untouched.
    pub fn advance_watermark(&mut self, key: &GroupKey, watermark: DateTime<Utc>) {
        let watermark = match self.watermarks.get(key) {
            Some(&current) => current.max(watermark),
            None => watermark,
        };
        self.watermarks.insert(key.clone(), watermark);

        let gap = self.gap_threshold;
        let Some(windows) = self.open.get_mut(key) else {
            return;
        };
        let (done, open): (Vec<_>, Vec<_>) = std::mem::take(windows)
            .into_iter()
            .partition(|w| w.is_closed_by(watermark, gap));
        self.completed.extend(done);

        if open.is_empty() {
            self.open.remove(key);
        } else {
            *windows = open;
        }
    }

    /// Watermark of a key, if one was ever advanced.
    pub fn watermark(&self, key: &GroupKey) -> Option<DateTime<Utc>> {
        self.watermarks.get(key).copied()
    }

    /// Force completion of all open windows.
    pub fn flush(&mut self) {
        for (_, windows) in self.open.drain() {
            self.completed.extend(windows);
        }
    }

    /// Get and remove completed windows, ordered by key then start.
    pub fn take_completed_windows(&mut self) -> Vec<SessionWindow> {
        let mut windows = std::mem::take(&mut self.completed);
        windows.sort_by(|a, b| a.key.cmp(&b.key).then(a.start.cmp(&b.start)));
        windows
    }

    pub fn has_completed_windows(&self) -> bool {
        !self.completed.is_empty()
    }

    pub fn completed_window_count(&self) -> usize {
        self.completed.len()
    }

    pub fn open_window_count(&self) -> usize {
        self.open.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        parse_timestamp_str(s, Tz::UTC).unwrap()
    }

    fn keyed(key: &str, ts: &str) -> (GroupKey, TimestampedEvent) {
        (
            GroupKey::new(key),
            TimestampedEvent::new(at(ts), Event::new().with("ts", ts)),
        )
    }

    #[test]
    fn test_add_key() {
        let event = Event::new()
            .with_list("cat", vec![Value::Text("A".into())])
            .with("id", 7i64);

        assert_eq!(add_key(&event, Some("cat")).unwrap(), GroupKey::new("A"));
        assert_eq!(add_key(&event, Some("id")).unwrap(), GroupKey::new("7"));
        assert!(add_key(&event, None).unwrap().is_default());
        assert!(matches!(
            add_key(&event, Some("absent")),
            Err(SequencerError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_parse_formats() {
        let expected = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        for raw in [
            "2021-03-04T05:06:07Z",
            "2021-03-04T07:06:07+02:00",
            "2021-03-04 05:06:07",
            "2021-03-04 05:06:07 UTC",
            "2021/03/04 05:06:07",
            "03/04/2021 05:06:07",
            "Thu, 04 Mar 2021 05:06:07 +0000",
        ] {
            assert_eq!(parse_timestamp_str(raw, Tz::UTC).unwrap(), expected, "{raw}");
        }

        let midnight = Utc.with_ymd_and_hms(2021, 3, 4, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp_str("2021-03-04", Tz::UTC).unwrap(), midnight);
        assert_eq!(
            parse_timestamp(&Value::Int(midnight.timestamp()), Tz::UTC).unwrap(),
            midnight
        );
        assert!(parse_timestamp_str("not a date", Tz::UTC).is_err());
        assert!(parse_timestamp(&Value::Bool(true), Tz::UTC).is_err());
    }

    #[test]
    fn test_naive_timestamps_use_source_timezone() {
        let parsed = parse_timestamp_str("2021-07-01 12:00:00", Tz::Europe__Berlin).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2021, 7, 1, 10, 0, 0).unwrap());

        // An explicit offset wins over the source time zone.
        let parsed = parse_timestamp_str("2021-07-01T12:00:00Z", Tz::Europe__Berlin).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2021, 7, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_format_round_trip_keeps_milliseconds() {
        let ts = Utc.timestamp_millis_opt(1_614_834_367_123).unwrap();
        let formatted = format_timestamp(ts);
        assert_eq!(formatted, "2021-03-04 05:06:07.123000 UTC");
        assert_eq!(parse_timestamp_str(&formatted, Tz::UTC).unwrap(), ts);
        assert_eq!(epoch_seconds(ts), 1_614_834_367.123);
    }

    #[test]
    fn test_sessions_split_on_gap() {
        let sessions = Sessions::new(Duration::milliseconds(60_000));
        let windows = sessions.assign(vec![
            keyed("A", "2021-01-01T00:00:00Z"),
            keyed("A", "2021-01-01T00:00:30Z"),
            keyed("A", "2021-01-01T00:02:00Z"),
        ]);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].event_count(), 2);
        assert_eq!(windows[0].start, at("2021-01-01T00:00:00Z"));
        assert_eq!(windows[0].end, at("2021-01-01T00:00:30Z"));
        assert_eq!(windows[1].event_count(), 1);
        assert_eq!(windows[1].start, at("2021-01-01T00:02:00Z"));
    }

    #[test]
    fn test_gap_boundary_is_inclusive() {
        let sessions = Sessions::new(Duration::milliseconds(60_000));
        let windows = sessions.assign(vec![
            keyed("A", "2021-01-01T00:00:00Z"),
            keyed("A", "2021-01-01T00:01:00Z"),
            keyed("A", "2021-01-01T00:02:00.001Z"),
        ]);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].event_count(), 2);
    }

    #[test]
    fn test_keys_never_merge() {
        let sessions = Sessions::new(Duration::milliseconds(60_000));
        let windows = sessions.assign(vec![
            keyed("A", "2021-01-01T00:00:00Z"),
            keyed("B", "2021-01-01T00:00:01Z"),
            keyed("A", "2021-01-01T00:00:02Z"),
        ]);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].key, GroupKey::new("A"));
        assert_eq!(windows[0].event_count(), 2);
        assert_eq!(windows[1].key, GroupKey::new("B"));
    }

    #[test]
    fn test_out_of_order_event_bridges_windows() {
        let sessions = Sessions::new(Duration::milliseconds(60_000));
        let windows = sessions.assign(vec![
            keyed("A", "2021-01-01T00:00:00Z"),
            keyed("A", "2021-01-01T00:01:40Z"),
            keyed("A", "2021-01-01T00:00:50Z"),
        ]);

        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].event_count(), 3);
        assert_eq!(windows[0].duration_secs(), 100.0);
    }

    #[test]
    fn test_watermark_completes_idle_windows() {
        let mut manager = WindowManager::new(Duration::milliseconds(60_000));
        let (key, event) = keyed("A", "2021-01-01T00:00:00Z");
        manager.process_event(key.clone(), event);

        manager.advance_watermark(&key, at("2021-01-01T00:01:00Z"));
        assert!(!manager.has_completed_windows());
        assert_eq!(manager.open_window_count(), 1);

        manager.advance_watermark(&key, at("2021-01-01T00:01:00.001Z"));
        assert_eq!(manager.completed_window_count(), 1);
        assert_eq!(manager.open_window_count(), 0);
        assert_eq!(manager.take_completed_windows().len(), 1);
        assert!(!manager.has_completed_windows());
    }

    #[test]
    fn test_watermark_of_one_key_leaves_others_open() {
        let gap = Duration::milliseconds(2000);
        let mut manager = WindowManager::new(gap);

        for (key, ts) in [
            ("A", "2021-01-01T00:01:40Z"),
            ("A", "2021-01-01T00:01:41Z"),
        ] {
            let (key, event) = keyed(key, ts);
            manager.process_event(key.clone(), event);
            manager.advance_watermark(&key, at(ts) - Duration::seconds(10));
        }

        // B lags far behind A, yet its events still form one session.
        for ts in ["2021-01-01T00:00:00Z", "2021-01-01T00:00:01Z"] {
            let (key, event) = keyed("B", ts);
            manager.process_event(key.clone(), event);
            manager.advance_watermark(&key, at(ts) - Duration::seconds(10));
        }

        assert!(!manager.has_completed_windows());
        assert_eq!(manager.open_window_count(), 2);
        assert_eq!(
            manager.watermark(&GroupKey::new("A")),
            Some(at("2021-01-01T00:01:31Z"))
        );

        manager.flush();
        let windows = manager.take_completed_windows();
        assert_eq!(windows.len(), 2);
        assert!(windows.iter().all(|w| w.event_count() == 2));
    }

    #[test]
    fn test_huge_gap_threshold_does_not_overflow() {
        let gap = Duration::milliseconds(crate::config::MAX_INTERVAL_MS as i64);
        let latest = DateTime::<Utc>::MAX_UTC;
        let earlier = latest - Duration::days(1);

        let window = SessionWindow::new(
            GroupKey::new("A"),
            TimestampedEvent::new(latest, Event::new()),
        );
        assert!(window.accepts(earlier, gap));
        assert!(!window.is_closed_by(latest, gap));

        let sessions = Sessions::new(gap);
        let windows = sessions.assign(vec![
            (GroupKey::new("A"), TimestampedEvent::new(earlier, Event::new())),
            (GroupKey::new("A"), TimestampedEvent::new(latest, Event::new())),
        ]);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].event_count(), 2);
    }
}
