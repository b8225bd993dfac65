//! Aegis Time Series Reader
//!
//! Range reads over the stored segments of one series. The reader works on
//! any snapshot (read or write transaction) and decodes segments lazily as the
//! caller iterates.
//!
//! Key Features:
//! - Live samples of an inclusive time window
//! - Whole-segment summaries where a segment lies fully inside the window
//! - Window summary (count, min, max) and first segment change vector
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::segment::{SegmentEntry, TimeSeriesSegment, ValueSummary};
use crate::slicer::{baseline_of, segment_key_from_prefix, series_prefix};
use crate::tables::{SegmentRow, SEGMENTS_TABLE};
use crate::types::TimeSeriesEntry;
use aegis_common::utils::from_millis;
use aegis_common::{Etag, Result};
use aegis_storage::{Table, TableReader};
use chrono::{DateTime, Duration, Utc};

// =============================================================================
// Read Results
// =============================================================================

/// One stored segment intersecting the window.
#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub key: Vec<u8>,
    pub baseline_ms: i64,
    pub etag: Etag,
    pub change_vector: String,
    pub segment: TimeSeriesSegment,
}

impl SegmentResult {
    pub fn start_ms(&self) -> i64 {
        self.baseline_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.segment.last_timestamp(self.baseline_ms)
    }

    pub fn summary(&self) -> &[ValueSummary] {
        self.segment.summary()
    }

    /// Decoded samples with absolute timestamps (ms), dead ones included.
    pub fn samples(&self) -> Result<Vec<(i64, SegmentEntry)>> {
        self.segment
            .enumerate()
            .map(|entry| entry.map(|e| (self.baseline_ms + e.offset_ms, e)))
            .collect()
    }
}

/// A segment consumable as a whole, or the live samples of a partial one.
#[derive(Debug, Clone)]
pub enum SegmentOrValues {
    Segment(SegmentResult),
    Values(Vec<TimeSeriesEntry>),
}

/// Aggregate of the live samples in a window.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
    pub count: u64,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

// =============================================================================
// Reader
// =============================================================================

/// Reads one series over an inclusive window.
pub struct TimeSeriesReader<'a, R: TableReader> {
    tx: &'a R,
    prefix: Vec<u8>,
    from_ms: i64,
    to_ms: i64,
    offset: Option<Duration>,
}

impl<'a, R: TableReader> TimeSeriesReader<'a, R> {
    pub fn new(
        tx: &'a R,
        document_id: &str,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: Option<Duration>,
    ) -> Self {
        Self::with_millis(
            tx,
            document_id,
            name,
            from.timestamp_millis(),
            to.timestamp_millis(),
            offset,
        )
    }

    pub fn with_millis(
        tx: &'a R,
        document_id: &str,
        name: &str,
        from_ms: i64,
        to_ms: i64,
        offset: Option<Duration>,
    ) -> Self {
        Self {
            tx,
            prefix: series_prefix(document_id, name),
            from_ms,
            to_ms,
            offset,
        }
    }

    fn table(&self) -> Option<&'a Table> {
        self.tx.table(SEGMENTS_TABLE)
    }

    fn to_entry(&self, timestamp_ms: i64, entry: SegmentEntry) -> TimeSeriesEntry {
        let timestamp = from_millis(timestamp_ms);
        TimeSeriesEntry {
            timestamp: self.offset.map_or(timestamp, |o| timestamp + o),
            values: entry.values,
            tag: entry.tag.map(|t| String::from_utf8_lossy(&t).into_owned()),
            status: entry.status,
        }
    }

    // -------------------------------------------------------------------------
    // Segments
    // -------------------------------------------------------------------------

    /// Segments intersecting the window, in baseline order.
    pub fn segments(&self) -> Box<dyn Iterator<Item = Result<SegmentResult>> + '_> {
        let table = match self.table() {
            Some(table) => table,
            None => return Box::new(std::iter::empty()),
        };
        if self.from_ms > self.to_ms {
            return Box::new(std::iter::empty());
        }

        let from_key = segment_key_from_prefix(&self.prefix, self.from_ms);
        let start = table
            .seek_backward(&self.prefix, &from_key)
            .map(|(key, _)| key.to_vec())
            .unwrap_or(from_key);
        let (from_ms, to_ms) = (self.from_ms, self.to_ms);

        Box::new(
            table
                .seek_forward(&self.prefix, &start)
                .map_while(move |(key, row)| {
                    let baseline_ms = baseline_of(key)?;
                    (baseline_ms <= to_ms).then(|| (key, row, baseline_ms))
                })
                .filter_map(move |(key, row, baseline_ms)| {
                    let result = SegmentRow::from_row(row).and_then(|stored| {
                        Ok(SegmentResult {
                            key: key.to_vec(),
                            baseline_ms,
                            etag: stored.etag,
                            segment: stored.segment()?,
                            change_vector: stored.change_vector,
                        })
                    });
                    match result {
                        Ok(segment) if segment.end_ms() < from_ms => None,
                        other => Some(other),
                    }
                }),
        )
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    /// Live samples inside the window, in timestamp order.
    pub fn all_values(&self) -> Box<dyn Iterator<Item = Result<TimeSeriesEntry>> + '_> {
        Box::new(self.segments().flat_map(move |segment| {
            let entries: Vec<Result<TimeSeriesEntry>> = match segment.and_then(|s| s.samples()) {
                Ok(samples) => samples
                    .into_iter()
                    .filter(|(ts, e)| e.is_live() && *ts >= self.from_ms && *ts <= self.to_ms)
                    .map(|(ts, e)| Ok(self.to_entry(ts, e)))
                    .collect(),
                Err(e) => vec![Err(e)],
            };
            entries
        }))
    }

    pub fn values(&self) -> Result<Vec<TimeSeriesEntry>> {
        self.all_values().collect()
    }

    pub fn first(&self) -> Result<Option<TimeSeriesEntry>> {
        self.all_values().next().transpose()
    }

    pub fn any(&self) -> Result<bool> {
        Ok(self.first()?.is_some())
    }

    pub fn last(&self) -> Result<Option<TimeSeriesEntry>> {
        let mut last = None;
        for entry in self.all_values() {
            last = Some(entry?);
        }
        Ok(last)
    }

    /// Whole segments where they lie inside the window, samples otherwise.
    pub fn segments_or_values(&self) -> Box<dyn Iterator<Item = Result<SegmentOrValues>> + '_> {
        Box::new(self.segments().map(move |segment| {
            let segment = segment?;
            if segment.start_ms() >= self.from_ms
                && segment.end_ms() <= self.to_ms
                && self.offset.is_none()
            {
                return Ok(SegmentOrValues::Segment(segment));
            }
            let values = segment
                .samples()?
                .into_iter()
                .filter(|(ts, e)| e.is_live() && *ts >= self.from_ms && *ts <= self.to_ms)
                .map(|(ts, e)| self.to_entry(ts, e))
                .collect();
            Ok(SegmentOrValues::Values(values))
        }))
    }

    // -------------------------------------------------------------------------
    // Summaries
    // -------------------------------------------------------------------------

    /// Count, min and max per value over the live samples of the window.
    pub fn get_summary(&self) -> Result<Option<SeriesSummary>> {
        let mut summary: Option<SeriesSummary> = None;
        for item in self.segments_or_values() {
            match item? {
                SegmentOrValues::Segment(segment) => {
                    let live = segment.segment.number_of_live_entries() as u64;
                    if live == 0 {
                        continue;
                    }
                    let current = summary.get_or_insert_with(|| SeriesSummary::new(0));
                    current.count += live;
                    for (i, column) in segment.summary().iter().enumerate() {
                        if column.count > 0 {
                            current.fold(i, column.min);
                            current.fold(i, column.max);
                        }
                    }
                }
                SegmentOrValues::Values(values) => {
                    for entry in values {
                        let current = summary.get_or_insert_with(|| SeriesSummary::new(0));
                        current.count += 1;
                        for (i, value) in entry.values.iter().enumerate() {
                            current.fold(i, *value);
                        }
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Change vector of the first segment holding a live sample in the window.
    pub fn first_segment_change_vector(&self) -> Result<Option<String>> {
        for segment in self.segments() {
            let segment = segment?;
            let has_live = segment
                .samples()?
                .iter()
                .any(|(ts, e)| e.is_live() && *ts >= self.from_ms && *ts <= self.to_ms);
            if has_live {
                return Ok(Some(segment.change_vector));
            }
        }
        Ok(None)
    }
}

impl SeriesSummary {
    fn new(width: usize) -> Self {
        Self {
            count: 0,
            min: vec![f64::NAN; width],
            max: vec![f64::NAN; width],
        }
    }

    fn fold(&mut self, index: usize, value: f64) {
        if value.is_nan() {
            return;
        }
        if index >= self.min.len() {
            self.min.resize(index + 1, f64::NAN);
            self.max.resize(index + 1, f64::NAN);
        }
        if self.min[index].is_nan() || value < self.min[index] {
            self.min[index] = value;
        }
        if self.max[index].is_nan() || value > self.max[index] {
            self.max[index] = value;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::EntryStatus;
    use aegis_storage::StorageEnvironment;

    fn store(env: &StorageEnvironment, baseline_ms: i64, samples: &[(i64, f64, EntryStatus)]) {
        let mut segment = TimeSeriesSegment::initialize(1).expect("initialize");
        for (ts, value, status) in samples {
            assert!(segment.append(ts - baseline_ms, &[*value], None, *status));
        }
        let row = SegmentRow::new("users/1", "HR", "Users", Etag(baseline_ms), "A:1-db".into(), &segment);
        env.write(|tx| {
            tx.table_mut(SEGMENTS_TABLE).insert(
                segment_key_from_prefix(&series_prefix("users/1", "HR"), baseline_ms),
                row.to_row()?,
            );
            Ok(())
        })
        .expect("write");
    }

    fn setup() -> StorageEnvironment {
        let env = StorageEnvironment::new();
        store(
            &env,
            1_000,
            &[(1_000, 1.0, EntryStatus::Live), (1_500, 2.0, EntryStatus::Dead), (2_000, 3.0, EntryStatus::Live)],
        );
        store(
            &env,
            5_000,
            &[(5_000, 10.0, EntryStatus::Live), (6_000, -4.0, EntryStatus::Live)],
        );
        env
    }

    #[test]
    fn test_window_reads() {
        let env = setup();
        let read = env.read();

        let all = TimeSeriesReader::with_millis(&read, "users/1", "hr", i64::MIN, i64::MAX, None)
            .values()
            .expect("values");
        let stamps: Vec<i64> = all.iter().map(|e| e.timestamp_millis()).collect();
        assert_eq!(stamps, vec![1_000, 2_000, 5_000, 6_000]);

        let middle = TimeSeriesReader::with_millis(&read, "users/1", "hr", 1_200, 5_000, None)
            .values()
            .expect("values");
        assert_eq!(middle.len(), 2);
        assert_eq!(middle[0].value(), 3.0);

        let gap = TimeSeriesReader::with_millis(&read, "users/1", "hr", 2_500, 4_000, None);
        assert!(!gap.any().expect("any"));
    }

    #[test]
    fn test_segments_or_values() {
        let env = setup();
        let read = env.read();
        let reader = TimeSeriesReader::with_millis(&read, "users/1", "hr", 1_500, 7_000, None);
        let items: Vec<_> = reader
            .segments_or_values()
            .collect::<Result<Vec<_>>>()
            .expect("items");

        assert!(matches!(&items[0], SegmentOrValues::Values(v) if v.len() == 1));
        assert!(matches!(&items[1], SegmentOrValues::Segment(s) if s.baseline_ms == 5_000));
    }

    #[test]
    fn test_summary_and_change_vector() {
        let env = setup();
        let read = env.read();
        let reader = TimeSeriesReader::with_millis(&read, "users/1", "hr", 0, 10_000, None);
        let summary = reader.get_summary().expect("summary").expect("some");
        assert_eq!(summary.count, 4);
        assert_eq!(summary.min, vec![-4.0]);
        assert_eq!(summary.max, vec![10.0]);
        assert_eq!(
            reader.first_segment_change_vector().expect("cv").as_deref(),
            Some("A:1-db")
        );

        let empty = TimeSeriesReader::with_millis(&read, "users/2", "hr", 0, 10_000, None);
        assert!(empty.get_summary().expect("summary").is_none());
    }

    #[test]
    fn test_offset_shifts_timestamps() {
        let env = setup();
        let read = env.read();
        let reader =
            TimeSeriesReader::with_millis(&read, "users/1", "hr", 0, 1_000, Some(Duration::hours(2)));
        let first = reader.first().expect("first").expect("some");
        assert_eq!(first.timestamp_millis(), 1_000 + 2 * 3_600_000);
    }
}
