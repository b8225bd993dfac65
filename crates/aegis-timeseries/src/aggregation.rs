//! Aegis Time Series Aggregation
//!
//! Bucketed aggregation used by rollups and range queries. Raw samples expand
//! every value into six slots (first, last, min, max, sum, count); already
//! aggregated samples are re-aggregated slot by slot. Whole segments lying
//! inside one bucket are folded from their stored summaries without decoding.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::duration::RangeGroup;
use crate::reader::{SegmentOrValues, TimeSeriesReader};
use crate::segment::ValueSummary;
use crate::types::TimeSeriesEntry;
use aegis_common::utils::from_millis;
use aegis_common::Result;
use aegis_storage::TableReader;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Aggregation Types
// =============================================================================

/// Whether the input series holds raw samples or rollup output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationMode {
    FromRaw,
    FromAggregated,
}

/// One output slot of a rollup, in stored order, or the aggregate a range
/// query asks for. `Average` is never a rollup slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationType {
    First,
    Last,
    Min,
    Max,
    Sum,
    Count,
    Average,
}

impl AggregationType {
    pub const ALL: [AggregationType; 6] = [
        AggregationType::First,
        AggregationType::Last,
        AggregationType::Min,
        AggregationType::Max,
        AggregationType::Sum,
        AggregationType::Count,
    ];

    /// Slots produced per raw value.
    pub const SLOTS: usize = 6;

    /// Slot type of the `index`-th value of an aggregated sample.
    pub fn of_slot(index: usize) -> Self {
        Self::ALL[index % Self::SLOTS]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregationType::First => "first",
            AggregationType::Last => "last",
            AggregationType::Min => "min",
            AggregationType::Max => "max",
            AggregationType::Sum => "sum",
            AggregationType::Count => "count",
            AggregationType::Average => "avg",
        }
    }

    /// Timestamp reported for a bucket `[start, end)`.
    pub fn timestamp_of_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            AggregationType::First => start,
            AggregationType::Average => start + (end - start) / 2,
            _ => end,
        }
    }

    /// Final value of one column from its six rollup slots.
    fn select(&self, slots: &[f64]) -> f64 {
        let slot = |kind: AggregationType| {
            Self::ALL
                .iter()
                .position(|k| *k == kind)
                .and_then(|i| slots.get(i).copied())
                .unwrap_or(f64::NAN)
        };
        match self {
            AggregationType::Average => {
                let count = slot(AggregationType::Count);
                if count > 0.0 {
                    slot(AggregationType::Sum) / count
                } else {
                    f64::NAN
                }
            }
            kind => slot(*kind),
        }
    }

    fn initial(&self) -> f64 {
        match self {
            AggregationType::Sum | AggregationType::Count => 0.0,
            _ => f64::NAN,
        }
    }

    /// Fold `value` into `slot`.
    fn fold(&self, slot: &mut f64, value: f64) {
        match self {
            AggregationType::First => {
                if slot.is_nan() {
                    *slot = value;
                }
            }
            AggregationType::Last => *slot = value,
            AggregationType::Min => {
                if slot.is_nan() || value < *slot {
                    *slot = value;
                }
            }
            AggregationType::Max => {
                if slot.is_nan() || value > *slot {
                    *slot = value;
                }
            }
            // an average accumulates its sum until the bucket closes
            AggregationType::Sum | AggregationType::Count | AggregationType::Average => {
                if slot.is_nan() {
                    *slot = 0.0;
                }
                *slot += value;
            }
        }
    }
}

// =============================================================================
// Aggregation State
// =============================================================================

/// Running aggregate of one bucket.
#[derive(Debug, Clone)]
pub struct TimeSeriesAggregation {
    mode: AggregationMode,
    values: Vec<f64>,
    any: bool,
}

impl TimeSeriesAggregation {
    pub fn new(mode: AggregationMode) -> Self {
        Self {
            mode,
            values: Vec::new(),
            any: false,
        }
    }

    pub fn mode(&self) -> AggregationMode {
        self.mode
    }

    /// True once the bucket has seen at least one sample.
    pub fn any(&self) -> bool {
        self.any
    }

    /// Grow the slot vector to cover `width` input values.
    fn ensure_width(&mut self, width: usize) {
        let slots = match self.mode {
            AggregationMode::FromRaw => width * AggregationType::SLOTS,
            AggregationMode::FromAggregated => width,
        };
        while self.values.len() < slots {
            let kind = AggregationType::of_slot(self.values.len());
            self.values.push(kind.initial());
        }
    }

    /// Fold one live sample.
    pub fn step(&mut self, values: &[f64]) {
        self.ensure_width(values.len());
        self.any = true;

        for (i, value) in values.iter().enumerate() {
            if value.is_nan() {
                continue;
            }
            match self.mode {
                AggregationMode::FromRaw => {
                    let base = i * AggregationType::SLOTS;
                    for (offset, kind) in AggregationType::ALL.iter().enumerate() {
                        let input = match kind {
                            AggregationType::Count => 1.0,
                            _ => *value,
                        };
                        kind.fold(&mut self.values[base + offset], input);
                    }
                }
                AggregationMode::FromAggregated => {
                    AggregationType::of_slot(i).fold(&mut self.values[i], *value);
                }
            }
        }
    }

    /// Fold a whole segment through its per-value summaries.
    pub fn segment(&mut self, summary: &[ValueSummary]) {
        self.ensure_width(summary.len());

        for (i, column) in summary.iter().enumerate() {
            if column.count == 0 {
                continue;
            }
            self.any = true;
            match self.mode {
                AggregationMode::FromRaw => {
                    let base = i * AggregationType::SLOTS;
                    for (offset, kind) in AggregationType::ALL.iter().enumerate() {
                        let input = match kind {
                            AggregationType::First => column.first,
                            AggregationType::Last => column.last,
                            AggregationType::Min => column.min,
                            AggregationType::Max => column.max,
                            AggregationType::Sum | AggregationType::Average => column.sum,
                            AggregationType::Count => column.count as f64,
                        };
                        kind.fold(&mut self.values[base + offset], input);
                    }
                }
                AggregationMode::FromAggregated => {
                    let kind = AggregationType::of_slot(i);
                    // aggregated count slots are summed
                    let input = match kind {
                        AggregationType::First => column.first,
                        AggregationType::Last => column.last,
                        AggregationType::Min => column.min,
                        AggregationType::Max => column.max,
                        AggregationType::Sum | AggregationType::Count | AggregationType::Average => {
                            column.sum
                        }
                    };
                    kind.fold(&mut self.values[i], input);
                }
            }
        }
    }

    /// Take the bucket values and reset for the next bucket.
    pub fn take(&mut self) -> Vec<f64> {
        self.any = false;
        std::mem::take(&mut self.values)
    }
}

// =============================================================================
// Bucketed Read
// =============================================================================

/// One closed bucket `[start_ms, end_ms)` with its slot values.
struct Bucket {
    start_ms: i64,
    end_ms: i64,
    values: Vec<f64>,
}

/// Bucket cursor over a time-ordered stream of samples.
struct Buckets<'r> {
    range: &'r RangeGroup,
    start_ms: i64,
    next_ms: i64,
    aggregation: TimeSeriesAggregation,
    closed: Vec<Bucket>,
}

impl Buckets<'_> {
    /// Close the current bucket when `timestamp_ms` falls past it.
    fn move_to(&mut self, timestamp_ms: i64) {
        if timestamp_ms < self.next_ms {
            return;
        }
        self.flush();
        self.start_ms = self.range.range_start(timestamp_ms);
        self.next_ms = self.range.next_range_start(self.start_ms);
    }

    fn flush(&mut self) {
        if self.aggregation.any() {
            self.closed.push(Bucket {
                start_ms: self.start_ms,
                end_ms: self.next_ms,
                values: self.aggregation.take(),
            });
        }
    }
}

fn aggregate_buckets<R: TableReader>(
    reader: &TimeSeriesReader<'_, R>,
    range: &RangeGroup,
    mode: AggregationMode,
) -> Result<Vec<Bucket>> {
    let mut buckets = Buckets {
        range,
        start_ms: i64::MIN,
        next_ms: i64::MIN,
        aggregation: TimeSeriesAggregation::new(mode),
        closed: Vec::new(),
    };

    for item in reader.segments_or_values() {
        match item? {
            SegmentOrValues::Segment(segment) => {
                if segment.segment.number_of_live_entries() == 0 {
                    continue;
                }
                buckets.move_to(segment.start_ms());
                if segment.end_ms() < buckets.next_ms {
                    buckets.aggregation.segment(segment.summary());
                    continue;
                }
                for (timestamp_ms, entry) in segment.samples()? {
                    if !entry.is_live() {
                        continue;
                    }
                    buckets.move_to(timestamp_ms);
                    buckets.aggregation.step(&entry.values);
                }
            }
            SegmentOrValues::Values(values) => {
                for entry in values {
                    buckets.move_to(entry.timestamp_millis());
                    buckets.aggregation.step(&entry.values);
                }
            }
        }
    }

    buckets.flush();
    Ok(buckets.closed)
}

/// Aggregate the window of `reader` into buckets of `range`. Each bucket
/// yields one sample stamped one millisecond before the next bucket starts.
pub fn get_aggregated_values<R: TableReader>(
    reader: &TimeSeriesReader<'_, R>,
    range: &RangeGroup,
    mode: AggregationMode,
) -> Result<Vec<TimeSeriesEntry>> {
    Ok(aggregate_buckets(reader, range, mode)?
        .into_iter()
        .map(|bucket| TimeSeriesEntry::new(from_millis(bucket.end_ms - 1), bucket.values))
        .collect())
}

/// Aggregate the raw window of `reader` into buckets of `range`, keeping one
/// `kind` value per column. Buckets are stamped by
/// [`AggregationType::timestamp_of_range`].
pub fn get_aggregated_values_by_type<R: TableReader>(
    reader: &TimeSeriesReader<'_, R>,
    range: &RangeGroup,
    kind: AggregationType,
) -> Result<Vec<TimeSeriesEntry>> {
    Ok(aggregate_buckets(reader, range, AggregationMode::FromRaw)?
        .into_iter()
        .map(|bucket| {
            let values = bucket
                .values
                .chunks(AggregationType::SLOTS)
                .map(|slots| kind.select(slots))
                .collect();
            let timestamp =
                kind.timestamp_of_range(from_millis(bucket.start_ms), from_millis(bucket.end_ms));
            TimeSeriesEntry::new(timestamp, values)
        })
        .collect())
}

// =============================================================================
// Tests
// =============================================================================
