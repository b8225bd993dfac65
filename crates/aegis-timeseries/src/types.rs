//! Aegis Time Series Types
//!
//! Core data types for time series storage, replication feeds and reads.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::segment::EntryStatus;
use aegis_common::Etag;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Time Series Entry
// =============================================================================

/// A single timestamped sample of one or more values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEntry {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<f64>,
    pub tag: Option<String>,
    #[serde(default)]
    pub status: EntryStatus,
}

impl TimeSeriesEntry {
    pub fn new(timestamp: DateTime<Utc>, values: Vec<f64>) -> Self {
        Self {
            timestamp,
            values,
            tag: None,
            status: EntryStatus::Live,
        }
    }

    pub fn single(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self::new(timestamp, vec![value])
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn is_live(&self) -> bool {
        self.status == EntryStatus::Live
    }

    /// The first value, or NaN for an empty sample.
    pub fn value(&self) -> f64 {
        self.values.first().copied().unwrap_or(f64::NAN)
    }
}

// =============================================================================
// Replication Items
// =============================================================================

/// A whole stored segment, as shipped by the segment change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentItem {
    pub document_id: String,
    pub name: String,
    pub collection: String,
    pub baseline: DateTime<Utc>,
    pub change_vector: String,
    pub etag: Etag,
    pub segment: Bytes,
}

/// A deletion tombstone, as shipped by the deleted-range change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedRangeItem {
    pub document_id: String,
    pub name: String,
    pub collection: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub change_vector: String,
    pub etag: Etag,
}

// =============================================================================
// Requests
// =============================================================================

/// Inclusive range of one series to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRangeRequest {
    pub document_id: String,
    pub collection: String,
    pub name: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DeletionRangeRequest {
    pub fn new(
        document_id: impl Into<String>,
        collection: impl Into<String>,
        name: impl Into<String>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            collection: collection.into(),
            name: name.into(),
            from,
            to,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Live sample count and bounds of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesStats {
    pub count: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SeriesStats {
    pub fn empty() -> Self {
        Self {
            count: 0,
            start: DateTime::<Utc>::MAX_UTC,
            end: DateTime::<Utc>::MIN_UTC,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builders() {
        let now = Utc::now();
        let entry = TimeSeriesEntry::single(now, 42.5).with_tag("watches/fitbit");
        assert_eq!(entry.value(), 42.5);
        assert_eq!(entry.tag.as_deref(), Some("watches/fitbit"));
        assert!(entry.is_live());
        assert_eq!(entry.timestamp_millis(), now.timestamp_millis());
        assert!(TimeSeriesEntry::new(now, vec![]).value().is_nan());
    }

    #[test]
    fn test_entry_json_defaults_to_live() {
        let json = r#"{"timestamp":"2024-01-01T00:00:00Z","values":[1.0],"tag":null}"#;
        let entry: TimeSeriesEntry = serde_json::from_str(json).expect("parse");
        assert_eq!(entry.status, EntryStatus::Live);
    }

    #[test]
    fn test_empty_stats() {
        let stats = SeriesStats::empty();
        assert_eq!(stats.count, 0);
        assert!(stats.start > stats.end);
    }
}
