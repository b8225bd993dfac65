//! Aegis Time Series Tables
//!
//! Table names and row layouts used by the time-series core. Rows are
//! serialized with bincode; segment rows carry a CRC32 of the encoded
//! segment so corruption is detected on read.
//!
//! Key Features:
//! - Segment rows indexed by etag for the replication feed
//! - Tombstone rows indexed by etag
//! - Per-collection statistics rows indexed by first live timestamp
//! - Pending rollup rows indexed by due time
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::segment::TimeSeriesSegment;
use aegis_common::utils::{crc32, verify_crc32};
use aegis_common::{AegisError, Etag, Result};
use aegis_storage::Row;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// =============================================================================
// Table Names
// =============================================================================

/// Segments of every series.
pub const SEGMENTS_TABLE: &str = "TimeSeries";

/// Deletion tombstones of every series.
pub const DELETED_RANGES_TABLE: &str = "DeletedRanges";

/// Pending rollups, keyed by series.
pub const ROLLUPS_TABLE: &str = "TimeSeriesRollups";

/// Documents owning the series.
pub const DOCUMENTS_TABLE: &str = "Documents";

const STATS_TABLE_PREFIX: &str = "TimeSeriesStats/";
const PENDING_DELETION_TABLE_PREFIX: &str = "TimeSeriesPendingDeletion/";

/// Per-collection series statistics.
pub fn stats_table(collection: &str) -> String {
    format!("{}{}", STATS_TABLE_PREFIX, collection.to_lowercase())
}

/// Names of every statistics table.
pub fn stats_table_prefix() -> &'static str {
    STATS_TABLE_PREFIX
}

/// Per-collection list of drained segments awaiting purge.
pub fn pending_deletion_table(collection: &str) -> String {
    format!("{}{}", PENDING_DELETION_TABLE_PREFIX, collection.to_lowercase())
}

// =============================================================================
// Row Codec
// =============================================================================

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| AegisError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| AegisError::Serialization(e.to_string()))
}

// =============================================================================
// Segment Row
// =============================================================================

/// A stored segment and its replication metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRow {
    pub document_id: String,
    pub name: String,
    pub collection: String,
    pub etag: Etag,
    pub change_vector: String,
    pub checksum: u32,
    pub segment: Vec<u8>,
}

impl SegmentRow {
    pub fn new(
        document_id: &str,
        name: &str,
        collection: &str,
        etag: Etag,
        change_vector: String,
        segment: &TimeSeriesSegment,
    ) -> Self {
        let bytes = segment.to_bytes();
        Self {
            document_id: document_id.to_string(),
            name: name.to_string(),
            collection: collection.to_string(),
            etag,
            change_vector,
            checksum: crc32(&bytes),
            segment: bytes,
        }
    }

    /// Decode the segment, verifying its checksum.
    pub fn segment(&self) -> Result<TimeSeriesSegment> {
        if !verify_crc32(&self.segment, self.checksum) {
            return Err(AegisError::Corruption(format!(
                "checksum mismatch in segment of {}/{}",
                self.document_id, self.name
            )));
        }
        TimeSeriesSegment::from_bytes(&self.segment)
    }

    pub fn to_row(&self) -> Result<Row> {
        Ok(Row::indexed(encode(self)?, self.etag.0))
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        decode(&row.value)
    }
}

// =============================================================================
// Deleted Range Row
// =============================================================================

/// A persisted deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRangeRow {
    pub document_id: String,
    pub name: String,
    pub collection: String,
    pub etag: Etag,
    pub change_vector: String,
    pub from_ms: i64,
    pub to_ms: i64,
}

impl DeletedRangeRow {
    pub fn to_row(&self) -> Result<Row> {
        Ok(Row::indexed(encode(self)?, self.etag.0))
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        decode(&row.value)
    }

    pub fn covers(&self, timestamp_ms: i64) -> bool {
        self.from_ms <= timestamp_ms && timestamp_ms <= self.to_ms
    }
}

// =============================================================================
// Stats Row
// =============================================================================

/// Live count and bounds of one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRow {
    pub document_id: String,
    pub name: String,
    pub collection: String,
    /// Lowercased policy name, the raw policy name for raw series.
    pub policy: String,
    pub count: u64,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl StatsRow {
    pub fn to_row(&self) -> Result<Row> {
        Ok(Row::indexed(encode(self)?, self.start_ms))
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        decode(&row.value)
    }
}

// =============================================================================
// Rollup Row
// =============================================================================

/// A series scheduled for aggregation into its next policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupRow {
    pub document_id: String,
    pub name: String,
    pub collection: String,
    pub policy_to_apply: String,
    pub next_rollup_ms: i64,
    pub etag: Etag,
    pub change_vector: String,
}

impl RollupRow {
    pub fn to_row(&self) -> Result<Row> {
        Ok(Row::indexed(encode(self)?, self.next_rollup_ms))
    }

    pub fn from_row(row: &Row) -> Result<Self> {
        decode(&row.value)
    }
}

// =============================================================================
// Tests
// =============================================================================
