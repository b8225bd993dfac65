//! Aegis Time Series - Segmented Time Series Storage
//!
//! Time series attached to documents, stored as compressed segments in the
//! transactional table engine. Provides ordered and out-of-order appends,
//! range deletion with replicated tombstones, whole-segment replication with
//! change-vector arbitration, and a background runner that rolls series up
//! into coarser policies and enforces retention.
//!
//! Key Features:
//! - Compressed segments with per-column summaries
//! - Lazy readers yielding whole segment summaries when a range covers them
//! - Conflict resolution through change vectors and deterministic tie-breaks
//! - Policy chains with calendar-aware aggregation buckets
//! - Retention that waits for pending rollups
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod aggregation;
pub mod database;
pub mod documents;
pub mod duration;
pub mod policy;
pub mod reader;
pub mod retention;
pub mod rollup;
pub mod runner;
pub mod segment;
pub mod slicer;
pub mod stats;
pub mod storage;
pub mod tables;
pub mod types;

pub use aggregation::{
    get_aggregated_values, get_aggregated_values_by_type, AggregationMode, AggregationType,
    TimeSeriesAggregation,
};
pub use database::DocumentDatabase;
pub use documents::{Document, DocumentStore};
pub use duration::{RangeGroup, TimeUnit, TimeValue};
pub use policy::{
    PolicyRef, TimeSeriesCollectionConfiguration, TimeSeriesConfiguration, TimeSeriesPolicy,
    RAW_POLICY_NAME,
};
pub use reader::{SegmentOrValues, SegmentResult, SeriesSummary, TimeSeriesReader};
pub use retention::{series_to_retain, TimeSeriesRetentionCommand};
pub use rollup::{RollupState, RollupTimeSeriesCommand, TimeSeriesRollups};
pub use runner::TimeSeriesPolicyRunner;
pub use segment::{EntryStatus, SegmentEntry, TimeSeriesSegment, ValueSummary};
pub use slicer::SeriesSlice;
pub use storage::TimeSeriesStorage;
pub use types::{DeletedRangeItem, DeletionRangeRequest, SegmentItem, SeriesStats, TimeSeriesEntry};
