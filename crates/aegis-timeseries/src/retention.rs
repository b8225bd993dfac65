//! Aegis Time Series Retention
//!
//! Purging of samples older than the retention of their policy. Candidates
//! come from the statistics index (series of one policy whose first live
//! sample precedes the cutoff); series still waiting for a rollup that covers
//! the cutoff are left alone until the rollup ran.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::rollup::TimeSeriesRollups;
use crate::slicer::SeriesSlice;
use crate::stats::SeriesStatsStore;
use crate::storage::TimeSeriesStorage;
use crate::tables::StatsRow;
use aegis_common::utils::min_millis;
use aegis_common::Result;
use aegis_storage::{TableReader, WriteTransaction};

// =============================================================================
// Candidate Selection
// =============================================================================

/// Up to `take` series of `policy` in `collection` holding samples before
/// `cutoff_ms` and not waiting for a rollup due by then.
pub fn series_to_retain(
    tx: &impl TableReader,
    rollups: &TimeSeriesRollups,
    collection: &str,
    policy: &str,
    cutoff_ms: i64,
    take: usize,
) -> Result<Vec<StatsRow>> {
    let mut result = Vec::new();
    for stats in SeriesStatsStore::series_starting_before(tx, collection, policy, cutoff_ms)? {
        if result.len() >= take {
            break;
        }
        let key = SeriesSlice::new(
            stats.document_id.as_str(),
            stats.name.as_str(),
            stats.collection.as_str(),
        )
        .key();
        if rollups.has_pending_rollup_from(tx, &key, cutoff_ms)? {
            continue;
        }
        result.push(stats);
    }
    Ok(result)
}

// =============================================================================
// Retention Command
// =============================================================================

/// Removes `[MIN, to]` from a batch of series in one write transaction.
pub struct TimeSeriesRetentionCommand {
    series: Vec<StatsRow>,
    to_ms: i64,
}

impl TimeSeriesRetentionCommand {
    pub fn new(series: Vec<StatsRow>, to_ms: i64) -> Self {
        Self { series, to_ms }
    }

    /// Run the batch. Returns the number of series that lost samples.
    pub fn execute(&self, storage: &TimeSeriesStorage, tx: &mut WriteTransaction<'_>) -> Result<usize> {
        let mut retained = 0;
        for stats in &self.series {
            let slice = SeriesSlice::new(
                stats.document_id.as_str(),
                stats.name.as_str(),
                stats.collection.as_str(),
            );
            if storage
                .remove_range_millis(tx, &slice, min_millis(), self.to_ms, None)?
                .is_some()
            {
                retained += 1;
            }
        }
        if retained > 0 {
            tracing::debug!(
                "retention removed samples before {} from {} series",
                self.to_ms,
                retained
            );
        }
        Ok(retained)
    }
}

// =============================================================================
// Tests
// =============================================================================
