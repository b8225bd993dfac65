//! Aegis Time Series Storage
//!
//! Transactional storage of multi-value series packed into segments. All
//! mutating operations run inside a caller supplied write transaction and
//! keep segments, statistics, document metadata, tombstones and pending
//! rollups consistent with each other.
//!
//! Key Features:
//! - Out-of-order and backfilled appends with segment split and merge
//! - Deterministic tie-break between local and replicated samples
//! - Range deletion with replicated tombstones
//! - Whole-segment replication with change vector arbitration
//! - Etag ordered change feeds for segments and deleted ranges
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::database::DocumentDatabase;
use crate::documents::DocumentStore;
use crate::reader::TimeSeriesReader;
use crate::rollup::TimeSeriesRollups;
use crate::segment::{
    EntryStatus, TimeSeriesSegment, MAX_NUMBER_OF_VALUES, MAX_SEGMENT_SIZE, MAX_TAG_LENGTH,
};
use crate::slicer::{
    baseline_of, deleted_range_key, document_prefix, segment_key_from_prefix, validate_document_id,
    SeriesSlice,
};
use crate::stats::{policy_of, SeriesStatsStore};
use crate::tables::{
    pending_deletion_table, stats_table, DeletedRangeRow, SegmentRow, StatsRow,
    DELETED_RANGES_TABLE, ROLLUPS_TABLE, SEGMENTS_TABLE,
};
use crate::types::{DeletedRangeItem, DeletionRangeRequest, SegmentItem, SeriesStats, TimeSeriesEntry};
use aegis_common::utils::{eq_ignore_case, from_millis, max_millis, min_millis};
use aegis_common::{AegisError, Etag, Result};
use aegis_replication::{conflict_status, merge_vectors, ConflictStatus};
use aegis_storage::{Row, TableReader, WriteTransaction};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::sync::Arc;

// =============================================================================
// Internal Types
// =============================================================================

/// A sample with an absolute timestamp, as written into segments.
#[derive(Debug, Clone, PartialEq)]
struct Sample {
    timestamp_ms: i64,
    values: Vec<f64>,
    tag: Option<Vec<u8>>,
    status: EntryStatus,
}

/// Bookkeeping of one mutating call on one series.
struct SeriesWrite<'s> {
    slice: &'s SeriesSlice,
    prefix: Vec<u8>,
    remote: Option<&'s str>,
    live_delta: i64,
    change_vector: Option<String>,
}

impl<'s> SeriesWrite<'s> {
    fn new(slice: &'s SeriesSlice, remote: Option<&'s str>) -> Self {
        Self {
            prefix: slice.prefix(),
            slice,
            remote,
            live_delta: 0,
            change_vector: None,
        }
    }
}

fn corrupt_key(key: &[u8]) -> AegisError {
    AegisError::Corruption(format!("malformed segment key {:?}", key))
}

fn segment_item(key: &[u8], stored: SegmentRow) -> Result<SegmentItem> {
    stored.segment()?;
    let baseline_ms = baseline_of(key).ok_or_else(|| corrupt_key(key))?;
    Ok(SegmentItem {
        document_id: stored.document_id,
        name: stored.name,
        collection: stored.collection,
        baseline: from_millis(baseline_ms),
        change_vector: stored.change_vector,
        etag: stored.etag,
        segment: Bytes::from(stored.segment),
    })
}

fn append_sample(segment: &mut TimeSeriesSegment, baseline_ms: i64, sample: &Sample) -> bool {
    segment.append(
        sample.timestamp_ms - baseline_ms,
        &sample.values,
        sample.tag.as_deref(),
        sample.status,
    )
}

// =============================================================================
// Time Series Storage
// =============================================================================

/// Time-series storage of one database.
pub struct TimeSeriesStorage {
    db: Arc<DocumentDatabase>,
    rollups: TimeSeriesRollups,
}

impl TimeSeriesStorage {
    pub fn new(db: Arc<DocumentDatabase>) -> Self {
        Self {
            rollups: TimeSeriesRollups::new(Arc::clone(&db)),
            db,
        }
    }

    pub fn database(&self) -> &Arc<DocumentDatabase> {
        &self.db
    }

    pub fn rollups(&self) -> &TimeSeriesRollups {
        &self.rollups
    }

    /// Reader over `[from, to]` of one series.
    pub fn get_reader<'a, R: TableReader>(
        &self,
        tx: &'a R,
        document_id: &str,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: Option<Duration>,
    ) -> TimeSeriesReader<'a, R> {
        TimeSeriesReader::new(tx, document_id, name, from, to, offset)
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Append samples to a series. Local writes require the document to
    /// exist and reject NaN; replicated writes carry the remote change vector.
    /// Returns the change vector of the last written segment.
    pub fn append_timestamp(
        &self,
        tx: &mut WriteTransaction<'_>,
        document_id: &str,
        collection: &str,
        name: &str,
        entries: impl IntoIterator<Item = TimeSeriesEntry>,
        change_vector_from_replication: Option<&str>,
    ) -> Result<Option<String>> {
        let allow_nan = change_vector_from_replication.is_some();
        self.append_internal(
            tx,
            &SeriesSlice::new(document_id, name, collection),
            entries.into_iter().collect(),
            change_vector_from_replication,
            allow_nan,
        )
    }

    /// Append rollup output. Aggregates may legitimately be NaN.
    pub(crate) fn append_aggregated(
        &self,
        tx: &mut WriteTransaction<'_>,
        slice: &SeriesSlice,
        entries: Vec<TimeSeriesEntry>,
    ) -> Result<Option<String>> {
        self.append_internal(tx, slice, entries, None, true)
    }

    fn append_internal(
        &self,
        tx: &mut WriteTransaction<'_>,
        slice: &SeriesSlice,
        entries: Vec<TimeSeriesEntry>,
        remote: Option<&str>,
        allow_nan: bool,
    ) -> Result<Option<String>> {
        validate_document_id(&slice.document_id)?;
        validate_name(&slice.name)?;
        for entry in &entries {
            validate_entry(slice, entry, allow_nan)?;
        }
        if remote.is_none() && !DocumentStore::exists(&*tx, &slice.document_id) {
            return Err(AegisError::NotFound(format!(
                "cannot append to time series '{}' of missing document '{}'",
                slice.name, slice.document_id
            )));
        }

        let mut samples = prepare_samples(entries, remote.is_some());
        if samples.is_empty() {
            return Ok(None);
        }

        let mut write = SeriesWrite::new(slice, remote);
        if let Some(remote) = remote {
            self.db.observe_change_vector(remote)?;
            self.suppress_deleted(&*tx, &write.prefix, remote, &mut samples)?;
        }

        let mut position = 0;
        while position < samples.len() {
            let timestamp_ms = samples[position].timestamp_ms;
            let seek_key = segment_key_from_prefix(&write.prefix, timestamp_ms);

            let (holder, next_baseline) = {
                let table = tx.table(SEGMENTS_TABLE);
                let holder = match table.and_then(|t| t.seek_backward(&write.prefix, &seek_key)) {
                    Some((key, row)) => Some((key.to_vec(), SegmentRow::from_row(row)?)),
                    None => None,
                };
                let next_baseline = table
                    .and_then(|t| t.seek_after(&write.prefix, &seek_key).next())
                    .map(|(key, _)| baseline_of(key).ok_or_else(|| corrupt_key(key)))
                    .transpose()?
                    .unwrap_or_else(max_millis);
                (holder, next_baseline)
            };

            let end = samples[position..]
                .iter()
                .position(|s| s.timestamp_ms >= next_baseline)
                .map_or(samples.len(), |offset| position + offset);
            let batch = &samples[position..end];

            match holder {
                None => self.write_new_segments(tx, &mut write, batch)?,
                Some((key, row)) => {
                    let baseline_ms = baseline_of(&key).ok_or_else(|| corrupt_key(&key))?;
                    let segment = row.segment()?;
                    if segment.is_empty() || batch[0].timestamp_ms > segment.last_timestamp(baseline_ms)
                    {
                        self.append_in_order(tx, &mut write, key, &row, segment, baseline_ms, batch)?;
                    } else {
                        self.split_segment(tx, &mut write, key, &row, segment, baseline_ms, batch)?;
                    }
                }
            }
            position = end;
        }

        let count = self.update_stats(tx, slice, write.live_delta)?;
        if count > 0 {
            DocumentStore::add_time_series_name(tx, &slice.document_id, &slice.name)?;
        } else {
            DocumentStore::remove_time_series_name(tx, &slice.document_id, &slice.name)?;
        }

        self.rollups
            .mark_for_policy(tx, slice, samples[0].timestamp_ms, EntryStatus::Live)?;

        tracing::trace!(
            "appended {} samples to '{}' of '{}'",
            samples.len(),
            slice.name,
            slice.document_id
        );
        Ok(write.change_vector)
    }

    /// Fast path: every sample lands after the last one of the holder.
    #[allow(clippy::too_many_arguments)]
    fn append_in_order(
        &self,
        tx: &mut WriteTransaction<'_>,
        write: &mut SeriesWrite<'_>,
        key: Vec<u8>,
        row: &SegmentRow,
        segment: TimeSeriesSegment,
        baseline_ms: i64,
        batch: &[Sample],
    ) -> Result<()> {
        let mut updated = segment.clone();
        let mut appended = 0;
        for sample in batch {
            if !append_sample(&mut updated, baseline_ms, sample) {
                break;
            }
            appended += 1;
        }

        if appended > 0 {
            write.live_delta += updated.number_of_live_entries() as i64
                - segment.number_of_live_entries() as i64;
            self.put_segment(tx, write, key, &updated, Some(row.change_vector.as_str()))?;
        }
        if appended < batch.len() {
            self.write_new_segments(tx, write, &batch[appended..])?;
        }
        Ok(())
    }

    /// Slow path: merge the batch into the holder and re-encode.
    #[allow(clippy::too_many_arguments)]
    fn split_segment(
        &self,
        tx: &mut WriteTransaction<'_>,
        write: &mut SeriesWrite<'_>,
        key: Vec<u8>,
        row: &SegmentRow,
        segment: TimeSeriesSegment,
        baseline_ms: i64,
        batch: &[Sample],
    ) -> Result<()> {
        let existing = segment
            .enumerate()
            .map(|entry| {
                entry.map(|e| Sample {
                    timestamp_ms: baseline_ms + e.offset_ms,
                    values: e.values,
                    tag: e.tag,
                    status: e.status,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let merged = merge_samples(existing, batch, write.remote.is_some());
        let outputs = build_segments(&merged, Some((baseline_ms, segment.number_of_values())))?;

        tracing::debug!(
            "splitting segment of '{}' at {} into {} segments",
            write.slice.name,
            baseline_ms,
            outputs.len()
        );

        tx.table_mut(SEGMENTS_TABLE).remove(&key);
        write.live_delta -= segment.number_of_live_entries() as i64;
        for (baseline, output) in outputs {
            write.live_delta += output.number_of_live_entries() as i64;
            let output_key = segment_key_from_prefix(&write.prefix, baseline);
            self.put_segment(tx, write, output_key, &output, Some(row.change_vector.as_str()))?;
        }
        Ok(())
    }

    fn write_new_segments(
        &self,
        tx: &mut WriteTransaction<'_>,
        write: &mut SeriesWrite<'_>,
        samples: &[Sample],
    ) -> Result<()> {
        for (baseline, segment) in build_segments(samples, None)? {
            write.live_delta += segment.number_of_live_entries() as i64;
            let key = segment_key_from_prefix(&write.prefix, baseline);
            self.put_segment(tx, write, key, &segment, None)?;
        }
        Ok(())
    }

    /// Store a segment under a fresh etag.
    fn put_segment(
        &self,
        tx: &mut WriteTransaction<'_>,
        write: &mut SeriesWrite<'_>,
        key: Vec<u8>,
        segment: &TimeSeriesSegment,
        previous_change_vector: Option<&str>,
    ) -> Result<()> {
        let etag = self.db.next_etag();
        let change_vector = match (write.remote, previous_change_vector) {
            (None, _) => self.db.new_change_vector(etag),
            (Some(remote), Some(previous)) => merge_vectors(previous, remote)?,
            (Some(remote), None) => remote.to_string(),
        };

        let slice = write.slice;
        let row = SegmentRow::new(
            &slice.document_id,
            &slice.name,
            &slice.collection,
            etag,
            change_vector.clone(),
            segment,
        );
        if segment.number_of_live_entries() == 0 {
            self.mark_pending_deletion(tx, &slice.collection, etag, &key);
        }
        tx.table_mut(SEGMENTS_TABLE).insert(key, row.to_row()?);
        write.change_vector = Some(change_vector);
        Ok(())
    }

    fn mark_pending_deletion(
        &self,
        tx: &mut WriteTransaction<'_>,
        collection: &str,
        etag: Etag,
        key: &[u8],
    ) {
        tx.table_mut(&pending_deletion_table(collection))
            .insert(etag.to_be_bytes().to_vec(), Row::new(key.to_vec()));
    }

    /// Mark replicated samples covered by a tombstone the remote has not seen.
    fn suppress_deleted(
        &self,
        tx: &impl TableReader,
        prefix: &[u8],
        remote: &str,
        samples: &mut [Sample],
    ) -> Result<()> {
        let tombstones = self.unmerged_tombstones(tx, prefix, remote)?;
        if tombstones.is_empty() {
            return Ok(());
        }
        for sample in samples.iter_mut() {
            if tombstones.iter().any(|t| t.covers(sample.timestamp_ms)) {
                sample.status = EntryStatus::Dead;
            }
        }
        Ok(())
    }

    fn unmerged_tombstones(
        &self,
        tx: &impl TableReader,
        prefix: &[u8],
        remote: &str,
    ) -> Result<Vec<DeletedRangeRow>> {
        let table = match tx.table(DELETED_RANGES_TABLE) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        let mut result = Vec::new();
        for (_, row) in table.prefix(prefix) {
            let tombstone = DeletedRangeRow::from_row(row)?;
            if conflict_status(&tombstone.change_vector, remote)? != ConflictStatus::AlreadyMerged {
                result.push(tombstone);
            }
        }
        Ok(result)
    }

    // -------------------------------------------------------------------------
    // Range Deletion
    // -------------------------------------------------------------------------

    /// Delete the inclusive range of a request. The tombstone is written even
    /// when no stored sample matches. Returns the change vector of the last
    /// rewritten segment.
    pub fn remove_timestamp_range(
        &self,
        tx: &mut WriteTransaction<'_>,
        request: &DeletionRangeRequest,
        remote_change_vector: Option<&str>,
    ) -> Result<Option<String>> {
        let slice = SeriesSlice::new(
            request.document_id.as_str(),
            request.name.as_str(),
            request.collection.as_str(),
        );
        self.remove_range_millis(
            tx,
            &slice,
            request.from.timestamp_millis(),
            request.to.timestamp_millis(),
            remote_change_vector,
        )
    }

    pub(crate) fn remove_range_millis(
        &self,
        tx: &mut WriteTransaction<'_>,
        slice: &SeriesSlice,
        from_ms: i64,
        to_ms: i64,
        remote: Option<&str>,
    ) -> Result<Option<String>> {
        validate_document_id(&slice.document_id)?;
        if from_ms > to_ms {
            return Err(AegisError::InvalidArgument(format!(
                "deletion range of '{}' starts after it ends",
                slice.name
            )));
        }

        let etag = self.db.next_etag();
        let deletion_change_vector = match remote {
            Some(remote) => {
                self.db.observe_change_vector(remote)?;
                remote.to_string()
            }
            None => self.db.new_change_vector(etag),
        };
        let tombstone = DeletedRangeRow {
            document_id: slice.document_id.clone(),
            name: slice.name.clone(),
            collection: slice.collection.clone(),
            etag,
            change_vector: deletion_change_vector.clone(),
            from_ms,
            to_ms,
        };
        tx.table_mut(DELETED_RANGES_TABLE).insert(
            deleted_range_key(&slice.document_id, &slice.name, etag),
            tombstone.to_row()?,
        );

        let mut write = SeriesWrite::new(slice, remote);
        let mut earliest_removed: Option<i64> = None;

        let from_key = segment_key_from_prefix(&write.prefix, from_ms);
        let mut cursor = tx.table(SEGMENTS_TABLE).and_then(|t| {
            t.seek_backward(&write.prefix, &from_key)
                .or_else(|| t.seek_forward(&write.prefix, &from_key).next())
                .map(|(key, _)| key.to_vec())
        });

        while let Some(key) = cursor.take() {
            let baseline_ms = baseline_of(&key).ok_or_else(|| corrupt_key(&key))?;
            if baseline_ms > to_ms {
                break;
            }

            let (stored, next) = {
                let table = tx.table(SEGMENTS_TABLE);
                let stored = match table.and_then(|t| t.get(&key)) {
                    Some(row) => SegmentRow::from_row(row)?,
                    None => break,
                };
                let next = table
                    .and_then(|t| t.seek_after(&write.prefix, &key).next())
                    .map(|(k, _)| k.to_vec());
                (stored, next)
            };

            let segment = stored.segment()?;
            let end_ms = segment.last_timestamp(baseline_ms);

            let untouched = end_ms < from_ms
                || conflict_status(&deletion_change_vector, &stored.change_vector)?
                    == ConflictStatus::AlreadyMerged;
            if !untouched {
                if let Some((rewritten, first_removed)) =
                    delete_from_segment(&segment, baseline_ms, from_ms, to_ms)?
                {
                    write.live_delta += rewritten.number_of_live_entries() as i64
                        - segment.number_of_live_entries() as i64;
                    earliest_removed =
                        Some(earliest_removed.map_or(first_removed, |e: i64| e.min(first_removed)));
                    self.put_segment(tx, &mut write, key, &rewritten, Some(stored.change_vector.as_str()))?;
                }
            }

            if end_ms >= to_ms {
                break;
            }
            cursor = next;
        }

        if let Some(first_removed) = earliest_removed {
            let count = self.update_stats(tx, slice, write.live_delta)?;
            if count == 0 {
                DocumentStore::remove_time_series_name(tx, &slice.document_id, &slice.name)?;
            }
            self.rollups
                .mark_for_policy(tx, slice, first_removed, EntryStatus::Dead)?;
            tracing::debug!(
                "removed {} samples of '{}' in '{}'",
                -write.live_delta,
                slice.name,
                slice.document_id
            );
        }
        Ok(write.change_vector)
    }

    // -------------------------------------------------------------------------
    // Whole-Segment Replication
    // -------------------------------------------------------------------------

    /// Store a replicated segment as is. Returns false when the segment must
    /// instead be applied value by value.
    pub fn try_append_entire_segment(
        &self,
        tx: &mut WriteTransaction<'_>,
        item: &SegmentItem,
    ) -> Result<bool> {
        validate_document_id(&item.document_id)?;
        let slice = SeriesSlice::new(
            item.document_id.as_str(),
            item.name.as_str(),
            item.collection.as_str(),
        );
        let prefix = slice.prefix();
        let baseline_ms = item.baseline.timestamp_millis();
        let key = segment_key_from_prefix(&prefix, baseline_ms);
        let segment = TimeSeriesSegment::from_bytes(&item.segment)?;
        let end_ms = segment.last_timestamp(baseline_ms);

        let previous_live = {
            let table = tx.table(SEGMENTS_TABLE);
            let existing = table
                .and_then(|t| t.get(&key))
                .map(SegmentRow::from_row)
                .transpose()?;

            let previous_live = match existing {
                Some(existing) => {
                    match conflict_status(&item.change_vector, &existing.change_vector)? {
                        ConflictStatus::AlreadyMerged => return Ok(true),
                        ConflictStatus::Conflict => return Ok(false),
                        ConflictStatus::Update => existing.segment()?.number_of_live_entries(),
                    }
                }
                None => {
                    if let Some((prev_key, prev_row)) =
                        table.and_then(|t| t.seek_before(&prefix, &key).next())
                    {
                        let prev_baseline =
                            baseline_of(prev_key).ok_or_else(|| corrupt_key(prev_key))?;
                        let prev = SegmentRow::from_row(prev_row)?.segment()?;
                        if prev.last_timestamp(prev_baseline) >= baseline_ms {
                            return Ok(false);
                        }
                    }
                    0
                }
            };

            if let Some((next_key, _)) = table.and_then(|t| t.seek_after(&prefix, &key).next()) {
                let next_baseline = baseline_of(next_key).ok_or_else(|| corrupt_key(next_key))?;
                if end_ms >= next_baseline {
                    return Ok(false);
                }
            }
            previous_live
        };

        self.db.observe_change_vector(&item.change_vector)?;
        let tombstones = self.unmerged_tombstones(&*tx, &prefix, &item.change_vector)?;
        let segment = if tombstones.is_empty() {
            segment
        } else {
            kill_covered(&segment, baseline_ms, &tombstones)?
        };

        let mut write = SeriesWrite::new(&slice, Some(item.change_vector.as_str()));
        write.live_delta =
            segment.number_of_live_entries() as i64 - previous_live as i64;
        self.put_segment(tx, &mut write, key, &segment, Some(item.change_vector.as_str()))?;

        let count = self.update_stats(tx, &slice, write.live_delta)?;
        if count > 0 {
            DocumentStore::add_time_series_name(tx, &slice.document_id, &slice.name)?;
        } else {
            DocumentStore::remove_time_series_name(tx, &slice.document_id, &slice.name)?;
        }

        self.rollups.mark_segment_for_policy(
            tx,
            &slice,
            baseline_ms,
            &item.change_vector,
            segment.number_of_live_entries(),
        )?;

        tracing::debug!(
            "accepted replicated segment of '{}' in '{}' at {}",
            slice.name,
            slice.document_id,
            baseline_ms
        );
        Ok(true)
    }

    /// Apply a replicated segment, falling back to per-value appends.
    pub fn append_replicated_segment(
        &self,
        tx: &mut WriteTransaction<'_>,
        item: &SegmentItem,
    ) -> Result<Option<String>> {
        if self.try_append_entire_segment(tx, item)? {
            return Ok(Some(item.change_vector.clone()));
        }

        let baseline_ms = item.baseline.timestamp_millis();
        let segment = TimeSeriesSegment::from_bytes(&item.segment)?;
        let entries = segment
            .enumerate()
            .map(|entry| {
                entry.map(|e| TimeSeriesEntry {
                    timestamp: from_millis(baseline_ms + e.offset_ms),
                    values: e.values,
                    tag: e.tag.map(|t| String::from_utf8_lossy(&t).into_owned()),
                    status: e.status,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            "replicated segment of '{}' in '{}' at {} applied value by value",
            item.name,
            item.document_id,
            baseline_ms
        );
        self.append_internal(
            tx,
            &SeriesSlice::new(
                item.document_id.as_str(),
                item.name.as_str(),
                item.collection.as_str(),
            ),
            entries,
            Some(item.change_vector.as_str()),
            true,
        )
    }

    /// Apply a replicated tombstone.
    pub fn apply_deleted_range(
        &self,
        tx: &mut WriteTransaction<'_>,
        item: &DeletedRangeItem,
    ) -> Result<Option<String>> {
        let request = DeletionRangeRequest::new(
            item.document_id.as_str(),
            item.collection.as_str(),
            item.name.as_str(),
            item.from,
            item.to,
        );
        self.remove_timestamp_range(tx, &request, Some(item.change_vector.as_str()))
    }

    // -------------------------------------------------------------------------
    // Change Feeds
    // -------------------------------------------------------------------------

    /// Segments with etag >= `from`, in etag order.
    pub fn get_segments_from(
        &self,
        tx: &impl TableReader,
        from: Etag,
        take: usize,
    ) -> Result<Vec<SegmentItem>> {
        let table = match tx.table(SEGMENTS_TABLE) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        table
            .index_from(from.0)
            .take(take)
            .map(|(_, key, row)| segment_item(key, SegmentRow::from_row(row)?))
            .collect()
    }

    /// Segments of one collection with etag >= `from`, in etag order.
    pub fn get_time_series_from(
        &self,
        tx: &impl TableReader,
        collection: &str,
        from: Etag,
        take: usize,
    ) -> Result<Vec<SegmentItem>> {
        let table = match tx.table(SEGMENTS_TABLE) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        let mut items = Vec::new();
        for (_, key, row) in table.index_from(from.0) {
            if items.len() >= take {
                break;
            }
            let stored = SegmentRow::from_row(row)?;
            if eq_ignore_case(&stored.collection, collection) {
                items.push(segment_item(key, stored)?);
            }
        }
        Ok(items)
    }

    /// Etag of the most recently written segment, zero when there is none.
    pub fn get_last_time_series_etag(&self, tx: &impl TableReader) -> Etag {
        tx.table(SEGMENTS_TABLE)
            .and_then(|t| t.index_rev().next())
            .map_or(Etag::ZERO, |(etag, _, _)| Etag(etag))
    }

    /// Etag of the most recently written segment of one collection.
    pub fn get_last_time_series_etag_for(
        &self,
        tx: &impl TableReader,
        collection: &str,
    ) -> Result<Etag> {
        let table = match tx.table(SEGMENTS_TABLE) {
            Some(table) => table,
            None => return Ok(Etag::ZERO),
        };
        for (etag, _, row) in table.index_rev() {
            if eq_ignore_case(&SegmentRow::from_row(row)?.collection, collection) {
                return Ok(Etag(etag));
            }
        }
        Ok(Etag::ZERO)
    }

    /// Stored segments across all series, drained ones included.
    pub fn get_number_of_time_series_segments(&self, tx: &impl TableReader) -> usize {
        tx.table(SEGMENTS_TABLE).map_or(0, |t| t.len())
    }

    /// Tombstones with etag >= `from`, in etag order.
    pub fn get_deleted_ranges_from(
        &self,
        tx: &impl TableReader,
        from: Etag,
        take: usize,
    ) -> Result<Vec<DeletedRangeItem>> {
        let table = match tx.table(DELETED_RANGES_TABLE) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        table
            .index_from(from.0)
            .take(take)
            .map(|(_, _, row)| {
                let stored = DeletedRangeRow::from_row(row)?;
                Ok(DeletedRangeItem {
                    document_id: stored.document_id,
                    name: stored.name,
                    collection: stored.collection,
                    from: from_millis(stored.from_ms),
                    to: from_millis(stored.to_ms),
                    change_vector: stored.change_vector,
                    etag: stored.etag,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Stats and Names
    // -------------------------------------------------------------------------

    /// Live count and first/last live timestamp of a series.
    pub fn get_stats_for(
        &self,
        tx: &impl TableReader,
        document_id: &str,
        name: &str,
    ) -> Result<SeriesStats> {
        Ok(match SeriesStatsStore::find(tx, document_id, name)? {
            Some(row) => SeriesStats {
                count: row.count,
                start: from_millis(row.start_ms),
                end: from_millis(row.end_ms),
            },
            None => SeriesStats::empty(),
        })
    }

    pub fn get_time_series_names_for_document(
        &self,
        tx: &impl TableReader,
        document_id: &str,
    ) -> Result<Vec<String>> {
        DocumentStore::time_series_names(tx, document_id)
    }

    /// Apply a live-count change and refresh the exact live bounds.
    fn update_stats(
        &self,
        tx: &mut WriteTransaction<'_>,
        slice: &SeriesSlice,
        live_delta: i64,
    ) -> Result<u64> {
        let previous = SeriesStatsStore::get(&*tx, &slice.collection, &slice.document_id, &slice.name)?
            .map_or(0, |row| row.count);
        let count = (previous as i64 + live_delta).max(0) as u64;

        let bounds = if count > 0 {
            live_bounds(&*tx, &slice.prefix())?
        } else {
            None
        };
        match bounds {
            Some((start_ms, end_ms)) => {
                SeriesStatsStore::put(
                    tx,
                    &StatsRow {
                        document_id: slice.document_id.clone(),
                        name: slice.name.clone(),
                        collection: slice.collection.clone(),
                        policy: policy_of(&slice.name),
                        count,
                        start_ms,
                        end_ms,
                    },
                )?;
                Ok(count)
            }
            None => {
                SeriesStatsStore::remove(tx, &slice.collection, &slice.document_id, &slice.name);
                Ok(0)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Physically delete drained segments and tombstones up to `upto`, at
    /// most `max` rows. Returns the number of rows deleted.
    pub fn purge_segments_and_deleted_ranges(
        &self,
        tx: &mut WriteTransaction<'_>,
        collection: &str,
        upto: Etag,
        max: usize,
    ) -> Result<usize> {
        let pending_table = pending_deletion_table(collection);
        let pending: Vec<(Vec<u8>, i64, Vec<u8>)> = match tx.table(&pending_table) {
            Some(table) => table
                .iter()
                .filter_map(|(key, row)| {
                    let etag = i64::from_be_bytes(key.try_into().ok()?);
                    Some((key.to_vec(), etag, row.value.to_vec()))
                })
                .take_while(|(_, etag, _)| *etag <= upto.0)
                .take(max)
                .collect(),
            None => Vec::new(),
        };

        let mut purged = 0;
        for (pending_key, etag, segment_key) in &pending {
            tx.table_mut(&pending_table).remove(pending_key);
            let drained = match tx.table(SEGMENTS_TABLE).and_then(|t| t.get(segment_key)) {
                Some(row) => {
                    let stored = SegmentRow::from_row(row)?;
                    stored.etag.0 == *etag && stored.segment()?.number_of_live_entries() == 0
                }
                None => false,
            };
            if drained {
                tx.table_mut(SEGMENTS_TABLE).remove(segment_key);
                purged += 1;
            }
        }

        let remaining = max.saturating_sub(pending.len());
        let tombstones: Vec<Vec<u8>> = match tx.table(DELETED_RANGES_TABLE) {
            Some(table) => {
                let mut keys = Vec::new();
                for (etag, key, row) in table.index_from(i64::MIN) {
                    if etag > upto.0 || keys.len() >= remaining {
                        break;
                    }
                    if eq_ignore_case(&DeletedRangeRow::from_row(row)?.collection, collection) {
                        keys.push(key.to_vec());
                    }
                }
                keys
            }
            None => Vec::new(),
        };
        for key in &tombstones {
            tx.table_mut(DELETED_RANGES_TABLE).remove(key);
        }
        purged += tombstones.len();

        if purged > 0 {
            tracing::debug!(
                "purged {} segments and tombstones of '{}' up to etag {}",
                purged,
                collection,
                upto
            );
        }
        Ok(purged)
    }

    /// Delete every series of a document. Returns the number of series.
    pub fn delete_time_series_for_document(
        &self,
        tx: &mut WriteTransaction<'_>,
        document_id: &str,
        collection: &str,
    ) -> Result<usize> {
        validate_document_id(document_id)?;
        let prefix = document_prefix(document_id);
        let series: Vec<StatsRow> = match tx.table(&stats_table(collection)) {
            Some(table) => table
                .prefix(&prefix)
                .map(|(_, row)| StatsRow::from_row(row))
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };

        for stats in &series {
            let slice = SeriesSlice::new(document_id, stats.name.as_str(), collection);
            self.remove_range_millis(tx, &slice, min_millis(), max_millis(), None)?;
        }
        if let Some(table) = tx.existing_table_mut(ROLLUPS_TABLE) {
            table.remove_prefix(&prefix);
        }
        Ok(series.len())
    }
}

// =============================================================================
// Validation
// =============================================================================

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AegisError::InvalidArgument(
            "time series name cannot be empty".to_string(),
        ));
    }
    if name.contains(char::from(crate::slicer::RECORD_SEPARATOR)) {
        return Err(AegisError::InvalidArgument(format!(
            "time series name '{}' contains a record separator",
            name
        )));
    }
    Ok(())
}

fn validate_entry(slice: &SeriesSlice, entry: &TimeSeriesEntry, allow_nan: bool) -> Result<()> {
    if entry.values.is_empty() || entry.values.len() > MAX_NUMBER_OF_VALUES {
        return Err(AegisError::InvalidValue(format!(
            "a sample of '{}' must have between 1 and {} values, got {}",
            slice.name,
            MAX_NUMBER_OF_VALUES,
            entry.values.len()
        )));
    }
    if !allow_nan && entry.values.iter().any(|v| v.is_nan()) {
        return Err(AegisError::InvalidValue(format!(
            "NaN is not a valid value for '{}' at {}",
            slice.name, entry.timestamp
        )));
    }
    if entry.tag.as_ref().map_or(false, |t| t.len() > MAX_TAG_LENGTH) {
        return Err(AegisError::InvalidValue(format!(
            "tag of '{}' at {} exceeds {} bytes",
            slice.name, entry.timestamp, MAX_TAG_LENGTH
        )));
    }
    if !TimeSeriesSegment::fits_alone(&entry.values, entry.tag.as_ref().map(|t| t.as_bytes())) {
        return Err(AegisError::InvalidValue(format!(
            "a sample of '{}' at {} with {} values does not fit into a {} byte segment",
            slice.name,
            entry.timestamp,
            entry.values.len(),
            MAX_SEGMENT_SIZE
        )));
    }
    Ok(())
}

// =============================================================================
// Sample Helpers
// =============================================================================

/// Truncate to ms, sort stably and keep the last sample per timestamp.
fn prepare_samples(entries: Vec<TimeSeriesEntry>, replicated: bool) -> Vec<Sample> {
    let mut samples: Vec<Sample> = entries
        .into_iter()
        .map(|e| Sample {
            timestamp_ms: e.timestamp.timestamp_millis(),
            values: e.values,
            tag: e.tag.map(String::into_bytes),
            status: if replicated { e.status } else { EntryStatus::Live },
        })
        .collect();
    samples.sort_by_key(|s| s.timestamp_ms);

    let mut deduped: Vec<Sample> = Vec::with_capacity(samples.len());
    for sample in samples {
        match deduped.last_mut() {
            Some(last) if last.timestamp_ms == sample.timestamp_ms => *last = sample,
            _ => deduped.push(sample),
        }
    }
    deduped
}

/// Merge stored and incoming samples, resolving equal timestamps.
fn merge_samples(existing: Vec<Sample>, incoming: &[Sample], replicated: bool) -> Vec<Sample> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut local = existing.into_iter().peekable();
    let mut remote = incoming.iter().peekable();

    loop {
        let next_local = local.peek().map(|s| s.timestamp_ms);
        let next_remote = remote.peek().map(|s| s.timestamp_ms);
        match (next_local, next_remote) {
            (None, None) => break,
            (Some(_), None) => merged.extend(local.next()),
            (None, Some(_)) => merged.extend(remote.next().cloned()),
            (Some(l), Some(r)) if l < r => merged.extend(local.next()),
            (Some(l), Some(r)) if l > r => merged.extend(remote.next().cloned()),
            (Some(_), Some(_)) => {
                if let (Some(l), Some(r)) = (local.next(), remote.next()) {
                    if should_keep_local(&l, r, replicated) {
                        merged.push(l);
                    } else {
                        merged.push(r.clone());
                    }
                }
            }
        }
    }
    merged
}

/// Equal timestamps: local writes always win. A replicated sample loses to a
/// wider local sample, and for equal widths to lexicographically greater
/// local values (NaN lowest).
fn should_keep_local(local: &Sample, remote: &Sample, replicated: bool) -> bool {
    if !replicated {
        return false;
    }
    let local_values = trim_padding(&local.values);
    let remote_values = trim_padding(&remote.values);
    if local_values.len() != remote_values.len() {
        return local_values.len() > remote_values.len();
    }
    for (l, r) in local_values.iter().zip(remote_values) {
        match compare_nan_lowest(*l, *r) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    true
}

fn trim_padding(values: &[f64]) -> &[f64] {
    let len = values.iter().rposition(|v| !v.is_nan()).map_or(0, |i| i + 1);
    &values[..len]
}

fn compare_nan_lowest(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Pack samples into segments. The first segment may be pinned to an
/// existing baseline and minimum width.
fn build_segments(
    samples: &[Sample],
    first: Option<(i64, usize)>,
) -> Result<Vec<(i64, TimeSeriesSegment)>> {
    let mut output = Vec::new();
    let mut current: Option<(i64, TimeSeriesSegment)> = None;
    let mut pinned = first;

    for sample in samples {
        if let Some((baseline, segment)) = current.as_mut() {
            if append_sample(segment, *baseline, sample) {
                continue;
            }
        }
        output.extend(current.take());

        if let Some((baseline, width)) = pinned.take() {
            let mut segment = TimeSeriesSegment::initialize(width.max(sample.values.len()))?;
            if append_sample(&mut segment, baseline, sample) {
                current = Some((baseline, segment));
                continue;
            }
        }

        let mut segment = TimeSeriesSegment::initialize(sample.values.len())?;
        if !append_sample(&mut segment, sample.timestamp_ms, sample) {
            return Err(AegisError::SegmentTooLarge(segment.size_in_bytes()));
        }
        current = Some((sample.timestamp_ms, segment));
    }
    output.extend(current);
    Ok(output)
}

/// Kill the live samples of `[from, to]`. Returns the rewritten segment and
/// the first removed timestamp, or `None` when nothing matched.
fn delete_from_segment(
    segment: &TimeSeriesSegment,
    baseline_ms: i64,
    from_ms: i64,
    to_ms: i64,
) -> Result<Option<(TimeSeriesSegment, i64)>> {
    let entries = segment.entries()?;
    let first_removed = entries
        .iter()
        .map(|e| (baseline_ms + e.offset_ms, e))
        .find(|(ts, e)| e.is_live() && *ts >= from_ms && *ts <= to_ms)
        .map(|(ts, _)| ts);
    let first_removed = match first_removed {
        Some(ts) => ts,
        None => return Ok(None),
    };

    let mut rewritten = TimeSeriesSegment::initialize(segment.number_of_values())?;
    let end_ms = segment.last_timestamp(baseline_ms);
    if baseline_ms >= from_ms && end_ms <= to_ms {
        rewritten.append(0, &[], None, EntryStatus::Dead);
        return Ok(Some((rewritten, first_removed)));
    }

    for entry in entries {
        let ts = baseline_ms + entry.offset_ms;
        let status = if ts >= from_ms && ts <= to_ms {
            EntryStatus::Dead
        } else {
            entry.status
        };
        if !rewritten.append(entry.offset_ms, &entry.values, entry.tag.as_deref(), status) {
            return Err(AegisError::Internal(format!(
                "re-encoding segment at {} overflowed",
                baseline_ms
            )));
        }
    }
    Ok(Some((rewritten, first_removed)))
}

/// Rewrite a segment with the live samples covered by tombstones killed.
fn kill_covered(
    segment: &TimeSeriesSegment,
    baseline_ms: i64,
    tombstones: &[DeletedRangeRow],
) -> Result<TimeSeriesSegment> {
    let mut rewritten = TimeSeriesSegment::initialize(segment.number_of_values())?;
    for entry in segment.enumerate() {
        let entry = entry?;
        let ts = baseline_ms + entry.offset_ms;
        let status = if tombstones.iter().any(|t| t.covers(ts)) {
            EntryStatus::Dead
        } else {
            entry.status
        };
        if !rewritten.append(entry.offset_ms, &entry.values, entry.tag.as_deref(), status) {
            return Err(AegisError::Internal(format!(
                "re-encoding segment at {} overflowed",
                baseline_ms
            )));
        }
    }
    Ok(rewritten)
}

/// First and last live timestamp under a series prefix.
fn live_bounds(tx: &impl TableReader, prefix: &[u8]) -> Result<Option<(i64, i64)>> {
    let table = match tx.table(SEGMENTS_TABLE) {
        Some(table) => table,
        None => return Ok(None),
    };

    let mut start = None;
    for (key, row) in table.prefix(prefix) {
        let segment = SegmentRow::from_row(row)?.segment()?;
        if segment.number_of_live_entries() == 0 {
            continue;
        }
        let baseline_ms = baseline_of(key).ok_or_else(|| corrupt_key(key))?;
        for entry in segment.enumerate() {
            let entry = entry?;
            if entry.is_live() {
                start = Some(baseline_ms + entry.offset_ms);
                break;
            }
        }
        break;
    }
    let start = match start {
        Some(start) => start,
        None => return Ok(None),
    };

    let mut upper = prefix.to_vec();
    upper.extend_from_slice(&[0xFF; 9]);
    for (key, row) in table.seek_before(prefix, &upper) {
        let segment = SegmentRow::from_row(row)?.segment()?;
        if segment.number_of_live_entries() == 0 {
            continue;
        }
        let baseline_ms = baseline_of(key).ok_or_else(|| corrupt_key(key))?;
        let mut end = None;
        for entry in segment.enumerate() {
            let entry = entry?;
            if entry.is_live() {
                end = Some(baseline_ms + entry.offset_ms);
            }
        }
        if let Some(end) = end {
            return Ok(Some((start, end)));
        }
    }
    Ok(Some((start, start)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_common::DatabaseConfig;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn t(ms: i64) -> DateTime<Utc> {
        from_millis(ms)
    }

    fn base() -> i64 {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis()
    }

    fn setup() -> TimeSeriesStorage {
        let db = DocumentDatabase::new(DatabaseConfig::for_node("db", "A", "dbA"));
        db.environment()
            .write(|tx| DocumentStore::put(tx, "users/1", "Users", json!({})))
            .expect("document");
        TimeSeriesStorage::new(db)
    }

    fn append(storage: &TimeSeriesStorage, entries: Vec<TimeSeriesEntry>) -> Option<String> {
        storage
            .database()
            .environment()
            .write(|tx| storage.append_timestamp(tx, "users/1", "Users", "HR", entries, None))
            .expect("append")
    }

    fn values(storage: &TimeSeriesStorage) -> Vec<(i64, f64)> {
        let read = storage.database().environment().read();
        TimeSeriesReader::with_millis(&read, "users/1", "HR", i64::MIN, i64::MAX, None)
            .values()
            .expect("values")
            .into_iter()
            .map(|e| (e.timestamp_millis() - base(), e.value()))
            .collect()
    }

    fn segment_count(storage: &TimeSeriesStorage) -> usize {
        let read = storage.database().environment().read();
        read.table(SEGMENTS_TABLE)
            .map_or(0, |t| t.prefix(&SeriesSlice::new("users/1", "HR", "Users").prefix()).count())
    }

    #[test]
    fn test_append_in_order_and_stats() {
        let storage = setup();
        let entries = (0..10)
            .map(|i| TimeSeriesEntry::single(t(base() + i * 1_000), i as f64))
            .collect();
        let cv = append(&storage, entries).expect("change vector");
        assert!(cv.starts_with("A:"));

        assert_eq!(values(&storage).len(), 10);
        let read = storage.database().environment().read();
        let stats = storage.get_stats_for(&read, "users/1", "hr").expect("stats");
        assert_eq!(stats.count, 10);
        assert_eq!(stats.start, t(base()));
        assert_eq!(stats.end, t(base() + 9_000));
        assert_eq!(
            storage.get_time_series_names_for_document(&read, "users/1").expect("names"),
            vec!["HR"]
        );
    }

    #[test]
    fn test_out_of_order_append_merges() {
        let storage = setup();
        append(
            &storage,
            vec![
                TimeSeriesEntry::single(t(base() + 1_000), 1.0),
                TimeSeriesEntry::single(t(base() + 3_000), 3.0),
            ],
        );
        append(&storage, vec![TimeSeriesEntry::single(t(base() + 2_000), 2.0)]);
        append(&storage, vec![TimeSeriesEntry::single(t(base()), 0.0)]);

        assert_eq!(
            values(&storage),
            vec![(0, 0.0), (1_000, 1.0), (2_000, 2.0), (3_000, 3.0)]
        );
    }

    #[test]
    fn test_duplicate_timestamps_later_wins() {
        let storage = setup();
        append(
            &storage,
            vec![
                TimeSeriesEntry::single(t(base() + 5), 1.0),
                TimeSeriesEntry::single(t(base() + 5), 2.0),
            ],
        );
        assert_eq!(values(&storage), vec![(5, 2.0)]);

        append(&storage, vec![TimeSeriesEntry::single(t(base() + 5), 7.0)]);
        assert_eq!(values(&storage), vec![(5, 7.0)]);
    }

    #[test]
    fn test_sub_millisecond_precision_is_truncated() {
        let storage = setup();
        let ts = t(base()) + Duration::microseconds(1_500);
        append(&storage, vec![TimeSeriesEntry::single(ts, 1.0)]);
        assert_eq!(values(&storage), vec![(1, 1.0)]);
    }

    #[test]
    fn test_full_segments_roll_over() {
        let storage = setup();
        let entries = (0..2_000)
            .map(|i| TimeSeriesEntry::new(t(base() + i * 17), vec![i as f64 * 1.37, (i * i) as f64]))
            .collect();
        append(&storage, entries);

        assert!(segment_count(&storage) > 1);
        assert_eq!(values(&storage).len(), 2_000);
    }

    #[test]
    fn test_wider_sample_starts_new_segment() {
        let storage = setup();
        append(&storage, vec![TimeSeriesEntry::single(t(base()), 1.0)]);
        append(&storage, vec![TimeSeriesEntry::new(t(base() + 1), vec![1.0, 2.0])]);
        assert_eq!(segment_count(&storage), 2);

        let read = storage.database().environment().read();
        let all = TimeSeriesReader::with_millis(&read, "users/1", "hr", i64::MIN, i64::MAX, None)
            .values()
            .expect("values");
        assert_eq!(all[1].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_validation_happens_before_write() {
        let storage = setup();
        let result = storage.database().environment().write(|tx| {
            storage.append_timestamp(
                tx,
                "users/1",
                "Users",
                "HR",
                vec![
                    TimeSeriesEntry::single(t(base()), 1.0),
                    TimeSeriesEntry::single(t(base() + 1), f64::NAN),
                ],
                None,
            )
        });
        assert!(matches!(result, Err(AegisError::InvalidValue(_))));
        assert!(values(&storage).is_empty());

        let missing = storage.database().environment().write(|tx| {
            storage.append_timestamp(
                tx,
                "users/404",
                "Users",
                "HR",
                vec![TimeSeriesEntry::single(t(base()), 1.0)],
                None,
            )
        });
        assert!(matches!(missing, Err(AegisError::NotFound(_))));
    }

    #[test]
    fn test_widest_storable_sample() {
        let storage = setup();
        let incompressible = |width: usize| -> Vec<f64> {
            (0..width)
                .map(|i| f64::from_bits((2.0 + i as f64).to_bits() | 1))
                .collect()
        };

        append(&storage, vec![TimeSeriesEntry::new(t(base()), vec![0.0; MAX_NUMBER_OF_VALUES])]);
        append(&storage, vec![TimeSeriesEntry::new(t(base() + 1), incompressible(31))]);

        let too_wide = storage.database().environment().write(|tx| {
            storage.append_timestamp(
                tx,
                "users/1",
                "Users",
                "HR",
                vec![TimeSeriesEntry::new(t(base() + 2), incompressible(32))],
                None,
            )
        });
        assert!(matches!(too_wide, Err(AegisError::InvalidValue(_))));

        let read = storage.database().environment().read();
        let stored = TimeSeriesReader::with_millis(&read, "users/1", "HR", i64::MIN, i64::MAX, None)
            .values()
            .expect("values");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].values, incompressible(31));
    }

    #[test]
    fn test_malformed_document_ids_are_rejected() {
        let storage = setup();
        let env = storage.database().environment();
        let nested = "users/1\u{1e}x";

        assert!(matches!(
            env.write(|tx| DocumentStore::put(tx, nested, "Users", json!({}))),
            Err(AegisError::InvalidArgument(_))
        ));
        for id in [nested, ""] {
            let appended = env.write(|tx| {
                storage.append_timestamp(
                    tx,
                    id,
                    "Users",
                    "HR",
                    vec![TimeSeriesEntry::single(t(base()), 1.0)],
                    None,
                )
            });
            assert!(matches!(appended, Err(AegisError::InvalidArgument(_))));

            let request = DeletionRangeRequest::new(id, "Users", "HR", t(base()), t(base()));
            assert!(env
                .write(|tx| storage.remove_timestamp_range(tx, &request, None))
                .is_err());
            assert!(env
                .write(|tx| storage.delete_time_series_for_document(tx, id, "Users"))
                .is_err());
        }
        assert_eq!(
            env.write(|tx| storage.delete_time_series_for_document(tx, "users/1", "Users"))
                .expect("delete"),
            0
        );
    }

    #[test]
    fn test_tie_break_rules() {
        let sample = |values: Vec<f64>| Sample {
            timestamp_ms: 0,
            values,
            tag: None,
            status: EntryStatus::Live,
        };
        assert!(!should_keep_local(&sample(vec![9.0]), &sample(vec![1.0]), false));
        assert!(should_keep_local(&sample(vec![9.0]), &sample(vec![1.0]), true));
        assert!(!should_keep_local(&sample(vec![1.0]), &sample(vec![9.0]), true));
        assert!(should_keep_local(&sample(vec![1.0, 1.0]), &sample(vec![9.0]), true));
        assert!(!should_keep_local(&sample(vec![f64::NAN, 5.0]), &sample(vec![0.0, 5.0]), true));
        assert!(!should_keep_local(&sample(vec![1.0, f64::NAN]), &sample(vec![1.0, 2.0]), true));
    }

    #[test]
    fn test_replicated_append_tie_break() {
        let storage = setup();
        append(&storage, vec![TimeSeriesEntry::single(t(base()), 5.0)]);

        let env = storage.database().environment();
        env.write(|tx| {
            storage.append_timestamp(
                tx,
                "users/1",
                "Users",
                "HR",
                vec![TimeSeriesEntry::single(t(base()), 3.0)],
                Some("B:1-dbB"),
            )
        })
        .expect("replicate smaller");
        assert_eq!(values(&storage), vec![(0, 5.0)]);

        env.write(|tx| {
            storage.append_timestamp(
                tx,
                "users/1",
                "Users",
                "HR",
                vec![TimeSeriesEntry::single(t(base()), 8.0)],
                Some("B:2-dbB"),
            )
        })
        .expect("replicate larger");
        assert_eq!(values(&storage), vec![(0, 8.0)]);
    }

    #[test]
    fn test_remove_range() {
        let storage = setup();
        append(
            &storage,
            (0..10)
                .map(|i| TimeSeriesEntry::single(t(base() + i * 1_000), i as f64))
                .collect(),
        );

        let env = storage.database().environment();
        let request = DeletionRangeRequest::new("users/1", "Users", "HR", t(base() + 2_000), t(base() + 4_000));
        let cv = env
            .write(|tx| storage.remove_timestamp_range(tx, &request, None))
            .expect("remove");
        assert!(cv.is_some());
        assert_eq!(values(&storage).len(), 7);

        let read = env.read();
        assert_eq!(storage.get_stats_for(&read, "users/1", "HR").expect("stats").count, 7);
        let tombstones = storage
            .get_deleted_ranges_from(&read, Etag::ZERO, 10)
            .expect("tombstones");
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].from, t(base() + 2_000));
    }

    #[test]
    fn test_remove_everything_clears_metadata() {
        let storage = setup();
        append(&storage, vec![TimeSeriesEntry::single(t(base()), 1.0)]);

        let env = storage.database().environment();
        let request = DeletionRangeRequest::new("users/1", "Users", "HR", t(min_millis()), t(max_millis()));
        env.write(|tx| storage.remove_timestamp_range(tx, &request, None))
            .expect("remove");

        let read = env.read();
        assert_eq!(storage.get_stats_for(&read, "users/1", "HR").expect("stats").count, 0);
        assert!(storage
            .get_time_series_names_for_document(&read, "users/1")
            .expect("names")
            .is_empty());
    }

    #[test]
    fn test_removing_nothing_still_records_tombstone() {
        let storage = setup();
        let env = storage.database().environment();
        let request = DeletionRangeRequest::new("users/1", "Users", "HR", t(0), t(10));
        let cv = env
            .write(|tx| storage.remove_timestamp_range(tx, &request, None))
            .expect("remove");
        assert!(cv.is_none());
        assert_eq!(
            storage
                .get_deleted_ranges_from(&env.read(), Etag::ZERO, 10)
                .expect("tombstones")
                .len(),
            1
        );
    }

    #[test]
    fn test_segment_feed_is_etag_ordered() {
        let storage = setup();
        append(&storage, vec![TimeSeriesEntry::single(t(base() + 10_000), 1.0)]);
        append(&storage, vec![TimeSeriesEntry::new(t(base()), vec![1.0, 2.0])]);

        let read = storage.database().environment().read();
        let items = storage.get_segments_from(&read, Etag::ZERO, 10).expect("feed");
        assert_eq!(items.len(), 2);
        assert!(items[0].etag < items[1].etag);
        assert_eq!(items[1].baseline, t(base()));

        let after = storage.get_segments_from(&read, items[1].etag, 10).expect("feed");
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn test_purge_drained_segments() {
        let storage = setup();
        append(&storage, vec![TimeSeriesEntry::single(t(base()), 1.0)]);
        let env = storage.database().environment();
        let request = DeletionRangeRequest::new("users/1", "Users", "HR", t(base()), t(base()));
        env.write(|tx| storage.remove_timestamp_range(tx, &request, None))
            .expect("remove");
        assert_eq!(segment_count(&storage), 1);

        let upto = storage.database().last_etag();
        let purged = env
            .write(|tx| storage.purge_segments_and_deleted_ranges(tx, "users", upto, 100))
            .expect("purge");
        assert_eq!(purged, 2);
        assert_eq!(segment_count(&storage), 0);
    }

    #[test]
    fn test_delete_time_series_for_document() {
        let storage = setup();
        append(&storage, vec![TimeSeriesEntry::single(t(base()), 1.0)]);
        let env = storage.database().environment();
        let deleted = env
            .write(|tx| storage.delete_time_series_for_document(tx, "users/1", "Users"))
            .expect("delete");
        assert_eq!(deleted, 1);
        assert!(values(&storage).is_empty());
    }

    #[test]
    fn test_etag_accessors_and_collection_feed() {
        let storage = setup();
        let env = storage.database().environment();
        {
            let read = env.read();
            assert_eq!(storage.get_last_time_series_etag(&read), Etag::ZERO);
            assert_eq!(storage.get_number_of_time_series_segments(&read), 0);
        }

        append(&storage, vec![TimeSeriesEntry::single(t(base()), 1.0)]);
        env.write(|tx| {
            DocumentStore::put(tx, "orders/1", "Orders", json!({}))?;
            storage.append_timestamp(
                tx,
                "orders/1",
                "Orders",
                "Total",
                vec![TimeSeriesEntry::single(t(base()), 9.0)],
                None,
            )
        })
        .expect("append");
        env.write(|tx| {
            storage.append_timestamp(
                tx,
                "users/1",
                "Users",
                "BP",
                vec![TimeSeriesEntry::new(t(base()), vec![120.0, 80.0])],
                None,
            )
        })
        .expect("append");

        let read = env.read();
        let all = storage.get_segments_from(&read, Etag::ZERO, 10).expect("feed");
        assert_eq!(all.len(), 3);
        assert_eq!(storage.get_number_of_time_series_segments(&read), 3);
        assert_eq!(storage.get_last_time_series_etag(&read), all[2].etag);
        assert_eq!(
            storage.get_last_time_series_etag_for(&read, "ORDERS").expect("etag"),
            all[1].etag
        );
        assert_eq!(
            storage.get_last_time_series_etag_for(&read, "users").expect("etag"),
            all[2].etag
        );
        assert_eq!(
            storage.get_last_time_series_etag_for(&read, "Missing").expect("etag"),
            Etag::ZERO
        );

        let users = storage.get_time_series_from(&read, "Users", Etag::ZERO, 10).expect("feed");
        let names: Vec<_> = users.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["HR", "BP"]);
        assert_eq!(storage.get_time_series_from(&read, "Users", Etag::ZERO, 1).expect("feed").len(), 1);
        let later = storage
            .get_time_series_from(&read, "users", Etag(all[0].etag.0 + 1), 10)
            .expect("feed");
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].name, "BP");
    }

    fn pseudo_shuffle<T>(items: Vec<T>, seed: u64) -> Vec<T> {
        let mut keyed: Vec<(u64, T)> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| ((i as u64 ^ seed).wrapping_mul(0x9E37_79B9_7F4A_7C15), item))
            .collect();
        keyed.sort_by_key(|(key, _)| *key);
        keyed.into_iter().map(|(_, item)| item).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_batches_in_any_order_read_back_ascending(
            timestamps in prop::collection::btree_set(0i64..200_000, 1..600),
            batch in 1usize..80,
            seed in any::<u64>(),
        ) {
            let storage = setup();
            let sorted: Vec<i64> = timestamps.into_iter().collect();
            let batches: Vec<Vec<i64>> = sorted.chunks(batch).map(|c| c.to_vec()).collect();
            for offsets in pseudo_shuffle(batches, seed) {
                append(
                    &storage,
                    offsets
                        .iter()
                        .map(|o| TimeSeriesEntry::new(t(base() + o), vec![*o as f64 * 0.37, -(*o as f64)]))
                        .collect(),
                );
            }

            let expected: Vec<(i64, f64)> = sorted.iter().map(|o| (*o, *o as f64 * 0.37)).collect();
            prop_assert_eq!(values(&storage), expected);
            let read = storage.database().environment().read();
            prop_assert_eq!(
                storage.get_stats_for(&read, "users/1", "HR").expect("stats").count as usize,
                sorted.len()
            );
        }

        #[test]
        fn prop_delete_range_removes_exactly_the_window(
            timestamps in prop::collection::btree_set(0i64..200_000, 1..600),
            from in 0i64..200_000,
            length in 0i64..60_000,
        ) {
            let storage = setup();
            append(
                &storage,
                timestamps
                    .iter()
                    .map(|o| TimeSeriesEntry::new(t(base() + o), vec![(*o as f64).sqrt(), *o as f64]))
                    .collect(),
            );
            let to = from + length;
            let env = storage.database().environment();
            let request = DeletionRangeRequest::new("users/1", "Users", "HR", t(base() + from), t(base() + to));
            env.write(|tx| storage.remove_timestamp_range(tx, &request, None))
                .expect("remove");

            let kept: BTreeSet<i64> = timestamps
                .iter()
                .copied()
                .filter(|o| *o < from || *o > to)
                .collect();
            let read_back: Vec<i64> = values(&storage).into_iter().map(|(o, _)| o).collect();
            prop_assert_eq!(read_back, kept.iter().copied().collect::<Vec<_>>());
            let read = env.read();
            prop_assert_eq!(
                storage.get_stats_for(&read, "users/1", "HR").expect("stats").count as usize,
                kept.len()
            );
        }
    }
}
