//! Aegis Time Series Rollups
//!
//! Scheduling and execution of policy rollups. Every write to a series that
//! feeds a policy leaves a pending entry keyed by the series, due when the
//! bucket holding the earliest touched sample closes. The runner drains due
//! entries in batches and aggregates the source series into the series of
//! the next policy.
//!
//! Key Features:
//! - Earliest-due scheduling per series with etag concurrency checks
//! - Re-aggregation of buckets touched by late writes
//! - Replica-aware: only the primary writes rollup output
//! - Batch scheduling of series for policies added after the data
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::aggregation::{get_aggregated_values, AggregationMode};
use crate::database::DocumentDatabase;
use crate::documents::DocumentStore;
use crate::duration::RangeGroup;
use crate::policy::{PolicyRef, TimeSeriesConfiguration, TimeSeriesPolicy};
use crate::reader::TimeSeriesReader;
use crate::segment::{EntryStatus, MAX_NUMBER_OF_VALUES};
use crate::slicer::{policy_of_series, raw_series_name, SeriesSlice};
use crate::stats::SeriesStatsStore;
use crate::storage::TimeSeriesStorage;
use crate::tables::{RollupRow, ROLLUPS_TABLE};
use aegis_common::utils::{max_millis, min_millis};
use aegis_common::{Etag, Result};
use aegis_replication::{conflict_status, ConflictStatus};
use aegis_storage::{TableReader, WriteTransaction};
use chrono::{DateTime, Utc};
use std::sync::Arc;

// =============================================================================
// Rollup State
// =============================================================================

/// A due pending-rollup entry, as read by `prepare_rollups`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupState {
    pub key: Vec<u8>,
    pub entry: RollupRow,
}

impl RollupState {
    fn slice(&self) -> SeriesSlice {
        SeriesSlice::new(
            self.entry.document_id.as_str(),
            self.entry.name.as_str(),
            self.entry.collection.as_str(),
        )
    }
}

// =============================================================================
// Rollup Scheduler
// =============================================================================

/// Pending-rollup bookkeeping of one database.
pub struct TimeSeriesRollups {
    db: Arc<DocumentDatabase>,
}

impl TimeSeriesRollups {
    pub fn new(db: Arc<DocumentDatabase>) -> Self {
        Self { db }
    }

    /// Start (ms) of the bucket of `policy` following the one holding
    /// `timestamp_ms`.
    pub fn next_rollup(timestamp_ms: i64, policy: &TimeSeriesPolicy) -> Result<i64> {
        Ok(RangeGroup::new(policy.aggregation_time)?.next_after(timestamp_ms))
    }

    // -------------------------------------------------------------------------
    // Marking
    // -------------------------------------------------------------------------

    /// Schedule the policy after the one owning `slice` for the bucket holding
    /// `timestamp_ms`. Deletions outside the retention window of the current
    /// policy are not scheduled.
    pub fn mark_for_policy(
        &self,
        tx: &mut WriteTransaction<'_>,
        slice: &SeriesSlice,
        timestamp_ms: i64,
        status: EntryStatus,
    ) -> Result<()> {
        let next = match self.resolve_next(slice, timestamp_ms, status == EntryStatus::Dead)? {
            Some(next) => next,
            None => return Ok(()),
        };
        self.mark_for_next_policy(tx, slice, &next, timestamp_ms, None)
    }

    /// Schedule rollup for a replicated segment, carrying its change vector.
    pub fn mark_segment_for_policy(
        &self,
        tx: &mut WriteTransaction<'_>,
        slice: &SeriesSlice,
        baseline_ms: i64,
        change_vector: &str,
        live_entries: u32,
    ) -> Result<()> {
        let next = match self.resolve_next(slice, baseline_ms, live_entries == 0)? {
            Some(next) => next,
            None => return Ok(()),
        };
        self.mark_for_next_policy(tx, slice, &next, baseline_ms, Some(change_vector))
    }

    /// The policy consuming `slice`, if the write must be scheduled at all.
    fn resolve_next(
        &self,
        slice: &SeriesSlice,
        timestamp_ms: i64,
        dead: bool,
    ) -> Result<Option<TimeSeriesPolicy>> {
        let configuration = match self.db.time_series_configuration() {
            Some(configuration) => configuration,
            None => return Ok(None),
        };
        let collection = match configuration.collection(&slice.collection) {
            Some(collection) if !collection.disabled => collection,
            _ => return Ok(None),
        };
        let index = match collection.policy_index_by_series(&slice.name) {
            Some(index) => index,
            None => return Ok(None),
        };
        let next = match collection.next_policy(index) {
            PolicyRef::Named(policy) => policy,
            _ => return Ok(None),
        };

        if dead {
            if let Some(current) = collection.previous_policy(index + 1).policy() {
                let retention = current.retention_time;
                if !retention.is_infinite() {
                    let next_rollup = Self::next_rollup(timestamp_ms, next)?;
                    let start_rollup = retention.subtract_from_millis(next_rollup);
                    let now_ms = self.db.now().timestamp_millis();
                    if retention.add_to_millis(start_rollup) < now_ms {
                        tracing::trace!(
                            "not scheduling deletion in '{}' at {}, outside retention of '{}'",
                            slice.name,
                            timestamp_ms,
                            current.name
                        );
                        return Ok(None);
                    }
                }
            }
        }
        Ok(Some(next.clone()))
    }

    /// Write the pending entry unless an earlier one is already scheduled.
    pub fn mark_for_next_policy(
        &self,
        tx: &mut WriteTransaction<'_>,
        slice: &SeriesSlice,
        next: &TimeSeriesPolicy,
        timestamp_ms: i64,
        change_vector: Option<&str>,
    ) -> Result<()> {
        let next_rollup_ms = Self::next_rollup(timestamp_ms, next)?;
        let key = slice.key();

        if let Some(row) = tx.table(ROLLUPS_TABLE).and_then(|t| t.get(&key)) {
            if RollupRow::from_row(row)?.next_rollup_ms <= next_rollup_ms {
                return Ok(());
            }
        }

        let etag = self.db.next_etag();
        let change_vector = match change_vector {
            Some(change_vector) => change_vector.to_string(),
            None => self.db.new_change_vector(etag),
        };
        tracing::debug!(
            "marking '{}' of '{}' for policy '{}' at {}",
            slice.name,
            slice.document_id,
            next.name,
            next_rollup_ms
        );

        let row = RollupRow {
            document_id: slice.document_id.clone(),
            name: slice.name.clone(),
            collection: slice.collection.clone(),
            policy_to_apply: next.name.clone(),
            next_rollup_ms,
            etag,
            change_vector,
        };
        tx.table_mut(ROLLUPS_TABLE).insert(key, row.to_row()?);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Up to `take` entries due at or before `now_ms`, earliest first.
    pub fn prepare_rollups(
        &self,
        tx: &impl TableReader,
        now_ms: i64,
        take: usize,
    ) -> Result<Vec<RollupState>> {
        self.prepare_rollups_where(tx, now_ms, take, |_| true)
    }

    /// Like `prepare_rollups`, but entries rejected by `accept` are passed
    /// over and do not count against `take`.
    pub fn prepare_rollups_where(
        &self,
        tx: &impl TableReader,
        now_ms: i64,
        take: usize,
        accept: impl Fn(&RollupRow) -> bool,
    ) -> Result<Vec<RollupState>> {
        let table = match tx.table(ROLLUPS_TABLE) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };
        let mut states = Vec::new();
        for (due, key, row) in table.index_from(i64::MIN) {
            if due > now_ms || states.len() >= take {
                break;
            }
            let entry = RollupRow::from_row(row)?;
            if accept(&entry) {
                states.push(RollupState {
                    key: key.to_vec(),
                    entry,
                });
            }
        }
        Ok(states)
    }

    /// True when the series under `key` has a rollup due at or before `time_ms`.
    pub fn has_pending_rollup_from(
        &self,
        tx: &impl TableReader,
        key: &[u8],
        time_ms: i64,
    ) -> Result<bool> {
        match tx.table(ROLLUPS_TABLE).and_then(|t| t.get(key)) {
            Some(row) => Ok(RollupRow::from_row(row)?.next_rollup_ms <= time_ms),
            None => Ok(false),
        }
    }

    /// Schedule up to `take` series of policy `from` (resuming after key
    /// `after`) for immediate rollup into `to`. Returns how many were marked
    /// and the key to resume from.
    pub fn add_new_policy(
        &self,
        tx: &mut WriteTransaction<'_>,
        collection: &str,
        from: &TimeSeriesPolicy,
        to: &TimeSeriesPolicy,
        after: Option<&[u8]>,
        take: usize,
    ) -> Result<(usize, Option<Vec<u8>>)> {
        let series = SeriesStatsStore::series_of_policy(&*tx, collection, &from.name, after, take)?;
        let due_ms = to.aggregation_time.add_to_millis(min_millis());

        let mut last = None;
        for (key, stats) in &series {
            let row = RollupRow {
                document_id: stats.document_id.clone(),
                name: stats.name.clone(),
                collection: stats.collection.clone(),
                policy_to_apply: to.name.clone(),
                next_rollup_ms: due_ms,
                etag: Etag::ZERO,
                change_vector: String::new(),
            };
            tx.table_mut(ROLLUPS_TABLE).insert(key.clone(), row.to_row()?);
            last = Some(key.clone());
        }

        if !series.is_empty() {
            tracing::info!(
                "scheduled {} series of '{}' in '{}' for new policy '{}'",
                series.len(),
                from.name,
                collection,
                to.name
            );
        }
        Ok((series.len(), last))
    }
}

// =============================================================================
// Rollup Command
// =============================================================================

/// Aggregates a batch of due entries in one write transaction.
pub struct RollupTimeSeriesCommand {
    configuration: Arc<TimeSeriesConfiguration>,
    now: DateTime<Utc>,
    states: Vec<RollupState>,
    is_primary: bool,
    rolled_up: u64,
}

impl RollupTimeSeriesCommand {
    pub fn new(
        configuration: Arc<TimeSeriesConfiguration>,
        now: DateTime<Utc>,
        states: Vec<RollupState>,
        is_primary: bool,
    ) -> Self {
        Self {
            configuration,
            now,
            states,
            is_primary,
            rolled_up: 0,
        }
    }

    pub fn rolled_up(&self) -> u64 {
        self.rolled_up
    }

    /// Run the batch. Returns the number of series rolled up.
    pub fn execute(&mut self, storage: &TimeSeriesStorage, tx: &mut WriteTransaction<'_>) -> Result<u64> {
        let states = std::mem::take(&mut self.states);
        for state in &states {
            self.rollup_one(storage, tx, state)?;
        }
        Ok(self.rolled_up)
    }

    fn rollup_one(
        &mut self,
        storage: &TimeSeriesStorage,
        tx: &mut WriteTransaction<'_>,
        state: &RollupState,
    ) -> Result<()> {
        let item = &state.entry;
        let configuration = Arc::clone(&self.configuration);
        let collection = match configuration.collection(&item.collection) {
            Some(collection) if collection.disabled => return Ok(()),
            Some(collection) => collection,
            None => {
                tracing::debug!(
                    "dropping rollup of '{}': collection '{}' has no policies",
                    item.name,
                    item.collection
                );
                remove_entry(tx, &state.key);
                return Ok(());
            }
        };
        let policy = match collection.policy_by_name(&item.policy_to_apply) {
            Some(PolicyRef::Named(policy)) => policy,
            _ => {
                tracing::debug!(
                    "dropping rollup of '{}': policy '{}' no longer exists",
                    item.name,
                    item.policy_to_apply
                );
                remove_entry(tx, &state.key);
                return Ok(());
            }
        };

        let current = match tx.table(ROLLUPS_TABLE).and_then(|t| t.get(&state.key)) {
            Some(row) => RollupRow::from_row(row)?,
            None => return Ok(()),
        };
        if current.etag != item.etag {
            return Ok(());
        }

        let source = state.slice();
        if !DocumentStore::exists(&*tx, &source.document_id) {
            remove_entry(tx, &state.key);
            return Ok(());
        }

        let rollup_start = policy.aggregation_time.subtract_from_millis(item.next_rollup_ms);
        let target = SeriesSlice::new(
            source.document_id.as_str(),
            policy.get_time_series_name(raw_series_name(&source.name)),
            source.collection.as_str(),
        );

        let (previously_aggregated, target_change_vector) = {
            let reader = TimeSeriesReader::with_millis(
                &*tx,
                &target.document_id,
                &target.name,
                rollup_start,
                max_millis(),
                None,
            );
            (reader.any()?, reader.first_segment_change_vector()?)
        };
        if previously_aggregated && !item.change_vector.is_empty() {
            if let Some(target_cv) = target_change_vector {
                if conflict_status(&item.change_vector, &target_cv)? == ConflictStatus::AlreadyMerged {
                    tracing::debug!("rollup of '{}' into '{}' already merged", source.name, target.name);
                    remove_entry(tx, &state.key);
                    return Ok(());
                }
            }
        }

        if !self.is_primary {
            return Ok(());
        }

        let now_ms = self.now.timestamp_millis();
        let rollup_end = TimeSeriesRollups::next_rollup(
            policy.aggregation_time.subtract_from_millis(now_ms),
            policy,
        )? - 1;

        if previously_aggregated {
            let has_prior = TimeSeriesReader::with_millis(
                &*tx,
                &source.document_id,
                &source.name,
                min_millis(),
                rollup_start - 1,
                None,
            )
            .any()?;
            if !has_prior {
                let first = TimeSeriesReader::with_millis(
                    &*tx,
                    &source.document_id,
                    &source.name,
                    rollup_start,
                    max_millis(),
                    None,
                )
                .first()?;
                let first_ms = match first {
                    Some(first) => first.timestamp_millis(),
                    None => {
                        remove_entry(tx, &state.key);
                        return Ok(());
                    }
                };
                // the retained source starts in a later bucket, keep what is already rolled up
                if TimeSeriesRollups::next_rollup(first_ms, policy)? > item.next_rollup_ms {
                    remove_entry(tx, &state.key);
                    storage
                        .rollups()
                        .mark_for_next_policy(tx, &source, policy, first_ms, None)?;
                    return Ok(());
                }
            }
        }

        let mode = if policy_of_series(&source.name).is_some() {
            AggregationMode::FromAggregated
        } else {
            AggregationMode::FromRaw
        };
        let values = {
            let reader = TimeSeriesReader::with_millis(
                &*tx,
                &source.document_id,
                &source.name,
                rollup_start,
                rollup_end,
                None,
            );
            get_aggregated_values(&reader, &RangeGroup::new(policy.aggregation_time)?, mode)?
        };

        if values.iter().any(|v| v.values.len() > MAX_NUMBER_OF_VALUES) {
            tracing::warn!(
                "cannot roll up '{}' of '{}' into '{}': samples are too wide",
                source.name,
                source.document_id,
                target.name
            );
            remove_entry(tx, &state.key);
            return Ok(());
        }

        if previously_aggregated {
            storage.remove_range_millis(tx, &target, rollup_start, max_millis(), None)?;
        }
        remove_entry(tx, &state.key);
        if !values.is_empty() {
            storage.append_aggregated(tx, &target, values)?;
        }
        self.rolled_up += 1;

        let stats = SeriesStatsStore::get(&*tx, &source.collection, &source.document_id, &source.name)?;
        if stats.map_or(false, |s| s.end_ms > rollup_end) {
            storage
                .rollups()
                .mark_for_next_policy(tx, &source, policy, rollup_end + 1, None)?;
        }

        tracing::debug!(
            "rolled up '{}' of '{}' into '{}' from {} to {}",
            source.name,
            source.document_id,
            target.name,
            rollup_start,
            rollup_end
        );
        Ok(())
    }
}

fn remove_entry(tx: &mut WriteTransaction<'_>, key: &[u8]) {
    if let Some(table) = tx.existing_table_mut(ROLLUPS_TABLE) {
        table.remove(key);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration::TimeValue;
    use crate::policy::TimeSeriesCollectionConfiguration;
    use crate::types::TimeSeriesEntry;
    use aegis_common::utils::from_millis;
    use aegis_common::DatabaseConfig;
    use chrono::TimeZone;
    use serde_json::json;

    fn base() -> i64 {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis()
    }

    fn setup(policies: Vec<TimeSeriesPolicy>) -> TimeSeriesStorage {
        let db = DocumentDatabase::new(DatabaseConfig::for_node("db", "A", "dbA"));
        let mut configuration = TimeSeriesConfiguration::new()
            .with_collection("Users", TimeSeriesCollectionConfiguration::new(policies));
        configuration.initialize().expect("valid");
        db.set_time_series_configuration(Some(Arc::new(configuration)));
        db.set_time(Some(from_millis(base() + 3_600_000)));
        db.environment()
            .write(|tx| DocumentStore::put(tx, "users/1", "Users", json!({})))
            .expect("document");
        TimeSeriesStorage::new(db)
    }

    fn append(storage: &TimeSeriesStorage, name: &str, offsets: &[i64]) {
        let entries: Vec<_> = offsets
            .iter()
            .map(|o| TimeSeriesEntry::single(from_millis(base() + o), *o as f64))
            .collect();
        storage
            .database()
            .environment()
            .write(|tx| storage.append_timestamp(tx, "users/1", "Users", name, entries, None))
            .expect("append");
    }

    fn pending(storage: &TimeSeriesStorage) -> Vec<RollupState> {
        let read = storage.database().environment().read();
        storage.rollups().prepare_rollups(&read, i64::MAX, 100).expect("prepare")
    }

    fn by_second() -> TimeSeriesPolicy {
        TimeSeriesPolicy::keep_forever("BySecond", TimeValue::from_seconds(1))
    }

    #[test]
    fn test_next_rollup() {
        let policy = by_second();
        assert_eq!(TimeSeriesRollups::next_rollup(0, &policy).expect("next"), 1_000);
        assert_eq!(TimeSeriesRollups::next_rollup(999, &policy).expect("next"), 1_000);
        assert_eq!(TimeSeriesRollups::next_rollup(1_000, &policy).expect("next"), 2_000);
        assert_eq!(TimeSeriesRollups::next_rollup(-1, &policy).expect("next"), 0);
    }

    #[test]
    fn test_append_marks_earliest_bucket() {
        let storage = setup(vec![by_second()]);
        append(&storage, "HR", &[5_500]);
        append(&storage, "HR", &[2_100]);
        append(&storage, "HR", &[9_000]);

        let states = pending(&storage);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].entry.next_rollup_ms, base() + 3_000);
        assert_eq!(states[0].entry.policy_to_apply, "BySecond");
    }

    #[test]
    fn test_last_policy_is_not_marked() {
        let storage = setup(vec![by_second()]);
        append(&storage, "HR@BySecond", &[0]);
        append(&storage, "HR@Unknown", &[0]);
        assert!(pending(&storage).is_empty());
    }

    #[test]
    fn test_prepare_respects_due_time() {
        let storage = setup(vec![by_second()]);
        append(&storage, "HR", &[0]);
        let read = storage.database().environment().read();
        let rollups = storage.rollups();
        assert!(rollups.prepare_rollups(&read, base() + 999, 10).expect("prepare").is_empty());
        assert_eq!(rollups.prepare_rollups(&read, base() + 1_000, 10).expect("prepare").len(), 1);

        let key = SeriesSlice::new("users/1", "HR", "Users").key();
        assert!(rollups.has_pending_rollup_from(&read, &key, base() + 1_000).expect("pending"));
        assert!(!rollups.has_pending_rollup_from(&read, &key, base()).expect("pending"));
    }

    #[test]
    fn test_command_rolls_up_and_cascades() {
        let storage = setup(vec![
            by_second(),
            TimeSeriesPolicy::keep_forever("ByMinute", TimeValue::from_minutes(1)),
        ]);
        append(&storage, "HR", &[0, 400, 800, 1_200]);

        let db = Arc::clone(storage.database());
        let states = pending(&storage);
        let mut command = RollupTimeSeriesCommand::new(
            db.time_series_configuration().expect("configuration"),
            db.now(),
            states,
            true,
        );
        let rolled = db
            .environment()
            .write(|tx| command.execute(&storage, tx))
            .expect("rollup");
        assert_eq!(rolled, 1);

        let read = db.environment().read();
        let values = TimeSeriesReader::with_millis(&read, "users/1", "HR@BySecond", i64::MIN, i64::MAX, None)
            .values()
            .expect("values");
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].timestamp_millis(), base() + 999);
        assert_eq!(values[0].values, vec![0.0, 800.0, 0.0, 800.0, 1_200.0, 3.0]);

        let next = storage.rollups().prepare_rollups(&read, i64::MAX, 10).expect("prepare");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].entry.name, "HR@BySecond");
        assert_eq!(next[0].entry.policy_to_apply, "ByMinute");
    }

    #[test]
    fn test_replica_does_not_write() {
        let storage = setup(vec![by_second()]);
        append(&storage, "HR", &[0]);
        let db = Arc::clone(storage.database());
        let mut command = RollupTimeSeriesCommand::new(
            db.time_series_configuration().expect("configuration"),
            db.now(),
            pending(&storage),
            false,
        );
        let rolled = db
            .environment()
            .write(|tx| command.execute(&storage, tx))
            .expect("rollup");
        assert_eq!(rolled, 0);
        assert_eq!(pending(&storage).len(), 1);
    }

    fn execute(storage: &TimeSeriesStorage, configuration: TimeSeriesConfiguration) -> u64 {
        let db = Arc::clone(storage.database());
        let mut command =
            RollupTimeSeriesCommand::new(Arc::new(configuration), db.now(), pending(storage), true);
        db.environment()
            .write(|tx| command.execute(storage, tx))
            .expect("rollup")
    }

    #[test]
    fn test_entries_of_removed_policies_are_dropped() {
        let storage = setup(vec![by_second()]);
        append(&storage, "HR", &[0]);
        let mut without_policy = TimeSeriesConfiguration::new()
            .with_collection("Users", TimeSeriesCollectionConfiguration::new(vec![]));
        without_policy.initialize().expect("valid");
        assert_eq!(execute(&storage, without_policy), 0);
        assert!(pending(&storage).is_empty());

        append(&storage, "HR", &[10_000]);
        assert_eq!(pending(&storage).len(), 1);
        assert_eq!(execute(&storage, TimeSeriesConfiguration::new()), 0);
        assert!(pending(&storage).is_empty());
    }

    #[test]
    fn test_disabled_collection_keeps_entries_without_blocking_others() {
        let storage = setup(vec![by_second()]);
        let db = Arc::clone(storage.database());
        let active = |disabled: bool| {
            let mut users = TimeSeriesCollectionConfiguration::new(vec![by_second()]);
            users.disabled = disabled;
            let mut configuration = TimeSeriesConfiguration::new()
                .with_collection("Users", users)
                .with_collection("Orders", TimeSeriesCollectionConfiguration::new(vec![by_second()]));
            configuration.initialize().expect("valid");
            configuration
        };
        db.set_time_series_configuration(Some(Arc::new(active(false))));
        db.environment()
            .write(|tx| {
                DocumentStore::put(tx, "orders/1", "Orders", json!({}))?;
                storage.append_timestamp(
                    tx,
                    "orders/1",
                    "Orders",
                    "HR",
                    vec![TimeSeriesEntry::single(from_millis(base() + 5_000), 1.0)],
                    None,
                )
            })
            .expect("append");
        append(&storage, "HR", &[0]);

        let disabled = active(true);
        let first = {
            let read = db.environment().read();
            storage
                .rollups()
                .prepare_rollups_where(&read, i64::MAX, 1, |entry| {
                    disabled.collection(&entry.collection).map_or(true, |c| !c.disabled)
                })
                .expect("prepare")
        };
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].entry.collection, "Orders");

        assert_eq!(execute(&storage, disabled), 1);
        let left = pending(&storage);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].entry.collection, "Users");
    }

    #[test]
    fn test_add_new_policy_pages_over_series() {
        let storage = setup(vec![]);
        for doc in ["users/2", "users/3"] {
            storage
                .database()
                .environment()
                .write(|tx| DocumentStore::put(tx, doc, "Users", json!({})))
                .expect("document");
        }
        append(&storage, "HR", &[0]);
        for doc in ["users/2", "users/3"] {
            storage
                .database()
                .environment()
                .write(|tx| {
                    storage.append_timestamp(
                        tx,
                        doc,
                        "Users",
                        "HR",
                        vec![TimeSeriesEntry::single(from_millis(base()), 1.0)],
                        None,
                    )
                })
                .expect("append");
        }

        let raw = TimeSeriesPolicy::raw(TimeValue::INFINITE);
        let env = storage.database().environment();
        let (marked, last) = env
            .write(|tx| storage.rollups().add_new_policy(tx, "Users", &raw, &by_second(), None, 2))
            .expect("add");
        assert_eq!(marked, 2);
        let (marked, _) = env
            .write(|tx| {
                storage
                    .rollups()
                    .add_new_policy(tx, "Users", &raw, &by_second(), last.as_deref(), 2)
            })
            .expect("add");
        assert_eq!(marked, 1);
        assert_eq!(pending(&storage).len(), 3);
    }
}
