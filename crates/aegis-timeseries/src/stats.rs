//! Aegis Time Series Statistics
//!
//! Per-collection bookkeeping of every series: live sample count, first and
//! last live timestamp, and the policy the series belongs to. The background
//! runner uses these rows to find series per policy and series holding data
//! older than a retention cutoff.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::policy::RAW_POLICY_NAME;
use crate::slicer::{policy_of_series, series_key};
use crate::tables::{stats_table, stats_table_prefix, StatsRow};
use aegis_common::Result;
use aegis_storage::{TableReader, WriteTransaction};
use std::collections::BTreeSet;

/// Lowercased policy name a series belongs to.
pub fn policy_of(name: &str) -> String {
    policy_of_series(name)
        .unwrap_or(RAW_POLICY_NAME)
        .to_lowercase()
}

// =============================================================================
// Stats Store
// =============================================================================

/// Stateless accessors over the statistics tables.
pub struct SeriesStatsStore;

impl SeriesStatsStore {
    pub fn get(
        tx: &impl TableReader,
        collection: &str,
        document_id: &str,
        name: &str,
    ) -> Result<Option<StatsRow>> {
        match tx
            .table(&stats_table(collection))
            .and_then(|t| t.get(&series_key(document_id, name)))
        {
            Some(row) => Ok(Some(StatsRow::from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Look a series up without knowing its collection.
    pub fn find(tx: &impl TableReader, document_id: &str, name: &str) -> Result<Option<StatsRow>> {
        let key = series_key(document_id, name);
        for table_name in tx.table_names(stats_table_prefix()) {
            if let Some(row) = tx.table(&table_name).and_then(|t| t.get(&key)) {
                return Ok(Some(StatsRow::from_row(row)?));
            }
        }
        Ok(None)
    }

    /// Store the row, or drop it once the series holds no live samples.
    pub fn put(tx: &mut WriteTransaction<'_>, row: &StatsRow) -> Result<()> {
        let key = series_key(&row.document_id, &row.name);
        let table = tx.table_mut(&stats_table(&row.collection));
        if row.count == 0 {
            table.remove(&key);
        } else {
            table.insert(key, row.to_row()?);
        }
        Ok(())
    }

    pub fn remove(tx: &mut WriteTransaction<'_>, collection: &str, document_id: &str, name: &str) {
        if let Some(table) = tx.existing_table_mut(&stats_table(collection)) {
            table.remove(&series_key(document_id, name));
        }
    }

    /// Remove every row of a document, returning the removed rows.
    pub fn remove_document(
        tx: &mut WriteTransaction<'_>,
        collection: &str,
        document_id: &str,
    ) -> Result<Vec<StatsRow>> {
        let prefix = crate::slicer::document_prefix(document_id);
        let table = tx.table_mut(&stats_table(collection));
        let rows = table
            .prefix(&prefix)
            .map(|(_, row)| StatsRow::from_row(row))
            .collect::<Result<Vec<_>>>()?;
        table.remove_prefix(&prefix);
        Ok(rows)
    }

    /// Distinct lowercased policy names with live series in a collection.
    pub fn policies_in_collection(tx: &impl TableReader, collection: &str) -> Result<BTreeSet<String>> {
        let mut policies = BTreeSet::new();
        if let Some(table) = tx.table(&stats_table(collection)) {
            for (_, row) in table.iter() {
                policies.insert(StatsRow::from_row(row)?.policy);
            }
        }
        Ok(policies)
    }

    /// Series of one policy in key order, resuming after `after` when given.
    pub fn series_of_policy(
        tx: &impl TableReader,
        collection: &str,
        policy: &str,
        after: Option<&[u8]>,
        take: usize,
    ) -> Result<Vec<(Vec<u8>, StatsRow)>> {
        let policy = policy.to_lowercase();
        let table = match tx.table(&stats_table(collection)) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };

        let mut result = Vec::new();
        let rows: Box<dyn Iterator<Item = (&[u8], &aegis_storage::Row)> + '_> = match after {
            Some(after) => Box::new(table.seek_after(&[], after)),
            None => Box::new(table.iter()),
        };
        for (key, row) in rows {
            if result.len() >= take {
                break;
            }
            let stats = StatsRow::from_row(row)?;
            if stats.policy == policy {
                result.push((key.to_vec(), stats));
            }
        }
        Ok(result)
    }

    /// Series of one policy whose first live sample is before `cutoff_ms`,
    /// ordered by that first sample.
    pub fn series_starting_before(
        tx: &impl TableReader,
        collection: &str,
        policy: &str,
        cutoff_ms: i64,
    ) -> Result<Vec<StatsRow>> {
        let policy = policy.to_lowercase();
        let table = match tx.table(&stats_table(collection)) {
            Some(table) => table,
            None => return Ok(Vec::new()),
        };

        let mut result = Vec::new();
        for (start, _, row) in table.index_from(i64::MIN) {
            if start >= cutoff_ms {
                break;
            }
            let stats = StatsRow::from_row(row)?;
            if stats.policy == policy {
                result.push(stats);
            }
        }
        Ok(result)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_storage::StorageEnvironment;

    fn stats(doc: &str, name: &str, start_ms: i64) -> StatsRow {
        StatsRow {
            document_id: doc.to_string(),
            name: name.to_string(),
            collection: "Users".to_string(),
            policy: policy_of(name),
            count: 10,
            start_ms,
            end_ms: start_ms + 100,
        }
    }

    #[test]
    fn test_policy_of() {
        assert_eq!(policy_of("Heartrate"), "rawpolicy");
        assert_eq!(policy_of("Heartrate@ByHour"), "byhour");
    }

    #[test]
    fn test_put_get_and_drop_at_zero() {
        let env = StorageEnvironment::new();
        env.write(|tx| SeriesStatsStore::put(tx, &stats("users/1", "HR", 5)))
            .expect("put");
        let found = SeriesStatsStore::find(&env.read(), "Users/1", "hr")
            .expect("find")
            .expect("exists");
        assert_eq!(found.count, 10);

        let mut empty = found.clone();
        empty.count = 0;
        env.write(|tx| SeriesStatsStore::put(tx, &empty)).expect("put");
        assert!(SeriesStatsStore::get(&env.read(), "Users", "users/1", "HR")
            .expect("get")
            .is_none());
    }

    #[test]
    fn test_policy_queries() {
        let env = StorageEnvironment::new();
        env.write(|tx| {
            SeriesStatsStore::put(tx, &stats("users/1", "HR", 50))?;
            SeriesStatsStore::put(tx, &stats("users/2", "HR", 10))?;
            SeriesStatsStore::put(tx, &stats("users/1", "HR@ByHour", 0))?;
            Ok(())
        })
        .expect("write");

        let read = env.read();
        let policies = SeriesStatsStore::policies_in_collection(&read, "users").expect("policies");
        assert_eq!(
            policies.into_iter().collect::<Vec<_>>(),
            vec!["byhour".to_string(), "rawpolicy".to_string()]
        );

        let first = SeriesStatsStore::series_of_policy(&read, "Users", "RawPolicy", None, 1)
            .expect("series");
        assert_eq!(first.len(), 1);
        let rest = SeriesStatsStore::series_of_policy(&read, "Users", "rawpolicy", Some(&first[0].0), 10)
            .expect("series");
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0].1.document_id, first[0].1.document_id);

        let old = SeriesStatsStore::series_starting_before(&read, "Users", "rawpolicy", 20)
            .expect("series");
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].document_id, "users/2");
    }

    #[test]
    fn test_remove_document() {
        let env = StorageEnvironment::new();
        env.write(|tx| {
            SeriesStatsStore::put(tx, &stats("users/1", "HR", 50))?;
            SeriesStatsStore::put(tx, &stats("users/1", "HR@ByHour", 50))?;
            SeriesStatsStore::put(tx, &stats("users/10", "HR", 50))?;
            let removed = SeriesStatsStore::remove_document(tx, "Users", "users/1")?;
            assert_eq!(removed.len(), 2);
            Ok(())
        })
        .expect("write");
        assert!(SeriesStatsStore::find(&env.read(), "users/10", "hr")
            .expect("find")
            .is_some());
    }
}
