//! Aegis Transaction - Snapshot Transactions over Sorted Tables
//!
//! Transaction management for the table environment. Write transactions are
//! serialized by a single writer lock and work on a copy-on-write view of the
//! table set; commit publishes the view atomically. Read transactions pin the
//! last committed snapshot and never block writers.
//!
//! Key Features:
//! - Single-writer serialized write transactions
//! - Snapshot reads isolated from concurrent commits
//! - Automatic rollback when a write transaction is dropped uncommitted
//! - Closure helper that commits on Ok and rolls back on Err
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::table::Table;
use aegis_common::{AegisError, Result, TransactionId};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type TableSet = HashMap<String, Arc<Table>>;

// =============================================================================
// Transaction State
// =============================================================================

/// Current state of a write transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

// =============================================================================
// Storage Statistics
// =============================================================================

/// Counters describing environment activity.
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub tables: usize,
    pub rows: usize,
    pub bytes: usize,
    pub commits: u64,
    pub rollbacks: u64,
    pub read_transactions: u64,
}

// =============================================================================
// Table Access
// =============================================================================

/// Read access shared by read and write transactions.
pub trait TableReader {
    /// Transaction identifier, for logging.
    fn id(&self) -> TransactionId;

    /// Look up a table by name.
    fn table(&self, name: &str) -> Option<&Table>;

    /// Names of all tables starting with `prefix`, sorted.
    fn table_names(&self, prefix: &str) -> Vec<String>;
}

fn sorted_names(tables: &TableSet, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = tables
        .keys()
        .filter(|name| name.starts_with(prefix))
        .cloned()
        .collect();
    names.sort();
    names
}

// =============================================================================
// Storage Environment
// =============================================================================

/// A set of named tables with transactional access.
pub struct StorageEnvironment {
    current: RwLock<Arc<TableSet>>,
    writer: Mutex<()>,
    next_tx_id: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    reads: AtomicU64,
}

impl StorageEnvironment {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            writer: Mutex::new(()),
            next_tx_id: AtomicU64::new(1),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    fn allocate_tx_id(&self) -> TransactionId {
        TransactionId(self.next_tx_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Open a read transaction on the last committed snapshot.
    pub fn read(&self) -> ReadTransaction {
        self.reads.fetch_add(1, Ordering::Relaxed);
        ReadTransaction {
            id: self.allocate_tx_id(),
            tables: Arc::clone(&self.current.read()),
        }
    }

    /// Begin a write transaction, waiting for any other writer to finish.
    pub fn begin_write(&self) -> WriteTransaction<'_> {
        let guard = self.writer.lock();
        let tables = (**self.current.read()).clone();
        let id = self.allocate_tx_id();
        tracing::trace!("begin write transaction {}", id.0);
        WriteTransaction {
            id,
            env: self,
            _guard: guard,
            tables,
            state: TransactionState::Active,
        }
    }

    /// Run `f` in a write transaction, committing on Ok and rolling back on Err.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T>,
    {
        let mut tx = self.begin_write();
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Get environment statistics.
    pub fn stats(&self) -> StorageStats {
        let tables = Arc::clone(&self.current.read());
        StorageStats {
            tables: tables.len(),
            rows: tables.values().map(|t| t.len()).sum(),
            bytes: tables.values().map(|t| t.size_in_bytes()).sum(),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            read_transactions: self.reads.load(Ordering::Relaxed),
        }
    }
}

impl Default for StorageEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Read Transaction
// =============================================================================

/// A read-only view of one committed snapshot.
pub struct ReadTransaction {
    id: TransactionId,
    tables: Arc<TableSet>,
}

impl TableReader for ReadTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    fn table_names(&self, prefix: &str) -> Vec<String> {
        sorted_names(&self.tables, prefix)
    }
}

// =============================================================================
// Write Transaction
// =============================================================================

/// The single active writer. Dropping it without commit rolls back.
pub struct WriteTransaction<'env> {
    id: TransactionId,
    env: &'env StorageEnvironment,
    _guard: MutexGuard<'env, ()>,
    tables: TableSet,
    state: TransactionState,
}

impl WriteTransaction<'_> {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Mutable access to a table, creating it when missing.
    pub fn table_mut(&mut self, name: &str) -> &mut Table {
        let entry = self.tables.entry(name.to_string()).or_default();
        Arc::make_mut(entry)
    }

    /// Mutable access to an existing table.
    pub fn existing_table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name).map(Arc::make_mut)
    }

    pub fn drop_table(&mut self, name: &str) -> bool {
        self.tables.remove(name).is_some()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(AegisError::Transaction(
                "Transaction already committed".to_string(),
            )),
            TransactionState::RolledBack => Err(AegisError::Transaction(
                "Transaction was rolled back".to_string(),
            )),
        }
    }

    /// Publish all changes as the new committed snapshot.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let tables = std::mem::take(&mut self.tables);
        *self.env.current.write() = Arc::new(tables);
        self.state = TransactionState::Committed;
        self.env.commits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("committed write transaction {}", self.id.0);
        Ok(())
    }

    /// Discard all changes.
    pub fn rollback(mut self) -> Result<()> {
        self.mark_rolled_back();
        Ok(())
    }

    fn mark_rolled_back(&mut self) {
        if self.state == TransactionState::Active {
            self.tables.clear();
            self.state = TransactionState::RolledBack;
            self.env.rollbacks.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("rolled back write transaction {}", self.id.0);
        }
    }
}

impl TableReader for WriteTransaction<'_> {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    fn table_names(&self, prefix: &str) -> Vec<String> {
        sorted_names(&self.tables, prefix)
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        self.mark_rolled_back();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Row;

    #[test]
    fn test_commit_publishes_changes() {
        let env = StorageEnvironment::new();
        let mut tx = env.begin_write();
        tx.table_mut("docs").insert(b"k".to_vec(), Row::new("v"));
        assert!(tx.table("docs").is_some());
        tx.commit().expect("commit should succeed");

        let read = env.read();
        let row = read.table("docs").and_then(|t| t.get(b"k")).expect("row");
        assert_eq!(row.value.as_ref(), b"v");
        assert_eq!(env.stats().commits, 1);
    }

    #[test]
    fn test_drop_rolls_back() {
        let env = StorageEnvironment::new();
        {
            let mut tx = env.begin_write();
            tx.table_mut("docs").insert(b"k".to_vec(), Row::new("v"));
        }
        assert!(env.read().table("docs").is_none());
        assert_eq!(env.stats().rollbacks, 1);
    }

    #[test]
    fn test_snapshot_isolation() {
        let env = StorageEnvironment::new();
        env.write(|tx| {
            tx.table_mut("docs").insert(b"a".to_vec(), Row::new("1"));
            Ok(())
        })
        .expect("write should succeed");

        let snapshot = env.read();
        env.write(|tx| {
            tx.table_mut("docs").insert(b"b".to_vec(), Row::new("2"));
            Ok(())
        })
        .expect("write should succeed");

        assert_eq!(snapshot.table("docs").map(|t| t.len()), Some(1));
        assert_eq!(env.read().table("docs").map(|t| t.len()), Some(2));
    }

    #[test]
    fn test_write_error_rolls_back() {
        let env = StorageEnvironment::new();
        let result: Result<()> = env.write(|tx| {
            tx.table_mut("docs").insert(b"a".to_vec(), Row::new("1"));
            Err(AegisError::InvalidValue("boom".into()))
        });

        assert!(result.is_err());
        assert!(env.read().table("docs").is_none());
    }

    #[test]
    fn test_table_names_by_prefix() {
        let env = StorageEnvironment::new();
        env.write(|tx| {
            tx.table_mut("stats/users").insert(b"a".to_vec(), Row::new(""));
            tx.table_mut("stats/orders").insert(b"a".to_vec(), Row::new(""));
            tx.table_mut("segments").insert(b"a".to_vec(), Row::new(""));
            Ok(())
        })
        .expect("write should succeed");

        assert_eq!(
            env.read().table_names("stats/"),
            vec!["stats/orders".to_string(), "stats/users".to_string()]
        );
    }

    #[test]
    fn test_writers_are_serialized() {
        let env = Arc::new(StorageEnvironment::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let env = Arc::clone(&env);
                std::thread::spawn(move || {
                    env.write(|tx| {
                        let table = tx.table_mut("counter");
                        let current = table
                            .get(b"n")
                            .map(|r| r.value[0])
                            .unwrap_or(0);
                        table.insert(b"n".to_vec(), Row::new(vec![current + 1]));
                        table.insert(vec![i], Row::new(""));
                        Ok(())
                    })
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("thread").expect("write");
        }

        let read = env.read();
        let table = read.table("counter").expect("table");
        assert_eq!(table.get(b"n").map(|r| r.value[0]), Some(8));
    }
}
