//! Aegis Time Series Database Context
//!
//! The per-database state the time-series core runs against: the table
//! environment, the etag sequence, the database-wide change vector, the
//! topology deciding which node is primary, and the clock.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::policy::TimeSeriesConfiguration;
use aegis_common::{DatabaseConfig, Etag, NodeTag, Result};
use aegis_replication::{ChangeVector, ChangeVectorEntry, DatabaseTopology};
use aegis_storage::{StorageEnvironment, TransactionMerger};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

// =============================================================================
// Document Database
// =============================================================================

/// One database hosted on one node.
pub struct DocumentDatabase {
    config: DatabaseConfig,
    env: Arc<StorageEnvironment>,
    merger: TransactionMerger,
    last_etag: AtomicI64,
    global_change_vector: RwLock<ChangeVector>,
    topology: RwLock<DatabaseTopology>,
    time_override: RwLock<Option<DateTime<Utc>>>,
    time_series_configuration: RwLock<Option<Arc<TimeSeriesConfiguration>>>,
}

impl DocumentDatabase {
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        let env = Arc::new(StorageEnvironment::new());
        let topology = DatabaseTopology::single(config.node_tag.clone());
        tracing::info!(
            "opening database '{}' on node {} ({})",
            config.name,
            config.node_tag,
            config.database_id
        );
        Arc::new(Self {
            merger: TransactionMerger::new(Arc::clone(&env)),
            env,
            config,
            last_etag: AtomicI64::new(0),
            global_change_vector: RwLock::new(ChangeVector::new()),
            topology: RwLock::new(topology),
            time_override: RwLock::new(None),
            time_series_configuration: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn node_tag(&self) -> &NodeTag {
        &self.config.node_tag
    }

    pub fn database_id(&self) -> &str {
        &self.config.database_id
    }

    pub fn environment(&self) -> &Arc<StorageEnvironment> {
        &self.env
    }

    pub fn merger(&self) -> &TransactionMerger {
        &self.merger
    }

    // -------------------------------------------------------------------------
    // Etags and Change Vectors
    // -------------------------------------------------------------------------

    /// Allocate the next etag.
    pub fn next_etag(&self) -> Etag {
        Etag(self.last_etag.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn last_etag(&self) -> Etag {
        Etag(self.last_etag.load(Ordering::SeqCst))
    }

    /// Stamp a local write: this node's entry merged into the database vector.
    pub fn new_change_vector(&self, etag: Etag) -> String {
        let mut global = self.global_change_vector.write();
        global.observe(ChangeVectorEntry::new(
            self.config.node_tag.as_str(),
            etag.0,
            self.config.database_id.as_str(),
        ));
        global.to_string()
    }

    /// Fold a replicated change vector into the database vector.
    pub fn observe_change_vector(&self, change_vector: &str) -> Result<()> {
        let remote = ChangeVector::parse(change_vector)?;
        self.global_change_vector.write().merge(&remote);
        Ok(())
    }

    pub fn global_change_vector(&self) -> String {
        self.global_change_vector.read().to_string()
    }

    // -------------------------------------------------------------------------
    // Topology
    // -------------------------------------------------------------------------

    pub fn topology(&self) -> DatabaseTopology {
        self.topology.read().clone()
    }

    pub fn set_topology(&self, topology: DatabaseTopology) {
        *self.topology.write() = topology;
    }

    /// True when this node runs rollups and retention for the database.
    pub fn is_primary(&self) -> bool {
        self.topology.read().is_primary(&self.config.node_tag)
    }

    // -------------------------------------------------------------------------
    // Time Series Configuration
    // -------------------------------------------------------------------------

    /// Configuration of the running policy runner, if any.
    pub fn time_series_configuration(&self) -> Option<Arc<TimeSeriesConfiguration>> {
        self.time_series_configuration.read().clone()
    }

    pub fn set_time_series_configuration(&self, configuration: Option<Arc<TimeSeriesConfiguration>>) {
        *self.time_series_configuration.write() = configuration;
    }

    // -------------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------------

    pub fn now(&self) -> DateTime<Utc> {
        self.time_override.read().unwrap_or_else(Utc::now)
    }

    /// Pin the clock to a fixed time, or release it with `None`.
    pub fn set_time(&self, time: Option<DateTime<Utc>>) {
        *self.time_override.write() = time;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_etags_are_monotonic() {
        let db = DocumentDatabase::new(DatabaseConfig::development());
        let a = db.next_etag();
        let b = db.next_etag();
        assert!(b > a);
        assert_eq!(db.last_etag(), b);
    }

    #[test]
    fn test_change_vectors_accumulate() {
        let db = DocumentDatabase::new(DatabaseConfig::for_node("db", "A", "dbA"));
        let etag = db.next_etag();
        assert_eq!(db.new_change_vector(etag), "A:1-dbA");

        db.observe_change_vector("B:7-dbB").expect("observe");
        let etag = db.next_etag();
        assert_eq!(db.new_change_vector(etag), "A:2-dbA, B:7-dbB");
        assert!(db.observe_change_vector("garbage").is_err());
    }

    #[test]
    fn test_primary_follows_topology() {
        let db = DocumentDatabase::new(DatabaseConfig::for_node("db", "B", "dbB"));
        assert!(db.is_primary());

        db.set_topology(DatabaseTopology::new(["A".into(), "B".into()]));
        assert!(!db.is_primary());
    }

    #[test]
    fn test_clock_override() {
        let db = DocumentDatabase::new(DatabaseConfig::development());
        let pinned = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        db.set_time(Some(pinned));
        assert_eq!(db.now(), pinned);
        db.set_time(None);
        assert!(db.now() > pinned);
    }
}
