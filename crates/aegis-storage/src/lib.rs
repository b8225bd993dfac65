//! Aegis Storage - Transactional Sorted Table Engine
//!
//! Storage layer used by the time-series core. Provides named sorted tables
//! with a secondary index, serialized write transactions and snapshot reads.
//! Durability of the underlying media is outside this crate; the environment
//! keeps committed state in memory.
//!
//! Key Features:
//! - Byte-ordered tables with prefix seeks in both directions
//! - One secondary integer index per table, duplicates allowed
//! - Single-writer transactions with copy-on-write snapshots
//! - Async submission of write work via the blocking pool
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod merger;
pub mod table;
pub mod transaction;

pub use merger::TransactionMerger;
pub use table::{Row, Table};
pub use transaction::{
    ReadTransaction, StorageEnvironment, StorageStats, TableReader, TransactionState,
    WriteTransaction,
};
