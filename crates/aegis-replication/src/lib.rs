//! Aegis Replication - Change Tracking for Replicated Data
//!
//! The pieces of replication the time-series core depends on: change vectors
//! that describe what a piece of data has observed, conflict detection between
//! local and incoming data, and database topology for choosing the node that
//! runs background work.
//!
//! Key Features:
//! - Change vector parsing, formatting and merging
//! - AlreadyMerged / Update / Conflict classification
//! - Ordered database membership with a primary node
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod change_vector;
pub mod topology;

pub use change_vector::{
    conflict_status, merge_vectors, ChangeVector, ChangeVectorEntry, ConflictStatus,
};
pub use topology::{DatabaseTopology, NodeStatus};
