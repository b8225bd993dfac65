//! Aegis Common - Shared Types and Utilities
//!
//! Foundational types, error handling, and utilities used across the Aegis
//! time-series storage core. Provides the core abstractions that enable
//! consistent behavior across the table engine, replication and time-series
//! layers.
//!
//! Key Features:
//! - Unified error types with retryable error detection
//! - Core identifiers (TransactionId, Etag, NodeTag)
//! - Configuration structures loaded from TOML
//! - Utility functions for checksums and millisecond time handling
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

pub mod config;
pub mod error;
pub mod types;
pub mod utils;

pub use config::{DatabaseConfig, TimeSeriesEngineConfig};
pub use error::{AegisError, Result};
pub use types::*;
