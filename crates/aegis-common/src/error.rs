//! Aegis Error - Unified Error Types
//!
//! Error handling for the time-series storage core. Categorizes errors by
//! domain (storage, transaction, validation, replication, configuration) and
//! provides helpers for deciding whether an operation should be retried,
//! reported to the caller, or treated as a shutdown signal.
//!
//! Key Features:
//! - Domain-specific error variants for precise error handling
//! - Retryable error detection for background loops
//! - Seamless integration with std::io::Error
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Unified error type for all Aegis operations.
#[derive(Error, Debug)]
pub enum AegisError {
    // Storage errors
    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("segment too large: {0} bytes")]
    SegmentTooLarge(usize),

    // Transaction errors
    #[error("transaction error: {0}")]
    Transaction(String),

    // Validation errors
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    // Replication errors
    #[error("invalid change vector: {0}")]
    InvalidChangeVector(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,
}

// =============================================================================
// Type Aliases
// =============================================================================

/// Result type alias for Aegis operations.
pub type Result<T> = std::result::Result<T, AegisError>;

// =============================================================================
// Error Classification
// =============================================================================

impl AegisError {
    /// Returns true if the operation can be safely retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AegisError::Transaction(_) | AegisError::Io(_))
    }

    /// Returns true if this error signals that the caller asked to stop.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AegisError::Cancelled)
    }
}

// =============================================================================
// Tests
// =============================================================================
