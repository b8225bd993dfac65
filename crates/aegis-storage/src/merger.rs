//! Aegis Merger - Async Write Submission
//!
//! Bridges async callers to the blocking single-writer environment. Work is
//! handed to the tokio blocking pool so that a long write transaction never
//! stalls the async executor driving background loops.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::transaction::{StorageEnvironment, WriteTransaction};
use aegis_common::{AegisError, Result};
use std::sync::Arc;

// =============================================================================
// Transaction Merger
// =============================================================================

/// Submits write work from async code.
#[derive(Clone)]
pub struct TransactionMerger {
    env: Arc<StorageEnvironment>,
}

impl TransactionMerger {
    pub fn new(env: Arc<StorageEnvironment>) -> Self {
        Self { env }
    }

    pub fn environment(&self) -> &Arc<StorageEnvironment> {
        &self.env
    }

    /// Run `f` in its own write transaction on the blocking pool.
    pub async fn enqueue<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T> + Send + 'static,
    {
        let env = Arc::clone(&self.env);
        tokio::task::spawn_blocking(move || env.write(f))
            .await
            .map_err(|e| AegisError::Internal(format!("write task failed: {}", e)))?
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Row;
    use crate::transaction::TableReader;

    #[tokio::test]
    async fn test_enqueue_commits() {
        let merger = TransactionMerger::new(Arc::new(StorageEnvironment::new()));
        let written = merger
            .enqueue(|tx| {
                tx.table_mut("docs").insert(b"k".to_vec(), Row::new("v"));
                Ok(1usize)
            })
            .await
            .expect("enqueue should succeed");

        assert_eq!(written, 1);
        let read = merger.environment().read();
        assert!(read.table("docs").and_then(|t| t.get(b"k")).is_some());
    }

    #[tokio::test]
    async fn test_enqueue_propagates_errors() {
        let merger = TransactionMerger::new(Arc::new(StorageEnvironment::new()));
        let result: Result<()> = merger
            .enqueue(|_| Err(AegisError::Cancelled))
            .await;
        assert!(matches!(result, Err(AegisError::Cancelled)));
    }
}
