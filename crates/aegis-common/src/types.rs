//! Aegis Types - Core Data Types
//!
//! Fundamental data types used throughout the time-series storage core.
//! Provides type-safe identifiers for transactions, etags and cluster nodes.
//!
//! Key Features:
//! - Type-safe identifiers (TransactionId, Etag, NodeTag)
//! - Serialization support via serde
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Identifier Types
// =============================================================================

/// Unique identifier for storage transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

/// Monotonic per-database change counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Etag(pub i64);

impl Etag {
    pub const ZERO: Etag = Etag(0);

    pub fn next(self) -> Etag {
        Etag(self.0 + 1)
    }

    /// Big-endian bytes, so that byte order matches numeric order.
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short tag identifying a cluster node ("A", "B", ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeTag(pub String);

impl NodeTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_ordering() {
        let a = Etag(5);
        let b = a.next();
        assert!(b > a);
        assert!(a.to_be_bytes() < b.to_be_bytes());
        assert_eq!(b.to_string(), "6");
    }

    #[test]
    fn test_node_tag() {
        let tag: NodeTag = "A".into();
        assert_eq!(tag.as_str(), "A");
        assert_eq!(tag.to_string(), "A");
    }
}
