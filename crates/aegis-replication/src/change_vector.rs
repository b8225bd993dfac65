//! Aegis Change Vectors
//!
//! Change vectors record, per database instance, the highest etag a piece of
//! data has observed. They are written as `A:5-dbid, B:3-dbid2` and compared
//! entry by entry (keyed by database id) to decide whether incoming replicated
//! data is already known, strictly newer, or concurrent with local data.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use aegis_common::{AegisError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Change Vector Entry
// =============================================================================

/// One `node:etag-dbid` component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeVectorEntry {
    pub node_tag: String,
    pub etag: i64,
    pub db_id: String,
}

impl ChangeVectorEntry {
    pub fn new(node_tag: impl Into<String>, etag: i64, db_id: impl Into<String>) -> Self {
        Self {
            node_tag: node_tag.into(),
            etag,
            db_id: db_id.into(),
        }
    }
}

impl fmt::Display for ChangeVectorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}", self.node_tag, self.etag, self.db_id)
    }
}

impl FromStr for ChangeVectorEntry {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || AegisError::InvalidChangeVector(s.to_string());

        let (node_tag, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (etag, db_id) = rest.split_once('-').ok_or_else(invalid)?;
        if node_tag.is_empty() || db_id.is_empty() {
            return Err(invalid());
        }
        let etag = etag.parse::<i64>().map_err(|_| invalid())?;

        Ok(Self::new(node_tag, etag, db_id))
    }
}

// =============================================================================
// Conflict Status
// =============================================================================

/// Outcome of comparing a remote change vector against a local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStatus {
    /// Local already contains everything the remote has seen.
    AlreadyMerged,
    /// Remote is strictly newer than local.
    Update,
    /// Each side has seen something the other has not.
    Conflict,
}

// =============================================================================
// Change Vector
// =============================================================================

/// A set of entries, at most one per database id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeVector {
    entries: Vec<ChangeVectorEntry>,
}

impl ChangeVector {
    /// Create a new empty change vector.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A vector holding a single freshly generated entry.
    pub fn single(node_tag: impl Into<String>, etag: i64, db_id: impl Into<String>) -> Self {
        Self {
            entries: vec![ChangeVectorEntry::new(node_tag, etag, db_id)],
        }
    }

    /// Parse the textual form. The empty string is the empty vector.
    pub fn parse(s: &str) -> Result<Self> {
        let mut vector = ChangeVector::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            vector.observe(part.parse()?);
        }
        Ok(vector)
    }

    pub fn entries(&self) -> &[ChangeVectorEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Etag observed for a database id, 0 when absent.
    pub fn get(&self, db_id: &str) -> i64 {
        self.entries
            .iter()
            .find(|e| e.db_id == db_id)
            .map(|e| e.etag)
            .unwrap_or(0)
    }

    /// Record an entry, keeping the larger etag for its database id.
    pub fn observe(&mut self, entry: ChangeVectorEntry) {
        match self.entries.iter_mut().find(|e| e.db_id == entry.db_id) {
            Some(existing) => {
                if entry.etag > existing.etag {
                    *existing = entry;
                }
            }
            None => {
                self.entries.push(entry);
                self.entries
                    .sort_by(|a, b| a.node_tag.cmp(&b.node_tag).then(a.db_id.cmp(&b.db_id)));
            }
        }
    }

    /// Merge with another vector (maximum etag per database id).
    pub fn merge(&mut self, other: &ChangeVector) {
        for entry in &other.entries {
            self.observe(entry.clone());
        }
    }

    /// Create a merged vector without modifying self.
    pub fn merged(&self, other: &ChangeVector) -> ChangeVector {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compare `remote` against `local`.
    pub fn compare(remote: &ChangeVector, local: &ChangeVector) -> ConflictStatus {
        if remote.is_empty() {
            return ConflictStatus::AlreadyMerged;
        }
        if local.is_empty() {
            return ConflictStatus::Update;
        }

        let remote_has_larger = remote
            .entries
            .iter()
            .any(|e| e.etag > local.get(&e.db_id));
        let local_has_larger = local
            .entries
            .iter()
            .any(|e| e.etag > remote.get(&e.db_id));

        match (remote_has_larger, local_has_larger) {
            (true, false) => ConflictStatus::Update,
            (true, true) => ConflictStatus::Conflict,
            _ => ConflictStatus::AlreadyMerged,
        }
    }
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = AegisError;

    fn from_str(s: &str) -> Result<Self> {
        ChangeVector::parse(s)
    }
}

// =============================================================================
// String Helpers
// =============================================================================

/// Compare two textual change vectors, short-circuiting identical strings.
pub fn conflict_status(remote: &str, local: &str) -> Result<ConflictStatus> {
    if remote == local || remote.trim().is_empty() {
        return Ok(ConflictStatus::AlreadyMerged);
    }
    if local.trim().is_empty() {
        return Ok(ConflictStatus::Update);
    }
    Ok(ChangeVector::compare(
        &ChangeVector::parse(remote)?,
        &ChangeVector::parse(local)?,
    ))
}

/// Merge two textual change vectors.
pub fn merge_vectors(a: &str, b: &str) -> Result<String> {
    let merged = ChangeVector::parse(a)?.merged(&ChangeVector::parse(b)?);
    Ok(merged.to_string())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_and_display() {
        let cv = ChangeVector::parse("B:3-db2, A:5-db1").expect("parse");
        assert_eq!(cv.entries().len(), 2);
        assert_eq!(cv.get("db1"), 5);
        assert_eq!(cv.get("db2"), 3);
        assert_eq!(cv.get("db3"), 0);
        assert_eq!(cv.to_string(), "A:5-db1, B:3-db2");

        assert!(ChangeVector::parse("").expect("empty").is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ChangeVector::parse("A5-db1").is_err());
        assert!(ChangeVector::parse("A:x-db1").is_err());
        assert!(ChangeVector::parse("A:5").is_err());
        assert!(ChangeVector::parse(":5-db1").is_err());
    }

    #[test]
    fn test_db_id_may_contain_dashes() {
        let entry: ChangeVectorEntry = "A:7-abc-def".parse().expect("parse");
        assert_eq!(entry.etag, 7);
        assert_eq!(entry.db_id, "abc-def");
    }

    #[test]
    fn test_merge_takes_maximum() {
        let a = ChangeVector::parse("A:5-db1, B:1-db2").expect("parse");
        let b = ChangeVector::parse("A:3-db1, B:4-db2, C:1-db3").expect("parse");
        let merged = a.merged(&b);
        assert_eq!(merged.to_string(), "A:5-db1, B:4-db2, C:1-db3");
    }

    #[test]
    fn test_conflict_status() {
        let status = |r: &str, l: &str| conflict_status(r, l).expect("status");

        assert_eq!(status("A:5-db1", "A:5-db1"), ConflictStatus::AlreadyMerged);
        assert_eq!(status("", "A:5-db1"), ConflictStatus::AlreadyMerged);
        assert_eq!(status("A:5-db1", ""), ConflictStatus::Update);
        assert_eq!(status("A:6-db1", "A:5-db1"), ConflictStatus::Update);
        assert_eq!(status("A:4-db1", "A:5-db1"), ConflictStatus::AlreadyMerged);
        assert_eq!(
            status("A:6-db1, B:1-db2", "A:7-db1"),
            ConflictStatus::Conflict
        );
        assert_eq!(
            status("A:5-db1", "A:5-db1, B:2-db2"),
            ConflictStatus::AlreadyMerged
        );
    }

    fn arb_vector() -> impl Strategy<Value = ChangeVector> {
        prop::collection::vec((0usize..4, 1i64..1000), 0..4).prop_map(|parts| {
            let mut cv = ChangeVector::new();
            for (db, etag) in parts {
                cv.observe(ChangeVectorEntry::new(
                    format!("N{}", db),
                    etag,
                    format!("db{}", db),
                ));
            }
            cv
        })
    }

    proptest! {
        #[test]
        fn prop_merged_vector_contains_both(a in arb_vector(), b in arb_vector()) {
            let merged = a.merged(&b);
            prop_assert_eq!(ChangeVector::compare(&a, &merged), ConflictStatus::AlreadyMerged);
            prop_assert_eq!(ChangeVector::compare(&b, &merged), ConflictStatus::AlreadyMerged);
            prop_assert_eq!(merged.to_string(), b.merged(&a).to_string());
        }

        #[test]
        fn prop_display_round_trips(a in arb_vector()) {
            let parsed = ChangeVector::parse(&a.to_string()).expect("parse");
            prop_assert_eq!(parsed, a);
        }
    }
}
