//! Aegis Table - Sorted Key/Value Tables
//!
//! In-memory sorted tables keyed by raw bytes, with an optional 64-bit
//! secondary index per row. Key order is plain byte order, so callers encode
//! numbers big-endian when they need numeric ordering inside a key.
//!
//! Key Features:
//! - Point reads, inserts and deletes by primary key
//! - Prefix-bounded forward and backward seeks
//! - Secondary index scans in both directions (duplicate index values allowed)
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

// =============================================================================
// Row
// =============================================================================

/// A stored value with its optional secondary index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub value: Bytes,
    pub index: Option<i64>,
}

impl Row {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            index: None,
        }
    }

    pub fn indexed(value: impl Into<Bytes>, index: i64) -> Self {
        Self {
            value: value.into(),
            index: Some(index),
        }
    }
}

// =============================================================================
// Table
// =============================================================================

/// A sorted table with a single secondary index.
#[derive(Debug, Clone, Default)]
pub struct Table {
    rows: BTreeMap<Vec<u8>, Row>,
    index: BTreeSet<(i64, Vec<u8>)>,
    bytes: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total key and value bytes held by the table.
    pub fn size_in_bytes(&self) -> usize {
        self.bytes
    }

    pub fn get(&self, key: &[u8]) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.rows.contains_key(key)
    }

    /// Insert or replace a row, returning the previous row.
    pub fn insert(&mut self, key: Vec<u8>, row: Row) -> Option<Row> {
        if let Some(index) = row.index {
            self.index.insert((index, key.clone()));
        }
        self.bytes += key.len() + row.value.len();

        let previous = self.rows.insert(key.clone(), row);
        if let Some(old) = &previous {
            self.bytes -= key.len() + old.value.len();
            if let Some(old_index) = old.index {
                let replaced = self.rows.get(&key).and_then(|r| r.index) == Some(old_index);
                if !replaced {
                    self.index.remove(&(old_index, key));
                }
            }
        }
        previous
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Row> {
        let row = self.rows.remove(key)?;
        if let Some(index) = row.index {
            self.index.remove(&(index, key.to_vec()));
        }
        self.bytes -= key.len() + row.value.len();
        Some(row)
    }

    /// Remove every row whose key starts with `prefix`.
    pub fn remove_prefix(&mut self, prefix: &[u8]) -> usize {
        let keys: Vec<Vec<u8>> = self.prefix(prefix).map(|(k, _)| k.to_vec()).collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    // -------------------------------------------------------------------------
    // Seeks
    // -------------------------------------------------------------------------

    /// All rows in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &Row)> {
        self.rows.iter().map(|(k, v)| (k.as_slice(), v))
    }

    /// Rows whose key starts with `prefix`, in key order.
    pub fn prefix<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (&'a [u8], &'a Row)> + 'a {
        self.seek_forward(prefix, prefix)
    }

    /// Rows with key >= `from` that still start with `prefix`, in key order.
    pub fn seek_forward<'a>(
        &'a self,
        prefix: &'a [u8],
        from: &[u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a Row)> + 'a {
        self.rows
            .range::<[u8], _>((Bound::Included(from), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v))
    }

    /// Rows with key > `after` that still start with `prefix`, in key order.
    pub fn seek_after<'a>(
        &'a self,
        prefix: &'a [u8],
        after: &[u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a Row)> + 'a {
        self.rows
            .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v))
    }

    /// The greatest row with key <= `key` that starts with `prefix`.
    pub fn seek_backward<'a>(&'a self, prefix: &[u8], key: &[u8]) -> Option<(&'a [u8], &'a Row)> {
        self.rows
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v))
    }

    /// Rows with key < `before` that start with `prefix`, greatest first.
    pub fn seek_before<'a>(
        &'a self,
        prefix: &'a [u8],
        before: &[u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a Row)> + 'a {
        self.rows
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(before)))
            .rev()
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v))
    }

    // -------------------------------------------------------------------------
    // Secondary Index
    // -------------------------------------------------------------------------

    /// Rows whose index value is >= `from`, in ascending index order.
    pub fn index_from(&self, from: i64) -> impl Iterator<Item = (i64, &[u8], &Row)> {
        self.index
            .range((Bound::Included((from, Vec::new())), Bound::Unbounded))
            .filter_map(move |(index, key)| {
                self.rows.get(key).map(|row| (*index, key.as_slice(), row))
            })
    }

    /// All indexed rows, highest index value first.
    pub fn index_rev(&self) -> impl Iterator<Item = (i64, &[u8], &Row)> {
        self.index.iter().rev().filter_map(move |(index, key)| {
            self.rows.get(key).map(|row| (*index, key.as_slice(), row))
        })
    }

    /// Rows whose index value is > `after`, in ascending index order.
    pub fn index_after(&self, after: i64) -> impl Iterator<Item = (i64, &[u8], &Row)> {
        after
            .checked_add(1)
            .into_iter()
            .flat_map(move |from| self.index_from(from))
    }
}

// =============================================================================
// Tests
// =============================================================================
