//! Aegis Time Series Documents
//!
//! Minimal JSON document store owning the series. Only what the time-series
//! core needs: documents with an `@metadata` object carrying the collection
//! name and the sorted list of series names attached to the document.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::slicer::validate_document_id;
use crate::tables::DOCUMENTS_TABLE;
use aegis_common::utils::cmp_ignore_case;
use aegis_common::{AegisError, Result};
use aegis_storage::{Row, TableReader, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// =============================================================================
// Metadata Keys
// =============================================================================

pub const METADATA: &str = "@metadata";
pub const COLLECTION: &str = "@collection";
pub const TIME_SERIES: &str = "@timeseries";
pub const FLAGS: &str = "@flags";
pub const HAS_TIME_SERIES: &str = "HasTimeSeries";

// =============================================================================
// Document
// =============================================================================

/// A stored JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn collection(&self) -> Option<&str> {
        self.metadata()?.get(COLLECTION)?.as_str()
    }

    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.data.get(METADATA)?.as_object()
    }

    /// Series names listed in the metadata, in stored order.
    pub fn time_series_names(&self) -> Vec<String> {
        self.metadata()
            .and_then(|m| m.get(TIME_SERIES))
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_time_series_flag(&self) -> bool {
        self.metadata()
            .and_then(|m| m.get(FLAGS))
            .and_then(Value::as_str)
            .map_or(false, |flags| flags.split(',').any(|f| f.trim() == HAS_TIME_SERIES))
    }

    fn metadata_mut(&mut self) -> Result<&mut Map<String, Value>> {
        let root = self
            .data
            .as_object_mut()
            .ok_or_else(|| AegisError::InvalidValue(format!("document {} is not an object", self.id)))?;
        root.entry(METADATA)
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| AegisError::InvalidValue(format!("document {} has bad metadata", self.id)))
    }
}

fn document_key(id: &str) -> Vec<u8> {
    id.to_lowercase().into_bytes()
}

// =============================================================================
// Document Store
// =============================================================================

/// Stateless accessors over the documents table.
pub struct DocumentStore;

impl DocumentStore {
    /// Store a document, stamping its collection into the metadata.
    pub fn put(
        tx: &mut WriteTransaction<'_>,
        id: &str,
        collection: &str,
        data: Value,
    ) -> Result<()> {
        validate_document_id(id)?;
        let mut document = Document {
            id: id.to_string(),
            data,
        };
        if !document.data.is_object() {
            return Err(AegisError::InvalidValue(format!(
                "document {} must be a JSON object",
                id
            )));
        }
        document
            .metadata_mut()?
            .insert(COLLECTION.to_string(), Value::String(collection.to_string()));
        Self::write(tx, &document)
    }

    pub fn get(tx: &impl TableReader, id: &str) -> Result<Option<Document>> {
        let row = match tx.table(DOCUMENTS_TABLE).and_then(|t| t.get(&document_key(id))) {
            Some(row) => row,
            None => return Ok(None),
        };
        serde_json::from_slice(&row.value)
            .map(Some)
            .map_err(|e| AegisError::Serialization(e.to_string()))
    }

    pub fn exists(tx: &impl TableReader, id: &str) -> bool {
        tx.table(DOCUMENTS_TABLE)
            .map_or(false, |t| t.contains_key(&document_key(id)))
    }

    pub fn delete(tx: &mut WriteTransaction<'_>, id: &str) -> bool {
        tx.table_mut(DOCUMENTS_TABLE)
            .remove(&document_key(id))
            .is_some()
    }

    fn write(tx: &mut WriteTransaction<'_>, document: &Document) -> Result<()> {
        let bytes =
            serde_json::to_vec(document).map_err(|e| AegisError::Serialization(e.to_string()))?;
        tx.table_mut(DOCUMENTS_TABLE)
            .insert(document_key(&document.id), Row::new(bytes));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Series Names
    // -------------------------------------------------------------------------

    /// Register a series name on its document. Returns false when the
    /// document is missing or already lists the name.
    pub fn add_time_series_name(tx: &mut WriteTransaction<'_>, id: &str, name: &str) -> Result<bool> {
        let mut document = match Self::get(&*tx, id)? {
            Some(document) => document,
            None => return Ok(false),
        };

        let mut names = document.time_series_names();
        let position = match names.binary_search_by(|n| cmp_ignore_case(n, name)) {
            Ok(_) if document.has_time_series_flag() => return Ok(false),
            Ok(_) => None,
            Err(position) => Some(position),
        };
        if let Some(position) = position {
            names.insert(position, name.to_string());
        }

        let metadata = document.metadata_mut()?;
        metadata.insert(TIME_SERIES.to_string(), json!(names));
        set_flag(metadata, true);
        Self::write(tx, &document)?;
        Ok(true)
    }

    /// Unregister a series name. Returns false when nothing changed.
    pub fn remove_time_series_name(
        tx: &mut WriteTransaction<'_>,
        id: &str,
        name: &str,
    ) -> Result<bool> {
        let mut document = match Self::get(&*tx, id)? {
            Some(document) => document,
            None => return Ok(false),
        };

        let mut names = document.time_series_names();
        let position = match names.binary_search_by(|n| cmp_ignore_case(n, name)) {
            Ok(position) => position,
            Err(_) => return Ok(false),
        };
        names.remove(position);

        let metadata = document.metadata_mut()?;
        if names.is_empty() {
            metadata.remove(TIME_SERIES);
            set_flag(metadata, false);
        } else {
            metadata.insert(TIME_SERIES.to_string(), json!(names));
        }
        Self::write(tx, &document)?;
        Ok(true)
    }

    pub fn time_series_names(tx: &impl TableReader, id: &str) -> Result<Vec<String>> {
        Ok(Self::get(tx, id)?
            .map(|d| d.time_series_names())
            .unwrap_or_default())
    }
}

fn set_flag(metadata: &mut Map<String, Value>, on: bool) {
    let mut flags: Vec<String> = metadata
        .get(FLAGS)
        .and_then(Value::as_str)
        .map(|f| {
            f.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s != HAS_TIME_SERIES)
                .collect()
        })
        .unwrap_or_default();
    if on {
        flags.push(HAS_TIME_SERIES.to_string());
    }
    if flags.is_empty() {
        metadata.remove(FLAGS);
    } else {
        metadata.insert(FLAGS.to_string(), Value::String(flags.join(", ")));
    }
}

// =============================================================================
// Tests
// =============================================================================
