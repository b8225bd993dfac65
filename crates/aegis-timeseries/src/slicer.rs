//! Aegis Time Series Keys
//!
//! Byte keys for the time-series tables. Document ids and series names are
//! lowercased and joined by the ASCII record separator, so every segment of a
//! series shares one prefix and segments sort by baseline inside it.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use aegis_common::{AegisError, Etag, Result};

// =============================================================================
// Constants
// =============================================================================

/// Separator between key parts (ASCII RS).
pub const RECORD_SEPARATOR: u8 = 0x1E;

const SIGN_BIT: u64 = 1 << 63;

// =============================================================================
// Validation
// =============================================================================

/// Reject ids that would make one document's keys a prefix of another's.
pub fn validate_document_id(document_id: &str) -> Result<()> {
    if document_id.trim().is_empty() {
        return Err(AegisError::InvalidArgument(
            "document id cannot be empty".to_string(),
        ));
    }
    if document_id.contains(char::from(RECORD_SEPARATOR)) {
        return Err(AegisError::InvalidArgument(format!(
            "document id '{}' contains a record separator",
            document_id.escape_debug()
        )));
    }
    Ok(())
}

// =============================================================================
// Key Builders
// =============================================================================

/// Prefix shared by every key of one document.
pub fn document_prefix(document_id: &str) -> Vec<u8> {
    let mut key = document_id.to_lowercase().into_bytes();
    key.push(RECORD_SEPARATOR);
    key
}

/// Prefix shared by every segment of one series.
pub fn series_prefix(document_id: &str, name: &str) -> Vec<u8> {
    let mut key = document_prefix(document_id);
    key.extend_from_slice(name.to_lowercase().as_bytes());
    key.push(RECORD_SEPARATOR);
    key
}

/// Key of the series row in per-series tables (stats, pending rollups).
pub fn series_key(document_id: &str, name: &str) -> Vec<u8> {
    let mut key = document_prefix(document_id);
    key.extend_from_slice(name.to_lowercase().as_bytes());
    key
}

/// Key of the segment starting at `baseline_ms`.
pub fn segment_key(document_id: &str, name: &str, baseline_ms: i64) -> Vec<u8> {
    segment_key_from_prefix(&series_prefix(document_id, name), baseline_ms)
}

/// Append an order-preserving baseline to a series prefix.
pub fn segment_key_from_prefix(prefix: &[u8], baseline_ms: i64) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(&encode_i64(baseline_ms));
    key
}

/// Key of a deletion tombstone.
pub fn deleted_range_key(document_id: &str, name: &str, etag: Etag) -> Vec<u8> {
    let mut key = series_prefix(document_id, name);
    key.extend_from_slice(&etag.to_be_bytes());
    key
}

/// Big-endian with the sign bit flipped, so byte order equals numeric order.
pub fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ SIGN_BIT).to_be_bytes()
}

pub fn decode_i64(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64
}

// =============================================================================
// Key Parsing
// =============================================================================

/// Parts of a segment key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKeyParts {
    pub document_id: String,
    pub name: String,
    pub baseline_ms: i64,
}

/// Split a segment key into lowercased document id, series name and baseline.
pub fn parse_segment_key(key: &[u8]) -> Option<SegmentKeyParts> {
    if key.len() < 8 + 2 {
        return None;
    }
    let (head, tail) = key.split_at(key.len() - 8);
    let baseline_ms = decode_i64(tail.try_into().ok()?);
    let head = head.strip_suffix(&[RECORD_SEPARATOR])?;
    let (document_id, name) = split_series_key(head)?;
    Some(SegmentKeyParts {
        document_id,
        name,
        baseline_ms,
    })
}

/// Split a `document RS name` key.
pub fn split_series_key(key: &[u8]) -> Option<(String, String)> {
    let pos = key.iter().position(|b| *b == RECORD_SEPARATOR)?;
    let document_id = String::from_utf8(key[..pos].to_vec()).ok()?;
    let name = String::from_utf8(key[pos + 1..].to_vec()).ok()?;
    Some((document_id, name))
}

/// The series prefix of a segment key.
pub fn prefix_of_segment_key(key: &[u8]) -> Option<&[u8]> {
    key.len().checked_sub(8).map(|end| &key[..end])
}

/// Baseline of a segment key.
pub fn baseline_of(key: &[u8]) -> Option<i64> {
    let start = key.len().checked_sub(8)?;
    Some(decode_i64(key[start..].try_into().ok()?))
}

// =============================================================================
// Series Names
// =============================================================================

/// Separator between a raw series name and its policy.
pub const POLICY_SEPARATOR: char = '@';

/// Name of the series a policy writes for `raw`.
pub fn policy_series_name(raw: &str, policy: &str) -> String {
    format!("{}{}{}", raw, POLICY_SEPARATOR, policy)
}

/// The raw series name, without any policy suffix.
pub fn raw_series_name(name: &str) -> &str {
    name.split(POLICY_SEPARATOR).next().unwrap_or(name)
}

/// The policy suffix of a rolled-up series name.
pub fn policy_of_series(name: &str) -> Option<&str> {
    name.split_once(POLICY_SEPARATOR).map(|(_, policy)| policy)
}

// =============================================================================
// Series Slice
// =============================================================================

/// Identity of one series together with its owning collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesSlice {
    pub document_id: String,
    pub name: String,
    pub collection: String,
}

impl SeriesSlice {
    pub fn new(
        document_id: impl Into<String>,
        name: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            name: name.into(),
            collection: collection.into(),
        }
    }

    /// Key of the series in per-series tables.
    pub fn key(&self) -> Vec<u8> {
        series_key(&self.document_id, &self.name)
    }

    /// Prefix of every segment of the series.
    pub fn prefix(&self) -> Vec<u8> {
        series_prefix(&self.document_id, &self.name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_validation() {
        assert!(validate_document_id("users/1").is_ok());
        assert!(validate_document_id("").is_err());
        assert!(validate_document_id("   ").is_err());
        assert!(matches!(
            validate_document_id("users/1\u{1e}x"),
            Err(AegisError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_series_slice_keys() {
        let slice = SeriesSlice::new("Users/1", "HR", "Users");
        assert_eq!(slice.key(), series_key("users/1", "hr"));
        assert!(segment_key("users/1", "hr", 5).starts_with(&slice.prefix()));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        assert_eq!(
            segment_key("Users/1", "HeartRate", 10),
            segment_key("users/1", "heartrate", 10)
        );
        assert_eq!(series_key("Users/1", "HR"), b"users/1\x1ehr".to_vec());
    }

    #[test]
    fn test_baselines_sort_numerically() {
        let keys: Vec<Vec<u8>> = [-5_000i64, -1, 0, 1, 1_700_000_000_000]
            .iter()
            .map(|b| segment_key("users/1", "hr", *b))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_parse_segment_key() {
        let key = segment_key("Users/1", "HeartRate@ByHour", -42);
        let parts = parse_segment_key(&key).expect("parse");
        assert_eq!(parts.document_id, "users/1");
        assert_eq!(parts.name, "heartrate@byhour");
        assert_eq!(parts.baseline_ms, -42);
        assert_eq!(baseline_of(&key), Some(-42));
        assert_eq!(
            prefix_of_segment_key(&key),
            Some(series_prefix("users/1", "heartrate@byhour").as_slice())
        );
    }

    #[test]
    fn test_deleted_range_keys_follow_etag_order() {
        let a = deleted_range_key("users/1", "hr", Etag(9));
        let b = deleted_range_key("users/1", "hr", Etag(10));
        assert!(a < b);
        assert!(a.starts_with(&series_prefix("users/1", "hr")));
    }

    #[test]
    fn test_series_names() {
        assert_eq!(policy_series_name("HR", "ByHour"), "HR@ByHour");
        assert_eq!(raw_series_name("HR@ByHour"), "HR");
        assert_eq!(raw_series_name("HR"), "HR");
        assert_eq!(policy_of_series("HR@ByHour"), Some("ByHour"));
        assert_eq!(policy_of_series("HR"), None);
    }
}
