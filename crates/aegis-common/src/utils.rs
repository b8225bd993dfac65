//! Aegis Utils - Utility Functions
//!
//! Common utility functions used across the time-series core. Provides
//! checksum validation and the millisecond time conversions every layer
//! relies on, since stored timestamps are always whole milliseconds.
//!
//! Key Features:
//! - CRC32 checksums for data integrity verification
//! - Millisecond conversion for chrono timestamps
//! - Case-insensitive ordering helpers for names
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use chrono::{DateTime, TimeZone, Utc};
use std::cmp::Ordering;

// =============================================================================
// Checksum Functions
// =============================================================================

/// Compute CRC32 checksum for data integrity verification.
#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify data against expected CRC32 checksum.
#[inline]
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

// =============================================================================
// Time Functions
// =============================================================================

/// Convert milliseconds since the epoch into a timestamp, saturating at the
/// representable bounds.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(ts) => ts,
        None if ms < 0 => DateTime::<Utc>::MIN_UTC,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

/// Milliseconds of the earliest representable timestamp.
pub fn min_millis() -> i64 {
    DateTime::<Utc>::MIN_UTC.timestamp_millis()
}

/// Milliseconds of the latest representable timestamp.
pub fn max_millis() -> i64 {
    DateTime::<Utc>::MAX_UTC.timestamp_millis()
}

// =============================================================================
// Name Functions
// =============================================================================

/// Compare two names ignoring ASCII and Unicode case.
pub fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

/// Equality ignoring case.
pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    cmp_ignore_case(a, b) == Ordering::Equal
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32() {
        let data = b"hello world";
        let checksum = crc32(data);
        assert!(verify_crc32(data, checksum));
        assert!(!verify_crc32(b"hello worlD", checksum));
    }

    #[test]
    fn test_from_millis_saturates() {
        assert_eq!(from_millis(i64::MIN), DateTime::<Utc>::MIN_UTC);
        assert_eq!(from_millis(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(from_millis(0).timestamp_millis(), 0);
    }

    #[test]
    fn test_case_insensitive_names() {
        assert!(eq_ignore_case("Heartrate", "HEARTRATE"));
        assert_eq!(cmp_ignore_case("a", "B"), Ordering::Less);
    }
}
