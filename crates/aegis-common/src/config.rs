//! Aegis Config - Configuration Structures
//!
//! Configuration types for a database hosting time series. Supports loading
//! from TOML files and programmatic construction, with defaults suited to
//! development and tests.
//!
//! Key Features:
//! - Database identity (name, node tag, database id)
//! - Time-series engine tuning (batch sizes, default check frequency)
//! - Partial TOML files fall back to defaults field by field
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::types::NodeTag;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Time Series Engine Configuration
// =============================================================================

/// Tuning knobs for the time-series engine and its background runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSeriesEngineConfig {
    /// Maximum pending rollups executed per transaction.
    pub rollup_batch_size: usize,
    /// Maximum series trimmed per retention transaction.
    pub retention_batch_size: usize,
    /// Maximum series scheduled per policy-reconciliation transaction.
    pub policy_batch_size: usize,
    /// Used when a time-series configuration does not name its own frequency.
    pub default_policy_check_frequency: Duration,
}

impl Default for TimeSeriesEngineConfig {
    fn default() -> Self {
        Self {
            rollup_batch_size: 1024,
            retention_batch_size: 1024,
            policy_batch_size: 1024,
            default_policy_check_frequency: Duration::from_secs(600),
        }
    }
}

// =============================================================================
// Database Configuration
// =============================================================================

/// Top-level configuration of one database on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub name: String,
    pub node_tag: NodeTag,
    /// Identifies this database instance inside change vectors.
    pub database_id: String,
    pub timeseries: TimeSeriesEngineConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "aegis".to_string(),
            node_tag: NodeTag::new("A"),
            database_id: "aegis-db-0001".to_string(),
            timeseries: TimeSeriesEngineConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::AegisError::Configuration(e.to_string()))
    }

    /// Create configuration with development defaults.
    pub fn development() -> Self {
        Self::default()
    }

    /// Configuration for a named node of a cluster.
    pub fn for_node(
        name: impl Into<String>,
        node_tag: impl Into<NodeTag>,
        database_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            node_tag: node_tag.into(),
            database_id: database_id.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::development();
        assert_eq!(config.node_tag.as_str(), "A");
        assert_eq!(config.timeseries.rollup_batch_size, 1024);
        assert_eq!(
            config.timeseries.default_policy_check_frequency,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_partial_toml() {
        let config = DatabaseConfig::from_toml(
            r#"
            name = "metrics"
            node_tag = "B"

            [timeseries]
            rollup_batch_size = 16
            "#,
        )
        .expect("parse");

        assert_eq!(config.name, "metrics");
        assert_eq!(config.node_tag.as_str(), "B");
        assert_eq!(config.timeseries.rollup_batch_size, 16);
        assert_eq!(config.timeseries.retention_batch_size, 1024);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "database_id = \"db-42\"").expect("write");

        let config = DatabaseConfig::from_file(file.path()).expect("load");
        assert_eq!(config.database_id, "db-42");
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = DatabaseConfig::from_toml("name = ").unwrap_err();
        assert!(matches!(err, crate::AegisError::Configuration(_)));
    }
}
