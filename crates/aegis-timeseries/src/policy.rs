//! Aegis Time Series Policies
//!
//! Rollup and retention policy configuration. Every collection has a raw
//! policy governing retention of the ingested series plus a chain of named
//! policies ordered by aggregation; each named policy rolls the series of the
//! previous link up into `raw@policy`.
//!
//! Key Features:
//! - Case-insensitive collection and policy lookups
//! - Validation and ordering of the policy chain
//! - Navigation through the chain (`next_policy`, `previous_policy`)
//! - JSON and TOML loading with textual durations
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::duration::TimeValue;
use crate::slicer::{policy_of_series, POLICY_SEPARATOR};
use aegis_common::utils::eq_ignore_case;
use aegis_common::{AegisError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Name of the policy governing the raw series.
pub const RAW_POLICY_NAME: &str = "rawpolicy";

/// Check frequency when a configuration does not set one.
pub const DEFAULT_POLICY_CHECK_FREQUENCY: Duration = Duration::from_secs(600);

// =============================================================================
// Time Series Policy
// =============================================================================

/// One link of a rollup chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesPolicy {
    pub name: String,
    #[serde(default = "infinite")]
    pub retention_time: TimeValue,
    #[serde(default = "zero")]
    pub aggregation_time: TimeValue,
}

fn infinite() -> TimeValue {
    TimeValue::INFINITE
}

fn zero() -> TimeValue {
    TimeValue::ZERO
}

impl TimeSeriesPolicy {
    pub fn new(name: impl Into<String>, aggregation_time: TimeValue, retention_time: TimeValue) -> Self {
        Self {
            name: name.into(),
            retention_time,
            aggregation_time,
        }
    }

    /// A rollup policy that keeps its output forever.
    pub fn keep_forever(name: impl Into<String>, aggregation_time: TimeValue) -> Self {
        Self::new(name, aggregation_time, TimeValue::INFINITE)
    }

    /// The raw policy with the given retention.
    pub fn raw(retention_time: TimeValue) -> Self {
        Self {
            name: RAW_POLICY_NAME.to_string(),
            retention_time,
            aggregation_time: TimeValue::ZERO,
        }
    }

    pub fn is_raw(&self) -> bool {
        eq_ignore_case(&self.name, RAW_POLICY_NAME)
    }

    pub fn has_retention(&self) -> bool {
        !self.retention_time.is_infinite()
    }

    /// Name of the series this policy writes for `raw_name`.
    pub fn get_time_series_name(&self, raw_name: &str) -> String {
        if self.is_raw() {
            raw_name.to_string()
        } else {
            crate::slicer::policy_series_name(raw_name, &self.name)
        }
    }

    fn validate_named(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("policy name cannot be empty"));
        }
        if self.name.contains(POLICY_SEPARATOR) {
            return Err(invalid(format!(
                "policy name '{}' cannot contain '{}'",
                self.name, POLICY_SEPARATOR
            )));
        }
        if self.is_raw() {
            return Err(invalid(format!("policy name '{}' is reserved", self.name)));
        }
        if !self.aggregation_time.is_positive() || self.aggregation_time.is_infinite() {
            return Err(invalid(format!(
                "aggregation time of policy '{}' must be positive, got {}",
                self.name, self.aggregation_time
            )));
        }
        if !self.retention_time.is_positive() {
            return Err(invalid(format!(
                "retention time of policy '{}' must be positive, got {}",
                self.name, self.retention_time
            )));
        }
        if self.retention_time < self.aggregation_time {
            return Err(invalid(format!(
                "retention time of policy '{}' ({}) must be at least its aggregation time ({})",
                self.name, self.retention_time, self.aggregation_time
            )));
        }
        Ok(())
    }
}

impl Default for TimeSeriesPolicy {
    fn default() -> Self {
        Self::raw(TimeValue::INFINITE)
    }
}

fn invalid(message: impl Into<String>) -> AegisError {
    AegisError::Configuration(message.into())
}

// =============================================================================
// Policy Reference
// =============================================================================

/// Position in a policy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyRef<'a> {
    /// The raw policy.
    Raw(&'a TimeSeriesPolicy),
    /// A named rollup policy.
    Named(&'a TimeSeriesPolicy),
    /// Before the raw policy: nothing feeds the raw series.
    Before,
    /// After the last policy: nothing consumes the series.
    After,
}

impl<'a> PolicyRef<'a> {
    /// The referenced policy, if any.
    pub fn policy(&self) -> Option<&'a TimeSeriesPolicy> {
        match self {
            PolicyRef::Raw(policy) | PolicyRef::Named(policy) => Some(policy),
            PolicyRef::Before | PolicyRef::After => None,
        }
    }
}

// =============================================================================
// Collection Configuration
// =============================================================================

/// Policies of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSeriesCollectionConfiguration {
    pub disabled: bool,
    pub policies: Vec<TimeSeriesPolicy>,
    pub raw_policy: TimeSeriesPolicy,
}

impl Default for TimeSeriesCollectionConfiguration {
    fn default() -> Self {
        Self {
            disabled: false,
            policies: Vec::new(),
            raw_policy: TimeSeriesPolicy::raw(TimeValue::INFINITE),
        }
    }
}

impl TimeSeriesCollectionConfiguration {
    pub fn new(policies: Vec<TimeSeriesPolicy>) -> Self {
        Self {
            policies,
            ..Default::default()
        }
    }

    pub fn with_raw_retention(mut self, retention: TimeValue) -> Self {
        self.raw_policy = TimeSeriesPolicy::raw(retention);
        self
    }

    /// Validate the chain and sort it by ascending aggregation.
    pub fn initialize(&mut self) -> Result<()> {
        self.raw_policy.name = RAW_POLICY_NAME.to_string();
        self.raw_policy.aggregation_time = TimeValue::ZERO;
        if !self.raw_policy.retention_time.is_positive() {
            return Err(invalid(format!(
                "raw retention must be positive, got {}",
                self.raw_policy.retention_time
            )));
        }

        let mut names = HashSet::new();
        for policy in &self.policies {
            policy.validate_named()?;
            if !names.insert(policy.name.to_lowercase()) {
                return Err(invalid(format!("duplicate policy name '{}'", policy.name)));
            }
        }

        self.policies.sort_by(|a, b| a.aggregation_time.cmp(&b.aggregation_time));

        for pair in self.policies.windows(2) {
            let (prev, current) = (&pair[0], &pair[1]);
            if current.aggregation_time == prev.aggregation_time {
                return Err(invalid(format!(
                    "policies '{}' and '{}' share the aggregation time {}",
                    prev.name, current.name, current.aggregation_time
                )));
            }
        }
        Ok(())
    }

    /// Chain position of the policy that produced `series_name`: 0 for a
    /// raw series, `i + 1` for `policies[i]`, `None` for an unknown policy.
    pub fn policy_index_by_series(&self, series_name: &str) -> Option<usize> {
        match policy_of_series(series_name) {
            None => Some(0),
            Some(policy) => self
                .policies
                .iter()
                .position(|p| eq_ignore_case(&p.name, policy))
                .map(|i| i + 1),
        }
    }

    /// The policy consuming the series at chain position `index`.
    pub fn next_policy(&self, index: usize) -> PolicyRef<'_> {
        match self.policies.get(index) {
            Some(policy) => PolicyRef::Named(policy),
            None => PolicyRef::After,
        }
    }

    /// The policy feeding the one at chain position `index`.
    pub fn previous_policy(&self, index: usize) -> PolicyRef<'_> {
        match index {
            0 => PolicyRef::Before,
            1 => PolicyRef::Raw(&self.raw_policy),
            i => match self.policies.get(i - 2) {
                Some(policy) => PolicyRef::Named(policy),
                None => PolicyRef::After,
            },
        }
    }

    /// Resolve a policy by name; the raw policy name resolves to `Raw`.
    pub fn policy_by_name(&self, name: &str) -> Option<PolicyRef<'_>> {
        if eq_ignore_case(name, RAW_POLICY_NAME) {
            return Some(PolicyRef::Raw(&self.raw_policy));
        }
        self.policies
            .iter()
            .find(|p| eq_ignore_case(&p.name, name))
            .map(PolicyRef::Named)
    }

    /// Chain position of a named policy (1-based; 0 for raw).
    pub fn policy_index_by_name(&self, name: &str) -> Option<usize> {
        if eq_ignore_case(name, RAW_POLICY_NAME) {
            return Some(0);
        }
        self.policies
            .iter()
            .position(|p| eq_ignore_case(&p.name, name))
            .map(|i| i + 1)
    }

    /// Raw policy followed by the chain, in order.
    pub fn all_policies(&self) -> impl Iterator<Item = &TimeSeriesPolicy> {
        std::iter::once(&self.raw_policy).chain(self.policies.iter())
    }
}

// =============================================================================
// Time Series Configuration
// =============================================================================

/// Time-series configuration of a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TimeSeriesConfiguration {
    pub collections: HashMap<String, TimeSeriesCollectionConfiguration>,
    pub policy_check_frequency: Option<TimeValue>,
}

impl TimeSeriesConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(
        mut self,
        name: impl Into<String>,
        collection: TimeSeriesCollectionConfiguration,
    ) -> Self {
        self.collections.insert(name.into(), collection);
        self
    }

    pub fn with_policy_check_frequency(mut self, frequency: TimeValue) -> Self {
        self.policy_check_frequency = Some(frequency);
        self
    }

    /// Validate every collection, sort its chain and normalize names.
    pub fn initialize(&mut self) -> Result<()> {
        let mut normalized = HashMap::with_capacity(self.collections.len());
        for (name, mut collection) in self.collections.drain() {
            collection
                .initialize()
                .map_err(|e| invalid(format!("collection '{}': {}", name, e)))?;
            if normalized.insert(name.to_lowercase(), collection).is_some() {
                return Err(invalid(format!("collection '{}' is configured twice", name)));
            }
        }
        self.collections = normalized;

        if let Some(frequency) = self.policy_check_frequency {
            if frequency.is_months() || !frequency.is_positive() || frequency.is_infinite() {
                return Err(invalid(format!(
                    "policy check frequency must be a positive fixed duration, got {}",
                    frequency
                )));
            }
        }
        Ok(())
    }

    /// Case-insensitive collection lookup.
    pub fn collection(&self, name: &str) -> Option<&TimeSeriesCollectionConfiguration> {
        self.collections.get(&name.to_lowercase())
    }

    /// Interval between runner passes.
    pub fn check_frequency(&self) -> Duration {
        self.policy_check_frequency
            .and_then(|f| u64::try_from(f.value).ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLICY_CHECK_FREQUENCY)
    }

    pub fn has_active_collections(&self) -> bool {
        self.collections.values().any(|c| !c.disabled)
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Parse and initialize from JSON.
    pub fn from_json(content: &str) -> Result<Self> {
        let mut config: Self =
            serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?;
        config.initialize()?;
        Ok(config)
    }

    /// Parse and initialize from TOML.
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        config.initialize()?;
        Ok(config)
    }

    /// Load from a `.json` or `.toml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
