//! Aegis Time Series Policy Runner
//!
//! Background task driving rollups and retention for one database. On start
//! it reconciles policies added after data was written, then wakes every
//! policy check interval to drain due rollups and purge expired samples. All
//! writes go through the transaction merger in bounded batches.
//!
//! Key Features:
//! - Fail-open configuration loading: a bad configuration disables the runner
//! - Batched rollups until no further progress is made
//! - Primary-only retention
//! - Prompt shutdown between batches and while waiting
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::policy::{PolicyRef, TimeSeriesConfiguration, TimeSeriesPolicy};
use crate::retention::{series_to_retain, TimeSeriesRetentionCommand};
use crate::rollup::RollupTimeSeriesCommand;
use crate::stats::SeriesStatsStore;
use crate::storage::TimeSeriesStorage;
use aegis_common::{AegisError, Result, TimeSeriesEngineConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// =============================================================================
// Policy Runner
// =============================================================================

/// Runs the policies of one database.
pub struct TimeSeriesPolicyRunner {
    storage: Arc<TimeSeriesStorage>,
    configuration: Arc<TimeSeriesConfiguration>,
    engine: TimeSeriesEngineConfig,
    shutdown: watch::Sender<bool>,
}

impl TimeSeriesPolicyRunner {
    /// Validate `configuration` and build a runner for it. Returns `None`
    /// when there is nothing to run or the configuration is invalid; the
    /// database keeps accepting writes either way.
    pub fn load_configuration(
        storage: Arc<TimeSeriesStorage>,
        configuration: Option<TimeSeriesConfiguration>,
    ) -> Option<Arc<Self>> {
        let db = Arc::clone(storage.database());
        let mut configuration = match configuration {
            Some(configuration) if !configuration.collections.is_empty() => configuration,
            _ => {
                db.set_time_series_configuration(None);
                return None;
            }
        };

        if let Err(e) = configuration.initialize() {
            tracing::error!(
                "cannot enable time series policies of database '{}': {}",
                db.name(),
                e
            );
            db.set_time_series_configuration(None);
            return None;
        }

        let configuration = Arc::new(configuration);
        db.set_time_series_configuration(Some(Arc::clone(&configuration)));
        tracing::info!(
            "time series policies loaded for {} collections of database '{}'",
            configuration.collections.len(),
            db.name()
        );

        let (shutdown, _) = watch::channel(false);
        Some(Arc::new(Self {
            engine: db.config().timeseries.clone(),
            storage,
            configuration,
            shutdown,
        }))
    }

    pub fn configuration(&self) -> &Arc<TimeSeriesConfiguration> {
        &self.configuration
    }

    pub fn storage(&self) -> &Arc<TimeSeriesStorage> {
        &self.storage
    }

    /// Interval between passes: the configured one, else the engine default.
    pub fn check_frequency(&self) -> Duration {
        match self.configuration.policy_check_frequency {
            Some(_) => self.configuration.check_frequency(),
            None => self.engine.default_policy_check_frequency,
        }
    }

    /// Ask the running loop to stop at the next wait or batch boundary.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(AegisError::Cancelled);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Background Loop
    // -------------------------------------------------------------------------

    /// Spawn the background loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            runner.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let frequency = self.check_frequency();
        tracing::info!(
            "time series policy runner started for '{}', checking every {:?}",
            self.storage.database().name(),
            frequency
        );

        if !self.report("reconcile policies", self.handle_changes().await) {
            return;
        }

        loop {
            if self.is_stopped() {
                tracing::info!("time series policy runner stopped");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(frequency) => {}
                _ = shutdown.changed() => {
                    tracing::info!("time series policy runner stopped");
                    return;
                }
            }

            if !self.report("roll up time series", self.run_rollups().await) {
                return;
            }
            if !self.report("apply time series retention", self.do_retention().await) {
                return;
            }
        }
    }

    /// Log a failed stage. Returns false when the loop must end.
    fn report(&self, stage: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) if e.is_cancellation() => {
                tracing::info!("time series policy runner stopped");
                false
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    "failed to {} in database '{}', retrying on the next check: {}",
                    stage,
                    self.storage.database().name(),
                    e
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    "failed to {} in database '{}': {}",
                    stage,
                    self.storage.database().name(),
                    e
                );
                true
            }
        }
    }

    // -------------------------------------------------------------------------
    // Policy Changes
    // -------------------------------------------------------------------------

    /// Schedule existing series for policies that produced no series yet.
    pub async fn handle_changes(&self) -> Result<()> {
        for (collection, config) in &self.configuration.collections {
            let mut existing = {
                let read = self.storage.database().environment().read();
                SeriesStatsStore::policies_in_collection(&read, collection)?
            };

            let chain: Vec<(&TimeSeriesPolicy, usize)> = config
                .all_policies()
                .enumerate()
                .map(|(index, policy)| (policy, index))
                .collect();

            for (policy, index) in chain {
                if existing.remove(&policy.name.to_lowercase()) {
                    continue;
                }
                let previous = match config.previous_policy(index) {
                    PolicyRef::Raw(previous) | PolicyRef::Named(previous) => previous.clone(),
                    PolicyRef::Before | PolicyRef::After => continue,
                };
                self.add_new_policy(collection, previous, policy.clone()).await?;
            }
        }
        Ok(())
    }

    async fn add_new_policy(
        &self,
        collection: &str,
        from: TimeSeriesPolicy,
        to: TimeSeriesPolicy,
    ) -> Result<()> {
        let from = Arc::new(from);
        let to = Arc::new(to);
        let take = self.engine.policy_batch_size;
        let mut after: Option<Vec<u8>> = None;

        loop {
            self.check_cancelled()?;
            let storage = Arc::clone(&self.storage);
            let (collection, from, to, resume) = (
                collection.to_string(),
                Arc::clone(&from),
                Arc::clone(&to),
                after.clone(),
            );
            let (marked, last) = self
                .storage
                .database()
                .merger()
                .enqueue(move |tx| {
                    storage.rollups().add_new_policy(
                        tx,
                        &collection,
                        &from,
                        &to,
                        resume.as_deref(),
                        take,
                    )
                })
                .await?;

            if marked < take {
                return Ok(());
            }
            after = last;
        }
    }

    // -------------------------------------------------------------------------
    // Rollups
    // -------------------------------------------------------------------------

    /// Drain due rollups until a batch makes no progress.
    pub async fn run_rollups(&self) -> Result<()> {
        let db = Arc::clone(self.storage.database());
        loop {
            let now = db.now();
            let states = {
                let read = db.environment().read();
                self.storage.rollups().prepare_rollups_where(
                    &read,
                    now.timestamp_millis(),
                    self.engine.rollup_batch_size,
                    |entry| {
                        self.configuration
                            .collection(&entry.collection)
                            .map_or(true, |c| !c.disabled)
                    },
                )?
            };
            if states.is_empty() {
                return Ok(());
            }
            self.check_cancelled()?;

            let pending = states.len();
            let mut command = RollupTimeSeriesCommand::new(
                Arc::clone(&self.configuration),
                now,
                states,
                db.is_primary(),
            );
            let storage = Arc::clone(&self.storage);
            let rolled_up = db
                .merger()
                .enqueue(move |tx| command.execute(&storage, tx))
                .await?;

            tracing::debug!(
                "rolled up {} of {} pending series in '{}'",
                rolled_up,
                pending,
                db.name()
            );
            if rolled_up == 0 {
                return Ok(());
            }
        }
    }

    // -------------------------------------------------------------------------
    // Retention
    // -------------------------------------------------------------------------

    /// Remove samples older than the retention of their policy.
    pub async fn do_retention(&self) -> Result<()> {
        let db = Arc::clone(self.storage.database());
        if !db.is_primary() {
            return Ok(());
        }
        let now_ms = db.now().timestamp_millis();

        for (collection, config) in &self.configuration.collections {
            if config.disabled {
                continue;
            }
            for policy in config.all_policies() {
                if policy.retention_time.is_infinite() {
                    continue;
                }
                let to_ms = policy.retention_time.subtract_from_millis(now_ms);
                self.retain(collection, &policy.name, to_ms).await?;
            }
        }
        Ok(())
    }

    async fn retain(&self, collection: &str, policy: &str, to_ms: i64) -> Result<()> {
        let db = Arc::clone(self.storage.database());
        loop {
            self.check_cancelled()?;
            let series = {
                let read = db.environment().read();
                series_to_retain(
                    &read,
                    self.storage.rollups(),
                    collection,
                    policy,
                    to_ms,
                    self.engine.retention_batch_size,
                )?
            };
            if series.is_empty() {
                return Ok(());
            }

            let command = TimeSeriesRetentionCommand::new(series, to_ms);
            let storage = Arc::clone(&self.storage);
            let retained = db
                .merger()
                .enqueue(move |tx| command.execute(&storage, tx))
                .await?;

            tracing::info!(
                "retention of policy '{}' trimmed {} series in '{}'",
                policy,
                retained,
                collection
            );
            if retained == 0 {
                return Ok(());
            }
        }
    }
}

impl Drop for TimeSeriesPolicyRunner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

// =============================================================================
// Tests
// =============================================================================
