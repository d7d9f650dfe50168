//! Monitor selection: decides, server by server, which monitors are active,
//! testing or idle candidates, and drives the review queue.

pub mod constraints;
pub mod grandfathering;
pub mod metrics;
pub mod process;
pub mod rules;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, SelectorConfig};
use crate::db::{PgSelectorStore, SelectorStore, StoreError};
use process::{Processor, ReviewIntervals};
use rules::RuleConfig;

#[derive(Error, Debug)]
pub enum SelectorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Metrics error: {0}")]
    Metrics(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cancelled")]
    Cancelled,
}

/// Idle backoff of the driver loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

pub struct Selector<S: SelectorStore> {
    store: S,
    processor: Processor,
    backoff: Backoff,
    batch_size: i64,
}

impl<S: SelectorStore> Selector<S> {
    pub fn new(store: S, rules: RuleConfig, intervals: ReviewIntervals) -> Self {
        Self {
            store,
            processor: Processor::new(rules, intervals),
            backoff: Backoff::default(),
            batch_size: 10,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reviews every server currently due. Per-server failures are logged and
    /// skipped; only failing to read the queue is an error.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<usize, SelectorError> {
        let mut processed = 0;

        loop {
            let due = self.store.servers_due_for_review(self.batch_size).await?;
            let batch_full = due.len() as i64 >= self.batch_size;
            let mut batch_processed = 0;

            for server_id in due {
                if cancel.is_cancelled() {
                    return Ok(processed + batch_processed);
                }
                match self
                    .processor
                    .process_server(&self.store, server_id, cancel)
                    .await
                {
                    Ok(outcome) => {
                        batch_processed += 1;
                        if outcome.changed() {
                            info!(
                                server_id,
                                applied = outcome.applied,
                                failed = outcome.failed,
                                paused = outcome.paused,
                                "Updated monitor selection."
                            );
                        }
                    }
                    Err(SelectorError::Cancelled) => return Ok(processed + batch_processed),
                    Err(e) => {
                        error!(server_id, error = %e, "Failed to process server, skipping.");
                    }
                }
            }

            processed += batch_processed;
            if !batch_full || batch_processed == 0 {
                return Ok(processed);
            }
        }
    }

    /// Runs passes until cancelled, or a single pass when `continuous` is false.
    pub async fn run_loop(
        &self,
        continuous: bool,
        cancel: &CancellationToken,
    ) -> Result<(), SelectorError> {
        let mut delay = self.backoff.initial;

        loop {
            let count = match self.run_once(cancel).await {
                Ok(count) => count,
                Err(e) if continuous => {
                    error!(error = %e, "Failed to read review queue.");
                    0
                }
                Err(e) => return Err(e),
            };
            if !continuous || cancel.is_cancelled() {
                info!(processed = count, "Selector pass finished.");
                return Ok(());
            }

            if count > 0 {
                debug!(processed = count, "Processed servers.");
                delay = self.backoff.initial;
                continue;
            }

            debug!(delay_seconds = delay.as_secs(), "No servers due, sleeping.");
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Selector shutting down.");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.backoff.next(delay);
        }
    }
}

/// Connects to the database, starts the metrics endpoint and runs the driver.
pub async fn run(
    config: &SelectorConfig,
    continuous: bool,
    cancel: CancellationToken,
) -> Result<(), SelectorError> {
    let store = PgSelectorStore::connect(&config.database_url, config.max_connections).await?;
    let metrics_task = crate::metrics_server::start(config.metrics_port, cancel.child_token()).await?;

    let selector = Selector::new(store, config.rule_config(), config.review_intervals())
        .with_backoff(Backoff {
            initial: Duration::from_secs(config.backoff_initial_seconds),
            max: Duration::from_secs(config.backoff_max_seconds),
        })
        .with_batch_size(config.review_batch_size);

    let result = selector.run_loop(continuous, &cancel).await;

    metrics_task.abort();
    if let Err(e) = &result {
        warn!(error = %e, "Selector stopped with error.");
    }
    result
}
