//! Dispatch worker loop
//!
//! A worker repeatedly claims ready batches, hands them to a [`Deliverer`]
//! and settles every message according to the report it gets back. A
//! slower maintenance timer frees locks orphaned by crashed workers.
//!
//! Workers never coordinate with each other directly. Run as many as you
//! like against one store; each needs its own [`WorkerId`].

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use outpost_common::{Signal, dispatch, internal};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::{AttemptOutcome, ClaimedBatch, Dispatcher},
    error::{DeliveryError, DispatchError},
    ids::{QueuedMessageId, WorkerId},
    queue::QueuedMessage,
};

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_maintenance_interval_secs() -> u64 {
    300 // 5 minutes
}

const fn default_max_batches_per_tick() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// How often to look for ready messages (in seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How often to sweep for stale locks (in seconds)
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Upper bound on batches claimed per poll, so one busy tick cannot
    /// starve maintenance or shutdown
    #[serde(default = "default_max_batches_per_tick")]
    pub max_batches_per_tick: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            max_batches_per_tick: default_max_batches_per_tick(),
        }
    }
}

/// Outcome of delivering one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub id: QueuedMessageId,
    pub result: Result<(), DeliveryError>,
}

impl DeliveryReport {
    #[must_use]
    pub const fn delivered(id: QueuedMessageId) -> Self {
        Self { id, result: Ok(()) }
    }

    #[must_use]
    pub const fn failed(id: QueuedMessageId, error: DeliveryError) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

/// Sends a claimed batch over one connection.
///
/// Implementations should report on every message in the batch. Messages
/// left out are treated as temporary failures.
#[async_trait]
pub trait Deliverer: Send + Sync + Debug {
    async fn deliver(&self, batch: &ClaimedBatch) -> Vec<DeliveryReport>;
}

/// Counters for one poll tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub batches: usize,
    pub delivered: usize,
    pub retried: usize,
    pub abandoned: usize,
}

#[derive(Debug)]
pub struct DispatchWorker {
    id: WorkerId,
    dispatcher: Arc<Dispatcher>,
    deliverer: Arc<dyn Deliverer>,
    config: WorkerConfig,
}

impl DispatchWorker {
    #[must_use]
    pub fn new(id: WorkerId, dispatcher: Arc<Dispatcher>, deliverer: Arc<dyn Deliverer>) -> Self {
        let config = dispatcher.config().worker.clone();
        Self {
            id,
            dispatcher,
            deliverer,
            config,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Claims and delivers batches until the queue has nothing ready or the
    /// per-tick limit is reached.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails. Failures settling individual
    /// messages are logged and skipped.
    pub async fn run_once(&self) -> Result<TickSummary, DispatchError> {
        let mut summary = TickSummary::default();
        let limit = self.dispatcher.config().batch_limit;

        while summary.batches < self.config.max_batches_per_tick {
            let Some(batch) = self.dispatcher.claim_ready(&self.id, limit).await? else {
                break;
            };
            summary.batches += 1;

            let reports = self.deliverer.deliver(&batch).await;
            for message in batch.messages() {
                self.settle(message, &reports, &mut summary).await;
            }
        }

        Ok(summary)
    }

    async fn settle(
        &self,
        message: &QueuedMessage,
        reports: &[DeliveryReport],
        summary: &mut TickSummary,
    ) {
        let result = match reports.iter().find(|report| report.id == message.id) {
            Some(report) => report.result.clone(),
            None => Err(DeliveryError::Temporary(
                "No delivery report for message".to_string(),
            )),
        };

        let settled = match result {
            Ok(()) => self
                .dispatcher
                .mark_delivered(message)
                .await
                .map(|()| summary.delivered += 1),
            Err(error) => self
                .dispatcher
                .fail_attempt(message, &error)
                .await
                .map(|outcome| match outcome {
                    AttemptOutcome::Retrying(_) => summary.retried += 1,
                    AttemptOutcome::Abandoned(_) => summary.abandoned += 1,
                }),
        };

        if let Err(err) = settled {
            error!(worker = %self.id, "Failed to settle {}: {err}", message.id);
        }
    }

    /// Runs the stale lock sweep once.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweep fails.
    pub async fn run_maintenance(&self) -> Result<usize, DispatchError> {
        let threshold = self.dispatcher.config().stale_lock_threshold();
        let released = self.dispatcher.recover_stale_locks(threshold).await?;
        Ok(released.len())
    }

    /// Runs until a shutdown signal arrives.
    ///
    /// The batch in flight when the signal arrives is finished first;
    /// nothing is left half-settled.
    ///
    /// # Errors
    ///
    /// Currently infallible; tick errors are logged and the loop continues.
    pub async fn serve(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), DispatchError> {
        internal!(level = INFO, "Dispatch worker {} starting", self.id);

        let mut poll_timer =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        let mut maintenance_timer = tokio::time::interval(Duration::from_secs(
            self.config.maintenance_interval_secs.max(1),
        ));

        // Skip the first tick to avoid immediate execution
        poll_timer.tick().await;
        maintenance_timer.tick().await;

        loop {
            tokio::select! {
                _ = poll_timer.tick() => {
                    match self.run_once().await {
                        Ok(summary) if summary.batches > 0 => {
                            dispatch!(
                                level = INFO,
                                worker = %self.id,
                                "Dispatched {} batch(es): {} delivered, {} retrying, {} abandoned",
                                summary.batches,
                                summary.delivered,
                                summary.retried,
                                summary.abandoned
                            );
                        }
                        Ok(_) => {
                            debug!("No ready messages");
                        }
                        Err(e) => {
                            error!("Error dispatching queue: {e}");
                        }
                    }
                }
                _ = maintenance_timer.tick() => {
                    match self.run_maintenance().await {
                        Ok(released) if released > 0 => {
                            info!("Released {released} stale lock(s)");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Stale lock sweep failed: {e}");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Dispatch worker {} received shutdown signal", self.id);
                            break;
                        }
                        Err(e) => {
                            error!("Dispatch worker shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        internal!(level = INFO, "Dispatch worker {} stopped", self.id);
        Ok(())
    }
}
