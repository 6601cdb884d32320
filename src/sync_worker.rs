//! Durable consumer loop.
//!
//! Pulls one delivery at a time and runs decode → resolve → apply → settle
//! strictly in sequence. Shutdown is cooperative: the in-flight message is
//! always finished before the loop exits and the subscription is closed.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::apply_engine::{ApplyEngine, ApplyError};
use crate::broker::{Delivery, EventSubscription, Settlement};
use crate::envelope_decoder;
use crate::error_handling::SyncError;
use crate::payload_resolver::{self, Resolution};
use crate::replica_storage::ReplicaStore;
use crate::types::DeadLetter;

/// What to do with a message whose apply step failed in storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ApplyFailurePolicy {
    /// Acknowledge anyway. The replica diverges for that event.
    #[default]
    AckAfterAttempt,
    /// NAK for broker redelivery; dead-letter once `max_deliveries` is reached.
    Redeliver {
        max_deliveries: u64,
        delay: Duration,
    },
}

pub const DEFAULT_MAX_PULL_FAILURES: u32 = 10;
pub const DEFAULT_PULL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_PULL_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub failure_policy: ApplyFailurePolicy,
    /// Consecutive pull errors tolerated before the loop gives up.
    pub max_pull_failures: u32,
    /// First backoff after a pull error; doubles per consecutive failure.
    pub pull_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            failure_policy: ApplyFailurePolicy::default(),
            max_pull_failures: DEFAULT_MAX_PULL_FAILURES,
            pull_backoff: DEFAULT_PULL_BACKOFF,
        }
    }
}

impl WorkerOptions {
    fn backoff_after(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.pull_backoff.saturating_mul(factor).min(MAX_PULL_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub received: u64,
    /// Events that mutated the replica.
    pub applied: u64,
    /// Events whose transition was a no-op (duplicates, absent records).
    pub skipped: u64,
    /// Events outside the synchronized vocabulary.
    pub ignored: u64,
    /// Undecodable or unresolvable messages.
    pub dropped: u64,
    pub apply_failures: u64,
    pub pull_failures: u64,
    pub redelivery_requests: u64,
    pub dead_lettered: u64,
}

pub struct SyncWorker<S: ReplicaStore + ?Sized> {
    subscription: Box<dyn EventSubscription>,
    engine: ApplyEngine<S>,
    options: WorkerOptions,
    stats: SyncStats,
}

impl<S: ReplicaStore + ?Sized + 'static> SyncWorker<S> {
    pub fn new(
        subscription: Box<dyn EventSubscription>,
        engine: ApplyEngine<S>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            subscription,
            engine,
            options,
            stats: SyncStats::default(),
        }
    }

    /// Spawn the consumer loop on the tokio runtime.
    pub fn start(self) -> SyncWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        SyncWorkerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Run until shutdown is signalled or the subscription ends.
    ///
    /// Fails with the last broker error once `max_pull_failures` pulls in a
    /// row have failed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<SyncStats, SyncError> {
        tracing::info!("Identity sync consumer starting...");
        let mut pull_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                // A dropped handle counts as a shutdown request.
                _ = shutdown.changed() => break,
                next = self.subscription.next_delivery() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    pull_failures = 0;
                    self.process(delivery).await;
                }
                Some(Err(e)) => {
                    pull_failures += 1;
                    self.stats.pull_failures += 1;

                    if pull_failures >= self.options.max_pull_failures {
                        tracing::error!(
                            "Giving up after {} consecutive pull failures: {}",
                            pull_failures,
                            e
                        );
                        self.finish().await;
                        return Err(SyncError::Broker(e));
                    }

                    let backoff = self.options.backoff_after(pull_failures);
                    tracing::error!(
                        "Error receiving message ({} of {}), retrying in {:?}: {}",
                        pull_failures,
                        self.options.max_pull_failures,
                        backoff,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                None => {
                    tracing::info!("Subscription ended");
                    break;
                }
            }
        }

        Ok(self.finish().await)
    }

    async fn finish(&mut self) -> SyncStats {
        tracing::info!("Identity sync consumer stopping...");
        if let Err(e) = self.subscription.close().await {
            tracing::warn!("Failed to close subscription cleanly: {}", e);
        }

        let stats = self.stats;
        tracing::info!(
            "Final stats: received={}, applied={}, skipped={}, ignored={}, dropped={}, apply_failures={}, pull_failures={}, redeliveries={}, dead_lettered={}",
            stats.received,
            stats.applied,
            stats.skipped,
            stats.ignored,
            stats.dropped,
            stats.apply_failures,
            stats.pull_failures,
            stats.redelivery_requests,
            stats.dead_lettered
        );
        stats
    }

    /// Handle one delivery end to end and settle it.
    pub async fn process(&mut self, delivery: Delivery) -> Settlement {
        self.stats.received += 1;
        tracing::debug!("Received message on subject: {}", delivery.subject);

        let settlement = self.handle(&delivery).await;

        if let Err(e) = delivery.settle(settlement).await {
            tracing::error!(
                "Failed to settle message on {} ({:?}): {}",
                delivery.subject,
                settlement,
                e
            );
        }
        settlement
    }

    async fn handle(&mut self, delivery: &Delivery) -> Settlement {
        let envelope = match envelope_decoder::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping undecodable admin event on {}: {}", delivery.subject, e);
                self.stats.dropped += 1;
                return Settlement::Ack;
            }
        };

        tracing::info!(
            "Processing admin event {}: {} - {} - {}",
            envelope.event_id,
            envelope.resource_type,
            envelope.operation_type,
            envelope.resource_id.as_deref().unwrap_or("-")
        );

        let event = match payload_resolver::resolve(&envelope) {
            Ok(Resolution::Apply(event)) => event,
            Ok(Resolution::Unsupported(unsupported)) => {
                tracing::debug!(
                    "Ignoring event with resourceType {} and operationType {}",
                    unsupported.resource_type,
                    unsupported.operation_type
                );
                self.stats.ignored += 1;
                return Settlement::Ack;
            }
            Err(e) => {
                tracing::error!("Dropping admin event {}: {}", envelope.event_id, e);
                self.stats.dropped += 1;
                return Settlement::Ack;
            }
        };

        match self.engine.apply(&event).await {
            Ok(outcome) => {
                if outcome.is_mutation() {
                    self.stats.applied += 1;
                } else {
                    self.stats.skipped += 1;
                }
                Settlement::Ack
            }
            Err(e) => {
                self.stats.apply_failures += 1;
                self.on_apply_failure(delivery, e).await
            }
        }
    }

    async fn on_apply_failure(&mut self, delivery: &Delivery, error: ApplyError) -> Settlement {
        match self.options.failure_policy {
            ApplyFailurePolicy::AckAfterAttempt => {
                tracing::error!(
                    "{}; acknowledging anyway, replica diverges for external user {}",
                    error,
                    error.external_id
                );
                Settlement::Ack
            }
            ApplyFailurePolicy::Redeliver {
                max_deliveries,
                delay,
            } if delivery.delivered < max_deliveries => {
                tracing::error!(
                    "{}; requesting redelivery (attempt {} of {})",
                    error,
                    delivery.delivered,
                    max_deliveries
                );
                self.stats.redelivery_requests += 1;
                Settlement::Nak(Some(delay))
            }
            ApplyFailurePolicy::Redeliver { delay, .. } => {
                let letter = DeadLetter::new(
                    delivery.subject.clone(),
                    Some(error.event_id.clone()),
                    &delivery.payload,
                    error.to_string(),
                    delivery.delivered,
                );

                // Only terminate once the message is parked somewhere.
                if let Err(e) = self.engine.store().record_dead_letter(&letter).await {
                    tracing::error!(
                        "{}; dead letter {} not recorded ({}), requesting redelivery",
                        error,
                        letter.id,
                        e
                    );
                    self.stats.redelivery_requests += 1;
                    return Settlement::Nak(Some(delay));
                }

                tracing::error!(
                    "{}; gave up after {} deliveries, dead-lettered as {}",
                    error,
                    delivery.delivered,
                    letter.id
                );
                self.stats.dead_lettered += 1;
                Settlement::Term
            }
        }
    }
}

/// Handle to a spawned worker.
///
/// Dropping the handle also asks the worker to stop.
pub struct SyncWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<Result<SyncStats, SyncError>>,
}

impl SyncWorkerHandle {
    /// Resolves once the worker loop has exited on its own or been stopped.
    pub async fn stopped(&self) {
        self.shutdown.closed().await;
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown, wait for the in-flight message, return final stats.
    pub async fn stop(self) -> Result<SyncStats, SyncError> {
        // The worker may already be gone; that is not an error.
        let _ = self.shutdown.send(true);
        self.wait_inner().await
    }

    /// Run until `shutdown` resolves, then stop the worker.
    ///
    /// The loop is expected to outlive the process; if it ends before
    /// `shutdown` resolves that is reported as an error even when it ended
    /// cleanly.
    pub async fn supervise<F>(self, shutdown: F) -> Result<SyncStats, SyncError>
    where
        F: Future<Output = ()>,
    {
        let requested = tokio::select! {
            _ = shutdown => true,
            _ = self.stopped() => false,
        };

        if requested {
            tracing::warn!("Shutdown requested, stopping consumer...");
            return self.stop().await;
        }

        let stats = self.wait_inner().await?;
        Err(SyncError::Worker(format!(
            "Consumer loop exited without a shutdown request after {} messages",
            stats.received
        )))
    }

    /// Wait for the worker to exit without signalling shutdown.
    pub async fn wait(self) -> Result<SyncStats, SyncError> {
        self.wait_inner().await
    }

    async fn wait_inner(self) -> Result<SyncStats, SyncError> {
        let Self { shutdown, join } = self;
        let result = join
            .await
            .map_err(|e| SyncError::Worker(format!("Consumer task failed: {e}")))?;
        drop(shutdown);
        result
    }
}
