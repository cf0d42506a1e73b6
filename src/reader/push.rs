//! Enhanced fan-out reader for one shard
//!
//! The server pushes event batches over a long-lived HTTP/2 subscription for
//! roughly five minutes, then closes it; the reader resubscribes from the
//! last continuation sequence it observed. The wait on each subscription is
//! timeout-guarded a minute past the server's own cap, so hitting the timeout
//! means a stuck stream rather than normal expiry.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::client::{IteratorSpec, KinesisClientError, KinesisClientTrait, SubscriptionStream};
use crate::reader::{forward_error, ErrorSender, ReaderHandle, RecordSender};

/// Ceiling on one subscription wait; 60 s past the server's ~300 s cap.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(360);

/// Pause between subscription cycles.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Reads one shard over repeated enhanced fan-out subscriptions.
pub struct PushShardReader<C> {
    client: Arc<C>,
    consumer_arn: String,
    shard_id: String,
    position: IteratorSpec,
    /// Last continuation sequence observed on any subscription. Written by
    /// the event drain, read on the resubscribe path.
    continuation: Arc<Mutex<Option<String>>>,
    records_tx: RecordSender,
    errors_tx: ErrorSender,
}

impl<C: KinesisClientTrait + 'static> PushShardReader<C> {
    pub fn spawn(
        client: Arc<C>,
        consumer_arn: impl Into<String>,
        shard_id: impl Into<String>,
        position: IteratorSpec,
        records_tx: RecordSender,
        errors_tx: ErrorSender,
    ) -> ReaderHandle {
        let shard_id = shard_id.into();
        let reader = Self {
            client,
            consumer_arn: consumer_arn.into(),
            shard_id: shard_id.clone(),
            position,
            continuation: Arc::new(Mutex::new(None)),
            records_tx,
            errors_tx,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reader.run(shutdown_rx));
        ReaderHandle::new(shard_id, shutdown_tx, task)
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            shard_id = %self.shard_id,
            consumer_arn = %self.consumer_arn,
            "Starting push reader"
        );

        loop {
            if *shutdown.borrow() {
                info!(shard_id = %self.shard_id, "Push reader shutting down");
                return;
            }

            match self
                .client
                .subscribe_to_shard(&self.consumer_arn, &self.shard_id, &self.position)
                .await
            {
                Ok(subscription) => {
                    trace!(shard_id = %self.shard_id, position = ?self.position, "Subscription created");
                    tokio::select! {
                        waited = tokio::time::timeout(WAIT_TIMEOUT, self.drain(subscription)) => {
                            match waited {
                                Ok(true) => trace!(shard_id = %self.shard_id, "Subscription ended"),
                                Ok(false) => {
                                    debug!(shard_id = %self.shard_id, "Record channel closed, push reader exiting");
                                    return;
                                }
                                // A stuck stream, not normal expiry. Dropping
                                // the subscription closes the HTTP/2 stream.
                                Err(_) => warn!(
                                    shard_id = %self.shard_id,
                                    timeout_secs = WAIT_TIMEOUT.as_secs(),
                                    "Subscription wait timed out, resubscribing"
                                ),
                            }
                        }
                        _ = shutdown.changed() => {
                            info!(shard_id = %self.shard_id, "Push reader shutting down mid-subscription");
                            return;
                        }
                    }
                }
                Err(err) => self.report_subscribe_failure(err),
            }

            // Resume just past the last continuation; with no events observed
            // yet the previous position is reused.
            if let Some(sequence) = self.continuation.lock().clone() {
                self.position = IteratorSpec::AfterSequenceNumber(sequence);
            }

            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                _ = shutdown.changed() => {
                    info!(shard_id = %self.shard_id, "Push reader shutting down");
                    return;
                }
            }
        }
    }

    /// Drain one subscription to its end. Returns `false` when the record
    /// channel is gone and the reader should exit.
    async fn drain(&self, mut subscription: SubscriptionStream) -> bool {
        while let Some(event) = subscription.next().await {
            match event {
                Ok(event) => {
                    if let Some(sequence) = event.continuation_sequence_number {
                        *self.continuation.lock() = Some(sequence);
                    }
                    for record in event.records {
                        if self
                            .records_tx
                            .send((self.shard_id.clone(), record))
                            .await
                            .is_err()
                        {
                            return false;
                        }
                    }
                }
                Err(err) => {
                    // Error events ride the subscription itself; forward them
                    // and let the resubscribe path recover.
                    error!(
                        shard_id = %self.shard_id,
                        error = %err,
                        "Subscription error event"
                    );
                    forward_error(&self.errors_tx, &self.shard_id, err);
                }
            }
        }
        true
    }

    /// Classify a failure of the subscribe call itself. Stream-initialization
    /// and connection-level faults are normal reconnection triggers and are
    /// only logged; service and parse errors also go to the error channel.
    fn report_subscribe_failure(&self, err: KinesisClientError) {
        match &err {
            KinesisClientError::SubscriptionInit(_)
            | KinesisClientError::Timeout(_)
            | KinesisClientError::Connection(_) => {
                warn!(
                    shard_id = %self.shard_id,
                    error = %err,
                    "Subscription setup failed, will resubscribe"
                );
            }
            KinesisClientError::Protocol(_) | KinesisClientError::Service { .. } => {
                error!(
                    shard_id = %self.shard_id,
                    error = %err,
                    "Subscription failed"
                );
                forward_error(&self.errors_tx, &self.shard_id, err);
            }
            _ => {
                error!(
                    shard_id = %self.shard_id,
                    error = %err,
                    "Subscription failed"
                );
                forward_error(&self.errors_tx, &self.shard_id, err);
            }
        }
    }
}
