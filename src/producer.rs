//! Buffered batch producer
//!
//! [`KinesisProducer::put`] never touches the network: records land in an
//! unbounded in-process queue and a single background worker publishes them
//! in batches bounded by the service's put-records limits, flushing at least
//! every buffer interval. Callers that need the queue emptied must await
//! [`KinesisProducer::drain`]; a force-killed process loses whatever is still
//! buffered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::client::KinesisClientTrait;
use crate::error::ProducerError;
use crate::retry::{Backoff, ExponentialBackoff};

/// Most records one put-records call may carry.
pub const MAX_RECORDS_PER_BATCH: usize = 500;
/// Most payload bytes one put-records call may carry.
pub const MAX_BATCH_BYTES: usize = 1 << 20;
/// Default upper bound on how long a record sits in the buffer.
pub const DEFAULT_BUFFER_TIME: Duration = Duration::from_millis(500);

const MAX_PUBLISH_ATTEMPTS: u32 = 5;

type QueuedRecord = (Bytes, String);

/// Buffered producer for one stream.
pub struct KinesisProducer {
    queue_tx: mpsc::UnboundedSender<QueuedRecord>,
    worker: JoinHandle<()>,
}

impl KinesisProducer {
    pub fn new<C>(client: C, stream_name: impl Into<String>) -> Self
    where
        C: KinesisClientTrait + 'static,
    {
        Self::with_buffer_time(client, stream_name, DEFAULT_BUFFER_TIME)
    }

    pub fn with_buffer_time<C>(
        client: C,
        stream_name: impl Into<String>,
        buffer_time: Duration,
    ) -> Self
    where
        C: KinesisClientTrait + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let worker = ProducerWorker {
            client: Arc::new(client),
            stream_name: stream_name.into(),
            buffer_time,
            queue_rx,
            pending: VecDeque::new(),
            backoff: ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10)),
        };

        Self {
            queue_tx,
            worker: tokio::spawn(worker.run()),
        }
    }

    /// Enqueue one record. Returns immediately; the background worker
    /// publishes it within the next flush.
    pub fn put(
        &self,
        data: impl Into<Bytes>,
        partition_key: impl Into<String>,
    ) -> Result<(), ProducerError> {
        let data = data.into();
        let partition_key = partition_key.into();

        let size = data.len() + partition_key.len();
        if size > MAX_BATCH_BYTES {
            return Err(ProducerError::RecordTooLarge(size));
        }

        self.queue_tx
            .send((data, partition_key))
            .map_err(|_| ProducerError::Closed)
    }

    /// Flush everything still buffered and stop the worker. This is the
    /// documented durability point.
    pub async fn drain(self) -> Result<(), ProducerError> {
        debug!("Draining producer");
        drop(self.queue_tx);
        self.worker.await.map_err(|_| ProducerError::Closed)
    }
}

struct ProducerWorker<C> {
    client: Arc<C>,
    stream_name: String,
    buffer_time: Duration,
    queue_rx: mpsc::UnboundedReceiver<QueuedRecord>,
    pending: VecDeque<QueuedRecord>,
    backoff: ExponentialBackoff,
}

impl<C: KinesisClientTrait> ProducerWorker<C> {
    async fn run(mut self) {
        info!(stream = %self.stream_name, "Producer worker started");

        // First tick lands one interval out, not immediately.
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.buffer_time,
            self.buffer_time,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                queued = self.queue_rx.recv() => match queued {
                    Some(record) => {
                        self.pending.push_back(record);
                        if self.pending.len() >= MAX_RECORDS_PER_BATCH {
                            self.flush().await;
                        }
                    }
                    None => {
                        // Producer handle dropped: publish the backlog, then stop.
                        while !self.pending.is_empty() {
                            self.flush().await;
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        info!(stream = %self.stream_name, "Producer worker stopped");
    }

    /// Take the next service-sized batch off the front of the queue. A record
    /// that would push the batch over the byte limit stays queued for the
    /// next flush.
    fn next_batch(&mut self) -> Vec<QueuedRecord> {
        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;

        while batch.len() < MAX_RECORDS_PER_BATCH {
            let Some((data, partition_key)) = self.pending.front() else {
                break;
            };
            let size = data.len() + partition_key.len();
            if !batch.is_empty() && batch_bytes + size > MAX_BATCH_BYTES {
                break;
            }
            batch_bytes += size;
            if let Some(record) = self.pending.pop_front() {
                batch.push(record);
            }
        }

        batch
    }

    async fn flush(&mut self) {
        let batch = self.next_batch();
        if batch.is_empty() {
            return;
        }
        let count = batch.len();

        let mut attempt = 0;
        loop {
            match self
                .client
                .put_records(&self.stream_name, batch.clone())
                .await
            {
                Ok(0) => {
                    trace!(count, "Published batch");
                    return;
                }
                Ok(failed) => {
                    // Partial failures are not replayed; redelivery belongs
                    // to the caller's durability story.
                    warn!(count, failed, "Service rejected part of the batch");
                    return;
                }
                Err(err) if err.is_transient() && attempt + 1 < MAX_PUBLISH_ATTEMPTS => {
                    attempt += 1;
                    let delay = self.backoff.next_delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Publish failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(count, error = %err, "Dropping batch after publish failure");
                    return;
                }
            }
        }
    }
}
