//! Periodic get-records reader for one shard

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::client::{IteratorSpec, KinesisClientError, KinesisClientTrait};
use crate::reader::{forward_error, ErrorSender, ReaderHandle, RecordSender};
use crate::retry::{Backoff, LinearBackoff};

/// Pause between successful fetches.
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_secs(1);
/// Ceiling for the retry delay; a reader whose delay grows past this without
/// an intervening success gives up.
pub const MAX_SLEEP_TIME: Duration = Duration::from_secs(30);
/// Records requested per get-records call.
pub const DEFAULT_PULL_LIMIT: i32 = 10_000;

const RETRY_STEP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Starting,
    Fetching,
    Sleeping,
    Retrying,
    Closed,
}

/// Reads one shard with a get-records loop until the shard closes, the
/// retry budget saturates, or shutdown is signalled.
pub struct PullShardReader<C> {
    client: Arc<C>,
    stream_name: String,
    shard_id: String,
    position: IteratorSpec,
    limit: i32,
    sleep_time: Duration,
    backoff: LinearBackoff,
    records_tx: RecordSender,
    errors_tx: ErrorSender,
}

impl<C: KinesisClientTrait + 'static> PullShardReader<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        client: Arc<C>,
        stream_name: impl Into<String>,
        shard_id: impl Into<String>,
        position: IteratorSpec,
        sleep_time: Option<Duration>,
        limit: Option<i32>,
        records_tx: RecordSender,
        errors_tx: ErrorSender,
    ) -> ReaderHandle {
        let shard_id = shard_id.into();
        let reader = Self {
            client,
            stream_name: stream_name.into(),
            shard_id: shard_id.clone(),
            position,
            limit: limit.unwrap_or(DEFAULT_PULL_LIMIT),
            sleep_time: sleep_time.unwrap_or(DEFAULT_SLEEP_TIME),
            backoff: LinearBackoff::new(RETRY_STEP, MAX_SLEEP_TIME),
            records_tx,
            errors_tx,
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(reader.run(shutdown_rx));
        ReaderHandle::new(shard_id, shutdown_tx, task)
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(shard_id = %self.shard_id, "Starting pull reader");

        let mut state = ReaderState::Starting;
        let mut iterator: Option<String> = None;
        let mut last_sequence: Option<String> = None;
        let mut retries: u32 = 0;
        // Non-retryable errors get one extra attempt before they are surfaced.
        let mut final_attempt = false;

        loop {
            if *shutdown.borrow() {
                info!(shard_id = %self.shard_id, "Pull reader shutting down");
                return;
            }

            let concrete_iterator = match &iterator {
                Some(it) => it.clone(),
                None => {
                    transition(&mut state, ReaderState::Starting, &self.shard_id);
                    match self
                        .client
                        .get_shard_iterator(&self.stream_name, &self.shard_id, &self.position)
                        .await
                    {
                        Ok(it) => {
                            iterator = Some(it.clone());
                            it
                        }
                        Err(err) => {
                            if !self
                                .handle_failure(
                                    err,
                                    &mut state,
                                    &mut retries,
                                    &mut final_attempt,
                                    &mut shutdown,
                                )
                                .await
                            {
                                return;
                            }
                            continue;
                        }
                    }
                }
            };

            transition(&mut state, ReaderState::Fetching, &self.shard_id);
            match self.client.get_records(&concrete_iterator, self.limit).await {
                Ok((records, next_iterator)) => {
                    retries = 0;
                    final_attempt = false;

                    for record in records {
                        last_sequence = Some(record.sequence_number().to_string());
                        tokio::select! {
                            sent = self.records_tx.send((self.shard_id.clone(), record)) => {
                                if sent.is_err() {
                                    debug!(shard_id = %self.shard_id, "Record channel closed, pull reader exiting");
                                    return;
                                }
                            }
                            _ = shutdown.changed() => {
                                info!(shard_id = %self.shard_id, "Pull reader shutting down mid-batch");
                                return;
                            }
                        }
                    }

                    match next_iterator {
                        Some(next) => iterator = Some(next),
                        None => {
                            // The shard is closed; it stops appearing in
                            // AT_LATEST listings and the lease ages out.
                            transition(&mut state, ReaderState::Closed, &self.shard_id);
                            info!(shard_id = %self.shard_id, "Shard is closed, pull reader exiting");
                            return;
                        }
                    }

                    transition(&mut state, ReaderState::Sleeping, &self.shard_id);
                    if !sleep_or_shutdown(self.sleep_time, &mut shutdown).await {
                        return;
                    }
                }
                Err(KinesisClientError::ExpiredIterator) => {
                    warn!(shard_id = %self.shard_id, "Iterator expired, re-resolving");
                    if let Some(seq) = &last_sequence {
                        self.position = IteratorSpec::AfterSequenceNumber(seq.clone());
                    }
                    iterator = None;
                }
                Err(err) => {
                    if !self
                        .handle_failure(err, &mut state, &mut retries, &mut final_attempt, &mut shutdown)
                        .await
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Apply the retry policy to a failed service call. Returns `false` when
    /// the reader should exit.
    ///
    /// `retries` accrues only on transient errors; it drives the growing
    /// delay and the give-up check. Non-retryable errors run on their own
    /// one-more-pass track and never terminate the reader.
    async fn handle_failure(
        &self,
        err: KinesisClientError,
        state: &mut ReaderState,
        retries: &mut u32,
        final_attempt: &mut bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let delay = if err.is_transient() {
            *retries += 1;

            if self.backoff.saturated(*retries) {
                error!(
                    shard_id = %self.shard_id,
                    retries = *retries,
                    error = %err,
                    "No successful call before backoff limit, pull reader exiting"
                );
                forward_error(&self.errors_tx, &self.shard_id, err);
                return false;
            }

            warn!(
                shard_id = %self.shard_id,
                retries = *retries,
                error = %err,
                "Transient error, backing off"
            );
            self.backoff.next_delay(*retries)
        } else if !*final_attempt {
            // One more try before the error is surfaced.
            *final_attempt = true;
            warn!(
                shard_id = %self.shard_id,
                error = %err,
                "Non-retryable error, one more attempt"
            );
            self.backoff.next_delay(1)
        } else {
            *final_attempt = false;
            error!(
                shard_id = %self.shard_id,
                error = %err,
                "Non-retryable error persists, surfacing"
            );
            forward_error(&self.errors_tx, &self.shard_id, err);
            self.backoff.next_delay(1)
        };

        transition(state, ReaderState::Retrying, &self.shard_id);
        sleep_or_shutdown(delay, shutdown).await
    }
}

fn transition(state: &mut ReaderState, next: ReaderState, shard_id: &str) {
    if *state != next {
        trace!(shard_id = %shard_id, from = ?state, to = ?next, "Reader state change");
        *state = next;
    }
}

/// Sleep, returning `false` if shutdown was signalled first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}
