//! Per-shard readers
//!
//! Each actively leased shard is read by exactly one reader task. Readers
//! push `(shard_id, record)` pairs into the orchestrator's bounded channel —
//! a full channel blocks the reader, which is the backpressure into the
//! network loops — and surface classified failures on an unbounded error
//! channel kept for observability. The pull and push variants share nothing
//! but this contract and the [`ReaderHandle`] capability (liveness probe,
//! cooperative shutdown, background progress).

pub mod pull;
pub mod push;

pub use pull::PullShardReader;
pub use push::PushShardReader;

use aws_sdk_kinesis::types::Record;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::client::KinesisClientError;

/// A record paired with the shard it came from.
pub type ShardRecord = (String, Record);

pub type RecordSender = mpsc::Sender<ShardRecord>;
pub type RecordReceiver = mpsc::Receiver<ShardRecord>;

/// A classified reader failure, surfaced for observability. The orchestrator
/// does not consume these; user code may drain them.
#[derive(Debug)]
pub struct ReaderError {
    pub shard_id: String,
    pub error: KinesisClientError,
}

pub type ErrorSender = mpsc::UnboundedSender<ReaderError>;
pub type ErrorReceiver = mpsc::UnboundedReceiver<ReaderError>;

/// Handle to a running reader task.
pub struct ReaderHandle {
    shard_id: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    pub(crate) fn new(
        shard_id: impl Into<String>,
        shutdown_tx: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            shard_id: shard_id.into(),
            shutdown_tx,
            task,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Whether the reader is still making progress in the background.
    pub fn alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal shutdown and wait for the reader to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.task.await {
            if err.is_panic() {
                warn!(shard_id = %self.shard_id, "Reader task panicked during shutdown");
            }
        }
    }
}

pub(crate) fn forward_error(errors_tx: &ErrorSender, shard_id: &str, error: KinesisClientError) {
    let _ = errors_tx.send(ReaderError {
        shard_id: shard_id.to_string(),
        error,
    });
}
