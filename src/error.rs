//! Error types for the consumer coordination library

use thiserror::Error;

use crate::client::KinesisClientError;

/// Main error type for consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Failed to describe stream {0}: {1}")]
    DescribeStreamFailed(String, String),

    #[error("Failed to register stream consumer {0}: {1}")]
    ConsumerRegistrationFailed(String, String),

    #[error("Push mode requires a consumer name")]
    MissingConsumerName,

    #[error("AWS Kinesis error: {0}")]
    KinesisError(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("Record handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConsumerError {
    pub(crate) fn handler(err: impl Into<anyhow::Error>) -> Self {
        ConsumerError::Handler(err.into())
    }
}

impl From<KinesisClientError> for ConsumerError {
    fn from(err: KinesisClientError) -> Self {
        ConsumerError::KinesisError(err.to_string())
    }
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Error type for lease protocol operations
#[derive(Debug, Error)]
pub enum LeaseError {
    /// A conditional checkpoint write lost to a newer sequence already in the
    /// store. The record was still delivered (at-least-once).
    #[error("Checkpoint for shard {shard_id} superseded at sequence {sequence}")]
    CheckpointSuperseded { shard_id: String, sequence: String },

    #[error("Shard {0} is not held by this consumer")]
    NotHeld(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error type for coordination store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write found the stored values changed under us.
    #[error("Conditional write failed")]
    ConditionFailed,

    /// The store rejected a nested write as structurally invalid. Seen once
    /// per item lifetime when the `shards` map has not been created yet; the
    /// adapter recovers from the first occurrence.
    #[error("Store validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error type for producer operations
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("Producer worker has shut down")]
    Closed,

    #[error("Record of {0} bytes exceeds the per-batch size limit")]
    RecordTooLarge(usize),

    #[error("Failed to publish batch: {0}")]
    PublishFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let store_err = StoreError::ConditionFailed;
        let lease_err: LeaseError = store_err.into();
        assert!(matches!(lease_err, LeaseError::Store(_)));

        let consumer_err: ConsumerError = lease_err.into();
        assert!(matches!(consumer_err, ConsumerError::Lease(_)));

        let client_err = KinesisClientError::ThroughputExceeded;
        let consumer_err: ConsumerError = client_err.into();
        assert!(matches!(consumer_err, ConsumerError::KinesisError(_)));
    }

    #[test]
    fn test_error_messages() {
        let err = LeaseError::CheckpointSuperseded {
            shard_id: "shardId-000000000000".to_string(),
            sequence: "495".to_string(),
        };
        assert!(err.to_string().contains("shardId-000000000000"));

        let err = ProducerError::RecordTooLarge(2 << 20);
        assert!(err.to_string().contains("bytes"));
    }
}
