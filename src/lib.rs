//! kinesis-flock - coordinated AWS Kinesis consumption
//!
//! This library lets a fleet of processes share the shards of a Kinesis
//! stream, with:
//!
//! - Distributed per-shard leases in DynamoDB with conditional-write
//!   compare-and-swap, so each shard has exactly one live reader
//! - Checkpoint persistence and resume-after-crash from the last delivered
//!   sequence number
//! - Pull (get-records) and push (enhanced fan-out) shard readers with
//!   bounded buffering and backpressure
//! - Graceful SIGINT/SIGTERM shutdown
//! - A buffered producer batching records up to the put-records limits
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use kinesis_flock::{
//!     ConsumerConfig, KinesisConsumer, ReaderMode, RecordHandler,
//!     store::DynamoDbLeaseStore,
//! };
//! use aws_sdk_kinesis::types::Record;
//! use async_trait::async_trait;
//!
//! struct MyHandler;
//!
//! #[async_trait]
//! impl RecordHandler for MyHandler {
//!     async fn handle_record(&self, shard_id: &str, record: &Record) -> anyhow::Result<()> {
//!         tracing::info!(shard_id, sequence = record.sequence_number(), "got record");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//!     let kinesis = aws_sdk_kinesis::Client::new(&aws_config);
//!     let dynamo = aws_sdk_dynamodb::Client::new(&aws_config);
//!
//!     let store = DynamoDbLeaseStore::new(dynamo, "kinesis-leases".to_string());
//!
//!     let config = ConsumerConfig {
//!         stream_name: "events".to_string(),
//!         consumer_group: Some("analytics".to_string()),
//!         mode: ReaderMode::Pull,
//!         ..Default::default()
//!     };
//!
//!     let (mut consumer, _errors) = KinesisConsumer::new(config, MyHandler, kinesis, store);
//!     consumer.run(kinesis_flock::shutdown_signal()).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Enhanced fan-out
//!
//! Set [`ReaderMode::Push`] and a `consumer_name`; the consumer is registered
//! with the stream on first start and each shard is read over a dedicated
//! HTTP/2 subscription instead of polling.
//!
//! # Producing
//!
//! ```rust,no_run
//! use kinesis_flock::KinesisProducer;
//!
//! async fn example(client: aws_sdk_kinesis::Client) -> anyhow::Result<()> {
//!     let producer = KinesisProducer::new(client, "events");
//!     producer.put(&b"payload"[..], "user-42")?;
//!     // Flush outstanding records before exiting.
//!     producer.drain().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod consumer;
pub mod error;
pub mod lease;
pub mod producer;
pub mod reader;
pub mod retry;
pub mod store;

// Mocks and builders, also available to integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;
#[cfg(test)]
mod tests;

pub use client::{IteratorSpec, KinesisClientError, KinesisClientTrait, StreamInfo};
pub use consumer::{
    shutdown_signal, ConsumerConfig, KinesisConsumer, ReaderMode, RecordHandler,
};
pub use error::{ConsumerError, LeaseError, ProducerError, Result, StoreError};
pub use lease::LeaseManager;
pub use producer::KinesisProducer;
pub use reader::{ReaderError, ReaderHandle};
pub use retry::{Backoff, ExponentialBackoff};
pub use store::{CheckpointCondition, LeaseStore, ShardLease};

// Re-export implementations
pub use crate::store::memory::InMemoryLeaseStore;

#[cfg(feature = "dynamodb-store")]
pub use crate::store::dynamodb::DynamoDbLeaseStore;
