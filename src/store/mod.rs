//! Coordination-store adapters for lease and checkpoint persistence
//!
//! All leases for a `(consumer group, stream)` pair live in a single store
//! item, under a `shards` mapping keyed by shard id. Adapters expose
//! conditional writes over individual entries of that mapping so that
//! concurrent consumers coordinate purely through store-side compare-and-swap.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

/// One shard's lease as stored under `shards.<shard_id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLease {
    /// Identity of the lease holder
    pub consumer_id: String,
    /// Instant after which another consumer may preempt
    pub expires_at: DateTime<Utc>,
    /// Last successful renewal or checkpoint
    pub heartbeat: DateTime<Utc>,
    /// Last sequence number surfaced to user code
    pub checkpoint: Option<String>,
}

/// Condition applied to a checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointCondition {
    /// The stored checkpoint must be absent or lexically smaller than the new
    /// sequence. Pull-mode consumers use this to keep checkpoints
    /// non-decreasing.
    Monotonic,
    /// Only the shard entry itself must exist. Push-mode consumers relax the
    /// ordering check because fan-out records can arrive out of lexical order
    /// across reconnections.
    EntryExists,
}

/// Trait for coordination-store implementations
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Strongly-consistent read of every shard lease for the group/stream
    /// pair. Returns an empty map when the item does not exist yet.
    async fn get_leases(
        &self,
        consumer_group: &str,
        stream_name: &str,
    ) -> Result<HashMap<String, ShardLease>, StoreError>;

    /// Create a shard entry, failing with [`StoreError::ConditionFailed`] if
    /// one already exists.
    async fn create_lease(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        lease: &ShardLease,
    ) -> Result<(), StoreError>;

    /// Compare-and-swap renewal: succeeds only while the stored entry still
    /// carries `observed_consumer_id` / `observed_expires_at`, and touches
    /// only the holder, expiry, and heartbeat sub-fields so a concurrent
    /// checkpoint write is never clobbered.
    async fn renew_lease(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        observed_consumer_id: &str,
        observed_expires_at: DateTime<Utc>,
        lease: &ShardLease,
    ) -> Result<(), StoreError>;

    /// Persist a checkpoint and refresh the heartbeat under the given
    /// condition.
    async fn write_checkpoint(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        sequence_number: &str,
        heartbeat: DateTime<Utc>,
        condition: CheckpointCondition,
    ) -> Result<(), StoreError>;
}

// Re-export implementations
#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbLeaseStore;
pub use memory::InMemoryLeaseStore;
