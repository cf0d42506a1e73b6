use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::store::{CheckpointCondition, LeaseStore, ShardLease};

type GroupKey = (String, String);

/// In-memory coordination store.
///
/// Applies the same compare-and-swap rules as the DynamoDB adapter, against a
/// process-local map. Besides backing tests, this is the stateless
/// single-consumer mode: every lease acquisition succeeds locally and
/// checkpoints do not survive the process.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLeaseStore {
    groups: Arc<RwLock<HashMap<GroupKey, HashMap<String, ShardLease>>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory lease store");
        Self::default()
    }

    /// Seed a shard entry directly, bypassing conditions (test setup).
    pub async fn insert_lease(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        lease: ShardLease,
    ) {
        self.groups
            .write()
            .await
            .entry((consumer_group.to_string(), stream_name.to_string()))
            .or_default()
            .insert(shard_id.to_string(), lease);
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get_leases(
        &self,
        consumer_group: &str,
        stream_name: &str,
    ) -> Result<HashMap<String, ShardLease>, StoreError> {
        let groups = self.groups.read().await;
        let leases = groups
            .get(&(consumer_group.to_string(), stream_name.to_string()))
            .cloned()
            .unwrap_or_default();

        trace!(
            consumer_group = %consumer_group,
            stream_name = %stream_name,
            shards = leases.len(),
            "Read leases from memory"
        );

        Ok(leases)
    }

    async fn create_lease(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        lease: &ShardLease,
    ) -> Result<(), StoreError> {
        let mut groups = self.groups.write().await;
        let shards = groups
            .entry((consumer_group.to_string(), stream_name.to_string()))
            .or_default();

        if shards.contains_key(shard_id) {
            return Err(StoreError::ConditionFailed);
        }

        debug!(
            shard_id = %shard_id,
            consumer_id = %lease.consumer_id,
            "Created lease in memory"
        );
        shards.insert(shard_id.to_string(), lease.clone());
        Ok(())
    }

    async fn renew_lease(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        observed_consumer_id: &str,
        observed_expires_at: DateTime<Utc>,
        lease: &ShardLease,
    ) -> Result<(), StoreError> {
        let mut groups = self.groups.write().await;
        let shards = groups
            .entry((consumer_group.to_string(), stream_name.to_string()))
            .or_default();

        let entry = shards
            .get_mut(shard_id)
            .ok_or(StoreError::ConditionFailed)?;

        if entry.consumer_id != observed_consumer_id || entry.expires_at != observed_expires_at {
            return Err(StoreError::ConditionFailed);
        }

        // Only the holder, expiry, and heartbeat move; the checkpoint stays.
        entry.consumer_id = lease.consumer_id.clone();
        entry.expires_at = lease.expires_at;
        entry.heartbeat = lease.heartbeat;

        debug!(
            shard_id = %shard_id,
            consumer_id = %entry.consumer_id,
            expires_at = %entry.expires_at,
            "Renewed lease in memory"
        );
        Ok(())
    }

    async fn write_checkpoint(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        sequence_number: &str,
        heartbeat: DateTime<Utc>,
        condition: CheckpointCondition,
    ) -> Result<(), StoreError> {
        let mut groups = self.groups.write().await;
        let shards = groups
            .entry((consumer_group.to_string(), stream_name.to_string()))
            .or_default();

        let entry = shards
            .get_mut(shard_id)
            .ok_or(StoreError::ConditionFailed)?;

        if condition == CheckpointCondition::Monotonic {
            if let Some(existing) = &entry.checkpoint {
                if existing.as_str() >= sequence_number {
                    return Err(StoreError::ConditionFailed);
                }
            }
        }

        entry.checkpoint = Some(sequence_number.to_string());
        entry.heartbeat = heartbeat;

        trace!(
            shard_id = %shard_id,
            sequence_number = %sequence_number,
            "Checkpoint saved to memory"
        );
        Ok(())
    }
}
