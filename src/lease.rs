//! Distributed lease protocol over the coordination store
//!
//! Each consumer process runs one [`LeaseManager`] per stream. The manager
//! keeps a local mirror of the last lease values it observed or wrote, and
//! drives every transition through store-side conditional writes, so that two
//! processes can never both believe they hold a shard while their clocks
//! agree.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace, warn};

use crate::client::IteratorSpec;
use crate::error::{LeaseError, StoreError};
use crate::store::{CheckpointCondition, LeaseStore, ShardLease};

/// Fallback lease identity when hostname resolution fails.
pub const ENV_CONSUMER_ID: &str = "KINESIS_CONSUMER_ID";

/// Resolve this process's lease identity.
///
/// In order: the first IPv4 address the local hostname resolves to, the
/// `KINESIS_CONSUMER_ID` environment variable, and finally a synthesized
/// `consumer-<pid>-<unix_seconds>` id.
pub fn resolve_consumer_id() -> String {
    if let Ok(name) = hostname::get() {
        let name = name.to_string_lossy();
        if let Ok(addrs) = (name.as_ref(), 0u16).to_socket_addrs() {
            if let Some(addr) = addrs.into_iter().find(|a| a.is_ipv4()) {
                return addr.ip().to_string();
            }
        }
    }

    if let Ok(id) = std::env::var(ENV_CONSUMER_ID) {
        if !id.is_empty() {
            return id;
        }
    }

    format!(
        "consumer-{}-{}",
        std::process::id(),
        Utc::now().timestamp()
    )
}

/// The consumer group defaults to the working directory's basename.
pub fn default_consumer_group() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "default".to_string())
}

/// Per-stream lease bookkeeping for one consumer process.
pub struct LeaseManager<S> {
    store: Arc<S>,
    consumer_group: String,
    stream_name: String,
    consumer_id: String,
    retention: Duration,
    checkpoint_condition: CheckpointCondition,
    /// Last values observed or written by this process, per shard.
    leases: HashMap<String, ShardLease>,
}

impl<S: LeaseStore> LeaseManager<S> {
    pub fn new(
        store: Arc<S>,
        consumer_group: impl Into<String>,
        stream_name: impl Into<String>,
        consumer_id: impl Into<String>,
        retention_hours: i32,
        checkpoint_condition: CheckpointCondition,
    ) -> Self {
        Self {
            store,
            consumer_group: consumer_group.into(),
            stream_name: stream_name.into(),
            consumer_id: consumer_id.into(),
            retention: Duration::hours(retention_hours as i64),
            checkpoint_condition,
            leases: HashMap::new(),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Try to take or extend the lease on `shard_id` until `new_expires_at`.
    ///
    /// Returns `false` without writing when another consumer holds an
    /// unexpired lease, and `false` when the conditional write loses the
    /// race (the lease was stolen between read and write). `true` means the
    /// shard is ours until the new expiry.
    pub async fn acquire_or_renew(
        &mut self,
        shard_id: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool, LeaseError> {
        let observed = self
            .store
            .get_leases(&self.consumer_group, &self.stream_name)
            .await?;
        let now = Utc::now();

        if let Some(entry) = observed.get(shard_id) {
            if entry.consumer_id != self.consumer_id && entry.expires_at > now {
                trace!(
                    shard_id = %shard_id,
                    holder = %entry.consumer_id,
                    expires_at = %entry.expires_at,
                    "Shard is held by another live consumer"
                );
                return Ok(false);
            }
            // Keep the observed values; an expired holder's entry is the CAS
            // basis for the takeover below.
            self.leases.insert(shard_id.to_string(), entry.clone());
        }

        let renewed = ShardLease {
            consumer_id: self.consumer_id.clone(),
            expires_at: new_expires_at,
            heartbeat: now,
            checkpoint: None,
        };

        let result = match self.leases.get(shard_id) {
            None => {
                self.store
                    .create_lease(
                        &self.consumer_group,
                        &self.stream_name,
                        shard_id,
                        &renewed,
                    )
                    .await
            }
            Some(local) => {
                self.store
                    .renew_lease(
                        &self.consumer_group,
                        &self.stream_name,
                        shard_id,
                        &local.consumer_id,
                        local.expires_at,
                        &renewed,
                    )
                    .await
            }
        };

        match result {
            Ok(()) => {
                let checkpoint = self
                    .leases
                    .get(shard_id)
                    .and_then(|lease| lease.checkpoint.clone());
                self.leases.insert(
                    shard_id.to_string(),
                    ShardLease {
                        checkpoint,
                        ..renewed
                    },
                );
                debug!(
                    shard_id = %shard_id,
                    consumer_id = %self.consumer_id,
                    expires_at = %new_expires_at,
                    "Lease acquired"
                );
                Ok(true)
            }
            Err(StoreError::ConditionFailed) => {
                debug!(shard_id = %shard_id, "Lost the lease race");
                self.leases.remove(shard_id);
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Persist `sequence_number` as the shard's checkpoint and refresh the
    /// heartbeat.
    ///
    /// Under the pull contract a superseded write surfaces as
    /// [`LeaseError::CheckpointSuperseded`]; the record was already delivered
    /// to user code, so callers treat it as non-fatal.
    pub async fn checkpoint(
        &mut self,
        shard_id: &str,
        sequence_number: &str,
    ) -> Result<(), LeaseError> {
        let now = Utc::now();

        let result = self
            .store
            .write_checkpoint(
                &self.consumer_group,
                &self.stream_name,
                shard_id,
                sequence_number,
                now,
                self.checkpoint_condition,
            )
            .await;

        match result {
            Ok(()) => {
                if let Some(entry) = self.leases.get_mut(shard_id) {
                    entry.checkpoint = Some(sequence_number.to_string());
                    entry.heartbeat = now;
                }
                trace!(
                    shard_id = %shard_id,
                    sequence_number = %sequence_number,
                    "Checkpoint persisted"
                );
                Ok(())
            }
            Err(StoreError::ConditionFailed) => {
                match self.checkpoint_condition {
                    CheckpointCondition::Monotonic => Err(LeaseError::CheckpointSuperseded {
                        shard_id: shard_id.to_string(),
                        sequence: sequence_number.to_string(),
                    }),
                    CheckpointCondition::EntryExists => {
                        Err(LeaseError::NotHeld(shard_id.to_string()))
                    }
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Where a freshly started reader for `shard_id` should begin.
    ///
    /// Falls back to `Latest` when there is no local state, no checkpoint, or
    /// the heartbeat has aged past the stream retention (the checkpointed
    /// record no longer exists in the stream).
    pub fn initial_iterator(&self, shard_id: &str) -> IteratorSpec {
        let Some(entry) = self.leases.get(shard_id) else {
            return IteratorSpec::Latest;
        };
        let Some(checkpoint) = &entry.checkpoint else {
            return IteratorSpec::Latest;
        };

        if Utc::now() - entry.heartbeat > self.retention {
            warn!(
                shard_id = %shard_id,
                heartbeat = %entry.heartbeat,
                retention_hours = self.retention.num_hours(),
                "Heartbeat is stale, starting from latest"
            );
            return IteratorSpec::Latest;
        }

        IteratorSpec::AfterSequenceNumber(checkpoint.clone())
    }

    #[cfg(test)]
    pub(crate) fn insert_local_lease(&mut self, shard_id: &str, lease: ShardLease) {
        self.leases.insert(shard_id.to_string(), lease);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeaseStore;

    const SHARD: &str = "shardId-000000000000";

    fn manager(store: Arc<InMemoryLeaseStore>, consumer_id: &str) -> LeaseManager<InMemoryLeaseStore> {
        LeaseManager::new(
            store,
            "test-app",
            "test-stream",
            consumer_id,
            24,
            CheckpointCondition::Monotonic,
        )
    }

    #[tokio::test]
    async fn test_fresh_lease_single_consumer() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut mgr = manager(store.clone(), "10.0.0.1");

        let acquired = mgr
            .acquire_or_renew(SHARD, Utc::now() + Duration::seconds(30))
            .await
            .unwrap();
        assert!(acquired);

        let leases = store.get_leases("test-app", "test-stream").await.unwrap();
        assert_eq!(leases[SHARD].consumer_id, "10.0.0.1");

        // No checkpoint yet: readers start from latest.
        assert_eq!(mgr.initial_iterator(SHARD), IteratorSpec::Latest);
    }

    #[tokio::test]
    async fn test_preemption_of_expired_holder() {
        let store = Arc::new(InMemoryLeaseStore::new());
        store
            .insert_lease(
                "test-app",
                "test-stream",
                SHARD,
                ShardLease {
                    consumer_id: "A".to_string(),
                    expires_at: Utc::now() - Duration::seconds(1),
                    heartbeat: Utc::now() - Duration::seconds(31),
                    checkpoint: None,
                },
            )
            .await;

        let mut mgr = manager(store.clone(), "B");
        let acquired = mgr
            .acquire_or_renew(SHARD, Utc::now() + Duration::seconds(30))
            .await
            .unwrap();
        assert!(acquired);

        let leases = store.get_leases("test-app", "test-stream").await.unwrap();
        assert_eq!(leases[SHARD].consumer_id, "B");
    }

    #[tokio::test]
    async fn test_live_holder_wins_contention() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let holder_expiry = Utc::now() + Duration::seconds(20);
        store
            .insert_lease(
                "test-app",
                "test-stream",
                SHARD,
                ShardLease {
                    consumer_id: "A".to_string(),
                    expires_at: holder_expiry,
                    heartbeat: Utc::now(),
                    checkpoint: None,
                },
            )
            .await;

        let mut mgr = manager(store.clone(), "B");
        let acquired = mgr
            .acquire_or_renew(SHARD, Utc::now() + Duration::seconds(30))
            .await
            .unwrap();
        assert!(!acquired);

        // Entry unchanged.
        let leases = store.get_leases("test-app", "test-stream").await.unwrap();
        assert_eq!(leases[SHARD].consumer_id, "A");
        assert_eq!(leases[SHARD].expires_at, holder_expiry);
    }

    #[tokio::test]
    async fn test_repeated_renewal_extends_expiry() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut mgr = manager(store.clone(), "10.0.0.1");

        let mut last_expiry = None;
        for i in 1..=3 {
            let expiry = Utc::now() + Duration::seconds(30 * i);
            assert!(mgr.acquire_or_renew(SHARD, expiry).await.unwrap());

            let leases = store.get_leases("test-app", "test-stream").await.unwrap();
            let stored = leases[SHARD].expires_at;
            if let Some(previous) = last_expiry {
                assert!(stored > previous);
            }
            last_expiry = Some(stored);
        }
    }

    #[tokio::test]
    async fn test_checkpoint_then_iterator_resumes_after_sequence() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut mgr = manager(store.clone(), "10.0.0.1");

        assert!(mgr
            .acquire_or_renew(SHARD, Utc::now() + Duration::seconds(30))
            .await
            .unwrap());
        mgr.checkpoint(SHARD, "49590000000000000000001").await.unwrap();

        assert_eq!(
            mgr.initial_iterator(SHARD),
            IteratorSpec::AfterSequenceNumber("49590000000000000000001".to_string())
        );
    }

    #[tokio::test]
    async fn test_stale_heartbeat_falls_back_to_latest() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut mgr = manager(store, "10.0.0.1");

        // Retention is 24h; a 25h-old heartbeat means the checkpointed record
        // has already aged out of the stream.
        mgr.insert_local_lease(
            SHARD,
            ShardLease {
                consumer_id: "10.0.0.1".to_string(),
                expires_at: Utc::now() + Duration::seconds(30),
                heartbeat: Utc::now() - Duration::hours(25),
                checkpoint: Some("49590338271490256608559692538898".to_string()),
            },
        );

        assert_eq!(mgr.initial_iterator(SHARD), IteratorSpec::Latest);
    }

    #[tokio::test]
    async fn test_superseded_checkpoint_is_classified() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut mgr = manager(store.clone(), "10.0.0.1");

        assert!(mgr
            .acquire_or_renew(SHARD, Utc::now() + Duration::seconds(30))
            .await
            .unwrap());
        mgr.checkpoint(SHARD, "200").await.unwrap();

        let err = mgr.checkpoint(SHARD, "100").await.unwrap_err();
        assert!(matches!(err, LeaseError::CheckpointSuperseded { .. }));

        // The winning checkpoint is still in place.
        let leases = store.get_leases("test-app", "test-stream").await.unwrap();
        assert_eq!(leases[SHARD].checkpoint.as_deref(), Some("200"));
    }

    #[tokio::test]
    async fn test_renewal_preserves_checkpoint() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let mut mgr = manager(store.clone(), "10.0.0.1");

        assert!(mgr
            .acquire_or_renew(SHARD, Utc::now() + Duration::seconds(30))
            .await
            .unwrap());
        mgr.checkpoint(SHARD, "300").await.unwrap();
        assert!(mgr
            .acquire_or_renew(SHARD, Utc::now() + Duration::seconds(60))
            .await
            .unwrap());

        let leases = store.get_leases("test-app", "test-stream").await.unwrap();
        assert_eq!(leases[SHARD].checkpoint.as_deref(), Some("300"));
        assert_eq!(
            mgr.initial_iterator(SHARD),
            IteratorSpec::AfterSequenceNumber("300".to_string())
        );
    }

    #[test]
    fn test_consumer_id_resolution_never_fails() {
        // Whatever the environment, some identity comes back.
        let id = resolve_consumer_id();
        assert!(!id.is_empty());
    }

    #[test]
    fn test_default_consumer_group_is_cwd_basename() {
        let group = default_consumer_group();
        assert!(!group.is_empty());
    }
}
