use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client as DynamoClient;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument, trace, warn};

use crate::error::StoreError;
use crate::retry::{Backoff, FixedBackoff};
use crate::store::{CheckpointCondition, LeaseStore, ShardLease};

const ATTR_CONSUMER_GROUP: &str = "consumerGroup";
const ATTR_STREAM_NAME: &str = "streamName";
const ATTR_SHARDS: &str = "shards";
const ATTR_CONSUMER_ID: &str = "consumerId";
const ATTR_EXPIRES_IN: &str = "expiresIn";
const ATTR_HEARTBEAT: &str = "heartbeat";
const ATTR_CHECKPOINT: &str = "checkpoint";

/// Outcome classification for a single DynamoDB call.
#[derive(Debug)]
enum DynamoCallError {
    Throttled,
    ConditionFailed,
    /// A nested update was structurally rejected; happens when the parent
    /// `shards` map does not exist yet.
    Validation(String),
    Other(String),
}

impl From<DynamoCallError> for StoreError {
    fn from(err: DynamoCallError) -> Self {
        match err {
            DynamoCallError::ConditionFailed => StoreError::ConditionFailed,
            DynamoCallError::Validation(msg) => StoreError::Validation(msg),
            DynamoCallError::Throttled => {
                StoreError::Other(anyhow::anyhow!("throttled past retry policy"))
            }
            DynamoCallError::Other(msg) => StoreError::Other(anyhow::anyhow!(msg)),
        }
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> DynamoCallError
where
    SdkError<E, R>: ProvideErrorMetadata,
{
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| "no message".to_string());

    match err.code() {
        Some(
            "ProvisionedThroughputExceededException"
            | "ThrottlingException"
            | "RequestLimitExceeded",
        ) => DynamoCallError::Throttled,
        Some("ConditionalCheckFailedException") => DynamoCallError::ConditionFailed,
        Some("ValidationException") => DynamoCallError::Validation(message),
        Some(code) => DynamoCallError::Other(format!("{}: {}", code, message)),
        None => DynamoCallError::Other(message),
    }
}

fn encode_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Validation(format!("bad timestamp {:?}: {}", raw, e)))
}

/// DynamoDB-backed coordination store.
///
/// One item per `(consumerGroup, streamName)`; all shard leases live in the
/// item's `shards` map and every write is a conditional update over a single
/// nested entry. Throttling responses are retried with a fixed one-second
/// delay until they clear; all other service errors propagate.
#[derive(Debug, Clone)]
pub struct DynamoDbLeaseStore {
    client: DynamoClient,
    table_name: String,
    throttle_backoff: FixedBackoff,
}

impl DynamoDbLeaseStore {
    pub fn builder() -> DynamoDbLeaseStoreBuilder {
        DynamoDbLeaseStoreBuilder::new()
    }

    pub fn new(client: DynamoClient, table_name: String) -> Self {
        Self::builder()
            .with_client(client)
            .with_table_name(table_name)
            .build()
            .expect("Failed to create DynamoDbLeaseStore with default configuration")
    }

    fn lease_attribute(lease: &ShardLease) -> AttributeValue {
        let mut entry = HashMap::from([
            (
                ATTR_CONSUMER_ID.to_string(),
                AttributeValue::S(lease.consumer_id.clone()),
            ),
            (
                ATTR_EXPIRES_IN.to_string(),
                AttributeValue::S(encode_time(lease.expires_at)),
            ),
            (
                ATTR_HEARTBEAT.to_string(),
                AttributeValue::S(encode_time(lease.heartbeat)),
            ),
        ]);
        if let Some(checkpoint) = &lease.checkpoint {
            entry.insert(
                ATTR_CHECKPOINT.to_string(),
                AttributeValue::S(checkpoint.clone()),
            );
        }
        AttributeValue::M(entry)
    }

    fn parse_lease(entry: &AttributeValue) -> Result<ShardLease, StoreError> {
        let map = entry
            .as_m()
            .map_err(|_| StoreError::Validation("shard entry is not a map".to_string()))?;

        let field = |name: &str| -> Result<&String, StoreError> {
            map.get(name)
                .and_then(|v| v.as_s().ok())
                .ok_or_else(|| StoreError::Validation(format!("missing field {}", name)))
        };

        Ok(ShardLease {
            consumer_id: field(ATTR_CONSUMER_ID)?.clone(),
            expires_at: decode_time(field(ATTR_EXPIRES_IN)?)?,
            heartbeat: decode_time(field(ATTR_HEARTBEAT)?)?,
            checkpoint: map
                .get(ATTR_CHECKPOINT)
                .and_then(|v| v.as_s().ok())
                .cloned(),
        })
    }

    /// Issue one conditional update over `shards.<shard_id>`, retrying
    /// throttles indefinitely.
    async fn try_update(
        &self,
        consumer_group: &str,
        stream_name: &str,
        update_expression: &str,
        condition_expression: Option<&str>,
        names: &HashMap<String, String>,
        values: &HashMap<String, AttributeValue>,
    ) -> Result<(), DynamoCallError> {
        loop {
            let mut request = self
                .client
                .update_item()
                .table_name(&self.table_name)
                .key(
                    ATTR_CONSUMER_GROUP,
                    AttributeValue::S(consumer_group.to_string()),
                )
                .key(ATTR_STREAM_NAME, AttributeValue::S(stream_name.to_string()))
                .update_expression(update_expression)
                .set_expression_attribute_names(Some(names.clone()))
                .set_expression_attribute_values(Some(values.clone()));

            if let Some(condition) = condition_expression {
                request = request.condition_expression(condition);
            }

            match request.send().await {
                Ok(_) => return Ok(()),
                Err(err) => match classify(err) {
                    DynamoCallError::Throttled => {
                        let delay = self.throttle_backoff.next_delay(1);
                        warn!(
                            table = %self.table_name,
                            delay_ms = delay.as_millis() as u64,
                            "DynamoDB throttled update, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    other => return Err(other),
                },
            }
        }
    }

    /// Create the `shards` map when the item or the map is missing, so a
    /// retried nested update can land.
    async fn bootstrap_shards_map(
        &self,
        consumer_group: &str,
        stream_name: &str,
    ) -> Result<(), StoreError> {
        debug!(
            table = %self.table_name,
            consumer_group = %consumer_group,
            stream_name = %stream_name,
            "Bootstrapping shards map"
        );

        let names = HashMap::from([("#shards".to_string(), ATTR_SHARDS.to_string())]);
        let values = HashMap::from([(":empty".to_string(), AttributeValue::M(HashMap::new()))]);

        self.try_update(
            consumer_group,
            stream_name,
            "SET #shards = if_not_exists(#shards, :empty)",
            None,
            &names,
            &values,
        )
        .await
        .map_err(StoreError::from)
    }

    /// A nested conditional update with the bootstrap recovery: a structural
    /// rejection triggers map creation and exactly one retry of the original
    /// call. A second rejection propagates.
    async fn conditional_update(
        &self,
        consumer_group: &str,
        stream_name: &str,
        update_expression: &str,
        condition_expression: Option<&str>,
        names: HashMap<String, String>,
        values: HashMap<String, AttributeValue>,
    ) -> Result<(), StoreError> {
        match self
            .try_update(
                consumer_group,
                stream_name,
                update_expression,
                condition_expression,
                &names,
                &values,
            )
            .await
        {
            Err(DynamoCallError::Validation(msg)) => {
                trace!(
                    consumer_group = %consumer_group,
                    stream_name = %stream_name,
                    reason = %msg,
                    "Nested update rejected, creating shards map and retrying once"
                );
                self.bootstrap_shards_map(consumer_group, stream_name)
                    .await?;
                self.try_update(
                    consumer_group,
                    stream_name,
                    update_expression,
                    condition_expression,
                    &names,
                    &values,
                )
                .await
                .map_err(StoreError::from)
            }
            other => other.map_err(StoreError::from),
        }
    }
}

#[async_trait]
impl LeaseStore for DynamoDbLeaseStore {
    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get_leases(
        &self,
        consumer_group: &str,
        stream_name: &str,
    ) -> Result<HashMap<String, ShardLease>, StoreError> {
        let item = loop {
            let result = self
                .client
                .get_item()
                .table_name(&self.table_name)
                .key(
                    ATTR_CONSUMER_GROUP,
                    AttributeValue::S(consumer_group.to_string()),
                )
                .key(ATTR_STREAM_NAME, AttributeValue::S(stream_name.to_string()))
                .consistent_read(true)
                .send()
                .await;

            match result {
                Ok(response) => break response.item,
                Err(err) => match classify(err) {
                    DynamoCallError::Throttled => {
                        let delay = self.throttle_backoff.next_delay(1);
                        warn!(
                            table = %self.table_name,
                            delay_ms = delay.as_millis() as u64,
                            "DynamoDB throttled read, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    other => return Err(other.into()),
                },
            }
        };

        let mut leases = HashMap::new();
        if let Some(shards) = item.as_ref().and_then(|item| item.get(ATTR_SHARDS)) {
            let map = shards
                .as_m()
                .map_err(|_| StoreError::Validation("shards attribute is not a map".to_string()))?;
            for (shard_id, entry) in map {
                leases.insert(shard_id.clone(), Self::parse_lease(entry)?);
            }
        }

        trace!(shards = leases.len(), "Read leases from DynamoDB");
        Ok(leases)
    }

    #[instrument(skip(self, lease), fields(table = %self.table_name))]
    async fn create_lease(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        lease: &ShardLease,
    ) -> Result<(), StoreError> {
        let names = HashMap::from([
            ("#shards".to_string(), ATTR_SHARDS.to_string()),
            ("#sid".to_string(), shard_id.to_string()),
        ]);
        let values = HashMap::from([(":entry".to_string(), Self::lease_attribute(lease))]);

        self.conditional_update(
            consumer_group,
            stream_name,
            "SET #shards.#sid = :entry",
            Some("attribute_not_exists(#shards.#sid)"),
            names,
            values,
        )
        .await?;

        debug!(
            shard_id = %shard_id,
            consumer_id = %lease.consumer_id,
            "Created lease in DynamoDB"
        );
        Ok(())
    }

    #[instrument(skip(self, lease), fields(table = %self.table_name))]
    async fn renew_lease(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        observed_consumer_id: &str,
        observed_expires_at: DateTime<Utc>,
        lease: &ShardLease,
    ) -> Result<(), StoreError> {
        let names = HashMap::from([
            ("#shards".to_string(), ATTR_SHARDS.to_string()),
            ("#sid".to_string(), shard_id.to_string()),
            ("#cid".to_string(), ATTR_CONSUMER_ID.to_string()),
            ("#exp".to_string(), ATTR_EXPIRES_IN.to_string()),
            ("#hb".to_string(), ATTR_HEARTBEAT.to_string()),
        ]);
        let values = HashMap::from([
            (
                ":cid".to_string(),
                AttributeValue::S(lease.consumer_id.clone()),
            ),
            (
                ":exp".to_string(),
                AttributeValue::S(encode_time(lease.expires_at)),
            ),
            (
                ":hb".to_string(),
                AttributeValue::S(encode_time(lease.heartbeat)),
            ),
            (
                ":ocid".to_string(),
                AttributeValue::S(observed_consumer_id.to_string()),
            ),
            (
                ":oexp".to_string(),
                AttributeValue::S(encode_time(observed_expires_at)),
            ),
        ]);

        // Touch only the three ownership sub-fields; a checkpoint written
        // concurrently by the previous holder stays intact.
        self.conditional_update(
            consumer_group,
            stream_name,
            "SET #shards.#sid.#cid = :cid, #shards.#sid.#exp = :exp, #shards.#sid.#hb = :hb",
            Some("#shards.#sid.#cid = :ocid AND #shards.#sid.#exp = :oexp"),
            names,
            values,
        )
        .await?;

        debug!(
            shard_id = %shard_id,
            consumer_id = %lease.consumer_id,
            "Renewed lease in DynamoDB"
        );
        Ok(())
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn write_checkpoint(
        &self,
        consumer_group: &str,
        stream_name: &str,
        shard_id: &str,
        sequence_number: &str,
        heartbeat: DateTime<Utc>,
        condition: CheckpointCondition,
    ) -> Result<(), StoreError> {
        let names = HashMap::from([
            ("#shards".to_string(), ATTR_SHARDS.to_string()),
            ("#sid".to_string(), shard_id.to_string()),
            ("#cp".to_string(), ATTR_CHECKPOINT.to_string()),
            ("#hb".to_string(), ATTR_HEARTBEAT.to_string()),
        ]);
        let values = HashMap::from([
            (
                ":seq".to_string(),
                AttributeValue::S(sequence_number.to_string()),
            ),
            (":hb".to_string(), AttributeValue::S(encode_time(heartbeat))),
        ]);

        let condition_expression = match condition {
            CheckpointCondition::Monotonic => {
                "attribute_not_exists(#shards.#sid.#cp) OR #shards.#sid.#cp < :seq"
            }
            CheckpointCondition::EntryExists => "attribute_exists(#shards.#sid)",
        };

        self.conditional_update(
            consumer_group,
            stream_name,
            "SET #shards.#sid.#cp = :seq, #shards.#sid.#hb = :hb",
            Some(condition_expression),
            names,
            values,
        )
        .await?;

        trace!(
            shard_id = %shard_id,
            sequence_number = %sequence_number,
            "Checkpoint saved to DynamoDB"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DynamoDbLeaseStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    throttle_delay: Option<Duration>,
}

impl DynamoDbLeaseStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = Some(delay);
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbLeaseStore> {
        Ok(DynamoDbLeaseStore {
            client: self
                .client
                .ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name: self
                .table_name
                .ok_or_else(|| anyhow::anyhow!("Table name is required"))?,
            throttle_backoff: FixedBackoff::new(
                self.throttle_delay.unwrap_or(Duration::from_secs(1)),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_credential_types::Credentials;
    use aws_sdk_dynamodb::config::Builder;

    fn test_client() -> DynamoClient {
        let credentials = Credentials::new("test", "test", None, None, "test");
        let config = Builder::new()
            .behavior_version(aws_sdk_dynamodb::config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(aws_sdk_dynamodb::config::Region::new("us-east-1"))
            .build();
        DynamoClient::from_conf(config)
    }

    #[test]
    fn test_builder_requires_table() {
        let result = DynamoDbLeaseStore::builder().with_client(test_client()).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_lease_attribute_round_trip() {
        let lease = ShardLease {
            consumer_id: "10.0.0.7".to_string(),
            expires_at: Utc::now(),
            heartbeat: Utc::now(),
            checkpoint: Some("49590338271490256608559692538361571095921575989136588898".to_string()),
        };

        let parsed = DynamoDbLeaseStore::parse_lease(&DynamoDbLeaseStore::lease_attribute(&lease))
            .expect("Failed to parse encoded lease");

        assert_eq!(parsed.consumer_id, lease.consumer_id);
        assert_eq!(parsed.checkpoint, lease.checkpoint);
        // Encoding is millisecond precision
        assert_eq!(
            encode_time(parsed.expires_at),
            encode_time(lease.expires_at)
        );
    }

    #[test]
    fn test_lease_attribute_omits_absent_checkpoint() {
        let lease = ShardLease {
            consumer_id: "10.0.0.7".to_string(),
            expires_at: Utc::now(),
            heartbeat: Utc::now(),
            checkpoint: None,
        };

        let attr = DynamoDbLeaseStore::lease_attribute(&lease);
        let map = attr.as_m().unwrap();
        assert!(!map.contains_key(ATTR_CHECKPOINT));

        let parsed = DynamoDbLeaseStore::parse_lease(&attr).unwrap();
        assert_eq!(parsed.checkpoint, None);
    }

    #[test]
    fn test_decode_time_rejects_garbage() {
        assert!(decode_time("not-a-timestamp").is_err());
        assert!(decode_time("2024-03-01T10:30:00.000Z").is_ok());
    }
}
