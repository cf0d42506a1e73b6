use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_kinesis::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kinesis::types::{
    PutRecordsRequestEntry, Record, Shard, ShardFilter, ShardFilterType, ShardIteratorType,
    StartingPosition, SubscribeToShardEventStream,
};
use aws_sdk_kinesis::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tracing::trace;

/// Classified errors from the stream service.
///
/// Retryability is decided by [`KinesisClientError::is_transient`] rather than
/// by matching on error type names; the recognized transient conditions are
/// throughput/throttling rejections, subscription stream-initialization
/// failures, timeouts, and connection-level faults.
#[derive(Debug, Clone, Error)]
pub enum KinesisClientError {
    #[error("Throughput exceeded")]
    ThroughputExceeded,

    #[error("Shard iterator expired")]
    ExpiredIterator,

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource in use: {0}")]
    ResourceInUse(String),

    /// The HTTP/2 subscription stream failed to initialize.
    #[error("Subscription stream failed to initialize: {0}")]
    SubscriptionInit(String),

    /// A structurally malformed frame or event from the service.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Service error {code}: {message} (request id {request_id:?})")]
    Service {
        code: String,
        message: String,
        request_id: Option<String>,
    },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Other(String),
}

impl KinesisClientError {
    /// Whether the error is a recognized transient condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KinesisClientError::ThroughputExceeded
                | KinesisClientError::SubscriptionInit(_)
                | KinesisClientError::Timeout(_)
                | KinesisClientError::Connection(_)
        )
    }
}

pub(crate) fn classify_sdk_error<E, R>(err: SdkError<E, R>) -> KinesisClientError
where
    SdkError<E, R>: ProvideErrorMetadata,
{
    let code = err.code().map(str::to_string);
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| "no message".to_string());

    match code.as_deref() {
        Some(
            "ProvisionedThroughputExceededException"
            | "ThrottlingException"
            | "LimitExceededException",
        ) => KinesisClientError::ThroughputExceeded,
        Some("ExpiredIteratorException") => KinesisClientError::ExpiredIterator,
        Some("ResourceNotFoundException") => KinesisClientError::ResourceNotFound(message),
        Some("ResourceInUseException") => KinesisClientError::ResourceInUse(message),
        Some(code) => KinesisClientError::Service {
            code: code.to_string(),
            message,
            request_id: err.meta().extra("aws_request_id").map(str::to_string),
        },
        None => match err {
            SdkError::TimeoutError(_) => KinesisClientError::Timeout("request timeout".to_string()),
            SdkError::DispatchFailure(e) => {
                KinesisClientError::Connection(format!("dispatch failure: {:?}", e))
            }
            SdkError::ResponseError(_) => {
                KinesisClientError::Protocol("unparseable service response".to_string())
            }
            SdkError::ConstructionFailure(_) => {
                KinesisClientError::Other("failed to construct request".to_string())
            }
            _ => KinesisClientError::Other(message),
        },
    }
}

/// Where to start reading a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorSpec {
    /// Start from the newest record
    Latest,
    /// Start from the oldest available record
    TrimHorizon,
    /// Start from a specific sequence number, inclusive
    AtSequenceNumber(String),
    /// Start just after a specific sequence number
    AfterSequenceNumber(String),
    /// Start from a specific timestamp
    AtTimestamp(DateTime<Utc>),
}

impl IteratorSpec {
    fn iterator_type(&self) -> ShardIteratorType {
        match self {
            IteratorSpec::Latest => ShardIteratorType::Latest,
            IteratorSpec::TrimHorizon => ShardIteratorType::TrimHorizon,
            IteratorSpec::AtSequenceNumber(_) => ShardIteratorType::AtSequenceNumber,
            IteratorSpec::AfterSequenceNumber(_) => ShardIteratorType::AfterSequenceNumber,
            IteratorSpec::AtTimestamp(_) => ShardIteratorType::AtTimestamp,
        }
    }

    fn sequence_number(&self) -> Option<&str> {
        match self {
            IteratorSpec::AtSequenceNumber(seq) | IteratorSpec::AfterSequenceNumber(seq) => {
                Some(seq)
            }
            _ => None,
        }
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            IteratorSpec::AtTimestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    fn starting_position(&self) -> Result<StartingPosition, KinesisClientError> {
        let mut builder = StartingPosition::builder().r#type(self.iterator_type());
        if let Some(seq) = self.sequence_number() {
            builder = builder.sequence_number(seq);
        }
        if let Some(ts) = self.timestamp() {
            let system_time: SystemTime = ts.into();
            builder = builder.timestamp(aws_smithy_types::DateTime::from(system_time));
        }
        builder
            .build()
            .map_err(|e| KinesisClientError::Protocol(e.to_string()))
    }
}

/// Approximate arrival time of a record, when the service supplied one.
pub fn approximate_arrival_time(record: &Record) -> Option<DateTime<Utc>> {
    use aws_smithy_types_convert::date_time::DateTimeExt;

    record
        .approximate_arrival_timestamp()
        .and_then(|ts| ts.to_chrono_utc().ok())
}

/// Description of the stream relevant to lease bookkeeping.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub stream_arn: String,
    pub retention_period_hours: i32,
}

/// One event pushed over an enhanced fan-out subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub records: Vec<Record>,
    pub continuation_sequence_number: Option<String>,
}

/// Events from a single shard subscription; ends when the server closes the
/// subscription (roughly every five minutes).
pub type SubscriptionStream = BoxStream<'static, Result<SubscriptionEvent, KinesisClientError>>;

#[async_trait]
pub trait KinesisClientTrait: Send + Sync {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamInfo, KinesisClientError>;

    /// List the open shards of the stream (AT_LATEST filter).
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, KinesisClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorSpec,
    ) -> Result<String, KinesisClientError>;

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<(Vec<Record>, Option<String>), KinesisClientError>;

    /// Resolve a registered consumer's ARN, or `None` when it does not exist.
    async fn describe_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<Option<String>, KinesisClientError>;

    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<String, KinesisClientError>;

    async fn subscribe_to_shard(
        &self,
        consumer_arn: &str,
        shard_id: &str,
        position: &IteratorSpec,
    ) -> Result<SubscriptionStream, KinesisClientError>;

    /// Publish a batch of `(data, partition_key)` pairs, returning the count
    /// of records the service rejected.
    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<(Bytes, String)>,
    ) -> Result<usize, KinesisClientError>;
}

#[async_trait]
impl KinesisClientTrait for Client {
    async fn describe_stream(&self, stream_name: &str) -> Result<StreamInfo, KinesisClientError> {
        let response = self
            .describe_stream()
            .stream_name(stream_name)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let description = response.stream_description.ok_or_else(|| {
            KinesisClientError::Protocol("DescribeStream response missing stream_description".to_string())
        })?;
        Ok(StreamInfo {
            stream_arn: description.stream_arn().to_string(),
            retention_period_hours: description.retention_period_hours(),
        })
    }

    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>, KinesisClientError> {
        let filter = ShardFilter::builder()
            .r#type(ShardFilterType::AtLatest)
            .build()
            .map_err(|e| KinesisClientError::Protocol(e.to_string()))?;

        let mut all_shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // The service accepts either a stream name or a pagination token,
            // never both.
            let request = match next_token.take() {
                Some(token) => self.list_shards().next_token(token),
                None => self
                    .list_shards()
                    .stream_name(stream_name)
                    .shard_filter(filter.clone()),
            };

            let response = request.send().await.map_err(classify_sdk_error)?;
            all_shards.extend(response.shards.unwrap_or_default());

            match response.next_token {
                Some(token) => next_token = Some(token),
                None => break Ok(all_shards),
            }
        }
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &IteratorSpec,
    ) -> Result<String, KinesisClientError> {
        let mut request = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(position.iterator_type());

        if let Some(seq) = position.sequence_number() {
            request = request.starting_sequence_number(seq);
        }
        if let Some(ts) = position.timestamp() {
            let system_time: SystemTime = ts.into();
            request = request.timestamp(aws_smithy_types::DateTime::from(system_time));
        }

        let response = request.send().await.map_err(classify_sdk_error)?;
        Ok(response.shard_iterator.unwrap_or_default())
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<(Vec<Record>, Option<String>), KinesisClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok((
            response.records().to_vec(),
            response.next_shard_iterator().map(String::from),
        ))
    }

    async fn describe_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<Option<String>, KinesisClientError> {
        match self
            .describe_stream_consumer()
            .stream_arn(stream_arn)
            .consumer_name(consumer_name)
            .send()
            .await
        {
            Ok(response) => {
                let description = response.consumer_description.ok_or_else(|| {
                    KinesisClientError::Protocol(
                        "DescribeStreamConsumer response missing consumer_description".to_string(),
                    )
                })?;
                Ok(Some(description.consumer_arn().to_string()))
            }
            Err(err) => match classify_sdk_error(err) {
                KinesisClientError::ResourceNotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn register_stream_consumer(
        &self,
        stream_arn: &str,
        consumer_name: &str,
    ) -> Result<String, KinesisClientError> {
        let response = self
            .register_stream_consumer()
            .stream_arn(stream_arn)
            .consumer_name(consumer_name)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let consumer = response.consumer.ok_or_else(|| {
            KinesisClientError::Protocol("RegisterStreamConsumer response missing consumer".to_string())
        })?;
        Ok(consumer.consumer_arn().to_string())
    }

    async fn subscribe_to_shard(
        &self,
        consumer_arn: &str,
        shard_id: &str,
        position: &IteratorSpec,
    ) -> Result<SubscriptionStream, KinesisClientError> {
        let starting_position = position.starting_position()?;

        let response = self
            .subscribe_to_shard()
            .consumer_arn(consumer_arn)
            .shard_id(shard_id)
            .starting_position(starting_position)
            .send()
            .await
            .map_err(|err| match classify_sdk_error(err) {
                // Connection-level failures at subscribe time are stream
                // initialization failures, retried as normal expiry.
                KinesisClientError::Connection(msg) => KinesisClientError::SubscriptionInit(msg),
                other => other,
            })?;

        let events = futures::stream::unfold(
            (response.event_stream, false),
            |(mut receiver, done)| async move {
                if done {
                    return None;
                }
                match receiver.recv().await {
                    Ok(Some(SubscribeToShardEventStream::SubscribeToShardEvent(event))) => {
                        trace!(
                            continuation = %event.continuation_sequence_number,
                            count = event.records.len(),
                            "Received subscription event"
                        );
                        let item = SubscriptionEvent {
                            records: event.records,
                            continuation_sequence_number: Some(
                                event.continuation_sequence_number,
                            ),
                        };
                        Some((Ok(item), (receiver, false)))
                    }
                    Ok(Some(other)) => Some((
                        Err(KinesisClientError::Protocol(format!(
                            "unexpected subscription event: {:?}",
                            other
                        ))),
                        (receiver, false),
                    )),
                    Ok(None) => None,
                    // Surface the error, then end the stream: the server
                    // tears the subscription down after a fault.
                    Err(err) => Some((Err(classify_sdk_error(err)), (receiver, true))),
                }
            },
        );

        Ok(events.boxed())
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<(Bytes, String)>,
    ) -> Result<usize, KinesisClientError> {
        let mut records = Vec::with_capacity(entries.len());
        for (data, partition_key) in entries {
            let entry = PutRecordsRequestEntry::builder()
                .data(aws_smithy_types::Blob::new(data.to_vec()))
                .partition_key(partition_key)
                .build()
                .map_err(|e| KinesisClientError::Protocol(e.to_string()))?;
            records.push(entry);
        }

        let response = self
            .put_records()
            .stream_name(stream_name)
            .set_records(Some(records))
            .send()
            .await
            .map_err(classify_sdk_error)?;

        Ok(response.failed_record_count.unwrap_or_default() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(KinesisClientError::ThroughputExceeded.is_transient());
        assert!(KinesisClientError::SubscriptionInit("h2".to_string()).is_transient());
        assert!(KinesisClientError::Connection("reset".to_string()).is_transient());
        assert!(!KinesisClientError::ExpiredIterator.is_transient());
        assert!(!KinesisClientError::ResourceNotFound("gone".to_string()).is_transient());
        assert!(!KinesisClientError::Protocol("bad frame".to_string()).is_transient());
    }

    #[test]
    fn test_iterator_spec_mapping() {
        assert_eq!(
            IteratorSpec::Latest.iterator_type(),
            ShardIteratorType::Latest
        );
        assert_eq!(
            IteratorSpec::AfterSequenceNumber("42".to_string()).iterator_type(),
            ShardIteratorType::AfterSequenceNumber
        );
        assert_eq!(
            IteratorSpec::AfterSequenceNumber("42".to_string()).sequence_number(),
            Some("42")
        );
        assert_eq!(IteratorSpec::TrimHorizon.sequence_number(), None);
    }

    #[test]
    fn test_starting_position_requires_sequence() {
        let position = IteratorSpec::AfterSequenceNumber("49590".to_string())
            .starting_position()
            .expect("Failed to build starting position");
        assert_eq!(position.sequence_number(), Some("49590"));
    }
}
