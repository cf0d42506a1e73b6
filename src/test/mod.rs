//! Test utilities and mock implementations


use std::time::Duration;

use aws_sdk_kinesis::types::{Record, Shard};

use crate::client::SubscriptionEvent;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a test record with the given sequence number and payload
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> Record {
        Record::builder()
            .sequence_number(sequence_number)
            .data(aws_smithy_types::Blob::new(data.to_vec()))
            .partition_key("test-partition-key")
            .build()
            .expect("Failed to build test record")
    }

    /// Create a test shard with the given ID
    pub fn create_test_shard(shard_id: &str) -> Shard {
        Shard::builder()
            .shard_id(shard_id)
            .build()
            .expect("Failed to build test shard")
    }

    /// Create `count` records with `sequence-<n>` sequence numbers
    pub fn create_test_records(count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Self::create_test_record(
                    &format!("sequence-{}", i),
                    format!("data-{}", i).as_bytes(),
                )
            })
            .collect()
    }

    /// Create a subscription event carrying the given sequence numbers
    pub fn create_subscription_event(
        sequences: &[&str],
        continuation: Option<&str>,
    ) -> SubscriptionEvent {
        SubscriptionEvent {
            records: sequences
                .iter()
                .map(|seq| Self::create_test_record(seq, b"push-data"))
                .collect(),
            continuation_sequence_number: continuation.map(String::from),
        }
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_record() {
        let record = TestUtils::create_test_record("seq-1", b"test-data");
        assert_eq!(record.sequence_number(), "seq-1");
        assert_eq!(record.data().as_ref(), b"test-data");
        assert_eq!(record.partition_key(), "test-partition-key");
    }

    #[test]
    fn test_create_subscription_event() {
        let event = TestUtils::create_subscription_event(&["100", "105"], Some("110"));
        assert_eq!(event.records.len(), 2);
        assert_eq!(event.records[1].sequence_number(), "105");
        assert_eq!(event.continuation_sequence_number.as_deref(), Some("110"));
    }
}
