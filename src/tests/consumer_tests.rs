use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::consumer::{ConsumerConfig, KinesisConsumer, ReaderMode};
use crate::error::ConsumerError;
use crate::store::{InMemoryLeaseStore, LeaseStore, ShardLease};
use crate::test::mocks::{MockKinesisClient, MockRecordHandler};
use crate::test::TestUtils;

fn test_config(mode: ReaderMode) -> ConsumerConfig {
    ConsumerConfig {
        stream_name: "test-stream".to_string(),
        consumer_group: Some("test-app".to_string()),
        mode,
        consumer_name: match mode {
            ReaderMode::Push => Some("analytics".to_string()),
            ReaderMode::Pull => None,
        },
        lock_duration: Duration::from_secs(2),
        read_interval: Duration::from_millis(10),
        channel_capacity: 100,
        pull_limit: None,
        reader_sleep_time: Some(Duration::from_millis(10)),
    }
}

async fn wait_for_count(handler: &MockRecordHandler, count: usize, timeout: Duration) {
    let start = std::time::Instant::now();
    while handler.processed_count().await < count {
        assert!(
            start.elapsed() < timeout,
            "Timed out waiting for {} records (have {})",
            count,
            handler.processed_count().await
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_pull_flow_delivers_and_checkpoints() {
    let client = MockKinesisClient::new();
    let handler = MockRecordHandler::new();
    let store = InMemoryLeaseStore::new();

    client
        .mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")]))
        .await;
    client
        .mock_get_records(Ok((
            TestUtils::create_test_records(3),
            Some("iterator-2".to_string()),
        )))
        .await;

    let (mut consumer, _errors) = KinesisConsumer::new(
        test_config(ReaderMode::Pull),
        handler.clone(),
        client.clone(),
        store.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    wait_for_count(&handler, 3, Duration::from_secs(5)).await;

    let processed = handler.processed_records().await;
    let sequences: Vec<&str> = processed.iter().map(|(_, seq)| seq.as_str()).collect();
    assert_eq!(sequences, ["sequence-0", "sequence-1", "sequence-2"]);
    assert!(processed.iter().all(|(shard, _)| shard == "shard-1"));

    // Every delivery was checkpointed; the store holds the last sequence.
    let leases = store.get_leases("test-app", "test-stream").await.unwrap();
    assert_eq!(leases["shard-1"].checkpoint.as_deref(), Some("sequence-2"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer should stop after shutdown")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_shard_held_by_live_consumer_is_skipped() {
    let client = MockKinesisClient::new();
    let handler = MockRecordHandler::new();
    let store = InMemoryLeaseStore::new();

    let holder_expiry = Utc::now() + chrono::Duration::seconds(60);
    store
        .insert_lease(
            "test-app",
            "test-stream",
            "shard-1",
            ShardLease {
                consumer_id: "other-consumer".to_string(),
                expires_at: holder_expiry,
                heartbeat: Utc::now(),
                checkpoint: None,
            },
        )
        .await;

    client
        .mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")]))
        .await;
    client
        .mock_get_records(Ok((
            TestUtils::create_test_records(2),
            Some("iterator-2".to_string()),
        )))
        .await;

    let (mut consumer, _errors) = KinesisConsumer::new(
        test_config(ReaderMode::Pull),
        handler.clone(),
        client.clone(),
        store.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(500)).await;

    // No reader was started: nothing processed, no iterator resolved, and the
    // holder's entry is untouched.
    assert_eq!(handler.processed_count().await, 0);
    assert!(client.iterator_requests().await.is_empty());
    let leases = store.get_leases("test-app", "test-stream").await.unwrap();
    assert_eq!(leases["shard-1"].consumer_id, "other-consumer");
    assert_eq!(leases["shard-1"].expires_at, holder_expiry);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_push_flow_registers_consumer_and_checkpoints() {
    let client = MockKinesisClient::new();
    let handler = MockRecordHandler::new();
    let store = InMemoryLeaseStore::new();

    client
        .mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")]))
        .await;
    client
        .mock_subscription(Ok(vec![
            Ok(TestUtils::create_subscription_event(&["100"], Some("100"))),
            Ok(TestUtils::create_subscription_event(&["105"], Some("105"))),
        ]))
        .await;

    let (mut consumer, _errors) = KinesisConsumer::new(
        test_config(ReaderMode::Push),
        handler.clone(),
        client.clone(),
        store.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    wait_for_count(&handler, 2, Duration::from_secs(5)).await;

    // The consumer was registered on bootstrap (describe found nothing).
    assert_eq!(client.register_consumer_calls().await, ["analytics"]);

    let leases = store.get_leases("test-app", "test-stream").await.unwrap();
    assert_eq!(leases["shard-1"].checkpoint.as_deref(), Some("105"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_checkpoint_failure_recycles_reader_from_stored_checkpoint() {
    let client = MockKinesisClient::new();
    let handler = MockRecordHandler::new();
    let store = InMemoryLeaseStore::new();

    // An expired holder left a checkpoint that sorts after every incoming
    // sequence, so the first checkpoint write is superseded.
    store
        .insert_lease(
            "test-app",
            "test-stream",
            "shard-1",
            ShardLease {
                consumer_id: "departed-consumer".to_string(),
                expires_at: Utc::now() - chrono::Duration::seconds(5),
                heartbeat: Utc::now() - chrono::Duration::minutes(1),
                checkpoint: Some("zzz-very-high-sequence".to_string()),
            },
        )
        .await;

    client
        .mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")]))
        .await;
    client
        .mock_get_records(Ok((
            vec![TestUtils::create_test_record("sequence-0", b"dup")],
            Some("iterator-2".to_string()),
        )))
        .await;

    let (mut consumer, _errors) = KinesisConsumer::new(
        test_config(ReaderMode::Pull),
        handler.clone(),
        client.clone(),
        store.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    // The record is still delivered (at-least-once) even though its
    // checkpoint loses.
    wait_for_count(&handler, 1, Duration::from_secs(5)).await;

    // The offending reader is stopped and respawned on a later cycle,
    // resuming from the stored checkpoint.
    let start = std::time::Instant::now();
    loop {
        let requests = client.iterator_requests().await;
        if requests.len() >= 2 {
            assert_eq!(
                requests[1],
                crate::client::IteratorSpec::AfterSequenceNumber(
                    "zzz-very-high-sequence".to_string()
                )
            );
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "reader was not respawned"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The winning checkpoint never regressed.
    let leases = store.get_leases("test-app", "test-stream").await.unwrap();
    assert_eq!(
        leases["shard-1"].checkpoint.as_deref(),
        Some("zzz-very-high-sequence")
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_handler_failure_is_fatal() {
    let client = MockKinesisClient::new();
    let handler = MockRecordHandler::new();
    let store = InMemoryLeaseStore::new();

    handler.fail_on_sequence("sequence-0").await;

    client
        .mock_list_shards(Ok(vec![TestUtils::create_test_shard("shard-1")]))
        .await;
    client
        .mock_get_records(Ok((
            TestUtils::create_test_records(1),
            Some("iterator-2".to_string()),
        )))
        .await;

    let (mut consumer, _errors) = KinesisConsumer::new(
        test_config(ReaderMode::Pull),
        handler.clone(),
        client,
        store,
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), consumer.run(shutdown_rx))
        .await
        .expect("run should return after the handler fails");

    assert!(matches!(result, Err(ConsumerError::Handler(_))));
}

#[tokio::test]
async fn test_push_mode_without_consumer_name_is_rejected() {
    let client = MockKinesisClient::new();
    let handler = MockRecordHandler::new();
    let store = InMemoryLeaseStore::new();

    let mut config = test_config(ReaderMode::Push);
    config.consumer_name = None;

    let (mut consumer, _errors) = KinesisConsumer::new(config, handler, client, store);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = consumer.run(shutdown_rx).await;
    assert!(matches!(result, Err(ConsumerError::MissingConsumerName)));
}

#[tokio::test]
async fn test_shutdown_stops_idle_consumer_promptly() {
    let client = MockKinesisClient::new();
    let handler = MockRecordHandler::new();
    let store = InMemoryLeaseStore::new();

    let (mut consumer, _errors) = KinesisConsumer::new(
        test_config(ReaderMode::Pull),
        handler,
        client,
        store,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).unwrap();

    // Bounded-time shutdown with no readers to wait on.
    tokio::time::timeout(Duration::from_secs(3), task)
        .await
        .expect("idle consumer should stop promptly")
        .unwrap()
        .unwrap();
}
