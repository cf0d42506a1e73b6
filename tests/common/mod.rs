use std::sync::Once;
use std::time::Duration;

use kinesis_flock::store::InMemoryLeaseStore;
use kinesis_flock::test::mocks::{MockKinesisClient, MockRecordHandler};
use kinesis_flock::{ConsumerConfig, ReaderMode};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("kinesis_flock=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

pub fn create_test_config(mode: ReaderMode) -> ConsumerConfig {
    ConsumerConfig {
        stream_name: "test-stream".to_string(),
        consumer_group: Some("integration-app".to_string()),
        mode,
        consumer_name: match mode {
            ReaderMode::Push => Some("integration-consumer".to_string()),
            ReaderMode::Pull => None,
        },
        lock_duration: Duration::from_secs(2),
        read_interval: Duration::from_millis(10),
        channel_capacity: 100,
        pull_limit: None,
        reader_sleep_time: Some(Duration::from_millis(10)),
    }
}

pub struct TestContext {
    pub config: ConsumerConfig,
    pub client: MockKinesisClient,
    pub handler: MockRecordHandler,
    pub store: InMemoryLeaseStore,
}

impl TestContext {
    pub fn new(mode: ReaderMode) -> Self {
        init_logging();
        Self {
            config: create_test_config(mode),
            client: MockKinesisClient::new(),
            handler: MockRecordHandler::new(),
            store: InMemoryLeaseStore::new(),
        }
    }
}

/// Wait until the handler has seen `expected` records.
pub async fn verify_processing_complete(
    handler: &MockRecordHandler,
    expected: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    let start = std::time::Instant::now();
    while handler.processed_count().await < expected {
        if start.elapsed() > timeout {
            anyhow::bail!(
                "Processed {} of {} records within {:?}",
                handler.processed_count().await,
                expected,
                timeout
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
