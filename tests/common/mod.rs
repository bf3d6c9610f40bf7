//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use rea_ledger::{Address, LedgerStore, PartitionRef, RecordId, RetryConfig};

pub const UNIT: &str = "urn:unit:kg";
pub const APPLE: &str = "http://www.productontology.org/doc/Apple.ttl";
pub const SPREADER: &str = "http://www.productontology.org/doc/Manure_spreader.ttl";

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it returns `true` or `timeout` elapses.
///
/// Returns the last result. Only tests wait for convergence; the library
/// never does.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Retry settings that converge within a test's patience.
pub fn fast_retries() -> RetryConfig {
    RetryConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_attempts: None,
        poll_interval: Duration::from_millis(10),
    }
}

/// In-memory store without the background worker; tests flush by hand.
pub async fn manual_store() -> LedgerStore {
    init_tracing();
    LedgerStore::builder()
        .call_timeout(Duration::from_millis(200))
        .spawn_retry_worker(false)
        .open()
        .await
        .expect("store should open")
}

pub fn observation(id: &RecordId) -> Address {
    Address::new(PartitionRef::OBSERVATION, id.clone())
}

pub fn planning(id: &RecordId) -> Address {
    Address::new(PartitionRef::PLANNING, id.clone())
}

pub fn specification(id: &RecordId) -> Address {
    Address::new(PartitionRef::SPECIFICATION, id.clone())
}
