#![allow(dead_code)]

pub mod mock_h2_server;

use std::time::Duration;

use mimic_h2::{RetryPolicy, Timeouts, Transport, TransportBuilder};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport that speaks prior-knowledge HTTP/2 to the mock server and
/// backs off in milliseconds rather than seconds.
pub fn test_transport() -> TransportBuilder {
    Transport::builder()
        .allow_http(true)
        .timeouts(Timeouts::new().connect(Duration::from_secs(5)))
        .retry_policy(RetryPolicy {
            max_retries: 6,
            backoff_unit: Duration::from_millis(10),
        })
}

/// Guard against hangs in async tests.
pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test timed out")
}
