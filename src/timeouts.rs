//! Timeout configuration for the transport.
//!
//! # Timeout Types
//!
//! - **connect**: TCP + TLS handshake
//! - **idle_connection**: how long a connection with no open streams is kept
//! - **read_idle**: silence on a connection before a health-check PING is sent
//! - **ping**: how long that PING may go unanswered before the connection is closed
//! - **write**: a single socket write (frames are flushed as one batch)
//! - **pool_acquire**: time waiting for a stream slot when the stream ceiling is strict
//! - **total**: absolute deadline for one `round_trip`, retries included
//!
//! # Usage
//!
//! ```rust
//! use mimic_h2::Timeouts;
//! use std::time::Duration;
//!
//! let timeouts = Timeouts::transport_defaults()
//!     .read_idle(Duration::from_secs(30))
//!     .no_total_timeout();
//! assert_eq!(timeouts.ping_timeout(), Duration::from_secs(15));
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Applied to health-check PINGs when no explicit ping timeout is configured.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout configuration.
///
/// All timeouts are optional. When `None`, no timeout is applied for that phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for dialing and the TLS handshake. Does not reset.
    pub connect: Option<Duration>,

    /// A connection with no open streams is closed after this long.
    pub idle_connection: Option<Duration>,

    /// If nothing is read from a connection for this long, send a PING.
    /// `None` disables health checks.
    pub read_idle: Option<Duration>,

    /// How long a health-check PING may stay unacknowledged.
    ///
    /// Default: 15s once `read_idle` is set.
    pub ping: Option<Duration>,

    /// Deadline for one batched socket write.
    pub write: Option<Duration>,

    /// Time waiting for a stream slot with strict max concurrent streams.
    pub pool_acquire: Option<Duration>,

    /// Absolute deadline for a whole `round_trip`, retries and backoff included.
    pub total: Option<Duration>,
}

impl Timeouts {
    /// Create a new Timeouts with all timeouts set to None.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for a long-lived crawler transport.
    ///
    /// - connect: 10s
    /// - idle_connection: 90s
    /// - read_idle: None (no health checks)
    /// - write: 30s
    /// - pool_acquire: 30s
    /// - total: None
    pub fn transport_defaults() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            idle_connection: Some(Duration::from_secs(90)),
            read_idle: None,
            ping: None,
            write: Some(Duration::from_secs(30)),
            pool_acquire: Some(Duration::from_secs(30)),
            total: None,
        }
    }

    /// Set connect timeout.
    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    /// Set idle connection timeout.
    pub fn idle_connection(mut self, timeout: Duration) -> Self {
        self.idle_connection = Some(timeout);
        self
    }

    /// Enable health checks after `timeout` of read silence.
    pub fn read_idle(mut self, timeout: Duration) -> Self {
        self.read_idle = Some(timeout);
        self
    }

    /// Set the health-check PING timeout.
    pub fn ping(mut self, timeout: Duration) -> Self {
        self.ping = Some(timeout);
        self
    }

    /// Set write timeout.
    pub fn write(mut self, timeout: Duration) -> Self {
        self.write = Some(timeout);
        self
    }

    /// Set pool acquire timeout.
    pub fn pool_acquire(mut self, timeout: Duration) -> Self {
        self.pool_acquire = Some(timeout);
        self
    }

    /// Set total request timeout.
    pub fn total(mut self, timeout: Duration) -> Self {
        self.total = Some(timeout);
        self
    }

    /// Disable connect timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect = None;
        self
    }

    /// Keep idle connections until the peer closes them.
    pub fn no_idle_connection_timeout(mut self) -> Self {
        self.idle_connection = None;
        self
    }

    /// Disable health-check PINGs.
    pub fn no_read_idle_timeout(mut self) -> Self {
        self.read_idle = None;
        self
    }

    /// Disable write timeout.
    pub fn no_write_timeout(mut self) -> Self {
        self.write = None;
        self
    }

    /// Disable pool acquire timeout.
    pub fn no_pool_acquire_timeout(mut self) -> Self {
        self.pool_acquire = None;
        self
    }

    /// Disable total timeout.
    pub fn no_total_timeout(mut self) -> Self {
        self.total = None;
        self
    }

    /// Ping timeout in effect for health checks.
    pub fn ping_timeout(&self) -> Duration {
        self.ping.unwrap_or(DEFAULT_PING_TIMEOUT)
    }
}

/// Run `fut` under an optional deadline, mapping expiry through `on_timeout`.
pub(crate) async fn with_timeout<T, F>(
    timeout: Option<Duration>,
    on_timeout: impl FnOnce(Duration) -> Error,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(limit)),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_defaults() {
        let t = Timeouts::transport_defaults();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.idle_connection, Some(Duration::from_secs(90)));
        assert_eq!(t.read_idle, None);
        assert_eq!(t.total, None);
    }

    #[test]
    fn test_builder_pattern() {
        let t = Timeouts::new()
            .connect(Duration::from_secs(5))
            .read_idle(Duration::from_secs(60))
            .ping(Duration::from_secs(3));

        assert_eq!(t.connect, Some(Duration::from_secs(5)));
        assert_eq!(t.read_idle, Some(Duration::from_secs(60)));
        assert_eq!(t.ping_timeout(), Duration::from_secs(3));
        assert_eq!(t.total, None);
    }

    #[test]
    fn test_ping_timeout_default() {
        assert_eq!(Timeouts::new().ping_timeout(), DEFAULT_PING_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_expiry() {
        let result: Result<()> = with_timeout(
            Some(Duration::from_millis(10)),
            Error::ConnectTimeout,
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(Error::ConnectTimeout(_))));
    }
}
