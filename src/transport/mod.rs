//! The request-level transport: pooling, protocol selection and retries.
//!
//! - HTTPS origins that negotiate `h2` get a fingerprinted HTTP/2 connection
//! - Origins that negotiate `http/1.1` (or plain `http://` without prior
//!   knowledge) use the HTTP/1.1 path
//! - Requests that fail on a broken connection are replayed when their body
//!   can be sent again

pub mod connector;
pub mod h1;
pub mod h2;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fingerprint::http2::{LocalLimits, LocalSettings};
use crate::fingerprint::{FingerprintConfig, FingerprintProfile};
use crate::pool::{ConnectionPool, PoolKey, PoolStats};
use crate::request::Request;
use crate::response::Response;
use crate::timeouts::{with_timeout, Timeouts};

use connector::{BoringConnector, Dial};
use h1::H1Connection;
use h2::{handshake, ConnectionOptions, H2Handle, StreamSlot};

/// The single operation the transport exposes. Decorators (caching,
/// redirects, auth) wrap it.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, req: Request) -> Result<Response>;
}

/// Replay policy for requests that fail on a broken connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay; retry `n >= 2` waits `unit * 2^(n-2)` plus up to 10%.
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based). The first retry is
    /// immediate.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::ZERO;
        }
        let base = self
            .backoff_unit
            .saturating_mul(1u32.checked_shl(retry - 2).unwrap_or(u32::MAX));
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.1);
        base.saturating_add(base.mul_f64(jitter))
    }
}

/// A connection ready to carry one request.
enum Acquired {
    H2(H2Handle, StreamSlot),
    H1(H1Connection),
}

/// Builder for [`Transport`].
#[derive(Clone)]
pub struct TransportBuilder {
    fingerprint: FingerprintConfig,
    timeouts: Timeouts,
    allow_http: bool,
    strict_max_concurrent_streams: bool,
    disable_keep_alives: bool,
    dialer: Option<Arc<dyn Dial>>,
    root_certs: Vec<Vec<u8>>,
    retry: RetryPolicy,
    default_user_agent: Option<String>,
    limits: LocalLimits,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self {
            fingerprint: FingerprintConfig::new(),
            timeouts: Timeouts::transport_defaults(),
            allow_http: false,
            strict_max_concurrent_streams: false,
            disable_keep_alives: false,
            dialer: None,
            root_certs: Vec::new(),
            retry: RetryPolicy::default(),
            default_user_agent: None,
            limits: LocalLimits::default(),
        }
    }
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprint(mut self, config: FingerprintConfig) -> Self {
        self.fingerprint = config;
        self
    }

    /// Use a browser profile's fingerprint and User-Agent.
    pub fn profile(mut self, profile: FingerprintProfile) -> Self {
        self.fingerprint = profile.config();
        self.default_user_agent = Some(profile.user_agent().to_string());
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Speak HTTP/2 with prior knowledge to `http://` origins.
    pub fn allow_http(mut self, allow: bool) -> Self {
        self.allow_http = allow;
        self
    }

    /// Block for a free stream instead of dialing another connection when
    /// every connection to an origin is at its stream ceiling.
    pub fn strict_max_concurrent_streams(mut self, strict: bool) -> Self {
        self.strict_max_concurrent_streams = strict;
        self
    }

    /// One request per connection.
    pub fn disable_keep_alives(mut self, disable: bool) -> Self {
        self.disable_keep_alives = disable;
        self
    }

    /// Replace the TCP + TLS step.
    pub fn dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Extra trusted roots (DER or PEM) for the built-in dialer.
    pub fn root_certificates(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.root_certs = certs;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn default_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.default_user_agent = Some(user_agent.into());
        self
    }

    pub fn local_limits(mut self, limits: LocalLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Validate the fingerprint and build the transport. No connection is
    /// opened here.
    pub fn build(self) -> Result<Transport> {
        self.fingerprint.validate()?;
        LocalSettings::resolve(self.fingerprint.settings(), &self.limits)?;

        let dialer = match self.dialer {
            Some(dialer) => dialer,
            None => Arc::new(
                BoringConnector::new()
                    .with_tls(self.fingerprint.tls().cloned())
                    .with_root_certificates(self.root_certs)
                    .with_connect_timeout(self.timeouts.connect),
            ),
        };
        let pool = ConnectionPool::new(self.timeouts.idle_connection);

        Ok(Transport {
            inner: Arc::new(TransportInner {
                config: Arc::new(self.fingerprint),
                timeouts: self.timeouts,
                allow_http: self.allow_http,
                strict_max_concurrent_streams: self.strict_max_concurrent_streams,
                disable_keep_alives: self.disable_keep_alives,
                dialer,
                retry: self.retry,
                default_user_agent: self
                    .default_user_agent
                    .unwrap_or_else(|| h2::DEFAULT_USER_AGENT.to_string()),
                limits: self.limits,
                pool,
            }),
        })
    }
}

struct TransportInner {
    config: Arc<FingerprintConfig>,
    timeouts: Timeouts,
    allow_http: bool,
    strict_max_concurrent_streams: bool,
    disable_keep_alives: bool,
    dialer: Arc<dyn Dial>,
    retry: RetryPolicy,
    default_user_agent: String,
    limits: LocalLimits,
    pool: ConnectionPool,
}

/// Fingerprinted HTTP client transport. Cheap to clone; clones share the
/// connection pool.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("fingerprint", &self.inner.config.akamai_string())
            .field("timeouts", &self.inner.timeouts)
            .field("allow_http", &self.inner.allow_http)
            .field(
                "strict_max_concurrent_streams",
                &self.inner.strict_max_concurrent_streams,
            )
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RoundTrip for Transport {
    async fn round_trip(&self, req: Request) -> Result<Response> {
        Transport::round_trip(self, req).await
    }
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    pub fn fingerprint(&self) -> &FingerprintConfig {
        &self.inner.config
    }

    /// Send a request, replaying it on connection failures when the body
    /// allows. The total timeout covers every attempt and backoff.
    pub async fn round_trip(&self, req: Request) -> Result<Response> {
        with_timeout(
            self.inner.timeouts.total,
            Error::DeadlineExceeded,
            self.round_trip_with_retries(req),
        )
        .await
    }

    async fn round_trip_with_retries(&self, mut req: Request) -> Result<Response> {
        match req.url().scheme() {
            "http" | "https" => {}
            other => return Err(Error::encoding(format!("unsupported scheme: {}", other))),
        }
        let cancel = req.cancel_token().clone();
        let policy = self.inner.retry;
        let mut retry = 0;
        loop {
            let replay = req.try_clone();
            let err = match self.attempt(req).await {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };
            if !err.is_retryable() || retry >= policy.max_retries {
                return Err(err);
            }
            let Some(next) = replay else {
                tracing::debug!(error = %err, "request body cannot be replayed, not retrying");
                return Err(err);
            };
            retry += 1;
            let delay = policy.backoff(retry);
            tracing::debug!(error = %err, retry, ?delay, "retrying request");
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Canceled),
                    _ = sleep(delay) => {}
                }
            }
            req = next;
        }
    }

    async fn attempt(&self, mut req: Request) -> Result<Response> {
        let cancel = req.cancel_token().clone();
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let key = PoolKey::from_url(req.url())?;

        let acquired = match self.inner.pool.get_h1(&key).await {
            Some(conn) => Acquired::H1(conn),
            None => self.acquire(&key, &req, &cancel).await?,
        };
        match acquired {
            Acquired::H2(handle, slot) => handle.send_request_with_slot(slot, req).await,
            Acquired::H1(mut conn) => {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(Error::Canceled),
                    result = conn.send_request(&mut req, &self.inner.default_user_agent) => result,
                };
                if result.is_ok() && conn.is_reusable() && !self.inner.disable_keep_alives {
                    self.inner.pool.put_h1(key, conn).await;
                }
                result
            }
        }
    }

    /// Find or open a connection for `key`.
    async fn acquire(
        &self,
        key: &PoolKey,
        req: &Request,
        cancel: &CancellationToken,
    ) -> Result<Acquired> {
        let pool = &self.inner.pool;
        let strict = self.inner.strict_max_concurrent_streams;
        let acquire_timeout = self.inner.timeouts.pool_acquire;
        let deadline = acquire_timeout.map(|d| Instant::now() + d);

        loop {
            let notify = pool.notify();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((handle, slot)) = pool.try_reserve_h2(key).await {
                return Ok(Acquired::H2(handle, slot));
            }
            if strict && pool.has_open_h2(key).await {
                tracing::debug!(%key, "all streams busy, waiting for a free slot");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Canceled),
                    _ = &mut notified => {}
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        return Err(Error::PoolAcquireTimeout(acquire_timeout.unwrap_or_default()));
                    }
                }
                continue;
            }

            if pool.is_h1_origin(key) {
                return self.dial(key, req, cancel).await;
            }
            let lock = pool.dial_lock(key);
            let outcome = self.dial_serialized(key, req, cancel, &lock, strict).await;
            pool.release_dial_lock(key, lock);
            match outcome {
                Some(result) => return result,
                None => continue,
            }
        }
    }

    /// Dial under the origin's dial lock. `None` means a connection opened
    /// while waiting and the caller should go back to waiting for a slot.
    async fn dial_serialized(
        &self,
        key: &PoolKey,
        req: &Request,
        cancel: &CancellationToken,
        lock: &tokio::sync::Mutex<()>,
        strict: bool,
    ) -> Option<Result<Acquired>> {
        let pool = &self.inner.pool;
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Some(Err(Error::Canceled)),
            guard = lock.lock() => guard,
        };
        // Another request may have dialed while we waited.
        if let Some((handle, slot)) = pool.try_reserve_h2(key).await {
            return Some(Ok(Acquired::H2(handle, slot)));
        }
        if strict && pool.has_open_h2(key).await {
            return None;
        }
        Some(self.dial(key, req, cancel).await)
    }

    async fn dial(
        &self,
        key: &PoolKey,
        req: &Request,
        cancel: &CancellationToken,
    ) -> Result<Acquired> {
        tracing::debug!(%key, "dialing");
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Canceled),
            stream = self.inner.dialer.dial(req.url()) => stream.map_err(|e| match e {
                // A failed dial says nothing about whether the request is safe to replay.
                Error::Io(e) => Error::connection(e.to_string()),
                other => other,
            })?,
        };

        let use_h2 = if key.is_https() {
            stream.alpn_protocol().is_h2()
        } else {
            self.inner.allow_http
        };
        if !use_h2 {
            tracing::debug!(%key, "using HTTP/1.1");
            self.inner.pool.mark_h1_origin(key);
            return Ok(Acquired::H1(
                H1Connection::new(stream).with_write_timeout(self.inner.timeouts.write),
            ));
        }

        self.inner.pool.forget_h1_origin(key);

        let mut options = ConnectionOptions::new(key.authority());
        options.allow_http = !key.is_https();
        options.single_use = self.inner.disable_keep_alives;
        options.limits = self.inner.limits.clone();
        options.timeouts = self.inner.timeouts.clone();
        options.default_user_agent = self.inner.default_user_agent.clone();
        options.notify = self.inner.pool.notify();

        let handle = handshake(stream, self.inner.config.clone(), options).await?;
        let slot = handle.try_reserve().ok_or(Error::ConnectionUnusable)?;
        self.inner.pool.insert_h2(key.clone(), handle.clone()).await;
        Ok(Acquired::H2(handle, slot))
    }

    /// Close every pooled connection that has no request in flight.
    pub async fn close_idle_connections(&self) {
        self.inner.pool.close_idle_connections().await;
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats().await
    }
}
