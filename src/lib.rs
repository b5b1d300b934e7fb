//! # mimic-h2
//!
//! HTTP/2 client transport with full TLS/HTTP2 fingerprint control.
//!
//! A [`Transport`] reproduces a chosen client fingerprint at the byte level:
//! the TLS ClientHello (via BoringSSL), the SETTINGS frame, the connection
//! WINDOW_UPDATE, PRIORITY frames, and pseudo-header and header order in every
//! HEADERS block. Origins that do not negotiate `h2` fall back to HTTP/1.1.
//!
//! ```no_run
//! use mimic_h2::{FingerprintProfile, Request, Transport};
//!
//! # async fn run() -> mimic_h2::Result<()> {
//! let transport = Transport::builder()
//!     .profile(FingerprintProfile::Chrome131)
//!     .build()?;
//! let resp = transport.round_trip(Request::get("https://example.com/")?).await?;
//! println!("{} {}", resp.status, resp.text());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod fingerprint;
pub mod pool;
pub mod request;
pub mod response;
pub mod timeouts;
pub mod transport;

// Re-exports
pub use cache::{cache_key, KeyValueStore, MemoryStore};
pub use error::{Error, Result};
pub use fingerprint::{
    CertCompression, FingerprintConfig, FingerprintProfile, LocalLimits, PriorityParam,
    PseudoHeader, Setting, SettingId, TlsFingerprint,
};
pub use request::{Body, Request};
pub use response::Response;
pub use timeouts::Timeouts;
pub use transport::connector::{AlpnProtocol, BoringConnector, Dial, HttpStream};
pub use transport::h2::{ErrorCode, H2Handle};
pub use transport::{RetryPolicy, RoundTrip, Transport, TransportBuilder};
pub use tokio_util::sync::CancellationToken;
