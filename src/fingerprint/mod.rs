//! TLS and HTTP/2 fingerprinting configuration.

pub mod config;
pub mod http2;
pub mod profiles;
pub mod tls;

pub use config::FingerprintConfig;
pub use http2::{LocalLimits, PriorityParam, PseudoHeader, Setting, SettingId};
pub use profiles::FingerprintProfile;
pub use tls::{CertCompression, TlsFingerprint};
