//! HTTP/2 client engine with full fingerprint control.
//!
//! This module controls everything a passive observer can use to tell one
//! HTTP/2 client from another:
//! - **SETTINGS**: values and their order, GREASE ids included
//! - **WINDOW_UPDATE**: the connection-level increment sent after SETTINGS
//! - **PRIORITY**: frames sent right after the preface
//! - **Pseudo-header and header order** in every HEADERS block
//!
//! ## Akamai HTTP/2 Fingerprint Format
//!
//! `settings|window_update|priority|pseudo_headers`, for example Chrome 131:
//! `1:65536;2:0;4:6291456;6:262144|15663105|0|m,a,s,p`
//!
//! ## Structure
//!
//! [`handshake`] writes the preface and spawns a driver task that owns the
//! socket. Requests go through an [`H2Handle`], which only exchanges messages
//! with the driver.

mod connection;
mod driver;
pub mod flow;
pub mod frame;
mod handle;
pub mod headers;
pub mod hpack;
mod stream;

pub use connection::{handshake, preface_bytes, ConnectionOptions, PeerSettings, MAX_STREAM_ID};
pub use driver::DEFAULT_MAX_CONCURRENT_STREAMS;
pub use frame::{ErrorCode, CONNECTION_PREFACE};
pub use handle::{H2Handle, StreamSlot};
pub use headers::{request_fields, RequestHead, DEFAULT_USER_AGENT};
pub use stream::{BodyEvent, StreamState};
