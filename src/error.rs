//! Error types for mimic-h2.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::fingerprint::http2::Setting;
use crate::transport::h2::frame::ErrorCode;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while sending a request.
///
/// The enum is `Clone` so a connection's terminal error can be handed to every
/// stream that was in flight when it died.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Request could not be encoded (malformed URI, header name or value).
    /// Never reaches the wire.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Encoded request headers exceed the peer's SETTINGS_MAX_HEADER_LIST_SIZE.
    #[error("Request header list is {size} bytes, peer limit is {limit}")]
    HeaderListTooLarge { size: u64, limit: u64 },

    /// A SETTINGS value is out of range.
    #[error("Invalid setting {setting}: {code}")]
    InvalidSetting { setting: Setting, code: ErrorCode },

    /// Flow-control window overflow or underflow. Fatal to the connection.
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Stream was reset, either by the peer or locally.
    #[error("Stream {stream_id} reset ({code}){}", if *.remote { " by peer" } else { "" })]
    StreamReset {
        stream_id: u32,
        code: ErrorCode,
        remote: bool,
    },

    /// Peer sent GOAWAY and this stream was not processed.
    #[error("GOAWAY received (last stream {last_stream_id}, {code}): {debug}")]
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: String,
    },

    /// HTTP/2 protocol violation.
    #[error("HTTP/2 protocol error ({code}): {message}")]
    Protocol { code: ErrorCode, message: String },

    /// HTTP/1.1 protocol error on a downgraded connection.
    #[error("HTTP/1.1 protocol error: {0}")]
    Http1(String),

    /// Connection was closed while the request was in flight.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Connection was chosen but can no longer open streams.
    #[error("Connection cannot accept new streams")]
    ConnectionUnusable,

    /// Dial or connection setup error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connect timeout (TCP + TLS handshake).
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// Health-check PING was not acknowledged in time.
    #[error("PING not acknowledged within {0:?}")]
    PingTimeout(Duration),

    /// Pool acquire timeout (strict stream ceiling reached on every connection).
    #[error("Pool acquire timeout after {0:?} - no stream slot available")]
    PoolAcquireTimeout(Duration),

    /// Request was canceled by the caller.
    #[error("Request canceled")]
    Canceled,

    /// Total request deadline exceeded.
    #[error("Request deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Key/value store error.
    #[error("Store error: {0}")]
    Store(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl Error {
    /// Create an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding(message.into())
    }

    /// Create a connection-level protocol error.
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Create a flow control error.
    pub fn flow_control(message: impl Into<String>) -> Self {
        Self::FlowControl(message.into())
    }

    /// Create a connection-closed error.
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Self::ConnectionClosed(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an HTTP/1.1 protocol error.
    pub fn http1(message: impl Into<String>) -> Self {
        Self::Http1(message.into())
    }

    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create an IO error with custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::from(io::Error::other(message.into()))
    }

    /// The HTTP/2 error code to put on the wire when this error tears down a
    /// connection or stream.
    pub fn h2_code(&self) -> ErrorCode {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::InvalidSetting { code, .. } => *code,
            Self::StreamReset { code, .. } => *code,
            Self::FlowControl(_) => ErrorCode::FlowControlError,
            Self::Canceled | Self::DeadlineExceeded(_) => ErrorCode::Cancel,
            _ => ErrorCode::InternalError,
        }
    }

    /// Whether the transport may transparently replay the request.
    ///
    /// Covers failures of the connection itself (socket errors, GOAWAY, a
    /// connection that closed or became unusable) and streams the peer refused
    /// before processing them. Encoding, setting, cancellation and dial errors
    /// are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::GoAway { .. }
            | Self::ConnectionClosed(_)
            | Self::ConnectionUnusable
            | Self::PingTimeout(_) => true,
            Self::StreamReset {
                code, remote: true, ..
            } => matches!(code, ErrorCode::RefusedStream | ErrorCode::ProtocolError),
            _ => false,
        }
    }

    /// Whether this error came from the caller's cancellation or deadline.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded(_))
    }

    /// Whether this is a local encoding failure that never touched the wire.
    pub fn is_encoding(&self) -> bool {
        matches!(self, Self::Encoding(_) | Self::HeaderListTooLarge { .. })
    }
}
