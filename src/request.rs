//! Owned request value accepted by [`RoundTrip`](crate::transport::RoundTrip).

use bytes::Bytes;
use http::Method;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;

/// Request body.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Fully buffered; replayable on retry.
    Full(Bytes),
    /// Chunks pulled from a channel until it closes. Never replayed.
    Stream(mpsc::Receiver<Bytes>),
}

impl Body {
    /// Body for a streaming upload plus the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<Bytes>, Body) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Body::Stream(rx))
    }

    /// Whether a retry can send the same bytes again.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(bytes) => bytes.is_empty(),
            Body::Stream(_) => false,
        }
    }

    fn try_clone(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Full(bytes) => Some(Body::Full(bytes.clone())),
            Body::Stream(_) => None,
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Full(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Full(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Full(Bytes::from_static(s.as_bytes()))
    }
}

/// An outbound request.
///
/// Headers keep insertion order and repeated names; the wire order is decided
/// by the connection's fingerprint, not by this list.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
    body: Body,
    trailers: Vec<(String, String)>,
    host: Option<String>,
    content_length: Option<u64>,
    cancel: CancellationToken,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: Body::Empty,
            trailers: Vec::new(),
            host: None,
            content_length: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn get(url: &str) -> Result<Self> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    pub fn post(url: &str, body: impl Into<Body>) -> Result<Self> {
        Ok(Self::new(Method::POST, Url::parse(url)?).with_body(body))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Declare a trailer sent after the body.
    pub fn with_trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.push((name.into(), value.into()));
        self
    }

    /// Override `:authority` (and the HTTP/1.1 Host line).
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Declared length for a streaming body.
    pub fn with_content_length(mut self, len: u64) -> Self {
        self.content_length = Some(len);
        self
    }

    /// Tie the request to a cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn trailers(&self) -> &[(String, String)] {
        &self.trailers
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `:authority` value: the host override, else the URL's host[:port].
    pub fn authority(&self) -> String {
        if let Some(host) = &self.host {
            return host.clone();
        }
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Path plus query, or `*` for an asterisk-form OPTIONS.
    pub fn path(&self) -> String {
        let mut path = self.url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }
        path
    }

    /// Body length if known: zero for no body, the declared length for streams.
    pub fn content_length(&self) -> Option<u64> {
        match &self.body {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => self.content_length,
        }
    }

    /// Copy for a retry attempt, sharing the cancellation token. `None` when
    /// the body cannot be replayed.
    pub fn try_clone(&self) -> Option<Request> {
        Some(Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            trailers: self.trailers.clone(),
            host: self.host.clone(),
            content_length: self.content_length,
            cancel: self.cancel.clone(),
        })
    }

    pub(crate) fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }
}
