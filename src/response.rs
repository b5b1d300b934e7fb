//! HTTP response returned by the transport.
//!
//! Bodies are delivered exactly as received; content decoding is left to
//! wrapping layers.

use bytes::Bytes;
use http::Version;

/// A fully received response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Header fields in wire order, names lowercase for HTTP/2.
    pub headers: Vec<(String, String)>,
    body: Bytes,
    trailers: Vec<(String, String)>,
    version: Version,
    pub effective_url: Option<String>,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes, version: Version) -> Self {
        Self {
            status,
            headers,
            body,
            trailers: Vec::new(),
            version,
            effective_url: None,
        }
    }

    pub fn with_trailers(mut self, trailers: Vec<(String, String)>) -> Self {
        self.trailers = trailers;
        self
    }

    /// Set the URL that was actually requested.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.effective_url = Some(url.into());
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn trailers(&self) -> &[(String, String)] {
        &self.trailers
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a header, in order.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
