//! HTTP/1.1 path for origins that do not negotiate `h2`.
//!
//! Uses httparse for response parsing and raw I/O for full control over
//! request formatting and header order. Connections whose response framing
//! allows it are handed back for keep-alive reuse.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::{Method, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::request::{Body, Request};
use crate::response::Response;
use crate::timeouts::with_timeout;
use crate::transport::connector::HttpStream;

/// Maximum response header size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Largest response body buffered in memory (256MB).
const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Longest chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 4096;

/// HTTP/1.1 connection for sending requests one at a time.
pub struct H1Connection {
    stream: Box<dyn HttpStream>,
    read_buf: BytesMut,
    /// Whether the connection must be closed after the current response.
    should_close: bool,
    write_timeout: Option<Duration>,
}

impl std::fmt::Debug for H1Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H1Connection")
            .field("buffered", &self.read_buf.len())
            .field("should_close", &self.should_close)
            .finish()
    }
}

impl H1Connection {
    pub fn new(stream: Box<dyn HttpStream>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            should_close: false,
            write_timeout: None,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Whether the connection can carry another request.
    pub fn is_reusable(&self) -> bool {
        !self.should_close
    }

    /// Send a request and read the full response.
    ///
    /// A streaming body is sent with chunked transfer coding unless the
    /// request declares a content length.
    pub async fn send_request(
        &mut self,
        req: &mut Request,
        default_user_agent: &str,
    ) -> Result<Response> {
        let body = req.take_body();
        let chunked = matches!(body, Body::Stream(_)) && req.content_length().is_none();
        let head = build_request(req, default_user_agent, &body, chunked)?;

        let stream = &mut self.stream;
        with_timeout(
            self.write_timeout,
            |limit| Error::io(format!("HTTP/1.1 write timed out after {:?}", limit)),
            async move {
                stream.write_all(&head).await?;
                match body {
                    Body::Empty => {}
                    Body::Full(bytes) => stream.write_all(&bytes).await?,
                    Body::Stream(mut rx) => {
                        while let Some(chunk) = rx.recv().await {
                            if chunk.is_empty() {
                                continue;
                            }
                            if chunked {
                                stream
                                    .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                                    .await?;
                                stream.write_all(&chunk).await?;
                                stream.write_all(b"\r\n").await?;
                            } else {
                                stream.write_all(&chunk).await?;
                            }
                        }
                        if chunked {
                            stream.write_all(b"0\r\n\r\n").await?;
                        }
                    }
                }
                stream.flush().await?;
                Ok(())
            },
        )
        .await?;

        let response = self.read_response(req.method()).await?;
        Ok(response.with_url(req.url().as_str()))
    }

    /// Read responses until a final (non-1xx) one arrives.
    async fn read_response(&mut self, method: &Method) -> Result<Response> {
        loop {
            let (status, headers) = self.read_head().await?;
            if (100..200).contains(&status) {
                continue;
            }
            let body = self.read_body(status, &headers, method).await?;
            if header_value(&headers, "connection")
                .map(|v| v.to_ascii_lowercase().contains("close"))
                .unwrap_or(false)
            {
                self.should_close = true;
            }
            return Ok(Response::new(status, headers, body, Version::HTTP_11));
        }
    }

    async fn read_head(&mut self) -> Result<(u16, Vec<(String, String)>)> {
        loop {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
            let mut parsed = httparse::Response::new(&mut slots);
            match parsed
                .parse(&self.read_buf)
                .map_err(|e| Error::http1(format!("Failed to parse response: {}", e)))?
            {
                httparse::Status::Complete(len) => {
                    let status = parsed
                        .code
                        .ok_or_else(|| Error::http1("Missing status code"))?;
                    let headers = parsed
                        .headers
                        .iter()
                        .filter(|h| !h.name.is_empty())
                        .map(|h| {
                            (
                                h.name.to_string(),
                                String::from_utf8_lossy(h.value).into_owned(),
                            )
                        })
                        .collect();
                    self.read_buf.advance(len);
                    return Ok((status, headers));
                }
                httparse::Status::Partial => {
                    if self.read_buf.len() >= MAX_HEADERS_SIZE {
                        return Err(Error::http1("Response headers too large"));
                    }
                    self.fill("Connection closed before response complete")
                        .await?;
                }
            }
        }
    }

    /// Body framing per RFC 9112 Section 6.3.
    async fn read_body(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        method: &Method,
    ) -> Result<Bytes> {
        if matches!(status, 204 | 304) || *method == Method::HEAD {
            return Ok(Bytes::new());
        }

        if let Some(te) = header_value(headers, "transfer-encoding") {
            let chunked = te
                .split(',')
                .next_back()
                .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
                .unwrap_or(false);
            if chunked {
                return self.read_chunked_body().await;
            }
            self.should_close = true;
            return self.read_until_close().await;
        }

        match header_value(headers, "content-length") {
            Some(value) => {
                let len = parse_content_length(value)?;
                self.read_fixed_body(len).await
            }
            None => {
                self.should_close = true;
                self.read_until_close().await
            }
        }
    }

    /// Read more bytes into the buffer, failing on EOF.
    async fn fill(&mut self, eof_message: &str) -> Result<()> {
        let n = self.stream.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            self.should_close = true;
            return Err(Error::connection_closed(eof_message));
        }
        Ok(())
    }

    async fn read_until_close(&mut self) -> Result<Bytes> {
        while self.stream.read_buf(&mut self.read_buf).await? != 0 {
            if self.read_buf.len() > MAX_BODY_SIZE {
                return Err(body_too_large());
            }
        }
        Ok(self.read_buf.split().freeze())
    }

    async fn read_fixed_body(&mut self, len: usize) -> Result<Bytes> {
        if len > MAX_BODY_SIZE {
            self.should_close = true;
            return Err(body_too_large());
        }
        while self.read_buf.len() < len {
            self.fill("Connection closed before receiving full body")
                .await?;
        }
        Ok(self.read_buf.split_to(len).freeze())
    }

    /// chunked-body = *chunk last-chunk trailer-section CRLF
    async fn read_chunked_body(&mut self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let (size, line_end) = loop {
                if let Some(found) = find_chunk_size(&self.read_buf)? {
                    break found;
                }
                self.fill("Connection closed while reading chunk size")
                    .await?;
            };
            self.read_buf.advance(line_end);

            if size == 0 {
                self.consume_trailers().await?;
                return Ok(body.freeze());
            }
            let framed = match size.checked_add(2) {
                Some(framed) if size <= MAX_BODY_SIZE - body.len() => framed,
                _ => {
                    self.should_close = true;
                    return Err(body_too_large());
                }
            };

            while self.read_buf.len() < framed {
                self.fill("Connection closed while reading chunk data")
                    .await?;
            }
            body.extend_from_slice(&self.read_buf[..size]);
            if &self.read_buf[size..framed] != b"\r\n" {
                self.should_close = true;
                return Err(Error::http1("Chunk data not terminated by CRLF"));
            }
            self.read_buf.advance(framed);
        }
    }

    /// Skip trailer fields up to the terminating empty line.
    async fn consume_trailers(&mut self) -> Result<()> {
        loop {
            match find_crlf(&self.read_buf) {
                Some(0) => {
                    self.read_buf.advance(2);
                    return Ok(());
                }
                Some(pos) => self.read_buf.advance(pos + 2),
                None => {
                    self.fill("Connection closed while reading trailers")
                        .await?
                }
            }
        }
    }
}

/// Serialize the request line and header section.
fn build_request(
    req: &Request,
    default_user_agent: &str,
    body: &Body,
    chunked: bool,
) -> Result<Vec<u8>> {
    for (name, value) in req.headers() {
        validate_header_name(name)?;
        validate_header_value(value)?;
    }

    let mut out = Vec::with_capacity(1024);
    out.extend_from_slice(req.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.path().as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let authority = req.authority();
    validate_header_value(&authority)?;
    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(authority.as_bytes());
    out.extend_from_slice(b"\r\n");

    let has = |name: &str| {
        req.headers()
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    };

    for (name, value) in req.headers() {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !has("user-agent") && !default_user_agent.is_empty() {
        out.extend_from_slice(b"User-Agent: ");
        out.extend_from_slice(default_user_agent.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !has("connection") {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    }
    if chunked {
        if !has("transfer-encoding") {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    } else if !has("content-length") && !has("transfer-encoding") {
        let len = match body {
            Body::Empty => None,
            _ => req.content_length(),
        };
        if let Some(len) = len {
            out.extend_from_slice(format!("Content-Length: {}\r\n", len).as_bytes());
        }
    }

    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Find a header value by name (case-insensitive).
fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parse a chunk size line, returning (size, end_of_line_position), or
/// `None` if the line is not complete yet.
fn find_chunk_size(buffer: &[u8]) -> Result<Option<(usize, usize)>> {
    let Some(pos) = find_crlf(buffer) else {
        if buffer.len() > MAX_CHUNK_LINE {
            return Err(Error::http1("Chunk size line too long"));
        }
        return Ok(None);
    };
    let line = String::from_utf8_lossy(&buffer[..pos]);
    let size_part = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_part, 16)
        .map_err(|_| Error::http1(format!("Invalid chunk size: {:?}", size_part)))?;
    Ok(Some((size, pos + 2)))
}

fn body_too_large() -> Error {
    Error::http1(format!(
        "Response body exceeds {} bytes",
        MAX_BODY_SIZE
    ))
}

/// Find the first CRLF in a buffer, returning its position.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Header names must be tokens per RFC 9110 Section 5.1.
fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::encoding("Empty header name"));
    }
    if !name.bytes().all(is_tchar) {
        return Err(Error::encoding(format!(
            "Invalid character in header name: {:?}",
            name
        )));
    }
    Ok(())
}

fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

/// Header values must not contain NUL, CR, or LF.
fn validate_header_value(value: &str) -> Result<()> {
    if value.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(Error::encoding(
            "Invalid character in header value (CR/LF/NUL not allowed)",
        ));
    }
    Ok(())
}

/// Multiple comma-separated values must all be identical (RFC 9112 Section 6.2).
fn parse_content_length(value: &str) -> Result<usize> {
    let mut parsed = value.split(',').map(|s| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| Error::http1(format!("Invalid Content-Length: {}", value)))
    });
    let first = parsed
        .next()
        .ok_or_else(|| Error::http1("Empty Content-Length"))??;
    for next in parsed {
        if next? != first {
            return Err(Error::http1(format!(
                "Conflicting Content-Length values: {}",
                value
            )));
        }
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn exchange(request: Request, reply: &'static [u8]) -> (Vec<u8>, Result<Response>, bool) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            server.write_all(reply).await.unwrap();
            buf.truncate(n);
            (buf, server)
        });
        let mut conn = H1Connection::new(Box::new(client));
        let mut request = request;
        let result = conn.send_request(&mut request, "test-agent").await;
        let (written, _server) = server_task.await.unwrap();
        (written, result, conn.is_reusable())
    }

    #[tokio::test]
    async fn test_content_length_response_is_reusable() {
        let req = Request::get("http://example.com/a?b=1")
            .unwrap()
            .with_header("Accept", "*/*");
        let (written, resp, reusable) =
            exchange(req, b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;

        let text = String::from_utf8(written).unwrap();
        assert!(text.starts_with("GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n"));
        assert!(text.contains("User-Agent: test-agent\r\n"));
        let resp = resp.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.version(), Version::HTTP_11);
        assert_eq!(resp.body().as_ref(), b"hello");
        assert!(reusable);
    }

    #[tokio::test]
    async fn test_chunked_response_and_interim() {
        let req = Request::get("http://example.com/").unwrap();
        let (_, resp, reusable) = exchange(
            req,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await;
        assert_eq!(resp.unwrap().body().as_ref(), b"hello world");
        assert!(reusable);
    }

    #[tokio::test]
    async fn test_connection_close_is_not_reusable() {
        let req = Request::get("http://example.com/").unwrap();
        let (_, resp, reusable) = exchange(
            req,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert_eq!(resp.unwrap().status, 200);
        assert!(!reusable);
    }

    #[tokio::test]
    async fn test_chunk_size_overflow_rejected() {
        let req = Request::get("http://example.com/").unwrap();
        let (_, resp, reusable) = exchange(
            req,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab\r\n",
        )
        .await;
        let err = resp.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "unexpected error: {}", err);
        assert!(!reusable);
    }

    #[tokio::test]
    async fn test_chunk_size_above_body_limit_rejected() {
        let req = Request::get("http://example.com/").unwrap();
        let (_, resp, reusable) = exchange(
            req,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n10000000\r\n",
        )
        .await;
        assert!(resp.is_err());
        assert!(!reusable);
    }

    #[tokio::test]
    async fn test_huge_content_length_rejected() {
        let req = Request::get("http://example.com/").unwrap();
        let (_, resp, reusable) = exchange(
            req,
            b"HTTP/1.1 200 OK\r\nContent-Length: 99999999999\r\n\r\nshort",
        )
        .await;
        assert!(resp.is_err());
        assert!(!reusable);
    }

    #[tokio::test]
    async fn test_unterminated_chunk_data_rejected() {
        let req = Request::get("http://example.com/").unwrap();
        let (_, resp, reusable) = exchange(
            req,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabcd\r\n0\r\n\r\n",
        )
        .await;
        assert!(resp.is_err());
        assert!(!reusable);
    }

    #[test]
    fn test_post_sets_content_length() {
        let req = Request::post("http://example.com/submit", "abc").unwrap();
        let head = build_request(&req, "", req.body(), false).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(!text.contains("User-Agent"));
    }

    #[test]
    fn test_header_injection_rejected() {
        let req = Request::get("http://example.com/")
            .unwrap()
            .with_header("X-Evil", "a\r\nInjected: 1");
        let err = build_request(&req, "", req.body(), false).unwrap_err();
        assert!(err.is_encoding());
    }

    #[test]
    fn test_find_chunk_size() {
        assert_eq!(find_chunk_size(b"5\r\nhello").unwrap(), Some((5, 3)));
        assert_eq!(find_chunk_size(b"FF\r\n").unwrap(), Some((255, 4)));
        assert_eq!(find_chunk_size(b"5;ext=val\r\ndata").unwrap(), Some((5, 11)));
        assert_eq!(find_chunk_size(b"10").unwrap(), None);
        assert!(find_chunk_size(b"XYZ\r\n").is_err());
        assert!(find_chunk_size(&[b'1'; MAX_CHUNK_LINE + 1]).is_err());
    }

    #[test]
    fn test_validate_header_name() {
        assert!(validate_header_name("X!#$%&'*+.^_`|~").is_ok());
        assert!(validate_header_name("").is_err());
        assert!(validate_header_name("Content Type").is_err());
        assert!(validate_header_name("Content:Type").is_err());
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length("100").unwrap(), 100);
        assert_eq!(parse_content_length("100, 100").unwrap(), 100);
        assert!(parse_content_length("100, 200").is_err());
        assert!(parse_content_length("-1").is_err());
        assert!(parse_content_length("100.5").is_err());
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"hello\r\nworld"), Some(5));
        assert_eq!(find_crlf(b"\r"), None);
        assert_eq!(find_crlf(b""), None);
    }
}
