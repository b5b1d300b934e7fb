//! Dialing: TCP connect plus a BoringSSL handshake shaped by a
//! [`TlsFingerprint`].
//!
//! [`Dial`] is the override point. Anything that yields an [`HttpStream`]
//! (a proxy tunnel, a custom resolver, an in-memory pipe in tests) can replace
//! [`BoringConnector`].

use std::io;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use boring::ssl::{SslConnector, SslMethod, SslSessionCacheMode, SslVersion};
use boring::x509::X509;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;
use url::Url;

use crate::error::{Error, Result};
use crate::fingerprint::tls::{CertCompression, TlsFingerprint};
use crate::timeouts::with_timeout;

// FFI bindings for BoringSSL extension control
use boring_sys::{CRYPTO_BUFFER, SSL, SSL_CTX};
use std::os::raw::c_int;

extern "C" {
    /// Enable GREASE (Generate Random Extensions And Sustain Extensibility)
    pub fn SSL_CTX_set_grease_enabled(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
    /// Enable extension order permutation (Chrome 110+ behavior)
    pub fn SSL_CTX_set_permute_extensions(ctx: *mut SSL_CTX, enabled: c_int) -> c_int;
}

/// ALPN list offered on every TLS connection, `h2` first.
pub const ALPN_PROTOCOLS: &[u8] = b"\x02h2\x08http/1.1";

/// Hand a decompressed certificate back to BoringSSL.
unsafe fn finish_decompression(
    out: *mut *mut CRYPTO_BUFFER,
    decompressed: &[u8],
    uncompressed_len: usize,
) -> c_int {
    if decompressed.len() != uncompressed_len {
        return 0;
    }
    // CRYPTO_BUFFER_new copies the data.
    let buffer = boring_sys::CRYPTO_BUFFER_new(
        decompressed.as_ptr(),
        decompressed.len(),
        std::ptr::null_mut(),
    );
    if buffer.is_null() {
        return 0;
    }
    *out = buffer;
    1
}

/// Brotli certificate decompression callback (RFC 8879).
unsafe extern "C" fn decompress_brotli_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    let mut decoder = brotli::Decompressor::new(compressed, uncompressed_len.max(1));
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => finish_decompression(out, &decompressed, uncompressed_len),
        Err(_) => 0,
    }
}

/// Zlib certificate decompression callback (RFC 8879).
unsafe extern "C" fn decompress_zlib_cert(
    _ssl: *mut SSL,
    out: *mut *mut CRYPTO_BUFFER,
    uncompressed_len: usize,
    in_: *const u8,
    in_len: usize,
) -> c_int {
    let compressed = std::slice::from_raw_parts(in_, in_len);
    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    let mut decompressed = Vec::with_capacity(uncompressed_len);
    match decoder.read_to_end(&mut decompressed) {
        Ok(_) => finish_decompression(out, &decompressed, uncompressed_len),
        Err(_) => 0,
    }
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    /// HTTP/2 ("h2")
    H2,
    /// HTTP/1.1 ("http/1.1")
    Http1,
    /// No ALPN negotiated, or plain TCP.
    Unknown,
}

impl AlpnProtocol {
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::H2)
    }
}

/// A dialed connection plus the TLS state needed to pick a protocol.
pub trait HttpStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Protocol chosen during the TLS handshake.
    fn alpn_protocol(&self) -> AlpnProtocol;
}

impl HttpStream for TcpStream {
    fn alpn_protocol(&self) -> AlpnProtocol {
        AlpnProtocol::Unknown
    }
}

impl HttpStream for tokio::io::DuplexStream {
    fn alpn_protocol(&self) -> AlpnProtocol {
        AlpnProtocol::Unknown
    }
}

/// Replaceable TCP + TLS step.
#[async_trait]
pub trait Dial: Send + Sync {
    /// Open a connection to the origin of `url`. `https` URLs must come back
    /// with TLS already established.
    async fn dial(&self, url: &Url) -> Result<Box<dyn HttpStream>>;
}

/// Stream that can be either HTTP (plain TCP) or HTTPS (TLS).
#[derive(Debug)]
pub enum MaybeHttpsStream {
    /// Plain TCP stream for HTTP.
    Http(TcpStream),
    /// TLS-wrapped stream for HTTPS.
    Https(SslStream<TcpStream>),
}

impl HttpStream for MaybeHttpsStream {
    fn alpn_protocol(&self) -> AlpnProtocol {
        match self {
            MaybeHttpsStream::Http(_) => AlpnProtocol::Unknown,
            MaybeHttpsStream::Https(stream) => match stream.ssl().selected_alpn_protocol() {
                Some(b"h2") => AlpnProtocol::H2,
                Some(b"http/1.1") => AlpnProtocol::Http1,
                _ => AlpnProtocol::Unknown,
            },
        }
    }
}

impl AsyncRead for MaybeHttpsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeHttpsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_flush(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// TLS 1.3 suites are fixed in BoringSSL and rejected by the cipher list.
fn is_tls13_suite(name: &str) -> bool {
    matches!(
        name,
        "TLS_AES_128_GCM_SHA256" | "TLS_AES_256_GCM_SHA384" | "TLS_CHACHA20_POLY1305_SHA256"
    )
}

/// BoringSSL-based dialer.
#[derive(Clone, Default)]
pub struct BoringConnector {
    tls_config: Option<TlsFingerprint>,
    root_certs: Vec<Vec<u8>>,
    connect_timeout: Option<Duration>,
}

impl BoringConnector {
    /// Create a new connector with the BoringSSL default ClientHello.
    pub fn new() -> Self {
        Self::default()
    }

    /// ClientHello fingerprint; `None` keeps the BoringSSL default.
    pub fn with_tls(mut self, fp: Option<TlsFingerprint>) -> Self {
        self.tls_config = fp;
        self
    }

    /// Add custom root certificates (DER or PEM).
    pub fn with_root_certificates(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.root_certs = certs;
        self
    }

    /// Bound DNS + TCP connect + TLS handshake.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn configure_ssl(&self) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::tls(format!("Failed to create SSL connector: {}", e)))?;

        for cert_bytes in &self.root_certs {
            let cert = X509::from_der(cert_bytes)
                .or_else(|_| X509::from_pem(cert_bytes))
                .map_err(|e| Error::tls(format!("Invalid root certificate: {}", e)))?;
            builder
                .cert_store_mut()
                .add_cert(cert)
                .map_err(|e| Error::tls(format!("Failed to add root certificate: {}", e)))?;
        }

        if let Some(fp) = &self.tls_config {
            let ciphers: Vec<&str> = fp
                .cipher_list
                .iter()
                .map(String::as_str)
                .filter(|c| !is_tls13_suite(c))
                .collect();
            if !ciphers.is_empty() {
                builder
                    .set_cipher_list(&ciphers.join(":"))
                    .map_err(|e| Error::tls(format!("Failed to set cipher list: {}", e)))?;
            }
            if !fp.curves.is_empty() {
                builder
                    .set_curves_list(&fp.curves.join(":"))
                    .map_err(|e| Error::tls(format!("Failed to set curves: {}", e)))?;
            }
            if !fp.sigalgs.is_empty() {
                builder
                    .set_sigalgs_list(&fp.sigalgs.join(":"))
                    .map_err(|e| {
                        Error::tls(format!("Failed to set signature algorithms: {}", e))
                    })?;
            }

            // SAFETY: `ctx` is the live SSL_CTX owned by `builder`; these calls
            // only set flags and register static callbacks on it.
            unsafe {
                let ctx = builder.as_ptr() as *mut SSL_CTX;
                SSL_CTX_set_grease_enabled(ctx, fp.grease as c_int);
                SSL_CTX_set_permute_extensions(ctx, fp.permute_extensions as c_int);
                match fp.cert_compression {
                    CertCompression::Brotli => {
                        boring_sys::SSL_CTX_add_cert_compression_alg(
                            ctx,
                            boring_sys::TLSEXT_cert_compression_brotli as u16,
                            None,
                            Some(decompress_brotli_cert),
                        );
                    }
                    CertCompression::Zlib => {
                        boring_sys::SSL_CTX_add_cert_compression_alg(
                            ctx,
                            boring_sys::TLSEXT_cert_compression_zlib as u16,
                            None,
                            Some(decompress_zlib_cert),
                        );
                    }
                    CertCompression::None => {}
                }
            }
        }

        builder
            .set_min_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|e| Error::tls(format!("Failed to set min TLS version: {}", e)))?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::tls(format!("Failed to set max TLS version: {}", e)))?;
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
        builder
            .set_alpn_protos(ALPN_PROTOCOLS)
            .map_err(|e| Error::tls(format!("Failed to set ALPN: {}", e)))?;

        Ok(builder.build())
    }

    /// Connect to the origin of `url`, returning either a plain TCP or TLS stream.
    pub async fn connect(&self, url: &Url) -> Result<MaybeHttpsStream> {
        with_timeout(self.connect_timeout, Error::ConnectTimeout, self.connect_inner(url)).await
    }

    async fn connect_inner(&self, url: &Url) -> Result<MaybeHttpsStream> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::connection("URL has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::connection(format!("no port for scheme {}", url.scheme())))?;
        // IPv6 literals keep their brackets in host_str.
        let addr = format!("{}:{}", host, port);

        let tcp_stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;
        let _ = tcp_stream.set_nodelay(true);

        if url.scheme() != "https" {
            return Ok(MaybeHttpsStream::Http(tcp_stream));
        }

        let sni = host.trim_start_matches('[').trim_end_matches(']');
        let ssl_config = self
            .configure_ssl()?
            .configure()
            .map_err(|e| Error::tls(format!("Failed to configure SSL: {}", e)))?;
        let ssl_stream = tokio_boring::connect(ssl_config, sni, tcp_stream)
            .await
            .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;
        tracing::debug!(
            host = sni,
            alpn = ?ssl_stream.ssl().selected_alpn_protocol().map(String::from_utf8_lossy),
            "TLS established"
        );
        Ok(MaybeHttpsStream::Https(ssl_stream))
    }
}

#[async_trait]
impl Dial for BoringConnector {
    async fn dial(&self, url: &Url) -> Result<Box<dyn HttpStream>> {
        Ok(Box::new(self.connect(url).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls13_suites_filtered() {
        assert!(is_tls13_suite("TLS_AES_128_GCM_SHA256"));
        assert!(!is_tls13_suite("TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"));
    }

    #[test]
    fn test_fingerprint_configures_context() {
        let connector = BoringConnector::new().with_tls(Some(TlsFingerprint::chrome_131()));
        assert!(connector.configure_ssl().is_ok());
    }

    #[tokio::test]
    async fn test_plain_http_dial_has_no_alpn() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let stream = BoringConnector::new().dial(&url).await.unwrap();
        assert_eq!(stream.alpn_protocol(), AlpnProtocol::Unknown);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let err = BoringConnector::new().connect(&url).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }
}
