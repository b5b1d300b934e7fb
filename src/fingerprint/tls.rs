//! TLS ClientHello shape.
//!
//! A [`TlsFingerprint`] is handed to BoringSSL by the connector. Extension order
//! is not fixed here: browsers permute it per connection, and BoringSSL does the
//! same when `permute_extensions` is set.

/// Certificate compression algorithm advertised in `compress_certificate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertCompression {
    /// Brotli (Chrome).
    Brotli,
    /// Zlib.
    Zlib,
    /// Extension not sent (Firefox).
    #[default]
    None,
}

/// Chrome 131 cipher suites in exact order.
pub const CHROME_131_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
];

/// Chrome 131 signature algorithms.
pub const CHROME_131_SIGNATURE_ALGORITHMS: &[&str] = &[
    "ecdsa_secp256r1_sha256",
    "rsa_pss_rsae_sha256",
    "rsa_pkcs1_sha256",
    "ecdsa_secp384r1_sha384",
    "rsa_pss_rsae_sha384",
    "rsa_pkcs1_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha512",
];

/// Chrome 131 supported groups.
pub const CHROME_131_CURVES: &[&str] = &["X25519", "P-256", "P-384"];

/// Firefox 133 cipher suites in exact order.
pub const FIREFOX_133_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
    "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
    "TLS_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_RSA_WITH_AES_128_CBC_SHA",
    "TLS_RSA_WITH_AES_256_CBC_SHA",
];

/// Firefox 133 signature algorithms.
pub const FIREFOX_133_SIGNATURE_ALGORITHMS: &[&str] = &[
    "ecdsa_secp256r1_sha256",
    "ecdsa_secp384r1_sha384",
    "ecdsa_secp521r1_sha512",
    "rsa_pss_rsae_sha256",
    "rsa_pss_rsae_sha384",
    "rsa_pss_rsae_sha512",
    "rsa_pkcs1_sha256",
    "rsa_pkcs1_sha384",
    "rsa_pkcs1_sha512",
    "ecdsa_sha1",
    "rsa_pkcs1_sha1",
];

/// Firefox 133 supported groups.
pub const FIREFOX_133_CURVES: &[&str] = &["X25519", "P-256", "P-384", "P-521"];

/// ClientHello descriptor.
///
/// Empty lists leave the BoringSSL default in place for that field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFingerprint {
    /// Cipher suites in order.
    pub cipher_list: Vec<String>,
    /// Signature algorithms in order.
    pub sigalgs: Vec<String>,
    /// Supported groups in order.
    pub curves: Vec<String>,
    /// Send GREASE values in ciphers, groups and extensions.
    pub grease: bool,
    /// Shuffle extension order per connection.
    pub permute_extensions: bool,
    /// Certificate compression to advertise.
    pub cert_compression: CertCompression,
}

impl Default for TlsFingerprint {
    fn default() -> Self {
        Self {
            cipher_list: Vec::new(),
            sigalgs: Vec::new(),
            curves: Vec::new(),
            grease: false,
            permute_extensions: false,
            cert_compression: CertCompression::None,
        }
    }
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl TlsFingerprint {
    /// Chrome 131 ClientHello.
    pub fn chrome_131() -> Self {
        Self {
            cipher_list: owned(CHROME_131_CIPHER_SUITES),
            sigalgs: owned(CHROME_131_SIGNATURE_ALGORITHMS),
            curves: owned(CHROME_131_CURVES),
            grease: true,
            permute_extensions: true,
            cert_compression: CertCompression::Brotli,
        }
    }

    /// Firefox 133 ClientHello. Firefox permutes extensions but sends no GREASE.
    pub fn firefox_133() -> Self {
        Self {
            cipher_list: owned(FIREFOX_133_CIPHER_SUITES),
            sigalgs: owned(FIREFOX_133_SIGNATURE_ALGORITHMS),
            curves: owned(FIREFOX_133_CURVES),
            grease: false,
            permute_extensions: true,
            cert_compression: CertCompression::None,
        }
    }
}
