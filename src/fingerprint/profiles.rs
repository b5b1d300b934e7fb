//! Browser fingerprint profiles.

use super::config::FingerprintConfig;
use super::http2::SettingId;
use super::tls::TlsFingerprint;

/// Browser profile for impersonation.
///
/// Chrome randomizes TLS extension order since v110, so the ClientHello part
/// matches on JA4 rather than JA3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintProfile {
    /// Chrome 131 on macOS.
    #[default]
    Chrome131,
    /// Firefox 133 on macOS.
    Firefox133,
    /// No fingerprinting: default SETTINGS, default TLS.
    None,
}

impl FingerprintProfile {
    /// The User-Agent a browser with this fingerprint sends.
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome131 => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36"
            }
            Self::Firefox133 => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0"
            }
            Self::None => concat!("mimic-h2/", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn tls_fingerprint(&self) -> Option<TlsFingerprint> {
        match self {
            Self::Chrome131 => Some(TlsFingerprint::chrome_131()),
            Self::Firefox133 => Some(TlsFingerprint::firefox_133()),
            Self::None => None,
        }
    }

    /// Complete fingerprint configuration for this profile.
    pub fn config(&self) -> FingerprintConfig {
        let config = match self {
            // 1:65536;2:0;4:6291456;6:262144|15663105|0|m,a,s,p
            Self::Chrome131 => FingerprintConfig::new()
                .with_setting(SettingId::HeaderTableSize, 65536)
                .with_setting(SettingId::EnablePush, 0)
                .with_setting(SettingId::InitialWindowSize, 6291456)
                .with_setting(SettingId::MaxHeaderListSize, 262144)
                .with_window_update_increment(15663105)
                .with_pseudo_header_order([":method", ":authority", ":scheme", ":path"])
                .with_header_order([
                    "cache-control",
                    "sec-ch-ua",
                    "sec-ch-ua-mobile",
                    "sec-ch-ua-platform",
                    "upgrade-insecure-requests",
                    "user-agent",
                    "accept",
                    "sec-fetch-site",
                    "sec-fetch-mode",
                    "sec-fetch-user",
                    "sec-fetch-dest",
                    "referer",
                    "accept-encoding",
                    "accept-language",
                    "cookie",
                    "priority",
                ]),
            // 1:65536;2:0;4:131072;5:16384|12517377|0|m,p,a,s
            Self::Firefox133 => FingerprintConfig::new()
                .with_setting(SettingId::HeaderTableSize, 65536)
                .with_setting(SettingId::EnablePush, 0)
                .with_setting(SettingId::InitialWindowSize, 131072)
                .with_setting(SettingId::MaxFrameSize, 16384)
                .with_window_update_increment(12517377)
                .with_pseudo_header_order([":method", ":path", ":authority", ":scheme"])
                .with_header_order([
                    "user-agent",
                    "accept",
                    "accept-language",
                    "accept-encoding",
                    "referer",
                    "cookie",
                    "upgrade-insecure-requests",
                    "sec-fetch-dest",
                    "sec-fetch-mode",
                    "sec-fetch-site",
                    "sec-fetch-user",
                    "priority",
                    "te",
                ]),
            Self::None => FingerprintConfig::new(),
        };
        match self.tls_fingerprint() {
            Some(tls) => config.with_tls(tls),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrome_akamai_fingerprint() {
        assert_eq!(
            FingerprintProfile::Chrome131.config().akamai_string(),
            "1:65536;2:0;4:6291456;6:262144|15663105|0|m,a,s,p"
        );
    }

    #[test]
    fn test_firefox_akamai_fingerprint() {
        assert_eq!(
            FingerprintProfile::Firefox133.config().akamai_string(),
            "1:65536;2:0;4:131072;5:16384|12517377|0|m,p,a,s"
        );
    }

    #[test]
    fn test_profiles_validate() {
        for profile in [
            FingerprintProfile::Chrome131,
            FingerprintProfile::Firefox133,
            FingerprintProfile::None,
        ] {
            assert!(profile.config().validate().is_ok(), "{:?}", profile);
        }
    }
}
