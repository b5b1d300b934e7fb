//! Fingerprint configuration shared by every connection a transport opens.

use crate::error::{Error, Result};
use crate::fingerprint::http2::{
    LocalLimits, LocalSettings, PriorityParam, PseudoHeader, Setting, SettingId,
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_WINDOW_UPDATE_INCREMENT, MAX_WINDOW_SIZE,
};
use crate::fingerprint::tls::TlsFingerprint;

/// The wire-visible shape of a client: SETTINGS, WINDOW_UPDATE, PRIORITY
/// frames, pseudo-header and header order, and the TLS ClientHello.
///
/// Built once, validated by the transport builder, then shared read-only.
///
/// ```
/// use mimic_h2::fingerprint::{FingerprintConfig, SettingId};
///
/// let config = FingerprintConfig::new()
///     .with_setting(SettingId::HeaderTableSize, 65536)
///     .with_setting(SettingId::EnablePush, 0)
///     .with_window_update_increment(15663105)
///     .with_pseudo_header_order([":method", ":authority", ":scheme", ":path"]);
/// assert_eq!(config.akamai_string(), "1:65536;2:0|15663105|0|m,a,s,p");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintConfig {
    pseudo_header_order: Vec<String>,
    header_order: Vec<String>,
    settings: Vec<Setting>,
    window_update_increment: u32,
    priority_frames: Vec<(u32, PriorityParam)>,
    tls: Option<TlsFingerprint>,
}

impl FingerprintConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pseudo-header order as tokens (`:method`, `:authority`, `:scheme`,
    /// `:path`). Unrecognized tokens are kept but never emitted.
    pub fn with_pseudo_header_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pseudo_header_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Regular header order. Names are matched case-insensitively.
    pub fn with_header_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.header_order = order
            .into_iter()
            .map(|s| s.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    /// Replace the SETTINGS list. Order is wire order.
    pub fn with_settings(mut self, settings: impl IntoIterator<Item = Setting>) -> Self {
        self.settings = settings.into_iter().collect();
        self
    }

    /// Append one SETTINGS parameter.
    pub fn with_setting(mut self, id: SettingId, value: u32) -> Self {
        self.settings.push(Setting::new(id, value));
        self
    }

    /// Connection WINDOW_UPDATE increment (0 selects the default).
    pub fn with_window_update_increment(mut self, increment: u32) -> Self {
        self.window_update_increment = increment;
        self
    }

    /// Append a PRIORITY frame sent after the connection WINDOW_UPDATE.
    pub fn with_priority_frame(mut self, stream_id: u32, param: PriorityParam) -> Self {
        self.priority_frames.push((stream_id, param));
        self
    }

    pub fn with_tls(mut self, tls: TlsFingerprint) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Pseudo-headers to emit, in order.
    pub fn pseudo_header_order(&self) -> Vec<PseudoHeader> {
        if self.pseudo_header_order.is_empty() {
            return PseudoHeader::DEFAULT_ORDER.to_vec();
        }
        self.pseudo_header_order
            .iter()
            .filter_map(|token| PseudoHeader::from_token(token))
            .collect()
    }

    pub fn header_order(&self) -> &[String] {
        &self.header_order
    }

    /// Rank of `name` in the header order. A name listed twice takes its last
    /// position.
    pub fn header_rank(&self, name: &str) -> Option<usize> {
        self.header_order
            .iter()
            .rposition(|ordered| ordered.eq_ignore_ascii_case(name))
    }

    /// Caller-supplied SETTINGS. Empty means the transport computes a default list.
    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// The increment actually sent.
    pub fn window_update_increment(&self) -> u32 {
        if self.window_update_increment == 0 {
            DEFAULT_WINDOW_UPDATE_INCREMENT
        } else {
            self.window_update_increment
        }
    }

    pub fn priority_frames(&self) -> &[(u32, PriorityParam)] {
        &self.priority_frames
    }

    pub fn tls(&self) -> Option<&TlsFingerprint> {
        self.tls.as_ref()
    }

    /// Reject configurations that could only fail on the wire.
    pub fn validate(&self) -> Result<()> {
        for setting in &self.settings {
            setting.validate()?;
        }
        if self.window_update_increment() > MAX_WINDOW_SIZE - DEFAULT_INITIAL_WINDOW_SIZE {
            return Err(Error::flow_control(format!(
                "WINDOW_UPDATE increment {} overflows the connection window",
                self.window_update_increment()
            )));
        }
        for (stream_id, param) in &self.priority_frames {
            if *stream_id == 0 || *stream_id > MAX_WINDOW_SIZE {
                return Err(Error::encoding(format!(
                    "PRIORITY frame for invalid stream {}",
                    stream_id
                )));
            }
            if param.stream_dependency == *stream_id {
                return Err(Error::encoding(format!(
                    "PRIORITY frame for stream {} depends on itself",
                    stream_id
                )));
            }
        }
        Ok(())
    }

    /// Akamai HTTP/2 fingerprint: `settings|window_update|priority|pseudo_order`.
    pub fn akamai_string(&self) -> String {
        let settings = if self.settings.is_empty() {
            LocalSettings::resolve(&[], &LocalLimits::default())
                .map(|local| local.advertised)
                .unwrap_or_default()
        } else {
            self.settings.clone()
        };
        let settings = settings
            .iter()
            .map(|s| format!("{}:{}", u16::from(s.id), s.value))
            .collect::<Vec<_>>()
            .join(";");

        let priority = if self.priority_frames.is_empty() {
            "0".to_string()
        } else {
            self.priority_frames
                .iter()
                .map(|(id, p)| {
                    format!(
                        "{}:{}:{}:{}",
                        id,
                        u8::from(p.exclusive),
                        p.stream_dependency,
                        p.weight as u16 + 1
                    )
                })
                .collect::<Vec<_>>()
                .join(",")
        };

        let pseudo = self
            .pseudo_header_order()
            .iter()
            .map(|p| p.akamai_char().to_string())
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "{}|{}|{}|{}",
            settings,
            self.window_update_increment(),
            priority,
            pseudo
        )
    }
}
