//! HTTP/2 fingerprint primitives: SETTINGS, pseudo-header tokens, PRIORITY parameters.

use std::fmt;

use crate::error::{Error, Result};
use crate::transport::h2::frame::ErrorCode;

/// HPACK dynamic table size assumed by both peers before SETTINGS.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Initial flow-control window per RFC 9113.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Smallest legal SETTINGS_MAX_FRAME_SIZE (and the protocol default).
pub const MIN_MAX_FRAME_SIZE: u32 = 16384;

/// Largest legal SETTINGS_MAX_FRAME_SIZE.
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Largest flow-control window.
pub const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Connection WINDOW_UPDATE increment sent when none is configured.
pub const DEFAULT_WINDOW_UPDATE_INCREMENT: u32 = 1 << 30;

/// Stream receive window advertised when no SETTINGS list is configured.
pub const DEFAULT_STREAM_RECV_WINDOW: u32 = 4 << 20;

/// Response header list cap advertised when no SETTINGS list is configured.
pub const DEFAULT_MAX_HEADER_LIST_SIZE: u32 = 10 << 20;

/// SETTINGS parameter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    /// Anything else, including GREASE identifiers. Sent as-is, ignored on receipt.
    Unknown(u16),
}

impl From<u16> for SettingId {
    fn from(v: u16) -> Self {
        match v {
            0x1 => Self::HeaderTableSize,
            0x2 => Self::EnablePush,
            0x3 => Self::MaxConcurrentStreams,
            0x4 => Self::InitialWindowSize,
            0x5 => Self::MaxFrameSize,
            0x6 => Self::MaxHeaderListSize,
            other => Self::Unknown(other),
        }
    }
}

impl From<SettingId> for u16 {
    fn from(id: SettingId) -> u16 {
        match id {
            SettingId::HeaderTableSize => 0x1,
            SettingId::EnablePush => 0x2,
            SettingId::MaxConcurrentStreams => 0x3,
            SettingId::InitialWindowSize => 0x4,
            SettingId::MaxFrameSize => 0x5,
            SettingId::MaxHeaderListSize => 0x6,
            SettingId::Unknown(v) => v,
        }
    }
}

impl fmt::Display for SettingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderTableSize => f.write_str("HEADER_TABLE_SIZE"),
            Self::EnablePush => f.write_str("ENABLE_PUSH"),
            Self::MaxConcurrentStreams => f.write_str("MAX_CONCURRENT_STREAMS"),
            Self::InitialWindowSize => f.write_str("INITIAL_WINDOW_SIZE"),
            Self::MaxFrameSize => f.write_str("MAX_FRAME_SIZE"),
            Self::MaxHeaderListSize => f.write_str("MAX_HEADER_LIST_SIZE"),
            Self::Unknown(v) => write!(f, "UNKNOWN_SETTING_{}", v),
        }
    }
}

/// A single SETTINGS parameter. Order in a list is wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

impl Setting {
    pub fn new(id: SettingId, value: u32) -> Self {
        Self { id, value }
    }

    /// Check the value against the ranges RFC 9113 Section 6.5.2 allows.
    pub fn validate(&self) -> Result<()> {
        let code = match self.id {
            SettingId::EnablePush if self.value > 1 => ErrorCode::ProtocolError,
            SettingId::InitialWindowSize if self.value > MAX_WINDOW_SIZE => {
                ErrorCode::FlowControlError
            }
            SettingId::MaxFrameSize
                if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.value) =>
            {
                ErrorCode::ProtocolError
            }
            _ => return Ok(()),
        };
        Err(Error::InvalidSetting {
            setting: *self,
            code,
        })
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} = {}]", self.id, self.value)
    }
}

/// Request pseudo-header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoHeader {
    Method,
    Authority,
    Scheme,
    Path,
}

impl PseudoHeader {
    /// Order used when no pseudo-header order is configured.
    pub const DEFAULT_ORDER: [PseudoHeader; 4] = [
        PseudoHeader::Authority,
        PseudoHeader::Method,
        PseudoHeader::Path,
        PseudoHeader::Scheme,
    ];

    /// Parse a token such as `:method`. Unrecognized tokens yield `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            ":method" => Some(Self::Method),
            ":authority" => Some(Self::Authority),
            ":scheme" => Some(Self::Scheme),
            ":path" => Some(Self::Path),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Method => ":method",
            Self::Authority => ":authority",
            Self::Scheme => ":scheme",
            Self::Path => ":path",
        }
    }

    /// Letter used in the Akamai fingerprint.
    pub fn akamai_char(&self) -> char {
        match self {
            Self::Method => 'm',
            Self::Authority => 'a',
            Self::Scheme => 's',
            Self::Path => 'p',
        }
    }
}

/// PRIORITY frame parameters (RFC 9113 Section 6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityParam {
    pub stream_dependency: u32,
    pub exclusive: bool,
    /// Wire weight (actual weight minus one).
    pub weight: u8,
}

impl PriorityParam {
    pub fn new(stream_dependency: u32, weight: u8, exclusive: bool) -> Self {
        Self {
            stream_dependency,
            exclusive,
            weight,
        }
    }
}

/// Limits a transport applies when the fingerprint carries no SETTINGS list,
/// and which bound local state regardless.
#[derive(Debug, Clone)]
pub struct LocalLimits {
    /// Advertised SETTINGS_MAX_HEADER_LIST_SIZE (0 = do not advertise).
    pub max_header_list_size: u32,
    /// Advertised SETTINGS_MAX_FRAME_SIZE (0 = do not advertise).
    pub max_read_frame_size: u32,
    /// HPACK decoder table size.
    pub max_decoder_header_table_size: u32,
    /// Upper bound on the HPACK encoder table regardless of what the peer allows.
    pub max_encoder_header_table_size: u32,
}

impl Default for LocalLimits {
    fn default() -> Self {
        Self {
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            max_read_frame_size: 0,
            max_decoder_header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_encoder_header_table_size: DEFAULT_HEADER_TABLE_SIZE,
        }
    }
}

/// The SETTINGS frame a connection sends and the local state it implies.
#[derive(Debug, Clone)]
pub struct LocalSettings {
    /// Settings in wire order.
    pub advertised: Vec<Setting>,
    pub header_table_size: u32,
    pub encoder_table_limit: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// Stream ceiling assumed until the peer's SETTINGS arrive, and kept if
    /// the peer never sends MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: Option<u32>,
}

impl LocalSettings {
    /// Compute the SETTINGS list for a connection.
    ///
    /// A caller-supplied list is validated and sent verbatim; its values also
    /// configure the decoder table, receive windows and inbound limits. Without
    /// one, a default list is built from `limits`.
    pub fn resolve(custom: &[Setting], limits: &LocalLimits) -> Result<Self> {
        let mut local = Self {
            advertised: Vec::new(),
            header_table_size: limits.max_decoder_header_table_size,
            encoder_table_limit: limits.max_encoder_header_table_size,
            initial_window_size: DEFAULT_STREAM_RECV_WINDOW,
            max_frame_size: if limits.max_read_frame_size == 0 {
                MIN_MAX_FRAME_SIZE
            } else {
                limits.max_read_frame_size
            },
            max_header_list_size: if limits.max_header_list_size == 0 {
                u32::MAX
            } else {
                limits.max_header_list_size
            },
            max_concurrent_streams: None,
        };

        if custom.is_empty() {
            local.advertised = vec![
                Setting::new(SettingId::EnablePush, 0),
                Setting::new(SettingId::InitialWindowSize, DEFAULT_STREAM_RECV_WINDOW),
            ];
            if limits.max_read_frame_size != 0 {
                local.advertised.push(Setting::new(
                    SettingId::MaxFrameSize,
                    limits.max_read_frame_size,
                ));
            }
            if limits.max_header_list_size != 0 {
                local.advertised.push(Setting::new(
                    SettingId::MaxHeaderListSize,
                    limits.max_header_list_size,
                ));
            }
            if limits.max_decoder_header_table_size != DEFAULT_HEADER_TABLE_SIZE {
                local.advertised.push(Setting::new(
                    SettingId::HeaderTableSize,
                    limits.max_decoder_header_table_size,
                ));
            }
            for setting in &local.advertised {
                setting.validate()?;
            }
            return Ok(local);
        }

        for setting in custom {
            setting.validate()?;
            match setting.id {
                SettingId::HeaderTableSize => {
                    local.header_table_size = setting.value;
                    local.encoder_table_limit = setting.value;
                }
                SettingId::InitialWindowSize => local.initial_window_size = setting.value,
                SettingId::MaxFrameSize => local.max_frame_size = setting.value,
                SettingId::MaxHeaderListSize if setting.value > 0 => {
                    local.max_header_list_size = setting.value
                }
                SettingId::MaxConcurrentStreams if setting.value > 0 => {
                    local.max_concurrent_streams = Some(setting.value)
                }
                _ => {}
            }
        }
        local.advertised = custom.to_vec();
        Ok(local)
    }
}
