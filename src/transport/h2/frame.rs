//! HTTP/2 frame types and binary serialization.
//!
//! Every outbound frame is built here so the transport controls exact byte
//! layout and ordering. Inbound frames go through [`FrameDecoder`], which
//! enforces the locally advertised maximum frame size.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::fingerprint::http2::{PriorityParam, Setting, SettingId};

/// Frame header size (9 bytes per RFC 9113).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (16KB per RFC 9113).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// HTTP/2 connection preface (client must send this first).
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers per RFC 9113.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// HTTP/2 error codes per RFC 9113 Section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Unknown(u32),
}

impl From<u32> for ErrorCode {
    fn from(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            other => Self::Unknown(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> u32 {
        match code {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::Unknown(v) => v,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoError => "NO_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FlowControlError => "FLOW_CONTROL_ERROR",
            Self::SettingsTimeout => "SETTINGS_TIMEOUT",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::FrameSizeError => "FRAME_SIZE_ERROR",
            Self::RefusedStream => "REFUSED_STREAM",
            Self::Cancel => "CANCEL",
            Self::CompressionError => "COMPRESSION_ERROR",
            Self::ConnectError => "CONNECT_ERROR",
            Self::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Self::InadequateSecurity => "INADEQUATE_SECURITY",
            Self::Http11Required => "HTTP_1_1_REQUIRED",
            Self::Unknown(v) => return write!(f, "unknown error code 0x{:x}", v),
        };
        f.write_str(name)
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header. The reserved stream-id bit is ignored on receipt.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        Some(Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & 0x7fff_ffff);
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

fn frame_buf(frame_type: FrameType, flags: u8, stream_id: u32, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
    FrameHeader {
        length: payload_len as u32,
        frame_type,
        flags,
        stream_id,
    }
    .serialize(&mut buf);
    buf
}

fn frame_size_error(what: &str) -> Error {
    Error::protocol(ErrorCode::FrameSizeError, what)
}

fn require_stream(header: &FrameHeader, what: &str) -> Result<()> {
    if header.stream_id == 0 {
        return Err(Error::protocol(
            ErrorCode::ProtocolError,
            format!("{} frame on stream 0", what),
        ));
    }
    Ok(())
}

fn require_connection(header: &FrameHeader, what: &str) -> Result<()> {
    if header.stream_id != 0 {
        return Err(Error::protocol(
            ErrorCode::ProtocolError,
            format!("{} frame on stream {}", what, header.stream_id),
        ));
    }
    Ok(())
}

/// Strip the pad-length octet and trailing padding from a PADDED payload.
fn strip_padding(header: &FrameHeader, mut payload: Bytes) -> Result<Bytes> {
    if !header.has(flags::PADDED) {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(frame_size_error("padded frame missing pad length"));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(Error::protocol(
            ErrorCode::ProtocolError,
            "padding exceeds frame payload",
        ));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

/// SETTINGS frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsFrame {
    /// Settings in wire order.
    pub settings: Vec<Setting>,
    pub ack: bool,
}

impl SettingsFrame {
    pub fn new(settings: Vec<Setting>) -> Self {
        Self {
            settings,
            ack: false,
        }
    }

    pub fn ack() -> Self {
        Self {
            settings: Vec::new(),
            ack: true,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let len = if self.ack { 0 } else { self.settings.len() * 6 };
        let flags = if self.ack { flags::ACK } else { 0 };
        let mut buf = frame_buf(FrameType::Settings, flags, 0, len);
        if !self.ack {
            for setting in &self.settings {
                buf.put_u16(setting.id.into());
                buf.put_u32(setting.value);
            }
        }
        buf
    }

    fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        require_connection(header, "SETTINGS")?;
        let ack = header.has(flags::ACK);
        if ack {
            if !payload.is_empty() {
                return Err(frame_size_error("SETTINGS ACK with payload"));
            }
            return Ok(Self::ack());
        }
        if payload.len() % 6 != 0 {
            return Err(frame_size_error("SETTINGS payload not a multiple of 6"));
        }
        let mut settings = Vec::with_capacity(payload.len() / 6);
        while payload.remaining() >= 6 {
            let id = SettingId::from(payload.get_u16());
            let value = payload.get_u32();
            settings.push(Setting::new(id, value));
        }
        Ok(Self::new(settings))
    }
}

/// WINDOW_UPDATE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: u32,
    pub increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: u32, increment: u32) -> Self {
        Self {
            stream_id,
            increment,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = frame_buf(FrameType::WindowUpdate, 0, self.stream_id, 4);
        buf.put_u32(self.increment & 0x7fff_ffff);
        buf
    }

    /// A zero increment is left for the caller to judge: it is a stream error
    /// on a stream and a connection error on stream 0.
    fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        if payload.len() != 4 {
            return Err(frame_size_error("WINDOW_UPDATE payload must be 4 bytes"));
        }
        Ok(Self::new(header.stream_id, payload.get_u32() & 0x7fff_ffff))
    }
}

/// HEADERS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadersFrame {
    pub stream_id: u32,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub end_headers: bool,
    pub priority: Option<PriorityParam>,
}

impl HeadersFrame {
    pub fn new(stream_id: u32, header_block: Bytes) -> Self {
        Self {
            stream_id,
            header_block,
            end_stream: false,
            end_headers: true,
            priority: None,
        }
    }

    pub fn end_stream(mut self, end: bool) -> Self {
        self.end_stream = end;
        self
    }

    pub fn end_headers(mut self, end: bool) -> Self {
        self.end_headers = end;
        self
    }

    pub fn with_priority(mut self, priority: PriorityParam) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let priority_len = if self.priority.is_some() { 5 } else { 0 };
        let mut frame_flags = 0u8;
        if self.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if self.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if self.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }
        let mut buf = frame_buf(
            FrameType::Headers,
            frame_flags,
            self.stream_id,
            priority_len + self.header_block.len(),
        );
        if let Some(priority) = &self.priority {
            put_priority(&mut buf, priority);
        }
        buf.extend_from_slice(&self.header_block);
        buf
    }

    fn parse(header: &FrameHeader, payload: Bytes) -> Result<Self> {
        require_stream(header, "HEADERS")?;
        let mut payload = strip_padding(header, payload)?;
        let priority = if header.has(flags::PRIORITY) {
            if payload.len() < 5 {
                return Err(frame_size_error("HEADERS priority block truncated"));
            }
            Some(get_priority(&mut payload))
        } else {
            None
        };
        Ok(Self {
            stream_id: header.stream_id,
            header_block: payload,
            end_stream: header.has(flags::END_STREAM),
            end_headers: header.has(flags::END_HEADERS),
            priority,
        })
    }
}

fn put_priority(buf: &mut BytesMut, priority: &PriorityParam) {
    let mut dep = priority.stream_dependency & 0x7fff_ffff;
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

fn get_priority(payload: &mut Bytes) -> PriorityParam {
    let dep = payload.get_u32();
    let weight = payload.get_u8();
    PriorityParam {
        stream_dependency: dep & 0x7fff_ffff,
        exclusive: dep & 0x8000_0000 != 0,
        weight,
    }
}

/// CONTINUATION frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationFrame {
    pub stream_id: u32,
    pub header_fragment: Bytes,
    pub end_headers: bool,
}

impl ContinuationFrame {
    pub fn new(stream_id: u32, header_fragment: Bytes, end_headers: bool) -> Self {
        Self {
            stream_id,
            header_fragment,
            end_headers,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let flags = if self.end_headers { flags::END_HEADERS } else { 0 };
        let mut buf = frame_buf(
            FrameType::Continuation,
            flags,
            self.stream_id,
            self.header_fragment.len(),
        );
        buf.extend_from_slice(&self.header_fragment);
        buf
    }

    fn parse(header: &FrameHeader, payload: Bytes) -> Result<Self> {
        require_stream(header, "CONTINUATION")?;
        Ok(Self::new(
            header.stream_id,
            payload,
            header.has(flags::END_HEADERS),
        ))
    }
}

/// Split an encoded header block into HEADERS plus CONTINUATION frames no
/// larger than `max_frame_size`, appending them to `out`.
pub fn encode_header_block(
    out: &mut BytesMut,
    stream_id: u32,
    block: Bytes,
    end_stream: bool,
    max_frame_size: usize,
) {
    let max = max_frame_size.max(1);
    let mut rest = block;
    let first = rest.split_to(rest.len().min(max));
    let headers = HeadersFrame::new(stream_id, first)
        .end_stream(end_stream)
        .end_headers(rest.is_empty());
    out.extend_from_slice(&headers.serialize());
    while !rest.is_empty() {
        let chunk = rest.split_to(rest.len().min(max));
        let cont = ContinuationFrame::new(stream_id, chunk, rest.is_empty());
        out.extend_from_slice(&cont.serialize());
    }
}

/// DATA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub data: Bytes,
    pub end_stream: bool,
    /// Bytes counted against flow control, padding included.
    pub flow_len: u32,
}

impl DataFrame {
    pub fn new(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let flow_len = data.len() as u32;
        Self {
            stream_id,
            data,
            end_stream,
            flow_len,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let flags = if self.end_stream { flags::END_STREAM } else { 0 };
        let mut buf = frame_buf(FrameType::Data, flags, self.stream_id, self.data.len());
        buf.extend_from_slice(&self.data);
        buf
    }

    fn parse(header: &FrameHeader, payload: Bytes) -> Result<Self> {
        require_stream(header, "DATA")?;
        let flow_len = payload.len() as u32;
        let data = strip_padding(header, payload)?;
        Ok(Self {
            stream_id: header.stream_id,
            data,
            end_stream: header.has(flags::END_STREAM),
            flow_len,
        })
    }
}

/// PRIORITY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityFrame {
    pub stream_id: u32,
    pub param: PriorityParam,
}

impl PriorityFrame {
    pub fn new(stream_id: u32, param: PriorityParam) -> Self {
        Self { stream_id, param }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = frame_buf(FrameType::Priority, 0, self.stream_id, 5);
        put_priority(&mut buf, &self.param);
        buf
    }

    fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        require_stream(header, "PRIORITY")?;
        if payload.len() != 5 {
            return Err(frame_size_error("PRIORITY payload must be 5 bytes"));
        }
        Ok(Self::new(header.stream_id, get_priority(&mut payload)))
    }
}

/// RST_STREAM frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: u32,
    pub error_code: ErrorCode,
}

impl RstStreamFrame {
    pub fn new(stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            stream_id,
            error_code,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = frame_buf(FrameType::RstStream, 0, self.stream_id, 4);
        buf.put_u32(self.error_code.into());
        buf
    }

    fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        require_stream(header, "RST_STREAM")?;
        if payload.len() != 4 {
            return Err(frame_size_error("RST_STREAM payload must be 4 bytes"));
        }
        Ok(Self::new(header.stream_id, payload.get_u32().into()))
    }
}

/// PING frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingFrame {
    pub opaque_data: [u8; 8],
    pub ack: bool,
}

impl PingFrame {
    pub fn new(opaque_data: [u8; 8]) -> Self {
        Self {
            opaque_data,
            ack: false,
        }
    }

    pub fn ack(opaque_data: [u8; 8]) -> Self {
        Self {
            opaque_data,
            ack: true,
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let flags = if self.ack { flags::ACK } else { 0 };
        let mut buf = frame_buf(FrameType::Ping, flags, 0, 8);
        buf.extend_from_slice(&self.opaque_data);
        buf
    }

    fn parse(header: &FrameHeader, payload: Bytes) -> Result<Self> {
        require_connection(header, "PING")?;
        let opaque_data = <[u8; 8]>::try_from(&payload[..])
            .map_err(|_| frame_size_error("PING payload must be 8 bytes"))?;
        Ok(Self {
            opaque_data,
            ack: header.has(flags::ACK),
        })
    }
}

/// GOAWAY frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAwayFrame {
    pub last_stream_id: u32,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoAwayFrame {
    pub fn new(last_stream_id: u32, error_code: ErrorCode) -> Self {
        Self {
            last_stream_id,
            error_code,
            debug_data: Bytes::new(),
        }
    }

    pub fn with_debug_data(mut self, debug_data: impl Into<Bytes>) -> Self {
        self.debug_data = debug_data.into();
        self
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = frame_buf(FrameType::GoAway, 0, 0, 8 + self.debug_data.len());
        buf.put_u32(self.last_stream_id & 0x7fff_ffff);
        buf.put_u32(self.error_code.into());
        buf.extend_from_slice(&self.debug_data);
        buf
    }

    fn parse(header: &FrameHeader, mut payload: Bytes) -> Result<Self> {
        require_connection(header, "GOAWAY")?;
        if payload.len() < 8 {
            return Err(frame_size_error("GOAWAY payload shorter than 8 bytes"));
        }
        let last_stream_id = payload.get_u32() & 0x7fff_ffff;
        let error_code = ErrorCode::from(payload.get_u32());
        Ok(Self {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Headers(HeadersFrame),
    Priority(PriorityFrame),
    RstStream(RstStreamFrame),
    Settings(SettingsFrame),
    PushPromise { stream_id: u32 },
    Ping(PingFrame),
    GoAway(GoAwayFrame),
    WindowUpdate(WindowUpdateFrame),
    Continuation(ContinuationFrame),
    Unknown { frame_type: u8, stream_id: u32 },
}

impl Frame {
    /// Decode a frame body given its already-parsed header.
    pub fn parse(header: &FrameHeader, payload: Bytes) -> Result<Self> {
        Ok(match header.frame_type {
            FrameType::Data => Frame::Data(DataFrame::parse(header, payload)?),
            FrameType::Headers => Frame::Headers(HeadersFrame::parse(header, payload)?),
            FrameType::Priority => Frame::Priority(PriorityFrame::parse(header, payload)?),
            FrameType::RstStream => Frame::RstStream(RstStreamFrame::parse(header, payload)?),
            FrameType::Settings => Frame::Settings(SettingsFrame::parse(header, payload)?),
            FrameType::PushPromise => Frame::PushPromise {
                stream_id: header.stream_id,
            },
            FrameType::Ping => Frame::Ping(PingFrame::parse(header, payload)?),
            FrameType::GoAway => Frame::GoAway(GoAwayFrame::parse(header, payload)?),
            FrameType::WindowUpdate => {
                Frame::WindowUpdate(WindowUpdateFrame::parse(header, payload)?)
            }
            FrameType::Continuation => {
                Frame::Continuation(ContinuationFrame::parse(header, payload)?)
            }
            FrameType::Unknown(frame_type) => Frame::Unknown {
                frame_type,
                stream_id: header.stream_id,
            },
        })
    }
}

/// Incremental frame decoder over a read buffer.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl FrameDecoder {
    /// `max_frame_size` is the SETTINGS_MAX_FRAME_SIZE we advertised.
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    /// Pull one complete frame off the front of `buf`, if present.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(header) = FrameHeader::parse(buf) else {
            return Ok(None);
        };
        if header.length > self.max_frame_size {
            return Err(frame_size_error(&format!(
                "frame of {} bytes exceeds max frame size {}",
                header.length, self.max_frame_size
            )));
        }
        let total = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();
        Frame::parse(&header, payload).map(Some)
    }
}
