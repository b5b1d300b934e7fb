//! HTTP/2 connection setup and framed socket I/O.
//!
//! [`handshake`] writes the fingerprinted connection preface and hands the
//! socket to a [`Driver`] task. Everything after that goes through the
//! driver; [`H2Connection`] is the part of it that owns the socket, the HPACK
//! state and the connection-level windows.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::fingerprint::http2::{
    LocalLimits, LocalSettings, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    MIN_MAX_FRAME_SIZE,
};
use crate::fingerprint::FingerprintConfig;
use crate::timeouts::{with_timeout, Timeouts};

use super::driver::Driver;
use super::flow::{FlowWindow, InflowWindow};
use super::frame::{
    encode_header_block, Frame, FrameDecoder, PriorityFrame, SettingsFrame, WindowUpdateFrame,
    CONNECTION_PREFACE,
};
use super::handle::{H2Handle, Shared};
use super::hpack::{HpackDecoder, HpackEncoder};

/// Largest stream id a client may open.
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Per-connection options that are not part of the fingerprint.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// `host:port` the connection serves, used for logging.
    pub authority: String,
    /// Plaintext HTTP/2 with prior knowledge: client streams start at 3.
    pub allow_http: bool,
    /// Serve exactly one request, then refuse new streams.
    pub single_use: bool,
    pub limits: LocalLimits,
    pub timeouts: Timeouts,
    /// Sent when a request carries no User-Agent.
    pub default_user_agent: String,
    /// Signalled whenever a stream slot frees up or the connection closes.
    pub notify: Arc<Notify>,
}

impl ConnectionOptions {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            allow_http: false,
            single_use: false,
            limits: LocalLimits::default(),
            timeouts: Timeouts::new(),
            default_user_agent: super::headers::DEFAULT_USER_AGENT.to_string(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// What the peer told us in its SETTINGS frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    pub header_table_size: u32,
    /// Our own MAX_CONCURRENT_STREAMS, or `u32::MAX`, until the first
    /// SETTINGS frame arrives.
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u64,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            max_header_list_size: u64::MAX,
        }
    }
}

/// Socket, codec and connection-wide protocol state.
pub struct H2Connection<S> {
    io: S,
    read_buf: BytesMut,
    frame_decoder: FrameDecoder,
    write_buf: BytesMut,
    write_timeout: Option<Duration>,
    pub(crate) encoder: HpackEncoder,
    pub(crate) decoder: HpackDecoder,
    pub(crate) local: LocalSettings,
    pub(crate) peer: PeerSettings,
    /// Set after the peer's first SETTINGS frame.
    pub(crate) seen_settings: bool,
    pub(crate) want_settings_ack: bool,
    pub(crate) send_window: FlowWindow,
    pub(crate) recv_window: InflowWindow,
}

impl<S> H2Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(io: S, local: LocalSettings, conn_recv_window: u32, timeouts: &Timeouts) -> Self {
        let mut encoder = HpackEncoder::new();
        encoder.set_max_table_size(DEFAULT_HEADER_TABLE_SIZE, local.encoder_table_limit);
        Self {
            io,
            read_buf: BytesMut::with_capacity(16384),
            frame_decoder: FrameDecoder::new(local.max_frame_size),
            write_buf: BytesMut::new(),
            write_timeout: timeouts.write,
            encoder,
            decoder: HpackDecoder::new(local.header_table_size, local.max_header_list_size),
            peer: PeerSettings {
                max_concurrent_streams: local.max_concurrent_streams.unwrap_or(u32::MAX),
                ..PeerSettings::default()
            },
            local,
            seen_settings: false,
            want_settings_ack: true,
            send_window: FlowWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: InflowWindow::new(conn_recv_window),
        }
    }

    /// Read the next frame. `Ok(None)` on a clean EOF between frames.
    ///
    /// Cancel-safe: partial reads stay in the buffer for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.frame_decoder.decode(&mut self.read_buf)? {
                return Ok(Some(frame));
            }
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::connection_closed("EOF in the middle of a frame"));
            }
        }
    }

    /// Append serialized frame bytes to the write buffer.
    pub fn queue(&mut self, frame: &[u8]) {
        self.write_buf.extend_from_slice(frame);
    }

    /// Append a header block as HEADERS plus CONTINUATION frames.
    pub fn queue_header_block(&mut self, stream_id: u32, block: Bytes, end_stream: bool) {
        encode_header_block(
            &mut self.write_buf,
            stream_id,
            block,
            end_stream,
            self.peer.max_frame_size as usize,
        );
    }

    /// Write everything queued in one batch.
    pub async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let buf = self.write_buf.split();
        let io = &mut self.io;
        with_timeout(
            self.write_timeout,
            |limit| Error::io(format!("socket write timed out after {:?}", limit)),
            async move {
                io.write_all(&buf).await?;
                io.flush().await?;
                Ok(())
            },
        )
        .await
    }

    /// Best-effort close of the write half.
    pub async fn shutdown(&mut self) {
        let _ = self.io.shutdown().await;
    }
}

/// Connection preface, SETTINGS, WINDOW_UPDATE and PRIORITY frames, in
/// the order they go on the wire.
pub fn preface_bytes(config: &FingerprintConfig, local: &LocalSettings) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(CONNECTION_PREFACE);
    buf.extend_from_slice(&SettingsFrame::new(local.advertised.clone()).serialize());
    buf.extend_from_slice(&WindowUpdateFrame::new(0, config.window_update_increment()).serialize());
    for (stream_id, param) in config.priority_frames() {
        buf.extend_from_slice(&PriorityFrame::new(*stream_id, *param).serialize());
    }
    buf
}

/// Start HTTP/2 on an established (ALPN `h2` or prior-knowledge) stream.
///
/// Validates the fingerprint, writes the preface in a single flush and spawns
/// the driver. Nothing is written if validation fails.
pub async fn handshake<S>(
    mut io: S,
    config: Arc<FingerprintConfig>,
    options: ConnectionOptions,
) -> Result<H2Handle>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    config.validate()?;
    let local = LocalSettings::resolve(config.settings(), &options.limits)?;
    let increment = config.window_update_increment();

    let preface = preface_bytes(&config, &local);
    with_timeout(
        options.timeouts.write,
        |limit| Error::io(format!("preface write timed out after {:?}", limit)),
        async {
            io.write_all(&preface).await?;
            io.flush().await?;
            Ok(())
        },
    )
    .await?;

    tracing::debug!(
        authority = %options.authority,
        settings = ?local.advertised,
        window_update = increment,
        "HTTP/2 preface sent"
    );

    let initial_ceiling = local.max_concurrent_streams;
    let conn = H2Connection::new(
        io,
        local,
        DEFAULT_INITIAL_WINDOW_SIZE + increment,
        &options.timeouts,
    );
    let shared = Arc::new(Shared::new(options.single_use, options.notify.clone()));
    if let Some(max) = initial_ceiling {
        shared.set_max_concurrent(max);
    }
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let first_stream_id = if options.allow_http { 3 } else { 1 };
    let driver = Driver::new(
        conn,
        command_rx,
        shared.clone(),
        first_stream_id,
        &options.timeouts,
    );
    let span = tracing::debug_span!("h2", authority = %options.authority);
    tokio::spawn(driver.run().instrument(span));

    Ok(H2Handle::new(
        command_tx,
        shared,
        config,
        options.default_user_agent,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{PriorityParam, SettingId};
    use crate::transport::h2::frame::FrameDecoder;

    #[test]
    fn test_preface_layout() {
        let config = FingerprintConfig::new()
            .with_setting(SettingId::HeaderTableSize, 65536)
            .with_setting(SettingId::EnablePush, 0)
            .with_window_update_increment(15663105)
            .with_priority_frame(3, PriorityParam::new(0, 200, false));
        let local = LocalSettings::resolve(config.settings(), &LocalLimits::default()).unwrap();
        let mut buf = preface_bytes(&config, &local);

        assert_eq!(&buf[..24], CONNECTION_PREFACE);
        let _ = buf.split_to(24);
        let decoder = FrameDecoder::new(16384);
        let frames: Vec<Frame> = std::iter::from_fn(|| decoder.decode(&mut buf).unwrap()).collect();
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], Frame::Settings(s) if s.settings.len() == 2 && !s.ack));
        assert!(
            matches!(&frames[1], Frame::WindowUpdate(w) if w.stream_id == 0 && w.increment == 15663105)
        );
        assert!(matches!(&frames[2], Frame::Priority(p) if p.stream_id == 3));
    }

    #[tokio::test]
    async fn test_invalid_setting_writes_nothing() {
        let (client, mut server) = tokio::io::duplex(1024);
        let config = Arc::new(FingerprintConfig::new().with_setting(SettingId::EnablePush, 2));
        let err = handshake(client, config, ConnectionOptions::new("example.com:443"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSetting { .. }));

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_own_max_concurrent_streams_caps_slots_before_peer_settings() {
        let (client, _server) = tokio::io::duplex(4096);
        let config = Arc::new(
            FingerprintConfig::new()
                .with_setting(SettingId::MaxConcurrentStreams, 1)
                .with_setting(SettingId::InitialWindowSize, 65535),
        );
        let handle = handshake(client, config, ConnectionOptions::new("example.com:443"))
            .await
            .unwrap();
        let slot = handle.try_reserve();
        assert!(slot.is_some());
        assert!(handle.try_reserve().is_none());
        drop(slot);
        assert!(handle.try_reserve().is_some());
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let local = LocalSettings::resolve(&[], &LocalLimits::default()).unwrap();
        let mut conn = H2Connection::new(client, local, 65535, &Timeouts::new());
        assert!(conn.read_frame().await.unwrap().is_none());
    }
}
