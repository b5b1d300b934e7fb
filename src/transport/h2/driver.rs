//! HTTP/2 connection driver - the one task that owns the socket.
//!
//! Handles talk to the driver over a command channel; the driver reads
//! frames, routes them to streams, writes request frames and runs the
//! connection timers. Nothing else touches the stream table or the HPACK
//! state, so no locking is needed around them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::error::{Error, Result};
use crate::fingerprint::http2::SettingId;
use crate::timeouts::Timeouts;

use super::connection::{H2Connection, MAX_STREAM_ID};
use super::frame::{
    DataFrame, ErrorCode, Frame, GoAwayFrame, HeadersFrame, PingFrame, RstStreamFrame,
    SettingsFrame, WindowUpdateFrame,
};
use super::handle::Shared;
use super::headers::check_header_list_size;
use super::stream::{BodyEvent, OutboundChunk, ResponseHead, Stream};

/// Ceiling assumed when the peer's first SETTINGS omits MAX_CONCURRENT_STREAMS.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 1000;

/// Request body as handed to the driver.
#[derive(Debug)]
pub enum OutboundBody {
    Empty,
    Full(Bytes),
    /// Chunks follow as [`DriverCommand::BodyChunk`].
    Streaming,
}

/// A request whose header fields are already in wire order.
#[derive(Debug)]
pub struct PreparedRequest {
    pub fields: Vec<(String, String)>,
    pub body: OutboundBody,
    pub trailers: Vec<(String, String)>,
}

/// Command sent from a handle to the driver.
#[derive(Debug)]
pub enum DriverCommand {
    SendRequest {
        request_id: u64,
        request: PreparedRequest,
        head_tx: oneshot::Sender<Result<ResponseHead>>,
    },
    /// Next piece of a streaming body; `None` ends it. `written_tx` gets
    /// `true` once the chunk is on the wire, `false` if it was dropped.
    BodyChunk {
        request_id: u64,
        chunk: Option<Bytes>,
        written_tx: oneshot::Sender<Result<bool>>,
    },
    Cancel {
        request_id: u64,
    },
    /// The caller consumed `len` body bytes of `stream_id`.
    ReleaseCapacity {
        stream_id: u32,
        len: usize,
    },
    Ping {
        tx: oneshot::Sender<Result<Duration>>,
    },
    /// Send GOAWAY, finish in-flight streams, then exit.
    Shutdown,
    /// Fail everything and exit now.
    Close,
}

/// A request waiting for a stream slot.
struct PendingRequest {
    request_id: u64,
    fields: Vec<(String, String)>,
    stream: Stream,
}

/// Header block being reassembled from HEADERS + CONTINUATION.
struct PartialBlock {
    stream_id: u32,
    buf: BytesMut,
    end_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    Idle,
    HealthCheck,
    PingTimeout,
}

enum Event {
    Frame(Result<Option<Frame>>),
    Command(Option<DriverCommand>),
    Timer(Timer),
}

/// Marks the connection closed however `run` ends, unwinding included.
struct CloseOnExit(std::sync::Arc<Shared>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.mark_closed();
    }
}

/// Why the loop stopped.
enum Exit {
    Graceful,
    Fatal(Error),
}

pub struct Driver<S> {
    conn: H2Connection<S>,
    command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    commands_open: bool,
    shared: std::sync::Arc<Shared>,
    streams: BTreeMap<u32, Stream>,
    /// request id -> stream id
    requests: HashMap<u64, u32>,
    pending: VecDeque<PendingRequest>,
    next_stream_id: u32,
    partial: Option<PartialBlock>,
    pings: HashMap<[u8; 8], (Instant, Option<oneshot::Sender<Result<Duration>>>)>,
    health_ping: Option<[u8; 8]>,
    ping_deadline: Option<Instant>,
    last_read: Instant,
    idle_since: Option<Instant>,
    idle_timeout: Option<Duration>,
    read_idle: Option<Duration>,
    ping_timeout: Duration,
    /// We sent GOAWAY or were asked to shut down.
    closing: bool,
    goaway: Option<GoAwayFrame>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        conn: H2Connection<S>,
        command_rx: mpsc::UnboundedReceiver<DriverCommand>,
        shared: std::sync::Arc<Shared>,
        first_stream_id: u32,
        timeouts: &Timeouts,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn,
            command_rx,
            commands_open: true,
            shared,
            streams: BTreeMap::new(),
            requests: HashMap::new(),
            pending: VecDeque::new(),
            next_stream_id: first_stream_id,
            partial: None,
            pings: HashMap::new(),
            health_ping: None,
            ping_deadline: None,
            last_read: now,
            idle_since: Some(now),
            idle_timeout: timeouts.idle_connection,
            read_idle: timeouts.read_idle,
            ping_timeout: timeouts.ping_timeout(),
            closing: false,
            goaway: None,
        }
    }

    /// Run until the connection closes. Every stream still open when this
    /// returns has been failed.
    pub async fn run(mut self) {
        let _closed = CloseOnExit(self.shared.clone());
        let exit = self.drive().await;
        match exit {
            Exit::Graceful => {
                tracing::debug!("connection closed");
                self.fail_all(Error::connection_closed("connection closed"));
            }
            Exit::Fatal(err) => {
                if matches!(err, Error::Io(_) | Error::ConnectionClosed(_)) {
                    tracing::debug!(error = %err, "connection lost");
                } else {
                    tracing::error!(error = %err, "connection failed");
                }
                if matches!(
                    err,
                    Error::Protocol { .. } | Error::FlowControl(_) | Error::InvalidSetting { .. }
                ) {
                    let goaway = GoAwayFrame::new(0, err.h2_code())
                        .with_debug_data(Bytes::from(err.to_string()));
                    self.conn.queue(&goaway.serialize());
                    let _ = self.conn.flush().await;
                }
                self.fail_all(err);
            }
        }
        self.conn.shutdown().await;
    }

    async fn drive(&mut self) -> Exit {
        loop {
            if self.should_exit() {
                return Exit::Graceful;
            }
            let timer = self.next_timer();
            let (at, kind) = timer.unwrap_or_else(|| {
                (Instant::now() + Duration::from_secs(86400), Timer::Idle)
            });

            let event = tokio::select! {
                biased;
                frame = self.conn.read_frame() => Event::Frame(frame),
                command = self.command_rx.recv(), if self.commands_open => Event::Command(command),
                _ = sleep_until(at), if timer.is_some() => Event::Timer(kind),
            };

            let result = match event {
                Event::Frame(Ok(Some(frame))) => {
                    self.last_read = Instant::now();
                    self.on_frame(frame)
                }
                Event::Frame(Ok(None)) => {
                    if self.streams.is_empty() && (self.closing || self.goaway.is_some()) {
                        return Exit::Graceful;
                    }
                    Err(Error::connection_closed("peer closed the connection"))
                }
                Event::Frame(Err(e)) => Err(e),
                Event::Command(Some(command)) => self.on_command(command),
                Event::Command(None) => {
                    self.commands_open = false;
                    Ok(())
                }
                Event::Timer(kind) => match self.on_timer(kind) {
                    Ok(true) => return Exit::Graceful,
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                },
            };
            let result = match result {
                Ok(()) => self.conn.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                return Exit::Fatal(e);
            }
        }
    }

    fn should_exit(&self) -> bool {
        let draining = self.closing || self.goaway.is_some() || !self.commands_open;
        draining && self.streams.is_empty() && self.pending.is_empty()
    }

    fn next_timer(&self) -> Option<(Instant, Timer)> {
        let mut next: Option<(Instant, Timer)> = None;
        let mut consider = |at: Instant, kind: Timer| {
            if next.map_or(true, |(best, _)| at < best) {
                next = Some((at, kind));
            }
        };
        if let (Some(timeout), Some(since)) = (self.idle_timeout, self.idle_since) {
            consider(since + timeout, Timer::Idle);
        }
        match self.ping_deadline {
            Some(deadline) => consider(deadline, Timer::PingTimeout),
            None => {
                if let Some(read_idle) = self.read_idle {
                    consider(self.last_read + read_idle, Timer::HealthCheck);
                }
            }
        }
        next
    }

    /// Returns `true` when the connection should close.
    fn on_timer(&mut self, timer: Timer) -> Result<bool> {
        match timer {
            Timer::Idle => {
                if self.shared.close_if_idle() {
                    tracing::debug!("closing idle connection");
                    return Ok(true);
                }
                // A caller holds a slot but has not sent its request yet.
                self.idle_since = Some(Instant::now());
                Ok(false)
            }
            Timer::HealthCheck => {
                let data = ping_payload()?;
                tracing::trace!("read idle, sending health check PING");
                self.pings.insert(data, (Instant::now(), None));
                self.health_ping = Some(data);
                self.ping_deadline = Some(Instant::now() + self.ping_timeout);
                self.conn.queue(&PingFrame::new(data).serialize());
                Ok(false)
            }
            Timer::PingTimeout => Err(Error::PingTimeout(self.ping_timeout)),
        }
    }

    // ---- inbound frames ----

    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        if let Some(partial) = &self.partial {
            let continues = matches!(&frame, Frame::Continuation(c) if c.stream_id == partial.stream_id);
            if !continues {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("expected CONTINUATION for stream {}", partial.stream_id),
                ));
            }
        }
        match frame {
            Frame::Settings(settings) => self.on_settings(settings),
            Frame::WindowUpdate(update) => self.on_window_update(update),
            Frame::Data(data) => self.on_data(data),
            Frame::Headers(headers) => self.on_headers(headers),
            Frame::Continuation(cont) => {
                let Some(mut partial) = self.partial.take() else {
                    return Err(Error::protocol(
                        ErrorCode::ProtocolError,
                        "CONTINUATION without a preceding HEADERS",
                    ));
                };
                partial.buf.extend_from_slice(&cont.header_fragment);
                if cont.end_headers {
                    self.on_header_block(partial.stream_id, partial.buf.freeze(), partial.end_stream)
                } else {
                    self.partial = Some(partial);
                    Ok(())
                }
            }
            Frame::RstStream(rst) => self.on_rst_stream(rst),
            Frame::GoAway(goaway) => self.on_goaway(goaway),
            Frame::Ping(ping) => self.on_ping(ping),
            Frame::PushPromise { stream_id } => Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!("PUSH_PROMISE on stream {} with push disabled", stream_id),
            )),
            Frame::Priority(_) => Ok(()),
            Frame::Unknown {
                frame_type,
                stream_id,
            } => {
                tracing::trace!(frame_type, stream_id, "ignoring unknown frame");
                Ok(())
            }
        }
    }

    fn on_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            if !self.conn.want_settings_ack {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    "unexpected SETTINGS ACK",
                ));
            }
            self.conn.want_settings_ack = false;
            return Ok(());
        }

        let mut seen: Vec<u16> = Vec::with_capacity(frame.settings.len());
        for setting in &frame.settings {
            let id = u16::from(setting.id);
            if seen.contains(&id) {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("duplicate setting {}", setting.id),
                ));
            }
            seen.push(id);
            setting.validate()?;
        }

        let mut saw_max_concurrent = false;
        for setting in &frame.settings {
            tracing::trace!(%setting, "peer setting");
            match setting.id {
                SettingId::HeaderTableSize => {
                    self.conn.peer.header_table_size = setting.value;
                    let limit = self.conn.local.encoder_table_limit;
                    self.conn.encoder.set_max_table_size(setting.value, limit);
                }
                SettingId::MaxConcurrentStreams => {
                    self.conn.peer.max_concurrent_streams = setting.value;
                    saw_max_concurrent = true;
                }
                SettingId::InitialWindowSize => {
                    let delta =
                        setting.value as i64 - self.conn.peer.initial_window_size as i64;
                    for stream in self.streams.values_mut() {
                        stream.send_window.adjust(delta)?;
                    }
                    for pending in self.pending.iter_mut() {
                        pending.stream.send_window.adjust(delta)?;
                    }
                    self.conn.peer.initial_window_size = setting.value;
                }
                SettingId::MaxFrameSize => self.conn.peer.max_frame_size = setting.value,
                SettingId::MaxHeaderListSize => {
                    self.conn.peer.max_header_list_size = setting.value as u64
                }
                SettingId::EnablePush | SettingId::Unknown(_) => {}
            }
        }
        if !self.conn.seen_settings {
            self.conn.seen_settings = true;
            if !saw_max_concurrent {
                self.conn.peer.max_concurrent_streams = self
                    .conn
                    .local
                    .max_concurrent_streams
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_STREAMS);
            }
        }
        self.shared
            .set_max_concurrent(self.conn.peer.max_concurrent_streams);
        self.conn.queue(&SettingsFrame::ack().serialize());

        self.start_pending()?;
        self.write_all_bodies()
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) -> Result<()> {
        if frame.stream_id == 0 {
            if frame.increment == 0 {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE with zero increment on the connection",
                ));
            }
            self.conn.send_window.add(frame.increment)?;
            return self.write_all_bodies();
        }
        if frame.increment == 0 {
            self.reset_stream(
                frame.stream_id,
                ErrorCode::ProtocolError,
                Error::protocol(ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment"),
            );
            return Ok(());
        }
        if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
            stream.send_window.add(frame.increment)?;
            self.write_body(frame.stream_id)?;
        }
        Ok(())
    }

    fn on_data(&mut self, frame: DataFrame) -> Result<()> {
        let id = frame.stream_id;
        self.conn.recv_window.take(frame.flow_len)?;

        let Some(stream) = self.streams.get_mut(&id) else {
            if id >= self.next_stream_id {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("DATA on idle stream {}", id),
                ));
            }
            // Stream already finished or reset: give the credit straight back.
            return self.release_connection(frame.flow_len);
        };

        if !stream.head_delivered || stream.remote_closed() {
            let code = if stream.head_delivered {
                ErrorCode::StreamClosed
            } else {
                ErrorCode::ProtocolError
            };
            self.release_connection(frame.flow_len)?;
            self.reset_stream(
                id,
                code,
                Error::protocol(code, format!("unexpected DATA on stream {}", id)),
            );
            return Ok(());
        }

        stream.recv_window.take(frame.flow_len)?;
        let padding = frame.flow_len - frame.data.len() as u32;
        let mut refund = padding;
        if !frame.data.is_empty() && !stream.deliver(BodyEvent::Data(frame.data.clone())) {
            // Nobody is reading; do not let the window drain.
            refund += frame.data.len() as u32;
        }
        if refund > 0 {
            self.release_connection(refund)?;
            self.release_stream(id, refund)?;
        }
        if frame.end_stream {
            self.on_remote_end(id);
        }
        Ok(())
    }

    fn on_headers(&mut self, frame: HeadersFrame) -> Result<()> {
        if frame.end_headers {
            return self.on_header_block(frame.stream_id, frame.header_block, frame.end_stream);
        }
        let mut buf = BytesMut::with_capacity(frame.header_block.len());
        buf.extend_from_slice(&frame.header_block);
        self.partial = Some(PartialBlock {
            stream_id: frame.stream_id,
            buf,
            end_stream: frame.end_stream,
        });
        Ok(())
    }

    fn on_header_block(&mut self, id: u32, block: Bytes, end_stream: bool) -> Result<()> {
        // Always decode so the HPACK table stays in sync.
        let decoded = self.conn.decoder.decode(&block)?;

        let Some(stream) = self.streams.get_mut(&id) else {
            if id >= self.next_stream_id {
                return Err(Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("HEADERS on idle stream {}", id),
                ));
            }
            return Ok(());
        };

        if decoded.oversized {
            let limit = self.conn.local.max_header_list_size;
            self.reset_stream(
                id,
                ErrorCode::ProtocolError,
                Error::protocol(
                    ErrorCode::ProtocolError,
                    format!("response header list exceeds {} bytes", limit),
                ),
            );
            return Ok(());
        }

        let mut status = None;
        let mut headers = Vec::with_capacity(decoded.fields.len());
        for (name, value) in decoded.fields {
            if name == ":status" {
                status = parse_status(&value);
            } else if !name.starts_with(':') {
                headers.push((name, value));
            }
        }

        if stream.head_delivered {
            if !end_stream {
                self.reset_stream(
                    id,
                    ErrorCode::ProtocolError,
                    Error::protocol(ErrorCode::ProtocolError, "trailers without END_STREAM"),
                );
                return Ok(());
            }
            stream.deliver(BodyEvent::Trailers(headers));
        } else {
            let Some(status) = status else {
                self.reset_stream(
                    id,
                    ErrorCode::ProtocolError,
                    Error::protocol(ErrorCode::ProtocolError, "missing or malformed :status"),
                );
                return Ok(());
            };
            if (100..200).contains(&status) {
                if end_stream {
                    self.reset_stream(
                        id,
                        ErrorCode::ProtocolError,
                        Error::protocol(ErrorCode::ProtocolError, "1xx response with END_STREAM"),
                    );
                }
                return Ok(());
            }
            tracing::trace!(stream_id = id, status, "response head");
            stream.deliver_head(status, headers);
            if status >= 300 {
                stream.abort_body();
            }
        }
        if end_stream {
            self.on_remote_end(id);
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, frame: RstStreamFrame) -> Result<()> {
        let id = frame.stream_id;
        match self.streams.remove(&id) {
            Some(mut stream) => {
                tracing::debug!(stream_id = id, code = %frame.error_code, "stream reset by peer");
                stream.fail(Error::StreamReset {
                    stream_id: id,
                    code: frame.error_code,
                    remote: true,
                });
                self.requests.remove(&stream.request_id);
                self.on_stream_removed()
            }
            None if id >= self.next_stream_id => Err(Error::protocol(
                ErrorCode::ProtocolError,
                format!("RST_STREAM on idle stream {}", id),
            )),
            None => Ok(()),
        }
    }

    fn on_goaway(&mut self, frame: GoAwayFrame) -> Result<()> {
        let debug_text = String::from_utf8_lossy(&frame.debug_data).into_owned();
        tracing::debug!(
            last_stream_id = frame.last_stream_id,
            code = %frame.error_code,
            debug = %debug_text,
            "GOAWAY received"
        );
        self.shared.mark_closing();
        let unprocessed = || Error::GoAway {
            last_stream_id: frame.last_stream_id,
            code: frame.error_code,
            debug: debug_text.clone(),
        };
        let doomed: Vec<u32> = self
            .streams
            .range(frame.last_stream_id.saturating_add(1)..)
            .map(|(id, _)| *id)
            .collect();
        for id in doomed {
            if let Some(mut stream) = self.streams.remove(&id) {
                stream.fail(unprocessed());
                self.requests.remove(&stream.request_id);
            }
        }
        for mut pending in self.pending.drain(..) {
            pending.stream.fail(unprocessed());
        }
        self.goaway = Some(frame);
        Ok(())
    }

    fn on_ping(&mut self, frame: PingFrame) -> Result<()> {
        if !frame.ack {
            self.conn.queue(&PingFrame::ack(frame.opaque_data).serialize());
            return Ok(());
        }
        if let Some((sent, waiter)) = self.pings.remove(&frame.opaque_data) {
            if self.health_ping == Some(frame.opaque_data) {
                self.health_ping = None;
                self.ping_deadline = None;
            }
            if let Some(tx) = waiter {
                let _ = tx.send(Ok(sent.elapsed()));
            }
        }
        Ok(())
    }

    /// Peer sent END_STREAM.
    fn on_remote_end(&mut self, id: u32) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.on_end_stream_received();
        if !stream.end_stream_sent() {
            // The response is complete but our body is not: stop sending.
            stream.abort_body();
            self.conn
                .queue(&RstStreamFrame::new(id, ErrorCode::Cancel).serialize());
            stream.on_end_stream_sent();
        }
        self.close_if_done(id);
    }

    // ---- commands ----

    fn on_command(&mut self, command: DriverCommand) -> Result<()> {
        match command {
            DriverCommand::SendRequest {
                request_id,
                request,
                head_tx,
            } => self.on_send_request(request_id, request, head_tx),
            DriverCommand::BodyChunk {
                request_id,
                chunk,
                written_tx,
            } => self.on_body_chunk(request_id, chunk, written_tx),
            DriverCommand::Cancel { request_id } => {
                self.on_cancel(request_id);
                Ok(())
            }
            DriverCommand::ReleaseCapacity { stream_id, len } => {
                let len = len as u32;
                self.release_connection(len)?;
                self.release_stream(stream_id, len)
            }
            DriverCommand::Ping { tx } => {
                let data = ping_payload()?;
                self.pings.insert(data, (Instant::now(), Some(tx)));
                self.conn.queue(&PingFrame::new(data).serialize());
                Ok(())
            }
            DriverCommand::Shutdown => {
                if !self.closing {
                    tracing::debug!("graceful shutdown");
                    self.closing = true;
                    self.shared.mark_closing();
                    self.conn
                        .queue(&GoAwayFrame::new(0, ErrorCode::NoError).serialize());
                    for mut pending in self.pending.drain(..) {
                        pending.stream.fail(Error::ConnectionUnusable);
                    }
                }
                Ok(())
            }
            DriverCommand::Close => {
                self.closing = true;
                self.shared.mark_closing();
                self.conn
                    .queue(&GoAwayFrame::new(0, ErrorCode::NoError).serialize());
                self.fail_all(Error::connection_closed("connection closed by client"));
                Ok(())
            }
        }
    }

    fn on_send_request(
        &mut self,
        request_id: u64,
        request: PreparedRequest,
        head_tx: oneshot::Sender<Result<ResponseHead>>,
    ) -> Result<()> {
        if self.closing || self.goaway.is_some() {
            let _ = head_tx.send(Err(Error::ConnectionUnusable));
            return Ok(());
        }
        let mut stream = Stream::new(
            0,
            request_id,
            self.conn.peer.initial_window_size,
            self.conn.local.initial_window_size,
            head_tx,
        );
        match request.body {
            OutboundBody::Empty => stream.outbound.finished = true,
            OutboundBody::Full(data) => {
                stream.outbound.queue.push_back(OutboundChunk { data, ack: None });
                stream.outbound.finished = true;
            }
            OutboundBody::Streaming => {}
        }
        stream.outbound.trailers = request.trailers;

        let pending = PendingRequest {
            request_id,
            fields: request.fields,
            stream,
        };
        if self.streams.len() as u64 >= self.conn.peer.max_concurrent_streams as u64 {
            tracing::trace!(request_id, "stream ceiling reached, queueing request");
            self.pending.push_back(pending);
            return Ok(());
        }
        self.start_stream(pending)
    }

    fn start_pending(&mut self) -> Result<()> {
        while (self.streams.len() as u64) < self.conn.peer.max_concurrent_streams as u64 {
            match self.pending.pop_front() {
                Some(pending) => self.start_stream(pending)?,
                None => break,
            }
        }
        Ok(())
    }

    /// Assign a stream id and write HEADERS. Local failures go to the caller
    /// and leave the HPACK encoder untouched.
    fn start_stream(&mut self, pending: PendingRequest) -> Result<()> {
        let PendingRequest {
            request_id,
            fields,
            mut stream,
        } = pending;

        if self.next_stream_id > MAX_STREAM_ID {
            self.closing = true;
            self.shared.mark_closing();
            stream.fail(Error::ConnectionUnusable);
            return Ok(());
        }
        if let Err(e) = check_header_list_size(&fields, self.conn.peer.max_header_list_size) {
            stream.fail(e);
            return Ok(());
        }
        let block = self.conn.encoder.encode(&fields);

        let id = self.next_stream_id;
        self.next_stream_id += 2;
        let end_stream = stream.outbound.finished
            && !stream.outbound.has_data()
            && stream.outbound.trailers.is_empty();
        self.conn.queue_header_block(id, block, end_stream);
        tracing::trace!(stream_id = id, request_id, end_stream, "HEADERS queued");

        stream.id = id;
        stream.on_headers_sent();
        if end_stream {
            stream.outbound.queue.clear();
            stream.on_end_stream_sent();
        }
        self.streams.insert(id, stream);
        self.requests.insert(request_id, id);
        self.idle_since = None;
        if self.next_stream_id > MAX_STREAM_ID {
            self.shared.mark_closing();
        }
        self.write_body(id)
    }

    fn on_body_chunk(
        &mut self,
        request_id: u64,
        chunk: Option<Bytes>,
        written_tx: oneshot::Sender<Result<bool>>,
    ) -> Result<()> {
        let stream_id = self.requests.get(&request_id).copied();
        let stream = match stream_id {
            Some(id) => self.streams.get_mut(&id),
            None => self
                .pending
                .iter_mut()
                .find(|p| p.request_id == request_id)
                .map(|p| &mut p.stream),
        };
        let Some(stream) = stream else {
            let _ = written_tx.send(Ok(false));
            return Ok(());
        };
        if stream.body_aborted || stream.end_stream_sent() || stream.outbound.finished {
            let _ = written_tx.send(Ok(false));
            return Ok(());
        }
        match chunk {
            Some(data) => stream.outbound.queue.push_back(OutboundChunk {
                data,
                ack: Some(written_tx),
            }),
            None => {
                stream.outbound.finished = true;
                let _ = written_tx.send(Ok(true));
            }
        }
        match stream_id {
            Some(id) => self.write_body(id),
            None => Ok(()),
        }
    }

    fn on_cancel(&mut self, request_id: u64) {
        if let Some(pos) = self.pending.iter().position(|p| p.request_id == request_id) {
            if let Some(mut pending) = self.pending.remove(pos) {
                pending.stream.fail(Error::Canceled);
            }
            return;
        }
        let Some(id) = self.requests.get(&request_id).copied() else {
            return;
        };
        tracing::trace!(stream_id = id, request_id, "request canceled");
        self.reset_stream(id, ErrorCode::Cancel, Error::Canceled);
    }

    // ---- outbound body ----

    fn write_all_bodies(&mut self) -> Result<()> {
        let ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.end_stream_sent() && !s.body_aborted)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.write_body(id)?;
        }
        Ok(())
    }

    /// Write as much of a stream's body as flow control allows.
    fn write_body(&mut self, id: u32) -> Result<()> {
        let max_frame = self.conn.peer.max_frame_size;
        loop {
            let Some(stream) = self.streams.get_mut(&id) else {
                return Ok(());
            };
            if stream.end_stream_sent() || stream.body_aborted {
                return Ok(());
            }

            let last_queued = stream.outbound.queue.len() == 1;
            if let Some(chunk) = stream.outbound.queue.front_mut() {
                if chunk.data.is_empty() {
                    if let Some(chunk) = stream.outbound.queue.pop_front() {
                        if let Some(ack) = chunk.ack {
                            let _ = ack.send(Ok(true));
                        }
                    }
                    continue;
                }
                let allowed = self
                    .conn
                    .send_window
                    .sendable()
                    .min(stream.send_window.sendable())
                    .min(max_frame) as usize;
                if allowed == 0 {
                    return Ok(());
                }
                let n = allowed.min(chunk.data.len());
                let data = chunk.data.split_to(n);
                let drained = chunk.data.is_empty();
                let end_stream = drained
                    && last_queued
                    && stream.outbound.finished
                    && stream.outbound.trailers.is_empty();

                self.conn.send_window.take(n as u32);
                stream.send_window.take(n as u32);
                self.conn
                    .queue(&DataFrame::new(id, data, end_stream).serialize());
                if drained {
                    if let Some(chunk) = stream.outbound.queue.pop_front() {
                        if let Some(ack) = chunk.ack {
                            let _ = ack.send(Ok(true));
                        }
                    }
                }
                if end_stream {
                    stream.on_end_stream_sent();
                    self.close_if_done(id);
                    return Ok(());
                }
                continue;
            }

            if !stream.outbound.finished {
                return Ok(());
            }
            if stream.outbound.trailers.is_empty() {
                self.conn
                    .queue(&DataFrame::new(id, Bytes::new(), true).serialize());
            } else {
                let trailers = std::mem::take(&mut stream.outbound.trailers);
                let block = self.conn.encoder.encode(&trailers);
                self.conn.queue_header_block(id, block, true);
            }
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.on_end_stream_sent();
            }
            self.close_if_done(id);
            return Ok(());
        }
    }

    // ---- stream bookkeeping ----

    /// Send RST_STREAM and fail the stream locally.
    fn reset_stream(&mut self, id: u32, code: ErrorCode, err: Error) {
        let Some(mut stream) = self.streams.remove(&id) else {
            return;
        };
        if !stream.is_closed() {
            self.conn.queue(&RstStreamFrame::new(id, code).serialize());
        }
        stream.fail(err);
        self.requests.remove(&stream.request_id);
        // Only fails if a pending request cannot be encoded, which is local.
        let _ = self.on_stream_removed();
    }

    fn close_if_done(&mut self, id: u32) {
        let done = self.streams.get(&id).is_some_and(|s| s.is_closed());
        if !done {
            return;
        }
        if let Some(stream) = self.streams.remove(&id) {
            self.requests.remove(&stream.request_id);
            tracing::trace!(stream_id = id, "stream closed");
        }
        let _ = self.on_stream_removed();
    }

    fn on_stream_removed(&mut self) -> Result<()> {
        self.start_pending()?;
        if self.streams.is_empty() && self.pending.is_empty() {
            self.idle_since = Some(Instant::now());
        }
        Ok(())
    }

    fn release_connection(&mut self, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if let Some(increment) = self.conn.recv_window.release(len)? {
            self.conn
                .queue(&WindowUpdateFrame::new(0, increment).serialize());
        }
        Ok(())
    }

    fn release_stream(&mut self, id: u32, len: u32) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        if len == 0 || stream.remote_closed() {
            return Ok(());
        }
        if let Some(increment) = stream.recv_window.release(len)? {
            self.conn
                .queue(&WindowUpdateFrame::new(id, increment).serialize());
        }
        Ok(())
    }

    /// Fail every stream, queued request and ping with `err`.
    fn fail_all(&mut self, err: Error) {
        // Closed before any waiter wakes so a retry cannot pick this connection.
        self.shared.mark_closed();
        for (_, mut stream) in std::mem::take(&mut self.streams) {
            stream.fail(err.clone());
        }
        self.requests.clear();
        for mut pending in self.pending.drain(..) {
            pending.stream.fail(err.clone());
        }
        for (_, (_, waiter)) in self.pings.drain() {
            if let Some(tx) = waiter {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }
}

fn parse_status(value: &str) -> Option<u16> {
    if value.len() != 3 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn ping_payload() -> Result<[u8; 8]> {
    let mut data = [0u8; 8];
    getrandom::fill(&mut data).map_err(|e| Error::connection(format!("RNG error: {}", e)))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("200"), Some(200));
        assert_eq!(parse_status("20"), None);
        assert_eq!(parse_status("2x0"), None);
        assert_eq!(parse_status("+20"), None);
    }

    #[test]
    fn test_ping_payload_varies() {
        let a = ping_payload().unwrap();
        let b = ping_payload().unwrap();
        assert_ne!(a, b);
    }
}
