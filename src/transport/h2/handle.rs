//! HTTP/2 connection handle - non-blocking interface for sending requests.
//!
//! The handle sends commands to the driver task and receives responses via
//! channels. Handles are cheap to clone and all clones share one connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::Version;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintConfig;
use crate::request::{Body, Request};
use crate::response::Response;

use super::driver::{DriverCommand, OutboundBody, PreparedRequest};
use super::headers::{request_fields, wire_fields, RequestHead};
use super::stream::{BodyEvent, ResponseHead};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Slot accounting shared between a connection's handles, its driver and
/// the pool.
#[derive(Debug)]
pub(crate) struct ConnState {
    pub in_flight: usize,
    pub max_concurrent: u32,
    pub closing: bool,
    pub closed: bool,
    pub single_use: bool,
    pub used: bool,
    pub idle_since: Option<Instant>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<ConnState>,
    notify: Arc<Notify>,
}

impl Shared {
    pub fn new(single_use: bool, notify: Arc<Notify>) -> Self {
        Self {
            state: Mutex::new(ConnState {
                in_flight: 0,
                max_concurrent: u32::MAX,
                closing: false,
                closed: false,
                single_use,
                used: false,
                idle_since: Some(Instant::now()),
            }),
            notify,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a new stream may be opened right now.
    fn can_take_new_request(state: &ConnState) -> bool {
        !state.closing
            && !state.closed
            && !(state.single_use && state.used)
            && (state.in_flight as u64) < state.max_concurrent as u64
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.lock();
        if !Self::can_take_new_request(&state) {
            return false;
        }
        state.in_flight += 1;
        state.used = true;
        state.idle_since = None;
        true
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if state.in_flight == 0 {
                state.idle_since = Some(Instant::now());
            }
            if state.single_use && state.in_flight == 0 {
                state.closing = true;
            }
        }
        self.notify.notify_waiters();
    }

    pub fn set_max_concurrent(&self, max: u32) {
        self.lock().max_concurrent = max;
        self.notify.notify_waiters();
    }

    pub fn mark_closing(&self) {
        self.lock().closing = true;
        self.notify.notify_waiters();
    }

    pub fn mark_closed(&self) {
        {
            let mut state = self.lock();
            state.closing = true;
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Close the connection if no caller holds a slot.
    pub fn close_if_idle(&self) -> bool {
        let closed = {
            let mut state = self.lock();
            if state.in_flight == 0 {
                state.closing = true;
                state.closed = true;
                true
            } else {
                false
            }
        };
        if closed {
            self.notify.notify_waiters();
        }
        closed
    }
}

/// A reserved stream slot on one connection. Dropping it frees the slot.
#[derive(Debug)]
pub struct StreamSlot {
    shared: Arc<Shared>,
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Sends `Cancel` for a request whose future is dropped before completion.
struct CancelOnDrop {
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    request_id: u64,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.command_tx.send(DriverCommand::Cancel {
                request_id: self.request_id,
            });
        }
    }
}

/// HTTP/2 connection handle for sending requests.
#[derive(Clone)]
pub struct H2Handle {
    id: u64,
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    shared: Arc<Shared>,
    config: Arc<FingerprintConfig>,
    default_user_agent: Arc<str>,
    next_request_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for H2Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Handle")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl H2Handle {
    pub(crate) fn new(
        command_tx: mpsc::UnboundedSender<DriverCommand>,
        shared: Arc<Shared>,
        config: Arc<FingerprintConfig>,
        default_user_agent: String,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            command_tx,
            shared,
            config,
            default_user_agent: Arc::from(default_user_agent),
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Reserve a stream slot, or `None` if the connection cannot take another
    /// request (closing, single-use and used, or at the peer's stream ceiling).
    pub fn try_reserve(&self) -> Option<StreamSlot> {
        self.shared.try_reserve().then(|| StreamSlot {
            shared: self.shared.clone(),
        })
    }

    pub fn can_take_new_request(&self) -> bool {
        Shared::can_take_new_request(&self.shared.lock())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight
    }

    /// When the last request finished, if none is running now.
    pub fn idle_since(&self) -> Option<Instant> {
        let state = self.shared.lock();
        if state.closed {
            return None;
        }
        state.idle_since
    }

    /// Send a request on this connection, reserving a slot first.
    pub async fn send_request(&self, req: Request) -> Result<Response> {
        let slot = self.try_reserve().ok_or(Error::ConnectionUnusable)?;
        self.send_request_with_slot(slot, req).await
    }

    /// Send a request using a slot reserved by [`try_reserve`](Self::try_reserve).
    ///
    /// The response body is read to completion. Canceling the request's
    /// token resets the stream until the response head arrives; after that
    /// the response is delivered in full.
    pub async fn send_request_with_slot(
        &self,
        slot: StreamSlot,
        mut req: Request,
    ) -> Result<Response> {
        let _slot = slot;
        let cancel = req.cancel_token().clone();
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let scheme = req.url().scheme().to_string();
        let authority = req.authority();
        let path = req.path();
        let fields = {
            let head = RequestHead {
                method: req.method().as_str(),
                scheme: &scheme,
                authority: &authority,
                path: &path,
                headers: req.headers(),
                trailers: req.trailers(),
                content_length: req.content_length(),
            };
            request_fields(&head, &self.config, &self.default_user_agent)?
        };
        let trailers = wire_fields(req.trailers().to_vec());
        let (body, body_rx) = match req.take_body() {
            Body::Empty => (OutboundBody::Empty, None),
            Body::Full(bytes) if bytes.is_empty() => (OutboundBody::Empty, None),
            Body::Full(bytes) => (OutboundBody::Full(bytes), None),
            Body::Stream(rx) => (OutboundBody::Streaming, Some(rx)),
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (head_tx, mut head_rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::SendRequest {
                request_id,
                request: PreparedRequest {
                    fields: wire_fields(fields),
                    body,
                    trailers,
                },
                head_tx,
            })
            .map_err(|_| Error::ConnectionUnusable)?;
        let mut guard = CancelOnDrop {
            command_tx: self.command_tx.clone(),
            request_id,
            armed: true,
        };

        if let Some(rx) = body_rx {
            tokio::spawn(pump_body(
                self.command_tx.clone(),
                request_id,
                rx,
                cancel.clone(),
            ));
        }

        let head = tokio::select! {
            biased;
            _ = cancel.cancelled() => match head_rx.try_recv() {
                // The head beat the cancellation; honor it.
                Ok(head) => head?,
                Err(_) => return Err(Error::Canceled),
            },
            head = &mut head_rx => head
                .map_err(|_| Error::connection_closed("connection driver exited"))??,
        };

        let ResponseHead {
            stream_id,
            status,
            headers,
            body: mut body_events,
        } = head;
        // Cancellation stops applying once the head is in. The total
        // deadline still drops this future.
        let (body, trailers) = collect_body(&self.command_tx, stream_id, &mut body_events).await?;
        guard.armed = false;

        Ok(Response::new(status, headers, body, Version::HTTP_2)
            .with_trailers(trailers)
            .with_url(req.url().as_str()))
    }

    /// Round-trip a PING and report the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(DriverCommand::Ping { tx })
            .map_err(|_| Error::connection_closed("connection driver exited"))?;
        rx.await
            .map_err(|_| Error::connection_closed("connection driver exited"))?
    }

    /// Send GOAWAY and wait for in-flight streams to finish.
    pub async fn shutdown(&self) {
        if self.command_tx.send(DriverCommand::Shutdown).is_err() {
            return;
        }
        self.wait_closed().await;
    }

    /// Fail all streams and close the connection now.
    pub async fn close(&self) {
        if self.command_tx.send(DriverCommand::Close).is_err() {
            return;
        }
        self.wait_closed().await;
    }

    /// Close the connection only if no request holds a slot.
    pub fn close_if_idle(&self) -> bool {
        if !self.shared.close_if_idle() {
            return false;
        }
        let _ = self.command_tx.send(DriverCommand::Close);
        true
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() || self.command_tx.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Read body events until END_STREAM, returning flow-control credit as
/// bytes are consumed.
async fn collect_body(
    command_tx: &mpsc::UnboundedSender<DriverCommand>,
    stream_id: u32,
    events: &mut mpsc::UnboundedReceiver<Result<BodyEvent>>,
) -> Result<(Bytes, Vec<(String, String)>)> {
    let mut body = BytesMut::new();
    let mut trailers = Vec::new();
    loop {
        match events.recv().await {
            Some(Ok(BodyEvent::Data(data))) => {
                body.extend_from_slice(&data);
                let _ = command_tx.send(DriverCommand::ReleaseCapacity {
                    stream_id,
                    len: data.len(),
                });
            }
            Some(Ok(BodyEvent::Trailers(fields))) => trailers = fields,
            Some(Err(e)) => return Err(e),
            None => return Ok((body.freeze(), trailers)),
        }
    }
}

/// Feed a streaming body to the driver one acknowledged chunk at a time.
async fn pump_body(
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    request_id: u64,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            chunk = rx.recv() => chunk,
        };
        let last = chunk.is_none();
        let (written_tx, written_rx) = oneshot::channel();
        let sent = command_tx.send(DriverCommand::BodyChunk {
            request_id,
            chunk,
            written_tx,
        });
        if sent.is_err() {
            return;
        }
        match written_rx.await {
            Ok(Ok(true)) if !last => continue,
            _ => return,
        }
    }
}
