//! Per-stream state owned by the connection driver.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::transport::h2::flow::{FlowWindow, InflowWindow};

/// Lifecycle of a client stream (RFC 9113 Section 5.1, client side only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered, HEADERS not yet written.
    Idle,
    /// HEADERS written, body may still be flowing.
    Open,
    /// We sent END_STREAM; waiting on the response.
    HalfClosedLocal,
    /// Peer sent END_STREAM; we still owe END_STREAM or a reset.
    HalfClosedRemote,
    Closed,
}

/// Response status and headers, plus the channel the body arrives on.
#[derive(Debug)]
pub struct ResponseHead {
    pub stream_id: u32,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: mpsc::UnboundedReceiver<Result<BodyEvent>>,
}

/// Events after the response head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    Data(Bytes),
    Trailers(Vec<(String, String)>),
}

/// A body chunk waiting for flow-control credit.
#[derive(Debug)]
pub struct OutboundChunk {
    pub data: Bytes,
    /// Acknowledged with `true` once written, `false` if the write was aborted.
    pub ack: Option<oneshot::Sender<Result<bool>>>,
}

/// Request body still to be written.
#[derive(Debug, Default)]
pub struct Outbound {
    pub queue: VecDeque<OutboundChunk>,
    /// No further chunks will be queued.
    pub finished: bool,
    /// Trailer fields for the closing HEADERS frame.
    pub trailers: Vec<(String, String)>,
}

impl Outbound {
    pub fn has_data(&self) -> bool {
        self.queue.iter().any(|c| !c.data.is_empty())
    }

    /// Drop every unsent chunk, telling writers to stop.
    pub fn abort(&mut self) {
        for chunk in self.queue.drain(..) {
            if let Some(ack) = chunk.ack {
                let _ = ack.send(Ok(false));
            }
        }
        self.finished = true;
        self.trailers.clear();
    }
}

/// One request/response exchange.
#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    pub request_id: u64,
    pub state: StreamState,
    pub send_window: FlowWindow,
    pub recv_window: InflowWindow,
    pub outbound: Outbound,
    /// Set once the final response head has been handed over.
    pub head_delivered: bool,
    /// Unsent body was abandoned after an error status.
    pub body_aborted: bool,
    head_tx: Option<oneshot::Sender<Result<ResponseHead>>>,
    body_tx: Option<mpsc::UnboundedSender<Result<BodyEvent>>>,
    body_rx: Option<mpsc::UnboundedReceiver<Result<BodyEvent>>>,
}

impl Stream {
    pub fn new(
        id: u32,
        request_id: u64,
        send_window: u32,
        recv_window: u32,
        head_tx: oneshot::Sender<Result<ResponseHead>>,
    ) -> Self {
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        Self {
            id,
            request_id,
            state: StreamState::Idle,
            send_window: FlowWindow::new(send_window),
            recv_window: InflowWindow::new(recv_window),
            outbound: Outbound::default(),
            head_delivered: false,
            body_aborted: false,
            head_tx: Some(head_tx),
            body_tx: Some(body_tx),
            body_rx: Some(body_rx),
        }
    }

    pub fn on_headers_sent(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
    }

    pub fn on_end_stream_sent(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    pub fn on_end_stream_received(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
        // Dropping the sender ends the caller's body.
        self.body_tx = None;
    }

    pub fn end_stream_sent(&self) -> bool {
        matches!(
            self.state,
            StreamState::HalfClosedLocal | StreamState::Closed
        )
    }

    pub fn remote_closed(&self) -> bool {
        matches!(
            self.state,
            StreamState::HalfClosedRemote | StreamState::Closed
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Hand the response head to the waiting caller. Only the first call
    /// delivers anything.
    pub fn deliver_head(&mut self, status: u16, headers: Vec<(String, String)>) -> bool {
        let (Some(tx), Some(body)) = (self.head_tx.take(), self.body_rx.take()) else {
            return false;
        };
        self.head_delivered = true;
        let _ = tx.send(Ok(ResponseHead {
            stream_id: self.id,
            status,
            headers,
            body,
        }));
        true
    }

    /// Forward a body event. Returns false when the caller stopped listening.
    pub fn deliver(&mut self, event: BodyEvent) -> bool {
        match &self.body_tx {
            Some(tx) => tx.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    /// Abandon the unsent request body.
    pub fn abort_body(&mut self) {
        if !self.end_stream_sent() && (self.outbound.has_data() || !self.outbound.finished) {
            self.body_aborted = true;
        }
        self.outbound.abort();
    }

    /// Fail the stream: whoever is waiting (head or body) gets `err`.
    pub fn fail(&mut self, err: Error) {
        self.outbound.abort();
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(Err(err));
        } else if let Some(tx) = self.body_tx.take() {
            let _ = tx.send(Err(err));
        }
        self.state = StreamState::Closed;
    }
}
