//! Flow-control windows (RFC 9113 Section 5.2).
//!
//! Both types are plain arithmetic owned by the connection driver; neither
//! does any I/O.

use crate::error::{Error, Result};
use crate::fingerprint::http2::MAX_WINDOW_SIZE;

/// Receive-side credit is returned to the peer once this many bytes are
/// pending, or once pending credit exceeds what the peer still holds.
pub const MIN_REFRESH: i32 = 4 << 10;

/// Outbound credit granted by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowWindow {
    available: i32,
}

impl FlowWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial.min(MAX_WINDOW_SIZE) as i32,
        }
    }

    /// Credit currently available. Negative after a SETTINGS shrink.
    pub fn available(&self) -> i32 {
        self.available
    }

    /// Bytes that may be sent now (zero when the window is exhausted or negative).
    pub fn sendable(&self) -> u32 {
        self.available.max(0) as u32
    }

    /// Consume credit for bytes written. Callers never take more than
    /// [`sendable`](Self::sendable).
    pub fn take(&mut self, n: u32) {
        self.available -= n.min(self.sendable()) as i32;
    }

    /// Apply a WINDOW_UPDATE increment.
    pub fn add(&mut self, increment: u32) -> Result<()> {
        self.adjust(increment as i64)
    }

    /// Apply an INITIAL_WINDOW_SIZE change (new minus old). The window keeps
    /// any credit it already holds beyond the old initial size.
    pub fn adjust(&mut self, delta: i64) -> Result<()> {
        let next = self.available as i64 + delta;
        if next > MAX_WINDOW_SIZE as i64 || next < i32::MIN as i64 {
            return Err(Error::flow_control(format!(
                "window of {} adjusted by {} exceeds 2^31-1",
                self.available, delta
            )));
        }
        self.available = next as i32;
        Ok(())
    }
}

/// Inbound credit we granted, with batched WINDOW_UPDATE refills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflowWindow {
    avail: i32,
    unsent: i32,
}

impl InflowWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            avail: initial.min(MAX_WINDOW_SIZE) as i32,
            unsent: 0,
        }
    }

    /// Credit the peer may still use.
    pub fn available(&self) -> i32 {
        self.avail
    }

    /// Account for an inbound DATA frame (padding included).
    pub fn take(&mut self, n: u32) -> Result<()> {
        if n as i64 > self.avail as i64 {
            return Err(Error::flow_control(format!(
                "peer sent {} bytes with {} bytes of window",
                n, self.avail
            )));
        }
        self.avail -= n as i32;
        Ok(())
    }

    /// Return `n` consumed bytes to the window. Yields the WINDOW_UPDATE
    /// increment to send, or `None` while the refill is still being batched.
    pub fn release(&mut self, n: u32) -> Result<Option<u32>> {
        let unsent = self.unsent as i64 + n as i64;
        if unsent + self.avail as i64 > MAX_WINDOW_SIZE as i64 {
            return Err(Error::flow_control("receive window refill exceeds 2^31-1"));
        }
        self.unsent = unsent as i32;
        if self.unsent < MIN_REFRESH && self.unsent < self.avail {
            return Ok(None);
        }
        self.avail += self.unsent;
        self.unsent = 0;
        Ok(Some(unsent as u32))
    }
}
