//! Outbound message transport
//!
//! The core only needs [`MessageChannel`]. [`QueueChannel`] is an in-process
//! implementation backed by a bounded crossbeam queue; the transport task (or a
//! test) owns the matching [`ChannelPeer`] and forwards the lines.

use crate::error::{EjectorError, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transport for protocol lines
pub trait MessageChannel: Send {
    /// Write one message. Must return within a bounded time.
    fn send(&self, message: &str) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Sending half of an in-process line queue
pub struct QueueChannel {
    tx: Sender<String>,
    connected: Arc<AtomicBool>,
    send_timeout: Duration,
}

/// Receiving half of a [`QueueChannel`]
pub struct ChannelPeer {
    rx: Receiver<String>,
    connected: Arc<AtomicBool>,
}

impl QueueChannel {
    /// Create a connected channel holding at most `capacity` unread lines.
    /// A write blocks for at most `send_timeout` when the queue is full.
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, ChannelPeer) {
        let (tx, rx) = bounded(capacity);
        let connected = Arc::new(AtomicBool::new(true));

        (
            Self {
                tx,
                connected: Arc::clone(&connected),
                send_timeout,
            },
            ChannelPeer { rx, connected },
        )
    }
}

impl MessageChannel for QueueChannel {
    fn send(&self, message: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(EjectorError::ChannelUnavailable);
        }

        self.tx
            .send_timeout(message.to_owned(), self.send_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => EjectorError::send_failed(format!(
                    "peer did not drain within {:?}",
                    self.send_timeout
                )),
                SendTimeoutError::Disconnected(_) => {
                    self.connected.store(false, Ordering::Release);
                    EjectorError::ChannelUnavailable
                }
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl ChannelPeer {
    pub fn try_recv(&self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take every line currently queued
    pub fn drain(&self) -> Vec<String> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

impl Drop for ChannelPeer {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::Release);
    }
}
