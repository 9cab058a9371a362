//! Peer session state
//!
//! One `PeerSession` per admitted connection. The session owns the send
//! path: frames are queued onto an unbounded channel drained by the
//! connection's writer task, with queued-byte accounting standing in for
//! transport back-pressure. The session never retries or reorders.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::warn;

use crate::{BACKPRESSURE_WATERMARK_BYTES, MAX_BUFFERED_BYTES};

/// Items on a session's outbound queue
#[derive(Debug)]
pub enum Outbound {
    /// A text frame to deliver
    Frame(String),
    /// Close the transport after draining
    Close,
}

/// One connected peer
pub struct PeerSession {
    id: String,
    group: String,
    connected_at: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    queued_bytes: AtomicUsize,
    closed: AtomicBool,
}

impl PeerSession {
    pub fn new(id: String, group: String, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            id,
            group,
            connected_at,
            tx,
            queued_bytes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Admission timestamp in milliseconds since epoch
    pub fn connected_at(&self) -> u64 {
        self.connected_at
    }

    /// Queue a frame for delivery.
    ///
    /// Returns `true` when the frame was accepted without back-pressure.
    /// A session whose queue grows past the hard limit is closed; the rest
    /// of the system sees that as a normal disconnect.
    pub fn send(&self, frame: String) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        // Account before enqueueing so the writer's drain can never race
        // the counter below zero
        let len = frame.len();
        let queued = self.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if self.tx.send(Outbound::Frame(frame)).is_err() {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            return false;
        }

        if queued > MAX_BUFFERED_BYTES {
            warn!(
                "Peer {} in group {} exceeded the send buffer ({} bytes queued), closing",
                self.id, self.group, queued
            );
            self.close();
            return false;
        }

        queued <= BACKPRESSURE_WATERMARK_BYTES
    }

    /// Ask the writer task to close the transport. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Writer-task callback: `len` bytes left the queue
    pub fn drained(&self, len: usize) {
        self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
    }

    /// Bytes currently queued for delivery
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }
}
