//! Per-connection duplex channel with event/ack correlation.
//!
//! Outbound frames are queued on an mpsc sender drained by the connection's
//! writer task. Every `emit_with_ack` call takes the next ack id from the
//! channel's own counter and parks a oneshot sender under that id; the
//! connection's reader hands inbound `ack` frames to [`Channel::resolve_ack`].

use parking_lot::Mutex;
use serde_json::Value;
use spawn_relay_core::{AckPayload, EventPayload, Frame, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Outbound queue depth per connection.
pub const OUTBOUND_BUFFER: usize = 64;

/// The duplex transport handle of one live connection.
#[derive(Debug)]
pub struct Channel {
    outbound: mpsc::Sender<Frame>,
    next_ack_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    closed: AtomicBool,
}

/// Removes a pending ack slot when the waiting call goes away (answered,
/// timed out, or dropped).
struct PendingSlot<'a> {
    channel: &'a Channel,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.channel.pending.lock().remove(&self.id);
    }
}

impl Channel {
    /// Create a channel whose frames are pushed into `outbound`.
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            outbound,
            next_ack_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a channel together with the receiving end of its outbound queue.
    pub fn pair() -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (Self::new(tx), rx)
    }

    async fn send(&self, frame: Frame) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::ChannelClosed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }

    /// Emit an event and wait for its acknowledgment.
    ///
    /// There is no deadline here; callers bound the wait themselves. Dropping
    /// the returned future abandons the request without notifying the peer.
    pub async fn emit_with_ack(&self, name: &str, data: Value) -> RelayResult<Value> {
        if self.is_closed() {
            return Err(RelayError::ChannelClosed);
        }

        let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _slot = PendingSlot { channel: self, id };

        self.send(Frame::Event(EventPayload {
            name: name.to_string(),
            id: Some(id),
            data,
        }))
        .await?;
        trace!(ack_id = id, event = name, "awaiting ack");

        rx.await.map_err(|_| RelayError::ChannelClosed)
    }

    /// Answer an inbound event that carried an ack id.
    pub async fn ack(&self, id: u64, data: Value) -> RelayResult<()> {
        self.send(Frame::Ack(AckPayload { id, data })).await
    }

    /// Deliver an inbound ack to its waiting caller.
    ///
    /// Returns `false` if nobody is waiting for `id` (unknown id, or the caller
    /// already gave up).
    pub fn resolve_ack(&self, id: u64, data: Value) -> bool {
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Mark the channel closed and fail every in-flight `emit_with_ack`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }

    /// Number of events still waiting for an ack.
    #[cfg(test)]
    pub fn pending_acks(&self) -> usize {
        self.pending.lock().len()
    }
}

/// One-shot answer to an inbound event.
///
/// Consumed by [`Responder::respond`], so each asked event is answered at most
/// once; callers own the obligation to answer it at least once.
#[derive(Debug)]
pub struct Responder {
    id: u64,
}

impl Responder {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub async fn respond(self, channel: &Channel, data: Value) -> RelayResult<()> {
        channel.ack(self.id, data).await
    }
}
