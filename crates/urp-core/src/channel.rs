//! Channel id allocation and per-channel inbound queues.
//!
//! Ids are monotonic and never recycled: once allocated, an id is never
//! handed out again even after its channel is released. A reuse-lowest-free-id
//! scheme can collide a channel closed and reopened in the same tick with a
//! peer-initiated channel using the same id; monotonic allocation rules that
//! out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use urp_protocol::{MsgType, Value};

use crate::gate::BackpressureGate;

/// Something delivered to a channel's inbound queue.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Packet {
        msg_type: MsgType,
        payload: Vec<Value>,
    },
    /// The connection is gone; no more events will follow.
    Disconnected(Arc<str>),
}

/// A channel id wasn't present in the table (already released, or never
/// opened).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownChannel(pub u64);

struct Inner {
    next_id: u64,
    channels: HashMap<u64, mpsc::UnboundedSender<ChannelEvent>>,
}

pub struct ChannelTable {
    inner: Mutex<Inner>,
}

impl ChannelTable {
    pub fn new() -> Self {
        ChannelTable {
            inner: Mutex::new(Inner {
                next_id: 0,
                channels: HashMap::new(),
            }),
        }
    }

    /// Allocate a fresh id, or register `id` if given (used when a peer
    /// opens a channel with an id we didn't choose). Either way, `next_id`
    /// is advanced past whatever id ends up registered.
    pub(crate) fn open(&self, id: Option<u64>) -> (u64, mpsc::UnboundedReceiver<ChannelEvent>) {
        let mut inner = self.inner.lock();
        let id = id.unwrap_or(inner.next_id);
        if id >= inner.next_id {
            inner.next_id = id + 1;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        inner.channels.insert(id, tx);
        (id, rx)
    }

    pub(crate) fn deliver(&self, id: u64, event: ChannelEvent) -> Result<(), UnknownChannel> {
        let inner = self.inner.lock();
        match inner.channels.get(&id) {
            Some(tx) => {
                // A send failure here means the receiver was dropped but
                // release() hasn't run yet; that's fine, it's about to.
                let _ = tx.send(event);
                Ok(())
            }
            None => Err(UnknownChannel(id)),
        }
    }

    pub(crate) fn release(&self, id: u64) {
        self.inner.lock().channels.remove(&id);
    }

    pub(crate) fn close_all(&self, cause: Arc<str>) {
        let inner = self.inner.lock();
        for tx in inner.channels.values() {
            let _ = tx.send(ChannelEvent::Disconnected(cause.clone()));
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.inner.lock().channels.contains_key(&id)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends packets on one channel. Cheap to clone; many outstanding calls can
/// share a sender for the same channel.
#[derive(Clone)]
pub struct ChannelSender {
    channel_id: u64,
    gate: Arc<BackpressureGate>,
}

impl ChannelSender {
    pub(crate) fn new(channel_id: u64, gate: Arc<BackpressureGate>) -> Self {
        ChannelSender { channel_id, gate }
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub async fn send(
        &self,
        msg_type: MsgType,
        payload: Vec<Value>,
    ) -> Result<(), crate::gate::GateError> {
        let packet = urp_protocol::Packet {
            channel_id: self.channel_id,
            msg_type,
            payload,
        };
        let bytes = urp_codec::Codec::pack(&urp_protocol::Message::Packet(packet));
        self.gate.send(bytes.into()).await
    }

    pub async fn shoosh(&self) -> Result<(), crate::gate::GateError> {
        self.send(MsgType::Shoosh, Vec::new()).await
    }
}

/// Ownership of one end of a channel: the inbound queue, plus a sender for
/// replies. Releases the id from the owning table on drop, regardless of
/// which exit path (normal completion, error, cancellation) got there.
pub struct ChannelHandle {
    id: u64,
    sender: ChannelSender,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    table: Arc<ChannelTable>,
}

impl ChannelHandle {
    pub(crate) fn new(
        id: u64,
        sender: ChannelSender,
        rx: mpsc::UnboundedReceiver<ChannelEvent>,
        table: Arc<ChannelTable>,
    ) -> Self {
        ChannelHandle {
            id,
            sender,
            rx,
            table,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}
