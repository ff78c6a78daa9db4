//! Protocol core: bytes in, packets routed to channels; packets out, through
//! the backpressure gate.
//!
//! `Protocol` is transport-agnostic. A transport adapter feeds it bytes as
//! they arrive and gives it a write function to call when it has bytes to
//! send; `Protocol` does the framing, channel routing, and role-hook
//! dispatch in between.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use urp_codec::{Codec, CodecError};
use urp_protocol::Message;

use crate::channel::{ChannelEvent, ChannelHandle, ChannelSender, ChannelTable};
use crate::gate::{BackpressureGate, GateError, WriteFn};

#[derive(Debug)]
pub enum ProtocolError {
    Codec(CodecError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The two things a protocol role (client or server) needs to hear about.
/// Anything more specific, like call dispatch or response streams, is built
/// on top of the channel a [`ProtocolDelegate`] receives.
pub trait ProtocolDelegate: Send + Sync + 'static {
    /// A bare string arrived, unassociated with any channel.
    fn on_text(&self, text: String);

    /// A packet arrived for a channel id this protocol hadn't seen before.
    /// Ownership of the channel passes to the delegate; it's responsible
    /// for reading from it (and thus eventually dropping it, which releases
    /// the id).
    fn on_new_channel(&self, handle: ChannelHandle);
}

pub struct Protocol {
    codec: Mutex<Codec>,
    table: Arc<ChannelTable>,
    gate: Arc<BackpressureGate>,
    delegate: Arc<dyn ProtocolDelegate>,
}

impl Protocol {
    pub fn new(delegate: Arc<dyn ProtocolDelegate>, write: WriteFn) -> Arc<Protocol> {
        Arc::new(Protocol {
            codec: Mutex::new(Codec::new()),
            table: Arc::new(ChannelTable::new()),
            gate: Arc::new(BackpressureGate::new(write)),
            delegate,
        })
    }

    /// Open a channel. Pass `None` to let the protocol allocate a fresh id
    /// (the usual case for a call initiator); pass `Some(id)` only when
    /// registering a peer-chosen id (used internally for inbound channels).
    pub fn open_channel(&self, id: Option<u64>) -> ChannelHandle {
        let (channel_id, rx) = self.table.open(id);
        let sender = ChannelSender::new(channel_id, self.gate.clone());
        ChannelHandle::new(channel_id, sender, rx, self.table.clone())
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), GateError> {
        let bytes = Codec::pack(&Message::Text(text.into()));
        self.gate.send(bytes.into()).await
    }

    /// Feed newly received bytes. Decodes and dispatches every complete
    /// message the new bytes make available; partial trailing bytes are
    /// buffered for the next call.
    pub fn recv_bytes(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let messages = {
            let mut codec = self.codec.lock();
            codec.feed(bytes);
            codec.drain().map_err(ProtocolError::Codec)?
        };

        for message in messages {
            match message {
                Message::Text(text) => self.delegate.on_text(text),
                Message::Packet(packet) => self.dispatch_packet(packet),
            }
        }
        Ok(())
    }

    fn dispatch_packet(&self, packet: urp_protocol::Packet) {
        let channel_id = packet.channel_id;
        if !self.table.contains(channel_id) {
            let handle = self.open_channel(Some(channel_id));
            self.delegate.on_new_channel(handle);
        }

        let event = ChannelEvent::Packet {
            msg_type: packet.msg_type,
            payload: packet.payload,
        };
        if self.table.deliver(channel_id, event).is_err() {
            tracing::debug!(
                channel_id,
                "dropping packet for a channel released between dispatch and delivery"
            );
        }
    }

    /// Called by the transport when its outbound direction reports
    /// backpressure (e.g. the OS socket buffer is full).
    pub fn writable_paused(&self) {
        self.gate.pause();
    }

    /// Called by the transport once outbound backpressure clears.
    pub fn writable_resumed(&self) {
        self.gate.resume();
    }

    /// The transport is gone. Shuts the gate and tells every open channel,
    /// unblocking anything awaiting a reply that will never arrive.
    pub fn connection_lost(&self, cause: impl Into<Arc<str>>) {
        let cause = self.gate.shutdown(cause).cause;
        self.table.close_all(cause);
    }

    pub fn channel_count(&self) -> usize {
        self.table.channel_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use urp_protocol::Packet;

    struct RecordingDelegate {
        texts: Mutex<Vec<String>>,
        new_channels: AtomicUsize,
    }

    impl ProtocolDelegate for RecordingDelegate {
        fn on_text(&self, text: String) {
            self.texts.lock().push(text);
        }

        fn on_new_channel(&self, mut handle: ChannelHandle) {
            self.new_channels.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move { while handle.recv().await.is_some() {} });
        }
    }

    fn no_op_writer() -> WriteFn {
        Box::new(|_bytes| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn text_frame_reaches_delegate() {
        let delegate = Arc::new(RecordingDelegate {
            texts: Mutex::new(Vec::new()),
            new_channels: AtomicUsize::new(0),
        });
        let protocol = Protocol::new(delegate.clone(), no_op_writer());

        let bytes = Codec::pack(&Message::Text("hello".into()));
        protocol.recv_bytes(&bytes).unwrap();
        assert_eq!(delegate.texts.lock().clone(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn unknown_channel_triggers_on_new_channel_once() {
        let delegate = Arc::new(RecordingDelegate {
            texts: Mutex::new(Vec::new()),
            new_channels: AtomicUsize::new(0),
        });
        let protocol = Protocol::new(delegate.clone(), no_op_writer());

        let bytes = Codec::pack(&Message::Packet(Packet::shoosh(9)));
        protocol.recv_bytes(&bytes).unwrap();
        protocol.recv_bytes(&bytes).unwrap();

        assert_eq!(delegate.new_channels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn open_channel_allocates_distinct_ids() {
        let delegate = Arc::new(RecordingDelegate {
            texts: Mutex::new(Vec::new()),
            new_channels: AtomicUsize::new(0),
        });
        let protocol = Protocol::new(delegate, no_op_writer());
        let a = protocol.open_channel(None);
        let b = protocol.open_channel(None);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn connection_lost_shuts_down_the_gate() {
        let delegate = Arc::new(RecordingDelegate {
            texts: Mutex::new(Vec::new()),
            new_channels: AtomicUsize::new(0),
        });
        let protocol = Protocol::new(delegate, no_op_writer());
        protocol.connection_lost("peer closed the stream");

        let err = protocol.send_text("too late").await.unwrap_err();
        assert_eq!(&*err.cause, "peer closed the stream");
    }
}
