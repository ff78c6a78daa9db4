//! Binds a [`Protocol`] to any `AsyncRead + AsyncWrite` stream: a TCP or
//! Unix socket, a pipe, a `tokio::io::duplex` in tests.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::gate::WriteFn;
use crate::protocol::{Protocol, ProtocolDelegate};

use super::TransportBackend;

const READ_BUF_SIZE: usize = 64 * 1024;

pub struct StreamTransport {
    protocol: Arc<Protocol>,
    read_loop: JoinHandle<()>,
}

impl StreamTransport {
    pub fn new<S>(io: S, delegate: Arc<dyn ProtocolDelegate>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(io);
        let write_half = Arc::new(AsyncMutex::new(write_half));

        let write_fn: WriteFn = Box::new(move |bytes| {
            let write_half = write_half.clone();
            Box::pin(async move {
                let mut write_half = write_half.lock().await;
                write_half.write_all(&bytes).await?;
                write_half.flush().await
            })
        });

        let protocol = Protocol::new(delegate, write_fn);
        let protocol_for_loop = protocol.clone();

        let read_loop = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match tokio::io::AsyncReadExt::read(&mut read_half, &mut buf).await {
                    Ok(0) => {
                        protocol_for_loop.connection_lost("stream reached EOF");
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = protocol_for_loop.recv_bytes(&buf[..n]) {
                            tracing::warn!(error = %e, "malformed input, closing stream transport");
                            protocol_for_loop.connection_lost(format!("malformed input: {e}"));
                            break;
                        }
                    }
                    Err(e) => {
                        protocol_for_loop.connection_lost(format!("read error: {e}"));
                        break;
                    }
                }
            }
        });

        StreamTransport {
            protocol,
            read_loop,
        }
    }
}

impl TransportBackend for StreamTransport {
    fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    fn join(self) -> JoinHandle<()> {
        self.read_loop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use urp_protocol::{MsgType, Packet};

    struct EchoDelegate {
        saw_new_channel: Arc<AtomicBool>,
    }

    impl ProtocolDelegate for EchoDelegate {
        fn on_text(&self, _text: String) {}

        fn on_new_channel(&self, mut handle: ChannelHandle) {
            self.saw_new_channel.store(true, Ordering::SeqCst);
            tokio::spawn(async move {
                while let Some(crate::channel::ChannelEvent::Packet { msg_type, payload }) =
                    handle.recv().await
                {
                    if msg_type == MsgType::Call {
                        let _ = handle.sender().send(MsgType::Return, payload).await;
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn bytes_flow_end_to_end_over_a_duplex_stream() {
        let (client_io, server_io) = tokio::io::duplex(4096);

        let saw_new_channel = Arc::new(AtomicBool::new(false));
        let server_delegate = Arc::new(EchoDelegate {
            saw_new_channel: saw_new_channel.clone(),
        });
        let server = StreamTransport::new(server_io, server_delegate);

        struct NullDelegate;
        impl ProtocolDelegate for NullDelegate {
            fn on_text(&self, _text: String) {}
            fn on_new_channel(&self, _handle: ChannelHandle) {}
        }
        let client = StreamTransport::new(client_io, Arc::new(NullDelegate));

        let mut channel = client.protocol().open_channel(None);
        channel
            .sender()
            .send(
                MsgType::Call,
                Packet::call_unfiltered(
                    channel.id(),
                    "example.Echo",
                    urp_protocol::Value::from("hi"),
                )
                .payload,
            )
            .await
            .unwrap();

        let reply = channel.recv().await.expect("server should reply");
        match reply {
            crate::channel::ChannelEvent::Packet { msg_type, .. } => {
                assert_eq!(msg_type, MsgType::Return);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(saw_new_channel.load(Ordering::SeqCst));
        server.join().abort();
    }
}
