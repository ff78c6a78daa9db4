//! Server role: answering calls that arrive on newly observed channels.
//!
//! Each inbound channel gets its own task, racing the method's completion
//! against the next inbound message with `tokio::select!`. This cancels
//! whichever branch doesn't win: an inbound `Shoosh` aborts the running
//! method cleanly, and a method that finishes first is never left racing a
//! stale read.

use std::sync::Arc;

use futures_util::StreamExt;
use urp_core::{ChannelEvent, ChannelHandle, ProtocolDelegate};
use urp_protocol::{MsgType, Value};

use crate::error::ApplicationError;
use crate::registry::{MethodHandler, MethodRegistry};

/// Binds a [`MethodRegistry`] to inbound channels as a
/// [`ProtocolDelegate`](urp_core::ProtocolDelegate).
pub struct Server {
    registry: MethodRegistry,
}

impl Server {
    pub fn new(registry: MethodRegistry) -> Arc<Self> {
        Arc::new(Server { registry })
    }
}

impl ProtocolDelegate for Server {
    fn on_text(&self, text: String) {
        tracing::debug!(text, "server ignoring unassociated text frame");
    }

    fn on_new_channel(&self, handle: ChannelHandle) {
        let registry = self.registry.clone();
        tokio::spawn(serve_channel(handle, registry));
    }
}

async fn serve_channel(mut handle: ChannelHandle, registry: MethodRegistry) {
    let channel_id = handle.id();

    let (fqn, args) = match handle.recv().await {
        Some(ChannelEvent::Packet {
            msg_type: MsgType::Call,
            payload,
        }) => match parse_call(payload) {
            Some(call) => call,
            None => {
                finish_unary(
                    &handle,
                    Err(ApplicationError::with_message(
                        ".MalformedCall",
                        "first packet on a server-owned channel was a Call with the wrong shape",
                    )),
                )
                .await;
                return;
            }
        },
        Some(ChannelEvent::Packet { msg_type: MsgType::Shoosh, .. }) | None => return,
        Some(_) => {
            tracing::debug!(channel_id, "first packet on new channel was not a Call");
            return;
        }
    };

    let Some(method) = registry.lookup(&fqn) else {
        finish_unary(&handle, Err(ApplicationError::not_a_method(fqn))).await;
        return;
    };

    match method {
        MethodHandler::Plain(f) => finish_unary(&handle, f(args)).await,
        MethodHandler::Coroutine(f) => {
            let result = tokio::select! {
                biased;
                shoosh = wait_for_shoosh(&mut handle) => { shoosh; return; }
                result = f(args) => result,
            };
            finish_unary(&handle, result).await;
        }
        MethodHandler::Iterator(f) => match f(args) {
            Ok(iter) => run_sync_iterator(&mut handle, iter).await,
            Err(e) => finish_unary(&handle, Err(e)).await,
        },
        MethodHandler::AsyncIterator(f) => match f(args) {
            Ok(stream) => run_async_iterator(&mut handle, stream).await,
            Err(e) => finish_unary(&handle, Err(e)).await,
        },
    }
}

fn parse_call(payload: Vec<Value>) -> Option<(String, Value)> {
    let mut it = payload.into_iter();
    let name = it.next()?.as_str()?.to_string();
    let args = it.next()?;
    Some((name, args))
}

/// Waits for an inbound `Shoosh` (cancellation) or the channel ending. Any
/// other packet arriving while a call is in flight is a protocol error,
/// fatal to the channel, so it also ends the wait rather than being ignored.
async fn wait_for_shoosh(handle: &mut ChannelHandle) -> Option<()> {
    loop {
        match handle.recv().await {
            Some(ChannelEvent::Packet {
                msg_type: MsgType::Shoosh,
                ..
            }) => return Some(()),
            Some(ChannelEvent::Disconnected(_)) | None => return Some(()),
            Some(ChannelEvent::Packet { msg_type, .. }) => {
                tracing::debug!(
                    channel_id = handle.id(),
                    ?msg_type,
                    "protocol error: unexpected packet on a call-in-progress channel"
                );
                return Some(());
            }
        }
    }
}

async fn finish_unary(handle: &ChannelHandle, result: Result<Value, ApplicationError>) {
    match result {
        Ok(value) => {
            let _ = handle.sender().send(MsgType::Return, vec![value]).await;
        }
        Err(e) => send_error(handle, e).await,
    }
    let _ = handle.sender().shoosh().await;
}

async fn run_sync_iterator(
    handle: &mut ChannelHandle,
    mut iter: Box<dyn Iterator<Item = Result<Value, ApplicationError>> + Send>,
) {
    loop {
        let next = tokio::select! {
            biased;
            cancelled = wait_for_shoosh(handle) => { cancelled; return; }
            next = async { iter.next() } => next,
        };
        match next {
            Some(Ok(value)) => {
                if handle.sender().send(MsgType::Return, vec![value]).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                send_error(handle, e).await;
                let _ = handle.sender().shoosh().await;
                return;
            }
            None => {
                let _ = handle.sender().shoosh().await;
                return;
            }
        }
    }
}

async fn run_async_iterator(
    handle: &mut ChannelHandle,
    mut stream: futures_core::stream::BoxStream<'static, Result<Value, ApplicationError>>,
) {
    loop {
        let next = tokio::select! {
            biased;
            cancelled = wait_for_shoosh(handle) => { cancelled; return; }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(value)) => {
                if handle.sender().send(MsgType::Return, vec![value]).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                send_error(handle, e).await;
                let _ = handle.sender().shoosh().await;
                return;
            }
            None => {
                let _ = handle.sender().shoosh().await;
                return;
            }
        }
    }
}

async fn send_error(handle: &ChannelHandle, error: ApplicationError) {
    let payload = vec![Value::from(&*error.name), error.additional().clone()];
    let _ = handle.sender().send(MsgType::Error, payload).await;
}

/// Resolve an interface + method name into the dotted form the wire uses.
pub fn fqn(interface: &str, method: &str) -> String {
    format!("{interface}.{method}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use urp_core::{Protocol, WriteFn};

    fn recording_writer() -> (WriteFn, Arc<parking_lot::Mutex<Vec<bytes::Bytes>>>) {
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sent_for_closure = sent.clone();
        let write: WriteFn = Box::new(move |bytes| {
            sent_for_closure.lock().push(bytes);
            Box::pin(async { Ok(()) })
        });
        (write, sent)
    }

    #[tokio::test]
    async fn unknown_method_replies_not_a_method() {
        let registry = MethodRegistry::new();
        let server = Server::new(registry);
        let (write, sent) = recording_writer();
        let protocol = Protocol::new(server, write);

        let bytes = urp_codec::Codec::pack(&urp_protocol::Message::Packet(
            urp_protocol::Packet::call_unfiltered(0, "example.Missing", Value::Nil),
        ));
        protocol.recv_bytes(&bytes).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let frames = sent.lock();
        assert_eq!(frames.len(), 2, "expected an Error then a Shoosh");
    }

    #[tokio::test]
    async fn plain_method_returns_then_shooshes() {
        let registry = MethodRegistry::new();
        registry.register_plain("example.Echo", Ok);
        let server = Server::new(registry);
        let (write, sent) = recording_writer();
        let protocol = Protocol::new(server, write);

        let bytes = urp_codec::Codec::pack(&urp_protocol::Message::Packet(
            urp_protocol::Packet::call_unfiltered(0, "example.Echo", Value::from("hi")),
        ));
        protocol.recv_bytes(&bytes).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frames = sent.lock();
        assert_eq!(frames.len(), 2, "expected a Return then a Shoosh");
    }

    #[tokio::test]
    async fn sync_iterator_yields_then_shooshes() {
        let registry = MethodRegistry::new();
        let done = Arc::new(AtomicBool::new(false));
        let done_for_closure = done.clone();
        registry.register_iterator("example.Count", move |_args| {
            done_for_closure.store(true, Ordering::SeqCst);
            Ok(Box::new(vec![Ok(Value::from(1)), Ok(Value::from(2))].into_iter())
                as Box<dyn Iterator<Item = Result<Value, ApplicationError>> + Send>)
        });
        let server = Server::new(registry);
        let (write, sent) = recording_writer();
        let protocol = Protocol::new(server, write);

        let bytes = urp_codec::Codec::pack(&urp_protocol::Message::Packet(
            urp_protocol::Packet::call_unfiltered(0, "example.Count", Value::Nil),
        ));
        protocol.recv_bytes(&bytes).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(done.load(Ordering::SeqCst));
        assert_eq!(sent.lock().len(), 3, "two Returns then a Shoosh");
    }

    #[tokio::test]
    async fn async_iterator_yields_then_shooshes() {
        let registry = MethodRegistry::new();
        registry.register_async_iterator("example.Count", |_args| {
            Ok(stream::iter(vec![Ok(Value::from(1)), Ok(Value::from(2))]).boxed())
        });
        let server = Server::new(registry);
        let (write, sent) = recording_writer();
        let protocol = Protocol::new(server, write);

        let bytes = urp_codec::Codec::pack(&urp_protocol::Message::Packet(
            urp_protocol::Packet::call_unfiltered(0, "example.Count", Value::Nil),
        ));
        protocol.recv_bytes(&bytes).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sent.lock().len(), 3, "two Returns then a Shoosh");
    }
}
