//! Client role: calling a remote method and consuming its response(s) as a
//! stream.
//!
//! [`Client::call`] returns a `Stream` that does nothing until first polled:
//! no channel is opened, no `Call` packet is sent, until the caller actually
//! starts consuming it. `async-stream` gives us that laziness for free, since
//! the body only starts running once the generated future is polled.

use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use urp_core::{ChannelEvent, ChannelSender, Protocol};
use urp_protocol::{MsgType, Packet, Value, NO_LOG_FILTER};

use crate::error::{ApplicationError, ErrorKindCache};

/// Best-effort cancellation grace period: how long we wait for our own
/// `Shoosh` to go out before giving up, when a response stream is dropped
/// before it ran to completion.
const CANCEL_SHOOSH_TIMEOUT: Duration = Duration::from_millis(200);

/// One item of a call's response stream. Unlike a plain `Result`-yielding
/// stream, `Error` is a normal item rather than the stream's terminator.
/// Some methods are documented to yield values and then fail, and callers
/// need to see what came before the error.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Value(Value),
    Error(ApplicationError),
}

/// A call's response, boxed so it can be returned from a plain function or
/// stored in a struct without naming the `async-stream`-generated type.
pub type ResponseStream = std::pin::Pin<Box<dyn Stream<Item = CallOutcome> + Send>>;

#[derive(Clone)]
pub struct Client {
    protocol: Arc<Protocol>,
    error_kinds: Arc<ErrorKindCache>,
}

impl Client {
    pub fn new(protocol: Arc<Protocol>) -> Self {
        Client {
            protocol,
            error_kinds: Arc::new(ErrorKindCache::new()),
        }
    }

    /// Call `fqn` (e.g. `"example.Echo"`) with `args`, returning a lazy
    /// stream of [`CallOutcome`]s. The stream ends when the server sends
    /// `Shoosh` or the connection is lost.
    pub fn call(&self, fqn: impl Into<String>, args: Value) -> ResponseStream {
        let protocol = self.protocol.clone();
        let error_kinds = self.error_kinds.clone();
        let fqn = fqn.into();

        Box::pin(async_stream::stream! {
            let mut handle = protocol.open_channel(None);
            let sender = handle.sender().clone();
            let _guard = CancelOnDrop::new(sender.clone());

            let call = Packet::call(handle.id(), fqn, args, NO_LOG_FILTER);
            if let Err(e) = sender.send(MsgType::Call, call.payload).await {
                yield CallOutcome::Error(ApplicationError::transport(e.to_string()));
                return;
            }

            loop {
                match handle.recv().await {
                    Some(ChannelEvent::Packet { msg_type: MsgType::Return, mut payload }) => {
                        yield CallOutcome::Value(payload.drain(..).next().unwrap_or(Value::Nil));
                    }
                    Some(ChannelEvent::Packet { msg_type: MsgType::Error, payload }) => {
                        yield CallOutcome::Error(reify_error(&error_kinds, payload));
                    }
                    Some(ChannelEvent::Packet { msg_type: MsgType::Log, payload }) => {
                        if let Some((group, level, message)) = as_log(&payload) {
                            tracing::event!(
                                target: "urp::remote_log",
                                tracing::Level::INFO,
                                group, level, message
                            );
                        }
                    }
                    Some(ChannelEvent::Packet { msg_type: MsgType::Shoosh, .. }) => break,
                    Some(ChannelEvent::Packet { msg_type: MsgType::Call, .. }) => {
                        // A server never calls back on a client-opened channel.
                        tracing::debug!(channel_id = handle.id(), "ignoring unexpected Call on response channel");
                    }
                    Some(ChannelEvent::Disconnected(cause)) => {
                        yield CallOutcome::Error(ApplicationError::transport(cause.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        })
    }

    /// Binds `fqn` to a reusable invocable, so callers can pass around
    /// `client.method("example.Echo")` instead of a `(client, fqn)` pair.
    pub fn method(&self, fqn: impl Into<String>) -> impl Fn(Value) -> ResponseStream + Clone {
        let client = self.clone();
        let fqn = fqn.into();
        move |args| client.call(fqn.clone(), args)
    }
}

fn as_log(payload: &[Value]) -> Option<(&str, u32, &str)> {
    if payload.len() != 3 {
        return None;
    }
    let group = payload[0].as_str()?;
    let level = payload[1].as_u64()? as u32;
    let message = payload[2].as_str()?;
    Some((group, level, message))
}

fn reify_error(error_kinds: &ErrorKindCache, mut payload: Vec<Value>) -> ApplicationError {
    if payload.len() != 2 {
        return ApplicationError::with_message(
            ".MalformedError",
            "error packet did not carry exactly (name, additional)",
        );
    }
    let additional = payload.pop().unwrap();
    let name = payload.pop().unwrap();
    let name = error_kinds.intern(name.as_str().unwrap_or(".MalformedError"));
    ApplicationError::new(name, additional)
}

/// Sends a best-effort `Shoosh` when dropped, so a response stream
/// abandoned mid-flight (the caller stopped polling, e.g. it was selected
/// away in a `tokio::select!`) tells the server to stop working on it.
/// Harmless if the server already ended the channel itself.
struct CancelOnDrop {
    sender: Option<ChannelSender>,
}

impl CancelOnDrop {
    fn new(sender: ChannelSender) -> Self {
        CancelOnDrop {
            sender: Some(sender),
        }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            tokio::spawn(async move {
                let _ = tokio::time::timeout(CANCEL_SHOOSH_TIMEOUT, sender.shoosh()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use urp_core::{ChannelHandle, ProtocolDelegate};

    struct NullDelegate;
    impl ProtocolDelegate for NullDelegate {
        fn on_text(&self, _text: String) {}
        fn on_new_channel(&self, _handle: ChannelHandle) {}
    }

    #[tokio::test]
    async fn call_is_lazy_until_polled() {
        let called = Arc::new(AtomicBool::new(false));
        let called_for_write = called.clone();
        let write: urp_core::WriteFn = Box::new(move |_bytes| {
            called_for_write.store(true, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });
        let protocol = Protocol::new(Arc::new(NullDelegate), write);
        let client = Client::new(protocol);

        let stream = client.call("example.Echo", Value::from("hi"));
        assert!(!called.load(Ordering::SeqCst), "must not send before first poll");

        tokio::pin!(stream);
        // Poll once; there will be no reply so this will hang on recv, so
        // just check the Call went out and then drop the stream.
        let _ = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn reify_error_maps_mapping_shape_to_message() {
        let cache = ErrorKindCache::new();
        let payload = vec![
            Value::from("example.Boom"),
            Value::Map(vec![(Value::from("msg"), Value::from("kaboom"))]),
        ];
        let err = reify_error(&cache, payload);
        assert_eq!(&*err.name, "example.Boom");
        assert_eq!(err.message(), Some("kaboom"));
    }

    #[tokio::test]
    async fn reify_error_interns_the_same_name_across_calls() {
        let cache = ErrorKindCache::new();
        let one = reify_error(&cache, vec![Value::from("example.Boom"), Value::Nil]);
        let two = reify_error(&cache, vec![Value::from("example.Boom"), Value::Nil]);
        assert!(Arc::ptr_eq(&one.name, &two.name));
    }
}
