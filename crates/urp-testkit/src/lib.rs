//! In-memory transport pairs and a reference `example` service, for testing
//! the client and server roles against each other without a real socket or
//! subprocess.
//!
//! The `example` interface is `Echo`, `sync`, `async`, `gen`, `async_gen`,
//! and `error`: a plain echo, two methods that return a fixed
//! `{"spam": "eggs"}` value (one immediately, one after [`EXAMPLE_DELAY`]),
//! two generators that yield `{"spam": "eggs"}` then `{"foo": "bar"}` (one
//! immediately, one with `EXAMPLE_DELAY` between the two values), and a
//! method that always fails with the message it was given.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use urp::{ApplicationError, Client, MethodRegistry, Server, Value, GENERIC_ERROR};
use urp_core::{ChannelHandle, ProtocolDelegate, Transport};

/// How long `example.async` waits before returning, and the gap
/// `example.async_gen` waits between its two values.
pub const EXAMPLE_DELAY: Duration = Duration::from_millis(100);

fn spam_eggs() -> Value {
    Value::Map(vec![(Value::from("spam"), Value::from("eggs"))])
}

fn foo_bar() -> Value {
    Value::Map(vec![(Value::from("foo"), Value::from("bar"))])
}

fn msg_arg(args: &Value) -> String {
    args.as_map()
        .and_then(|m| m.iter().find(|(k, _)| k.as_str() == Some("msg")))
        .and_then(|(_, v)| v.as_str())
        .unwrap_or("boom")
        .to_string()
}

/// Registers the `example` interface's methods on `registry`.
pub fn register_example_service(registry: &MethodRegistry) {
    registry.register_plain("example.Echo", |args| Ok(args));

    registry.register_plain("example.sync", |_args| Ok(spam_eggs()));

    registry.register_coroutine("example.async", |_args| async move {
        tokio::time::sleep(EXAMPLE_DELAY).await;
        Ok(spam_eggs())
    });

    registry.register_iterator("example.gen", |_args| {
        Ok(Box::new(vec![Ok(spam_eggs()), Ok(foo_bar())].into_iter())
            as Box<dyn Iterator<Item = Result<Value, ApplicationError>> + Send>)
    });

    registry.register_async_iterator("example.async_gen", |_args| {
        Ok(async_stream::stream! {
            yield Ok(spam_eggs());
            tokio::time::sleep(EXAMPLE_DELAY).await;
            yield Ok(foo_bar());
        }
        .boxed())
    });

    registry.register_plain("example.error", |args| {
        let message = msg_arg(&args);
        Err(ApplicationError::with_fields(
            GENERIC_ERROR,
            vec![
                ("msg".to_string(), Value::from(message.clone())),
                ("args".to_string(), Value::Array(vec![Value::from(message)])),
            ],
        ))
    });

    // Not one of the `example` interface's scenario methods; a
    // variable-length generator for tests that need to cancel a
    // long-running call mid-stream.
    registry.register_iterator("test.count", |args| {
        let count = args
            .as_map()
            .and_then(|m| m.iter().find(|(k, _)| k.as_str() == Some("count")))
            .and_then(|(_, v)| v.as_i64())
            .unwrap_or(3);
        Ok(Box::new((0..count).map(|i| Ok(Value::from(i))))
            as Box<dyn Iterator<Item = Result<Value, ApplicationError>> + Send>)
    });
}

struct NullDelegate;

impl ProtocolDelegate for NullDelegate {
    fn on_text(&self, _text: String) {}
    fn on_new_channel(&self, _handle: ChannelHandle) {}
}

/// Links a client to an in-process server speaking the `example` interface
/// over a `tokio::io::duplex` pair. Returns the client plus both transports
/// (kept only so a caller can observe or explicitly drop them; the
/// background read loops are detached tasks and outlive either handle).
pub fn spawn_example_server() -> (Client, Transport, Transport) {
    let registry = MethodRegistry::new();
    register_example_service(&registry);
    spawn_linked(registry)
}

/// Like [`spawn_example_server`], but with a caller-supplied registry, for
/// tests that need methods beyond the `example` interface.
pub fn spawn_linked(registry: MethodRegistry) -> (Client, Transport, Transport) {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);

    let server_transport = Transport::stream(server_io, Server::new(registry));
    let client_transport = Transport::stream(client_io, Arc::new(NullDelegate));
    let client = Client::new(client_transport.protocol().clone());

    (client, client_transport, server_transport)
}
