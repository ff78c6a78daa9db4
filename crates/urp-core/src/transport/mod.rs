//! Transport adapters: bind a [`Protocol`](crate::Protocol) to a real byte
//! stream. Each backend lives in its own submodule and the public surface is
//! the [`Transport`] enum, dispatched via `enum_dispatch` the way the rest of
//! this codebase wires multi-backend traits together.

use enum_dispatch::enum_dispatch;
use std::sync::Arc;

use crate::protocol::{Protocol, ProtocolDelegate};

pub mod stream;
pub mod subprocess;

#[cfg(unix)]
mod stdio;
#[cfg(unix)]
pub use stdio::relocate_stdio_for_embedded_server;

#[enum_dispatch]
pub(crate) trait TransportBackend {
    fn protocol(&self) -> &Arc<Protocol>;

    /// Wait for the backend to observe the connection ending, whether by
    /// clean EOF, error, or an explicit [`TransportBackend::close`].
    fn join(self) -> tokio::task::JoinHandle<()>;
}

/// A running transport: a `Protocol` bound to a live byte stream plus the
/// background task pumping bytes into it.
#[enum_dispatch(TransportBackend)]
pub enum Transport {
    Stream(stream::StreamTransport),
    Subprocess(subprocess::SubprocessTransport),
}

impl Transport {
    pub fn stream<S>(io: S, delegate: Arc<dyn ProtocolDelegate>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(io, delegate))
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        TransportBackend::protocol(self)
    }

    /// Wait for the read loop to notice the connection ended.
    pub fn join(self) -> tokio::task::JoinHandle<()> {
        TransportBackend::join(self)
    }
}
