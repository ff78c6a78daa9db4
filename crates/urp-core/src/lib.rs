//! Channel multiplexing, backpressure, and transport binding for URP.
//!
//! This crate turns a raw byte stream into a set of independent,
//! backpressure-aware channels. It knows nothing about method calls or
//! error reification; that's `urp`, built on top of [`Protocol`].

mod channel;
mod gate;
mod protocol;
pub mod transport;

pub use channel::{ChannelEvent, ChannelHandle, ChannelSender, ChannelTable, UnknownChannel};
pub use gate::{BackpressureGate, GateError, WriteFn};
pub use protocol::{Protocol, ProtocolDelegate, ProtocolError};
pub use transport::Transport;
