//! Client and server roles for the URP micro-RPC protocol.
//!
//! Built on `urp-core`'s transport-agnostic [`Protocol`](urp_core::Protocol):
//! this crate adds method dispatch, the four method-shape registrations,
//! and error reification on top of raw channels.

mod client;
mod error;
mod registry;
mod server;

pub use client::{CallOutcome, Client, ResponseStream};
pub use error::{ApplicationError, ErrorKindCache, GENERIC_ERROR, NOT_A_METHOD};
pub use registry::{MethodHandler, MethodRegistry, MethodResult};
pub use server::{fqn, Server};

pub use urp_core::{
    ChannelEvent, ChannelHandle, ChannelSender, GateError, Protocol, ProtocolDelegate,
    ProtocolError, Transport, WriteFn,
};
pub use urp_protocol::{LogLevel, Message, MsgType, Packet, Value, NO_LOG_FILTER};
