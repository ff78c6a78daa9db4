//! Wire types for the URP micro-RPC protocol.
//!
//! A URP message is either a bare string (a "text frame", carrying
//! unassociated log text) or a packet `[channel_id, msg_type, ...payload]`.
//! This crate only describes the shape of those values; encoding and the
//! streaming decoder live in `urp-codec`.

use std::fmt;

pub use rmpv::Value;

/// Advisory log-level constants carried in `Call` and `Log` packets.
///
/// These have no effect on protocol behavior; `log_level = 999` in a `Call`
/// is the sentinel meaning "no filtering requested" (see [`NO_LOG_FILTER`]).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace = 0,
    Debug = 10,
    Verbose = 20,
    Info = 30,
    Warning = 40,
    Error = 50,
    Critical = 60,
}

impl LogLevel {
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            0 => LogLevel::Trace,
            10 => LogLevel::Debug,
            20 => LogLevel::Verbose,
            30 => LogLevel::Info,
            40 => LogLevel::Warning,
            50 => LogLevel::Error,
            60 => LogLevel::Critical,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// Sentinel `log_level` sent by the client role: "unspecified, don't filter".
pub const NO_LOG_FILTER: u32 = 999;

/// Wire-stable packet discriminant.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Channel terminator / cancellation. No payload.
    Shoosh = 0,
    /// client -> server: `name: str, args: map<str, any>, log_level: int`.
    Call = 1,
    /// server -> client: `value: any`.
    Return = 2,
    /// server -> client: `name: str, additional: null | map | seq | scalar`.
    Error = 3,
    /// server -> client: `group: str, level: int, message: str`.
    Log = 4,
}

impl MsgType {
    pub fn from_u64(val: u64) -> Option<Self> {
        Some(match val {
            0 => MsgType::Shoosh,
            1 => MsgType::Call,
            2 => MsgType::Return,
            3 => MsgType::Error,
            4 => MsgType::Log,
            _ => return None,
        })
    }

    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

/// Error when a received `msg_type` discriminant isn't one of the five
/// wire-stable values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMsgType(pub u64);

impl fmt::Display for UnknownMsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown msg_type: {}", self.0)
    }
}

impl std::error::Error for UnknownMsgType {}

impl TryFrom<u64> for MsgType {
    type Error = UnknownMsgType;

    fn try_from(val: u64) -> Result<Self, Self::Error> {
        MsgType::from_u64(val).ok_or(UnknownMsgType(val))
    }
}

/// A decoded top-level MessagePack value: either a packet addressed to a
/// channel, or a bare string carrying unassociated log text.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Packet(Packet),
    Text(String),
}

/// `[channel_id, msg_type, ...payload]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub channel_id: u64,
    pub msg_type: MsgType,
    pub payload: Vec<Value>,
}

impl Packet {
    pub fn shoosh(channel_id: u64) -> Self {
        Packet {
            channel_id,
            msg_type: MsgType::Shoosh,
            payload: Vec::new(),
        }
    }

    pub fn call(channel_id: u64, name: impl Into<String>, args: Value, log_level: u32) -> Self {
        Packet {
            channel_id,
            msg_type: MsgType::Call,
            payload: vec![Value::from(name.into()), args, Value::from(log_level)],
        }
    }

    pub fn call_unfiltered(channel_id: u64, name: impl Into<String>, args: Value) -> Self {
        Self::call(channel_id, name, args, NO_LOG_FILTER)
    }

    pub fn return_value(channel_id: u64, value: Value) -> Self {
        Packet {
            channel_id,
            msg_type: MsgType::Return,
            payload: vec![value],
        }
    }

    pub fn error(channel_id: u64, name: impl Into<String>, additional: Value) -> Self {
        Packet {
            channel_id,
            msg_type: MsgType::Error,
            payload: vec![Value::from(name.into()), additional],
        }
    }

    pub fn log(channel_id: u64, group: impl Into<String>, level: u32, message: impl Into<String>) -> Self {
        Packet {
            channel_id,
            msg_type: MsgType::Log,
            payload: vec![
                Value::from(group.into()),
                Value::from(level),
                Value::from(message.into()),
            ],
        }
    }

    /// Interpret this packet as a `Call`, returning `(name, args, log_level)`.
    pub fn as_call(&self) -> Option<(&str, &Value, u32)> {
        if self.msg_type != MsgType::Call || self.payload.len() != 3 {
            return None;
        }
        let name = self.payload[0].as_str()?;
        let log_level = self.payload[2].as_u64()? as u32;
        Some((name, &self.payload[1], log_level))
    }

    /// Interpret this packet as a `Return`, returning the carried value.
    pub fn as_return(&self) -> Option<&Value> {
        if self.msg_type != MsgType::Return || self.payload.len() != 1 {
            return None;
        }
        Some(&self.payload[0])
    }

    /// Interpret this packet as an `Error`, returning `(name, additional)`.
    pub fn as_error(&self) -> Option<(&str, &Value)> {
        if self.msg_type != MsgType::Error || self.payload.len() != 2 {
            return None;
        }
        let name = self.payload[0].as_str()?;
        Some((name, &self.payload[1]))
    }

    /// Interpret this packet as a `Log`, returning `(group, level, message)`.
    pub fn as_log(&self) -> Option<(&str, u32, &str)> {
        if self.msg_type != MsgType::Log || self.payload.len() != 3 {
            return None;
        }
        let group = self.payload[0].as_str()?;
        let level = self.payload[1].as_u64()? as u32;
        let message = self.payload[2].as_str()?;
        Some((group, level, message))
    }
}
