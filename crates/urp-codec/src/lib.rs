//! Framing and MessagePack encode/decode for URP.
//!
//! [`Codec`] is a streaming unpacker: bytes arrive in arbitrary chunks via
//! [`Codec::feed`], and [`Codec::next`] yields zero or more complete
//! top-level values, buffering any trailing partial value for the next feed.
//! The codec never yields a partially decoded message.

use std::fmt;
use std::io::Cursor;

use bytes::{Buf, BytesMut};
use rmpv::Value;
use urp_protocol::{Message, MsgType, Packet};

/// Errors from decoding a malformed byte stream. Fatal at the transport
/// level: a connection that sends malformed bytes is not worth salvaging.
#[derive(Debug)]
pub enum CodecError {
    /// The top-level value wasn't a string or an array `[channel_id, msg_type, ...]`.
    UnexpectedShape,
    /// An array-shaped message had too few elements, or fields had the wrong type.
    Malformed(&'static str),
    /// The `msg_type` discriminant wasn't one of the five wire-stable values.
    UnknownMsgType(urp_protocol::UnknownMsgType),
    /// The underlying MessagePack decode failed for a reason other than
    /// "not enough bytes yet".
    Decode(rmpv::decode::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnexpectedShape => {
                write!(f, "top-level value is neither a string nor a packet array")
            }
            CodecError::Malformed(why) => write!(f, "malformed packet: {why}"),
            CodecError::UnknownMsgType(e) => write!(f, "{e}"),
            CodecError::Decode(e) => write!(f, "messagepack decode error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<urp_protocol::UnknownMsgType> for CodecError {
    fn from(e: urp_protocol::UnknownMsgType) -> Self {
        CodecError::UnknownMsgType(e)
    }
}

/// Returns true if an `rmpv` decode error means "ran out of bytes", as
/// opposed to "the bytes we have are garbage".
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    let io_err = match err {
        rmpv::decode::Error::InvalidMarkerRead(e) => e,
        rmpv::decode::Error::InvalidDataRead(e) => e,
    };
    io_err.kind() == std::io::ErrorKind::UnexpectedEof
}

fn value_to_message(value: Value) -> Result<Message, CodecError> {
    match value {
        Value::String(s) => {
            let text = s
                .into_str()
                .ok_or(CodecError::Malformed("text frame was not valid UTF-8"))?;
            Ok(Message::Text(text))
        }
        Value::Array(mut items) => {
            if items.len() < 2 {
                return Err(CodecError::Malformed("packet array has fewer than 2 elements"));
            }
            let payload = items.split_off(2);
            let mut items = items.into_iter();
            let channel_id = items
                .next()
                .unwrap()
                .as_u64()
                .ok_or(CodecError::Malformed("channel_id is not a non-negative integer"))?;
            let msg_type = items
                .next()
                .unwrap()
                .as_u64()
                .ok_or(CodecError::Malformed("msg_type is not an integer"))?;
            let msg_type = MsgType::try_from(msg_type)?;
            Ok(Message::Packet(Packet {
                channel_id,
                msg_type,
                payload,
            }))
        }
        _ => Err(CodecError::UnexpectedShape),
    }
}

fn message_to_value(message: &Message) -> Value {
    match message {
        Message::Text(s) => Value::String(s.clone().into()),
        Message::Packet(packet) => {
            let mut items = Vec::with_capacity(2 + packet.payload.len());
            items.push(Value::from(packet.channel_id));
            items.push(Value::from(packet.msg_type.as_u64()));
            items.extend(packet.payload.iter().cloned());
            Value::Array(items)
        }
    }
}

/// A streaming MessagePack unpacker plus a stateless packer.
#[derive(Debug, Default)]
pub struct Codec {
    buf: BytesMut,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt to decode one complete top-level value from the front of the
    /// buffer. Returns `Ok(None)` if the buffer holds only a partial value;
    /// the partial bytes remain buffered for the next call.
    pub fn next(&mut self) -> Result<Option<Message>, CodecError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);
                Ok(Some(value_to_message(value)?))
            }
            Err(e) if is_incomplete(&e) => Ok(None),
            Err(e) => Err(CodecError::Decode(e)),
        }
    }

    /// Drain and return every complete message currently bufferable. Stops
    /// at the first partial value, deterministically and in arrival order.
    pub fn drain(&mut self) -> Result<Vec<Message>, CodecError> {
        let mut out = Vec::new();
        while let Some(msg) = self.next()? {
            out.push(msg);
        }
        Ok(out)
    }

    /// Serialize one message to bytes. Always succeeds: every value this
    /// protocol can carry (maps with string keys, sequences, integers,
    /// floats, booleans, null, binary, text) round-trips through `rmpv::Value`.
    pub fn pack(message: &Message) -> Vec<u8> {
        let value = message_to_value(message);
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &value).expect("encoding to a Vec<u8> cannot fail");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use urp_protocol::Packet;

    #[test]
    fn packet_round_trip() {
        let msg = Message::Packet(Packet::call_unfiltered(
            3,
            "example.Echo",
            Value::Map(vec![(Value::from("spam"), Value::from("eggs"))]),
        ));
        let bytes = Codec::pack(&msg);

        let mut codec = Codec::new();
        codec.feed(&bytes);
        let decoded = codec.next().unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(codec.next().unwrap().is_none());
    }

    #[test]
    fn text_frame_round_trip() {
        let msg = Message::Text("hello from stderr".to_string());
        let bytes = Codec::pack(&msg);

        let mut codec = Codec::new();
        codec.feed(&bytes);
        assert_eq!(codec.next().unwrap().unwrap(), msg);
    }

    #[test]
    fn feed_across_multiple_chunks_waits_for_whole_message() {
        let msg = Message::Packet(Packet::shoosh(5));
        let bytes = Codec::pack(&msg);
        assert!(bytes.len() > 1, "shoosh packet must be at least 2 bytes");

        let mut codec = Codec::new();
        codec.feed(&bytes[..1]);
        assert!(codec.next().unwrap().is_none());

        codec.feed(&bytes[1..]);
        assert_eq!(codec.next().unwrap().unwrap(), msg);
    }

    #[test]
    fn drain_yields_multiple_messages_in_order() {
        let a = Message::Packet(Packet::shoosh(1));
        let b = Message::Packet(Packet::shoosh(2));
        let mut bytes = Codec::pack(&a);
        bytes.extend(Codec::pack(&b));

        let mut codec = Codec::new();
        codec.feed(&bytes);
        let msgs = codec.drain().unwrap();
        assert_eq!(msgs, vec![a, b]);
    }

    #[test]
    fn empty_array_is_malformed() {
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &Value::Array(vec![])).unwrap();

        let mut codec = Codec::new();
        codec.feed(&out);
        let err = codec.next().unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn unknown_msg_type_is_rejected() {
        let value = Value::Array(vec![Value::from(1u64), Value::from(99u64)]);
        let mut out = Vec::new();
        rmpv::encode::write_value(&mut out, &value).unwrap();

        let mut codec = Codec::new();
        codec.feed(&out);
        let err = codec.next().unwrap_err();
        assert!(matches!(err, CodecError::UnknownMsgType(_)));
    }
}
