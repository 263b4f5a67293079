//! Binary frames exchanged on the real-time socket.
//!
//! ```text
//! PING     0x9
//! PONG     0xA
//! ACK      0xB [u8 id_len | id]
//! MSG      0xD | u32 envelope_len | envelope
//! RECEIPT  0xE | u8 id_len | u8 timestamp_len | id | i64 timestamp
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{CodecError, Message, Reader};

pub const OPCODE_PING: u8 = 0x9;
pub const OPCODE_PONG: u8 = 0xA;
pub const OPCODE_ACK: u8 = 0xB;
pub const OPCODE_MSG: u8 = 0xD;
pub const OPCODE_RECEIPT: u8 = 0xE;

const TIMESTAMP_WIDTH: u8 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("malformed frame: {0}")]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Ping,
    Message(Message),
    /// Acknowledges a pushed message; `None` acknowledges the oldest
    /// outstanding push.
    Ack(Option<String>),
}

pub fn decode_client_frame(bytes: &[u8]) -> Result<ClientFrame, FrameError> {
    let (&opcode, rest) = bytes.split_first().ok_or(FrameError::Empty)?;
    match opcode {
        OPCODE_PING => Ok(ClientFrame::Ping),
        OPCODE_ACK => {
            if rest.is_empty() {
                return Ok(ClientFrame::Ack(None));
            }
            let mut reader = Reader::new(rest);
            let len = reader.u8()? as usize;
            let id = reader.string("ack id", len)?;
            Ok(ClientFrame::Ack(Some(id)))
        }
        OPCODE_MSG => Ok(ClientFrame::Message(decode_envelope(rest)?)),
        other => Err(FrameError::UnknownOpcode(other)),
    }
}

pub fn pong() -> Bytes {
    Bytes::from_static(&[OPCODE_PONG])
}

pub fn encode_message_frame(message: &Message) -> Result<Bytes, FrameError> {
    let envelope = message.encode()?;
    let mut buf = BytesMut::with_capacity(1 + 4 + envelope.len());
    buf.put_u8(OPCODE_MSG);
    buf.put_u32(envelope.len() as u32);
    buf.put_slice(&envelope);
    Ok(buf.freeze())
}

/// Server-side view of a MSG frame, used by clients and tests.
pub fn decode_message_frame(bytes: &[u8]) -> Result<Message, FrameError> {
    match bytes.split_first() {
        Some((&OPCODE_MSG, rest)) => decode_envelope(rest),
        Some((&other, _)) => Err(FrameError::UnknownOpcode(other)),
        None => Err(FrameError::Empty),
    }
}

pub fn encode_receipt(id: &str, timestamp: i64) -> Result<Bytes, FrameError> {
    if id.len() > u8::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field: "receipt id",
            len: id.len(),
            max: u8::MAX as usize,
        }
        .into());
    }
    let mut buf = BytesMut::with_capacity(3 + id.len() + TIMESTAMP_WIDTH as usize);
    buf.put_u8(OPCODE_RECEIPT);
    buf.put_u8(id.len() as u8);
    buf.put_u8(TIMESTAMP_WIDTH);
    buf.put_slice(id.as_bytes());
    buf.put_i64(timestamp);
    Ok(buf.freeze())
}

pub fn decode_receipt(bytes: &[u8]) -> Result<(String, i64), FrameError> {
    let rest = match bytes.split_first() {
        Some((&OPCODE_RECEIPT, rest)) => rest,
        Some((&other, _)) => return Err(FrameError::UnknownOpcode(other)),
        None => return Err(FrameError::Empty),
    };
    let mut reader = Reader::new(rest);
    let id_len = reader.u8()? as usize;
    let ts_len = reader.u8()?;
    if ts_len != TIMESTAMP_WIDTH {
        return Err(CodecError::TimestampWidth(ts_len).into());
    }
    let id = reader.string("receipt id", id_len)?;
    let timestamp = reader.i64()?;
    Ok((id, timestamp))
}

pub fn encode_ack(id: &str) -> Result<Bytes, FrameError> {
    if id.len() > u8::MAX as usize {
        return Err(CodecError::FieldTooLong {
            field: "ack id",
            len: id.len(),
            max: u8::MAX as usize,
        }
        .into());
    }
    let mut buf = BytesMut::with_capacity(2 + id.len());
    buf.put_u8(OPCODE_ACK);
    buf.put_u8(id.len() as u8);
    buf.put_slice(id.as_bytes());
    Ok(buf.freeze())
}

fn decode_envelope(rest: &[u8]) -> Result<Message, FrameError> {
    let mut reader = Reader::new(rest);
    let len = reader.u32()? as usize;
    let envelope = reader.take(len)?;
    Ok(Message::decode(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ack_targets_oldest_push() {
        assert_eq!(decode_client_frame(&[OPCODE_ACK]), Ok(ClientFrame::Ack(None)));
        let framed = encode_ack("abc").expect("ack");
        assert_eq!(
            decode_client_frame(&framed),
            Ok(ClientFrame::Ack(Some("abc".into())))
        );
    }

    #[test]
    fn msg_frame_carries_length_prefixed_envelope() {
        let message = Message::new("camera", &b"payload"[..]);
        let framed = encode_message_frame(&message).expect("frame");
        assert_eq!(framed[0], OPCODE_MSG);
        let declared = u32::from_be_bytes([framed[1], framed[2], framed[3], framed[4]]) as usize;
        assert_eq!(declared, framed.len() - 5);
        assert_eq!(
            decode_client_frame(&framed),
            Ok(ClientFrame::Message(message))
        );
    }

    #[test]
    fn receipt_layout_matches_wire_format() {
        let receipt = encode_receipt("abc", 1000).expect("receipt");
        assert_eq!(&receipt[..3], &[OPCODE_RECEIPT, 3, 8]);
        assert_eq!(&receipt[3..6], b"abc");
        assert_eq!(&receipt[6..], &1000i64.to_be_bytes());
        assert_eq!(decode_receipt(&receipt), Ok(("abc".to_string(), 1000)));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert_eq!(decode_client_frame(&[]), Err(FrameError::Empty));
        assert_eq!(decode_client_frame(&[0x42]), Err(FrameError::UnknownOpcode(0x42)));
        assert!(matches!(
            decode_client_frame(&[OPCODE_MSG, 0, 0, 0, 9, 1]),
            Err(FrameError::Codec(CodecError::Truncated { .. }))
        ));
    }
}
