//! Message model and its binary envelope.
//!
//! Envelope layout (big-endian):
//!
//! ```text
//! u16 version | u8 id_len | u16 tag_len | u8 publisher_len | u8 timestamp_len
//! | u8 content_type_len | u32 payload_len | id | tag | publisher | timestamp | content_type | payload
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const ENVELOPE_VERSION: u16 = 4;
const HEADER_LEN: usize = 2 + 1 + 2 + 1 + 1 + 1 + 4;
const TIMESTAMP_WIDTH: u8 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("envelope truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u16),
    #[error("field `{0}` is not valid utf-8")]
    InvalidUtf8(&'static str),
    #[error("unsupported timestamp width {0}")]
    TimestampWidth(u8),
    #[error("field `{field}` is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    pub publisher: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(
        default,
        rename = "contenttype",
        skip_serializing_if = "Option::is_none"
    )]
    pub content_type: Option<String>,
    #[serde(
        rename = "contentdata",
        serialize_with = "serialize_payload",
        deserialize_with = "deserialize_payload"
    )]
    pub payload: Bytes,
}

impl Message {
    pub fn new(publisher: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            publisher: publisher.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let id = checked("id", self.id.as_bytes(), u8::MAX as usize)?;
        let tag = checked(
            "tag",
            self.tag.as_deref().unwrap_or_default().as_bytes(),
            u16::MAX as usize,
        )?;
        let publisher = checked("publisher", self.publisher.as_bytes(), u8::MAX as usize)?;
        let content_type = checked(
            "content_type",
            self.content_type.as_deref().unwrap_or_default().as_bytes(),
            u8::MAX as usize,
        )?;
        let payload = checked("payload", &self.payload, u32::MAX as usize)?;

        let mut buf = BytesMut::with_capacity(
            HEADER_LEN
                + id.len()
                + tag.len()
                + publisher.len()
                + TIMESTAMP_WIDTH as usize
                + content_type.len()
                + payload.len(),
        );
        buf.put_u16(ENVELOPE_VERSION);
        buf.put_u8(id.len() as u8);
        buf.put_u16(tag.len() as u16);
        buf.put_u8(publisher.len() as u8);
        buf.put_u8(TIMESTAMP_WIDTH);
        buf.put_u8(content_type.len() as u8);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(id);
        buf.put_slice(tag);
        buf.put_slice(publisher);
        buf.put_i64(self.timestamp);
        buf.put_slice(content_type);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let version = reader.u16()?;
        if version != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let id_len = reader.u8()? as usize;
        let tag_len = reader.u16()? as usize;
        let publisher_len = reader.u8()? as usize;
        let timestamp_len = reader.u8()?;
        let content_type_len = reader.u8()? as usize;
        let payload_len = reader.u32()? as usize;

        let id = reader.string("id", id_len)?;
        let tag = reader.string("tag", tag_len)?;
        let publisher = reader.string("publisher", publisher_len)?;
        let timestamp = match timestamp_len {
            0 => 0,
            TIMESTAMP_WIDTH => reader.i64()?,
            other => return Err(CodecError::TimestampWidth(other)),
        };
        let content_type = reader.string("content_type", content_type_len)?;
        let payload = Bytes::copy_from_slice(reader.take(payload_len)?);

        Ok(Self {
            id,
            publisher,
            timestamp,
            tag: non_empty(tag),
            content_type: non_empty(content_type),
            payload,
        })
    }
}

fn checked<'a>(field: &'static str, bytes: &'a [u8], max: usize) -> Result<&'a [u8], CodecError> {
    if bytes.len() > max {
        return Err(CodecError::FieldTooLong {
            field,
            len: bytes.len(),
            max,
        });
    }
    Ok(bytes)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Bounds-checked big-endian cursor shared with the frame codec.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                needed: self.pos + len,
                available: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, CodecError> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        Ok(u16::from_be_bytes(raw))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, CodecError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(raw))
    }

    pub(crate) fn i64(&mut self) -> Result<i64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(raw))
    }

    pub(crate) fn string(&mut self, field: &'static str, len: usize) -> Result<String, CodecError> {
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8(field))
    }
}

fn serialize_payload<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(payload))
}

fn deserialize_payload<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    STANDARD
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}
