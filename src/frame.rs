//! Application frame codec.
//!
//! A frame is one message of the reassembled KCP stream. All numbers big-endian:
//! ```ascii
//! 0:  magic 0x4567 (u16)
//! 2:  message type id (u16)
//! 4:  reserved (u8)
//! 5:  metadata length (u8)
//! 6:  reserved (u16)
//! 8:  payload length (u16)
//! 10: metadata (PacketHead schema)
//! ..: payload (schema of the message type)
//! ..: magic 0x89AB (u16)
//! ```
//!
//! The whole frame is XORed with a keystream, so a frame read with the wrong keystream fails the
//!  magic check.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::{json, Value};

use crate::crypto::Keystream;
use crate::schema::{MessageTypeRegistry, SchemaProvider, PACKET_HEAD_SCHEMA};
use crate::util::clock::unix_millis;

pub const HEAD_MAGIC: u16 = 0x4567;
pub const TAIL_MAGIC: u16 = 0x89AB;

const HEADER_LEN: usize = 10;
const TAIL_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes is too short")]
    TooShort(usize),
    #[error("frame magic does not match")]
    BadMagic,
    #[error("frame declares {declared} bytes but has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{what} of {len} bytes does not fit into the frame header")]
    TooLarge { what: &'static str, len: usize },
    #[error("message type {0} is not registered")]
    UnknownMessageType(u16),
    #[error("no message type is registered for {0}")]
    UnknownMessageName(String),
    #[error("schema {schema} ({id}): {reason}")]
    Schema { id: u16, schema: String, reason: String },
}

impl FrameError {
    /// Wire garbage or traffic under a different keystream, as opposed to a well-formed frame that
    ///  could not be processed
    pub fn is_noise(&self) -> bool {
        matches!(self, FrameError::TooShort(_) | FrameError::BadMagic | FrameError::LengthMismatch { .. })
    }
}

/// A frame with its header fields parsed, but metadata and payload still schema-encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub message_type: u16,
    pub metadata: Bytes,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn serialized_len(&self) -> usize {
        HEADER_LEN + self.metadata.len() + self.payload.len() + TAIL_LEN
    }

    pub fn ser(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let metadata_len = u8::try_from(self.metadata.len())
            .map_err(|_| FrameError::TooLarge { what: "metadata", len: self.metadata.len() })?;
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| FrameError::TooLarge { what: "payload", len: self.payload.len() })?;

        buf.reserve(self.serialized_len());
        buf.put_u16(HEAD_MAGIC);
        buf.put_u16(self.message_type);
        buf.put_u8(0);
        buf.put_u8(metadata_len);
        buf.put_u16(0);
        buf.put_u16(payload_len);
        buf.put_slice(&self.metadata);
        buf.put_slice(&self.payload);
        buf.put_u16(TAIL_MAGIC);
        Ok(())
    }

    /// Parses a plaintext frame. The buffer must hold exactly one frame.
    pub fn deser(frame: &[u8]) -> Result<RawFrame, FrameError> {
        if frame.len() < HEADER_LEN + TAIL_LEN {
            return Err(FrameError::TooShort(frame.len()));
        }

        let mut buf = frame;
        if buf.get_u16() != HEAD_MAGIC {
            return Err(FrameError::BadMagic);
        }
        if (&frame[frame.len() - TAIL_LEN..]).get_u16() != TAIL_MAGIC {
            return Err(FrameError::BadMagic);
        }

        let message_type = buf.get_u16();
        let _reserved = buf.get_u8();
        let metadata_len = buf.get_u8() as usize;
        let _reserved = buf.get_u16();
        let payload_len = buf.get_u16() as usize;

        let declared = HEADER_LEN + metadata_len + payload_len + TAIL_LEN;
        if declared != frame.len() {
            return Err(FrameError::LengthMismatch { declared, actual: frame.len() });
        }

        let body = &frame[HEADER_LEN..frame.len() - TAIL_LEN];
        Ok(RawFrame {
            message_type,
            metadata: Bytes::copy_from_slice(&body[..metadata_len]),
            payload: Bytes::copy_from_slice(&body[metadata_len..]),
        })
    }

    /// serializes and obfuscates the frame
    pub fn encode(&self, keystream: &Keystream) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf)?;
        keystream.apply(&mut buf);
        Ok(buf.freeze())
    }

    /// de-obfuscates and parses a frame
    pub fn decode(mut frame: Vec<u8>, keystream: &Keystream) -> Result<RawFrame, FrameError> {
        keystream.apply(&mut frame);
        Self::deser(&frame)
    }
}

/// A fully decoded message
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub message_type: u16,
    pub name: String,
    /// sender's timestamp from the metadata block, if it had one
    pub sent_ms: Option<u64>,
    pub payload: Value,
}

/// Frame codec on the schema level: resolves message types against the registry and encodes /
///  decodes metadata and payload through the schema provider
#[derive(Clone)]
pub struct FrameCodec {
    registry: Arc<MessageTypeRegistry>,
    schemas: Arc<dyn SchemaProvider>,
}

impl FrameCodec {
    pub fn new(registry: Arc<MessageTypeRegistry>, schemas: Arc<dyn SchemaProvider>) -> FrameCodec {
        FrameCodec {
            registry,
            schemas,
        }
    }

    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.registry
    }

    pub fn encode(&self, message_type: u16, payload: &Value, keystream: &Keystream) -> Result<Bytes, FrameError> {
        let name = self.registry.name_of(message_type)
            .ok_or(FrameError::UnknownMessageType(message_type))?;

        let metadata = self.schemas.encode(PACKET_HEAD_SCHEMA, &json!({ "sentMs": unix_millis() }))
            .map_err(|e| schema_error(message_type, PACKET_HEAD_SCHEMA, e))?;
        let payload = self.schemas.encode(name, payload)
            .map_err(|e| schema_error(message_type, name, e))?;

        RawFrame {
            message_type,
            metadata: metadata.into(),
            payload: payload.into(),
        }.encode(keystream)
    }

    /// Encodes a message by schema name, stripping a resend suffix if necessary. Returns the
    ///  message type id with the frame.
    pub fn encode_named(&self, name: &str, payload: &Value, keystream: &Keystream) -> Result<(u16, Bytes), FrameError> {
        let (message_type, _) = self.registry.resolve_outbound(name)
            .ok_or_else(|| FrameError::UnknownMessageName(name.to_string()))?;
        let frame = self.encode(message_type, payload, keystream)?;
        Ok((message_type, frame))
    }

    pub fn decode(&self, frame: Vec<u8>, keystream: &Keystream) -> Result<DecodedMessage, FrameError> {
        let raw = RawFrame::decode(frame, keystream)?;
        self.decode_raw(&raw)
    }

    /// schema-level decoding of a frame whose header was already parsed
    pub fn decode_raw(&self, raw: &RawFrame) -> Result<DecodedMessage, FrameError> {
        let message_type = raw.message_type;
        if self.registry.name_of(message_type).is_none() {
            return Err(FrameError::UnknownMessageType(message_type));
        }

        let sent_ms = if raw.metadata.is_empty() {
            None
        }
        else {
            let head = self.schemas.decode(PACKET_HEAD_SCHEMA, &raw.metadata)
                .map_err(|e| schema_error(message_type, PACKET_HEAD_SCHEMA, e))?;
            head.get("sentMs").and_then(Value::as_u64)
        };

        let mut message = self.decode_payload(message_type, &raw.payload)?;
        message.sent_ms = sent_ms;
        Ok(message)
    }

    /// decodes a bare payload of the given message type, e.g. a message embedded in another one
    pub fn decode_payload(&self, message_type: u16, payload: &[u8]) -> Result<DecodedMessage, FrameError> {
        let name = self.registry.name_of(message_type)
            .ok_or(FrameError::UnknownMessageType(message_type))?;
        let payload = self.schemas.decode(name, payload)
            .map_err(|e| schema_error(message_type, name, e))?;

        Ok(DecodedMessage {
            message_type,
            name: name.to_string(),
            sent_ms: None,
            payload,
        })
    }
}

fn schema_error(id: u16, schema: &str, e: anyhow::Error) -> FrameError {
    FrameError::Schema {
        id,
        schema: schema.to_string(),
        reason: e.to_string(),
    }
}
