// Payload codecs: how a Message travels inside a broker record.
use crate::{Message, MessageError, MessageFactory, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MAGIC: u32 = 0x4C50_4D31;
pub const VERSION: u16 = 1;
// magic + version + sequence + id len + created nanos + payload len
const FIXED_LEN: usize = 4 + 2 + 8 + 2 + 8 + 4;

pub trait Encoder: Send + Sync {
    fn encode(&self, message: &Message) -> Result<Bytes>;
}

pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// Convenience bound for types that do both directions.
pub trait Codec: Encoder + Decoder {}

impl<T: Encoder + Decoder> Codec for T {}

/// Compact big-endian framing of every message field.
///
/// ```
/// use lossprobe_common::{BinaryCodec, Decoder, Encoder, MessageFactory};
///
/// let message = MessageFactory::with_payload_bytes(16).next();
/// let bytes = BinaryCodec.encode(&message).expect("encode");
/// assert_eq!(BinaryCodec.decode(&bytes).expect("decode"), message);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Encoder for BinaryCodec {
    fn encode(&self, message: &Message) -> Result<Bytes> {
        let id = message.id().as_bytes();
        let id_len = u16::try_from(id.len()).map_err(|_| MessageError::TooLarge("id"))?;
        let payload_len = u32::try_from(message.payload().len())
            .map_err(|_| MessageError::TooLarge("payload"))?;
        // Timestamps before the epoch collapse to zero.
        let created_nanos = message
            .created_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        let created_nanos =
            u64::try_from(created_nanos).map_err(|_| MessageError::TooLarge("created_time"))?;

        let mut buf = BytesMut::with_capacity(FIXED_LEN + id.len() + message.payload().len());
        buf.put_u32(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u64(message.sequence());
        buf.put_u16(id_len);
        buf.extend_from_slice(id);
        buf.put_u64(created_nanos);
        buf.put_u32(payload_len);
        buf.extend_from_slice(message.payload());
        Ok(buf.freeze())
    }
}

impl Decoder for BinaryCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let mut buf = bytes;
        if buf.remaining() < FIXED_LEN {
            return Err(MessageError::Incomplete);
        }
        if buf.get_u32() != MAGIC {
            return Err(MessageError::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(MessageError::UnsupportedVersion(version));
        }
        let sequence = buf.get_u64();
        let id_len = buf.get_u16() as usize;
        if buf.remaining() < id_len + 8 + 4 {
            return Err(MessageError::Incomplete);
        }
        let id = std::str::from_utf8(&buf[..id_len])
            .map_err(|_| MessageError::InvalidId)?
            .to_string();
        buf.advance(id_len);
        let created_time = UNIX_EPOCH + Duration::from_nanos(buf.get_u64());
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() < payload_len {
            return Err(MessageError::Incomplete);
        }
        let payload = Bytes::copy_from_slice(&buf[..payload_len]);
        Ok(Message::from_parts(sequence, id, created_time, payload))
    }
}

/// Sends the payload untouched and rebuilds messages on read.
///
/// Meant for bridging payloads produced by some other system: the decoded
/// message gets a fresh sequence and id from the factory and is stamped with
/// the time it was read, so latency measured through it is zero and identity
/// has to come from the payload itself.
#[derive(Debug, Clone)]
pub struct OpaqueCodec {
    factory: Arc<MessageFactory>,
}

impl OpaqueCodec {
    pub fn new(factory: Arc<MessageFactory>) -> Self {
        Self { factory }
    }
}

impl Encoder for OpaqueCodec {
    fn encode(&self, message: &Message) -> Result<Bytes> {
        Ok(message.payload().clone())
    }
}

impl Decoder for OpaqueCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        Ok(self
            .factory
            .wrap(Bytes::copy_from_slice(bytes), SystemTime::now()))
    }
}
