// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic packet framing and CBOR helpers for the local transport.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR [`OpEnvelope`]
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{ErrorPayload, InboundFrame, Message, OpEnvelope, SubscribePayload, UnsubscribePayload};

/// Protocol magic constant "STRD".
pub const MAGIC: [u8; 4] = [0x53, 0x54, 0x52, 0x44];
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (set to zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes.
pub const HEADER_BYTES: usize = 12;
/// Trailing checksum length in bytes.
pub const CHECKSUM_BYTES: usize = 32;
/// Default upper bound on a single payload.
pub const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Framing or codec failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the header announces.
    #[error("incomplete packet")]
    Incomplete,
    /// First four bytes are not [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Header carries a version this build does not speak.
    #[error("unsupported version {0:#06x}")]
    UnsupportedVersion(u16),
    /// Checksum does not cover header and payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Payload length above the configured bound.
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Announced or actual payload length.
        len: usize,
        /// Limit in force.
        max: usize,
    },
    /// Envelope names an op this build does not know.
    #[error("unknown op {0}")]
    UnknownOp(String),
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

impl WireError {
    /// The packet was framed and checksummed correctly; only its content is
    /// unusable, so the byte stream is still in sync.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, Self::UnknownOp(_) | Self::Decode(_))
    }
}

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header.
    pub header: [u8; HEADER_BYTES],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_BYTES],
}

impl Packet {
    /// Build a packet from a CBOR payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        let len = u32::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;
        let mut header = [0u8; HEADER_BYTES];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&len.to_be_bytes());
        let checksum = checksum(&header, &payload);
        Ok(Self {
            header,
            payload,
            checksum,
        })
    }

    /// Concatenated packet bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.payload.len() + CHECKSUM_BYTES);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }

    /// Encode an `OpEnvelope` into a full packet byte vector.
    pub fn encode_envelope<P: Serialize>(env: &OpEnvelope<P>) -> Result<Vec<u8>, WireError> {
        let payload = to_cbor(env)?;
        Ok(Self::from_payload(payload)?.to_bytes())
    }

    /// Decode a packet from a byte slice, returning the envelope and bytes consumed.
    pub fn decode_envelope<P: DeserializeOwned>(
        bytes: &[u8],
    ) -> Result<(OpEnvelope<P>, usize), WireError> {
        if bytes.len() < HEADER_BYTES + CHECKSUM_BYTES {
            return Err(WireError::Incomplete);
        }
        if bytes[0..4] != MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let total = HEADER_BYTES + len + CHECKSUM_BYTES;
        if bytes.len() < total {
            return Err(WireError::Incomplete);
        }
        let header = &bytes[0..HEADER_BYTES];
        let payload = &bytes[HEADER_BYTES..HEADER_BYTES + len];
        if checksum(header, payload) != bytes[HEADER_BYTES + len..total] {
            return Err(WireError::ChecksumMismatch);
        }
        let env: OpEnvelope<P> = from_cbor(payload)?;
        Ok((env, total))
    }
}

fn to_value<T: Serialize>(payload: &T) -> Result<Value, WireError> {
    Value::serialized(payload).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: &Value) -> Result<T, WireError> {
    value
        .deserialized()
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// Encode a `Message` into a packet with the provided logical timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, WireError> {
    let payload = match msg {
        Message::Subscribe(p) | Message::Restart(p) => to_value(p)?,
        Message::Unsubscribe(p) => to_value(p)?,
        Message::Stream(frame) => to_value(frame)?,
        Message::Error(p) => to_value(p)?,
    };
    let env = OpEnvelope {
        op: msg.op_name().to_owned(),
        ts,
        payload,
    };
    Packet::encode_envelope(&env)
}

/// Decode bytes into (Message, ts, bytes_consumed).
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), WireError> {
    let (env, used) = Packet::decode_envelope::<Value>(bytes)?;
    let msg = match env.op.as_str() {
        "subscribe" => Message::Subscribe(from_value::<SubscribePayload>(&env.payload)?),
        "unsubscribe" => Message::Unsubscribe(from_value::<UnsubscribePayload>(&env.payload)?),
        "restart" => Message::Restart(from_value::<SubscribePayload>(&env.payload)?),
        "stream" => Message::Stream(from_value::<InboundFrame>(&env.payload)?),
        "error" => Message::Error(from_value::<ErrorPayload>(&env.payload)?),
        other => return Err(WireError::UnknownOp(other.to_owned())),
    };
    Ok((msg, env.ts, used))
}

/// Total packet length announced by the header at the front of `buf`, or
/// `None` until the header is complete.
pub fn packet_len(buf: &[u8], max_payload: usize) -> Result<Option<usize>, WireError> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if len > max_payload {
        return Err(WireError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }
    Ok(Some(HEADER_BYTES + len + CHECKSUM_BYTES))
}

/// Drain one complete packet from the front of an accumulator, leaving any
/// remainder in place.
pub fn try_extract_packet(acc: &mut Vec<u8>, max_payload: usize) -> Result<Option<Vec<u8>>, WireError> {
    let Some(total) = packet_len(acc, max_payload)? else {
        return Ok(None);
    };
    if acc.len() < total {
        return Ok(None);
    }
    Ok(Some(acc.drain(..total).collect()))
}
