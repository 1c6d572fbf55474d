//! Message encoding and decoding.
//!
//! Two codecs are provided: a JSON codec for readable traffic and logs, and a
//! framed postcard codec with a length prefix and a CRC32 checksum.

use crate::protocol::{Envelope, PROTOCOL_MAGIC, PROTOCOL_VERSION};
use thiserror::Error;

/// Largest payload a frame may announce.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frame header: `[length: u32][crc32: u32]`.
const FRAME_HEADER_LEN: usize = 8;

/// Errors raised while encoding or decoding messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("failed to encode message: {0}")]
    Encode(String),
    /// Payload could not be deserialized.
    #[error("failed to decode message: {0}")]
    Decode(String),
    /// Frame shorter than its header.
    #[error("frame too short: {len} bytes (minimum 8)")]
    FrameTooShort {
        /// Received length.
        len: usize,
    },
    /// Frame announces more bytes than it carries.
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame {
        /// Announced length including header.
        expected: usize,
        /// Received length.
        actual: usize,
    },
    /// Frame announces an oversized payload.
    #[error("frame payload of {len} bytes exceeds the frame size limit")]
    FrameTooLarge {
        /// Announced payload length.
        len: usize,
    },
    /// Payload checksum does not match the header.
    #[error("frame checksum mismatch: header {expected:08x}, payload {actual:08x}")]
    ChecksumMismatch {
        /// Checksum in the header.
        expected: u32,
        /// Checksum of the received payload.
        actual: u32,
    },
    /// Sender speaks another protocol version.
    #[error("protocol version mismatch: got v{actual}, expected v{expected}")]
    VersionMismatch {
        /// Local version.
        expected: u16,
        /// Remote version.
        actual: u16,
    },
}

/// Message serialization seam.
pub trait Codec {
    /// Short codec name.
    fn name(&self) -> &'static str;

    /// Encode an envelope to bytes.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to an envelope, rejecting foreign protocol versions.
    fn decode(&self, data: &[u8]) -> Result<Envelope, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        let envelope: Envelope =
            serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))?;
        check_version(envelope)
    }
}

/// Compact binary codec.
///
/// Frame format: `[length: u32][crc32: u32][postcard payload]`, where the
/// length excludes the header.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Codec for FrameCodec {
    fn name(&self) -> &'static str {
        "frame"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let payload =
            postcard::to_allocvec(envelope).map_err(|e| CodecError::Encode(e.to_string()))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge { len: payload.len() });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, CodecError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(CodecError::FrameTooShort { len: data.len() });
        }

        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge { len: length });
        }
        if data.len() < FRAME_HEADER_LEN + length {
            return Err(CodecError::IncompleteFrame {
                expected: FRAME_HEADER_LEN + length,
                actual: data.len(),
            });
        }

        let expected = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let payload = &data[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length];
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let envelope: Envelope =
            postcard::from_bytes(payload).map_err(|e| CodecError::Decode(e.to_string()))?;
        check_version(envelope)
    }
}

fn check_version(envelope: Envelope) -> Result<Envelope, CodecError> {
    if envelope.version != PROTOCOL_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: envelope.version,
        });
    }
    Ok(envelope)
}

/// Compute schema hash from protocol definitions.
///
/// Sent with the identity assignment so a client can detect an incompatible
/// server build.
pub fn compute_schema_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    hasher.update(PROTOCOL_MAGIC);
    for name in [
        "Envelope",
        "Spawn",
        "Update",
        "Despawn",
        "OwnerChange",
        "IdentityAssignment",
        "ResyncRequest",
        "Input",
    ] {
        hasher.update(name.as_bytes());
    }
    let hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Message, SpawnMessage, UpdateMessage};
    use netsync_core::{Authority, ComponentMap, ComponentValue, ConnectionId, NetId};

    fn spawn() -> Envelope {
        Envelope::new(
            42,
            Message::Spawn(SpawnMessage {
                net_id: NetId(30001),
                owner_client: Some(ConnectionId(3)),
                authority: Authority::Owner,
                parent_net_id: Some(NetId(9)),
                components: ComponentMap::new()
                    .with("Transform", ComponentValue::Vec3([1.0, 2.0, 3.0]))
                    .with("Name", ComponentValue::from("crate")),
            }),
        )
    }

    #[test]
    fn test_schema_hash_deterministic() {
        assert_eq!(compute_schema_hash(), compute_schema_hash());
        assert_ne!(compute_schema_hash(), 0);
    }

    #[test]
    fn test_both_codecs_carry_spawn() {
        let envelope = spawn();
        for codec in [&JsonCodec as &dyn Codec, &FrameCodec] {
            let bytes = codec.encode(&envelope).expect("encode");
            let decoded = codec.decode(&bytes).expect("decode");
            assert_eq!(decoded, envelope, "codec {}", codec.name());
        }
    }

    #[test]
    fn test_frame_checksum_detects_corruption() {
        let mut bytes = FrameCodec.encode(&spawn()).expect("encode");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            FrameCodec.decode(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            FrameCodec.decode(&[1, 2, 3]),
            Err(CodecError::FrameTooShort { len: 3 })
        ));
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let data = [10, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            FrameCodec.decode(&data),
            Err(CodecError::IncompleteFrame { expected: 18, actual: 8 })
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut envelope = Envelope::new(
            1,
            Message::Update(UpdateMessage {
                net_id: NetId(1),
                owner_client: None,
                components: ComponentMap::new().with("Hp", ComponentValue::Int(3)),
                seq: None,
                ack_seq: Some(4),
            }),
        );
        envelope.version = PROTOCOL_VERSION + 1;
        let bytes = JsonCodec.encode(&envelope).expect("encode");
        assert!(matches!(
            JsonCodec.decode(&bytes),
            Err(CodecError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(matches!(
            JsonCodec.decode(b"{not json"),
            Err(CodecError::Decode(_))
        ));
    }
}
