//! Fuzz-style property tests for the wire codecs
//!
//! These tests validate that decoders handle arbitrary network input
//! gracefully without crashing.

use netsync_core::{Authority, ComponentMap, ComponentValue, ConnectionId, NetId};
use netsync_net::{
    Codec, Envelope, FrameCodec, JsonCodec, Message, SpawnMessage, UpdateMessage,
    PROTOCOL_VERSION,
};
use proptest::prelude::*;

fn spawn_envelope(net_id: u64, x: f32, tag: &str) -> Envelope {
    Envelope::new(
        7,
        Message::Spawn(SpawnMessage {
            net_id: NetId(net_id),
            owner_client: Some(ConnectionId(3)),
            authority: Authority::Owner,
            parent_net_id: None,
            components: ComponentMap::new()
                .with("Transform", ComponentValue::Vec3([x, 0.0, -x]))
                .with("Tag", ComponentValue::Str(tag.to_string())),
        }),
    )
}

proptest! {
    /// Property: Arbitrary bytes don't crash the JSON decoder
    #[test]
    fn arbitrary_bytes_dont_crash_json(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _result = JsonCodec.decode(&random_bytes);
        // No panic = success
    }

    /// Property: Arbitrary bytes don't crash the frame decoder
    #[test]
    fn arbitrary_bytes_dont_crash_frame(
        random_bytes in prop::collection::vec(any::<u8>(), 0..2000),
    ) {
        let _result = FrameCodec.decode(&random_bytes);
        // No panic = success
    }

    /// Property: Spawns survive both codecs unchanged
    #[test]
    fn spawn_roundtrips(
        net_id in any::<u64>(),
        x in -1.0e6f32..1.0e6,
        tag in "[a-z]{0,16}",
    ) {
        let envelope = spawn_envelope(net_id, x, &tag);
        for codec in [&JsonCodec as &dyn Codec, &FrameCodec] {
            let encoded = codec.encode(&envelope).unwrap();
            let decoded = codec.decode(&encoded).unwrap();
            prop_assert_eq!(&envelope, &decoded);
        }
    }

    /// Property: Truncated frames don't crash
    #[test]
    fn truncated_frames_handled(
        truncate_at in 0usize..80,
    ) {
        let mut encoded = FrameCodec.encode(&spawn_envelope(1, 1.0, "crate")).unwrap();

        if truncate_at < encoded.len() {
            encoded.truncate(truncate_at);
            prop_assert!(FrameCodec.decode(&encoded).is_err());
        }
    }

    /// Property: Oversized length prefix handled
    #[test]
    fn oversized_length_handled(
        claimed_length in 100u32..u32::MAX,
    ) {
        let mut frame = Vec::new();
        frame.extend_from_slice(&claimed_length.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        frame.extend_from_slice(&[0, 1, 2, 3, 4]);

        prop_assert!(FrameCodec.decode(&frame).is_err());
    }

    /// Property: Corrupted payload is caught by the checksum
    #[test]
    fn corrupted_payload_handled(
        flip_pos in 0usize..30,
        flip_bit in 0u8..8,
    ) {
        let mut encoded = FrameCodec.encode(&spawn_envelope(42, 2.5, "door")).unwrap();

        if flip_pos + 8 < encoded.len() {
            encoded[flip_pos + 8] ^= 1 << flip_bit;
            prop_assert!(FrameCodec.decode(&encoded).is_err());
        }
    }

    /// Property: Corrupted JSON never panics
    #[test]
    fn corrupted_json_handled(
        flip_pos in 0usize..200,
        flip_bit in 0u8..8,
    ) {
        let mut encoded = JsonCodec.encode(&spawn_envelope(42, 2.5, "door")).unwrap();

        if flip_pos < encoded.len() {
            encoded[flip_pos] ^= 1 << flip_bit;
            let _result = JsonCodec.decode(&encoded);
            // May succeed or fail - just shouldn't panic
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn empty_frame_fails() {
        assert!(JsonCodec.decode(&[]).is_err());
        assert!(FrameCodec.decode(&[]).is_err());
    }

    #[test]
    fn too_short_fails() {
        assert!(FrameCodec.decode(&[1, 2, 3]).is_err());
    }

    /// Frame whose only component is a list nested `levels` deep.
    fn nested_frame(levels: usize) -> Vec<u8> {
        let envelope = Envelope::new(
            1,
            Message::Spawn(SpawnMessage {
                net_id: NetId(1),
                owner_client: None,
                authority: Authority::Server,
                parent_net_id: None,
                components: ComponentMap::new().with("Deep", ComponentValue::Null),
            }),
        );
        let mut payload = FrameCodec.encode(&envelope).unwrap()[8..].to_vec();
        // The trailing byte is the `Null` tag; wrap it in `List` tags.
        assert_eq!(payload.pop(), Some(0x00));
        for _ in 0..levels {
            payload.extend_from_slice(&[0x07, 0x01]);
        }
        payload.push(0x00);

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn nested_value_within_limit_decodes() {
        let decoded = FrameCodec.decode(&nested_frame(3)).unwrap();
        let Message::Spawn(spawn) = decoded.message else {
            panic!("expected a spawn");
        };
        let expected = ComponentValue::List(vec![ComponentValue::List(vec![
            ComponentValue::List(vec![ComponentValue::Null]),
        ])]);
        assert_eq!(spawn.components.get("Deep"), Some(&expected));
    }

    #[test]
    fn deeply_nested_value_is_rejected_without_overflow() {
        let frame = nested_frame(200_000);
        assert!(frame.len() < netsync_net::codec::MAX_FRAME_LEN);
        assert!(matches!(
            FrameCodec.decode(&frame),
            Err(netsync_net::CodecError::Decode(_))
        ));
    }

    #[test]
    fn deeply_nested_json_is_rejected() {
        let mut json = String::from(r#"{"version":1,"tick":1,"message":{"Spawn":{"net_id":1,"owner_client":null,"authority":"Server","parent_net_id":null,"components":{"components":{"Deep":"#);
        for _ in 0..(netsync_net::protocol::MAX_VALUE_DEPTH + 4) {
            json.push_str(r#"{"List":["#);
        }
        json.push_str(r#""Null""#);
        for _ in 0..(netsync_net::protocol::MAX_VALUE_DEPTH + 4) {
            json.push_str("]}");
        }
        json.push_str("}}}}}");
        assert!(JsonCodec.decode(json.as_bytes()).is_err());
    }

    #[test]
    fn foreign_version_fails() {
        let mut envelope = Envelope::new(
            1,
            Message::Update(UpdateMessage {
                net_id: NetId(1),
                owner_client: None,
                components: ComponentMap::new(),
                seq: None,
                ack_seq: Some(4),
            }),
        );
        envelope.version = PROTOCOL_VERSION + 1;

        for codec in [&JsonCodec as &dyn Codec, &FrameCodec] {
            let encoded = codec.encode(&envelope).unwrap();
            assert!(codec.decode(&encoded).is_err());
        }
    }
}
