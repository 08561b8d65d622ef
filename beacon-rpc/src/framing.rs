//! IPC wire framing.
//!
//! Every message is `<op: u32 LE><length: u32 LE><payload: length bytes of
//! UTF-8 JSON>`. Op 0 is the client handshake, op 1 carries commands and
//! replies.

use crate::RpcError;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Handshake opcode.
pub const OP_HANDSHAKE: u32 = 0;

/// Command/reply opcode.
pub const OP_FRAME: u32 = 1;

/// Upper bound on a frame payload; matches the pipe buffer size.
const MAX_PAYLOAD: usize = 64 * 1024;

/// One decoded IPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub op: u32,
    pub payload: Value,
}

/// Codec for the length-prefixed JSON framing.
#[derive(Debug, Default)]
pub struct IpcCodec;

impl Decoder for IpcCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RpcError> {
        if src.len() < 8 {
            return Ok(None);
        }
        let op = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let length = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if length > MAX_PAYLOAD {
            return Err(RpcError::Frame(format!("oversized payload: {length} bytes")));
        }
        if src.len() < 8 + length {
            src.reserve(8 + length - src.len());
            return Ok(None);
        }
        src.advance(8);
        let payload = serde_json::from_slice(&src.split_to(length))?;
        Ok(Some(Frame { op, payload }))
    }
}

impl Encoder<Frame> for IpcCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RpcError> {
        let payload = serde_json::to_vec(&frame.payload)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(RpcError::Frame(format!(
                "oversized payload: {} bytes",
                payload.len()
            )));
        }
        dst.reserve(8 + payload.len());
        dst.put_u32_le(frame.op);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = IpcCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let frame = Frame {
            op: OP_FRAME,
            payload: json!({"cmd": "SET_ACTIVITY", "nonce": "n1"}),
        };
        assert_eq!(roundtrip(frame.clone()), frame);
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = IpcCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame {
                    op: OP_HANDSHAKE,
                    payload: json!({"v": 1, "client_id": "123"}),
                },
                &mut buf,
            )
            .unwrap();
        let tail = buf.split_off(5);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.unsplit(tail);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = IpcCodec;
        let mut buf = BytesMut::new();
        for i in 0..2 {
            codec
                .encode(
                    Frame {
                        op: OP_FRAME,
                        payload: json!({"n": i}),
                    },
                    &mut buf,
                )
                .unwrap();
        }
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload["n"], 0);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload["n"], 1);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut codec = IpcCodec;
        let mut buf = BytesMut::new();
        buf.put_u32_le(OP_FRAME);
        buf.put_u32_le((MAX_PAYLOAD + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    proptest! {
        /// decode(encode(op, json)) is the identity for any payload that
        /// fits in a frame.
        #[test]
        fn prop_framing_roundtrip(
            op in 0u32..2,
            keys in proptest::collection::vec("[a-z_]{1,12}", 0..8),
            text in "\\PC{0,256}",
            number in proptest::num::i64::ANY,
        ) {
            let mut payload = serde_json::Map::new();
            for (i, key) in keys.iter().enumerate() {
                let value = if i % 2 == 0 { json!(text) } else { json!(number) };
                payload.insert(key.clone(), value);
            }
            let frame = Frame { op, payload: Value::Object(payload) };
            prop_assert_eq!(roundtrip(frame.clone()), frame);
        }
    }
}
