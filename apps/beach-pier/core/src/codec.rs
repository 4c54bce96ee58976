//! Length-prefixed framing for [`NetworkMessage`].
//!
//! A frame is a 4-byte big-endian payload length followed by the bincode
//! (varint) encoding of one message. Payloads above [`MAX_MESSAGE_SIZE`] are
//! refused on both sides; the decoder checks the header before touching the
//! body so an oversized announcement never triggers an allocation.

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};
use crate::protocol::NetworkMessage;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_SIZE as u64)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn encode(message: &NetworkMessage) -> Result<Bytes> {
        let size = bincode::DefaultOptions::new().serialized_size(message)? as usize;
        if size > MAX_MESSAGE_SIZE {
            return Err(CoreError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let payload = wire_options().serialize(message)?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decodes exactly one frame. Truncated input and trailing bytes are both
    /// rejected.
    pub fn decode(bytes: &[u8]) -> Result<NetworkMessage> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(CoreError::Serialization("truncated frame header".into()));
        }
        let len = Self::payload_len(&bytes[..FRAME_HEADER_LEN])?;
        let body = &bytes[FRAME_HEADER_LEN..];
        if body.len() < len {
            return Err(CoreError::Serialization(format!(
                "truncated frame: expected {len} payload bytes, got {}",
                body.len()
            )));
        }
        if body.len() > len {
            return Err(CoreError::Serialization(format!(
                "{} trailing bytes after frame",
                body.len() - len
            )));
        }
        Self::decode_payload(body)
    }

    /// Drains every complete frame from `buf`. A trailing partial frame stays
    /// in the buffer for the next read.
    pub fn decode_stream(buf: &mut BytesMut) -> Result<Vec<NetworkMessage>> {
        let mut messages = Vec::new();
        while buf.len() >= FRAME_HEADER_LEN {
            let len = Self::payload_len(&buf[..FRAME_HEADER_LEN])?;
            if buf.len() < FRAME_HEADER_LEN + len {
                buf.reserve(FRAME_HEADER_LEN + len - buf.len());
                break;
            }
            buf.advance(FRAME_HEADER_LEN);
            let payload = buf.split_to(len);
            messages.push(Self::decode_payload(&payload)?);
        }
        Ok(messages)
    }

    /// Reads the length header, enforcing the size cap.
    pub fn payload_len(header: &[u8]) -> Result<usize> {
        let header: [u8; FRAME_HEADER_LEN] = header
            .get(..FRAME_HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| CoreError::Serialization("truncated frame header".into()))?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(CoreError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(len)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<NetworkMessage> {
        wire_options()
            .deserialize(payload)
            .map_err(|err| CoreError::Serialization(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorCode;
    use crate::token::AuthToken;

    fn sample_messages() -> Vec<NetworkMessage> {
        vec![
            NetworkMessage::hello(AuthToken::generate(), Some(7)),
            NetworkMessage::Hello {
                protocol_version: 9,
                app_version: String::new(),
                auth_token: None,
                session_id: None,
            },
            NetworkMessage::input(Bytes::new()),
            NetworkMessage::input(&b"ls -la\r"[..]),
            NetworkMessage::Event {
                session_id: 3,
                data: Bytes::from_static(b"\x1b[1;32m$ \x1b[0m"),
                timestamp: 1_700_000_000_000,
            },
            NetworkMessage::Resize { rows: 40, cols: 120 },
            NetworkMessage::Ping { timestamp: 1 },
            NetworkMessage::Pong { timestamp: u64::MAX },
            NetworkMessage::RequestSnapshot,
            NetworkMessage::Snapshot {
                data: Bytes::from(vec![0u8; 70_000]),
            },
            NetworkMessage::SessionInfo {
                session_id: 1,
                resumed: true,
                rows: 24,
                cols: 80,
            },
            NetworkMessage::error(ErrorCode::SessionEnded),
            NetworkMessage::Close,
        ]
    }

    #[test]
    fn every_variant_survives_the_codec() {
        for message in sample_messages() {
            let frame = MessageCodec::encode(&message).expect("encode");
            let decoded = MessageCodec::decode(&frame).expect("decode");
            assert_eq!(decoded, message, "variant {}", message.kind());
        }
    }

    #[test]
    fn header_is_big_endian_payload_length() {
        let frame = MessageCodec::encode(&NetworkMessage::Close).expect("encode");
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
    }

    #[test]
    fn decode_stream_handles_zero_one_and_many() {
        let mut empty = BytesMut::new();
        assert!(MessageCodec::decode_stream(&mut empty).unwrap().is_empty());

        let messages = sample_messages();
        let mut buf = BytesMut::new();
        for message in &messages {
            buf.extend_from_slice(&MessageCodec::encode(message).unwrap());
        }
        let decoded = MessageCodec::decode_stream(&mut buf).unwrap();
        assert_eq!(decoded, messages);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_stream_leaves_partial_tail() {
        let first = MessageCodec::encode(&NetworkMessage::Ping { timestamp: 5 }).unwrap();
        let second = MessageCodec::encode(&NetworkMessage::input(&b"echo hi\r"[..])).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..second.len() - 3]);

        let decoded = MessageCodec::decode_stream(&mut buf).unwrap();
        assert_eq!(decoded, vec![NetworkMessage::Ping { timestamp: 5 }]);
        assert_eq!(buf.len(), second.len() - 3);

        buf.extend_from_slice(&second[second.len() - 3..]);
        let decoded = MessageCodec::decode_stream(&mut buf).unwrap();
        assert_eq!(decoded, vec![NetworkMessage::input(&b"echo hi\r"[..])]);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_header_rejected_before_body_arrives() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        let err = MessageCodec::decode_stream(&mut buf).unwrap_err();
        assert!(matches!(err, CoreError::MessageTooLarge { .. }));

        let mut frame = vec![0xff, 0xff, 0xff, 0xff];
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            MessageCodec::decode(&frame),
            Err(CoreError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_message_refused_on_encode() {
        let message = NetworkMessage::Snapshot {
            data: Bytes::from(vec![1u8; MAX_MESSAGE_SIZE + 1]),
        };
        assert!(matches!(
            MessageCodec::encode(&message),
            Err(CoreError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_a_format_error() {
        let mut frame = BytesMut::new();
        frame.put_u32(3);
        frame.extend_from_slice(&[0xee, 0xee, 0xee]);
        assert!(matches!(
            MessageCodec::decode(&frame),
            Err(CoreError::Serialization(_))
        ));
    }

    #[test]
    fn truncated_and_trailing_input_rejected() {
        let frame = MessageCodec::encode(&NetworkMessage::RequestSnapshot).unwrap();
        assert!(matches!(
            MessageCodec::decode(&frame[..2]),
            Err(CoreError::Serialization(_))
        ));
        let mut padded = frame.to_vec();
        padded.push(0);
        assert!(matches!(
            MessageCodec::decode(&padded),
            Err(CoreError::Serialization(_))
        ));
    }
}
