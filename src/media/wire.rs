//! Control message and media object framing.
//!
//! Control message envelope:
//! ```text
//! +--------+----------------+---------------------+
//! |  type  |  length (u16)  |  payload (length)   |
//! +--------+----------------+---------------------+
//! ```
//!
//! Media object (carried as the payload of an OBJECT control message):
//! ```text
//! +--------+-------------+---------------+-----------------+--------------+---------+
//! |  type  | track (u32) | sequence (u64)| timestamp (u64) | size (u16)   | payload |
//! +--------+-------------+---------------+-----------------+--------------+---------+
//! ```
//!
//! All integers are big-endian.

use thiserror::Error;

/// Capacity of the per-connection send and receive buffers.
pub const BUFFER_CAPACITY: usize = 8192;

/// Control message header: type (1) + length (2).
pub const CONTROL_HEADER_SIZE: usize = 3;

/// Media object header: type (1) + track (4) + sequence (8) + timestamp (8) + size (2).
pub const OBJECT_HEADER_SIZE: usize = 23;

/// Largest media payload that still fits a framed OBJECT message.
pub const MAX_OBJECT_PAYLOAD: usize = BUFFER_CAPACITY - CONTROL_HEADER_SIZE - OBJECT_HEADER_SIZE;

/// Wire decoding/encoding failures. Each one is local to a single message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message truncated: {actual} bytes, need at least {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("declared length {declared} exceeds {available} available bytes")]
    InvalidLength { declared: usize, available: usize },

    #[error("object declares {declared} payload bytes but {available} follow the header")]
    SizeMismatch { declared: usize, available: usize },

    #[error("payload of {size} bytes does not fit a {capacity} byte buffer")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),

    #[error("expected {expected:?}, got {actual:?}")]
    UnexpectedType {
        expected: MessageType,
        actual: MessageType,
    },
}

/// Control message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Subscribe = 0x01,
    SubscribeOk = 0x02,
    SubscribeError = 0x03,
    Announce = 0x04,
    AnnounceOk = 0x05,
    Unsubscribe = 0x06,
    Object = 0x07,
    GoAway = 0x08,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x01 => Self::Subscribe,
            0x02 => Self::SubscribeOk,
            0x03 => Self::SubscribeError,
            0x04 => Self::Announce,
            0x05 => Self::AnnounceOk,
            0x06 => Self::Unsubscribe,
            0x07 => Self::Object,
            0x08 => Self::GoAway,
            other => return Err(ProtocolError::UnknownType(other)),
        })
    }
}

/// A decoded control message borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage<'a> {
    pub kind: MessageType,
    pub payload: &'a [u8],
}

/// Frame `payload` as a control message of type `kind`.
///
/// Fails without producing output if the framed message would not fit
/// in [`BUFFER_CAPACITY`].
pub fn encode_control_message(kind: MessageType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let total = payload.len() + CONTROL_HEADER_SIZE;
    if total > BUFFER_CAPACITY {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            capacity: BUFFER_CAPACITY,
        });
    }

    let mut buf = Vec::with_capacity(total);
    buf.push(kind as u8);
    // Fits: total <= BUFFER_CAPACITY < u16::MAX
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a control message envelope.
///
/// The declared length is checked against the bytes actually present; any
/// trailing bytes past the declared length are ignored.
pub fn decode_control_message(data: &[u8]) -> Result<ControlMessage<'_>, ProtocolError> {
    if data.len() < CONTROL_HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: CONTROL_HEADER_SIZE,
            actual: data.len(),
        });
    }

    let kind = MessageType::try_from(data[0])?;
    let declared = u16::from_be_bytes([data[1], data[2]]) as usize;
    let available = data.len() - CONTROL_HEADER_SIZE;
    if declared > available {
        return Err(ProtocolError::InvalidLength {
            declared,
            available,
        });
    }

    Ok(ControlMessage {
        kind,
        payload: &data[CONTROL_HEADER_SIZE..CONTROL_HEADER_SIZE + declared],
    })
}

/// One unit of media on a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaObject {
    pub track_id: u32,
    pub sequence: u64,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

/// Result of [`decode_media_object`]: the object plus an optional
/// diagnostic when the declared size disagreed with the bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedObject {
    pub object: MediaObject,
    pub mismatch: Option<ProtocolError>,
}

/// Encode a media object header and payload.
pub fn encode_media_object(
    track_id: u32,
    sequence: u64,
    timestamp: u64,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let total = OBJECT_HEADER_SIZE + payload.len();
    if total > BUFFER_CAPACITY {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            capacity: BUFFER_CAPACITY,
        });
    }

    let mut buf = Vec::with_capacity(total);
    buf.push(MessageType::Object as u8);
    buf.extend_from_slice(&track_id.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a media object.
///
/// The payload length is the smallest of the declared size, the bytes that
/// follow the header, and `max_payload`. A declared size that disagrees with
/// the bytes present is reported as [`ProtocolError::SizeMismatch`] in
/// [`DecodedObject::mismatch`] rather than failing the decode.
pub fn decode_media_object(data: &[u8], max_payload: usize) -> Result<DecodedObject, ProtocolError> {
    if data.len() < OBJECT_HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: OBJECT_HEADER_SIZE,
            actual: data.len(),
        });
    }

    let kind = MessageType::try_from(data[0])?;
    if kind != MessageType::Object {
        return Err(ProtocolError::UnexpectedType {
            expected: MessageType::Object,
            actual: kind,
        });
    }

    let track_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let mut word = [0u8; 8];
    word.copy_from_slice(&data[5..13]);
    let sequence = u64::from_be_bytes(word);
    word.copy_from_slice(&data[13..21]);
    let timestamp = u64::from_be_bytes(word);
    let declared = u16::from_be_bytes([data[21], data[22]]) as usize;

    let available = data.len() - OBJECT_HEADER_SIZE;
    let mismatch = (declared != available).then_some(ProtocolError::SizeMismatch {
        declared,
        available,
    });
    let len = declared.min(available).min(max_payload);

    Ok(DecodedObject {
        object: MediaObject {
            track_id,
            sequence,
            timestamp,
            payload: data[OBJECT_HEADER_SIZE..OBJECT_HEADER_SIZE + len].to_vec(),
        },
        mismatch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_layout() {
        let encoded = encode_control_message(MessageType::Announce, &[0xAA, 0xBB]).unwrap();
        assert_eq!(encoded, vec![0x04, 0x00, 0x02, 0xAA, 0xBB]);

        let decoded = decode_control_message(&encoded).unwrap();
        assert_eq!(decoded.kind, MessageType::Announce);
        assert_eq!(decoded.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_control_message_truncated() {
        for len in 0..CONTROL_HEADER_SIZE {
            let data = vec![0x07; len];
            assert_eq!(
                decode_control_message(&data),
                Err(ProtocolError::Truncated {
                    needed: 3,
                    actual: len
                })
            );
        }
    }

    #[test]
    fn test_control_message_declared_length_exceeds_data() {
        let data = [0x07, 0x00, 0x10, 1, 2, 3];
        assert_eq!(
            decode_control_message(&data),
            Err(ProtocolError::InvalidLength {
                declared: 16,
                available: 3
            })
        );
    }

    #[test]
    fn test_control_message_ignores_trailing_bytes() {
        let data = [0x08, 0x00, 0x01, 9, 99, 99];
        let decoded = decode_control_message(&data).unwrap();
        assert_eq!(decoded.kind, MessageType::GoAway);
        assert_eq!(decoded.payload, &[9]);
    }

    #[test]
    fn test_control_message_unknown_type() {
        assert_eq!(
            decode_control_message(&[0x42, 0, 0]),
            Err(ProtocolError::UnknownType(0x42))
        );
    }

    #[test]
    fn test_control_message_too_large() {
        let payload = vec![0u8; BUFFER_CAPACITY - CONTROL_HEADER_SIZE + 1];
        assert_eq!(
            encode_control_message(MessageType::Object, &payload),
            Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                capacity: BUFFER_CAPACITY
            })
        );

        let payload = vec![0u8; BUFFER_CAPACITY - CONTROL_HEADER_SIZE];
        let encoded = encode_control_message(MessageType::Object, &payload).unwrap();
        assert_eq!(encoded.len(), BUFFER_CAPACITY);
    }

    #[test]
    fn test_media_object_roundtrip() {
        let payload: Vec<u8> = (0..160).map(|i| i as u8).collect();
        let encoded =
            encode_media_object(0xDEADBEEF, u64::MAX - 1, 1_700_000_000_000_000, &payload)
                .unwrap();
        assert_eq!(encoded.len(), OBJECT_HEADER_SIZE + 160);

        let decoded = decode_media_object(&encoded, BUFFER_CAPACITY).unwrap();
        assert_eq!(decoded.mismatch, None);
        assert_eq!(decoded.object.track_id, 0xDEADBEEF);
        assert_eq!(decoded.object.sequence, u64::MAX - 1);
        assert_eq!(decoded.object.timestamp, 1_700_000_000_000_000);
        assert_eq!(decoded.object.payload, payload);
    }

    #[test]
    fn test_media_object_is_big_endian() {
        let encoded = encode_media_object(0x01020304, 5, 6, &[0xFF]).unwrap();
        assert_eq!(
            encoded,
            vec![
                0x07, // OBJECT
                0x01, 0x02, 0x03, 0x04, // track
                0, 0, 0, 0, 0, 0, 0, 5, // sequence
                0, 0, 0, 0, 0, 0, 0, 6, // timestamp
                0x00, 0x01, // size
                0xFF,
            ]
        );
    }

    #[test]
    fn test_media_object_truncated() {
        let full = encode_media_object(1, 2, 3, &[]).unwrap();
        for len in 0..OBJECT_HEADER_SIZE {
            assert_eq!(
                decode_media_object(&full[..len], BUFFER_CAPACITY),
                Err(ProtocolError::Truncated {
                    needed: 23,
                    actual: len
                })
            );
        }
    }

    #[test]
    fn test_media_object_declared_size_larger_than_data() {
        let mut encoded = encode_media_object(7, 1, 1, &[1, 2, 3, 4]).unwrap();
        // Claim 100 bytes of payload while only 4 follow.
        encoded[21..23].copy_from_slice(&100u16.to_be_bytes());

        let decoded = decode_media_object(&encoded, BUFFER_CAPACITY).unwrap();
        assert_eq!(decoded.object.payload, vec![1, 2, 3, 4]);
        assert_eq!(
            decoded.mismatch,
            Some(ProtocolError::SizeMismatch {
                declared: 100,
                available: 4
            })
        );
    }

    #[test]
    fn test_media_object_declared_size_smaller_than_data() {
        let mut encoded = encode_media_object(7, 1, 1, &[1, 2, 3, 4]).unwrap();
        encoded[21..23].copy_from_slice(&2u16.to_be_bytes());

        let decoded = decode_media_object(&encoded, BUFFER_CAPACITY).unwrap();
        assert_eq!(decoded.object.payload, vec![1, 2]);
        assert!(matches!(
            decoded.mismatch,
            Some(ProtocolError::SizeMismatch {
                declared: 2,
                available: 4
            })
        ));
    }

    #[test]
    fn test_media_object_respects_output_capacity() {
        let encoded = encode_media_object(7, 1, 1, &[9; 64]).unwrap();
        let decoded = decode_media_object(&encoded, 16).unwrap();
        assert_eq!(decoded.object.payload.len(), 16);
        assert_eq!(decoded.mismatch, None);
    }

    #[test]
    fn test_media_object_wrong_type() {
        let mut encoded = encode_media_object(7, 1, 1, &[]).unwrap();
        encoded[0] = MessageType::Announce as u8;
        assert_eq!(
            decode_media_object(&encoded, BUFFER_CAPACITY),
            Err(ProtocolError::UnexpectedType {
                expected: MessageType::Object,
                actual: MessageType::Announce
            })
        );
    }

    #[test]
    fn test_media_object_too_large() {
        let payload = vec![0u8; BUFFER_CAPACITY - OBJECT_HEADER_SIZE + 1];
        assert!(matches!(
            encode_media_object(1, 1, 1, &payload),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_max_object_payload_fits_envelope() {
        let payload = vec![0u8; MAX_OBJECT_PAYLOAD];
        let object = encode_media_object(1, 1, 1, &payload).unwrap();
        let framed = encode_control_message(MessageType::Object, &object).unwrap();
        assert_eq!(framed.len(), BUFFER_CAPACITY);
    }
}
