//! Length-prefixed JSON framing for inter-relay streams.
//!
//! Every message on a `/stream-request/1.0` or `/stream-push/1.0` libp2p stream is
//! encoded as:
//! ```text
//! [0..4]  length: u32, big-endian — byte length of the JSON body that follows
//! [4..]   body: UTF-8 JSON, exactly `length` bytes
//! ```
//! `length` is capped at [`MAX_FRAME_LEN`] to bound how much a misbehaving or
//! desynchronized peer can make a reader buffer before giving up.

use serde::{Serialize, de::DeserializeOwned};

pub const LENGTH_PREFIX_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short for length prefix: {0} bytes (need at least {LENGTH_PREFIX_SIZE})")]
    TooShort(usize),
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN}-byte cap")]
    TooLarge(u32),
    #[error("incomplete frame body: expected {expected} bytes, got {actual}")]
    IncompleteBody { expected: usize, actual: usize },
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode `value` as a length-prefixed JSON frame ready to write to a stream.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge(body.len() as u32));
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read the 4-byte big-endian length prefix from the start of `buf`, validating it
/// against [`MAX_FRAME_LEN`]. Callers use this to know how many more bytes to read
/// off the stream before calling [`decode_body`].
pub fn read_length_prefix(buf: &[u8]) -> Result<u32, FrameError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Err(FrameError::TooShort(buf.len()));
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

/// Parse a complete frame body (the bytes following the length prefix) into `T`.
pub fn decode_body<T: DeserializeOwned>(body: &[u8], expected_len: u32) -> Result<T, FrameError> {
    if body.len() != expected_len as usize {
        return Err(FrameError::IncompleteBody {
            expected: expected_len as usize,
            actual: body.len(),
        });
    }
    Ok(serde_json::from_slice(body)?)
}

/// Decode a complete length-prefixed frame (prefix + body both present in `buf`) and
/// return the parsed value along with the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<(T, usize), FrameError> {
    let len = read_length_prefix(buf)?;
    let body_start = LENGTH_PREFIX_SIZE;
    let body_end = body_start + len as usize;
    if buf.len() < body_end {
        return Err(FrameError::IncompleteBody {
            expected: len as usize,
            actual: buf.len().saturating_sub(body_start),
        });
    }
    let value = decode_body(&buf[body_start..body_end], len)?;
    Ok((value, body_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::StreamMessage;

    #[test]
    fn encode_decode_round_trip() {
        let msg = StreamMessage::RequestOffline { payload: "movie-night".to_string() };
        let frame = encode(&msg).unwrap();
        let (decoded, consumed): (StreamMessage, usize) = decode(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        match (msg, decoded) {
            (
                StreamMessage::RequestOffline { payload: a },
                StreamMessage::RequestOffline { payload: b },
            ) => {
                assert_eq!(a, b);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn read_length_prefix_too_short() {
        let buf = [0u8; 2];
        match read_length_prefix(&buf) {
            Err(FrameError::TooShort(2)) => {}
            other => panic!("expected TooShort(2), got {other:?}"),
        }
    }

    #[test]
    fn read_length_prefix_rejects_oversized_frame() {
        let buf = (MAX_FRAME_LEN + 1).to_be_bytes();
        match read_length_prefix(&buf) {
            Err(FrameError::TooLarge(len)) => assert_eq!(len, MAX_FRAME_LEN + 1),
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    #[test]
    fn decode_detects_incomplete_body() {
        let msg = StreamMessage::RequestOffline { payload: "movie-night".to_string() };
        let frame = encode(&msg).unwrap();
        let truncated = &frame[..frame.len() - 1];
        match decode::<StreamMessage>(truncated) {
            Err(FrameError::IncompleteBody { .. }) => {}
            other => panic!("expected IncompleteBody, got {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        #[derive(Serialize)]
        struct Huge {
            data: Vec<u8>,
        }
        let huge = Huge {
            data: vec![0u8; MAX_FRAME_LEN as usize + 1],
        };
        match encode(&huge) {
            Err(FrameError::TooLarge(_)) => {}
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }
}
