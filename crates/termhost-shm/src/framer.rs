//! Packet framing for the shared-memory transport.
//!
//! Layout (little-endian where applicable):
//! - byte 0:           id length (`u8`)
//! - bytes 1..1+n:     session id, UTF-8
//! - next 4 bytes:     payload length as `u32` LE
//! - remaining bytes:  payload

use thiserror::Error;

/// Longest session id a frame can carry.
pub const MAX_ID_LEN: usize = u8::MAX as usize;

/// Largest payload a single frame can carry (64 KiB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Bytes of framing overhead besides the id and payload themselves.
const LEN_FIELDS: usize = 1 + 4;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame declares a payload of {0} bytes, above the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(usize),
    #[error("frame session id is not valid UTF-8")]
    InvalidId,
}

/// Total encoded size of a frame for the given id and payload.
pub fn framed_len(id: &str, payload: &[u8]) -> usize {
    LEN_FIELDS + id.len() + payload.len()
}

/// Encode `(id, payload)` into a frame.
///
/// Returns `None` when the id is longer than [`MAX_ID_LEN`] bytes or the
/// payload is longer than [`MAX_PAYLOAD_LEN`] bytes. Callers fall back to the
/// message channel in that case.
pub fn frame(id: &str, payload: &[u8]) -> Option<Vec<u8>> {
    if id.len() > MAX_ID_LEN || payload.len() > MAX_PAYLOAD_LEN {
        return None;
    }

    let mut buf = Vec::with_capacity(framed_len(id, payload));
    buf.push(id.len() as u8);
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    Some(buf)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete frame, otherwise
/// the packet and the number of bytes it occupied.
pub fn unframe(buf: &[u8]) -> Result<Option<(Packet, usize)>, FrameError> {
    let Some(&id_len) = buf.first() else {
        return Ok(None);
    };
    let id_len = id_len as usize;
    let len_start = 1 + id_len;
    let payload_start = len_start + 4;
    if buf.len() < payload_start {
        return Ok(None);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[len_start..payload_start]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }

    let end = payload_start + payload_len;
    if buf.len() < end {
        return Ok(None);
    }

    let id = std::str::from_utf8(&buf[1..len_start])
        .map_err(|_| FrameError::InvalidId)?
        .to_string();
    let packet = Packet {
        id,
        payload: buf[payload_start..end].to_vec(),
    };
    Ok(Some((packet, end)))
}

/// Decode every complete frame in `buf`, returning the packets and the number
/// of bytes consumed. Trailing partial data is left unconsumed.
pub fn unframe_all(buf: &[u8]) -> Result<(Vec<Packet>, usize), FrameError> {
    let mut packets = Vec::new();
    let mut offset = 0;
    while let Some((packet, used)) = unframe(&buf[offset..])? {
        packets.push(packet);
        offset += used;
    }
    Ok((packets, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let encoded = frame("t1", b"hi").unwrap();
        assert_eq!(encoded, vec![2, b't', b'1', 2, 0, 0, 0, b'h', b'i']);
        assert_eq!(encoded.len(), framed_len("t1", b"hi"));
    }

    #[test]
    fn test_round_trip_at_limits() {
        let id = "x".repeat(MAX_ID_LEN);
        let payload = vec![0xABu8; MAX_PAYLOAD_LEN];
        let encoded = frame(&id, &payload).unwrap();

        let (packet, used) = unframe(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(packet.id, id);
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_round_trip_empty_payload() {
        let encoded = frame("term-7", b"").unwrap();
        let (packet, _) = unframe(&encoded).unwrap().unwrap();
        assert_eq!(packet.id, "term-7");
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_oversize_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(frame("t1", &payload).is_none());
    }

    #[test]
    fn test_oversize_id_rejected() {
        let id = "y".repeat(MAX_ID_LEN + 1);
        assert!(frame(&id, b"data").is_none());
    }

    #[test]
    fn test_incomplete_frame() {
        let encoded = frame("session", b"some output").unwrap();
        for cut in 0..encoded.len() {
            assert_eq!(unframe(&encoded[..cut]), Ok(None), "cut at {cut}");
        }
    }

    #[test]
    fn test_declared_length_over_limit() {
        let mut bogus = vec![1, b'a'];
        bogus.extend_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_le_bytes());
        assert_eq!(
            unframe(&bogus),
            Err(FrameError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn test_invalid_utf8_id() {
        let bogus = vec![1, 0xFF, 0, 0, 0, 0];
        assert_eq!(unframe(&bogus), Err(FrameError::InvalidId));
    }

    #[test]
    fn test_unframe_all_leaves_partial_tail() {
        let mut buf = frame("a", b"one").unwrap();
        buf.extend_from_slice(&frame("b", b"two").unwrap());
        let tail = frame("c", b"three").unwrap();
        buf.extend_from_slice(&tail[..3]);

        let (packets, used) = unframe_all(&buf).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].id, "b");
        assert_eq!(used, buf.len() - 3);
    }
}
