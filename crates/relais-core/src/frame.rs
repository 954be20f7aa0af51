//! Wire frames and the incremental decoder.
//!
//! A frame is the MessagePack array `[session_id, message_type, payload]`.
//! Frames travel back to back with no extra delimiters; the encoding is
//! self-delimiting, so the only buffering state is the tail of a value whose
//! bytes have not all arrived yet.

use std::io::{self, Cursor};

use bytes::{Buf, BytesMut};
use rmpv::Value;

use crate::{Error, FrameError};

/// One `[session_id, message_type, payload]` unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub session: u64,
    pub ty: u64,
    pub payload: Value,
}

impl Frame {
    pub fn new(session: u64, ty: u64, payload: Value) -> Self {
        Self {
            session,
            ty,
            payload,
        }
    }

    /// Encode the frame into a fresh buffer. The whole buffer must be
    /// written in one piece so concurrent writers cannot interleave
    /// mid-frame.
    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        let value = Value::Array(vec![
            Value::from(self.session),
            Value::from(self.ty),
            self.payload,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(buf)
    }
}

fn parse_frame(value: Value) -> Result<Frame, Value> {
    match value {
        Value::Array(items) => match <[Value; 3]>::try_from(items) {
            Ok([session, ty, payload]) => match (session.as_u64(), ty.as_u64()) {
                (Some(session), Some(ty)) => Ok(Frame {
                    session,
                    ty,
                    payload,
                }),
                _ => Err(Value::Array(vec![session, ty, payload])),
            },
            Err(items) => Err(Value::Array(items)),
        },
        other => Err(other),
    }
}

/// Incomplete input: the reader ran dry mid-value. More bytes will let the
/// same decode succeed.
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Incremental frame decoder: feed raw bytes in, pull complete frames out.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes to the reassembly buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame out of the buffer.
    ///
    /// `Ok(None)` means the buffer holds at most a partial value; feed more
    /// bytes and try again. `Err` reports a fault the decoder has already
    /// stepped past, so the caller may keep calling `next`: a corrupt marker
    /// costs one byte, and a structurally wrong value is dropped whole.
    pub fn next(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);
                match parse_frame(value) {
                    Ok(frame) => Ok(Some(frame)),
                    Err(value) => Err(FrameError::NotAFrame(value)),
                }
            }
            Err(e) if is_incomplete(&e) => Ok(None),
            Err(e) => {
                self.buf.advance(1);
                Err(FrameError::Malformed(e.to_string()))
            }
        }
    }

    /// Bytes currently buffered but not yet decoded.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(session: u64, ty: u64, payload: Value) -> Vec<u8> {
        Frame::new(session, ty, payload).into_bytes().unwrap()
    }

    #[test]
    fn test_decode_single_frame() {
        let mut dec = FrameDecoder::new();
        dec.feed(&frame_bytes(1, 0, Value::Array(vec![Value::from("ping")])));

        let frame = dec.next().unwrap().expect("one complete frame buffered");
        assert_eq!(frame.session, 1);
        assert_eq!(frame.ty, 0);
        assert_eq!(frame.payload, Value::Array(vec![Value::from("ping")]));
        assert!(dec.next().unwrap().is_none());
        assert_eq!(dec.pending_bytes(), 0);
    }

    #[test]
    fn test_decode_two_frames_from_one_feed() {
        let mut dec = FrameDecoder::new();
        let mut bytes = frame_bytes(1, 0, Value::Nil);
        bytes.extend_from_slice(&frame_bytes(2, 5, Value::from(7)));
        dec.feed(&bytes);

        assert_eq!(dec.next().unwrap().unwrap().session, 1);
        assert_eq!(dec.next().unwrap().unwrap().session, 2);
        assert!(dec.next().unwrap().is_none());
    }

    #[test]
    fn test_split_frame_is_reassembled() {
        let bytes = frame_bytes(9, 2, Value::from("partial"));
        let (head, tail) = bytes.split_at(3);

        let mut dec = FrameDecoder::new();
        dec.feed(head);
        assert!(dec.next().unwrap().is_none());

        dec.feed(tail);
        let frame = dec.next().unwrap().expect("frame completed by second feed");
        assert_eq!(frame.session, 9);
        assert_eq!(frame.ty, 2);
        assert_eq!(frame.payload, Value::from("partial"));
    }

    #[test]
    fn test_corrupt_marker_is_skipped_byte_by_byte() {
        let mut dec = FrameDecoder::new();
        // 0xc1 is the one marker MessagePack reserves and never emits.
        dec.feed(&[0xc1, 0xc1]);
        dec.feed(&frame_bytes(3, 1, Value::Nil));

        assert!(matches!(dec.next(), Err(FrameError::Malformed(_))));
        assert!(matches!(dec.next(), Err(FrameError::Malformed(_))));
        let frame = dec.next().unwrap().expect("decoder resynced after garbage");
        assert_eq!(frame.session, 3);
    }

    #[test]
    fn test_non_array_value_is_dropped_whole() {
        let mut dec = FrameDecoder::new();
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &Value::from(1234)).unwrap();
        dec.feed(&bytes);
        dec.feed(&frame_bytes(4, 0, Value::Nil));

        assert!(matches!(dec.next(), Err(FrameError::NotAFrame(_))));
        assert_eq!(dec.next().unwrap().unwrap().session, 4);
    }

    #[test]
    fn test_wrong_arity_array_is_dropped_whole() {
        let mut dec = FrameDecoder::new();
        let mut bytes = Vec::new();
        let value = Value::Array(vec![Value::from(1), Value::from(2)]);
        rmpv::encode::write_value(&mut bytes, &value).unwrap();
        dec.feed(&bytes);

        assert!(matches!(dec.next(), Err(FrameError::NotAFrame(_))));
        assert!(dec.next().unwrap().is_none());
        assert_eq!(dec.pending_bytes(), 0);
    }

    #[test]
    fn test_non_integer_session_is_rejected() {
        let mut dec = FrameDecoder::new();
        let mut bytes = Vec::new();
        let value = Value::Array(vec![Value::from("sid"), Value::from(0), Value::Nil]);
        rmpv::encode::write_value(&mut bytes, &value).unwrap();
        dec.feed(&bytes);

        assert!(matches!(dec.next(), Err(FrameError::NotAFrame(_))));
    }

    #[test]
    fn test_encode_decode_preserves_payload() {
        let payload = Value::Map(vec![(Value::from("key"), Value::Array(vec![Value::from(1)]))]);
        let mut dec = FrameDecoder::new();
        dec.feed(&frame_bytes(42, 6, payload.clone()));
        assert_eq!(dec.next().unwrap().unwrap().payload, payload);
    }
}
