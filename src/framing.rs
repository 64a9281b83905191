// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! gRPC message framing.
//!
//! Messages travel on an HTTP/2 stream as length-prefixed frames: one
//! compression flag byte (always 0 here, compression is never negotiated),
//! four big-endian length bytes, then the payload. DATA frames chunk the
//! byte stream arbitrarily, so the decoder accumulates input and yields a
//! complete payload only once all of it has arrived.

use bytes::{Buf, Bytes, BytesMut};

/// Default ceiling on a single decoded message.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Length of the flag + length prefix.
const PREFIX_LEN: usize = 5;

/// Errors produced while decoding gRPC frames or the messages inside them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// The compression flag was set but no encoding was negotiated.
    #[error("received a compressed frame without a negotiated encoding")]
    Compression,
    /// The frame prefix used a flag value the protocol does not define.
    #[error("invalid compression flag {0}")]
    InvalidFlag(u8),
    /// The advertised frame length exceeds the configured ceiling.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    /// The stream ended in the middle of a frame.
    #[error("stream ended inside a partial frame")]
    TruncatedFrame,
    /// A frame payload did not decode as the expected message.
    #[error("malformed {0} message")]
    Message(&'static str),
}

impl DecodeError {
    /// The gRPC code a request terminates with when this error occurs.
    pub fn code(&self) -> crate::status::Code {
        match self {
            DecodeError::FrameTooLarge { .. } => crate::status::Code::ResourceExhausted,
            _ => crate::status::Code::Internal,
        }
    }
}

/// One decoded frame: the message payload plus the number of wire bytes it
/// occupied, used to return flow-control credit once the payload has been
/// handed downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub wire_len: usize,
}

/// Encode one message as a gRPC frame.
pub fn encode_frame(message: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(PREFIX_LEN + message.len());
    out.extend_from_slice(&[0]);
    out.extend_from_slice(&(message.len() as u32).to_be_bytes());
    out.extend_from_slice(message);
    out.freeze()
}

/// Pull-based frame decoder.
///
/// Feed it byte chunks as they arrive with [`extend`](Self::extend) and drain
/// complete frames with [`next_frame`](Self::next_frame). At rest the
/// accumulator never holds more than one partial frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        FrameDecoder {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Append a chunk read off the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Try to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }
        match self.buf[0] {
            0 => {}
            1 => return Err(DecodeError::Compression),
            flag => return Err(DecodeError::InvalidFlag(flag)),
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > self.max_frame_len {
            return Err(DecodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < PREFIX_LEN + len {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(PREFIX_LEN + len);
        frame.advance(PREFIX_LEN);
        Ok(Some(Frame {
            payload: frame.freeze(),
            wire_len: PREFIX_LEN + len,
        }))
    }

    /// Whether the decoder sits at a frame boundary. A stream that ends while
    /// this is false was truncated mid-frame.
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            out.push(frame.payload);
        }
        out
    }

    #[test]
    fn encode_layout() {
        let frame = encode_frame(b"hello");
        assert_eq!(&frame[..5], &[0, 0, 0, 0, 5]);
        assert_eq!(&frame[5..], b"hello");
    }

    #[test]
    fn decode_whole_frame() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.extend(&encode_frame(b"hello"));
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert_eq!(frame.wire_len, 10);
        assert!(decoder.is_idle());
    }

    #[test]
    fn decode_empty_frame() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.extend(&encode_frame(b""));
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.wire_len, 5);
    }

    #[test]
    fn every_split_point_yields_the_same_frames() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"first"));
        wire.extend_from_slice(&encode_frame(b""));
        wire.extend_from_slice(&encode_frame(b"the second message"));
        let wire = wire.freeze();

        let mut whole = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        whole.extend(&wire);
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), 3);

        for split in 0..=wire.len() {
            let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
            let mut got = Vec::new();
            decoder.extend(&wire[..split]);
            got.extend(drain(&mut decoder));
            decoder.extend(&wire[split..]);
            got.extend(drain(&mut decoder));
            assert_eq!(got, expected, "split at {split}");
            assert!(decoder.is_idle());
        }
    }

    #[test]
    fn byte_at_a_time() {
        let wire = encode_frame(b"one byte at a time");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        let mut got = Vec::new();
        for byte in wire.iter() {
            decoder.extend(std::slice::from_ref(byte));
            got.extend(drain(&mut decoder));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].as_ref(), b"one byte at a time");
    }

    #[test]
    fn partial_frame_is_not_idle() {
        let wire = encode_frame(b"partial");
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.extend(&wire[..7]);
        assert!(decoder.next_frame().unwrap().is_none());
        assert!(!decoder.is_idle());
    }

    #[test]
    fn compressed_frame_is_fatal() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.extend(&[1, 0, 0, 0, 1, b'x']);
        assert_matches::assert_matches!(decoder.next_frame(), Err(DecodeError::Compression));
    }

    #[test]
    fn undefined_flag_is_fatal() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_LEN);
        decoder.extend(&[7, 0, 0, 0, 0]);
        assert_matches::assert_matches!(decoder.next_frame(), Err(DecodeError::InvalidFlag(7)));
    }

    #[test]
    fn oversized_frame_is_fatal_before_payload_arrives() {
        let mut decoder = FrameDecoder::new(16);
        // Prefix advertising 17 bytes; none of the payload present yet.
        decoder.extend(&[0, 0, 0, 0, 17]);
        assert_matches::assert_matches!(
            decoder.next_frame(),
            Err(DecodeError::FrameTooLarge { len: 17, max: 16 })
        );
    }

    #[test]
    fn oversized_error_maps_to_resource_exhausted() {
        let err = DecodeError::FrameTooLarge { len: 2, max: 1 };
        assert_eq!(err.code(), crate::status::Code::ResourceExhausted);
        assert_eq!(DecodeError::Compression.code(), crate::status::Code::Internal);
    }
}
