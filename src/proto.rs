// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Minimal protobuf wire-format helpers.
//!
//! Implements just enough of the protobuf encoding to carry the Streams
//! service messages in [`crate::streams`], without pulling in a full protobuf
//! stack. Decoders return `None` on malformed input; callers translate that
//! into a typed decode error.

/// Wire type for varint fields (int32/64, uint32/64, bool, enum).
pub(crate) const WIRE_VARINT: u8 = 0;
/// Wire type for 64-bit fields.
pub(crate) const WIRE_FIXED64: u8 = 1;
/// Wire type for length-delimited fields (string, bytes, embedded messages).
pub(crate) const WIRE_LEN: u8 = 2;
/// Wire type for 32-bit fields.
pub(crate) const WIRE_FIXED32: u8 = 5;

/// Encode a varint.
pub(crate) fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from the front of `buf`, advancing it.
pub(crate) fn decode_varint(buf: &mut &[u8]) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let (&byte, rest) = buf.split_first()?;
        *buf = rest;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

/// Encode a field tag.
pub(crate) fn encode_tag(field: u32, wire_type: u8, out: &mut Vec<u8>) {
    encode_varint(((field as u64) << 3) | (wire_type as u64), out);
}

/// Decode a field tag, returning `(field_number, wire_type)`.
pub(crate) fn decode_tag(buf: &mut &[u8]) -> Option<(u32, u8)> {
    let tag = decode_varint(buf)?;
    Some(((tag >> 3) as u32, (tag & 0x07) as u8))
}

/// Encode a varint-typed field.
pub(crate) fn encode_uint64(field: u32, value: u64, out: &mut Vec<u8>) {
    encode_tag(field, WIRE_VARINT, out);
    encode_varint(value, out);
}

/// Encode a bool field. `false` is omitted, matching proto3 defaults.
pub(crate) fn encode_bool(field: u32, value: bool, out: &mut Vec<u8>) {
    if value {
        encode_uint64(field, 1, out);
    }
}

/// Encode a bytes field.
pub(crate) fn encode_bytes(field: u32, data: &[u8], out: &mut Vec<u8>) {
    encode_tag(field, WIRE_LEN, out);
    encode_varint(data.len() as u64, out);
    out.extend_from_slice(data);
}

/// Encode a string field (identical to bytes on the wire).
pub(crate) fn encode_string(field: u32, value: &str, out: &mut Vec<u8>) {
    encode_bytes(field, value.as_bytes(), out);
}

/// Encode an embedded, already-encoded message field.
pub(crate) fn encode_message(field: u32, message: &[u8], out: &mut Vec<u8>) {
    encode_bytes(field, message, out);
}

/// Encode an empty embedded message field, the wire form of the `Empty`
/// markers the Streams schemas use for oneof cases.
pub(crate) fn encode_empty(field: u32, out: &mut Vec<u8>) {
    encode_bytes(field, &[], out);
}

/// Decode a length-delimited field, returning its contents.
pub(crate) fn decode_length_delimited<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = decode_varint(buf)? as usize;
    if buf.len() < len {
        return None;
    }
    let (data, rest) = buf.split_at(len);
    *buf = rest;
    Some(data)
}

/// Decode a string field.
pub(crate) fn decode_string(buf: &mut &[u8]) -> Option<String> {
    let data = decode_length_delimited(buf)?;
    std::str::from_utf8(data).ok().map(str::to_owned)
}

/// Skip over a field of the given wire type.
pub(crate) fn skip_field(wire_type: u8, buf: &mut &[u8]) -> Option<()> {
    match wire_type {
        WIRE_VARINT => {
            decode_varint(buf)?;
        }
        WIRE_FIXED64 => {
            if buf.len() < 8 {
                return None;
            }
            *buf = &buf[8..];
        }
        WIRE_LEN => {
            decode_length_delimited(buf)?;
        }
        WIRE_FIXED32 => {
            if buf.len() < 4 {
                return None;
            }
            *buf = &buf[4..];
        }
        _ => return None,
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint_round_trip(value: u64) {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(decode_varint(&mut slice), Some(value));
        assert!(slice.is_empty());
    }

    #[test]
    fn varint_boundaries() {
        for value in [0, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            varint_round_trip(value);
        }
    }

    #[test]
    fn varint_truncated_input() {
        let mut buf = Vec::new();
        encode_varint(u64::MAX, &mut buf);
        let mut slice = &buf[..buf.len() - 1];
        assert_eq!(decode_varint(&mut slice), None);
    }

    #[test]
    fn varint_overflow_rejected() {
        let bytes = [0x80u8; 11];
        let mut slice = bytes.as_slice();
        assert_eq!(decode_varint(&mut slice), None);
    }

    #[test]
    fn tag_round_trip() {
        let mut buf = Vec::new();
        encode_tag(3, WIRE_LEN, &mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(decode_tag(&mut slice), Some((3, WIRE_LEN)));
    }

    #[test]
    fn string_field_round_trip() {
        let mut buf = Vec::new();
        encode_string(2, "language-stream", &mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(decode_tag(&mut slice), Some((2, WIRE_LEN)));
        assert_eq!(decode_string(&mut slice).as_deref(), Some("language-stream"));
    }

    #[test]
    fn bool_false_is_omitted() {
        let mut buf = Vec::new();
        encode_bool(4, false, &mut buf);
        assert!(buf.is_empty());
        encode_bool(4, true, &mut buf);
        assert!(!buf.is_empty());
    }

    #[test]
    fn skip_unknown_fields() {
        let mut buf = Vec::new();
        encode_uint64(1, 42, &mut buf);
        encode_bytes(2, b"skipped", &mut buf);
        encode_uint64(3, 7, &mut buf);

        let mut slice = buf.as_slice();
        while !slice.is_empty() {
            let (field, wire_type) = decode_tag(&mut slice).unwrap();
            if field == 3 {
                assert_eq!(decode_varint(&mut slice), Some(7));
            } else {
                skip_field(wire_type, &mut slice).unwrap();
            }
        }
    }

    #[test]
    fn truncated_length_delimited() {
        let mut buf = Vec::new();
        encode_bytes(1, b"abcdef", &mut buf);
        buf.truncate(buf.len() - 2);
        let mut slice = buf.as_slice();
        let (_, wire_type) = decode_tag(&mut slice).unwrap();
        assert_eq!(wire_type, WIRE_LEN);
        assert_eq!(decode_length_delimited(&mut slice), None);
    }
}
