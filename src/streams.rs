// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Wire messages of the Streams service.
//!
//! These are the opaque encode/decode boundary around the EventStore RPC
//! schemas: plain structs with hand-rolled protobuf codecs built on
//! [`crate::proto`]. The connection core never looks inside a payload; only
//! this module and the façade do.

use bytes::Bytes;

use crate::framing::DecodeError;
use crate::proto::*;
use crate::types::{
    CurrentRevision, Direction, ExpectedRevision, FilterKind, FilterOptions, Position, ReadTarget,
    StreamPosition,
};

/// RPC paths of the Streams service.
pub mod path {
    pub const READ: &str = "/event_store.client.streams.Streams/Read";
    pub const APPEND: &str = "/event_store.client.streams.Streams/Append";
    pub const DELETE: &str = "/event_store.client.streams.Streams/Delete";
    pub const TOMBSTONE: &str = "/event_store.client.streams.Streams/Tombstone";
}

/// How many events a Read yields: a bounded count, or an open-ended
/// subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadLimit {
    Count(u64),
    Subscription,
}

/// Request for the server-streaming Read RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadReq {
    pub target: ReadTarget,
    pub from: StreamPosition,
    pub direction: Direction,
    pub resolve_links: bool,
    pub limit: ReadLimit,
    pub filter: Option<FilterOptions>,
}

impl ReadReq {
    pub fn encode(&self) -> Bytes {
        let mut options = Vec::new();

        match &self.target {
            ReadTarget::Stream(name) => {
                let mut stream = Vec::new();
                encode_message(1, &stream_identifier(name), &mut stream);
                match self.from {
                    StreamPosition::Revision(revision) => encode_uint64(2, revision, &mut stream),
                    StreamPosition::Start => encode_empty(3, &mut stream),
                    StreamPosition::End => encode_empty(4, &mut stream),
                }
                encode_message(1, &stream, &mut options);
            }
            ReadTarget::All => {
                let mut all = Vec::new();
                match self.from {
                    StreamPosition::Revision(commit) => {
                        let mut position = Vec::new();
                        encode_uint64(1, commit, &mut position);
                        encode_uint64(2, commit, &mut position);
                        encode_message(1, &position, &mut all);
                    }
                    StreamPosition::Start => encode_empty(2, &mut all),
                    StreamPosition::End => encode_empty(3, &mut all),
                }
                encode_message(2, &all, &mut options);
            }
        }

        let direction = match self.direction {
            Direction::Forwards => 0,
            Direction::Backwards => 1,
        };
        encode_uint64(3, direction, &mut options);
        encode_bool(4, self.resolve_links, &mut options);
        match self.limit {
            ReadLimit::Count(count) => encode_uint64(5, count, &mut options),
            ReadLimit::Subscription => encode_empty(6, &mut options),
        }
        match &self.filter {
            Some(filter) => encode_message(7, &encode_filter(filter), &mut options),
            None => encode_empty(8, &mut options),
        }
        // Ask for string-encoded event ids.
        let mut uuid_option = Vec::new();
        encode_empty(2, &mut uuid_option);
        encode_message(9, &uuid_option, &mut options);

        let mut out = Vec::new();
        encode_message(1, &options, &mut out);
        Bytes::from(out)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        decode_read_req(&mut buf).ok_or(DecodeError::Message("ReadReq"))
    }
}

fn decode_read_req(buf: &mut &[u8]) -> Option<ReadReq> {
    let mut options: Option<&[u8]> = None;
    while !buf.is_empty() {
        let (field, wire_type) = decode_tag(buf)?;
        match field {
            1 => options = Some(decode_length_delimited(buf)?),
            _ => skip_field(wire_type, buf)?,
        }
    }
    let mut options = options?;

    let mut target = None;
    let mut from = StreamPosition::Start;
    let mut direction = Direction::Forwards;
    let mut resolve_links = false;
    let mut limit = None;
    let mut filter = None;

    while !options.is_empty() {
        let (field, wire_type) = decode_tag(&mut options)?;
        match field {
            1 => {
                let mut stream = decode_length_delimited(&mut options)?;
                let mut name = String::new();
                while !stream.is_empty() {
                    let (field, wire_type) = decode_tag(&mut stream)?;
                    match field {
                        1 => name = decode_stream_identifier(decode_length_delimited(&mut stream)?)?,
                        2 => from = StreamPosition::Revision(decode_varint(&mut stream)?),
                        3 => {
                            decode_length_delimited(&mut stream)?;
                            from = StreamPosition::Start;
                        }
                        4 => {
                            decode_length_delimited(&mut stream)?;
                            from = StreamPosition::End;
                        }
                        _ => skip_field(wire_type, &mut stream)?,
                    }
                }
                target = Some(ReadTarget::Stream(name));
            }
            2 => {
                let mut all = decode_length_delimited(&mut options)?;
                while !all.is_empty() {
                    let (field, wire_type) = decode_tag(&mut all)?;
                    match field {
                        1 => {
                            let mut position = decode_length_delimited(&mut all)?;
                            let mut commit = 0;
                            while !position.is_empty() {
                                let (field, wire_type) = decode_tag(&mut position)?;
                                match field {
                                    1 => commit = decode_varint(&mut position)?,
                                    _ => skip_field(wire_type, &mut position)?,
                                }
                            }
                            from = StreamPosition::Revision(commit);
                        }
                        2 => {
                            decode_length_delimited(&mut all)?;
                            from = StreamPosition::Start;
                        }
                        3 => {
                            decode_length_delimited(&mut all)?;
                            from = StreamPosition::End;
                        }
                        _ => skip_field(wire_type, &mut all)?,
                    }
                }
                target = Some(ReadTarget::All);
            }
            3 => {
                direction = match decode_varint(&mut options)? {
                    0 => Direction::Forwards,
                    _ => Direction::Backwards,
                };
            }
            4 => resolve_links = decode_varint(&mut options)? != 0,
            5 => limit = Some(ReadLimit::Count(decode_varint(&mut options)?)),
            6 => {
                decode_length_delimited(&mut options)?;
                limit = Some(ReadLimit::Subscription);
            }
            7 => filter = Some(decode_filter(decode_length_delimited(&mut options)?)?),
            _ => skip_field(wire_type, &mut options)?,
        }
    }

    Some(ReadReq {
        target: target?,
        from,
        direction,
        resolve_links,
        limit: limit?,
        filter,
    })
}

fn encode_filter(filter: &FilterOptions) -> Vec<u8> {
    let mut expression = Vec::new();
    if let Some(regex) = &filter.regex {
        encode_string(1, regex, &mut expression);
    }
    for prefix in &filter.prefixes {
        encode_string(2, prefix, &mut expression);
    }

    let mut out = Vec::new();
    let expression_field = match filter.kind {
        FilterKind::StreamName => 1,
        FilterKind::EventType => 2,
    };
    encode_message(expression_field, &expression, &mut out);
    match filter.max_window {
        Some(max) => encode_uint64(3, max as u64, &mut out),
        None => encode_empty(4, &mut out),
    }
    encode_uint64(5, filter.checkpoint_interval_multiplier as u64, &mut out);
    out
}

fn decode_filter(mut buf: &[u8]) -> Option<FilterOptions> {
    let mut kind = FilterKind::StreamName;
    let mut regex = None;
    let mut prefixes = Vec::new();
    let mut max_window = None;
    let mut checkpoint_interval_multiplier = 1;
    let mut seen_expression = false;

    while !buf.is_empty() {
        let (field, wire_type) = decode_tag(&mut buf)?;
        match field {
            1 | 2 => {
                kind = if field == 1 {
                    FilterKind::StreamName
                } else {
                    FilterKind::EventType
                };
                seen_expression = true;
                let mut expression = decode_length_delimited(&mut buf)?;
                while !expression.is_empty() {
                    let (field, wire_type) = decode_tag(&mut expression)?;
                    match field {
                        1 => regex = Some(decode_string(&mut expression)?),
                        2 => prefixes.push(decode_string(&mut expression)?),
                        _ => skip_field(wire_type, &mut expression)?,
                    }
                }
            }
            3 => max_window = Some(decode_varint(&mut buf)? as u32),
            4 => {
                decode_length_delimited(&mut buf)?;
            }
            5 => checkpoint_interval_multiplier = decode_varint(&mut buf)? as u32,
            _ => skip_field(wire_type, &mut buf)?,
        }
    }

    seen_expression.then_some(FilterOptions {
        kind,
        regex,
        prefixes,
        max_window,
        checkpoint_interval_multiplier,
    })
}

/// An event as recorded on the server, in wire form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordedEventMsg {
    pub id: String,
    pub stream_name: String,
    pub revision: u64,
    pub prepare_position: u64,
    pub commit_position: u64,
    pub metadata: Vec<(String, String)>,
    pub custom_metadata: Bytes,
    pub data: Bytes,
}

impl RecordedEventMsg {
    fn encode_to(&self, out: &mut Vec<u8>) {
        let mut id = Vec::new();
        encode_string(2, &self.id, &mut id);
        encode_message(1, &id, out);
        encode_message(2, &stream_identifier(&self.stream_name), out);
        encode_uint64(3, self.revision, out);
        encode_uint64(4, self.prepare_position, out);
        encode_uint64(5, self.commit_position, out);
        for (key, value) in &self.metadata {
            let mut entry = Vec::new();
            encode_string(1, key, &mut entry);
            encode_string(2, value, &mut entry);
            encode_message(6, &entry, out);
        }
        encode_bytes(7, &self.custom_metadata, out);
        encode_bytes(8, &self.data, out);
    }

    fn decode_from(mut buf: &[u8]) -> Option<Self> {
        let mut msg = RecordedEventMsg::default();
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => msg.id = decode_uuid(decode_length_delimited(&mut buf)?)?,
                2 => {
                    msg.stream_name =
                        decode_stream_identifier(decode_length_delimited(&mut buf)?)?
                }
                3 => msg.revision = decode_varint(&mut buf)?,
                4 => msg.prepare_position = decode_varint(&mut buf)?,
                5 => msg.commit_position = decode_varint(&mut buf)?,
                6 => {
                    let mut entry = decode_length_delimited(&mut buf)?;
                    let mut key = String::new();
                    let mut value = String::new();
                    while !entry.is_empty() {
                        let (field, wire_type) = decode_tag(&mut entry)?;
                        match field {
                            1 => key = decode_string(&mut entry)?,
                            2 => value = decode_string(&mut entry)?,
                            _ => skip_field(wire_type, &mut entry)?,
                        }
                    }
                    msg.metadata.push((key, value));
                }
                7 => {
                    msg.custom_metadata =
                        Bytes::copy_from_slice(decode_length_delimited(&mut buf)?)
                }
                8 => msg.data = Bytes::copy_from_slice(decode_length_delimited(&mut buf)?),
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Some(msg)
    }
}

/// One entry of a Read response: the (possibly link-resolved) event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadEventMsg {
    pub event: Option<RecordedEventMsg>,
    pub link: Option<RecordedEventMsg>,
    pub commit_position: Option<u64>,
}

/// Response message of the Read RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResp {
    Event(ReadEventMsg),
    Confirmation { subscription_id: String },
    Checkpoint { commit: u64, prepare: u64 },
    StreamNotFound { stream_name: String },
}

impl ReadResp {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        match self {
            ReadResp::Event(event) => {
                let mut body = Vec::new();
                if let Some(recorded) = &event.event {
                    let mut inner = Vec::new();
                    recorded.encode_to(&mut inner);
                    encode_message(1, &inner, &mut body);
                }
                if let Some(link) = &event.link {
                    let mut inner = Vec::new();
                    link.encode_to(&mut inner);
                    encode_message(2, &inner, &mut body);
                }
                match event.commit_position {
                    Some(commit) => encode_uint64(3, commit, &mut body),
                    None => encode_empty(4, &mut body),
                }
                encode_message(1, &body, &mut out);
            }
            ReadResp::Confirmation { subscription_id } => {
                let mut body = Vec::new();
                encode_string(1, subscription_id, &mut body);
                encode_message(2, &body, &mut out);
            }
            ReadResp::Checkpoint { commit, prepare } => {
                let mut body = Vec::new();
                encode_uint64(1, *commit, &mut body);
                encode_uint64(2, *prepare, &mut body);
                encode_message(3, &body, &mut out);
            }
            ReadResp::StreamNotFound { stream_name } => {
                let mut body = Vec::new();
                encode_message(1, &stream_identifier(stream_name), &mut body);
                encode_message(4, &body, &mut out);
            }
        }
        Bytes::from(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_inner(buf).ok_or(DecodeError::Message("ReadResp"))
    }

    fn decode_inner(mut buf: &[u8]) -> Option<Self> {
        let mut resp = None;
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => {
                    let mut body = decode_length_delimited(&mut buf)?;
                    let mut event = ReadEventMsg::default();
                    while !body.is_empty() {
                        let (field, wire_type) = decode_tag(&mut body)?;
                        match field {
                            1 => {
                                event.event = Some(RecordedEventMsg::decode_from(
                                    decode_length_delimited(&mut body)?,
                                )?)
                            }
                            2 => {
                                event.link = Some(RecordedEventMsg::decode_from(
                                    decode_length_delimited(&mut body)?,
                                )?)
                            }
                            3 => event.commit_position = Some(decode_varint(&mut body)?),
                            4 => {
                                decode_length_delimited(&mut body)?;
                                event.commit_position = None;
                            }
                            _ => skip_field(wire_type, &mut body)?,
                        }
                    }
                    resp = Some(ReadResp::Event(event));
                }
                2 => {
                    let mut body = decode_length_delimited(&mut buf)?;
                    let mut subscription_id = String::new();
                    while !body.is_empty() {
                        let (field, wire_type) = decode_tag(&mut body)?;
                        match field {
                            1 => subscription_id = decode_string(&mut body)?,
                            _ => skip_field(wire_type, &mut body)?,
                        }
                    }
                    resp = Some(ReadResp::Confirmation { subscription_id });
                }
                3 => {
                    let mut body = decode_length_delimited(&mut buf)?;
                    let (mut commit, mut prepare) = (0, 0);
                    while !body.is_empty() {
                        let (field, wire_type) = decode_tag(&mut body)?;
                        match field {
                            1 => commit = decode_varint(&mut body)?,
                            2 => prepare = decode_varint(&mut body)?,
                            _ => skip_field(wire_type, &mut body)?,
                        }
                    }
                    resp = Some(ReadResp::Checkpoint { commit, prepare });
                }
                4 => {
                    let mut body = decode_length_delimited(&mut buf)?;
                    let mut stream_name = String::new();
                    while !body.is_empty() {
                        let (field, wire_type) = decode_tag(&mut body)?;
                        match field {
                            1 => {
                                stream_name =
                                    decode_stream_identifier(decode_length_delimited(&mut body)?)?
                            }
                            _ => skip_field(wire_type, &mut body)?,
                        }
                    }
                    resp = Some(ReadResp::StreamNotFound { stream_name });
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        resp
    }
}

/// An event proposed for append, in wire form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProposedMessage {
    pub id: String,
    pub metadata: Vec<(String, String)>,
    pub custom_metadata: Bytes,
    pub data: Bytes,
}

/// Request messages of the client-streaming Append RPC: options first, then
/// one message per event.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendReq {
    Options {
        stream_name: String,
        expected: ExpectedRevision,
    },
    Proposed(ProposedMessage),
}

impl AppendReq {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        match self {
            AppendReq::Options {
                stream_name,
                expected,
            } => {
                let mut options = Vec::new();
                encode_message(1, &stream_identifier(stream_name), &mut options);
                encode_expected_revision(*expected, &mut options);
                encode_message(1, &options, &mut out);
            }
            AppendReq::Proposed(proposed) => {
                let mut body = Vec::new();
                let mut id = Vec::new();
                encode_string(2, &proposed.id, &mut id);
                encode_message(1, &id, &mut body);
                for (key, value) in &proposed.metadata {
                    let mut entry = Vec::new();
                    encode_string(1, key, &mut entry);
                    encode_string(2, value, &mut entry);
                    encode_message(2, &entry, &mut body);
                }
                encode_bytes(3, &proposed.custom_metadata, &mut body);
                encode_bytes(4, &proposed.data, &mut body);
                encode_message(2, &body, &mut out);
            }
        }
        Bytes::from(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_inner(buf).ok_or(DecodeError::Message("AppendReq"))
    }

    fn decode_inner(mut buf: &[u8]) -> Option<Self> {
        let mut req = None;
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => {
                    let mut options = decode_length_delimited(&mut buf)?;
                    let mut stream_name = String::new();
                    let mut expected = ExpectedRevision::Any;
                    while !options.is_empty() {
                        let (field, wire_type) = decode_tag(&mut options)?;
                        match field {
                            1 => {
                                stream_name = decode_stream_identifier(decode_length_delimited(
                                    &mut options,
                                )?)?
                            }
                            2..=5 => {
                                expected =
                                    decode_expected_revision(field, wire_type, &mut options)?
                            }
                            _ => skip_field(wire_type, &mut options)?,
                        }
                    }
                    req = Some(AppendReq::Options {
                        stream_name,
                        expected,
                    });
                }
                2 => {
                    let mut body = decode_length_delimited(&mut buf)?;
                    let mut proposed = ProposedMessage::default();
                    while !body.is_empty() {
                        let (field, wire_type) = decode_tag(&mut body)?;
                        match field {
                            1 => proposed.id = decode_uuid(decode_length_delimited(&mut body)?)?,
                            2 => {
                                let mut entry = decode_length_delimited(&mut body)?;
                                let mut key = String::new();
                                let mut value = String::new();
                                while !entry.is_empty() {
                                    let (field, wire_type) = decode_tag(&mut entry)?;
                                    match field {
                                        1 => key = decode_string(&mut entry)?,
                                        2 => value = decode_string(&mut entry)?,
                                        _ => skip_field(wire_type, &mut entry)?,
                                    }
                                }
                                proposed.metadata.push((key, value));
                            }
                            3 => {
                                proposed.custom_metadata =
                                    Bytes::copy_from_slice(decode_length_delimited(&mut body)?)
                            }
                            4 => {
                                proposed.data =
                                    Bytes::copy_from_slice(decode_length_delimited(&mut body)?)
                            }
                            _ => skip_field(wire_type, &mut body)?,
                        }
                    }
                    req = Some(AppendReq::Proposed(proposed));
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        req
    }
}

/// Response of the Append RPC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendResp {
    Success {
        current_revision: CurrentRevision,
        position: Option<Position>,
    },
    WrongExpectedVersion {
        current: CurrentRevision,
        expected: ExpectedRevision,
    },
}

impl AppendResp {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        match self {
            AppendResp::Success {
                current_revision,
                position,
            } => {
                let mut body = Vec::new();
                match current_revision {
                    CurrentRevision::Current(revision) => encode_uint64(1, *revision, &mut body),
                    CurrentRevision::NoStream => encode_empty(2, &mut body),
                }
                match position {
                    Some(position) => encode_message(3, &encode_position(*position), &mut body),
                    None => encode_empty(4, &mut body),
                }
                encode_message(1, &body, &mut out);
            }
            AppendResp::WrongExpectedVersion { current, expected } => {
                let mut body = Vec::new();
                match current {
                    CurrentRevision::Current(revision) => encode_uint64(1, *revision, &mut body),
                    CurrentRevision::NoStream => encode_empty(2, &mut body),
                }
                match expected {
                    ExpectedRevision::Exact(revision) => encode_uint64(3, *revision, &mut body),
                    ExpectedRevision::Any => encode_empty(4, &mut body),
                    ExpectedRevision::StreamExists => encode_empty(5, &mut body),
                    ExpectedRevision::NoStream => encode_empty(6, &mut body),
                }
                encode_message(2, &body, &mut out);
            }
        }
        Bytes::from(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_inner(buf).ok_or(DecodeError::Message("AppendResp"))
    }

    fn decode_inner(mut buf: &[u8]) -> Option<Self> {
        let mut resp = None;
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => {
                    let mut body = decode_length_delimited(&mut buf)?;
                    let mut current_revision = CurrentRevision::NoStream;
                    let mut position = None;
                    while !body.is_empty() {
                        let (field, wire_type) = decode_tag(&mut body)?;
                        match field {
                            1 => {
                                current_revision =
                                    CurrentRevision::Current(decode_varint(&mut body)?)
                            }
                            2 => {
                                decode_length_delimited(&mut body)?;
                                current_revision = CurrentRevision::NoStream;
                            }
                            3 => {
                                position =
                                    Some(decode_position(decode_length_delimited(&mut body)?)?)
                            }
                            4 => {
                                decode_length_delimited(&mut body)?;
                                position = None;
                            }
                            _ => skip_field(wire_type, &mut body)?,
                        }
                    }
                    resp = Some(AppendResp::Success {
                        current_revision,
                        position,
                    });
                }
                2 => {
                    let mut body = decode_length_delimited(&mut buf)?;
                    let mut current = CurrentRevision::NoStream;
                    let mut expected = ExpectedRevision::Any;
                    while !body.is_empty() {
                        let (field, wire_type) = decode_tag(&mut body)?;
                        match field {
                            1 => current = CurrentRevision::Current(decode_varint(&mut body)?),
                            2 => {
                                decode_length_delimited(&mut body)?;
                                current = CurrentRevision::NoStream;
                            }
                            3 => {
                                expected = ExpectedRevision::Exact(decode_varint(&mut body)?)
                            }
                            4 => {
                                decode_length_delimited(&mut body)?;
                                expected = ExpectedRevision::Any;
                            }
                            5 => {
                                decode_length_delimited(&mut body)?;
                                expected = ExpectedRevision::StreamExists;
                            }
                            6 => {
                                decode_length_delimited(&mut body)?;
                                expected = ExpectedRevision::NoStream;
                            }
                            _ => skip_field(wire_type, &mut body)?,
                        }
                    }
                    resp = Some(AppendResp::WrongExpectedVersion { current, expected });
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        resp
    }
}

/// Request of the unary Delete and Tombstone RPCs (identical options).
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteReq {
    pub stream_name: String,
    pub expected: ExpectedRevision,
}

impl DeleteReq {
    pub fn encode(&self) -> Bytes {
        let mut options = Vec::new();
        encode_message(1, &stream_identifier(&self.stream_name), &mut options);
        encode_expected_revision(self.expected, &mut options);
        let mut out = Vec::new();
        encode_message(1, &options, &mut out);
        Bytes::from(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_inner(buf).ok_or(DecodeError::Message("DeleteReq"))
    }

    fn decode_inner(mut buf: &[u8]) -> Option<Self> {
        let mut req = None;
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => {
                    let mut options = decode_length_delimited(&mut buf)?;
                    let mut stream_name = String::new();
                    let mut expected = ExpectedRevision::Any;
                    while !options.is_empty() {
                        let (field, wire_type) = decode_tag(&mut options)?;
                        match field {
                            1 => {
                                stream_name = decode_stream_identifier(decode_length_delimited(
                                    &mut options,
                                )?)?
                            }
                            2..=5 => {
                                expected =
                                    decode_expected_revision(field, wire_type, &mut options)?
                            }
                            _ => skip_field(wire_type, &mut options)?,
                        }
                    }
                    req = Some(DeleteReq {
                        stream_name,
                        expected,
                    });
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        req
    }
}

/// Response of the Delete and Tombstone RPCs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeleteResp {
    pub position: Option<Position>,
}

impl DeleteResp {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        match self.position {
            Some(position) => encode_message(1, &encode_position(position), &mut out),
            None => encode_empty(2, &mut out),
        }
        Bytes::from(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_inner(buf).ok_or(DecodeError::Message("DeleteResp"))
    }

    fn decode_inner(mut buf: &[u8]) -> Option<Self> {
        let mut position = None;
        while !buf.is_empty() {
            let (field, wire_type) = decode_tag(&mut buf)?;
            match field {
                1 => position = Some(decode_position(decode_length_delimited(&mut buf)?)?),
                2 => {
                    decode_length_delimited(&mut buf)?;
                    position = None;
                }
                _ => skip_field(wire_type, &mut buf)?,
            }
        }
        Some(DeleteResp { position })
    }
}

// -- Shared pieces --

fn stream_identifier(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    encode_bytes(3, name.as_bytes(), &mut out);
    out
}

fn decode_stream_identifier(mut buf: &[u8]) -> Option<String> {
    let mut name = String::new();
    while !buf.is_empty() {
        let (field, wire_type) = decode_tag(&mut buf)?;
        match field {
            3 => name = decode_string(&mut buf)?,
            _ => skip_field(wire_type, &mut buf)?,
        }
    }
    Some(name)
}

fn decode_uuid(mut buf: &[u8]) -> Option<String> {
    let mut id = String::new();
    let mut structured: Option<(u64, u64)> = None;
    while !buf.is_empty() {
        let (field, wire_type) = decode_tag(&mut buf)?;
        match field {
            1 => {
                let mut body = decode_length_delimited(&mut buf)?;
                let (mut most, mut least) = (0, 0);
                while !body.is_empty() {
                    let (field, wire_type) = decode_tag(&mut body)?;
                    match field {
                        1 => most = decode_varint(&mut body)?,
                        2 => least = decode_varint(&mut body)?,
                        _ => skip_field(wire_type, &mut body)?,
                    }
                }
                structured = Some((most, least));
            }
            2 => id = decode_string(&mut buf)?,
            _ => skip_field(wire_type, &mut buf)?,
        }
    }
    if id.is_empty() {
        if let Some((most, least)) = structured {
            id = uuid::Uuid::from_u64_pair(most, least).to_string();
        }
    }
    Some(id)
}

fn encode_position(position: Position) -> Vec<u8> {
    let mut out = Vec::new();
    encode_uint64(1, position.commit, &mut out);
    encode_uint64(2, position.prepare, &mut out);
    out
}

fn decode_position(mut buf: &[u8]) -> Option<Position> {
    let mut position = Position::default();
    while !buf.is_empty() {
        let (field, wire_type) = decode_tag(&mut buf)?;
        match field {
            1 => position.commit = decode_varint(&mut buf)?,
            2 => position.prepare = decode_varint(&mut buf)?,
            _ => skip_field(wire_type, &mut buf)?,
        }
    }
    Some(position)
}

fn encode_expected_revision(expected: ExpectedRevision, out: &mut Vec<u8>) {
    match expected {
        ExpectedRevision::Exact(revision) => encode_uint64(2, revision, out),
        ExpectedRevision::NoStream => encode_empty(3, out),
        ExpectedRevision::Any => encode_empty(4, out),
        ExpectedRevision::StreamExists => encode_empty(5, out),
    }
}

fn decode_expected_revision(
    field: u32,
    wire_type: u8,
    buf: &mut &[u8],
) -> Option<ExpectedRevision> {
    match field {
        2 => Some(ExpectedRevision::Exact(decode_varint(buf)?)),
        3 => {
            decode_length_delimited(buf)?;
            Some(ExpectedRevision::NoStream)
        }
        4 => {
            decode_length_delimited(buf)?;
            Some(ExpectedRevision::Any)
        }
        5 => {
            decode_length_delimited(buf)?;
            Some(ExpectedRevision::StreamExists)
        }
        _ => {
            skip_field(wire_type, buf)?;
            None
        }
    }
}
