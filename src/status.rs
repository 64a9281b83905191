// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! gRPC status handling.
//!
//! A gRPC response carries its status out of band: `grpc-status` and
//! `grpc-message` arrive in HTTP/2 trailers (or, for trailers-only responses,
//! in the response headers). This module models the status codes, extracts a
//! [`Status`] from trailers, and maps raw HTTP statuses and HTTP/2 reset
//! reasons onto gRPC codes.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// gRPC status codes (<https://grpc.github.io/grpc/core/md_doc_statuscodes.html>).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Parse a status code from its wire integer value.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Map a non-200 HTTP status onto the corresponding gRPC code.
    pub fn from_http(status: StatusCode) -> Self {
        match status.as_u16() {
            400 => Self::Internal,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::Unimplemented,
            429 => Self::Unavailable,
            502..=504 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    /// Map an HTTP/2 RST_STREAM reason onto the corresponding gRPC code.
    pub fn from_h2_reason(reason: h2::Reason) -> Self {
        match reason {
            h2::Reason::NO_ERROR | h2::Reason::PROTOCOL_ERROR | h2::Reason::INTERNAL_ERROR => {
                Self::Internal
            }
            h2::Reason::REFUSED_STREAM => Self::Unavailable,
            h2::Reason::CANCEL => Self::Cancelled,
            h2::Reason::ENHANCE_YOUR_CALM => Self::ResourceExhausted,
            h2::Reason::INADEQUATE_SECURITY => Self::PermissionDenied,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// The terminal status of one gRPC request.
///
/// `trailers` holds whatever trailer metadata accompanied the status, minus
/// nothing: `grpc-status`/`grpc-message` are kept so callers can inspect the
/// raw exchange. `details` carries any messages that were decoded but not yet
/// consumed when a non-ok status arrived.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub trailers: HeaderMap,
    pub details: Vec<Bytes>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
            trailers: HeaderMap::new(),
            details: Vec::new(),
        }
    }

    /// The ok status.
    pub fn ok() -> Self {
        Status::new(Code::Ok, "")
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Extract a status from a trailer block.
    ///
    /// An absent `grpc-status` on a cleanly ended stream maps to `Unknown`.
    pub fn from_trailers(trailers: HeaderMap) -> Self {
        let code = trailers
            .get("grpc-status")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u8>().ok())
            .map(Code::from_u8);
        let message = trailers
            .get("grpc-message")
            .map(|v| percent_decode(v.as_bytes()))
            .unwrap_or_default();
        match code {
            Some(code) => Status {
                code,
                message,
                trailers,
                details: Vec::new(),
            },
            None => Status {
                code: Code::Unknown,
                message: "stream ended without a grpc-status".to_string(),
                trailers,
                details: Vec::new(),
            },
        }
    }

    /// Extract a trailers-only status from response headers, if present.
    pub fn from_header_status(headers: &HeaderMap) -> Option<Self> {
        headers.get("grpc-status")?;
        Some(Self::from_trailers(headers.clone()))
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Decode the percent-encoding used by `grpc-message` (%XX escapes only;
/// everything else passes through). Invalid escapes are kept verbatim.
fn percent_decode(value: &[u8]) -> String {
    let mut out = Vec::with_capacity(value.len());
    let mut i = 0;
    while i < value.len() {
        match value[i] {
            b'%' if i + 2 < value.len() => {
                let hex = std::str::from_utf8(&value[i + 1..i + 3])
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn trailers(status: &str, message: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("grpc-status", HeaderValue::from_str(status).unwrap());
        if let Some(message) = message {
            map.insert("grpc-message", HeaderValue::from_str(message).unwrap());
        }
        map
    }

    #[test]
    fn code_round_trip() {
        for code in 0..=16u8 {
            assert_eq!(Code::from_u8(code) as u8, code);
        }
    }

    #[test]
    fn unknown_code_values_map_to_unknown() {
        assert_eq!(Code::from_u8(17), Code::Unknown);
        assert_eq!(Code::from_u8(255), Code::Unknown);
    }

    #[test]
    fn extract_ok_status() {
        let status = Status::from_trailers(trailers("0", None));
        assert!(status.is_ok());
        assert_eq!(status.message, "");
    }

    #[test]
    fn extract_error_status_with_message() {
        let status = Status::from_trailers(trailers("5", Some("stream not found")));
        assert_eq!(status.code, Code::NotFound);
        assert_eq!(status.message, "stream not found");
    }

    #[test]
    fn missing_status_is_unknown() {
        let status = Status::from_trailers(HeaderMap::new());
        assert_eq!(status.code, Code::Unknown);
    }

    #[test]
    fn message_is_percent_decoded() {
        let status = Status::from_trailers(trailers("9", Some("Event stream %27a%27 is deleted.")));
        assert_eq!(status.message, "Event stream 'a' is deleted.");
    }

    #[test]
    fn invalid_escapes_pass_through() {
        assert_eq!(percent_decode(b"100%"), "100%");
        assert_eq!(percent_decode(b"%zz"), "%zz");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(Code::from_http(StatusCode::BAD_REQUEST), Code::Internal);
        assert_eq!(Code::from_http(StatusCode::UNAUTHORIZED), Code::Unauthenticated);
        assert_eq!(Code::from_http(StatusCode::FORBIDDEN), Code::PermissionDenied);
        assert_eq!(Code::from_http(StatusCode::NOT_FOUND), Code::Unimplemented);
        assert_eq!(Code::from_http(StatusCode::TOO_MANY_REQUESTS), Code::Unavailable);
        assert_eq!(Code::from_http(StatusCode::BAD_GATEWAY), Code::Unavailable);
        assert_eq!(Code::from_http(StatusCode::SERVICE_UNAVAILABLE), Code::Unavailable);
        assert_eq!(Code::from_http(StatusCode::GATEWAY_TIMEOUT), Code::Unavailable);
        assert_eq!(Code::from_http(StatusCode::IM_A_TEAPOT), Code::Unknown);
    }

    #[test]
    fn reset_reason_mapping() {
        assert_eq!(Code::from_h2_reason(h2::Reason::CANCEL), Code::Cancelled);
        assert_eq!(Code::from_h2_reason(h2::Reason::REFUSED_STREAM), Code::Unavailable);
        assert_eq!(Code::from_h2_reason(h2::Reason::INTERNAL_ERROR), Code::Internal);
    }

    #[test]
    fn header_status_only_when_present() {
        assert!(Status::from_header_status(&HeaderMap::new()).is_none());
        let status = Status::from_header_status(&trailers("12", None)).unwrap();
        assert_eq!(status.code, Code::Unimplemented);
    }
}
