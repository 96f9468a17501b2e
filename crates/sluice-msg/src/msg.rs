// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri};

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self { method, uri }
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason-Phrase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        debug_assert!((100..700).contains(&code), "SIP status codes are 100-699");
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a status line using the canonical reason phrase for the code.
    pub fn from_code(code: u16) -> Self {
        Self::new(code, reason_phrase(code))
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Builds a request from its components.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.start.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &SipUri {
        &self.start.uri
    }

    /// Returns the Call-ID header value, if present.
    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }

    /// Returns the CSeq sequence number, if parseable.
    pub fn cseq_number(&self) -> Option<u32> {
        let cseq = self.headers.get("CSeq")?;
        cseq.split_whitespace().next()?.parse().ok()
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Builds a response from its components.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code
    }

    /// Returns `true` for 1xx responses.
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.start.code)
    }

    /// Returns `true` for 2xx responses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }

    /// Returns `true` for 3xx responses.
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.start.code)
    }

    /// Returns `true` for 6xx responses.
    pub fn is_global_failure(&self) -> bool {
        (600..700).contains(&self.start.code)
    }

    /// Returns `true` for any final (>= 200) response.
    pub fn is_final(&self) -> bool {
        self.start.code >= 200
    }
}

/// Returns the canonical reason phrase for a SIP status code (RFC 3261 §21).
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        305 => "Use Proxy",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        420 => "Bad Extension",
        421 => "Extension Required",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        484 => "Address Incomplete",
        485 => "Ambiguous",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        493 => "Undecipherable",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        505 => "Version Not Supported",
        513 => "Message Too Large",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => "Unknown",
    }
}
