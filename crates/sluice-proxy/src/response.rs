// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Canonical response construction.
//!
//! Pure functions from a request (plus data) to a response object, per
//! RFC 3261 §8.2.6: the Via stack, From, To, Call-ID and CSeq are copied
//! from the request so the response retraces the request's path.

use bytes::Bytes;

use sluice_msg::{format_contact, Headers, Request, Response, StatusLine};

use crate::target::Target;

/// Builds the canned responses the engine sends on its own behalf.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Builds a response to `request` with the canonical reason phrase,
    /// copying the headers a response must echo.
    pub fn response(request: &Request, code: u16) -> Response {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(name, value.clone());
            }
        }
        headers.push("Content-Length", "0");

        Response::new(StatusLine::from_code(code), headers, Bytes::new())
    }

    /// 100 Trying, sent as soon as a stateful transaction exists.
    pub fn trying(request: &Request) -> Response {
        Self::response(request, 100)
    }

    /// 404 Not Found, for requests with no viable candidates.
    pub fn not_found(request: &Request) -> Response {
        Self::response(request, 404)
    }

    /// 408 Request Timeout, synthesized when every branch timed out silently.
    pub fn request_timeout(request: &Request) -> Response {
        Self::response(request, 408)
    }

    /// 487 Request Terminated, after a cancelled transaction.
    pub fn request_terminated(request: &Request) -> Response {
        Self::response(request, 487)
    }

    /// 500 Server Internal Error, optionally carrying Retry-After.
    pub fn server_error(request: &Request, retry_after_ms: u64) -> Response {
        let mut response = Self::response(request, 500);
        if retry_after_ms > 0 {
            let seconds = retry_after_ms.div_ceil(1000);
            response
                .headers
                .push("Retry-After", seconds.to_string());
        }
        response
    }

    /// 302 Moved Temporarily carrying one Contact per target.
    pub fn redirect(request: &Request, targets: &[Target]) -> Response {
        let mut response = Self::response(request, 302);
        for target in targets {
            let q = (target.q_value < 1.0).then_some(target.q_value);
            response
                .headers
                .push("Contact", format_contact(&target.uri, q));
        }
        response
    }
}
