// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Typed SIP message model for the Sluice proxy engine.
//!
//! This crate holds the in-memory shapes the engine routes on — requests,
//! responses, headers, URIs — plus the small header-surgery helpers a proxy
//! needs (Via stacking, branch extraction, Max-Forwards). It deliberately
//! owns no wire grammar: parsing and serialization live behind the transport
//! boundary.

pub mod contact;
mod headers;
mod max_forwards;
mod method;
mod msg;
mod uri;

pub use contact::{format_contact, parse_contacts, Contact};
pub use headers::{Header, Headers};
pub use max_forwards::{decrement_max_forwards, MaxForwardsError};
pub use method::Method;
pub use msg::{reason_phrase, Request, RequestLine, Response, StatusLine};
pub use uri::SipUri;

use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

const MAGIC_COOKIE: &str = "z9hG4bK";

/// Returns the top-most Via header value of a request, if present.
pub fn top_via(req: &Request) -> Option<&SmolStr> {
    req.headers.get_all("Via").next()
}

/// Extracts the `branch=` parameter from a Via header string.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the branch ID for the given request, if one is present.
pub fn request_branch_id(req: &Request) -> Option<SmolStr> {
    let via = top_via(req)?;
    let branch = branch_from_via(via)?;
    Some(SmolStr::new(branch.to_owned()))
}

/// Returns `true` if the branch carries the RFC 3261 magic cookie.
pub fn is_rfc3261_branch(branch: &str) -> bool {
    branch.len() > MAGIC_COOKIE.len() && branch.starts_with(MAGIC_COOKIE)
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", MAGIC_COOKIE, suffix))
}
