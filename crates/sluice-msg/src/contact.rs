// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

use crate::{Headers, SipUri};

/// One parsed Contact header entry: the target URI and the q-value, if any.
///
/// Redirect (3xx) recursion only needs the URI and preference ordering, so
/// display names are discarded and unparsable entries are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub uri: SipUri,
    pub q: Option<f32>,
}

/// Parses every Contact entry from the given headers, preserving order.
///
/// Handles both `name-addr` (`"Bob" <sip:bob@host>;q=0.8`) and bare
/// `addr-spec` (`sip:bob@host`) forms, and comma-separated lists within one
/// header line. Entries whose URI fails to parse are dropped.
pub fn parse_contacts(headers: &Headers) -> Vec<Contact> {
    let mut contacts = Vec::new();
    for value in headers.get_all("Contact") {
        for entry in split_contact_list(value) {
            if let Some(contact) = parse_contact_entry(entry) {
                contacts.push(contact);
            }
        }
    }
    contacts
}

/// Splits a Contact header value on top-level commas, respecting quoted
/// display names and angle-bracketed URIs (which may contain commas).
fn split_contact_list(value: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0usize;

    for (i, ch) in value.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                entries.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(value[start..].trim());
    entries.retain(|e| !e.is_empty());
    entries
}

fn parse_contact_entry(entry: &str) -> Option<Contact> {
    let (uri_str, param_str) = match entry.find('<') {
        Some(open) => {
            let close = entry[open..].find('>')? + open;
            (&entry[open + 1..close], entry.get(close + 1..).unwrap_or(""))
        }
        // addr-spec form: everything after the first ';' is a contact param
        None => match entry.split_once(';') {
            Some((uri, rest)) => (uri, rest),
            None => (entry, ""),
        },
    };

    let uri = SipUri::parse(uri_str.trim())?;
    let q = contact_q(param_str);
    Some(Contact { uri, q })
}

fn contact_q(params: &str) -> Option<f32> {
    for param in params.split(';') {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("q") {
            return value.trim().parse::<f32>().ok().map(|q| q.clamp(0.0, 1.0));
        }
    }
    None
}

/// Formats a Contact header value for the given URI and optional q-value.
pub fn format_contact(uri: &SipUri, q: Option<f32>) -> SmolStr {
    match q {
        Some(q) => SmolStr::new(format!("<{}>;q={:.3}", uri, q)),
        None => SmolStr::new(format!("<{}>", uri)),
    }
}
