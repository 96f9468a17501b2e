// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

/// Parsed representation of a SIP URI (RFC 3261 §19).
///
/// Only the pieces the proxy engine routes on are modelled: scheme security,
/// user, host, port, and URI parameters. Escaping is preserved verbatim in
/// `raw`; the engine never rewrites user parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub raw: SmolStr,
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl SipUri {
    /// Constructs a `sip:` URI with the given host and default settings.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        let host = host.into();
        Self {
            raw: SmolStr::new(format!("sip:{}", host)),
            sips: false,
            user: None,
            host,
            port: None,
            params: BTreeMap::new(),
        }
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let raw = SmolStr::new(input.to_owned());
        let (scheme, rest) = input.split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        // URI headers (?key=value) are irrelevant to routing; strip them.
        let addr_part = match rest.split_once('?') {
            Some((addr, _)) => addr,
            None => rest,
        };

        let mut params = BTreeMap::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            if let Some((k, v)) = param.split_once('=') {
                params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim().to_owned())),
                );
            } else {
                params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
            }
        }

        let (user, host_port) = match base.split_once('@') {
            Some((user, host)) => (Some(SmolStr::new(user.trim().to_owned())), host.trim()),
            None => (None, base.trim()),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;

        Some(Self {
            raw,
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
        })
    }

    /// Returns the original textual representation of the URI.
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }

    /// Returns the named URI parameter, if present.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params.get(&SmolStr::new(name.to_ascii_lowercase()))
    }

    /// Returns the port, falling back to the scheme default.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.sips { 5061 } else { 5060 })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn split_host_port(host_port: &str) -> Option<(&str, Option<u16>)> {
    // IPv6 literals are bracketed: [::1]:5060
    if let Some(rest) = host_port.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if after.is_empty() => None,
            None => return None,
        };
        return Some((host, port));
    }

    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host, Some(port.parse().ok()?))),
        _ => Some((host_port, None)),
    }
}
