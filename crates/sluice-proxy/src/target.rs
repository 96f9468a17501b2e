// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use smol_str::SmolStr;

use sluice_msg::SipUri;

/// Transport protocol for an outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Returns true for TCP and TLS, which do not retransmit at the SIP layer.
    pub fn is_reliable(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }

    /// Returns the transport token used in Via headers.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Parses a Via transport token.
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("UDP") {
            Some(TransportKind::Udp)
        } else if token.eq_ignore_ascii_case("TCP") {
            Some(TransportKind::Tcp)
        } else if token.eq_ignore_ascii_case("TLS") {
            Some(TransportKind::Tls)
        } else {
            None
        }
    }
}

/// A candidate next-hop for one inbound request.
///
/// Produced by the resolver/server-group collaborator (or by 3xx recursion)
/// and immutable once created. Higher `q_value` means more preferred.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub uri: SipUri,
    pub transport: TransportKind,
    pub q_value: f32,
    pub weight: u16,
    pub group: Option<SmolStr>,
}

impl Target {
    /// Creates a target with default transport, q-value and weight.
    pub fn new(uri: SipUri) -> Self {
        let transport = if uri.sips {
            TransportKind::Tls
        } else {
            TransportKind::Udp
        };
        Self {
            uri,
            transport,
            q_value: 1.0,
            weight: 1,
            group: None,
        }
    }

    /// Sets the transport protocol.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the q-value (clamped to 0.0-1.0, higher = more preferred).
    pub fn with_q_value(mut self, q: f32) -> Self {
        self.q_value = q.clamp(0.0, 1.0);
        self
    }

    /// Sets the relative weight within a q-tier.
    pub fn with_weight(mut self, weight: u16) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the owning server-group name.
    pub fn with_group(mut self, group: impl Into<SmolStr>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Sorts targets by descending preference (q-value, then weight).
pub fn sort_by_preference(targets: &mut [Target]) {
    targets.sort_by(|a, b| {
        b.q_value
            .partial_cmp(&a.q_value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.weight.cmp(&a.weight))
    });
}

/// Groups targets into descending q-value tiers, preserving relative order
/// within each tier. Used by the highest-priority search.
pub fn q_tiers(mut targets: Vec<Target>) -> Vec<Vec<Target>> {
    sort_by_preference(&mut targets);

    let mut tiers: Vec<Vec<Target>> = Vec::new();
    for target in targets {
        match tiers.last_mut() {
            Some(tier) if tier[0].q_value == target.q_value => tier.push(target),
            _ => tiers.push(vec![target]),
        }
    }
    tiers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, q: f32) -> Target {
        Target::new(SipUri::parse(&format!("sip:{host}")).unwrap()).with_q_value(q)
    }

    #[test]
    fn sips_uri_defaults_to_tls() {
        let t = Target::new(SipUri::parse("sips:secure.example.com").unwrap());
        assert_eq!(t.transport, TransportKind::Tls);
    }

    #[test]
    fn sorts_descending_by_q() {
        let mut targets = vec![target("a", 0.3), target("b", 1.0), target("c", 0.7)];
        sort_by_preference(&mut targets);
        let hosts: Vec<&str> = targets.iter().map(|t| t.uri.host.as_str()).collect();
        assert_eq!(hosts, vec!["b", "c", "a"]);
    }

    #[test]
    fn tiers_group_equal_q_values() {
        let tiers = q_tiers(vec![
            target("a", 0.5),
            target("b", 1.0),
            target("c", 0.5),
            target("d", 1.0),
        ]);
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].len(), 2);
        assert!(tiers[0].iter().all(|t| t.q_value == 1.0));
        assert_eq!(tiers[1].len(), 2);
    }

    #[test]
    fn q_value_is_clamped() {
        assert_eq!(target("a", 7.0).q_value, 1.0);
        assert_eq!(target("a", -1.0).q_value, 0.0);
    }
}
