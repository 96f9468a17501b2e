// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-request proxy configuration.
//!
//! The live store is read-mostly: [`SharedConfig`] hands out an `Arc`
//! snapshot per inbound request, so a concurrent update never changes policy
//! mid-transaction.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use smol_str::SmolStr;

use sluice_msg::SipUri;

use crate::target::TransportKind;

/// Forking strategy for one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// All candidates proxied concurrently as soon as known.
    Parallel,
    /// One candidate at a time, descending preference.
    Sequential,
    /// Only the top q-tier in parallel; lower tiers on full-tier failure.
    HighestPriority,
}

/// Whether the proxy retains per-transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateMode {
    /// Full transaction state, created eagerly for non-ACK/CANCEL requests.
    Stateful,
    /// No retained state until an explicit promotion.
    Stateless,
    /// State created lazily on the first proxy attempt, for failover only.
    FailoverStateful,
}

/// What to do when a next-hop fails with no SIP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverAction {
    /// Try the next candidate per the search mode.
    TryNext,
    /// Stop the search and answer with the best response so far.
    Stop,
}

/// One address the proxy listens on / advertises in Via and Record-Route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenPoint {
    pub host: SmolStr,
    pub port: u16,
    pub transport: TransportKind,
}

impl ListenPoint {
    pub fn new(host: impl Into<SmolStr>, port: u16, transport: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
        }
    }
}

/// Immutable per-request configuration snapshot.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub search_mode: SearchMode,
    pub state_mode: StateMode,
    pub is_recursing: bool,
    /// Bound on 3xx recursion depth; redirects past this are dropped.
    pub max_recursion_depth: u8,
    pub cancel_branches_automatically: bool,
    /// Retry-After attached to locally generated 5xx responses, if non-zero.
    pub default_retry_after_ms: u64,
    pub failover_action: FailoverAction,
    /// Final response codes that trigger failover to the next candidate.
    pub failover_codes: Vec<u16>,
    /// `sequential_search_timeout = request_timeout / sequential_divisor`.
    pub sequential_divisor: u32,
    /// RFC 3261 T1 estimate; request timeout is 64×T1.
    pub t1: Duration,
    /// Explicit request-timeout override, bypassing the 64×T1 computation.
    pub request_timeout_override: Option<Duration>,
    /// Addresses this proxy answers on; used to recognize its own Via.
    pub listen: Vec<ListenPoint>,
    /// Address advertised in the Via of forwarded requests.
    pub via_address: ListenPoint,
    /// Record-Route URI inserted when staying on the signaling path.
    pub record_route_uri: Option<SipUri>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let via = ListenPoint::new("proxy.invalid", 5060, TransportKind::Udp);
        Self {
            search_mode: SearchMode::Parallel,
            state_mode: StateMode::Stateful,
            is_recursing: true,
            max_recursion_depth: 5,
            cancel_branches_automatically: true,
            default_retry_after_ms: 0,
            failover_action: FailoverAction::TryNext,
            failover_codes: vec![408, 480, 486, 500, 502, 503, 504, 600, 603],
            sequential_divisor: 2,
            t1: Duration::from_millis(500),
            request_timeout_override: None,
            listen: vec![via.clone()],
            via_address: via,
            record_route_uri: None,
        }
    }
}

impl ProxyConfig {
    /// Returns whether the given sent-by address belongs to this proxy.
    ///
    /// Used to strip the proxy's own top Via before promoting a stateless
    /// transaction.
    pub fn recognize(&self, host: &str, port: u16, transport: TransportKind) -> bool {
        self.listen.iter().any(|lp| {
            lp.port == port && lp.transport == transport && lp.host.eq_ignore_ascii_case(host)
        })
    }

    /// Overall per-branch request timeout: 64×T1 unless overridden.
    ///
    /// Transaction timeouts (Timers B and F) are the same on reliable and
    /// unreliable transports; only retransmission timers differ, and those
    /// belong to the transport layer.
    pub fn request_timeout(&self, _transport: TransportKind, _is_invite: bool) -> Duration {
        self.request_timeout_override
            .unwrap_or_else(|| self.t1.saturating_mul(64))
    }

    /// How long a sequential search waits on one candidate before starting
    /// the next.
    pub fn sequential_search_timeout(&self, transport: TransportKind, is_invite: bool) -> Duration {
        self.request_timeout(transport, is_invite) / self.sequential_divisor.max(1)
    }

    /// Returns whether a final response code triggers failover.
    pub fn is_failover_code(&self, code: u16) -> bool {
        self.failover_codes.contains(&code)
    }
}

/// Process-wide configuration store. Updates replace the snapshot atomically;
/// in-flight transactions keep the snapshot they started with.
#[derive(Debug)]
pub struct SharedConfig {
    current: RwLock<Arc<ProxyConfig>>,
}

impl SharedConfig {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.current.read().clone()
    }

    /// Replaces the live configuration.
    pub fn update(&self, config: ProxyConfig) {
        *self.current.write() = Arc::new(config);
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}
