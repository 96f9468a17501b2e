// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-inbound-request controller construction.
//!
//! The factory snapshots the live configuration once per request, derives
//! the request and sequential-search timeouts from it, and keeps the live
//! controllers keyed by inbound branch so retransmissions and CANCEL/ACK
//! find their transaction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::debug;

use sluice_msg::{generate_branch_id, request_branch_id, top_via, Request};

use crate::aggregator::{ErrorAggregator, ListenerRegistry};
use crate::config::SharedConfig;
use crate::controller::ProxyController;
use crate::target::TransportKind;
use crate::{OutboundTransport, TargetResolver, UpstreamSink};

/// Builds one [`ProxyController`] per inbound transaction.
pub struct ControllerFactory {
    shared: Arc<SharedConfig>,
    registry: Arc<ListenerRegistry>,
    transport: Arc<dyn OutboundTransport>,
    resolver: Arc<dyn TargetResolver>,
    active: DashMap<SmolStr, (ProxyController, Instant)>,
}

impl ControllerFactory {
    pub fn new(
        shared: Arc<SharedConfig>,
        registry: Arc<ListenerRegistry>,
        transport: Arc<dyn OutboundTransport>,
        resolver: Arc<dyn TargetResolver>,
    ) -> Self {
        Self {
            shared,
            registry,
            transport,
            resolver,
            active: DashMap::new(),
        }
    }

    /// Returns the controller for this inbound transaction, creating one on
    /// first sight. Idempotent per inbound branch.
    ///
    /// On creation the configuration is snapshotted, timeouts are computed
    /// from transport reliability and INVITE-ness, and — when the snapshot
    /// says stateful and the method can own a transaction — the transaction
    /// is created eagerly so 100 Trying goes out immediately.
    pub async fn controller_for(
        &self,
        request: &Request,
        upstream: Arc<dyn UpstreamSink>,
    ) -> ProxyController {
        let key = request_branch_id(request).unwrap_or_else(generate_branch_id);
        if let Some(entry) = self.active.get(&key) {
            return entry.0.clone();
        }

        let config = self.shared.snapshot();
        let transport_kind = inbound_transport(request);
        let is_invite = request.method().is_invite();
        let request_timeout = config.request_timeout(transport_kind, is_invite);
        let sequential_timeout = config.sequential_search_timeout(transport_kind, is_invite);

        let session_id = request.call_id().cloned().unwrap_or_else(|| key.clone());
        let aggregator = Arc::new(ErrorAggregator::new(
            session_id,
            request.method().clone(),
            self.registry.clone(),
        ));

        let controller = ProxyController::new(
            config,
            self.transport.clone(),
            self.resolver.clone(),
            upstream,
            aggregator,
            request_timeout,
            sequential_timeout,
        );

        let controller = match self.active.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().0.clone(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((controller.clone(), Instant::now()));
                controller
            }
        };

        controller.on_new_request(request).await;
        controller
    }

    /// Drops the controller for a completed inbound transaction.
    pub fn release(&self, branch: &str) {
        if self.active.remove(branch).is_some() {
            debug!(branch, "controller released");
        }
    }

    /// Evicts controllers older than `max_age`; the backstop for inbound
    /// legs that never completed cleanly.
    pub fn evict_older_than(&self, max_age: Duration) {
        let now = Instant::now();
        self.active
            .retain(|_, (_, created)| now.duration_since(*created) < max_age);
    }

    /// Number of live controllers.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Derives the inbound transport from the top Via, defaulting to UDP.
fn inbound_transport(request: &Request) -> TransportKind {
    top_via(request)
        .and_then(|via| via.strip_prefix("SIP/2.0/"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(TransportKind::from_token)
        .unwrap_or(TransportKind::Udp)
}
