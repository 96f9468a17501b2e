// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability integration for the proxy engine.
//!
//! Provides a process-wide metrics sink the engine emits low-cardinality
//! events into: branches started and settled, responses forwarded,
//! transactions completed.
//!
//! # Example
//! ```
//! use sluice_observe::{set_engine_metrics, TracingEngineMetrics};
//! use std::sync::Arc;
//! set_engine_metrics(Arc::new(TracingEngineMetrics));
//! // Events now emitted via tracing
//! ```

use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Metrics sink used by the engine to emit observability events.
///
/// Implementations should treat `transport`, `outcome`, and `state` as
/// low-cardinality identifiers (e.g., "udp", "failure", "responded") and
/// must not block: these run on the proxying path.
pub trait EngineMetrics: Send + Sync + 'static {
    fn on_branch_started(&self, transport: &str);
    fn on_branch_settled(&self, outcome: &str);
    fn on_response_forwarded(&self, code: u16);
    fn on_transaction_completed(&self, state: &str);
}

#[derive(Debug, Default)]
struct NoopEngineMetrics;

impl EngineMetrics for NoopEngineMetrics {
    fn on_branch_started(&self, _transport: &str) {}
    fn on_branch_settled(&self, _outcome: &str) {}
    fn on_response_forwarded(&self, _code: u16) {}
    fn on_transaction_completed(&self, _state: &str) {}
}

static ENGINE_METRICS: OnceCell<Arc<dyn EngineMetrics>> = OnceCell::new();
static NOOP_ENGINE_METRICS: NoopEngineMetrics = NoopEngineMetrics;

/// Installs the global engine metrics implementation.
///
/// Returns `true` if the sink was installed, or `false` if it was already
/// configured.
pub fn set_engine_metrics(metrics: Arc<dyn EngineMetrics>) -> bool {
    ENGINE_METRICS.set(metrics).is_ok()
}

/// Returns the currently configured engine metrics sink.
pub fn engine_metrics() -> &'static dyn EngineMetrics {
    ENGINE_METRICS
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_ENGINE_METRICS)
}

/// Simple metrics implementation that logs via `tracing`.
#[derive(Debug, Default)]
pub struct TracingEngineMetrics;

impl EngineMetrics for TracingEngineMetrics {
    fn on_branch_started(&self, transport: &str) {
        tracing::debug!(transport, "branch started");
    }

    fn on_branch_settled(&self, outcome: &str) {
        tracing::debug!(outcome, "branch settled");
    }

    fn on_response_forwarded(&self, code: u16) {
        tracing::debug!(code, "response forwarded upstream");
    }

    fn on_transaction_completed(&self, state: &str) {
        tracing::debug!(state, "proxy transaction completed");
    }
}
