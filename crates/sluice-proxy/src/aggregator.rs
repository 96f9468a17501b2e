// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Failure aggregation and listener fan-out.
//!
//! Every branch failure is appended to a per-request log and, subject to a
//! per-category predicate, pushed synchronously to the registered listeners.
//! The registry is owned by the process root and injected — there is no
//! global mutable state here.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use tracing::{debug, warn};

use sluice_msg::{Method, Response};

use crate::error::ProxyError;

/// Category attached to an error when it is published to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ProxyFailure,
    RoutingFailure,
    ServerGroupDown,
    FailureResponse,
    RequestTimeout,
    ResponseSendFailure,
}

/// An error published to listeners, tagged with its origin.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub error: ProxyError,
    /// Call-ID of the request the error belongs to.
    pub session_id: SmolStr,
    pub method: Method,
}

/// Receives classified proxy errors. Implementations must be fast; they are
/// invoked synchronously on the proxying path.
pub trait ErrorListener: Send + Sync + 'static {
    fn on_error(&self, event: &ErrorEvent);
}

/// Process-owned set of error listeners.
///
/// Registration is idempotent per listener instance; the same `Arc`
/// registered twice is notified once.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn ErrorListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener. Returns false if this exact instance was already
    /// registered.
    pub fn register(&self, listener: Arc<dyn ErrorListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Removes a listener instance. Returns true if it was present.
    pub fn unregister(&self, listener: &Arc<dyn ErrorListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Delivers an event to every listener.
    ///
    /// Each listener runs behind `catch_unwind`: one panicking listener is
    /// logged and skipped, and delivery continues with the rest.
    pub fn notify(&self, event: &ErrorEvent) {
        let snapshot: Vec<_> = self.listeners.read().clone();
        for listener in snapshot {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_error(event)));
            if result.is_err() {
                warn!(
                    kind = ?event.kind,
                    code = event.error.code(),
                    "error listener panicked; skipping"
                );
            }
        }
    }
}

/// Per-request error log plus classified fan-out.
pub struct ErrorAggregator {
    session_id: SmolStr,
    method: Method,
    entries: Mutex<Vec<ProxyError>>,
    registry: Arc<ListenerRegistry>,
}

impl ErrorAggregator {
    pub fn new(session_id: SmolStr, method: Method, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            session_id,
            method,
            entries: Mutex::new(Vec::new()),
            registry,
        }
    }

    /// Appends an error to the per-request log without notifying listeners.
    pub fn add(&self, error: ProxyError) {
        self.entries.lock().push(error);
    }

    /// Returns a snapshot of every error recorded for this request.
    pub fn errors(&self) -> Vec<ProxyError> {
        self.entries.lock().clone()
    }

    fn publish(&self, kind: ErrorKind, error: ProxyError) {
        debug!(
            session = %self.session_id,
            code = error.code(),
            ?kind,
            "proxy error aggregated"
        );
        self.add(error.clone());
        self.registry.notify(&ErrorEvent {
            kind,
            error,
            session_id: self.session_id.clone(),
            method: self.method.clone(),
        });
    }

    /// A branch failed below the SIP layer (DNS, connect, TLS, unreachable).
    pub fn on_proxy_failure(&self, error: ProxyError) {
        self.publish(ErrorKind::ProxyFailure, error);
    }

    /// Sending a response upstream failed.
    pub fn on_response_failure(&self, error: ProxyError) {
        self.publish(ErrorKind::ResponseSendFailure, error);
    }

    /// A branch reached its deadline with no final response.
    pub fn on_request_timeout(&self) {
        self.publish(ErrorKind::RequestTimeout, ProxyError::RequestTimedOut);
    }

    /// A branch answered with a final failure response.
    pub fn on_failure_response(&self, response: &Response) {
        self.publish(
            ErrorKind::FailureResponse,
            ProxyError::FailureResponse {
                response: response.clone(),
            },
        );
    }

    /// A routing script produced a failure.
    ///
    /// Only surfaced to listeners for automatically generated 404s; every
    /// other shape is logged but not published.
    pub fn on_routing_failure(&self, detail: &str, response: Option<&Response>, automatic: bool) {
        let error = ProxyError::RoutingScriptFailure {
            detail: SmolStr::new(detail),
        };
        let surfaced = automatic && response.map(|r| r.code() == 404).unwrap_or(false);
        if surfaced {
            self.publish(ErrorKind::RoutingFailure, error);
        } else {
            self.add(error);
        }
    }

    /// A server group was marked down.
    ///
    /// Only the down edge is surfaced; repeat reports while the group is
    /// already down are logged without notification.
    pub fn on_server_group_down(&self, group: &SmolStr, already_down: bool) {
        let error = ProxyError::ServerGroupDown {
            group: group.clone(),
        };
        if already_down {
            self.add(error);
        } else {
            self.publish(ErrorKind::ServerGroupDown, error);
        }
    }
}
