// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Forking SIP proxy engine.
//!
//! One inbound request fans out to candidate next-hops; every branch is
//! tracked; exactly one final response goes back upstream. The engine owns
//! the forking policy (parallel, sequential, highest-priority), per-branch
//! failure classification, best-response selection, and the cancellation
//! cascade. Wire parsing, DNS resolution, and socket I/O stay behind the
//! collaborator traits below.
//!
//! # Architecture
//!
//! ```text
//! Incoming request → ControllerFactory → ProxyController
//!                                             ↓
//!                                      ProxyTransaction
//!                                       ↓    ↓    ↓
//!                                  [Branch][Branch][Branch]
//!                                       ↓    ↓    ↓
//!                           events → best-response selection
//!                                             ↓
//!                              one final response upstream
//! ```

pub mod aggregator;
pub mod branch;
pub mod config;
pub mod controller;
pub mod error;
pub mod factory;
pub mod response;
pub mod target;
pub mod transaction;

use async_trait::async_trait;

use sluice_msg::{Request, Response, SipUri};

pub use aggregator::{ErrorAggregator, ErrorEvent, ErrorKind, ErrorListener, ListenerRegistry};
pub use branch::{BranchEvent, BranchId, BranchState};
pub use config::{
    FailoverAction, ListenPoint, ProxyConfig, SearchMode, SharedConfig, StateMode,
};
pub use controller::ProxyController;
pub use error::{
    classify_connect_error, classify_resolve_error, classify_tls_text, classify_transport_fault,
    Binding, DnsCause, DnsQuery, ProxyError, ResolveError, ResolveFault, TcpCause, TlsCause,
    TransportFault,
};
pub use factory::ControllerFactory;
pub use response::ResponseBuilder;
pub use target::{Target, TransportKind};
pub use transaction::{ProxyTransaction, TxnState};

/// Sends prepared request copies toward a branch target.
///
/// Implementations own serialization, connection management, and pooling.
/// `send_request` may block briefly on connection acquisition but must bound
/// it; a synchronous failure is returned as a [`TransportFault`] carrying
/// enough context for classification.
#[async_trait]
pub trait OutboundTransport: Send + Sync + 'static {
    async fn send_request(
        &self,
        branch: &BranchId,
        target: &Target,
        request: Request,
    ) -> Result<(), TransportFault>;

    /// Best-effort CANCEL for a branch still awaiting a final response.
    async fn send_cancel(
        &self,
        branch: &BranchId,
        target: &Target,
        cancel: Request,
    ) -> Result<(), TransportFault>;
}

/// Supplies ordered candidate targets for a URI.
///
/// The engine never computes DNS or load-balancing order itself; it consumes
/// the list this collaborator returns (here, only for redirect recursion).
#[async_trait]
pub trait TargetResolver: Send + Sync + 'static {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<Target>, ResolveError>;
}

/// The inbound (server-side) transaction leg: where provisional and final
/// responses are sent back toward the original requester.
#[async_trait]
pub trait UpstreamSink: Send + Sync + 'static {
    async fn send_response(&self, response: Response) -> anyhow::Result<()>;
}
