// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Instant;

use smol_str::SmolStr;
use tokio::sync::oneshot;

use sluice_msg::{Request, Response};

use crate::error::{Binding, ProxyError};
use crate::target::Target;

/// Identifier of one outbound attempt: the Via branch parameter it was sent
/// with.
pub type BranchId = SmolStr;

/// Lifecycle of one outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// Request handed to the transport, nothing heard yet.
    Pending,
    /// At least one 1xx received.
    Provisional,
    /// Final response received.
    Final,
    /// Deadline reached with no final response.
    TimedOut,
    /// Transport-level failure.
    Failed,
    /// CANCEL issued before any final response.
    Cancelled,
}

impl BranchState {
    /// Returns true once the branch can produce no further outcome.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BranchState::Final
                | BranchState::TimedOut
                | BranchState::Failed
                | BranchState::Cancelled
        )
    }
}

/// Everything a branch can report, as one closed event set delivered through
/// a single entry point.
#[derive(Debug, Clone)]
pub enum BranchEvent {
    /// 1xx.
    Provisional(Response),
    /// 2xx.
    Success(Response),
    /// 3xx.
    Redirect(Response),
    /// 4xx/5xx.
    Failure(Response),
    /// 6xx.
    GlobalFailure(Response),
    /// Branch deadline expired.
    TimedOut,
    /// Classified transport-level failure.
    TransportError(ProxyError),
    /// Network-layer unreachability signal, distinct from a SIP response.
    IcmpUnreachable { binding: Option<Binding> },
}

impl BranchEvent {
    /// Classifies a received response into its event variant.
    pub fn from_response(response: Response) -> Self {
        match response.code() {
            100..=199 => BranchEvent::Provisional(response),
            200..=299 => BranchEvent::Success(response),
            300..=399 => BranchEvent::Redirect(response),
            600..=699 => BranchEvent::GlobalFailure(response),
            _ => BranchEvent::Failure(response),
        }
    }
}

/// Runtime record for one outbound attempt.
pub(crate) struct Branch {
    pub id: BranchId,
    pub target: Target,
    pub state: BranchState,
    /// The prepared request copy this branch sent; CANCELs reuse its Via.
    pub request: Request,
    pub last_response: Option<Response>,
    pub error: Option<ProxyError>,
    /// 3xx recursion depth this branch was created at.
    pub depth: u8,
    pub created_at: Instant,
    timer: Option<oneshot::Sender<()>>,
}

impl Branch {
    pub fn new(id: BranchId, target: Target, request: Request, depth: u8) -> Self {
        Self {
            id,
            target,
            state: BranchState::Pending,
            request,
            last_response: None,
            error: None,
            depth,
            created_at: Instant::now(),
            timer: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Attaches the cancel handle for this branch's deadline timer.
    pub fn set_timer(&mut self, cancel: oneshot::Sender<()>) {
        self.timer = Some(cancel);
    }

    /// Stops the deadline timer if it is still armed.
    pub fn stop_timer(&mut self) {
        if let Some(cancel) = self.timer.take() {
            let _ = cancel.send(());
        }
    }
}
