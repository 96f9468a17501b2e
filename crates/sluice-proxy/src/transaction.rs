// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-inbound-transaction state: the branch set, best-response selection,
//! and the at-most-once upstream response invariant.
//!
//! Branch events arrive concurrently from transport callbacks and timer
//! tasks; every decision that touches shared state happens behind one mutex.
//! Listener fan-out and upstream sends are performed by the caller after the
//! lock is released, so no foreign code ever runs under it.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info};

use sluice_msg::{Request, Response};

use crate::aggregator::ErrorAggregator;
use crate::branch::{Branch, BranchEvent, BranchId, BranchState};
use crate::error::ProxyError;
use crate::response::ResponseBuilder;
use crate::target::Target;

/// Lifecycle of the inbound transaction as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Created,
    Proxying,
    Responded,
    Cancelled,
    TimedOut,
    Terminated,
}

/// A CANCEL the caller must dispatch, built from the branch's own request
/// copy so the Via branch parameter matches the original INVITE.
pub(crate) struct CancelTask {
    pub branch: BranchId,
    pub target: Target,
    pub invite: Request,
}

/// Terminal branch outcome, handed to the controller for failover policy.
pub(crate) struct Settled {
    pub branch: BranchId,
    pub depth: u8,
    pub kind: SettledKind,
}

pub(crate) enum SettledKind {
    /// 2xx; the transaction has responded (or discarded a late duplicate).
    Success,
    /// Final SIP response other than 2xx.
    Final(Response),
    /// No SIP response: timeout or classified transport failure.
    Error(ProxyError),
}

/// What the caller must do after one branch event was absorbed.
pub(crate) struct HandleResult {
    /// Response to forward upstream now, if any.
    pub forward: Option<Response>,
    /// CANCELs to dispatch (best-effort, off the caller's critical path).
    pub cancels: Vec<CancelTask>,
    /// Present when the branch reached a terminal state on this event.
    pub settled: Option<Settled>,
    /// True when every registered branch is terminal.
    pub all_terminal: bool,
}

impl HandleResult {
    fn ignored(all_terminal: bool) -> Self {
        Self {
            forward: None,
            cancels: Vec::new(),
            settled: None,
            all_terminal,
        }
    }
}

struct BestResponse {
    response: Response,
    branch: BranchId,
}

struct Inner {
    state: TxnState,
    request: Request,
    branches: HashMap<BranchId, Branch>,
    best: Option<BestResponse>,
    responded: bool,
    /// Provisional status codes already forwarded upstream.
    forwarded_provisionals: HashSet<u16>,
}

impl Inner {
    fn all_terminal(&self) -> bool {
        self.branches.values().all(Branch::is_terminal)
    }

    /// Cancels every branch still awaiting a final response. Terminal
    /// branches are left untouched.
    fn collect_pending_cancels(&mut self) -> Vec<CancelTask> {
        let mut cancels = Vec::new();
        for branch in self.branches.values_mut() {
            if !branch.is_terminal() {
                branch.stop_timer();
                branch.state = BranchState::Cancelled;
                cancels.push(CancelTask {
                    branch: branch.id.clone(),
                    target: branch.target.clone(),
                    invite: branch.request.clone(),
                });
            }
        }
        cancels
    }

    /// Records `response` as best if it beats the current candidate:
    /// 6xx outranks other classes, then numerically lowest code; ties keep
    /// the first arrival.
    fn consider_best(&mut self, response: Response, branch: BranchId) {
        let replace = match &self.best {
            None => true,
            Some(current) => {
                let cur = &current.response;
                match (response.is_global_failure(), cur.is_global_failure()) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => response.code() < cur.code(),
                }
            }
        };
        if replace {
            self.best = Some(BestResponse { response, branch });
        }
    }
}

/// Aggregates every branch for one inbound request and decides the single
/// response sent upstream.
pub struct ProxyTransaction {
    aggregator: std::sync::Arc<ErrorAggregator>,
    auto_cancel: bool,
    retry_after_ms: u64,
    inner: Mutex<Inner>,
}

impl ProxyTransaction {
    pub(crate) fn new(
        request: Request,
        aggregator: std::sync::Arc<ErrorAggregator>,
        auto_cancel: bool,
        retry_after_ms: u64,
    ) -> Self {
        Self {
            aggregator,
            auto_cancel,
            retry_after_ms,
            inner: Mutex::new(Inner {
                state: TxnState::Created,
                request,
                branches: HashMap::new(),
                best: None,
                responded: false,
                forwarded_provisionals: HashSet::new(),
            }),
        }
    }

    /// Returns the current transaction state.
    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Returns true once a final response has been sent upstream.
    pub fn responded(&self) -> bool {
        self.inner.lock().responded
    }

    /// Returns a copy of the request this transaction is proxying.
    pub fn request(&self) -> Request {
        self.inner.lock().request.clone()
    }

    pub(crate) fn set_request(&self, request: Request) {
        self.inner.lock().request = request;
    }

    pub(crate) fn register_branch(&self, branch: Branch) {
        let mut inner = self.inner.lock();
        inner.state = TxnState::Proxying;
        inner.branches.insert(branch.id.clone(), branch);
    }

    pub(crate) fn attach_timer(&self, id: &BranchId, cancel: oneshot::Sender<()>) {
        let mut inner = self.inner.lock();
        if let Some(branch) = inner.branches.get_mut(id) {
            if branch.is_terminal() {
                // Timer raced a terminal event; disarm it immediately.
                let _ = cancel.send(());
            } else {
                branch.set_timer(cancel);
            }
        }
    }

    pub(crate) fn branch_depth(&self, id: &BranchId) -> Option<u8> {
        self.inner.lock().branches.get(id).map(|b| b.depth)
    }

    pub(crate) fn all_terminal(&self) -> bool {
        self.inner.lock().all_terminal()
    }

    pub(crate) fn branch_count(&self) -> usize {
        self.inner.lock().branches.len()
    }

    /// The target that produced the winning 2xx, for ACK forwarding.
    pub(crate) fn ack_target(&self) -> Option<Target> {
        let inner = self.inner.lock();
        let best = inner.best.as_ref()?;
        if !best.response.is_success() {
            return None;
        }
        inner.branches.get(&best.branch).map(|b| b.target.clone())
    }

    /// Marks a redirecting branch terminal without feeding best-response
    /// selection; the controller is expanding its Contact set instead.
    pub(crate) fn absorb_redirect(&self, id: &BranchId, response: &Response) {
        let mut inner = self.inner.lock();
        if let Some(branch) = inner.branches.get_mut(id) {
            if !branch.is_terminal() {
                branch.stop_timer();
                branch.state = BranchState::Final;
                branch.last_response = Some(response.clone());
            }
        }
    }

    /// Absorbs one branch event. This is the only mutation path for branch
    /// and best-response state, and it is safe to call from any task.
    pub(crate) fn handle(&self, id: &BranchId, event: BranchEvent) -> HandleResult {
        let mut aggregate: Option<AggregateAfter> = None;
        let result = {
            let mut inner = self.inner.lock();

            let Some(branch) = inner.branches.get_mut(id) else {
                debug!(branch = %id, "event for unknown branch ignored");
                return HandleResult::ignored(inner.all_terminal());
            };
            if branch.is_terminal() {
                // Duplicate final, late response on a cancelled branch, or a
                // CANCEL racing the outcome. All safe to drop.
                debug!(branch = %id, state = ?branch.state, "event on terminal branch ignored");
                let all_terminal = inner.all_terminal();
                return HandleResult::ignored(all_terminal);
            }

            match event {
                BranchEvent::Provisional(response) => {
                    branch.state = BranchState::Provisional;
                    branch.last_response = Some(response.clone());
                    // 100 Trying is hop-by-hop; other 1xx go upstream once
                    // per status code.
                    let code = response.code();
                    let forward = !inner.responded
                        && code != 100
                        && inner.forwarded_provisionals.insert(code);
                    HandleResult {
                        forward: forward.then_some(response),
                        cancels: Vec::new(),
                        settled: None,
                        all_terminal: false,
                    }
                }
                BranchEvent::Success(response) => {
                    branch.stop_timer();
                    branch.state = BranchState::Final;
                    branch.last_response = Some(response.clone());
                    let depth = branch.depth;
                    let settled = Some(Settled {
                        branch: id.clone(),
                        depth,
                        kind: SettledKind::Success,
                    });

                    if inner.responded {
                        // Late 2xx after we already answered; discard.
                        let all_terminal = inner.all_terminal();
                        HandleResult {
                            forward: None,
                            cancels: Vec::new(),
                            settled,
                            all_terminal,
                        }
                    } else {
                        info!(branch = %id, code = response.code(), "2xx won the fork");
                        inner.responded = true;
                        inner.state = TxnState::Responded;
                        inner.best = Some(BestResponse {
                            response: response.clone(),
                            branch: id.clone(),
                        });
                        let cancels = if self.auto_cancel {
                            inner.collect_pending_cancels()
                        } else {
                            Vec::new()
                        };
                        let all_terminal = inner.all_terminal();
                        HandleResult {
                            forward: Some(response),
                            cancels,
                            settled,
                            all_terminal,
                        }
                    }
                }
                BranchEvent::Redirect(response) | BranchEvent::Failure(response) => {
                    branch.stop_timer();
                    branch.state = BranchState::Final;
                    branch.last_response = Some(response.clone());
                    let depth = branch.depth;
                    if response.code() >= 400 {
                        aggregate = Some(AggregateAfter::FailureResponse(response.clone()));
                    }
                    if !inner.responded {
                        inner.consider_best(response.clone(), id.clone());
                    }
                    let all_terminal = inner.all_terminal();
                    HandleResult {
                        forward: None,
                        cancels: Vec::new(),
                        settled: Some(Settled {
                            branch: id.clone(),
                            depth,
                            kind: SettledKind::Final(response),
                        }),
                        all_terminal,
                    }
                }
                BranchEvent::GlobalFailure(response) => {
                    branch.stop_timer();
                    branch.state = BranchState::Final;
                    branch.last_response = Some(response.clone());
                    let depth = branch.depth;
                    aggregate = Some(AggregateAfter::FailureResponse(response.clone()));
                    let mut cancels = Vec::new();
                    if !inner.responded {
                        inner.consider_best(response.clone(), id.clone());
                        // A 6xx is a definitive answer: stop the remaining
                        // branches, then respond once they quiesce.
                        if self.auto_cancel {
                            cancels = inner.collect_pending_cancels();
                        }
                    }
                    let all_terminal = inner.all_terminal();
                    HandleResult {
                        forward: None,
                        cancels,
                        settled: Some(Settled {
                            branch: id.clone(),
                            depth,
                            kind: SettledKind::Final(response),
                        }),
                        all_terminal,
                    }
                }
                BranchEvent::TimedOut => {
                    branch.stop_timer();
                    branch.state = BranchState::TimedOut;
                    branch.error = Some(ProxyError::RequestTimedOut);
                    let depth = branch.depth;
                    aggregate = Some(AggregateAfter::Timeout);
                    let all_terminal = inner.all_terminal();
                    HandleResult {
                        forward: None,
                        cancels: Vec::new(),
                        settled: Some(Settled {
                            branch: id.clone(),
                            depth,
                            kind: SettledKind::Error(ProxyError::RequestTimedOut),
                        }),
                        all_terminal,
                    }
                }
                BranchEvent::TransportError(error) => {
                    branch.stop_timer();
                    branch.state = BranchState::Failed;
                    branch.error = Some(error.clone());
                    let depth = branch.depth;
                    aggregate = Some(AggregateAfter::ProxyFailure(error.clone()));
                    let all_terminal = inner.all_terminal();
                    HandleResult {
                        forward: None,
                        cancels: Vec::new(),
                        settled: Some(Settled {
                            branch: id.clone(),
                            depth,
                            kind: SettledKind::Error(error),
                        }),
                        all_terminal,
                    }
                }
                BranchEvent::IcmpUnreachable { binding } => {
                    // Transport failure for failover purposes; never turned
                    // into an upstream response on its own.
                    branch.stop_timer();
                    branch.state = BranchState::Failed;
                    let error = ProxyError::ClientUnreachable { binding };
                    branch.error = Some(error.clone());
                    let depth = branch.depth;
                    aggregate = Some(AggregateAfter::ProxyFailure(error.clone()));
                    let all_terminal = inner.all_terminal();
                    HandleResult {
                        forward: None,
                        cancels: Vec::new(),
                        settled: Some(Settled {
                            branch: id.clone(),
                            depth,
                            kind: SettledKind::Error(error),
                        }),
                        all_terminal,
                    }
                }
            }
        };

        // Listener fan-out happens outside the lock: listeners are foreign
        // code and must not run under the transaction mutex.
        match aggregate {
            Some(AggregateAfter::FailureResponse(response)) => {
                self.aggregator.on_failure_response(&response)
            }
            Some(AggregateAfter::Timeout) => self.aggregator.on_request_timeout(),
            Some(AggregateAfter::ProxyFailure(error)) => self.aggregator.on_proxy_failure(error),
            None => {}
        }

        result
    }

    /// Cancels every non-terminal branch (inbound CANCEL or teardown).
    /// Idempotent: terminal branches are untouched and a second cascade
    /// returns nothing.
    pub(crate) fn cancel_pending(&self) -> Vec<CancelTask> {
        let mut inner = self.inner.lock();
        inner.collect_pending_cancels()
    }

    /// Selects the final response once the fork has quiesced. Returns the
    /// response to forward upstream, or None if one was already sent.
    pub(crate) fn finish(&self) -> Option<Response> {
        let mut inner = self.inner.lock();
        if inner.responded {
            return None;
        }
        inner.responded = true;

        if let Some(best) = &inner.best {
            let response = best.response.clone();
            info!(code = response.code(), "forwarding best response");
            inner.state = TxnState::Responded;
            return Some(response);
        }

        // No branch produced any SIP response at all.
        let timed_out = inner
            .branches
            .values()
            .any(|b| b.state == BranchState::TimedOut);
        let response = if timed_out {
            inner.state = TxnState::TimedOut;
            ResponseBuilder::request_timeout(&inner.request)
        } else if inner.branches.is_empty() {
            // Nothing was ever attempted (no viable candidates).
            inner.state = TxnState::Responded;
            ResponseBuilder::not_found(&inner.request)
        } else {
            inner.state = TxnState::Responded;
            ResponseBuilder::server_error(&inner.request, self.retry_after_ms)
        };
        info!(code = response.code(), "synthesizing final response");
        Some(response)
    }

    /// Answers 487 after an inbound CANCEL, unless a final response already
    /// went out.
    pub(crate) fn finish_cancelled(&self) -> Option<Response> {
        let mut inner = self.inner.lock();
        if inner.responded {
            return None;
        }
        inner.responded = true;
        inner.state = TxnState::Cancelled;
        Some(ResponseBuilder::request_terminated(&inner.request))
    }

    /// Final teardown: stop any armed timers and mark the transaction dead.
    pub(crate) fn terminate(&self) {
        let mut inner = self.inner.lock();
        for branch in inner.branches.values_mut() {
            branch.stop_timer();
        }
        inner.state = TxnState::Terminated;
    }

}

enum AggregateAfter {
    FailureResponse(Response),
    Timeout,
    ProxyFailure(ProxyError),
}
