// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Forking policy and per-request orchestration.
//!
//! The controller owns the search plan (parallel, sequential, or
//! highest-priority tiers), redirect recursion, stateless-to-stateful
//! promotion, and the conversion of synchronous collaborator failures into
//! aggregated errors. Branch events — from transport callbacks and from the
//! controller's own timer tasks — all funnel through [`ProxyController::on_branch_event`].
//!
//! Lock order: the search-plan mutex is always taken before any transaction
//! lock, and transaction code never takes the plan lock.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use sluice_msg::{
    decrement_max_forwards, generate_branch_id, parse_contacts, top_via, Contact, Method, Request,
    RequestLine, Response,
};
use sluice_observe::engine_metrics;

use crate::aggregator::ErrorAggregator;
use crate::branch::{Branch, BranchEvent, BranchId};
use crate::config::{FailoverAction, ProxyConfig, SearchMode, StateMode};
use crate::error::{classify_resolve_error, classify_transport_fault, ProxyError};
use crate::response::ResponseBuilder;
use crate::target::{q_tiers, sort_by_preference, Target, TransportKind};
use crate::transaction::{CancelTask, ProxyTransaction, Settled, SettledKind};
use crate::{OutboundTransport, TargetResolver, UpstreamSink};

enum ControllerCommand {
    BranchTimedOut(BranchId),
    SequentialTimeout(BranchId),
}

/// Candidate groups still waiting to be started, per the search mode.
/// Sequential mode queues one-target groups; highest-priority queues q-tiers.
struct SearchPlan {
    queue: VecDeque<Vec<Target>>,
    /// Branches whose give-up signal already advanced the search, so a
    /// sequential timeout and a later terminal failure advance only once.
    advanced: HashSet<BranchId>,
    /// Per-call branch deadline override from `proxy_to`.
    time_to_try: Option<Duration>,
    stopped: bool,
}

impl SearchPlan {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            advanced: HashSet::new(),
            time_to_try: None,
            stopped: false,
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.queue.clear();
    }
}

struct ControllerInner {
    config: Arc<ProxyConfig>,
    transport: Arc<dyn OutboundTransport>,
    resolver: Arc<dyn TargetResolver>,
    upstream: Arc<dyn UpstreamSink>,
    aggregator: Arc<ErrorAggregator>,
    request_timeout: Duration,
    sequential_timeout: Duration,
    txn: Mutex<Option<Arc<ProxyTransaction>>>,
    plan: Mutex<SearchPlan>,
    cmd_tx: mpsc::Sender<ControllerCommand>,
    weak: Weak<ControllerInner>,
}

/// Orchestrates the fork for one inbound request.
#[derive(Clone)]
pub struct ProxyController {
    inner: Arc<ControllerInner>,
}

impl ProxyController {
    /// Creates a controller with the supplied per-request snapshot and
    /// collaborators. Timeouts come precomputed from the factory.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ProxyConfig>,
        transport: Arc<dyn OutboundTransport>,
        resolver: Arc<dyn TargetResolver>,
        upstream: Arc<dyn UpstreamSink>,
        aggregator: Arc<ErrorAggregator>,
        request_timeout: Duration,
        sequential_timeout: Duration,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(64);

        let inner = Arc::new_cyclic(|weak| ControllerInner {
            config,
            transport,
            resolver,
            upstream,
            aggregator,
            request_timeout,
            sequential_timeout,
            txn: Mutex::new(None),
            plan: Mutex::new(SearchPlan::new()),
            cmd_tx,
            weak: weak.clone(),
        });

        let driver = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let Some(inner) = driver.upgrade() else { break };
                match cmd {
                    ControllerCommand::BranchTimedOut(id) => {
                        inner.on_branch_event(&id, BranchEvent::TimedOut).await;
                    }
                    ControllerCommand::SequentialTimeout(id) => {
                        inner.on_sequential_timeout(&id).await;
                    }
                }
            }
        });

        Self { inner }
    }

    /// Returns the per-request configuration snapshot.
    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Returns the error aggregator for this request.
    pub fn aggregator(&self) -> &Arc<ErrorAggregator> {
        &self.inner.aggregator
    }

    /// Returns the transaction handle, if state has been created.
    pub fn transaction(&self) -> Option<Arc<ProxyTransaction>> {
        self.inner.transaction()
    }

    /// Registers the inbound request. Idempotent: a second call returns the
    /// existing handle.
    ///
    /// Stateful mode creates the transaction eagerly (and answers an INVITE
    /// with 100 Trying right away); failover-stateful defers creation to the
    /// first `proxy_to`; stateless creates nothing until promoted.
    pub async fn on_new_request(&self, request: &Request) -> Option<Arc<ProxyTransaction>> {
        if let Some(existing) = self.inner.transaction() {
            return Some(existing);
        }
        if request.method().is_hop_by_hop() {
            return None;
        }
        match self.inner.config.state_mode {
            StateMode::Stateless | StateMode::FailoverStateful => None,
            StateMode::Stateful => {
                let (txn, created) = self.inner.create_transaction(request.clone());
                if created && request.method().is_invite() {
                    self.inner
                        .forward_upstream(ResponseBuilder::trying(request))
                        .await;
                }
                Some(txn)
            }
        }
    }

    /// Forks the request to the given candidates per the configured search
    /// mode. `time_to_try` overrides the per-branch deadline for this call.
    ///
    /// Synchronous transport failures never surface to the caller: they are
    /// classified, aggregated, and fed back in as branch events.
    pub async fn proxy_to(
        &self,
        targets: Vec<Target>,
        request: Request,
        time_to_try: Option<Duration>,
    ) {
        let Some(txn) = self.inner.ensure_transaction(&request) else {
            self.inner.forward_stateless(targets, request).await;
            return;
        };
        txn.set_request(request);

        {
            let mut plan = self.inner.plan.lock();
            plan.time_to_try = time_to_try;
            match self.inner.config.search_mode {
                SearchMode::Parallel => {
                    self.inner.start_group(&txn, targets, 0, &plan);
                }
                SearchMode::Sequential => {
                    let mut ordered = targets;
                    sort_by_preference(&mut ordered);
                    let mut groups: VecDeque<Vec<Target>> =
                        ordered.into_iter().map(|t| vec![t]).collect();
                    if let Some(first) = groups.pop_front() {
                        self.inner.start_group(&txn, first, 0, &plan);
                    }
                    plan.queue = groups;
                }
                SearchMode::HighestPriority => {
                    let mut tiers: VecDeque<Vec<Target>> = q_tiers(targets).into();
                    if let Some(top) = tiers.pop_front() {
                        self.inner.start_group(&txn, top, 0, &plan);
                    }
                    plan.queue = tiers;
                }
            }
        }

        self.inner.maybe_finish(&txn).await;
    }

    /// Delivers one branch event. Safe to call from any task, concurrently.
    pub async fn on_branch_event(&self, id: &BranchId, event: BranchEvent) {
        self.inner.on_branch_event(id, event).await;
    }

    /// Cascades an inbound CANCEL: every non-terminal branch is cancelled
    /// and the inbound leg is answered 487 (unless already responded).
    pub async fn on_cancel(&self) {
        let Some(txn) = self.inner.transaction() else {
            debug!("CANCEL with no transaction state; nothing to do");
            return;
        };
        let cancels = txn.cancel_pending();
        self.inner.dispatch_cancels(cancels);
        self.inner.plan.lock().stop();
        if let Some(response) = txn.finish_cancelled() {
            self.inner.forward_upstream(response).await;
        }
        txn.terminate();
        engine_metrics().on_transaction_completed("cancelled");
    }

    /// Routes an ACK: after a winning 2xx it follows the winning branch;
    /// for non-2xx outcomes the inbound transaction layer absorbs it.
    pub async fn on_ack(&self, ack: Request) {
        let Some(txn) = self.inner.transaction() else {
            debug!("ACK with no transaction state absorbed");
            return;
        };
        match txn.ack_target() {
            Some(target) => match self.inner.prepare_forward(&ack, &target) {
                Ok((branch_id, prepared)) => {
                    debug!(branch = %branch_id, "forwarding ACK to winning branch");
                    self.inner.spawn_send(branch_id, target, prepared);
                }
                Err(_) => warn!("ACK dropped: Max-Forwards exhausted"),
            },
            None => debug!("ACK for non-2xx final absorbed"),
        }
    }

    /// Promotes a stateless transaction to stateful so a final response can
    /// still be sent, stripping this proxy's own top Via if present.
    ///
    /// Returns whether the transaction is stateful afterwards.
    pub fn overwrite_stateless_mode(&self, request: &Request) -> bool {
        if self.inner.transaction().is_some() {
            return true;
        }

        let mut request = request.clone();
        if let Some(via) = top_via(&request).cloned() {
            if let Some((host, port, transport)) = parse_sent_by(&via) {
                if self.inner.config.recognize(&host, port, transport) {
                    debug!("stripping own Via before stateful promotion");
                    request.headers.remove_first("Via");
                }
            }
        }
        if request.headers.get("Via").is_none() {
            warn!("cannot promote to stateful: no Via left to respond along");
            return false;
        }

        self.inner.create_transaction(request);
        true
    }
}

impl ControllerInner {
    fn strong(&self) -> Arc<ControllerInner> {
        self.weak.upgrade().expect("controller inner alive")
    }

    fn transaction(&self) -> Option<Arc<ProxyTransaction>> {
        self.txn.lock().clone()
    }

    /// Get-or-create under the lock; the bool reports whether this call
    /// created the transaction.
    fn create_transaction(&self, request: Request) -> (Arc<ProxyTransaction>, bool) {
        let mut guard = self.txn.lock();
        if let Some(existing) = guard.as_ref() {
            return (existing.clone(), false);
        }
        let txn = Arc::new(ProxyTransaction::new(
            request,
            self.aggregator.clone(),
            self.config.cancel_branches_automatically,
            self.config.default_retry_after_ms,
        ));
        *guard = Some(txn.clone());
        (txn, true)
    }

    /// Returns the transaction, creating it lazily unless the request is
    /// being proxied statelessly.
    fn ensure_transaction(&self, request: &Request) -> Option<Arc<ProxyTransaction>> {
        if let Some(existing) = self.transaction() {
            return Some(existing);
        }
        match self.config.state_mode {
            StateMode::Stateless => None,
            StateMode::Stateful | StateMode::FailoverStateful => {
                Some(self.create_transaction(request.clone()).0)
            }
        }
    }

    async fn on_branch_event(&self, id: &BranchId, event: BranchEvent) {
        let Some(txn) = self.transaction() else {
            debug!(branch = %id, "branch event without transaction state ignored");
            return;
        };

        // Redirect recursion happens before the transaction sees the 3xx, so
        // a consumed redirect never competes in best-response selection.
        if let BranchEvent::Redirect(response) = &event {
            if self.config.is_recursing {
                if let Some(depth) = txn.branch_depth(id) {
                    if depth >= self.config.max_recursion_depth {
                        warn!(
                            branch = %id,
                            depth,
                            "redirect recursion bound reached; treating 3xx as final"
                        );
                    } else {
                        let contacts = parse_contacts(&response.headers);
                        if !contacts.is_empty() {
                            txn.absorb_redirect(id, response);
                            self.recurse_contacts(&txn, id, contacts, depth + 1).await;
                            self.maybe_finish(&txn).await;
                            return;
                        }
                    }
                }
            }
        }

        let result = txn.handle(id, event);
        self.dispatch_cancels(result.cancels);
        if let Some(response) = result.forward {
            self.forward_upstream(response).await;
        }
        if let Some(settled) = result.settled {
            self.apply_failover(&txn, settled);
        }
        self.maybe_finish(&txn).await;
    }

    /// Sequential pacing: the current candidate used up its slice without a
    /// terminal outcome, so the next one starts. The slow branch keeps
    /// running and may still win.
    async fn on_sequential_timeout(&self, id: &BranchId) {
        let Some(txn) = self.transaction() else { return };
        {
            let mut plan = self.plan.lock();
            if plan.stopped || !plan.advanced.insert(id.clone()) {
                return;
            }
            if let Some(group) = plan.queue.pop_front() {
                debug!(branch = %id, "sequential search timeout; starting next candidate");
                self.start_group(&txn, group, 0, &plan);
            }
        }
        self.maybe_finish(&txn).await;
    }

    fn apply_failover(&self, txn: &Arc<ProxyTransaction>, settled: Settled) {
        let (outcome, failover) = match &settled.kind {
            SettledKind::Success => ("success", false),
            SettledKind::Final(response) => {
                ("failure", self.config.is_failover_code(response.code()))
            }
            SettledKind::Error(_) => ("error", true),
        };
        engine_metrics().on_branch_settled(outcome);
        debug!(branch = %settled.branch, depth = settled.depth, outcome, "branch settled");

        let mut plan = self.plan.lock();
        if plan.stopped {
            return;
        }
        if !failover || self.config.failover_action == FailoverAction::Stop {
            // A definitive answer (2xx, or a final code outside the failover
            // set) ends the search; remaining candidates are dropped.
            plan.stop();
            return;
        }
        match self.config.search_mode {
            SearchMode::Parallel => {}
            SearchMode::Sequential => {
                if plan.advanced.insert(settled.branch.clone()) {
                    if let Some(group) = plan.queue.pop_front() {
                        self.start_group(txn, group, 0, &plan);
                    }
                }
            }
            SearchMode::HighestPriority => {
                // Recurse to the next tier only once the current one is done.
                if txn.all_terminal() {
                    if let Some(group) = plan.queue.pop_front() {
                        info!("q-tier exhausted; recursing to next priority tier");
                        self.start_group(txn, group, 0, &plan);
                    }
                }
            }
        }
    }

    /// Expands a redirect's Contact set into fresh targets via the resolver
    /// and schedules them at the redirecting branch's position.
    async fn recurse_contacts(
        &self,
        txn: &Arc<ProxyTransaction>,
        redirected: &BranchId,
        contacts: Vec<Contact>,
        depth: u8,
    ) {
        let mut targets = Vec::new();
        for contact in contacts {
            match self.resolver.resolve(&contact.uri).await {
                Ok(resolved) => {
                    for mut target in resolved {
                        if let Some(q) = contact.q {
                            target.q_value = q;
                        }
                        targets.push(target);
                    }
                }
                Err(err) => {
                    self.aggregator
                        .on_proxy_failure(classify_resolve_error(&err));
                }
            }
        }
        if targets.is_empty() {
            debug!(branch = %redirected, "redirect contacts yielded no targets");
            return;
        }
        info!(count = targets.len(), depth, "recursing on redirect contacts");

        let mut plan = self.plan.lock();
        if plan.stopped {
            return;
        }
        match self.config.search_mode {
            SearchMode::Parallel => {
                self.start_group(txn, targets, depth, &plan);
            }
            SearchMode::Sequential => {
                sort_by_preference(&mut targets);
                for target in targets.into_iter().rev() {
                    plan.queue.push_front(vec![target]);
                }
                // The redirecting branch is terminal; its slot moves on.
                if plan.advanced.insert(redirected.clone()) {
                    if let Some(group) = plan.queue.pop_front() {
                        self.start_group(txn, group, depth, &plan);
                    }
                }
            }
            SearchMode::HighestPriority => {
                for tier in q_tiers(targets).into_iter().rev() {
                    plan.queue.push_front(tier);
                }
                if txn.all_terminal() {
                    if let Some(group) = plan.queue.pop_front() {
                        self.start_group(txn, group, depth, &plan);
                    }
                }
            }
        }
    }

    /// Starts every target in the group: register the branch, arm its
    /// deadline (and sequential pacing) timers, and hand the prepared copy
    /// to the transport off this task.
    ///
    /// Runs under the plan lock so a racing settle cannot observe a
    /// quiescent branch set mid-start. Must not await.
    fn start_group(
        &self,
        txn: &Arc<ProxyTransaction>,
        targets: Vec<Target>,
        depth: u8,
        plan: &SearchPlan,
    ) {
        let base = txn.request();
        for target in targets {
            match self.prepare_forward(&base, &target) {
                Ok((branch_id, prepared)) => {
                    txn.register_branch(Branch::new(
                        branch_id.clone(),
                        target.clone(),
                        prepared.clone(),
                        depth,
                    ));
                    engine_metrics().on_branch_started(target.transport.as_str());
                    debug!(branch = %branch_id, target = %target.uri, "branch started");

                    self.arm_branch_timer(txn, &branch_id, plan.time_to_try);
                    if self.config.search_mode == SearchMode::Sequential {
                        self.arm_sequential_timer(&branch_id);
                    }
                    self.spawn_send(branch_id, target, prepared);
                }
                Err(response) => {
                    // Max-Forwards exhausted: the attempt becomes a branch
                    // that failed with 483, competing in best selection.
                    let branch_id = generate_branch_id();
                    txn.register_branch(Branch::new(
                        branch_id.clone(),
                        target,
                        base.clone(),
                        depth,
                    ));
                    let me = self.strong();
                    tokio::spawn(async move {
                        me.on_branch_event(&branch_id, BranchEvent::Failure(response))
                            .await;
                    });
                }
            }
        }
    }

    fn arm_branch_timer(
        &self,
        txn: &Arc<ProxyTransaction>,
        branch_id: &BranchId,
        time_to_try: Option<Duration>,
    ) {
        let timeout = time_to_try.unwrap_or(self.request_timeout);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        txn.attach_timer(branch_id, cancel_tx);

        let cmd_tx = self.cmd_tx.clone();
        let id = branch_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = cmd_tx.send(ControllerCommand::BranchTimedOut(id)).await;
                }
                _ = cancel_rx => {}
            }
        });
    }

    fn arm_sequential_timer(&self, branch_id: &BranchId) {
        let cmd_tx = self.cmd_tx.clone();
        let id = branch_id.clone();
        let timeout = self.sequential_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = cmd_tx.send(ControllerCommand::SequentialTimeout(id)).await;
        });
    }

    /// Hands the prepared request to the transport without blocking the
    /// caller. A synchronous failure comes back as a classified branch event.
    fn spawn_send(&self, branch_id: BranchId, target: Target, prepared: Request) {
        let me = self.strong();
        tokio::spawn(async move {
            if let Err(fault) = me
                .transport
                .send_request(&branch_id, &target, prepared)
                .await
            {
                let error = classify_transport_fault(&fault);
                warn!(branch = %branch_id, code = error.code(), "transport send failed");
                me.on_branch_event(&branch_id, BranchEvent::TransportError(error))
                    .await;
            }
        });
    }

    /// Stateless pass-through: forward to the single best candidate with no
    /// retained state. Failures are aggregated and otherwise dropped.
    async fn forward_stateless(&self, mut targets: Vec<Target>, request: Request) {
        sort_by_preference(&mut targets);
        let Some(target) = targets.into_iter().next() else {
            warn!("stateless forward with no candidates dropped");
            return;
        };
        match self.prepare_forward(&request, &target) {
            Ok((branch_id, prepared)) => {
                debug!(branch = %branch_id, target = %target.uri, "stateless forward");
                let me = self.strong();
                tokio::spawn(async move {
                    if let Err(fault) = me
                        .transport
                        .send_request(&branch_id, &target, prepared)
                        .await
                    {
                        me.aggregator
                            .on_proxy_failure(classify_transport_fault(&fault));
                    }
                });
            }
            Err(_) => {
                self.aggregator.on_proxy_failure(ProxyError::Unidentified {
                    detail: SmolStr::new("Max-Forwards exhausted on stateless forward"),
                });
            }
        }
    }

    /// Clones the request for one branch: retarget the Request-URI, spend a
    /// Max-Forwards hop, stack this proxy's Via, optionally Record-Route.
    fn prepare_forward(
        &self,
        base: &Request,
        target: &Target,
    ) -> Result<(BranchId, Request), Response> {
        let mut forwarded = base.clone();
        forwarded.start.uri = target.uri.clone();

        if decrement_max_forwards(&mut forwarded.headers).is_err() {
            return Err(ResponseBuilder::response(base, 483));
        }

        let branch = generate_branch_id();
        let via = &self.config.via_address;
        forwarded.headers.push_front(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};branch={};rport",
                target.transport.as_str(),
                via.host,
                via.port,
                branch
            ),
        );

        if let Some(rr_uri) = &self.config.record_route_uri {
            forwarded
                .headers
                .push("Record-Route", format!("<{}>", rr_uri));
        }

        Ok((branch, forwarded))
    }

    fn dispatch_cancels(&self, cancels: Vec<CancelTask>) {
        for task in cancels {
            let cancel = build_cancel(&task.invite);
            let me = self.strong();
            tokio::spawn(async move {
                if let Err(fault) = me
                    .transport
                    .send_cancel(&task.branch, &task.target, cancel)
                    .await
                {
                    // Best-effort by contract; the branch is already marked
                    // cancelled either way.
                    debug!(branch = %task.branch, %fault, "CANCEL send failed");
                }
            });
        }
    }

    async fn forward_upstream(&self, response: Response) {
        let code = response.code();
        if let Err(err) = self.upstream.send_response(response).await {
            self.aggregator
                .on_response_failure(ProxyError::ResponseSendFailure {
                    detail: SmolStr::new(err.to_string()),
                });
            return;
        }
        engine_metrics().on_response_forwarded(code);
    }

    /// Sends the chosen (or synthesized) final response once the search has
    /// no further moves: no queued candidates, and every branch terminal.
    async fn maybe_finish(&self, txn: &Arc<ProxyTransaction>) {
        let quiescent = {
            let plan = self.plan.lock();
            (plan.stopped || plan.queue.is_empty()) && txn.all_terminal()
        };
        if !quiescent {
            return;
        }
        if let Some(response) = txn.finish() {
            self.forward_upstream(response).await;
            txn.terminate();
            engine_metrics().on_transaction_completed("responded");
        }
    }
}

/// Builds a CANCEL from the branch's forwarded INVITE copy: same Via stack
/// (the branch parameter must match), same CSeq number with the method
/// rewritten, no body.
fn build_cancel(invite: &Request) -> Request {
    let mut headers = invite.headers.clone();
    headers.remove("Content-Type");
    headers.remove("Content-Length");

    let mut cancel = Request::new(
        RequestLine::new(Method::Cancel, invite.start.uri.clone()),
        headers,
        Bytes::new(),
    );

    if let Some(cseq) = cancel.headers.get("CSeq").map(|v| v.to_string()) {
        if let Some((num, _)) = cseq.split_once(' ') {
            cancel
                .headers
                .set_or_push("CSeq", format!("{} CANCEL", num));
        }
    }
    cancel.headers.push("Content-Length", "0");
    cancel
}

/// Parses the sent-by portion of a Via value: transport token, host, port.
fn parse_sent_by(via: &str) -> Option<(String, u16, TransportKind)> {
    let rest = via.trim().strip_prefix("SIP/2.0/")?;
    let (transport_token, rest) = rest.split_once(char::is_whitespace)?;
    let transport = TransportKind::from_token(transport_token)?;

    let sent_by = rest.split(';').next()?.trim();
    let default_port = if transport == TransportKind::Tls {
        5061
    } else {
        5060
    };

    // Bracketed IPv6 literals may carry colons inside the host part.
    let (host, port) = if let Some(rest) = sent_by.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        (host, port)
    } else {
        match sent_by.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (sent_by, default_port),
        }
    };
    Some((host.to_string(), port, transport))
}
