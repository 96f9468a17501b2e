// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared fixtures for the engine integration tests: recording collaborator
//! doubles and request builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use smol_str::SmolStr;

use sluice_msg::{Headers, Method, Request, RequestLine, Response, SipUri};
use sluice_proxy::{
    Binding, BranchId, ErrorAggregator, ListenerRegistry, OutboundTransport, ProxyConfig,
    ProxyController, ResolveError, Target, TargetResolver, TransportFault, TransportKind,
    UpstreamSink,
};

/// Transport double that records every send and can fail per host.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(BranchId, Target, Request)>>,
    pub cancels: Mutex<Vec<BranchId>>,
    fail_hosts: Mutex<HashMap<String, std::io::ErrorKind>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes sends toward `host` fail with the given connect error kind.
    pub fn fail_host(&self, host: &str, kind: std::io::ErrorKind) {
        self.fail_hosts.lock().insert(host.to_string(), kind);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.lock().len()
    }

    /// Returns the branch id of the attempt sent to `host`.
    pub fn branch_for(&self, host: &str) -> Option<BranchId> {
        self.sent
            .lock()
            .iter()
            .find(|(_, target, _)| target.uri.host.as_str() == host)
            .map(|(branch, _, _)| branch.clone())
    }

    pub fn sent_hosts(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|(_, target, _)| target.uri.host.to_string())
            .collect()
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    async fn send_request(
        &self,
        branch: &BranchId,
        target: &Target,
        request: Request,
    ) -> Result<(), TransportFault> {
        let fail = self
            .fail_hosts
            .lock()
            .get(target.uri.host.as_str())
            .copied();
        self.sent
            .lock()
            .push((branch.clone(), target.clone(), request));
        match fail {
            Some(kind) => Err(TransportFault::Connect {
                kind,
                binding: Binding::new(target.transport),
            }),
            None => Ok(()),
        }
    }

    async fn send_cancel(
        &self,
        branch: &BranchId,
        _target: &Target,
        _cancel: Request,
    ) -> Result<(), TransportFault> {
        self.cancels.lock().push(branch.clone());
        Ok(())
    }
}

/// Resolver double: hostname → canned targets, defaulting to the URI itself.
#[derive(Default)]
pub struct StaticResolver {
    entries: Mutex<HashMap<String, Vec<Target>>>,
    failures: Mutex<HashMap<String, ResolveError>>,
}

impl StaticResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, host: &str, targets: Vec<Target>) {
        self.entries.lock().insert(host.to_string(), targets);
    }

    pub fn fail(&self, host: &str, error: ResolveError) {
        self.failures.lock().insert(host.to_string(), error);
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<Target>, ResolveError> {
        if let Some(error) = self.failures.lock().get(uri.host.as_str()) {
            return Err(error.clone());
        }
        Ok(self
            .entries
            .lock()
            .get(uri.host.as_str())
            .cloned()
            .unwrap_or_else(|| vec![Target::new(uri.clone())]))
    }
}

/// Upstream double counting final responses: the at-most-once probe.
#[derive(Default)]
pub struct CountingUpstream {
    pub finals: AtomicUsize,
    pub responses: Mutex<Vec<Response>>,
}

impl CountingUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn final_count(&self) -> usize {
        self.finals.load(Ordering::SeqCst)
    }

    pub fn last_final_code(&self) -> Option<u16> {
        self.responses
            .lock()
            .iter()
            .rev()
            .find(|r| r.is_final())
            .map(|r| r.code())
    }

    pub fn codes(&self) -> Vec<u16> {
        self.responses.lock().iter().map(|r| r.code()).collect()
    }
}

#[async_trait]
impl UpstreamSink for CountingUpstream {
    async fn send_response(&self, response: Response) -> anyhow::Result<()> {
        if response.is_final() {
            self.finals.fetch_add(1, Ordering::SeqCst);
        }
        self.responses.lock().push(response);
        Ok(())
    }
}

/// A minimal INVITE the way a downstream client would send it.
pub fn invite() -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        "SIP/2.0/UDP client.example.com:5060;branch=z9hG4bKclient1",
    );
    headers.push("From", "<sip:alice@example.com>;tag=1928301774");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", "a84b4c76e66710@client.example.com");
    headers.push("CSeq", "314159 INVITE");
    headers.push("Max-Forwards", "70");
    headers.push("Contact", "<sip:alice@client.example.com>");
    headers.push("Content-Length", "0");

    Request::new(
        RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
        headers,
        Bytes::new(),
    )
}

pub fn target(host: &str) -> Target {
    Target::new(SipUri::parse(&format!("sip:{host}")).unwrap())
}

pub fn response(code: u16) -> Response {
    Response::new(
        sluice_msg::StatusLine::from_code(code),
        Headers::new(),
        Bytes::new(),
    )
}

/// Builds a controller directly with the given config snapshot and doubles.
pub fn controller_with(
    config: ProxyConfig,
    transport: Arc<RecordingTransport>,
    resolver: Arc<StaticResolver>,
    upstream: Arc<CountingUpstream>,
) -> ProxyController {
    let config = Arc::new(config);
    let request_timeout = config.request_timeout(TransportKind::Udp, true);
    let sequential_timeout = config.sequential_search_timeout(TransportKind::Udp, true);
    let aggregator = Arc::new(ErrorAggregator::new(
        SmolStr::new("a84b4c76e66710@client.example.com"),
        Method::Invite,
        Arc::new(ListenerRegistry::new()),
    ));
    ProxyController::new(
        config,
        transport,
        resolver,
        upstream,
        aggregator,
        request_timeout,
        sequential_timeout,
    )
}

/// Lets every spawned send/timer/event task run to quiescence.
pub async fn settle() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}
