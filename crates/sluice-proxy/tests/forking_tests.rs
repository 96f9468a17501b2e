// sluice-rs - The Sluice SIP Proxy Engine
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end engine tests: forking policies, cancellation, timers, and the
//! at-most-once upstream response invariant.

mod common;

use std::time::Duration;

use common::*;
use sluice_msg::top_via;
use sluice_proxy::{
    BranchEvent, DnsQuery, ProxyConfig, ResolveError, ResolveFault, SearchMode, StateMode,
    TransportKind, TxnState,
};

fn parallel_config() -> ProxyConfig {
    ProxyConfig {
        search_mode: SearchMode::Parallel,
        is_recursing: false,
        ..ProxyConfig::default()
    }
}

fn sequential_config() -> ProxyConfig {
    ProxyConfig {
        search_mode: SearchMode::Sequential,
        is_recursing: false,
        ..ProxyConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_starts_every_branch_at_once() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    let targets = vec![target("gw1.example.com"), target("gw2.example.com"), target("gw3.example.com")];
    controller.proxy_to(targets, invite(), None).await;
    settle().await;

    // All three go out with no branch waiting on another's completion.
    assert_eq!(transport.sent_count(), 3);
    assert_eq!(upstream.final_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn sequential_mode_gates_on_terminal_failure() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        sequential_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![
                target("first.example.com").with_q_value(1.0),
                target("second.example.com").with_q_value(0.5),
            ],
            invite(),
            None,
        )
        .await;
    settle().await;
    assert_eq!(transport.sent_hosts(), vec!["first.example.com"]);

    // 503 is in the failover set: the second candidate starts immediately.
    let first = transport.branch_for("first.example.com").unwrap();
    controller
        .on_branch_event(&first, BranchEvent::Failure(response(503)))
        .await;
    settle().await;

    assert_eq!(
        transport.sent_hosts(),
        vec!["first.example.com", "second.example.com"]
    );
    assert_eq!(upstream.final_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn sequential_mode_advances_on_search_timeout() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    // request timeout 8s → sequential slice 4s
    let config = ProxyConfig {
        request_timeout_override: Some(Duration::from_secs(8)),
        ..sequential_config()
    };
    let controller = controller_with(
        config,
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![target("slow.example.com"), target("backup.example.com")],
            invite(),
            None,
        )
        .await;
    settle().await;
    assert_eq!(transport.sent_count(), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    settle().await;
    assert_eq!(transport.sent_count(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    // Slice elapsed: backup starts while the slow branch keeps running.
    assert_eq!(
        transport.sent_hosts(),
        vec!["slow.example.com", "backup.example.com"]
    );

    // The slow branch can still win the fork afterwards.
    let slow = transport.branch_for("slow.example.com").unwrap();
    controller
        .on_branch_event(&slow, BranchEvent::Success(response(200)))
        .await;
    settle().await;
    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(200));
    assert_eq!(transport.cancel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_2xx_is_forwarded_exactly_once() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(vec![target("gw1.example.com")], invite(), None)
        .await;
    settle().await;

    let branch = transport.branch_for("gw1.example.com").unwrap();
    controller
        .on_branch_event(&branch, BranchEvent::Success(response(200)))
        .await;
    controller
        .on_branch_event(&branch, BranchEvent::Success(response(200)))
        .await;
    settle().await;

    assert_eq!(upstream.final_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn success_preempts_losers_and_cancels_pending() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![target("gw1.example.com"), target("gw2.example.com"), target("gw3.example.com")],
            invite(),
            None,
        )
        .await;
    settle().await;

    let b1 = transport.branch_for("gw1.example.com").unwrap();
    let b2 = transport.branch_for("gw2.example.com").unwrap();
    let b3 = transport.branch_for("gw3.example.com").unwrap();

    controller
        .on_branch_event(&b2, BranchEvent::Provisional(response(180)))
        .await;
    controller
        .on_branch_event(&b1, BranchEvent::Failure(response(503)))
        .await;
    controller
        .on_branch_event(&b3, BranchEvent::Success(response(200)))
        .await;
    settle().await;

    // Exactly the 200 goes upstream (the 180 before it is provisional).
    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(200));
    // Only the still-pending branch gets a CANCEL; terminal ones are left be.
    let cancels = transport.cancels.lock().clone();
    assert_eq!(cancels, vec![b2]);
}

#[tokio::test(start_paused = true)]
async fn branch_deadline_synthesizes_408_exactly_once() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(vec![target("quiet.example.com")], invite(), None)
        .await;
    settle().await;
    assert_eq!(upstream.final_count(), 0);

    // Default deadline is 64×T1 = 32s.
    tokio::time::advance(Duration::from_secs(32)).await;
    settle().await;

    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(408));

    // The timer cannot fire twice.
    tokio::time::advance(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(upstream.final_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn time_to_try_overrides_branch_deadline() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![target("quiet.example.com")],
            invite(),
            Some(Duration::from_secs(2)),
        )
        .await;
    settle().await;

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(upstream.last_final_code(), Some(408));
}

#[tokio::test(start_paused = true)]
async fn cancel_cascade_answers_487_and_skips_terminal_branches() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![target("gw1.example.com"), target("gw2.example.com")],
            invite(),
            None,
        )
        .await;
    settle().await;

    let b1 = transport.branch_for("gw1.example.com").unwrap();
    controller
        .on_branch_event(&b1, BranchEvent::Failure(response(486)))
        .await;
    settle().await;

    controller.on_cancel().await;
    settle().await;

    // Only the pending branch is cancelled; the 486 branch is terminal.
    let b2 = transport.branch_for("gw2.example.com").unwrap();
    assert_eq!(transport.cancels.lock().clone(), vec![b2]);
    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(487));
    assert_eq!(
        controller.transaction().unwrap().state(),
        TxnState::Terminated
    );

    // Cancelling again changes nothing.
    controller.on_cancel().await;
    settle().await;
    assert_eq!(transport.cancel_count(), 1);
    assert_eq!(upstream.final_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_upstream_response_under_racing_completions() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    let targets: Vec<_> = (0..8)
        .map(|i| target(&format!("gw{i}.example.com")))
        .collect();
    controller.proxy_to(targets, invite(), None).await;

    // Wait until every send task has run.
    for _ in 0..200 {
        if transport.sent_count() == 8 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(transport.sent_count(), 8);

    let branches: Vec<_> = transport.sent.lock().iter().map(|(b, _, _)| b.clone()).collect();
    let mut tasks = Vec::new();
    for branch in branches {
        let controller = controller.clone();
        tasks.push(tokio::spawn(async move {
            controller
                .on_branch_event(&branch, BranchEvent::Success(response(200)))
                .await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(upstream.final_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_failure_fails_over_and_last_icmp_synthesizes_500() {
    let transport = RecordingTransport::new();
    transport.fail_host("dead.example.com", std::io::ErrorKind::ConnectionRefused);
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![target("dead.example.com"), target("gw2.example.com")],
            invite(),
            None,
        )
        .await;
    settle().await;
    // The refused branch is terminal but nothing went upstream yet.
    assert_eq!(upstream.final_count(), 0);

    let b2 = transport.branch_for("gw2.example.com").unwrap();
    controller
        .on_branch_event(&b2, BranchEvent::IcmpUnreachable { binding: None })
        .await;
    settle().await;

    // Both branches failed below the SIP layer, none by timeout: 500.
    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(500));
}

#[tokio::test(start_paused = true)]
async fn icmp_error_alone_does_not_answer_upstream() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![target("gw1.example.com"), target("gw2.example.com")],
            invite(),
            None,
        )
        .await;
    settle().await;

    let b1 = transport.branch_for("gw1.example.com").unwrap();
    controller
        .on_branch_event(&b1, BranchEvent::IcmpUnreachable { binding: None })
        .await;
    settle().await;
    assert_eq!(upstream.final_count(), 0);

    // The surviving branch's answer decides the outcome.
    let b2 = transport.branch_for("gw2.example.com").unwrap();
    controller
        .on_branch_event(&b2, BranchEvent::Failure(response(480)))
        .await;
    settle().await;
    assert_eq!(upstream.last_final_code(), Some(480));
}

#[tokio::test(start_paused = true)]
async fn highest_priority_recurses_tier_by_tier() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let config = ProxyConfig {
        search_mode: SearchMode::HighestPriority,
        is_recursing: false,
        ..ProxyConfig::default()
    };
    let controller = controller_with(
        config,
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![
                target("top1.example.com").with_q_value(1.0),
                target("top2.example.com").with_q_value(1.0),
                target("low1.example.com").with_q_value(0.5),
                target("low2.example.com").with_q_value(0.5),
            ],
            invite(),
            None,
        )
        .await;
    settle().await;

    // Only the top tier goes out.
    let mut first_wave = transport.sent_hosts();
    first_wave.sort();
    assert_eq!(first_wave, vec!["top1.example.com", "top2.example.com"]);

    for host in ["top1.example.com", "top2.example.com"] {
        let branch = transport.branch_for(host).unwrap();
        controller
            .on_branch_event(&branch, BranchEvent::Failure(response(503)))
            .await;
    }
    settle().await;

    // Whole tier failed: the next one starts.
    assert_eq!(transport.sent_count(), 4);
    assert_eq!(upstream.final_count(), 0);

    for host in ["low1.example.com", "low2.example.com"] {
        let branch = transport.branch_for(host).unwrap();
        controller
            .on_branch_event(&branch, BranchEvent::Failure(response(503)))
            .await;
    }
    settle().await;

    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(503));
}

#[tokio::test(start_paused = true)]
async fn redirect_recursion_expands_contacts() {
    let transport = RecordingTransport::new();
    let resolver = StaticResolver::new();
    let upstream = CountingUpstream::new();
    let config = ProxyConfig {
        search_mode: SearchMode::Parallel,
        is_recursing: true,
        ..ProxyConfig::default()
    };
    let controller = controller_with(config, transport.clone(), resolver, upstream.clone());

    controller
        .proxy_to(vec![target("gw1.example.com")], invite(), None)
        .await;
    settle().await;

    let b1 = transport.branch_for("gw1.example.com").unwrap();
    let mut redirect = response(302);
    redirect
        .headers
        .push("Contact", "<sip:moved.example.com>;q=0.9");
    controller
        .on_branch_event(&b1, BranchEvent::Redirect(redirect))
        .await;
    settle().await;

    // The contact became a fresh branch; no 3xx went upstream.
    assert_eq!(
        transport.sent_hosts(),
        vec!["gw1.example.com", "moved.example.com"]
    );
    assert_eq!(upstream.final_count(), 0);

    let b2 = transport.branch_for("moved.example.com").unwrap();
    controller
        .on_branch_event(&b2, BranchEvent::Success(response(200)))
        .await;
    settle().await;
    assert_eq!(upstream.last_final_code(), Some(200));
}

#[tokio::test(start_paused = true)]
async fn failed_contact_resolution_is_classified_not_fatal() {
    let transport = RecordingTransport::new();
    let resolver = StaticResolver::new();
    resolver.fail(
        "gone.example.com",
        ResolveError {
            query: DnsQuery::Srv,
            fault: ResolveFault::NoRecords,
        },
    );
    let upstream = CountingUpstream::new();
    let config = ProxyConfig {
        search_mode: SearchMode::Parallel,
        is_recursing: true,
        ..ProxyConfig::default()
    };
    let controller = controller_with(config, transport.clone(), resolver, upstream.clone());

    controller
        .proxy_to(vec![target("gw1.example.com")], invite(), None)
        .await;
    settle().await;

    let b1 = transport.branch_for("gw1.example.com").unwrap();
    let mut redirect = response(302);
    redirect.headers.push("Contact", "<sip:gone.example.com>");
    redirect.headers.push("Contact", "<sip:alive.example.com>");
    controller
        .on_branch_event(&b1, BranchEvent::Redirect(redirect))
        .await;
    settle().await;

    // The resolvable contact still proxies; the dead one became a
    // classified DNS error rather than a fault.
    assert_eq!(
        transport.sent_hosts(),
        vec!["gw1.example.com", "alive.example.com"]
    );
    let errors = controller.aggregator().errors();
    assert!(errors
        .iter()
        .any(|e| e.code() == sluice_proxy::error::codes::DNS_SRV_NO_RECORDS));
}

#[tokio::test(start_paused = true)]
async fn redirect_without_recursion_competes_as_final() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(vec![target("gw1.example.com")], invite(), None)
        .await;
    settle().await;

    let b1 = transport.branch_for("gw1.example.com").unwrap();
    let mut redirect = response(302);
    redirect.headers.push("Contact", "<sip:moved.example.com>");
    controller
        .on_branch_event(&b1, BranchEvent::Redirect(redirect))
        .await;
    settle().await;

    assert_eq!(transport.sent_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(302));
}

#[tokio::test(start_paused = true)]
async fn recursion_depth_bound_stops_redirect_loops() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let config = ProxyConfig {
        search_mode: SearchMode::Parallel,
        is_recursing: true,
        max_recursion_depth: 1,
        ..ProxyConfig::default()
    };
    let controller = controller_with(
        config,
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(vec![target("hop0.example.com")], invite(), None)
        .await;
    settle().await;

    // hop0 redirects to hop1 (depth 1, allowed)…
    let b0 = transport.branch_for("hop0.example.com").unwrap();
    let mut r0 = response(302);
    r0.headers.push("Contact", "<sip:hop1.example.com>");
    controller.on_branch_event(&b0, BranchEvent::Redirect(r0)).await;
    settle().await;
    assert_eq!(transport.sent_count(), 2);

    // …but hop1's own redirect hits the bound and competes as a final.
    let b1 = transport.branch_for("hop1.example.com").unwrap();
    let mut r1 = response(302);
    r1.headers.push("Contact", "<sip:hop2.example.com>");
    controller.on_branch_event(&b1, BranchEvent::Redirect(r1)).await;
    settle().await;

    assert_eq!(transport.sent_count(), 2);
    assert_eq!(upstream.last_final_code(), Some(302));
}

#[tokio::test(start_paused = true)]
async fn sequential_search_stops_on_non_failover_final() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        sequential_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller
        .proxy_to(
            vec![target("first.example.com"), target("second.example.com")],
            invite(),
            None,
        )
        .await;
    settle().await;

    // 404 is not a failover code: the search ends with it.
    let first = transport.branch_for("first.example.com").unwrap();
    controller
        .on_branch_event(&first, BranchEvent::Failure(response(404)))
        .await;
    settle().await;

    assert_eq!(transport.sent_count(), 1);
    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(404));
}

#[tokio::test(start_paused = true)]
async fn empty_candidate_list_answers_404() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let controller = controller_with(
        parallel_config(),
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    controller.proxy_to(Vec::new(), invite(), None).await;
    settle().await;

    assert_eq!(transport.sent_count(), 0);
    assert_eq!(upstream.final_count(), 1);
    assert_eq!(upstream.last_final_code(), Some(404));
}

#[tokio::test(start_paused = true)]
async fn stateless_promotion_strips_own_via() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let config = ProxyConfig {
        state_mode: StateMode::Stateless,
        listen: vec![sluice_proxy::ListenPoint::new(
            "edge.example.com",
            5060,
            TransportKind::Udp,
        )],
        ..parallel_config()
    };
    let controller = controller_with(
        config,
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    // Stateless: no transaction exists for the inbound request.
    assert!(controller.on_new_request(&invite()).await.is_none());
    assert!(controller.transaction().is_none());

    // A statelessly forwarded request comes back through us with our Via on
    // top; promotion must strip it before going stateful.
    let mut request = invite();
    request.headers.push_front(
        "Via",
        "SIP/2.0/UDP edge.example.com:5060;branch=z9hG4bKedge1",
    );

    assert!(controller.overwrite_stateless_mode(&request));
    let txn = controller.transaction().expect("promoted");
    let promoted = txn.request();
    let top = top_via(&promoted).unwrap();
    assert!(top.contains("client.example.com"));
}

#[tokio::test(start_paused = true)]
async fn failover_stateful_defers_transaction_to_proxy_to() {
    let transport = RecordingTransport::new();
    let upstream = CountingUpstream::new();
    let config = ProxyConfig {
        state_mode: StateMode::FailoverStateful,
        ..parallel_config()
    };
    let controller = controller_with(
        config,
        transport.clone(),
        StaticResolver::new(),
        upstream.clone(),
    );

    assert!(controller.on_new_request(&invite()).await.is_none());
    assert!(controller.transaction().is_none());

    controller
        .proxy_to(vec![target("gw1.example.com")], invite(), None)
        .await;
    settle().await;

    assert!(controller.transaction().is_some());
    // Deferred creation: no eager 100 Trying went upstream.
    assert!(upstream.codes().iter().all(|&c| c != 100));
}
