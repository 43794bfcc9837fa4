// FrrLab: External BGP speaker and cluster sampling for route-advertisement tests
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use ipnet::IpNet;
use pretty_assertions::assert_eq;
use tokio::time::Instant;

use crate::{
    matcher::{Check, Expectation, RouteView},
    poller::{converge, poll_until, Attempt, Plan, PollSettings, PollState},
    sampler::{Query, Sample, SampleError, Sampler, Target},
    topology::IpFamily,
};

const SHOW_IP_BGP: &str = include_str!("files/show_ip_bgp.txt");

/// Sampler returning text that changes over (virtual) time. Each target and query has a list of
/// `(since, text)` entries; the latest entry that has started is returned. Before the first entry,
/// sampling fails.
struct TimedSampler {
    start: Instant,
    script: HashMap<(Target, Query), Vec<(Duration, &'static str)>>,
    calls: AtomicUsize,
    log: Mutex<Vec<(Duration, Target)>>,
}

impl TimedSampler {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            script: HashMap::new(),
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    fn at(mut self, secs: u64, target: Target, query: Query, text: &'static str) -> Self {
        self.script
            .entry((target, query))
            .or_default()
            .push((Duration::from_secs(secs), text));
        self
    }
}

#[async_trait]
impl Sampler for TimedSampler {
    async fn sample(&self, target: &Target, query: &Query) -> Result<Sample, SampleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.start.elapsed();
        self.log.lock().unwrap().push((now, target.clone()));
        self.script
            .get(&(target.clone(), query.clone()))
            .and_then(|entries| entries.iter().rev().find(|(since, _)| *since <= now))
            .map(|(_, text)| Sample {
                target: target.clone(),
                command: query.command().to_string(),
                text: text.to_string(),
            })
            .ok_or_else(|| SampleError::UnknownTarget(target.clone()))
    }
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn route(subnet: &str, nh: &str) -> Expectation {
    Expectation::present(Check::Route {
        view: RouteView::BgpTable,
        subnet: net(subnet),
        next_hop: ip(nh),
    })
}

fn external_plan() -> Plan {
    Plan::new("external routes")
        .with(
            Target::ExternalRouter,
            Query::BgpTable(IpFamily::V4),
            route("10.128.0.0/23", "192.168.111.20"),
        )
        .with(
            Target::ExternalRouter,
            Query::BgpTable(IpFamily::V4),
            route("10.129.0.0/23", "192.168.111.21"),
        )
}

#[tokio::test(start_paused = true)]
async fn poll_ready_immediately() {
    let polled = poll_until(PollSettings::NEIGHBOR, "nothing", || async {
        Ok::<Attempt<_, String>, String>(Attempt::Ready(42))
    })
    .await
    .unwrap();
    assert_eq!(polled.value, 42);
    assert_eq!(polled.attempts, 1);
    assert_eq!(polled.elapsed, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn poll_timeout_attempts() {
    let t = poll_until(PollSettings::NEIGHBOR, "never", || async {
        Ok::<Attempt<(), _>, String>(Attempt::Pending("still down".to_string()))
    })
    .await
    .unwrap_err();
    // attempts at 0, 5, 10, 15, 20, 25 and 30 seconds
    assert_eq!(t.attempts, 7);
    assert_eq!(t.elapsed, Duration::from_secs(30));
    assert_eq!(t.what, "never");
    assert_eq!(t.last(), "still down");
}

#[tokio::test(start_paused = true)]
async fn poll_errors_are_transient() {
    let counter = AtomicUsize::new(0);
    let counter = &counter;
    let polled = poll_until(PollSettings::RESOURCE_CREATE, "flaky", move || async move {
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Err("connection refused".to_string()),
            2 => Ok(Attempt::Pending("not yet".to_string())),
            _ => Ok(Attempt::Ready(())),
        }
    })
    .await
    .unwrap();
    assert_eq!(polled.attempts, 4);
    assert_eq!(polled.elapsed, Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn poll_last_error() {
    let t = poll_until(PollSettings::RESOURCE_CREATE, "api", || async {
        Err::<Attempt<(), String>, _>("webhook not ready".to_string())
    })
    .await
    .unwrap_err();
    assert_eq!(t.attempts, 5);
    assert_eq!(t.last_observation, None);
    assert_eq!(t.last(), "webhook not ready");
}

#[tokio::test(start_paused = true)]
async fn poll_slow_attempt() {
    let t = poll_until(PollSettings::new(5, 10), "slow", || async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<Attempt<(), String>, String>(Attempt::Ready(()))
    })
    .await
    .unwrap_err();
    assert_eq!(t.attempts, 1);
    assert_eq!(t.elapsed, Duration::from_secs(10));
    assert!(t.last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn poll_bounded_by_timeout_plus_interval() {
    let counter = AtomicUsize::new(0);
    let counter = &counter;
    let settings = PollSettings::new(5, 12);
    let t = poll_until(settings, "late", move || async move {
        if counter.fetch_add(1, Ordering::SeqCst) >= 2 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok::<Attempt<(), String>, String>(Attempt::Pending("down".to_string()))
    })
    .await
    .unwrap_err();
    // attempts at 0, 5 and 10 seconds; the last one gets a full interval
    assert_eq!(t.attempts, 3);
    assert_eq!(t.elapsed, Duration::from_secs(15));
    assert!(t.elapsed <= settings.timeout + settings.interval);
    assert_eq!(t.last_observation.as_deref(), Some("down"));
    assert!(t.last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn converge_after_propagation() {
    let sampler = TimedSampler::new()
        .at(0, Target::ExternalRouter, Query::BgpTable(IpFamily::V4), "")
        .at(
            20,
            Target::ExternalRouter,
            Query::BgpTable(IpFamily::V4),
            SHOW_IP_BGP,
        );
    let plan = external_plan();
    assert_eq!(plan.probes().len(), 1);
    assert_eq!(plan.num_expectations(), 2);

    let outcome = converge(&sampler, &plan, PollSettings::ROUTE_PROPAGATION).await;
    assert!(outcome.converged());
    // ticks at 0, 15 and 30 seconds
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.elapsed, Duration::from_secs(30));
    assert!(outcome.last_mismatches.is_empty());
    // one sample per tick, as both expectations share the same query.
    assert_eq!(sampler.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn converge_timeout_reports_mismatch() {
    let sampler = TimedSampler::new().at(
        0,
        Target::ExternalRouter,
        Query::BgpTable(IpFamily::V4),
        SHOW_IP_BGP,
    );
    let plan = external_plan().with(
        Target::ExternalRouter,
        Query::BgpTable(IpFamily::V4),
        route("10.131.0.0/23", "192.168.111.23"),
    );
    let outcome = converge(&sampler, &plan, PollSettings::ROUTE_PROPAGATION).await;
    assert_eq!(outcome.state, PollState::TimedOut);
    assert_eq!(outcome.attempts, 9);
    assert_eq!(outcome.elapsed, Duration::from_secs(120));
    assert_eq!(outcome.last_mismatches.len(), 1);
    let mismatch = &outcome.last_mismatches[0];
    assert_eq!(mismatch.target, Target::ExternalRouter);
    assert_eq!(mismatch.command, "vtysh -c \"show ip bgp\"");
    assert_eq!(mismatch.sample, SHOW_IP_BGP);
    assert!(mismatch.to_string().starts_with(
        "on external router: route 10.131.0.0/23 via 192.168.111.23 in the BGP table (expected present)"
    ));
}

#[tokio::test(start_paused = true)]
async fn converge_requires_all_samples_of_one_tick() {
    let node = Target::node("worker-0");
    // the node fails to be sampled for the first 40 seconds
    let sampler = TimedSampler::new()
        .at(
            0,
            Target::ExternalRouter,
            Query::BgpTable(IpFamily::V4),
            SHOW_IP_BGP,
        )
        .at(40, node.clone(), Query::BgpTable(IpFamily::V4), SHOW_IP_BGP);
    let plan = external_plan().with(
        node.clone(),
        Query::BgpTable(IpFamily::V4),
        route("10.129.0.0/23", "192.168.111.21"),
    );
    assert_eq!(plan.num_expectations_on(&node), 1);

    let outcome = converge(&sampler, &plan, PollSettings::ROUTE_PROPAGATION).await;
    assert!(outcome.converged());
    // ticks at 0, 15, 30 and 45 seconds
    assert_eq!(outcome.attempts, 4);

    // the external router is always sampled before the node
    let log = sampler.log.lock().unwrap();
    assert_eq!(log.len(), 8);
    assert!(log
        .chunks(2)
        .all(|c| c[0].1 == Target::ExternalRouter && c[1].1 == node));
}

#[tokio::test(start_paused = true)]
async fn converge_sampling_errors() {
    let sampler = TimedSampler::new();
    let outcome = converge(&sampler, &external_plan(), PollSettings::NEIGHBOR).await;
    assert_eq!(outcome.state, PollState::TimedOut);
    assert_eq!(outcome.attempts, 7);
    assert!(outcome.last_mismatches.is_empty());
    assert_eq!(
        outcome.last_error.as_deref(),
        Some("Unknown target: external router")
    );
}

#[tokio::test(start_paused = true)]
async fn converge_negated_plan() {
    let sampler = TimedSampler::new()
        .at(
            0,
            Target::ExternalRouter,
            Query::BgpTable(IpFamily::V4),
            SHOW_IP_BGP,
        )
        .at(50, Target::ExternalRouter, Query::BgpTable(IpFamily::V4), "");
    let withdrawn = external_plan().negate("external routes withdrawn");
    assert_eq!(withdrawn.description(), "external routes withdrawn");
    assert!(withdrawn.probes()[0].expectations.iter().all(|e| !e.present));

    let outcome = converge(&sampler, &withdrawn, PollSettings::ROUTE_PROPAGATION).await;
    assert!(outcome.converged());
    // ticks at 0, 15, 30, 45 and 60 seconds
    assert_eq!(outcome.attempts, 5);
}

#[test]
fn plan_merges_probes() {
    let mut plan = external_plan();
    plan.push(
        Target::ExternalRouter,
        Query::BgpTable(IpFamily::V4),
        route("10.128.0.0/23", "192.168.111.20"),
    );
    assert_eq!(plan.num_expectations(), 2);

    let mut other = Plan::new("other");
    other.push(
        Target::node("worker-1"),
        Query::KernelRoutes(IpFamily::V4),
        route("10.128.0.0/23", "192.168.111.20"),
    );
    other.push(
        Target::ExternalRouter,
        Query::BgpTable(IpFamily::V4),
        route("10.130.0.0/23", "192.168.111.22"),
    );
    plan.extend(other);
    assert_eq!(plan.probes().len(), 2);
    assert_eq!(plan.num_expectations_on(&Target::ExternalRouter), 3);
    assert_eq!(plan.num_expectations(), 4);
    assert_eq!(plan.probes()[1].target, Target::node("worker-1"));
}

#[test]
fn plan_evaluate() {
    let plan = external_plan();
    let sample = |text: &str| Sample {
        target: Target::ExternalRouter,
        command: "vtysh -c \"show ip bgp\"".to_string(),
        text: text.to_string(),
    };
    assert!(plan.evaluate(&[sample(SHOW_IP_BGP)]).is_empty());
    assert_eq!(plan.evaluate(&[sample("")]).len(), 2);
    assert!(plan.negate("negated").evaluate(&[sample("")]).is_empty());
    assert_eq!(
        plan.negate("negated").evaluate(&[sample(SHOW_IP_BGP)]).len(),
        2
    );
}

#[test]
fn poll_settings() {
    assert_eq!(PollSettings::FAILOVER.interval, Duration::from_secs(10));
    assert_eq!(PollSettings::FAILOVER.timeout, Duration::from_secs(360));
    assert_eq!(PollSettings::ROUTE_PROPAGATION.to_string(), "every 15s for 120s");
}
