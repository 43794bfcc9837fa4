// OvnkBgpE2e: BGP route-advertisement verification engine
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

use std::time::Duration;

use frr_lab::{
    poller::{ConvergenceOutcome, Mismatch, PollSettings, PollState},
    sampler::Target,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use test_log::test;

use super::sim::{ip, topology_v4};
use crate::{report::ScenarioReport, verify};

fn outcome(converged: bool) -> ConvergenceOutcome {
    ConvergenceOutcome {
        state: if converged {
            PollState::Converged
        } else {
            PollState::TimedOut
        },
        attempts: 3,
        elapsed: Duration::from_millis(30500),
        last_mismatches: Vec::new(),
        last_error: None,
    }
}

#[test]
fn record_checks() {
    let mut report = ScenarioReport::new("failover", &topology_v4());
    assert_eq!(report.stack, "ipv4single");
    assert_eq!(report.nodes, vec!["worker-0", "worker-1", "worker-2"]);
    assert!(report.passed());

    let plan = verify::egress_route(ip("192.0.2.100"), ip("192.0.2.11"), true);
    report.record(&plan, PollSettings::ROUTE_PROPAGATION, &outcome(true));
    assert!(report.passed());

    let mut failed = outcome(false);
    let probe = &plan.probes()[1];
    failed.last_mismatches.push(Mismatch {
        target: Target::ExternalRouter,
        command: probe.query.command().to_string(),
        expectation: probe.expectations[0].clone(),
        sample: String::new(),
    });
    report.record(&plan, PollSettings::FAILOVER, &failed);
    assert!(!report.passed());

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["scenario"], json!("failover"));
    assert_eq!(
        value["checks"][1],
        json!({
            "description": "egress IP 192.0.2.100 via 192.0.2.11",
            "expectations": 2,
            "interval_secs": 10,
            "timeout_secs": 360,
            "converged": false,
            "attempts": 3,
            "elapsed_secs": 30.5,
            "mismatches": [
                "on external router: route 192.0.2.100/32 via 192.0.2.11 in the kernel routing table (expected present)"
            ]
        })
    );
}

#[test]
fn write_json() {
    let report = ScenarioReport::new("default-network", &topology_v4());
    let prefix = std::env::temp_dir().join(format!("bgp-e2e-report-{}", std::process::id()));
    let prefix = prefix.to_string_lossy();

    let first = report.write_json_with_timestamp(&prefix).unwrap();
    let second = report.write_json_with_timestamp(&prefix).unwrap();
    assert_ne!(first, second);

    let content = std::fs::read_to_string(&first).unwrap();
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["scenario"], json!("default-network"));
    assert_eq!(value["checks"], json!([]));

    std::fs::remove_file(first).unwrap();
    std::fs::remove_file(second).unwrap();
}
