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

//! Expectations on the routing state of the external router and the nodes.
//!
//! All functions in this module are pure: they only read the [`Topology`] and build a [`Plan`].
//! Running a plan is up to the caller (see [`crate::scenario::Environment::converge`]).
//!
//! After the pod network of a network is advertised, the following must hold for every active
//! family:
//! - the external router has an established session with every node,
//! - the external router has a route to the subnet of every node, via that node, both in its BGP
//!   table and in the kernel,
//! - every node has a route to the subnet of every *other* node, via that node, both in its BGP
//!   table and in the kernel,
//! - every node has the static networks of the external router in its BGP table and in the kernel,
//!   via the external router.

use std::net::IpAddr;

use frr_lab::{
    matcher::{Check, Expectation, RouteView},
    poller::{ConvergenceOutcome, Plan},
    sampler::{Query, Target},
    topology::{AdvertisedRoute, IpFamily, NetworkName, Topology},
};
use ipnet::IpNet;
use itertools::Itertools;

use crate::Error;

/// Both views in which an advertised route must show up.
const VIEWS: [RouteView; 2] = [RouteView::BgpTable, RouteView::Kernel];

fn query(view: RouteView, family: IpFamily) -> Query {
    match view {
        RouteView::BgpTable => Query::BgpTable(family),
        RouteView::Kernel => Query::KernelRoutes(family),
    }
}

fn route(view: RouteView, subnet: IpNet, next_hop: IpAddr, present: bool) -> Expectation {
    let check = Check::Route {
        view,
        subnet,
        next_hop,
    };
    if present {
        Expectation::present(check)
    } else {
        Expectation::absent(check)
    }
}

/// Push a route into the plan, in all views.
fn push_route(plan: &mut Plan, target: &Target, r: &AdvertisedRoute, present: bool) {
    let family = IpFamily::of_net(&r.subnet);
    for view in VIEWS {
        plan.push(
            target.clone(),
            query(view, family),
            route(view, r.subnet, r.next_hop, present),
        );
    }
}

/// The external router has an established session with every node, in every active family.
pub fn external_neighbors(topo: &Topology) -> Plan {
    let mut plan = Plan::new("BGP sessions of the external router");
    for family in topo.families() {
        for peer in topo.peers(*family) {
            plan.push(
                Target::ExternalRouter,
                Query::BgpNeighbor(peer),
                Expectation::present(Check::Neighbor { peer }),
            );
        }
    }
    plan
}

/// The external router has (or has not, if `present` is `false`) a route to the subnet of every
/// node in `network`.
pub fn external_routes(topo: &Topology, network: &NetworkName, present: bool) -> Plan {
    let mut plan = Plan::new(format!("routes of network {network} on the external router"));
    for r in topo.advertised_routes(network) {
        push_route(&mut plan, &Target::ExternalRouter, &r, present);
    }
    plan
}

/// Every node has (or has not) a route to the subnet of every other node in `network`. A node
/// never learns its own subnet.
pub fn node_routes(topo: &Topology, network: &NetworkName, present: bool) -> Plan {
    let mut plan = Plan::new(format!("routes of network {network} on the nodes"));
    let routes = topo.advertised_routes(network);
    for node in topo.nodes() {
        let target = Target::node(node.name());
        for r in routes.iter().filter(|r| r.node != node.name()) {
            push_route(&mut plan, &target, r, present);
        }
    }
    plan
}

/// Every node has the static networks of the external router in its BGP table and in the kernel.
/// The next hop is the address of the external router in the family of the network. Networks of a
/// family without a router address are skipped.
pub fn node_static_routes(topo: &Topology, statics: &[IpNet], router_addrs: &[IpAddr]) -> Plan {
    let mut plan = Plan::new("static networks of the external router on the nodes");
    let statics = statics
        .iter()
        .filter(|net| topo.stack().has(IpFamily::of_net(net)))
        .filter_map(|net| {
            let family = IpFamily::of_net(net);
            let next_hop = router_addrs.iter().find(|a| IpFamily::of(a) == family)?;
            Some((*net, *next_hop))
        })
        .collect_vec();
    for node in topo.nodes() {
        for ((net, next_hop), view) in statics.iter().cartesian_product(VIEWS) {
            plan.push(
                Target::node(node.name()),
                query(view, IpFamily::of_net(net)),
                route(view, *net, *next_hop, true),
            );
        }
    }
    plan
}

/// Routes of `network` on the external router and on all nodes, all present or all absent.
pub fn routes(topo: &Topology, network: &NetworkName, present: bool) -> Plan {
    let what = if present { "advertised" } else { "withdrawn" };
    let mut plan = Plan::new(format!("network {network} {what}"));
    plan.extend(external_routes(topo, network, present));
    plan.extend(node_routes(topo, network, present));
    plan
}

/// The full mesh after advertising `network`: sessions, routes on the external router, routes on
/// every node and the static networks of the external router.
pub fn mesh(
    topo: &Topology,
    network: &NetworkName,
    statics: &[IpNet],
    router_addrs: &[IpAddr],
) -> Plan {
    let mut plan = Plan::new(format!("full mesh of network {network}"));
    plan.extend(external_neighbors(topo));
    plan.extend(routes(topo, network, true));
    plan.extend(node_static_routes(topo, statics, router_addrs));
    plan
}

/// The external router has (or has not) a host route to the egress IP via `next_hop`.
pub fn egress_route(egress_ip: IpAddr, next_hop: IpAddr, present: bool) -> Plan {
    let what = if present { "via" } else { "not via" };
    let mut plan = Plan::new(format!("egress IP {egress_ip} {what} {next_hop}"));
    let r = AdvertisedRoute {
        node: String::new(),
        subnet: IpNet::from(egress_ip),
        next_hop,
    };
    push_route(&mut plan, &Target::ExternalRouter, &r, present);
    plan
}

/// Make sure that `network` has at least one subnet in the topology. Otherwise, every plan on that
/// network would be empty and trivially converge.
pub fn require_subnets(topo: &Topology, network: &NetworkName) -> Result<(), Error> {
    if topo.advertised_routes(network).is_empty() {
        Err(Error::NoSubnets(network.clone()))
    } else {
        Ok(())
    }
}

/// Turn a convergence outcome into an error if it did not converge.
pub fn ensure_converged(plan: &Plan, outcome: &ConvergenceOutcome) -> Result<(), Error> {
    if outcome.converged() {
        return Ok(());
    }
    let details = match (outcome.last_mismatches.first(), outcome.last_error.as_ref()) {
        (Some(first), _) if outcome.last_mismatches.len() > 1 => format!(
            "{} expectations failed, first {first}",
            outcome.last_mismatches.len()
        ),
        (Some(first), _) => first.to_string(),
        (None, Some(e)) => format!("no complete sample: {e}"),
        (None, None) => "nothing observed".to_string(),
    };
    Err(Error::Verification {
        description: plan.description().to_string(),
        attempts: outcome.attempts,
        details,
    })
}
