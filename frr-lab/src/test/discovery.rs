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

use std::net::IpAddr;

use ipnet::IpNet;
use pretty_assertions::assert_eq;
use test_log::test;

use crate::{
    cluster::{
        discovery::{parse_egress_ip_status, parse_node_subnets, parse_nodes, EgressIpAssignment},
        ClusterError,
    },
    router::parse_route_get,
    topology::{IpFamily, NetworkName, StackType, Topology},
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

#[test]
fn node_subnets_annotation() {
    let subnets = parse_node_subnets(
        r#"{"default":["10.128.0.0/23","fd01:0:0:1::/64"],"ns_blue":"10.100.1.0/24","transit":"100.88.0.0/16"}"#,
    )
    .unwrap();
    assert_eq!(
        subnets,
        vec![
            (NetworkName::Default, net("10.128.0.0/23")),
            (NetworkName::Default, net("fd01:0:0:1::/64")),
            (NetworkName::user_defined("ns", "blue"), net("10.100.1.0/24")),
        ]
    );

    assert!(matches!(
        parse_node_subnets(r#"{"default":"10.128.0.0"}"#),
        Err(ClusterError::Parse { .. })
    ));
    assert!(matches!(
        parse_node_subnets("not json"),
        Err(ClusterError::Json(_))
    ));
}

#[test]
fn nodes() {
    let nodes = parse_nodes(include_str!("files/nodes.json")).unwrap();
    assert_eq!(nodes.len(), 3);

    let topo = Topology::new(StackType::DualStack, nodes).unwrap();
    let w0 = topo.node("worker-0").unwrap();
    // the external address is ignored, and the first internal address wins
    assert_eq!(w0.address(IpFamily::V4), Some(ip("192.168.111.20")));
    assert_eq!(
        w0.address(IpFamily::V6),
        Some(ip("fd2e:6f44:5dd8:c956::14"))
    );
    assert_eq!(
        w0.subnet(&NetworkName::user_defined("udn-blue", "blue"), IpFamily::V4),
        Some(net("10.100.1.0/24"))
    );

    let w2 = topo.node("worker-2").unwrap();
    assert_eq!(
        w2.subnet(&NetworkName::Default, IpFamily::V4),
        Some(net("10.130.0.0/23"))
    );
    assert_eq!(w2.subnet(&NetworkName::Default, IpFamily::V6), None);

    let routes = topo.advertised_routes(&NetworkName::Default);
    assert_eq!(routes.len(), 5);
    assert_eq!(
        topo.advertised_routes(&NetworkName::user_defined("udn-blue", "blue"))
            .into_iter()
            .map(|r| r.node)
            .collect::<Vec<_>>(),
        vec!["worker-0", "worker-1"]
    );
}

#[test]
fn nodes_with_invalid_address() {
    let json = r#"{"items":[{"metadata":{"name":"a"},"status":{"addresses":[{"type":"InternalIP","address":"x"}]}}]}"#;
    assert!(matches!(
        parse_nodes(json),
        Err(ClusterError::Parse {
            what: "node address",
            ..
        })
    ));
}

#[test]
fn egress_ip_status() {
    assert!(parse_egress_ip_status("").unwrap().is_empty());
    assert_eq!(
        parse_egress_ip_status(r#"[{"egressIP":"192.168.111.100","node":"worker-1"}]"#).unwrap(),
        vec![EgressIpAssignment {
            node: "worker-1".to_string(),
            egress_ip: ip("192.168.111.100")
        }]
    );
}

#[test]
fn route_get() {
    let json = r#"[{"dst":"192.168.111.20","dev":"br-ex","prefsrc":"192.168.111.1","flags":[],"uid":0,"cache":[]}]"#;
    assert_eq!(parse_route_get(json).unwrap(), Some(ip("192.168.111.1")));
    let json = r#"[{"type":"unreachable","dst":"fd2e::14","flags":[]}]"#;
    assert_eq!(parse_route_get(json).unwrap(), None);
    assert!(parse_route_get("").is_err());
}
