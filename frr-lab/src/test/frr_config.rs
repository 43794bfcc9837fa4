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

use std::net::{IpAddr, Ipv4Addr};

use ipnet::IpNet;
use pretty_assertions::assert_eq;
use test_log::test;

use crate::{
    config::{LabConfig, RouterConfig},
    router::{enabled_daemons, render_config, RenderError, RouterSpec, VrfSpec, DAEMONS},
    topology::IpFamily,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn net(s: &str) -> IpNet {
    s.parse().unwrap()
}

fn spec() -> RouterSpec {
    RouterSpec::from_config(&RouterConfig::default())
}

#[test]
fn dual_stack() {
    let spec = spec()
        .with_router_id(Ipv4Addr::new(192, 168, 111, 1))
        .with_peers([
            ip("192.168.111.20"),
            ip("fd2e:6f44:5dd8:c956::14"),
            ip("192.168.111.21"),
        ]);
    let cfg = render_config(&spec).unwrap();
    assert_eq!(cfg, include_str!("files/frr_dual_stack.conf"));
    // rendering is deterministic
    assert_eq!(cfg, render_config(&spec.clone()).unwrap());
}

#[test]
fn single_stack_has_no_other_family() {
    let spec = spec().with_peers([ip("192.168.111.20")]);
    let cfg = render_config(&spec).unwrap();
    assert!(!cfg.contains("address-family ipv6"));
    assert!(!cfg.contains("2001:db8::/128"));
    assert!(!cfg.contains("bgp router-id"));
    assert_eq!(cfg.matches("address-family ipv4 unicast").count(), 2);
    assert!(cfg.starts_with("router bgp 64512\n no bgp default ipv4-unicast\n"));
    assert!(cfg.ends_with("exit\n!\n"));
}

#[test]
fn no_peers() {
    let cfg = render_config(&spec()).unwrap();
    assert!(!cfg.contains("address-family"));
    assert!(!cfg.contains("neighbor"));
}

#[test]
fn duplicates_are_dropped() {
    let mut spec = spec().with_peers([ip("192.168.111.20"), ip("192.168.111.20")]);
    spec.static_networks.push(net("192.168.1.0/24"));
    spec.static_networks.push(net("192.168.1.5/24"));
    let cfg = render_config(&spec).unwrap();
    assert_eq!(cfg.matches("neighbor 192.168.111.20 remote-as").count(), 1);
    assert_eq!(cfg.matches("neighbor 192.168.111.20 activate").count(), 1);
    assert_eq!(cfg.matches("network 192.168.1.0/24").count(), 1);
    assert_eq!(
        spec.static_networks(IpFamily::V4),
        vec![net("192.168.1.0/24"), net("192.169.1.1/32")]
    );
}

#[test]
fn ebgp() {
    let mut spec = spec().with_peers([ip("192.168.111.20")]);
    spec.peer_asn = Some(64513);
    assert!(!spec.is_ibgp());
    let cfg = render_config(&spec).unwrap();
    assert!(cfg.contains(" neighbor 192.168.111.20 remote-as 64513\n"));
    assert!(!cfg.contains("route-reflector-client"));
    assert!(cfg.contains("  neighbor 192.168.111.20 next-hop-self\n"));
}

#[test]
fn vrf_instance() {
    let spec = spec().with_peers([ip("192.168.111.20")]).with_vrf(VrfSpec {
        name: "blue".to_string(),
        peers_v4: vec![ip("192.168.222.20")],
        peers_v6: vec![],
    });
    let cfg = render_config(&spec).unwrap();
    assert_eq!(cfg.matches("router bgp 64512").count(), 2);
    let vrf = &cfg[cfg.find("router bgp 64512 vrf blue\n").unwrap()..];
    assert!(vrf.contains(" neighbor 192.168.222.20 remote-as 64512\n"));
    assert!(!vrf.contains("192.168.111.20"));
    assert!(vrf.contains("  network 192.168.1.0/24\n"));

    let spec = spec.with_vrf(VrfSpec {
        name: "blue vrf".to_string(),
        peers_v4: vec![],
        peers_v6: vec![],
    });
    assert_eq!(
        render_config(&spec),
        Err(RenderError::InvalidVrfName("blue vrf".to_string()))
    );
}

#[test]
fn vrf_from_config() {
    let config: LabConfig = "[router]\n[router.vrf]\nname = \"red\"\npeers_v4 = [\"192.168.222.21\"]\n"
        .parse()
        .unwrap();
    let router = RouterSpec::from_config(&config.router).with_peers([ip("192.168.111.21")]);
    assert_eq!(
        router.vrf,
        Some(VrfSpec {
            name: "red".to_string(),
            peers_v4: vec![ip("192.168.222.21")],
            peers_v6: vec![],
        })
    );
    let cfg = render_config(&router).unwrap();
    let (default, vrf) = cfg.split_at(cfg.find("router bgp 64512 vrf red\n").unwrap());
    assert!(default.contains(" neighbor 192.168.111.21 remote-as 64512\n"));
    assert!(vrf.contains(" neighbor 192.168.222.21 remote-as 64512\n"));
    assert!(!vrf.contains("192.168.111.21"));

    // without a VRF section, only the default instance is rendered
    assert_eq!(spec().vrf, None);
}

#[test]
fn wrong_family() {
    let mut spec = spec();
    spec.peers_v4.push(ip("fd2e:6f44:5dd8:c956::14"));
    assert_eq!(
        render_config(&spec),
        Err(RenderError::WrongFamily(
            ip("fd2e:6f44:5dd8:c956::14"),
            IpFamily::V4
        ))
    );
}

#[test]
fn family_without_static_networks() {
    let mut spec = spec().with_peers([ip("fd2e:6f44:5dd8:c956::14")]);
    spec.static_networks.retain(|n| matches!(n, IpNet::V4(_)));
    assert_eq!(
        render_config(&spec),
        Err(RenderError::NoStaticNetworks(IpFamily::V6))
    );
}

#[test]
fn daemons() {
    assert_eq!(enabled_daemons(), vec!["bgpd", "bfdd"]);
    assert!(DAEMONS.contains("\nvtysh_enable=yes\n"));
    assert!(DAEMONS.contains("\nzebra_options=\"  -A 127.0.0.1 -s 90000000\"\n"));
    assert!(DAEMONS.contains("\nospfd=no\n"));
}
