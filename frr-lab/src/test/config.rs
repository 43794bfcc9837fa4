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

use std::{net::Ipv4Addr, path::PathBuf};

use pretty_assertions::assert_eq;
use test_log::test;

use crate::config::{ConfigError, LabConfig, VrfConfig};

#[test]
fn parse_lab_config() {
    let config: LabConfig = include_str!("files/lab.toml").parse().unwrap();
    config.validate().unwrap();

    assert_eq!(config.host.ssh_name, "hypervisor.example.com");
    assert_eq!(config.host.user.as_deref(), Some("root"));
    assert_eq!(
        config.host.identity_file,
        Some(PathBuf::from("/home/ci/.ssh/id_rsa"))
    );
    assert_eq!(config.host.staging_prefix, "/tmp/bgp-test-frr-");

    assert_eq!(config.router.asn, 64512);
    assert_eq!(config.router.peer_asn, None);
    assert_eq!(config.router.container_prefix, "bgp-e2e-");
    assert_eq!(config.router.image, "quay.io/frrouting/frr:9.1.2");
    assert_eq!(
        config
            .router
            .static_networks_v4
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>(),
        vec!["192.168.1.0/24", "192.169.1.1/32"]
    );

    assert_eq!(
        config.cluster.kubeconfig,
        Some(PathBuf::from("/home/ci/.kube/config"))
    );
    assert_eq!(config.cluster.oc, "oc");
    assert_eq!(config.cluster.frr_pod_selector, "app=frr-k8s");
}

#[test]
fn defaults() {
    let config: LabConfig = "".parse().unwrap();
    assert_eq!(config.router.asn, 64512);
    assert!(config.router.sudo);
    assert_eq!(config.router.runtime, "podman");
    assert_eq!(config.router.static_networks_v4.len(), 2);
    assert_eq!(
        config.router.static_networks_v6[0].to_string(),
        "2001:db8::/128"
    );
    assert_eq!(config.router.vrf, None);
    assert_eq!(config.cluster.frr_namespace, "openshift-frr-k8s");
    assert_eq!(config.cluster.debug_namespace, "default");
    assert_eq!(
        config.cluster.frr_webhook_selector,
        "component=frr-k8s-webhook-server"
    );
    assert_eq!(config.cluster.ovn_namespace, "openshift-ovn-kubernetes");
    assert_eq!(config.cluster.ovn_pod_selector, "app=ovnkube-node");
}

#[test]
fn vrf_section() {
    let s = "[router.vrf]\nname = \"blue\"\npeers_v4 = [\"192.168.222.20\"]\npeers_v6 = [\"fd00:222::14\"]\n";
    let config: LabConfig = s.parse().unwrap();
    assert_eq!(
        config.router.vrf,
        Some(VrfConfig {
            name: "blue".to_string(),
            peers_v4: vec![Ipv4Addr::new(192, 168, 222, 20)],
            peers_v6: vec!["fd00:222::14".parse().unwrap()],
        })
    );
    // the rest of the router section keeps its defaults
    assert_eq!(config.router.asn, 64512);

    let s = "[host]\nssh_name = \"h\"\n[router.vrf]\nname = \" \"\n";
    let config: LabConfig = s.parse().unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

    let s = "[router.vrf]\npeers_v4 = []\n";
    assert!(matches!(s.parse::<LabConfig>(), Err(ConfigError::Parse(_))));
    let s = "[router.vrf]\nname = \"blue\"\npeers_v4 = [\"fd00::1\"]\n";
    assert!(s.parse::<LabConfig>().is_err());
}

#[test]
fn missing_host() {
    let config: LabConfig = "[router]\nasn = 65000\n".parse().unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::MissingHost)));
}

#[test]
fn reserved_asn() {
    for asn in [0u64, 23456, 4294967295] {
        let s = format!("[router]\nasn = {asn}\n");
        assert!(
            matches!(s.parse::<LabConfig>(), Err(ConfigError::Parse(_))),
            "AS {asn} must be rejected"
        );
    }
    let s = "[router]\nasn = 64512\npeer_asn = 23456\n";
    assert!(s.parse::<LabConfig>().is_err());
    let s = "[router]\nasn = 64512\npeer_asn = 64513\n";
    assert_eq!(s.parse::<LabConfig>().unwrap().router.peer_asn, Some(64513));
}

#[test]
fn unknown_fields() {
    let s = "[router]\nasn = 64512\nnetworks = []\n";
    assert!(matches!(s.parse::<LabConfig>(), Err(ConfigError::Parse(_))));
}

#[test]
fn invalid_network() {
    let s = "[router]\nstatic_networks_v4 = [\"192.168.1.0\"]\n";
    assert!(s.parse::<LabConfig>().is_err());
    let s = "[router]\nstatic_networks_v4 = [\"2001:db8::/64\"]\n";
    assert!(s.parse::<LabConfig>().is_err());
}
