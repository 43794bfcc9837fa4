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

use maplit::btreemap;
use pretty_assertions::assert_eq;
use serde_json::json;
use test_log::test;

use crate::cluster::{
    resources::parse_labels, Advertisement, ClusterResource, Condition, FrrConfiguration,
    NetworkSelector, RouteAdvertisement,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn route_advertisement_default_network() {
    let ra = RouteAdvertisement::new("default", NetworkSelector::DefaultNetwork);
    assert_eq!(RouteAdvertisement::RESOURCE, "routeadvertisements");
    assert_eq!(ra.name(), "default");
    assert_eq!(ra.namespace(), None);
    assert_eq!(
        ra.manifest(),
        json!({
            "apiVersion": "k8s.ovn.org/v1",
            "kind": "RouteAdvertisements",
            "metadata": { "name": "default" },
            "spec": {
                "networkSelectors": [{ "networkSelectionType": "DefaultNetwork" }],
                "advertisements": ["PodNetwork"],
                "nodeSelector": {},
                "frrConfigurationSelector": {}
            }
        })
    );
}

#[test]
fn route_advertisement_selector() {
    let mut ra = RouteAdvertisement::new(
        "blue",
        NetworkSelector::labels("advertise", "true"),
    )
    .with_advertisements([
        Advertisement::EgressIp,
        Advertisement::PodNetwork,
        Advertisement::EgressIp,
    ]);
    ra.node_selector
        .insert("node-role.kubernetes.io/worker".to_string(), String::new());
    let manifest = ra.manifest();
    assert_eq!(
        manifest["spec"]["networkSelectors"],
        json!([{
            "networkSelectionType": "ClusterUserDefinedNetworks",
            "clusterUserDefinedNetworkSelector": {
                "networkSelector": { "matchLabels": { "advertise": "true" } }
            }
        }])
    );
    assert_eq!(
        manifest["spec"]["advertisements"],
        json!(["PodNetwork", "EgressIP"])
    );
    assert_eq!(
        manifest["spec"]["nodeSelector"],
        json!({ "matchLabels": { "node-role.kubernetes.io/worker": "" } })
    );
}

#[test]
fn frr_configuration() {
    let frr = FrrConfiguration::new(
        "receive-all",
        "openshift-frr-k8s",
        64512,
        64512,
        [ip("192.168.111.1"), ip("fd2e:6f44:5dd8:c956::1"), ip("192.168.111.1")],
    )
    .with_label("test", "bgp");
    assert_eq!(FrrConfiguration::RESOURCE, "frrconfigurations");
    assert_eq!(frr.namespace(), Some("openshift-frr-k8s"));
    assert_eq!(
        frr.manifest(),
        json!({
            "apiVersion": "frrk8s.metallb.io/v1beta1",
            "kind": "FRRConfiguration",
            "metadata": {
                "name": "receive-all",
                "namespace": "openshift-frr-k8s",
                "labels": { "test": "bgp" }
            },
            "spec": {
                "nodeSelector": {},
                "bgp": {
                    "routers": [{
                        "asn": 64512,
                        "neighbors": [
                            {
                                "address": "192.168.111.1",
                                "asn": 64512,
                                "disableMP": true,
                                "toReceive": { "allowed": { "mode": "all" } }
                            },
                            {
                                "address": "fd2e:6f44:5dd8:c956::1",
                                "asn": 64512,
                                "disableMP": true,
                                "toReceive": { "allowed": { "mode": "all" } }
                            }
                        ]
                    }]
                }
            }
        })
    );
}

#[test]
fn condition() {
    assert_eq!(Condition::parse("").unwrap(), None);
    let c = Condition::parse(
        r#"{"type":"Accepted","status":"True","reason":"Accepted","message":"ovn-kubernetes cluster-manager validated the resource","lastTransitionTime":"2024-01-01T00:00:00Z"}"#,
    )
    .unwrap()
    .unwrap();
    assert!(c.matches(RouteAdvertisement::ACCEPTED));
    assert!(!c.matches("Rejected"));

    let c = Condition::parse(r#"{"status":"False","reason":"Accepted","message":"waiting"}"#)
        .unwrap()
        .unwrap();
    assert!(!c.matches(RouteAdvertisement::ACCEPTED));
    assert_eq!(c.to_string(), "Accepted (False): waiting");

    let c = Condition::parse(r#"{"status":"True","reason":"NotAccepted"}"#)
        .unwrap()
        .unwrap();
    // the reason only needs to contain the desired value
    assert!(c.matches(RouteAdvertisement::ACCEPTED));
}

#[test]
fn labels() {
    assert!(parse_labels("").unwrap().is_empty());
    assert_eq!(
        parse_labels(r#"{"advertise":"true","kubernetes.io/metadata.name":"blue"}"#).unwrap(),
        btreemap! {
            "advertise".to_string() => "true".to_string(),
            "kubernetes.io/metadata.name".to_string() => "blue".to_string(),
        }
    );
}
