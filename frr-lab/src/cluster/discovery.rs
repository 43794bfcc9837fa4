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

//! Discover the topology of the cluster: its stack type, the nodes with their addresses and the
//! pod subnets allocated to every node.

use std::{collections::BTreeMap, net::IpAddr};

use ipnet::IpNet;
use serde::Deserialize;
use serde_json::json;

use super::{ClusterError, ClusterSession};
use crate::topology::{NetworkName, Node, StackType, Topology};

/// Annotation holding the pod subnets of a node, per network.
pub const NODE_SUBNETS_ANNOTATION: &str = "k8s.ovn.org/node-subnets";

/// Minimal view of `oc get nodes -o json`.
#[derive(Debug, Deserialize)]
struct NodeList {
    items: Vec<NodeObject>,
}

#[derive(Debug, Deserialize)]
struct NodeObject {
    metadata: ObjectMeta,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

/// Older releases store a single CIDR per network, newer ones a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(x) => vec![x],
            OneOrMany::Many(x) => x,
        }
    }
}

/// Parse the value of the `k8s.ovn.org/node-subnets` annotation into the subnets per network.
/// Keys that are neither `default` nor `<namespace>_<name>` are skipped.
pub fn parse_node_subnets(annotation: &str) -> Result<Vec<(NetworkName, IpNet)>, ClusterError> {
    let raw: BTreeMap<String, OneOrMany> = serde_json::from_str(annotation)?;
    let mut result = Vec::new();
    for (key, subnets) in raw {
        let network = match NetworkName::from_annotation_key(&key) {
            Some(n) => n,
            None => {
                log::debug!("[cluster] skip unknown network {key:?} in {NODE_SUBNETS_ANNOTATION}");
                continue;
            }
        };
        for subnet in subnets.into_vec() {
            let net: IpNet = subnet.parse().map_err(|_| ClusterError::Parse {
                what: "pod subnet",
                value: subnet.clone(),
            })?;
            result.push((network.clone(), net));
        }
    }
    Ok(result)
}

/// Parse the JSON output of `oc get nodes -o json` into nodes. Only `InternalIP` addresses are
/// considered, one per family (the first one wins).
pub fn parse_nodes(json: &str) -> Result<Vec<Node>, ClusterError> {
    let list: NodeList = serde_json::from_str(json)?;
    list.items
        .into_iter()
        .map(|obj| {
            let mut node = Node::new(obj.metadata.name.clone());
            let mut seen_v4 = false;
            let mut seen_v6 = false;
            for addr in obj.status.addresses.iter().filter(|a| a.kind == "InternalIP") {
                let ip: IpAddr = addr.address.parse().map_err(|_| ClusterError::Parse {
                    what: "node address",
                    value: addr.address.clone(),
                })?;
                let seen = if ip.is_ipv4() {
                    &mut seen_v4
                } else {
                    &mut seen_v6
                };
                if !*seen {
                    *seen = true;
                    node.set_address(ip);
                }
            }
            if let Some(annotation) = obj.metadata.annotations.get(NODE_SUBNETS_ANNOTATION) {
                for (network, subnet) in parse_node_subnets(annotation)? {
                    node.assign_subnet(network, subnet)?;
                }
            }
            Ok::<_, ClusterError>(node)
        })
        .collect()
}

/// Egress IP assignment as reported in `.status.items` of an `EgressIP` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EgressIpAssignment {
    /// The node hosting the egress IP.
    pub node: String,
    /// The assigned address.
    #[serde(rename = "egressIP")]
    pub egress_ip: IpAddr,
}

/// Parse the `.status.items` of an `EgressIP` object, given as JSON.
pub fn parse_egress_ip_status(json: &str) -> Result<Vec<EgressIpAssignment>, ClusterError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(json)?)
}

impl ClusterSession {
    /// Derive the stack type from the service network of the cluster network operator.
    pub async fn stack_type(&self) -> Result<StackType, ClusterError> {
        let service_network = self
            .jsonpath(
                "network.operator",
                None,
                "cluster",
                "{.spec.serviceNetwork}",
            )
            .await?;
        let stack = StackType::from_service_network(&service_network)?;
        log::debug!("[cluster] stack type is {stack} ({service_network})");
        Ok(stack)
    }

    /// Get all nodes, optionally restricted by a label selector.
    pub async fn nodes(&self, selector: Option<&str>) -> Result<Vec<Node>, ClusterError> {
        let mut args = vec!["get", "nodes", "-ojson"];
        if let Some(selector) = selector {
            args.extend(["-l", selector]);
        }
        parse_nodes(&self.run(&args).await?)
    }

    /// Discover the full topology. Failing to do so is fatal, as there is nothing to verify
    /// without it.
    pub async fn discover_topology(&self) -> Result<Topology, ClusterError> {
        let stack = self.stack_type().await?;
        let nodes = self.nodes(None).await?;
        log::info!(
            "[cluster] discovered {} nodes on a {stack} cluster",
            nodes.len()
        );
        Ok(Topology::new(stack, nodes)?)
    }

    /// Check whether FRR is an additional routing provider and route advertisements are enabled.
    pub async fn route_advertisements_enabled(&self) -> Result<bool, ClusterError> {
        let providers = self
            .jsonpath(
                "network.operator",
                None,
                "cluster",
                "{.spec.additionalRoutingCapabilities.providers}",
            )
            .await?;
        let enabled = self
            .jsonpath(
                "network.operator",
                None,
                "cluster",
                "{.spec.defaultNetwork.ovnKubernetesConfig.routeAdvertisements}",
            )
            .await?;
        Ok(providers.contains("FRR") && enabled == "Enabled")
    }

    /// Enable FRR as routing provider and turn on route advertisements.
    pub async fn enable_route_advertisements(&self) -> Result<(), ClusterError> {
        log::info!("[cluster] enabling FRR route advertisements");
        let patch = json!({
            "spec": {
                "additionalRoutingCapabilities": { "providers": ["FRR"] },
                "defaultNetwork": { "ovnKubernetesConfig": { "routeAdvertisements": "Enabled" } }
            }
        })
        .to_string();
        self.run(&[
            "patch",
            "network.operator",
            "cluster",
            "--type=merge",
            "-p",
            patch.as_str(),
        ])
        .await?;
        Ok(())
    }

    /// Current assignments of an egress IP object.
    pub async fn egress_ip_assignments(
        &self,
        name: &str,
    ) -> Result<Vec<EgressIpAssignment>, ClusterError> {
        let json = self
            .jsonpath("egressip", None, name, "{.status.items}")
            .await?;
        parse_egress_ip_status(&json)
    }
}
