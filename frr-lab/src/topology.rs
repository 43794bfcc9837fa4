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

//! In-memory model of the cluster nodes: their addresses per IP family and the pod subnets they
//! were allocated per logical network.

use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use ipnet::IpNet;
use itertools::Itertools;
use thiserror::Error;

/// An IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl IpFamily {
    /// Family of an address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Family of a network.
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("ipv4"),
            Self::V6 => f.write_str("ipv6"),
        }
    }
}

/// The IP stack of the cluster. It is derived once from the service network and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackType {
    /// Only IPv4 is active.
    Ipv4,
    /// Only IPv6 is active.
    Ipv6,
    /// Both families are active.
    DualStack,
}

impl StackType {
    /// Derive the stack type from the service network of the cluster network operator, as printed
    /// by `jsonpath={.spec.serviceNetwork}` (e.g. `["172.30.0.0/16","fd02::/112"]`).
    pub fn from_service_network(service_network: &str) -> Result<Self, TopologyError> {
        let colons = service_network.matches(':').count();
        let dots = service_network.matches('.').count();
        match (colons, dots) {
            (c, d) if c >= 2 && d >= 2 => Ok(Self::DualStack),
            (c, 0) if c > 0 => Ok(Self::Ipv6),
            (0, d) if d > 0 => Ok(Self::Ipv4),
            _ => Err(TopologyError::UnknownStackType(service_network.to_string())),
        }
    }

    /// All families that are active, IPv4 first.
    pub fn families(&self) -> &'static [IpFamily] {
        match self {
            Self::Ipv4 => &[IpFamily::V4],
            Self::Ipv6 => &[IpFamily::V6],
            Self::DualStack => &[IpFamily::V4, IpFamily::V6],
        }
    }

    /// Check if the family is active.
    pub fn has(&self, family: IpFamily) -> bool {
        self.families().contains(&family)
    }
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4 => f.write_str("ipv4single"),
            Self::Ipv6 => f.write_str("ipv6single"),
            Self::DualStack => f.write_str("dualstack"),
        }
    }
}

/// A logical pod network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkName {
    /// The cluster default network.
    Default,
    /// A user-defined network in a namespace.
    UserDefined {
        /// Namespace of the network.
        namespace: String,
        /// Name of the network.
        name: String,
    },
}

impl NetworkName {
    /// Create a user-defined network name.
    pub fn user_defined(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::UserDefined {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of this network in the `k8s.ovn.org/node-subnets` annotation.
    pub fn annotation_key(&self) -> String {
        match self {
            Self::Default => "default".to_string(),
            Self::UserDefined { namespace, name } => format!("{namespace}_{name}"),
        }
    }

    /// Parse a key of the `k8s.ovn.org/node-subnets` annotation. Keys without a `_` separator
    /// other than `default` are not user-defined networks and yield `None`.
    pub fn from_annotation_key(key: &str) -> Option<Self> {
        if key == "default" {
            return Some(Self::Default);
        }
        let (namespace, name) = key.split_once('_')?;
        if namespace.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::user_defined(namespace, name))
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::UserDefined { namespace, name } => write!(f, "{namespace}/{name}"),
        }
    }
}

impl FromStr for NetworkName {
    type Err = TopologyError;

    /// Parse `default` or `<namespace>/<name>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "default" {
            return Ok(Self::Default);
        }
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::user_defined(ns, name))
            }
            _ => Err(TopologyError::InvalidNetworkName(s.to_string())),
        }
    }
}

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
    subnets: BTreeMap<(NetworkName, IpFamily), IpNet>,
}

impl Node {
    /// Create a node without any addresses or subnets.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            v4: None,
            v6: None,
            subnets: BTreeMap::new(),
        }
    }

    /// Builder variant of [`Node::set_address`]. A second address of the same family replaces the
    /// first one.
    pub fn with_address(mut self, addr: impl Into<IpAddr>) -> Self {
        self.set_address(addr.into());
        self
    }

    /// Builder variant of [`Node::assign_subnet`].
    pub fn with_subnet(
        mut self,
        network: NetworkName,
        subnet: IpNet,
    ) -> Result<Self, TopologyError> {
        self.assign_subnet(network, subnet)?;
        Ok(self)
    }

    /// Set the address of the node for the family of `addr`.
    pub fn set_address(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(a) => self.v4 = Some(a),
            IpAddr::V6(a) => self.v6 = Some(a),
        }
    }

    /// Assign the pod subnet of a network. Each (network, family) pair can only be assigned once.
    pub fn assign_subnet(&mut self, network: NetworkName, subnet: IpNet) -> Result<(), TopologyError> {
        let family = IpFamily::of_net(&subnet);
        let key = (network, family);
        if let Some(old) = self.subnets.get(&key) {
            return Err(TopologyError::DuplicateSubnet {
                node: self.name.clone(),
                network: key.0,
                family,
                existing: *old,
                new: subnet,
            });
        }
        self.subnets.insert(key, subnet.trunc());
        Ok(())
    }

    /// Name of the node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the node in the given family.
    pub fn address(&self, family: IpFamily) -> Option<IpAddr> {
        match family {
            IpFamily::V4 => self.v4.map(IpAddr::V4),
            IpFamily::V6 => self.v6.map(IpAddr::V6),
        }
    }

    /// Pod subnet of the node in the given network and family.
    pub fn subnet(&self, network: &NetworkName, family: IpFamily) -> Option<IpNet> {
        self.subnets.get(&(network.clone(), family)).copied()
    }

    /// All networks for which this node has at least one subnet.
    pub fn networks(&self) -> impl Iterator<Item = &NetworkName> {
        self.subnets.keys().map(|(n, _)| n).dedup()
    }
}

/// A route the cluster is expected to advertise: the pod subnet of `node`, reachable via the
/// node's address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdvertisedRoute {
    /// The node owning the subnet.
    pub node: String,
    /// The pod subnet.
    pub subnet: IpNet,
    /// Address of the node, in the family of the subnet.
    pub next_hop: IpAddr,
}

/// A validated set of nodes together with the stack type of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    stack: StackType,
    nodes: Vec<Node>,
}

impl Topology {
    /// Build a topology. Every node must carry an address for every active family, and node names
    /// must be unique. Nodes are sorted by name.
    pub fn new(stack: StackType, mut nodes: Vec<Node>) -> Result<Self, TopologyError> {
        if nodes.is_empty() {
            return Err(TopologyError::NoNodes);
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(w) = nodes.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(TopologyError::DuplicateNode(w[0].name.clone()));
        }
        for node in nodes.iter() {
            for family in stack.families() {
                if node.address(*family).is_none() {
                    return Err(TopologyError::MissingAddress {
                        node: node.name.clone(),
                        family: *family,
                    });
                }
            }
        }
        Ok(Self { stack, nodes })
    }

    /// The stack type of the cluster.
    pub fn stack(&self) -> StackType {
        self.stack
    }

    /// Active families.
    pub fn families(&self) -> &'static [IpFamily] {
        self.stack.families()
    }

    /// All nodes, sorted by name.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Get a node by name.
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Addresses of all nodes in the given family, used as the peer list of the external router.
    /// Returns an empty list if the family is not active.
    pub fn peers(&self, family: IpFamily) -> Vec<IpAddr> {
        if !self.stack.has(family) {
            return Vec::new();
        }
        self.nodes
            .iter()
            .filter_map(|n| n.address(family))
            .collect()
    }

    /// All routes that advertising `network` should produce, one per node per active family.
    /// Nodes without a subnet for that network and family are skipped.
    pub fn advertised_routes(&self, network: &NetworkName) -> Vec<AdvertisedRoute> {
        self.stack
            .families()
            .iter()
            .flat_map(|family| {
                self.nodes.iter().filter_map(move |n| {
                    Some(AdvertisedRoute {
                        node: n.name.clone(),
                        subnet: n.subnet(network, *family)?,
                        next_hop: n.address(*family)?,
                    })
                })
            })
            .collect()
    }
}

/// Error while building the topology.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// The service network contains neither IPv4 nor IPv6 addresses.
    #[error("Cannot derive the stack type from the service network {0:?}")]
    UnknownStackType(String),
    /// A network name is neither `default` nor `<namespace>/<name>`.
    #[error("Invalid network name {0:?}, expected `default` or `<namespace>/<name>`")]
    InvalidNetworkName(String),
    /// The topology does not contain any node.
    #[error("The topology does not contain any node")]
    NoNodes,
    /// Two nodes have the same name.
    #[error("Node {0} appears twice")]
    DuplicateNode(String),
    /// A node has no address for an active family.
    #[error("Node {node} has no {family} address")]
    MissingAddress {
        /// The node
        node: String,
        /// The missing family
        family: IpFamily,
    },
    /// A subnet was assigned twice.
    #[error("Node {node} already has the {family} subnet {existing} in network {network} (cannot assign {new})")]
    DuplicateSubnet {
        /// The node
        node: String,
        /// The network
        network: NetworkName,
        /// The family
        family: IpFamily,
        /// Subnet that was assigned first
        existing: IpNet,
        /// Subnet that was rejected
        new: IpNet,
    },
}
