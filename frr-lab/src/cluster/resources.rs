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

//! Declarative resources and the drivers to create, await and delete them.
//!
//! Every driver is idempotent from the point of view of the caller: declaring an existing object
//! re-applies it, and deleting a missing object is a no-op.

use std::{collections::BTreeMap, fmt, net::IpAddr};

use serde::Deserialize;
use serde_json::{json, Value};

use super::{ClusterError, ClusterSession};
use crate::poller::{poll_until, Attempt, PollSettings};

/// A resource that can be declared with `apply -f -`.
pub trait ClusterResource {
    /// Resource name used on the command line, e.g., `routeadvertisements`.
    const RESOURCE: &'static str;

    /// Name of the object.
    fn name(&self) -> &str;

    /// Namespace of the object, or `None` if it is cluster scoped.
    fn namespace(&self) -> Option<&str> {
        None
    }

    /// The full manifest.
    fn manifest(&self) -> Value;
}

/// Which networks a [`RouteAdvertisement`] applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSelector {
    /// The cluster default network.
    DefaultNetwork,
    /// All cluster user-defined networks carrying the label `key=value`.
    Labels {
        /// Label key
        key: String,
        /// Label value
        value: String,
    },
}

impl NetworkSelector {
    /// Select user-defined networks by label.
    pub fn labels(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Labels {
            key: key.into(),
            value: value.into(),
        }
    }

    fn manifest(&self) -> Value {
        match self {
            NetworkSelector::DefaultNetwork => json!({ "networkSelectionType": "DefaultNetwork" }),
            NetworkSelector::Labels { key, value } => json!({
                "networkSelectionType": "ClusterUserDefinedNetworks",
                "clusterUserDefinedNetworkSelector": {
                    "networkSelector": { "matchLabels": { key: value } }
                }
            }),
        }
    }
}

/// What a [`RouteAdvertisement`] advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Advertisement {
    /// The pod subnets of every node.
    PodNetwork,
    /// Egress IPs, from the node hosting them.
    EgressIp,
}

impl Advertisement {
    /// The value in the manifest.
    pub fn as_str(&self) -> &'static str {
        match self {
            Advertisement::PodNetwork => "PodNetwork",
            Advertisement::EgressIp => "EgressIP",
        }
    }
}

impl fmt::Display for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intent to advertise the routes of some networks over BGP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAdvertisement {
    /// Name of the object
    pub name: String,
    /// Networks to advertise
    pub network_selector: NetworkSelector,
    /// What to advertise
    pub advertisements: Vec<Advertisement>,
    /// Nodes that advertise. Empty selects all nodes.
    pub node_selector: BTreeMap<String, String>,
    /// FRR configurations to use. Empty selects all.
    pub frr_configuration_selector: BTreeMap<String, String>,
}

impl RouteAdvertisement {
    /// Reason reported once the object is accepted.
    pub const ACCEPTED: &'static str = "Accepted";

    /// Advertise the pod network of the selected networks from all nodes.
    pub fn new(name: impl Into<String>, network_selector: NetworkSelector) -> Self {
        Self {
            name: name.into(),
            network_selector,
            advertisements: vec![Advertisement::PodNetwork],
            node_selector: BTreeMap::new(),
            frr_configuration_selector: BTreeMap::new(),
        }
    }

    /// Set what to advertise. Duplicates are dropped.
    pub fn with_advertisements(mut self, advertisements: impl IntoIterator<Item = Advertisement>) -> Self {
        self.advertisements = advertisements.into_iter().collect();
        self.advertisements.sort();
        self.advertisements.dedup();
        self
    }
}

impl ClusterResource for RouteAdvertisement {
    const RESOURCE: &'static str = "routeadvertisements";

    fn name(&self) -> &str {
        &self.name
    }

    fn manifest(&self) -> Value {
        json!({
            "apiVersion": "k8s.ovn.org/v1",
            "kind": "RouteAdvertisements",
            "metadata": { "name": self.name },
            "spec": {
                "networkSelectors": [self.network_selector.manifest()],
                "advertisements": self.advertisements.iter().map(Advertisement::as_str).collect::<Vec<_>>(),
                "nodeSelector": label_selector(&self.node_selector),
                "frrConfigurationSelector": label_selector(&self.frr_configuration_selector),
            }
        })
    }
}

/// Peering of the node-local BGP agents with the external router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrrConfiguration {
    /// Name of the object
    pub name: String,
    /// Namespace of the BGP agent
    pub namespace: String,
    /// AS number of the nodes
    pub asn: u32,
    /// Addresses of the external router, of both families
    pub neighbors: Vec<IpAddr>,
    /// AS number of the external router
    pub neighbor_asn: u32,
    /// Labels of the object, matched by the FRR configuration selector of a route advertisement.
    pub labels: BTreeMap<String, String>,
}

impl FrrConfiguration {
    /// Peer all nodes with the given neighbors. The neighbors are deduplicated in order.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        asn: u32,
        neighbor_asn: u32,
        neighbors: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        let mut dedup = Vec::new();
        for n in neighbors {
            if !dedup.contains(&n) {
                dedup.push(n);
            }
        }
        Self {
            name: name.into(),
            namespace: namespace.into(),
            asn,
            neighbors: dedup,
            neighbor_asn,
            labels: BTreeMap::new(),
        }
    }

    /// Add a label to the object.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl ClusterResource for FrrConfiguration {
    const RESOURCE: &'static str = "frrconfigurations";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn manifest(&self) -> Value {
        let neighbors = self
            .neighbors
            .iter()
            .map(|addr| {
                json!({
                    "address": addr.to_string(),
                    "asn": self.neighbor_asn,
                    "disableMP": true,
                    "toReceive": { "allowed": { "mode": "all" } }
                })
            })
            .collect::<Vec<_>>();
        json!({
            "apiVersion": "frrk8s.metallb.io/v1beta1",
            "kind": "FRRConfiguration",
            "metadata": {
                "name": self.name,
                "namespace": self.namespace,
                "labels": self.labels,
            },
            "spec": {
                "nodeSelector": {},
                "bgp": {
                    "routers": [{ "asn": self.asn, "neighbors": neighbors }]
                }
            }
        })
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> Value {
    if labels.is_empty() {
        json!({})
    } else {
        json!({ "matchLabels": labels })
    }
}

/// The first status condition of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Condition {
    /// Machine readable reason
    #[serde(default)]
    pub reason: String,
    /// `True`, `False` or `Unknown`
    #[serde(default)]
    pub status: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
}

impl Condition {
    /// Parse the condition from its JSON representation. Empty output means there is no condition
    /// yet.
    pub fn parse(json: &str) -> Result<Option<Self>, ClusterError> {
        if json.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(serde_json::from_str(json)?))
        }
    }

    /// The reason contains `desired` and the status is `True`.
    pub fn matches(&self, desired: &str) -> bool {
        self.reason.contains(desired) && self.status == "True"
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} ({})", self.reason, self.status)
        } else {
            write!(f, "{} ({}): {}", self.reason, self.status, self.message)
        }
    }
}

/// Parse the labels of an object, as printed by `-ojsonpath={.metadata.labels}`.
pub fn parse_labels(json: &str) -> Result<BTreeMap<String, String>, ClusterError> {
    if json.trim().is_empty() {
        Ok(BTreeMap::new())
    } else {
        Ok(serde_json::from_str(json)?)
    }
}

impl ClusterSession {
    /// Apply the manifest of the resource. The API server may reject the object for a short while
    /// (e.g., while a webhook starts), so this is retried.
    pub async fn declare<R: ClusterResource>(&self, resource: &R) -> Result<(), ClusterError> {
        let manifest = resource.manifest().to_string();
        let what = format!("{} {} to be declared", R::RESOURCE, resource.name());
        log::debug!("[cluster] apply {} {}", R::RESOURCE, resource.name());

        let this = self;
        let manifest = manifest.as_str();
        poll_until(PollSettings::RESOURCE_CREATE, what, move || async move {
            this.run_with_stdin(&["apply", "-f", "-"], manifest).await?;
            Ok::<Attempt<(), String>, ClusterError>(Attempt::Ready(()))
        })
        .await
        .map(|_| ())
        .map_err(|t| ClusterError::Timeout {
            last: t.last(),
            what: t.what,
        })
    }

    /// Wait until the first condition of the object has a reason containing `desired` and status
    /// `True`. Returns the message of the condition.
    pub async fn await_condition(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        desired: &str,
    ) -> Result<String, ClusterError> {
        let what = format!("{kind} {name} to be {desired}");
        let this = self;
        poll_until(PollSettings::RESOURCE_CONDITION, what, move || async move {
            let json = this
                .jsonpath(kind, namespace, name, "{.status.conditions[0]}")
                .await?;
            Ok::<_, ClusterError>(match Condition::parse(&json)? {
                Some(c) if c.matches(desired) => Attempt::Ready(c.message),
                Some(c) => Attempt::Pending(c.to_string()),
                None => Attempt::Pending("no condition reported".to_string()),
            })
        })
        .await
        .map(|polled| polled.value)
        .map_err(|t| ClusterError::Timeout {
            last: t.last(),
            what: t.what,
        })
    }

    /// Names of all objects of a kind.
    pub async fn list_names(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<String>, ClusterError> {
        let mut args = vec!["get", kind, "-ojsonpath={.items[*].metadata.name}"];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        Ok(self
            .run(&args)
            .await?
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    /// Delete an object if it exists, and check that it is gone afterwards.
    pub async fn delete(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), ClusterError> {
        if !self.list_names(kind, namespace).await?.iter().any(|n| n == name) {
            log::debug!("[cluster] {kind} {name} does not exist");
            return Ok(());
        }

        log::debug!("[cluster] delete {kind} {name}");
        let mut args = vec!["delete", kind, name, "--wait=true"];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        self.run(&args).await?;

        if self.list_names(kind, namespace).await?.iter().any(|n| n == name) {
            return Err(ClusterError::StillPresent {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a declared resource. See [`ClusterSession::delete`].
    pub async fn delete_resource<R: ClusterResource>(&self, resource: &R) -> Result<(), ClusterError> {
        self.delete(R::RESOURCE, resource.namespace(), resource.name())
            .await
    }

    /// Labels of an object.
    pub async fn labels(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<BTreeMap<String, String>, ClusterError> {
        parse_labels(&self.jsonpath(kind, namespace, name, "{.metadata.labels}").await?)
    }

    /// Set the label `key=value` on an object and verify it.
    pub async fn label(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError> {
        let label = format!("{key}={value}");
        let mut args = vec!["label", kind, name, label.as_str(), "--overwrite"];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        self.run(&args).await?;

        let labels = self.labels(kind, namespace, name).await?;
        if labels.get(key).map(String::as_str) != Some(value) {
            return Err(ClusterError::Label {
                kind: kind.to_string(),
                name: name.to_string(),
                label,
            });
        }
        Ok(())
    }

    /// Remove the label `key` from an object and verify it.
    pub async fn unlabel(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        key: &str,
    ) -> Result<(), ClusterError> {
        let label = format!("{key}-");
        let mut args = vec!["label", kind, name, label.as_str()];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        self.run(&args).await?;

        if self.labels(kind, namespace, name).await?.contains_key(key) {
            return Err(ClusterError::Label {
                kind: kind.to_string(),
                name: name.to_string(),
                label,
            });
        }
        Ok(())
    }
}
