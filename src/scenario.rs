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

//! Scenarios that declare route advertisements and verify their effect.
//!
//! A scenario only talks to an [`Environment`]: it can declare and delete route advertisements,
//! change labels, and wait for a [`Plan`] to converge. [`crate::lab::Lab`] is the environment of a
//! real cluster. Every scenario restores the labels it changed and deletes the route advertisement
//! it declared, even if a verification fails.

use std::{collections::BTreeMap, fmt, net::IpAddr, str::FromStr, time::Duration};

use async_trait::async_trait;
use frr_lab::{
    cluster::{discovery::EgressIpAssignment, Advertisement, NetworkSelector, RouteAdvertisement},
    poller::{ConvergenceOutcome, Plan, PollSettings},
    topology::{IpFamily, NetworkName, Node, Topology, TopologyError},
};
use ipnet::IpNet;

use crate::{report::ScenarioReport, verify, Error};

/// Resource name of cluster user-defined networks.
pub const CUDN: &str = "clusteruserdefinednetwork";
/// Resource name of nodes.
pub const NODE: &str = "node";
/// Label marking a node as eligible to host egress IPs.
pub const EGRESS_ASSIGNABLE: &str = "k8s.ovn.org/egress-assignable";

/// Everything a scenario needs from the cluster and the external router.
#[async_trait]
pub trait Environment: Send + Sync {
    /// The topology of the cluster.
    fn topology(&self) -> &Topology;

    /// Addresses of the external router the nodes peer with, one per active family.
    fn router_addresses(&self) -> &[IpAddr];

    /// Static networks originated by the external router.
    fn static_networks(&self) -> &[IpNet];

    /// Sample until all expectations of the plan hold in the same round, or until the timeout.
    async fn converge(&self, plan: &Plan, settings: PollSettings) -> ConvergenceOutcome;

    /// Declare the route advertisement and wait until it is accepted.
    async fn advertise(&self, ra: &RouteAdvertisement) -> Result<(), Error>;

    /// Delete the route advertisement. Deleting a missing one is not an error.
    async fn withdraw(&self, ra: &RouteAdvertisement) -> Result<(), Error>;

    /// Labels of a cluster scoped object.
    async fn labels(&self, kind: &str, name: &str) -> Result<BTreeMap<String, String>, Error>;

    /// Set a label on a cluster scoped object.
    async fn label(&self, kind: &str, name: &str, key: &str, value: &str) -> Result<(), Error>;

    /// Remove a label from a cluster scoped object.
    async fn unlabel(&self, kind: &str, name: &str, key: &str) -> Result<(), Error>;

    /// Current assignments of an egress IP object.
    async fn egress_assignments(&self, name: &str) -> Result<Vec<EgressIpAssignment>, Error>;

    /// Restart a cluster component and wait until its pods are ready again.
    async fn disrupt(&self, disruption: Disruption) -> Result<(), Error>;
}

/// A cluster component restarted while routes are advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disruption {
    /// Delete the BGP agent pods and the FRR configuration webhook.
    FrrK8s,
    /// Delete the OVN-Kubernetes pods of all nodes.
    OvnKubernetes,
}

impl FromStr for Disruption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frr-k8s" | "frr" => Ok(Self::FrrK8s),
            "ovnkube-node" | "ovn" => Ok(Self::OvnKubernetes),
            _ => Err(format!(
                "unknown disruption {s:?}, expected `frr-k8s` or `ovnkube-node`"
            )),
        }
    }
}

impl fmt::Display for Disruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrrK8s => f.write_str("restart of the frr-k8s pods"),
            Self::OvnKubernetes => f.write_str("restart of the ovnkube-node pods"),
        }
    }
}

/// A label, parsed from `key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    /// The key
    pub key: String,
    /// The value, possibly empty
    pub value: String,
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Self {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(format!("invalid label {s:?}, expected `key=value`")),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Network of a cluster user-defined network, as it appears in the node subnets.
pub fn cudn_network(cudn: &str) -> NetworkName {
    NetworkName::user_defined("cluster", format!("udn_{cudn}"))
}

/// Converge the plan, record the outcome and fail if it did not converge.
async fn check<E: Environment + ?Sized>(
    env: &E,
    report: &mut ScenarioReport,
    plan: &Plan,
    settings: PollSettings,
) -> Result<(), Error> {
    let outcome = env.converge(plan, settings).await;
    report.record(plan, settings, &outcome);
    verify::ensure_converged(plan, &outcome)
}

/// Wait for one more interval and check the plan exactly once.
async fn check_stable<E: Environment + ?Sized>(
    env: &E,
    report: &mut ScenarioReport,
    plan: &Plan,
    settings: PollSettings,
) -> Result<(), Error> {
    tokio::time::sleep(settings.interval).await;
    let mut stable = Plan::new(format!("{} (stable)", plan.description()));
    stable.extend(plan.clone());
    let once = PollSettings {
        interval: settings.interval,
        timeout: Duration::ZERO,
    };
    check(env, report, &stable, once).await
}

/// Value of a label before a scenario changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SavedLabel<'a> {
    kind: &'static str,
    name: &'a str,
    key: &'a str,
    value: Option<String>,
}

impl<'a> SavedLabel<'a> {
    async fn read<E: Environment + ?Sized>(
        env: &E,
        kind: &'static str,
        name: &'a str,
        key: &'a str,
    ) -> Result<SavedLabel<'a>, Error> {
        let value = env.labels(kind, name).await?.remove(key);
        Ok(Self {
            kind,
            name,
            key,
            value,
        })
    }

    /// Set the label back to its saved value, or remove it if it was not set.
    async fn restore<E: Environment + ?Sized>(&self, env: &E) -> Result<(), Error> {
        match self.value.as_deref() {
            Some(value) => env.label(self.kind, self.name, self.key, value).await,
            None => env.unlabel(self.kind, self.name, self.key).await,
        }
    }
}

fn warn_cleanup(what: &str, result: Result<(), Error>) {
    if let Err(e) = result {
        log::warn!("[scenario] cannot {what}: {e}");
    }
}

/// Advertise the default network from all nodes and verify the full mesh. Then, delete the route
/// advertisement and verify that all routes of the default network disappear and stay away.
pub async fn default_network<E: Environment + ?Sized>(
    env: &E,
    ra_name: &str,
    report: &mut ScenarioReport,
) -> Result<(), Error> {
    let topo = env.topology();
    let network = NetworkName::Default;
    verify::require_subnets(topo, &network)?;
    let ra = RouteAdvertisement::new(ra_name, NetworkSelector::DefaultNetwork);

    let result: Result<(), Error> = async {
        log::info!("[scenario] advertise network {network} with {}", ra.name);
        env.advertise(&ra).await?;
        check(
            env,
            report,
            &verify::external_neighbors(topo),
            PollSettings::NEIGHBOR,
        )
        .await?;
        let mesh = verify::mesh(
            topo,
            &network,
            env.static_networks(),
            env.router_addresses(),
        );
        check(env, report, &mesh, PollSettings::ROUTE_PROPAGATION).await?;

        log::info!("[scenario] withdraw network {network}");
        env.withdraw(&ra).await?;
        let withdrawn = verify::routes(topo, &network, false);
        check(env, report, &withdrawn, PollSettings::ROUTE_PROPAGATION).await?;
        check_stable(env, report, &withdrawn, PollSettings::ROUTE_PROPAGATION).await
    }
    .await;

    if result.is_err() {
        warn_cleanup("delete the route advertisement", env.withdraw(&ra).await);
    }
    result
}

/// Options of the [`selector`] scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorOptions {
    /// Name of the route advertisement
    pub ra_name: String,
    /// The network selector of the route advertisement
    pub label: Label,
    /// Cluster user-defined network that carries the label
    pub selected: String,
    /// Cluster user-defined network that does not carry the label
    pub other: String,
}

/// Advertise only the networks carrying a label. The selected network must be visible everywhere,
/// while the other network must be absent from every sampled table in the same round.
pub async fn selector<E: Environment + ?Sized>(
    env: &E,
    opts: &SelectorOptions,
    report: &mut ScenarioReport,
) -> Result<(), Error> {
    let topo = env.topology();
    if opts.selected == opts.other {
        return Err(Error::InvalidScenario(format!(
            "network {} cannot be selected and not selected at the same time",
            opts.selected
        )));
    }
    let selected = cudn_network(&opts.selected);
    let other = cudn_network(&opts.other);
    verify::require_subnets(topo, &selected)?;
    verify::require_subnets(topo, &other)?;

    let ra = RouteAdvertisement::new(
        opts.ra_name.as_str(),
        NetworkSelector::labels(opts.label.key.as_str(), opts.label.value.as_str()),
    );
    let saved = [
        SavedLabel::read(env, CUDN, &opts.selected, &opts.label.key).await?,
        SavedLabel::read(env, CUDN, &opts.other, &opts.label.key).await?,
    ];

    let result: Result<(), Error> = async {
        log::info!(
            "[scenario] select {} with {}, but not {}",
            opts.selected,
            opts.label,
            opts.other
        );
        env.label(CUDN, &opts.selected, &opts.label.key, &opts.label.value)
            .await?;
        env.unlabel(CUDN, &opts.other, &opts.label.key).await?;
        env.advertise(&ra).await?;

        let mut plan = Plan::new(format!("only network {selected} advertised"));
        plan.extend(verify::routes(topo, &selected, true));
        plan.extend(verify::routes(topo, &other, false));
        check(env, report, &plan, PollSettings::ROUTE_PROPAGATION).await
    }
    .await;

    warn_cleanup("delete the route advertisement", env.withdraw(&ra).await);
    for label in &saved {
        warn_cleanup("restore the network label", label.restore(env).await);
    }
    result
}

/// Options of the [`failover`] scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverOptions {
    /// Name of the route advertisement
    pub ra_name: String,
    /// Name of the egress IP object
    pub egress_ip: String,
    /// Node to move the egress IP to. If `None`, the first other node is used.
    pub target: Option<String>,
}

fn node_address(node: &Node, family: IpFamily) -> Result<IpAddr, Error> {
    node.address(family).ok_or_else(|| {
        TopologyError::MissingAddress {
            node: node.name().to_string(),
            family,
        }
        .into()
    })
}

/// Advertise the egress IP and move it to another node by re-labeling. The external router must
/// switch from the old node to the new one as next hop, without re-creating the route
/// advertisement.
pub async fn failover<E: Environment + ?Sized>(
    env: &E,
    opts: &FailoverOptions,
    report: &mut ScenarioReport,
) -> Result<(), Error> {
    let topo = env.topology();
    let assignment = env
        .egress_assignments(&opts.egress_ip)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NoEgressAssignment(opts.egress_ip.clone()))?;
    let egress_ip = assignment.egress_ip;
    let family = IpFamily::of(&egress_ip);

    let from = topo
        .node(&assignment.node)
        .ok_or_else(|| Error::UnknownNode(assignment.node.clone()))?;
    let to = match opts.target.as_ref() {
        Some(name) => topo
            .node(name)
            .ok_or_else(|| Error::UnknownNode(name.clone()))?,
        None => topo
            .nodes()
            .iter()
            .find(|n| n.name() != from.name())
            .ok_or_else(|| Error::NoFailoverTarget(from.name().to_string()))?,
    };
    if to.name() == from.name() {
        return Err(Error::NoFailoverTarget(from.name().to_string()));
    }
    let from_addr = node_address(from, family)?;
    let to_addr = node_address(to, family)?;
    let saved = [
        SavedLabel::read(env, NODE, from.name(), EGRESS_ASSIGNABLE).await?,
        SavedLabel::read(env, NODE, to.name(), EGRESS_ASSIGNABLE).await?,
    ];

    let ra = RouteAdvertisement::new(opts.ra_name.as_str(), NetworkSelector::DefaultNetwork)
        .with_advertisements([Advertisement::PodNetwork, Advertisement::EgressIp]);

    let result: Result<(), Error> = async {
        log::info!(
            "[scenario] advertise egress IP {egress_ip} hosted on {}",
            from.name()
        );
        env.advertise(&ra).await?;
        check(
            env,
            report,
            &verify::egress_route(egress_ip, from_addr, true),
            PollSettings::ROUTE_PROPAGATION,
        )
        .await?;

        log::info!(
            "[scenario] move egress IP {egress_ip} from {} to {}",
            from.name(),
            to.name()
        );
        env.label(NODE, to.name(), EGRESS_ASSIGNABLE, "").await?;
        env.unlabel(NODE, from.name(), EGRESS_ASSIGNABLE).await?;

        let mut plan = Plan::new(format!(
            "egress IP {egress_ip} moved from {} to {}",
            from.name(),
            to.name()
        ));
        plan.extend(verify::egress_route(egress_ip, from_addr, false));
        plan.extend(verify::egress_route(egress_ip, to_addr, true));
        check(env, report, &plan, PollSettings::FAILOVER).await
    }
    .await;

    for label in &saved {
        warn_cleanup("restore the egress label", label.restore(env).await);
    }
    warn_cleanup("delete the route advertisement", env.withdraw(&ra).await);
    result
}

/// Options of the [`recovery`] scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Name of the route advertisement
    pub ra_name: String,
    /// The component to restart
    pub disruption: Disruption,
}

/// Advertise the default network and verify the full mesh. Then, restart a cluster component while
/// the route advertisement stays in place, and verify that the full mesh is restored.
pub async fn recovery<E: Environment + ?Sized>(
    env: &E,
    opts: &RecoveryOptions,
    report: &mut ScenarioReport,
) -> Result<(), Error> {
    let topo = env.topology();
    let network = NetworkName::Default;
    verify::require_subnets(topo, &network)?;
    let ra = RouteAdvertisement::new(opts.ra_name.as_str(), NetworkSelector::DefaultNetwork);
    let mesh = verify::mesh(
        topo,
        &network,
        env.static_networks(),
        env.router_addresses(),
    );

    let result: Result<(), Error> = async {
        log::info!("[scenario] advertise network {network} with {}", ra.name);
        env.advertise(&ra).await?;
        check(
            env,
            report,
            &verify::external_neighbors(topo),
            PollSettings::NEIGHBOR,
        )
        .await?;
        check(env, report, &mesh, PollSettings::ROUTE_PROPAGATION).await?;

        log::info!("[scenario] {}", opts.disruption);
        env.disrupt(opts.disruption).await?;

        let mut recovered = Plan::new(format!(
            "full mesh of network {network} after {}",
            opts.disruption
        ));
        recovered.extend(mesh.clone());
        check(env, report, &recovered, PollSettings::ROUTE_PROPAGATION).await
    }
    .await;

    warn_cleanup("delete the route advertisement", env.withdraw(&ra).await);
    result
}
