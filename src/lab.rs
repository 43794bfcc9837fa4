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

//! Bring up the external router and peer it with every node of the cluster.

use std::{collections::BTreeMap, net::IpAddr};

use async_trait::async_trait;
use frr_lab::{
    cluster::{
        discovery::EgressIpAssignment, health::NETWORK_OPERATOR, ClusterResource, ClusterSession, FrrConfiguration,
        RouteAdvertisement,
    },
    config::LabConfig,
    poller::{converge, ConvergenceOutcome, Plan, PollSettings},
    router::{discover_router_address, running_routers, ExternalRouter, RouterSpec},
    sampler::LabSampler,
    ssh::SshSession,
    topology::{Topology, TopologyError},
};
use ipnet::IpNet;
use itertools::Itertools;

use crate::{
    scenario::{Disruption, Environment},
    Error,
};

/// Name of the FRR configuration peering the nodes with the external router.
pub const FRR_CONFIGURATION: &str = "receive-all";

/// A running lab: the external router, peered with all nodes of the cluster.
///
/// Call [`Lab::teardown`] when done. If the lab is dropped without, the external router container
/// is still removed, but the FRR configuration stays in the cluster.
#[derive(Debug)]
pub struct Lab {
    cluster: ClusterSession,
    topology: Topology,
    router: ExternalRouter,
    router_addresses: Vec<IpAddr>,
    static_networks: Vec<IpNet>,
    frr_configuration: FrrConfiguration,
}

impl Lab {
    /// Set up the lab:
    ///
    /// 1. Check that route advertisements are enabled on the cluster. If `enable_ra` is set, enable
    ///    them, wait for the network operator to settle, and check again.
    /// 2. Wait for the FRR pods and the FRR configuration webhook to be ready.
    /// 3. Discover the topology of the cluster.
    /// 4. Resolve the address of the host towards the nodes, in every active family.
    /// 5. Start the external router with all nodes as peers.
    /// 6. Declare the FRR configuration that peers every node with the external router.
    ///
    /// Any error is fatal. If the FRR configuration cannot be declared, the router is removed
    /// again.
    pub async fn setup(config: &LabConfig, enable_ra: bool) -> Result<Self, Error> {
        let cluster = ClusterSession::new(config.cluster.clone());
        if !cluster.route_advertisements_enabled().await? {
            if !enable_ra {
                return Err(Error::RouteAdvertisementsDisabled);
            }
            cluster.enable_route_advertisements().await?;
            cluster.await_operator(NETWORK_OPERATOR).await?;
            if !cluster.route_advertisements_enabled().await? {
                return Err(Error::RouteAdvertisementsDisabled);
            }
            log::info!("[lab] route advertisements enabled");
        }
        cluster.await_frr_ready().await?;

        let topology = cluster.discover_topology().await?;

        let session = SshSession::new(&config.host).await?;
        let leftovers = running_routers(&session, &config.router).await?;
        if !leftovers.is_empty() {
            log::warn!(
                "[lab] {} already runs the routers {}",
                session.name(),
                leftovers.iter().join(", ")
            );
        }

        let first = topology.nodes().first().ok_or(TopologyError::NoNodes)?;
        let mut router_addresses = Vec::new();
        for family in topology.families() {
            let node_addr = first
                .address(*family)
                .ok_or_else(|| TopologyError::MissingAddress {
                    node: first.name().to_string(),
                    family: *family,
                })?;
            router_addresses.push(discover_router_address(&session, node_addr).await?);
        }
        log::info!(
            "[lab] external router will peer from {}",
            router_addresses.iter().join(" and ")
        );

        let mut spec = RouterSpec::from_config(&config.router).with_peers(
            topology
                .families()
                .iter()
                .flat_map(|family| topology.peers(*family)),
        );
        if let Some(IpAddr::V4(id)) = router_addresses.iter().find(|a| a.is_ipv4()) {
            spec = spec.with_router_id(*id);
        }

        let mut router =
            ExternalRouter::provision(session, &config.host, &config.router, spec).await?;
        let static_networks = topology
            .families()
            .iter()
            .flat_map(|family| router.spec().static_networks(*family))
            .collect_vec();

        let frr_configuration = FrrConfiguration::new(
            FRR_CONFIGURATION,
            config.cluster.frr_namespace.as_str(),
            router.spec().remote_asn(),
            router.spec().asn,
            router_addresses.iter().copied(),
        );
        if let Err(e) = cluster.declare(&frr_configuration).await {
            if let Err(cleanup) = router.deprovision().await {
                log::warn!("[lab] cannot remove the external router: {cleanup}");
            }
            return Err(e.into());
        }

        Ok(Self {
            cluster,
            topology,
            router,
            router_addresses,
            static_networks,
            frr_configuration,
        })
    }

    /// The cluster session.
    pub fn cluster(&self) -> &ClusterSession {
        &self.cluster
    }

    /// The external router.
    pub fn router(&self) -> &ExternalRouter {
        &self.router
    }

    /// A sampler observing the external router and the nodes.
    pub fn sampler(&self) -> LabSampler<'_> {
        LabSampler::new(&self.router, &self.cluster)
    }

    /// Delete the FRR configuration and remove the external router. Both steps are attempted,
    /// and the first error is returned.
    pub async fn teardown(mut self) -> Result<(), Error> {
        log::info!("[lab] tear down");
        let frr = self.cluster.delete_resource(&self.frr_configuration).await;
        let router = self.router.deprovision().await;
        frr?;
        router?;
        Ok(())
    }
}

#[async_trait]
impl Environment for Lab {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn router_addresses(&self) -> &[IpAddr] {
        &self.router_addresses
    }

    fn static_networks(&self) -> &[IpNet] {
        &self.static_networks
    }

    async fn converge(&self, plan: &Plan, settings: PollSettings) -> ConvergenceOutcome {
        let sampler = self.sampler();
        converge(&sampler, plan, settings).await
    }

    async fn advertise(&self, ra: &RouteAdvertisement) -> Result<(), Error> {
        self.cluster.declare(ra).await?;
        let message = self
            .cluster
            .await_condition(
                RouteAdvertisement::RESOURCE,
                None,
                &ra.name,
                RouteAdvertisement::ACCEPTED,
            )
            .await?;
        log::debug!("[lab] {} accepted: {message}", ra.name);
        Ok(())
    }

    async fn withdraw(&self, ra: &RouteAdvertisement) -> Result<(), Error> {
        Ok(self.cluster.delete_resource(ra).await?)
    }

    async fn labels(&self, kind: &str, name: &str) -> Result<BTreeMap<String, String>, Error> {
        Ok(self.cluster.labels(kind, None, name).await?)
    }

    async fn label(&self, kind: &str, name: &str, key: &str, value: &str) -> Result<(), Error> {
        Ok(self.cluster.label(kind, None, name, key, value).await?)
    }

    async fn unlabel(&self, kind: &str, name: &str, key: &str) -> Result<(), Error> {
        Ok(self.cluster.unlabel(kind, None, name, key).await?)
    }

    async fn egress_assignments(&self, name: &str) -> Result<Vec<EgressIpAssignment>, Error> {
        Ok(self.cluster.egress_ip_assignments(name).await?)
    }

    async fn disrupt(&self, disruption: Disruption) -> Result<(), Error> {
        match disruption {
            Disruption::FrrK8s => self.cluster.restart_frr().await?,
            Disruption::OvnKubernetes => self.cluster.restart_ovn().await?,
        }
        Ok(())
    }
}
