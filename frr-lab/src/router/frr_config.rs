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

//! Rendering of the FRR configuration of the external router.
//!
//! The external router is a route reflector for all cluster nodes. Default address-family
//! activation is disabled, so every family with peers gets two `address-family` blocks: one
//! declaring the static networks the router originates, and one activating the neighbors of that
//! family. A family without peers renders no block at all.

use std::{
    fmt::Write,
    net::{IpAddr, Ipv4Addr},
};

use ipnet::IpNet;
use itertools::Itertools;
use thiserror::Error;

use crate::{
    config::{RouterConfig, VrfConfig},
    topology::IpFamily,
};

/// Desired configuration of the external router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterSpec {
    /// Local AS number.
    pub asn: u32,
    /// AS number of the peers. `None` means the same as [`RouterSpec::asn`] (iBGP).
    pub peer_asn: Option<u32>,
    /// Router ID. If unset, FRR picks one.
    pub router_id: Option<Ipv4Addr>,
    /// IPv4 peers, in the order they are rendered.
    pub peers_v4: Vec<IpAddr>,
    /// IPv6 peers, in the order they are rendered.
    pub peers_v6: Vec<IpAddr>,
    /// Networks originated by the router, of both families.
    pub static_networks: Vec<IpNet>,
    /// Additional BGP instance in a VRF.
    pub vrf: Option<VrfSpec>,
}

/// A BGP instance bound to a VRF. It originates the same static networks as the default instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfSpec {
    /// Name of the VRF
    pub name: String,
    /// IPv4 peers in this VRF
    pub peers_v4: Vec<IpAddr>,
    /// IPv6 peers in this VRF
    pub peers_v6: Vec<IpAddr>,
}

impl From<&VrfConfig> for VrfSpec {
    fn from(config: &VrfConfig) -> Self {
        Self {
            name: config.name.clone(),
            peers_v4: config.peers_v4.iter().copied().map(IpAddr::V4).collect(),
            peers_v6: config.peers_v6.iter().copied().map(IpAddr::V6).collect(),
        }
    }
}

impl RouterSpec {
    /// Create a spec with the AS numbers, static networks and VRF instance of the router
    /// configuration, and no peers in the default instance.
    pub fn from_config(config: &RouterConfig) -> Self {
        Self {
            asn: config.asn,
            peer_asn: config.peer_asn,
            router_id: None,
            peers_v4: Vec::new(),
            peers_v6: Vec::new(),
            static_networks: config
                .static_networks_v4
                .iter()
                .copied()
                .map(IpNet::V4)
                .chain(config.static_networks_v6.iter().copied().map(IpNet::V6))
                .collect(),
            vrf: config.vrf.as_ref().map(VrfSpec::from),
        }
    }

    /// Set the peers. Each address is sorted into the list of its family.
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = IpAddr>) -> Self {
        let (v4, v6): (Vec<_>, Vec<_>) = peers.into_iter().partition(IpAddr::is_ipv4);
        self.peers_v4 = v4;
        self.peers_v6 = v6;
        self
    }

    /// Set the router ID.
    pub fn with_router_id(mut self, router_id: Ipv4Addr) -> Self {
        self.router_id = Some(router_id);
        self
    }

    /// Add a VRF instance.
    pub fn with_vrf(mut self, vrf: VrfSpec) -> Self {
        self.vrf = Some(vrf);
        self
    }

    /// AS number configured on the neighbors.
    pub fn remote_asn(&self) -> u32 {
        self.peer_asn.unwrap_or(self.asn)
    }

    /// Whether the sessions are iBGP. Only iBGP peers are route-reflector clients.
    pub fn is_ibgp(&self) -> bool {
        self.remote_asn() == self.asn
    }

    /// Static networks of the given family, deduplicated in input order.
    pub fn static_networks(&self, family: IpFamily) -> Vec<IpNet> {
        self.static_networks
            .iter()
            .filter(|n| IpFamily::of_net(n) == family)
            .map(IpNet::trunc)
            .unique()
            .collect()
    }

    /// Check that peers are in the list of their family, and that every family with peers has
    /// at least one static network.
    pub fn validate(&self) -> Result<(), RenderError> {
        let instances = std::iter::once((None, &self.peers_v4, &self.peers_v6)).chain(
            self.vrf
                .iter()
                .map(|v| (Some(v.name.as_str()), &v.peers_v4, &v.peers_v6)),
        );
        for (vrf, peers_v4, peers_v6) in instances {
            if let Some(name) = vrf {
                if name.is_empty() || name.contains(char::is_whitespace) {
                    return Err(RenderError::InvalidVrfName(name.to_string()));
                }
            }
            for (family, peers) in [(IpFamily::V4, peers_v4), (IpFamily::V6, peers_v6)] {
                if let Some(p) = peers.iter().find(|p| IpFamily::of(p) != family) {
                    return Err(RenderError::WrongFamily(*p, family));
                }
                if !peers.is_empty() && self.static_networks(family).is_empty() {
                    return Err(RenderError::NoStaticNetworks(family));
                }
            }
        }
        Ok(())
    }
}

/// Render the FRR configuration. The output only depends on the [`RouterSpec`]: rendering the
/// same router twice yields the same text. Duplicate peers and networks are rendered once.
pub fn render_config(spec: &RouterSpec) -> Result<String, RenderError> {
    spec.validate()?;

    let mut c = String::new();
    render_instance(&mut c, spec, None, &spec.peers_v4, &spec.peers_v6)?;
    if let Some(vrf) = spec.vrf.as_ref() {
        render_instance(
            &mut c,
            spec,
            Some(&vrf.name),
            &vrf.peers_v4,
            &vrf.peers_v6,
        )?;
    }
    Ok(c)
}

fn render_instance(
    c: &mut String,
    spec: &RouterSpec,
    vrf: Option<&str>,
    peers_v4: &[IpAddr],
    peers_v6: &[IpAddr],
) -> Result<(), RenderError> {
    let peers_v4 = peers_v4.iter().unique().collect_vec();
    let peers_v6 = peers_v6.iter().unique().collect_vec();

    match vrf {
        Some(name) => writeln!(c, "router bgp {} vrf {}", spec.asn, name)?,
        None => writeln!(c, "router bgp {}", spec.asn)?,
    }
    if let Some(id) = spec.router_id {
        writeln!(c, " bgp router-id {id}")?;
    }
    writeln!(c, " no bgp default ipv4-unicast")?;
    writeln!(c, " no bgp default ipv6-unicast")?;
    writeln!(c, " no bgp network import-check")?;
    for peer in peers_v4.iter().chain(peers_v6.iter()) {
        writeln!(c, " neighbor {} remote-as {}", peer, spec.remote_asn())?;
    }

    for (family, peers) in [(IpFamily::V4, &peers_v4), (IpFamily::V6, &peers_v6)] {
        if peers.is_empty() {
            continue;
        }
        writeln!(c, " !")?;
        writeln!(c, " address-family {family} unicast")?;
        for net in spec.static_networks(family) {
            writeln!(c, "  network {net}")?;
        }
        writeln!(c, " exit-address-family")?;
        writeln!(c, " !")?;
        writeln!(c, " address-family {family} unicast")?;
        for peer in peers.iter() {
            if spec.is_ibgp() {
                writeln!(c, "  neighbor {peer} route-reflector-client")?;
            }
            writeln!(c, "  neighbor {peer} activate")?;
            writeln!(c, "  neighbor {peer} next-hop-self")?;
        }
        writeln!(c, " exit-address-family")?;
    }
    writeln!(c, "exit")?;
    writeln!(c, "!")?;
    Ok(())
}

/// Error while rendering the router configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    /// A peer address is in the list of the other family.
    #[error("Peer {0} is not an {1} address")]
    WrongFamily(IpAddr, IpFamily),
    /// A family has peers, but the router would not originate any network in it.
    #[error("The {0} family has peers but no static networks")]
    NoStaticNetworks(IpFamily),
    /// The VRF name cannot be used in the configuration.
    #[error("Invalid VRF name {0:?}")]
    InvalidVrfName(String),
    /// Formatting Error
    #[error("{0}")]
    Fmt(#[from] std::fmt::Error),
}
