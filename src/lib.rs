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

//! # OvnkBgpE2e: BGP route-advertisement verification engine
//!
//! This crate verifies that a cluster running OVN-Kubernetes advertises its pod networks (and
//! egress IPs) over BGP. It peers an external FRR router with every node, declares route
//! advertisements, and waits until the routing state of the external router and of every node
//! reflects them.
//!
//! ## Structure
//! - The lab primitives (SSH sessions, the cluster CLI, the external router, samplers, matchers
//!   and the convergence poller) live in the separate crate [`frr_lab`].
//! - The module [`verify`] builds the expectations for a topology: which routes and sessions must
//!   be visible where.
//! - The module [`lab`] sets up the external router and the peering for a cluster ([`lab::Lab`]).
//! - The module [`scenario`] contains the scenarios (default network, network selector, egress IP
//!   failover), written against the [`scenario::Environment`] trait.
//! - The module [`report`] stores the outcome of a scenario as JSON.

#![deny(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![allow(clippy::result_large_err)]

pub mod lab;
pub mod report;
pub mod scenario;
pub mod verify;
#[cfg(test)]
mod test;

use frr_lab::{
    cluster::ClusterError,
    config::ConfigError,
    router::{RenderError, RouterError},
    ssh::SshError,
    topology::{NetworkName, TopologyError},
    FrrLabError,
};
use thiserror::Error;

/// Error of a scenario.
#[derive(Debug, Error)]
pub enum Error {
    /// Error of the lab
    #[error("{0}")]
    Lab(#[from] FrrLabError),
    /// I/O Error
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Route advertisements are disabled on the cluster.
    #[error("Route advertisements are not enabled on the cluster")]
    RouteAdvertisementsDisabled,
    /// The topology knows no subnet of the network, so there is nothing to verify.
    #[error("No node has a pod subnet in network {0}")]
    NoSubnets(NetworkName),
    /// The egress IP object is not assigned to any node.
    #[error("Egress IP {0} is not assigned to any node")]
    NoEgressAssignment(String),
    /// There is no node to move the egress IP to.
    #[error("No node to move the egress IP away from {0}")]
    NoFailoverTarget(String),
    /// The node is not part of the topology.
    #[error("Node {0} is not part of the topology")]
    UnknownNode(String),
    /// The scenario cannot be run with the given options.
    #[error("Invalid scenario: {0}")]
    InvalidScenario(String),
    /// The routing state did not converge to the expected state.
    #[error("{description} did not converge after {attempts} attempts: {details}")]
    Verification {
        /// What was verified
        description: String,
        /// Number of rounds
        attempts: usize,
        /// The last mismatch (including the sampled text), or the last sampling error
        details: String,
    },
}

/// Convert the error of a lab module into [`Error::Lab`].
macro_rules! lab_error {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Error {
                fn from(e: $t) -> Self {
                    Error::Lab(FrrLabError::from(e))
                }
            }
        )*
    };
}

lab_error!(
    ClusterError,
    ConfigError,
    RenderError,
    RouterError,
    SshError,
    TopologyError
);
