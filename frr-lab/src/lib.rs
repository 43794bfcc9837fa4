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

//! This library provides the building blocks to verify that a Kubernetes cluster running
//! OVN-Kubernetes advertises its pod networks over BGP, using FRR on both ends.
//!
//! # Configuration
//!
//! The library reads a TOML file, located by the environment variable `FRR_LAB_CONFIG`. It has
//! three sections: `[host]` names the hypervisor running the external router, `[router]` describes
//! the external router, and `[cluster]` describes how to reach the cluster. Every field has a
//! default, except for `host.ssh_name`. The environment variables `QE_HYPERVISOR_PUBLIC_ADDRESS`
//! and `SSH_CLOUD_PRIV_KEY` override the SSH destination and the private key.
//!
//! ```toml
//! [host]
//! ssh_name = "hypervisor.example.com"
//! user = "root"
//!
//! [router]
//! asn = 64512
//! static_networks_v4 = ["192.168.1.0/24", "192.169.1.1/32"]
//!
//! [cluster]
//! kubeconfig = "/home/user/.kube/config"
//! ```
//!
//! Make sure that `ssh $ssh_name` establishes a session without asking for a password. All
//! sessions share a control master.
//!
//! # Lab Setup
//!
//! ```text
//!   ┌──────────────────────────────┐            ┌────────────────────────────────────┐
//!   │          Hypervisor          │    BGP     │              Cluster               │
//!   │ ┌──────────────────────────┐ ├────────────┤ ┌────────┐ ┌────────┐ ┌────────┐   │
//!   │ │ FRR container            │ │ (iBGP, RR) │ │ node 1 │ │ node 2 │ │ node 3 │   │
//!   │ │ - host network namespace │ │            │ │ frr-k8s│ │ frr-k8s│ │ frr-k8s│   │
//!   │ │ - static networks        │ │            │ └────────┘ └────────┘ └────────┘   │
//!   │ └──────────────────────────┘ │            │                                    │
//!   └──────────────────────────────┘            └────────────────────────────────────┘
//! ```
//!
//! The external router is a route reflector for all nodes. It originates a fixed set of static
//! networks, and every node advertises its pod subnets. After convergence, the external router and
//! every node know the pod subnets of every (other) node, with the node address as next hop, both
//! in the BGP table and in the kernel routing table.
//!
//! # Verification
//!
//! Verification never reads state once. Instead, a [`poller::Plan`] lists the samples to take and
//! the expectations on them, and [`poller::converge`] repeats sampling until all expectations hold
//! in the same round, or until the timeout elapses.

use thiserror::Error;

pub mod cluster;
pub mod config;
pub mod matcher;
pub mod poller;
pub mod router;
pub mod sampler;
pub mod ssh;
pub mod topology;

#[cfg(test)]
mod test;

use cluster::ClusterError;
use config::ConfigError;
use router::{RenderError, RouterError};
use sampler::SampleError;
use ssh::SshError;
use topology::TopologyError;

/// Error type of the lab.
#[derive(Debug, Error)]
pub enum FrrLabError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Session error with the host
    #[error("Session error: {0}")]
    Ssh(#[from] SshError),
    /// Error while managing the external router
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    /// Cannot render the router configuration
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    /// Error while interacting with the cluster
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
    /// The topology is invalid
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
    /// Cannot sample a target
    #[error("Sample error: {0}")]
    Sample(#[from] SampleError),
    /// I/O Error
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
