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

//! Samplers capture the raw textual state of the external router or of a cluster node.
//!
//! A sampler only observes. It never retries, and a failed sample is reported as a
//! [`SampleError`], which the poller treats as "not yet converged". Every query selects exactly
//! one IP family, so a dual-stack target is sampled twice.

use std::{fmt, net::IpAddr};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    cluster::{ClusterError, ClusterSession},
    router::ExternalRouter,
    ssh::SshError,
    topology::IpFamily,
};

/// Where to take a sample.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Target {
    /// The external FRR router.
    ExternalRouter,
    /// A cluster node, by name.
    Node(String),
}

impl Target {
    /// Shorthand for [`Target::Node`].
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node(name.into())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::ExternalRouter => f.write_str("external router"),
            Target::Node(n) => write!(f, "node {n}"),
        }
    }
}

/// What to sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// `show bgp [ipv6] neighbor <addr>`
    BgpNeighbor(IpAddr),
    /// `show ip bgp` or `show bgp ipv6`
    BgpTable(IpFamily),
    /// `ip [-6] route show | grep bgp`
    KernelRoutes(IpFamily),
}

/// The command realizing a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryCommand {
    /// A command for the BGP daemon shell.
    Vtysh(String),
    /// A shell command line for the host network namespace.
    Shell(String),
}

impl Query {
    /// The family this query selects.
    pub fn family(&self) -> IpFamily {
        match self {
            Query::BgpNeighbor(addr) => IpFamily::of(addr),
            Query::BgpTable(f) | Query::KernelRoutes(f) => *f,
        }
    }

    /// Build the command for this query.
    pub fn command(&self) -> QueryCommand {
        match self {
            Query::BgpNeighbor(addr @ IpAddr::V4(_)) => {
                QueryCommand::Vtysh(format!("show bgp neighbor {addr}"))
            }
            Query::BgpNeighbor(addr @ IpAddr::V6(_)) => {
                QueryCommand::Vtysh(format!("show bgp ipv6 neighbor {addr}"))
            }
            Query::BgpTable(IpFamily::V4) => QueryCommand::Vtysh("show ip bgp".to_string()),
            Query::BgpTable(IpFamily::V6) => QueryCommand::Vtysh("show bgp ipv6".to_string()),
            // grep exits with 1 if nothing matches, which is a valid (empty) sample.
            Query::KernelRoutes(IpFamily::V4) => {
                QueryCommand::Shell("ip route show | grep bgp || true".to_string())
            }
            Query::KernelRoutes(IpFamily::V6) => {
                QueryCommand::Shell("ip -6 route show | grep bgp || true".to_string())
            }
        }
    }
}

impl fmt::Display for QueryCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryCommand::Vtysh(c) => write!(f, "vtysh -c \"{c}\""),
            QueryCommand::Shell(c) => f.write_str(c),
        }
    }
}

/// Raw text captured from one target at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Where the sample was taken
    pub target: Target,
    /// The command that produced it
    pub command: String,
    /// STDOUT of the command
    pub text: String,
}

/// Observe the state of a target.
#[async_trait]
pub trait Sampler: Send + Sync {
    /// Execute the query on the target and return its output.
    async fn sample(&self, target: &Target, query: &Query) -> Result<Sample, SampleError>;
}

/// Sampler backed by the real external router and cluster.
#[derive(Debug)]
pub struct LabSampler<'a> {
    router: &'a ExternalRouter,
    cluster: &'a ClusterSession,
}

impl<'a> LabSampler<'a> {
    /// Create a sampler observing the given router and cluster.
    pub fn new(router: &'a ExternalRouter, cluster: &'a ClusterSession) -> Self {
        Self { router, cluster }
    }
}

#[async_trait]
impl<'a> Sampler for LabSampler<'a> {
    async fn sample(&self, target: &Target, query: &Query) -> Result<Sample, SampleError> {
        let command = query.command();
        let text = match (target, &command) {
            (Target::ExternalRouter, QueryCommand::Vtysh(c)) => self.router.vtysh(c).await?,
            (Target::ExternalRouter, QueryCommand::Shell(c)) => self.router.host_shell(c).await?,
            (Target::Node(n), QueryCommand::Vtysh(c)) => self.cluster.vtysh(n, c).await?,
            (Target::Node(n), QueryCommand::Shell(c)) => self.cluster.node_shell(n, c).await?,
        };
        log::trace!("[{target}] {command}:\n{text}");
        Ok(Sample {
            target: target.clone(),
            command: command.to_string(),
            text,
        })
    }
}

/// Error while taking a sample. These are transient from the point of view of the poller.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The external router could not be reached.
    #[error("Cannot sample the external router: {0}")]
    Ssh(#[from] SshError),
    /// The cluster could not be reached.
    #[error("Cannot sample the cluster: {0}")]
    Cluster(#[from] ClusterError),
    /// The target is not known to this sampler.
    #[error("Unknown target: {0}")]
    UnknownTarget(Target),
}
