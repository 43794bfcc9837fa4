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

//! Inspection of the host running the external router.

use std::net::IpAddr;

use serde::Deserialize;

use super::RouterError;
use crate::{config::RouterConfig, ssh::SshSession, topology::IpFamily};

/// One entry of `ip -j route get`.
#[derive(Debug, Deserialize)]
struct RouteGet {
    #[serde(default)]
    prefsrc: Option<IpAddr>,
}

/// Parse the JSON output of `ip -j route get <addr>` and return the preferred source address.
pub fn parse_route_get(json: &str) -> Result<Option<IpAddr>, serde_json::Error> {
    let routes: Vec<RouteGet> = serde_json::from_str(json)?;
    Ok(routes.into_iter().find_map(|r| r.prefsrc))
}

/// Resolve the address of the host towards a cluster node. This is the address the nodes must
/// peer with.
pub async fn discover_router_address(
    session: &SshSession,
    node_addr: IpAddr,
) -> Result<IpAddr, RouterError> {
    let addr = node_addr.to_string();
    let mut cmd = vec!["ip", "-j"];
    if IpFamily::of(&node_addr) == IpFamily::V6 {
        cmd.push("-6");
    }
    cmd.extend(["route", "get", addr.as_str()]);

    let stdout = session.execute_cmd_stdout(&cmd).await?;
    let src = parse_route_get(&stdout)
        .map_err(|e| RouterError::Parse(cmd.join(" "), e.to_string()))?
        .ok_or(RouterError::NoSourceAddress(node_addr))?;
    log::debug!("[{}] source address towards {node_addr} is {src}", session.name());
    Ok(src)
}

/// Names of all containers on the host that look like an external router.
pub async fn running_routers(
    session: &SshSession,
    config: &RouterConfig,
) -> Result<Vec<String>, RouterError> {
    let filter = format!("name=^{}", config.container_prefix);
    let mut cmd = Vec::new();
    if config.sudo {
        cmd.push("sudo");
    }
    cmd.extend([
        config.runtime.as_str(),
        "ps",
        "--filter",
        filter.as_str(),
        "--format",
        "'{{.Names}}'",
    ]);
    let stdout = session.execute_cmd_stdout(&cmd).await?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
