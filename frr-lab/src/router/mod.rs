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

//! This module manages the external FRR router. The router runs as a privileged container in the
//! host network namespace of the hypervisor, with its configuration bind-mounted from a staging
//! directory.

use std::{net::IpAddr, path::Path};

use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;
use time::{macros::format_description, OffsetDateTime};

use crate::{
    config::{HostConfig, RouterConfig},
    ssh::{shell_quote, SshError, SshSession},
};

pub mod daemons;
pub mod frr_config;
mod host;

pub use daemons::{enabled_daemons, DAEMONS};
pub use frr_config::{render_config, RenderError, RouterSpec, VrfSpec};
pub use host::{discover_router_address, parse_route_get, running_routers};

/// Length of the random suffix of the container name and staging directory.
const SUFFIX_LEN: usize = 8;

/// Handle to a running external router. Dropping the handle without calling
/// [`ExternalRouter::deprovision`] still removes the container, but blocks the current thread.
#[derive(Debug)]
pub struct ExternalRouter {
    session: SshSession,
    runtime: String,
    sudo: bool,
    container_name: String,
    container_id: String,
    staging_dir: String,
    spec: RouterSpec,
    started_at: OffsetDateTime,
    active: bool,
}

impl ExternalRouter {
    /// Render the configuration, stage it on the host and start the router container.
    ///
    /// Provisioning is not retried. If any step fails, everything created so far is removed.
    pub async fn provision(
        session: SshSession,
        host: &HostConfig,
        config: &RouterConfig,
        spec: RouterSpec,
    ) -> Result<Self, RouterError> {
        let frr_conf = render_config(&spec)?;
        let suffix = random_suffix();

        let mut router = Self {
            session,
            runtime: config.runtime.clone(),
            sudo: config.sudo,
            container_name: format!("{}{}", config.container_prefix, suffix),
            container_id: String::new(),
            staging_dir: format!("{}{}", host.staging_prefix, suffix),
            spec,
            started_at: OffsetDateTime::now_utc(),
            active: false,
        };

        log::debug!(
            "[{}] provisioning {} with {} IPv4 and {} IPv6 peers",
            router.session.name(),
            router.container_name,
            router.spec.peers_v4.len(),
            router.spec.peers_v6.len(),
        );

        // stage both files locally, then copy them over.
        let local = tempfile::tempdir()?;
        let local_conf = local.path().join("frr.conf");
        let local_daemons = local.path().join("daemons");
        tokio::fs::write(&local_conf, &frr_conf).await?;
        tokio::fs::write(&local_daemons, DAEMONS).await?;

        router
            .session
            .execute_cmd(&["mkdir", "-p", router.staging_dir.as_str()])
            .await?;
        // from here on, dropping the router cleans up the staging directory.
        router.active = true;

        router.upload(&local_conf, "frr.conf").await?;
        router.upload(&local_daemons, "daemons").await?;

        let volume = format!("{}:/etc/frr", router.staging_dir);
        let run = router.privileged(&[
            "run",
            "-d",
            "--privileged",
            "--network",
            "host",
            "--rm",
            "--ulimit",
            "core=-1",
            "--name",
            router.container_name.as_str(),
            "--volume",
            volume.as_str(),
            config.image.as_str(),
        ]);
        router.session.execute_cmd_stdout(&run).await?;

        router.container_id = router.lookup_container_id().await?;
        router.started_at = OffsetDateTime::now_utc();

        log::info!(
            "[{}] started {} ({}) at {}",
            router.session.name(),
            router.container_name,
            router.container_id,
            router.started_at_str()
        );

        Ok(router)
    }

    /// Name of the container.
    pub fn name(&self) -> &str {
        &self.container_name
    }

    /// ID of the container, as reported by the runtime.
    pub fn id(&self) -> &str {
        &self.container_id
    }

    /// Directory on the host holding `frr.conf` and `daemons`.
    pub fn staging_dir(&self) -> &str {
        &self.staging_dir
    }

    /// The configuration the router was started with.
    pub fn spec(&self) -> &RouterSpec {
        &self.spec
    }

    /// The SSH session to the host.
    pub fn session(&self) -> &SshSession {
        &self.session
    }

    /// Time at which the container was started.
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    /// Whether the router was not yet deprovisioned.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Execute a command in the BGP shell of the router and return its output.
    pub async fn vtysh(&self, command: &str) -> Result<String, SshError> {
        let command = shell_quote(command);
        let cmd = self.privileged(&[
            "exec",
            self.container_id.as_str(),
            "vtysh",
            "-c",
            command.as_str(),
        ]);
        self.session.execute_cmd_stdout(&cmd).await
    }

    /// Execute a shell command line on the host. As the router shares the host network namespace,
    /// this observes the kernel routes installed by the router.
    pub async fn host_shell(&self, line: &str) -> Result<String, SshError> {
        self.session.execute_shell(line).await
    }

    /// Stop the container and remove the staging directory. Calling this multiple times is fine,
    /// and a container that is already gone is not an error.
    pub async fn deprovision(&mut self) -> Result<(), RouterError> {
        if !self.active {
            log::trace!("[{}] {} already removed", self.session.name(), self.container_name);
            return Ok(());
        }
        log::info!("[{}] removing {}", self.session.name(), self.container_name);

        let rm = self.privileged(&["rm", "-f", self.container_name.as_str()]);
        if !self.session.execute_cmd_status(&rm).await?.success() {
            log::warn!(
                "[{}] cannot remove container {}",
                self.session.name(),
                self.container_name
            );
        }

        let rm_dir = self.sudo(&["rm", "-rf", self.staging_dir.as_str()]);
        if !self.session.execute_cmd_status(&rm_dir).await?.success() {
            log::warn!(
                "[{}] cannot remove {}",
                self.session.name(),
                self.staging_dir
            );
        }

        self.active = false;
        Ok(())
    }

    /// Copy a local file into the staging directory.
    async fn upload(&self, local: &Path, name: &str) -> Result<(), SshError> {
        let remote = format!("{}/{}", self.staging_dir, name);
        self.session.copy_to(local, &remote).await
    }

    /// Find the ID of the container by its exact name.
    async fn lookup_container_id(&self) -> Result<String, RouterError> {
        let filter = format!("name=^{}$", self.container_name);
        let cmd = self.privileged(&[
            "ps",
            "--filter",
            filter.as_str(),
            "--format",
            "'{{.ID}}'",
        ]);
        let stdout = self.session.execute_cmd_stdout(&cmd).await?;
        stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RouterError::ContainerNotRunning(self.container_name.clone()))
    }

    /// Build a container runtime command, prefixed with `sudo` if configured.
    fn privileged(&self, args: &[&str]) -> Vec<String> {
        let mut cmd = vec![self.runtime.as_str()];
        cmd.extend_from_slice(args);
        self.sudo(&cmd)
    }

    /// Prefix the command with `sudo` if configured.
    fn sudo(&self, args: &[&str]) -> Vec<String> {
        self.sudo
            .then_some("sudo")
            .into_iter()
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    fn started_at_str(&self) -> String {
        self.started_at
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_else(|_| self.started_at.to_string())
    }
}

impl Drop for ExternalRouter {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        log::debug!(
            "[{}] removing {} (drop)",
            self.session.name(),
            self.container_name
        );
        let sudo = if self.sudo { "sudo " } else { "" };
        let line = format!(
            "{sudo}{} rm -f {}; {sudo}rm -rf {}",
            self.runtime, self.container_name, self.staging_dir
        );
        let _ = self.session.execute_shell_blocking(&line);
    }
}

/// Random lowercase suffix for container names and staging directories.
fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Error while managing the external router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Error in the SSH session with the host.
    #[error("{0}")]
    Ssh(#[from] SshError),
    /// The router configuration is invalid.
    #[error("Cannot render the router configuration: {0}")]
    Render(#[from] RenderError),
    /// Cannot write the staged files locally.
    #[error("Cannot stage the router configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The container is not running after starting it.
    #[error("Container {0} is not running")]
    ContainerNotRunning(String),
    /// The host has no route towards a node.
    #[error("The host has no source address towards {0}")]
    NoSourceAddress(IpAddr),
    /// Cannot parse the output of a command on the host.
    #[error("Cannot parse the output of `{0}`: {1}")]
    Parse(String, String),
}
