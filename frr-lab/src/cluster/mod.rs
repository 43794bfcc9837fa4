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

//! Access to the cluster through its CLI.

use std::{
    ffi::OsStr,
    process::{Output, Stdio},
    string::FromUtf8Error,
};

use itertools::Itertools;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{config::ClusterConfig, topology::TopologyError};

pub mod discovery;
pub mod health;
pub mod resources;

pub use resources::{
    Advertisement, ClusterResource, Condition, FrrConfiguration, NetworkSelector,
    RouteAdvertisement,
};

/// Session with the cluster. Every operation spawns one CLI process.
#[derive(Debug, Clone)]
pub struct ClusterSession {
    config: ClusterConfig,
}

impl ClusterSession {
    /// Create a new session. This does not contact the cluster.
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// The configuration of this session.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Create the CLI command with `--kubeconfig` set if configured. The child is killed once the
    /// command is dropped.
    fn command(&self, args: &[impl AsRef<OsStr>]) -> Command {
        let mut cmd = Command::new(&self.config.oc);
        if let Some(kubeconfig) = self.config.kubeconfig.as_ref() {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        cmd.args(args);
        cmd.kill_on_drop(true);
        log::trace!("[tokio::process::Command] {:?}", cmd);
        cmd
    }

    /// Execute the CLI with the given arguments and return STDOUT. Fails on a non-zero exit code.
    pub async fn run(&self, args: &[impl AsRef<str> + Sync]) -> Result<String, ClusterError> {
        let cmd_str = || args.iter().map(AsRef::as_ref).join(" ");
        log::trace!("[cluster] `{} {}`", self.config.oc, cmd_str());
        let output = self
            .command(&args.iter().map(AsRef::as_ref).collect_vec())
            .output()
            .await
            .map_err(|e| {
                log::error!("[cluster] {} {} failed: {}", self.config.oc, cmd_str(), e);
                ClusterError::Spawn(e)
            })?;
        check_output(output, cmd_str)
    }

    /// Execute the CLI and write `stdin` into its standard input, e.g., for `apply -f -`.
    pub async fn run_with_stdin(
        &self,
        args: &[impl AsRef<str> + Sync],
        stdin: impl AsRef<[u8]>,
    ) -> Result<String, ClusterError> {
        let cmd_str = || args.iter().map(AsRef::as_ref).join(" ");
        log::trace!("[cluster] `{} {}` (with stdin)", self.config.oc, cmd_str());
        let mut child = self
            .command(&args.iter().map(AsRef::as_ref).collect_vec())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_ref()).await?;
            // close stdin, such that the CLI stops reading.
            drop(pipe);
        }
        let output = child.wait_with_output().await?;
        check_output(output, cmd_str)
    }

    /// Read a single field of an object with `-o jsonpath=...`.
    pub async fn jsonpath(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
        path: &str,
    ) -> Result<String, ClusterError> {
        let jsonpath = format!("-ojsonpath={path}");
        let mut args = vec!["get", kind, name, jsonpath.as_str()];
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        Ok(self.run(&args).await?.trim().to_string())
    }

    /// Name of the BGP agent pod running on `node`.
    pub async fn agent_pod(&self, node: &str) -> Result<String, ClusterError> {
        let field_selector = format!("spec.nodeName={node}");
        let pod = self
            .run(&[
                "get",
                "pods",
                "-n",
                self.config.frr_namespace.as_str(),
                "-l",
                self.config.frr_pod_selector.as_str(),
                "--field-selector",
                field_selector.as_str(),
                "-ojsonpath={.items[*].metadata.name}",
            ])
            .await?;
        pod.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| ClusterError::NoAgentPod(node.to_string()))
    }

    /// Execute `vtysh -c <command>` in the BGP agent pod of `node`.
    pub async fn vtysh(&self, node: &str, command: &str) -> Result<String, ClusterError> {
        let pod = self.agent_pod(node).await?;
        log::trace!("[cluster] [{node}] vtysh -c {command:?} in {pod}");
        self.run(&[
            "exec",
            "-n",
            self.config.frr_namespace.as_str(),
            "-c",
            self.config.frr_container.as_str(),
            pod.as_str(),
            "--",
            "vtysh",
            "-c",
            command,
        ])
        .await
    }

    /// Execute a shell command line on the host network namespace of `node` using a debug pod.
    pub async fn node_shell(&self, node: &str, line: &str) -> Result<String, ClusterError> {
        let target = format!("node/{node}");
        log::trace!("[cluster] [{node}] bash -c {line:?}");
        self.run(&[
            "debug",
            "-n",
            self.config.debug_namespace.as_str(),
            target.as_str(),
            "--quiet",
            "--",
            "bash",
            "-c",
            line,
        ])
        .await
    }
}

/// Check the output for a successful exit code and decode STDOUT.
fn check_output<F, S>(output: Output, cmd: F) -> Result<String, ClusterError>
where
    F: FnOnce() -> S,
    S: std::fmt::Display,
{
    if output.status.success() {
        Ok(String::from_utf8(output.stdout)?)
    } else {
        let cmd = cmd().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::debug!(
            "[cluster] {} exited with exit code {}{}",
            cmd,
            output.status.code().unwrap_or_default(),
            if !stderr.is_empty() {
                format!("\nSTDERR:\n{stderr}")
            } else {
                String::new()
            }
        );
        Err(ClusterError::Command {
            cmd,
            code: output.status.code().unwrap_or_default(),
            stderr,
        })
    }
}

/// Error while interacting with the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Cannot spawn the CLI.
    #[error("Cannot execute the cluster CLI: {0}")]
    Spawn(#[from] std::io::Error),
    /// The CLI returned a non-zero exit code.
    #[error("`{cmd}` exited with code {code}: {stderr}")]
    Command {
        /// The arguments
        cmd: String,
        /// The exit code
        code: i32,
        /// What the CLI wrote to STDERR
        stderr: String,
    },
    /// Cannot parse output as utf8
    #[error("Cannot parse output as UTF-8: {0}")]
    FromUtf8(#[from] FromUtf8Error),
    /// Cannot parse a JSON object returned by the CLI.
    #[error("Cannot parse the JSON output: {0}")]
    Json(#[from] serde_json::Error),
    /// Cannot parse some other value returned by the CLI.
    #[error("Cannot parse {what}: {value:?}")]
    Parse {
        /// What should have been parsed
        what: &'static str,
        /// The value that could not be parsed
        value: String,
    },
    /// The discovered nodes do not form a valid topology.
    #[error("Invalid topology: {0}")]
    Topology(#[from] TopologyError),
    /// No BGP agent pod runs on the node.
    #[error("No BGP agent pod runs on node {0}")]
    NoAgentPod(String),
    /// A poll on the cluster timed out.
    #[error("Timeout while waiting for {what}. Last observation: {last}")]
    Timeout {
        /// What was awaited
        what: String,
        /// The last observed state or error
        last: String,
    },
    /// A label was not applied (or not removed).
    #[error("Cannot apply label {label} on {kind} {name}")]
    Label {
        /// The kind of the object
        kind: String,
        /// The name of the object
        name: String,
        /// The label operation, `key=value` or `key-`
        label: String,
    },
    /// An object is still listed after it was deleted.
    #[error("{kind} {name} still exists after deleting it")]
    StillPresent {
        /// The kind of the object
        kind: String,
        /// The name of the object
        name: String,
    },
}
