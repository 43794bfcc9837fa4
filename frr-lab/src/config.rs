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

//! This module contains the code for reading the lab configuration.
//!
//! The configuration is a TOML file with three sections, `[host]`, `[router]` and `[cluster]`.
//! Everything except the SSH name of the host has a default. The file is located by the
//! environment variable `FRR_LAB_CONFIG`, and two variables of the CI environment override the
//! host settings:
//!
//! - `QE_HYPERVISOR_PUBLIC_ADDRESS` replaces `host.ssh_name`,
//! - `SSH_CLOUD_PRIV_KEY` replaces `host.identity_file`.
//!
//! ```toml
//! [host]
//! ssh_name = "hypervisor.example.com"
//! user = "root"
//!
//! [router]
//! image = "quay.io/frrouting/frr:9.1.2"
//! asn = 64512
//! static_networks_v4 = ["192.168.1.0/24", "192.169.1.1/32"]
//! ```

use std::{
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
    str::FromStr,
};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Environment variable pointing to the configuration file.
pub const CONFIG_ENV: &str = "FRR_LAB_CONFIG";
/// Environment variable overriding the host running the external router.
pub const HOST_ENV: &str = "QE_HYPERVISOR_PUBLIC_ADDRESS";
/// Environment variable overriding the SSH private key.
pub const SSH_KEY_ENV: &str = "SSH_CLOUD_PRIV_KEY";

/// Full configuration of a lab run. It is constructed once and passed by reference to everything
/// that needs it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabConfig {
    /// The host on which the external router container runs.
    #[serde(default)]
    pub host: HostConfig,
    /// The external router.
    #[serde(default)]
    pub router: RouterConfig,
    /// Access to the cluster.
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Configuration of the host running the external router.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// The ssh hostname (or address) to reach the host
    #[serde(default)]
    pub ssh_name: String,
    /// Remote user. If unset, it is taken from `~/.ssh/config`.
    #[serde(default)]
    pub user: Option<String>,
    /// Private key used to log in.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Prefix of the staging directory on the host. A random suffix is appended for every router.
    #[serde(default = "default_staging_prefix")]
    pub staging_prefix: String,
}

/// Configuration of the external FRR router.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Container image running FRR.
    #[serde(default = "default_image")]
    pub image: String,
    /// Prefix of the container name. A random suffix is appended for every router.
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
    /// Container runtime binary on the host.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Whether to prefix every privileged command with `sudo`.
    #[serde(default = "default_true")]
    pub sudo: bool,
    /// Local AS number of the external router.
    #[serde(default = "default_asn", deserialize_with = "deserialize_asn")]
    pub asn: u32,
    /// AS number of the cluster nodes. If unset, the session is iBGP.
    #[serde(default, deserialize_with = "deserialize_opt_asn")]
    pub peer_asn: Option<u32>,
    /// IPv4 networks originated by the external router.
    #[serde(default = "default_static_v4")]
    pub static_networks_v4: Vec<Ipv4Net>,
    /// IPv6 networks originated by the external router.
    #[serde(default = "default_static_v6")]
    pub static_networks_v6: Vec<Ipv6Net>,
    /// Additional BGP instance in a VRF of the external router, peering with the cluster over a
    /// VRF-lite network.
    #[serde(default)]
    pub vrf: Option<VrfConfig>,
}

/// A VRF on the external router with its own BGP instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VrfConfig {
    /// Name of the VRF.
    pub name: String,
    /// IPv4 neighbors of the BGP instance in the VRF.
    #[serde(default)]
    pub peers_v4: Vec<Ipv4Addr>,
    /// IPv6 neighbors of the BGP instance in the VRF.
    #[serde(default)]
    pub peers_v6: Vec<Ipv6Addr>,
}

/// Configuration for accessing the cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Cluster CLI binary.
    #[serde(default = "default_oc")]
    pub oc: String,
    /// Kubeconfig passed with `--kubeconfig`. If unset, the CLI default is used.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Namespace of the node-local BGP agent pods.
    #[serde(default = "default_frr_namespace")]
    pub frr_namespace: String,
    /// Label selector of the node-local BGP agent pods.
    #[serde(default = "default_frr_selector")]
    pub frr_pod_selector: String,
    /// Label selector of the admission webhook validating FRR configurations.
    #[serde(default = "default_frr_webhook_selector")]
    pub frr_webhook_selector: String,
    /// Namespace of the node-local OVN-Kubernetes pods.
    #[serde(default = "default_ovn_namespace")]
    pub ovn_namespace: String,
    /// Label selector of the node-local OVN-Kubernetes pods.
    #[serde(default = "default_ovn_selector")]
    pub ovn_pod_selector: String,
    /// Container of the agent pod running `vtysh`.
    #[serde(default = "default_frr_container")]
    pub frr_container: String,
    /// Namespace used for `debug node/...` pods.
    #[serde(default = "default_debug_namespace")]
    pub debug_namespace: String,
}

impl HostConfig {
    /// Host configuration with only the SSH name set.
    pub fn new(ssh_name: impl Into<String>) -> Self {
        Self {
            ssh_name: ssh_name.into(),
            ..Default::default()
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ssh_name: String::new(),
            user: None,
            identity_file: None,
            staging_prefix: default_staging_prefix(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_prefix: default_container_prefix(),
            runtime: default_runtime(),
            sudo: true,
            asn: default_asn(),
            peer_asn: None,
            static_networks_v4: default_static_v4(),
            static_networks_v6: default_static_v6(),
            vrf: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            oc: default_oc(),
            kubeconfig: None,
            frr_namespace: default_frr_namespace(),
            frr_pod_selector: default_frr_selector(),
            frr_webhook_selector: default_frr_webhook_selector(),
            ovn_namespace: default_ovn_namespace(),
            ovn_pod_selector: default_ovn_selector(),
            frr_container: default_frr_container(),
            debug_namespace: default_debug_namespace(),
        }
    }
}

impl LabConfig {
    /// Read and parse the configuration file, then apply the environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let mut config: Self = content.parse()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from the file named by `FRR_LAB_CONFIG`. Without that variable, the
    /// default configuration is used, and the host must be given by `QE_HYPERVISOR_PUBLIC_ADDRESS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(PathBuf::from(path)),
            None => {
                log::debug!("[config] {CONFIG_ENV} is not set, using the default configuration");
                let mut config = Self::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Overwrite the host settings with `QE_HYPERVISOR_PUBLIC_ADDRESS` and `SSH_CLOUD_PRIV_KEY`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var(HOST_ENV) {
            if !host.trim().is_empty() {
                self.host.ssh_name = host.trim().to_string();
            }
        }
        if let Some(key) = std::env::var_os(SSH_KEY_ENV) {
            if !key.is_empty() {
                self.host.identity_file = Some(PathBuf::from(key));
            }
        }
    }

    /// Check the properties that cannot be expressed by deserialization alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.ssh_name.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.router.image.trim().is_empty() {
            return Err(ConfigError::Invalid("router.image must not be empty".into()));
        }
        if let Some(vrf) = &self.router.vrf {
            if vrf.name.trim().is_empty() {
                return Err(ConfigError::Invalid("router.vrf.name must not be empty".into()));
            }
        }
        Ok(())
    }
}

impl FromStr for LabConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

fn default_staging_prefix() -> String {
    "/tmp/bgp-test-frr-".to_string()
}

fn default_image() -> String {
    "quay.io/frrouting/frr:9.1.2".to_string()
}

fn default_container_prefix() -> String {
    "frr-".to_string()
}

fn default_runtime() -> String {
    "podman".to_string()
}

fn default_true() -> bool {
    true
}

fn default_asn() -> u32 {
    64512
}

fn default_static_v4() -> Vec<Ipv4Net> {
    ["192.168.1.0/24", "192.169.1.1/32"]
        .into_iter()
        .filter_map(|n| n.parse().ok())
        .collect()
}

fn default_static_v6() -> Vec<Ipv6Net> {
    ["2001:db8::/128"]
        .into_iter()
        .filter_map(|n| n.parse().ok())
        .collect()
}

fn default_oc() -> String {
    "oc".to_string()
}

fn default_frr_namespace() -> String {
    "openshift-frr-k8s".to_string()
}

fn default_frr_selector() -> String {
    "app=frr-k8s".to_string()
}

fn default_frr_webhook_selector() -> String {
    "component=frr-k8s-webhook-server".to_string()
}

fn default_ovn_namespace() -> String {
    "openshift-ovn-kubernetes".to_string()
}

fn default_ovn_selector() -> String {
    "app=ovnkube-node".to_string()
}

fn default_frr_container() -> String {
    "frr".to_string()
}

fn default_debug_namespace() -> String {
    "default".to_string()
}

/// AS numbers 0, 23456 (AS_TRANS) and 4294967295 are reserved and cannot be used on a session.
fn check_asn<E: serde::de::Error>(asn: u32) -> Result<u32, E> {
    match asn {
        0 | 23456 | u32::MAX => Err(E::custom(format!("AS number {asn} is reserved"))),
        x => Ok(x),
    }
}

fn deserialize_asn<'de, D>(de: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    check_asn(u32::deserialize(de)?)
}

fn deserialize_opt_asn<'de, D>(de: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u32>::deserialize(de)?.map(check_asn).transpose()
}

/// Error while reading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read the configuration file.
    #[error("Cannot read {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    /// Cannot parse the configuration file.
    #[error("Cannot parse the configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// Neither the file nor the environment names a host.
    #[error("No host configured! Set `host.ssh_name` or the environment variable {HOST_ENV}")]
    MissingHost,
    /// Some other value is invalid.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
