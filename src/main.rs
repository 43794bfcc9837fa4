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

use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
};

use clap::{Parser, Subcommand, ValueEnum};
use frr_lab::{
    config::{LabConfig, RouterConfig},
    router::{render_config, RouterSpec, VrfSpec, DAEMONS},
};

use ovnk_bgp_e2e::{
    lab::Lab,
    report::ScenarioReport,
    scenario::{
        self, Disruption, Environment, FailoverOptions, Label, RecoveryOptions, SelectorOptions,
    },
    Error,
};

/// Verify that OVN-Kubernetes advertises its networks over BGP to an external FRR router.
#[derive(Debug, Parser)]
struct Cli {
    /// Configuration file. If omitted, the file named by `FRR_LAB_CONFIG` is used.
    #[clap(long = "config", short = 'c')]
    config: Option<PathBuf>,
    /// Write the report of the scenario to `<REPORT>_<timestamp>.json`.
    #[clap(long = "report", short = 'r')]
    report: Option<String>,
    /// What to do
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the configuration of the external router for the given peers, without connecting to
    /// anything.
    RenderConfig {
        /// Address of a node to peer with. Repeat for multiple peers.
        #[clap(long = "peer", short = 'p')]
        peers: Vec<IpAddr>,
        /// Router ID of the external router.
        #[clap(long = "router-id")]
        router_id: Option<Ipv4Addr>,
        /// Add a BGP instance in this VRF, replacing the one of the configuration file.
        #[clap(long = "vrf")]
        vrf: Option<String>,
        /// Address of a peer of the VRF instance. Repeat for multiple peers.
        #[clap(long = "vrf-peer", requires = "vrf")]
        vrf_peers: Vec<IpAddr>,
        /// Which file to print.
        #[clap(long = "file", short = 'f', value_enum, default_value = "frr-conf")]
        file: ConfigFile,
    },
    /// Advertise the default network, verify the full mesh, and verify that the routes disappear
    /// once the route advertisement is deleted.
    DefaultNetwork {
        /// Enable route advertisements on the cluster if they are disabled.
        #[clap(long)]
        enable: bool,
        /// Name of the route advertisement.
        #[clap(long = "name", default_value = "default")]
        ra_name: String,
    },
    /// Advertise only the cluster user-defined networks carrying a label.
    Selector {
        /// Enable route advertisements on the cluster if they are disabled.
        #[clap(long)]
        enable: bool,
        /// Name of the route advertisement.
        #[clap(long = "name", default_value = "selected")]
        ra_name: String,
        /// The label selecting the network, as `key=value`.
        #[clap(long = "label", short = 'l', default_value = "advertise=true")]
        label: Label,
        /// Cluster user-defined network to advertise.
        #[clap(long = "selected")]
        selected: String,
        /// Cluster user-defined network that must not be advertised.
        #[clap(long = "other")]
        other: String,
    },
    /// Advertise an egress IP and move it to another node.
    Failover {
        /// Enable route advertisements on the cluster if they are disabled.
        #[clap(long)]
        enable: bool,
        /// Name of the route advertisement.
        #[clap(long = "name", default_value = "egress")]
        ra_name: String,
        /// Name of the egress IP object.
        #[clap(long = "egress-ip")]
        egress_ip: String,
        /// Node to move the egress IP to. Defaults to the first other node.
        #[clap(long = "to")]
        target: Option<String>,
    },
    /// Advertise the default network, restart a cluster component, and verify that the full mesh
    /// recovers.
    Recovery {
        /// Enable route advertisements on the cluster if they are disabled.
        #[clap(long)]
        enable: bool,
        /// Name of the route advertisement.
        #[clap(long = "name", default_value = "default")]
        ra_name: String,
        /// Which pods to delete: `frr-k8s` or `ovnkube-node`.
        #[clap(long = "disrupt", default_value = "frr-k8s")]
        disruption: Disruption,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::RenderConfig { .. } => "render-config",
            Command::DefaultNetwork { .. } => "default-network",
            Command::Selector { .. } => "selector",
            Command::Failover { .. } => "failover",
            Command::Recovery { .. } => "recovery",
        }
    }

    fn enable_ra(&self) -> bool {
        match self {
            Command::RenderConfig { .. } => false,
            Command::DefaultNetwork { enable, .. }
            | Command::Selector { enable, .. }
            | Command::Failover { enable, .. }
            | Command::Recovery { enable, .. } => *enable,
        }
    }
}

/// Files of the external router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ConfigFile {
    /// `frr.conf`
    FrrConf,
    /// `daemons`
    Daemons,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init_timed();

    let args = Cli::parse();

    if let Command::RenderConfig {
        peers,
        router_id,
        vrf,
        vrf_peers,
        file,
    } = &args.command
    {
        let router = match args.config.as_ref() {
            Some(path) => std::fs::read_to_string(path)?.parse::<LabConfig>()?.router,
            None => RouterConfig::default(),
        };
        let mut spec = RouterSpec::from_config(&router).with_peers(peers.iter().copied());
        if let Some(id) = router_id {
            spec = spec.with_router_id(*id);
        }
        if let Some(name) = vrf {
            let (v4, v6): (Vec<_>, Vec<_>) =
                vrf_peers.iter().copied().partition(IpAddr::is_ipv4);
            spec = spec.with_vrf(VrfSpec {
                name: name.clone(),
                peers_v4: v4,
                peers_v6: v6,
            });
        }
        match file {
            ConfigFile::FrrConf => print!("{}", render_config(&spec)?),
            ConfigFile::Daemons => print!("{DAEMONS}"),
        }
        return Ok(());
    }

    let config = match args.config.as_ref() {
        Some(path) => LabConfig::from_file(path)?,
        None => LabConfig::from_env()?,
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            let name = args.command.name();
            let lab = Lab::setup(&config, args.command.enable_ra()).await?;
            let mut report = ScenarioReport::new(name, lab.topology());

            let result = match args.command {
                Command::RenderConfig { .. } => Ok(()),
                Command::DefaultNetwork { ra_name, .. } => {
                    scenario::default_network(&lab, &ra_name, &mut report).await
                }
                Command::Selector {
                    ra_name,
                    label,
                    selected,
                    other,
                    ..
                } => {
                    let opts = SelectorOptions {
                        ra_name,
                        label,
                        selected,
                        other,
                    };
                    scenario::selector(&lab, &opts, &mut report).await
                }
                Command::Failover {
                    ra_name,
                    egress_ip,
                    target,
                    ..
                } => {
                    let opts = FailoverOptions {
                        ra_name,
                        egress_ip,
                        target,
                    };
                    scenario::failover(&lab, &opts, &mut report).await
                }
                Command::Recovery {
                    ra_name,
                    disruption,
                    ..
                } => {
                    let opts = RecoveryOptions {
                        ra_name,
                        disruption,
                    };
                    scenario::recovery(&lab, &opts, &mut report).await
                }
            };

            if let Err(e) = lab.teardown().await {
                log::warn!("Cannot tear down the lab: {e}");
            }

            if let Some(prefix) = args.report.as_ref() {
                let path = report.write_json_with_timestamp(prefix)?;
                log::info!("Report written to {}", path.to_string_lossy());
            }

            match &result {
                Ok(()) => log::info!("{name} passed ({} checks)", report.checks.len()),
                Err(e) => log::error!("{name} failed: {e}"),
            }
            result?;
            Ok::<(), Error>(())
        })?;

    Ok(())
}
