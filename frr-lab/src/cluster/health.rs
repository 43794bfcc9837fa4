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

//! Readiness of the cluster components that route advertisements depend on: the network operator,
//! the FRR pods, and the OVN-Kubernetes node pods.
//!
//! Enabling route advertisements makes the network operator roll out the FRR pods and restart
//! OVN-Kubernetes. Until that is done, the webhook rejects FRR configurations and no node peers
//! with the external router.

use std::fmt;

use serde::Deserialize;

use super::{ClusterError, ClusterSession};
use crate::poller::{poll_until, Attempt, PollSettings};

/// Name of the cluster operator managing the cluster network.
pub const NETWORK_OPERATOR: &str = "network";

#[derive(Debug, Deserialize)]
struct OperatorCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    status: String,
}

/// The `Available`, `Progressing` and `Degraded` conditions of a cluster operator. A condition
/// that is not reported counts as `False`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorStatus {
    /// The operator is available
    pub available: bool,
    /// The operator is rolling out a change
    pub progressing: bool,
    /// The operator is degraded
    pub degraded: bool,
}

impl OperatorStatus {
    /// Parse the conditions printed by `-ojsonpath={.status.conditions}`.
    pub fn parse(json: &str) -> Result<Self, ClusterError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        let conditions: Vec<OperatorCondition> = serde_json::from_str(json)?;
        let is_true = |kind: &str| {
            conditions
                .iter()
                .any(|c| c.kind == kind && c.status == "True")
        };
        Ok(Self {
            available: is_true("Available"),
            progressing: is_true("Progressing"),
            degraded: is_true("Degraded"),
        })
    }

    /// Available, and neither progressing nor degraded.
    pub fn settled(&self) -> bool {
        self.available && !self.progressing && !self.degraded
    }
}

impl fmt::Display for OperatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Available={}, Progressing={}, Degraded={}",
            self.available, self.progressing, self.degraded
        )
    }
}

/// Whether the `Ready` conditions of a set of pods, printed as whitespace separated `True` and
/// `False`, all hold. No pods at all is not ready.
pub fn pods_ready(statuses: &str) -> bool {
    let mut statuses = statuses.split_whitespace().peekable();
    statuses.peek().is_some() && statuses.all(|s| s == "True")
}

impl ClusterSession {
    /// Conditions of a cluster operator.
    pub async fn operator_status(&self, name: &str) -> Result<OperatorStatus, ClusterError> {
        let json = self
            .jsonpath("clusteroperator", None, name, "{.status.conditions}")
            .await?;
        OperatorStatus::parse(&json)
    }

    /// Wait until the cluster operator is available, and neither progressing nor degraded.
    pub async fn await_operator(&self, name: &str) -> Result<(), ClusterError> {
        let what = format!("cluster operator {name} to settle");
        let this = self;
        poll_until(PollSettings::OPERATOR_ROLLOUT, what, move || async move {
            let status = this.operator_status(name).await?;
            Ok::<_, ClusterError>(if status.settled() {
                Attempt::Ready(())
            } else {
                Attempt::Pending(status)
            })
        })
        .await
        .map(|_| ())
        .map_err(|t| ClusterError::Timeout {
            last: t.last(),
            what: t.what,
        })
    }

    /// `Ready` conditions of all pods matching the selector, separated by spaces.
    async fn pod_readiness(&self, namespace: &str, selector: &str) -> Result<String, ClusterError> {
        Ok(self
            .run(&[
                "get",
                "pods",
                "-n",
                namespace,
                "-l",
                selector,
                r#"-ojsonpath={.items[*].status.conditions[?(@.type=="Ready")].status}"#,
            ])
            .await?
            .trim()
            .to_string())
    }

    /// Wait until there is at least one pod matching the selector, and all of them are ready.
    pub async fn await_pods_ready(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<(), ClusterError> {
        let what = format!("pods {selector} in {namespace} to be ready");
        let this = self;
        poll_until(PollSettings::PODS_READY, what, move || async move {
            let statuses = this.pod_readiness(namespace, selector).await?;
            Ok::<_, ClusterError>(if pods_ready(&statuses) {
                Attempt::Ready(())
            } else if statuses.is_empty() {
                Attempt::Pending("no pods".to_string())
            } else {
                Attempt::Pending(format!("ready: {statuses}"))
            })
        })
        .await
        .map(|_| ())
        .map_err(|t| ClusterError::Timeout {
            last: t.last(),
            what: t.what,
        })
    }

    /// Wait until the BGP agent pods and the FRR configuration webhook are ready.
    pub async fn await_frr_ready(&self) -> Result<(), ClusterError> {
        let config = self.config();
        self.await_pods_ready(&config.frr_namespace, &config.frr_pod_selector)
            .await?;
        self.await_pods_ready(&config.frr_namespace, &config.frr_webhook_selector)
            .await
    }

    /// Delete all pods matching the selector. Their controller recreates them.
    pub async fn delete_pods(&self, namespace: &str, selector: &str) -> Result<(), ClusterError> {
        log::info!("[cluster] delete pods {selector} in {namespace}");
        self.run(&["delete", "pods", "-n", namespace, "-l", selector])
            .await?;
        Ok(())
    }

    /// Restart the BGP agent and the FRR configuration webhook, and wait until both are ready
    /// again.
    pub async fn restart_frr(&self) -> Result<(), ClusterError> {
        let config = self.config();
        self.delete_pods(&config.frr_namespace, &config.frr_pod_selector)
            .await?;
        self.delete_pods(&config.frr_namespace, &config.frr_webhook_selector)
            .await?;
        self.await_frr_ready().await
    }

    /// Restart OVN-Kubernetes on all nodes, and wait until its pods are ready and the network
    /// operator has settled.
    pub async fn restart_ovn(&self) -> Result<(), ClusterError> {
        let config = self.config();
        self.delete_pods(&config.ovn_namespace, &config.ovn_pod_selector)
            .await?;
        self.await_pods_ready(&config.ovn_namespace, &config.ovn_pod_selector)
            .await?;
        self.await_operator(NETWORK_OPERATOR).await
    }
}
