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

//! Export the outcome of a scenario to a json file.

use std::{
    fs::{remove_file, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use frr_lab::{
    poller::{ConvergenceOutcome, Plan, PollSettings},
    topology::Topology,
};
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, macros::format_description, OffsetDateTime};

/// Outcome of a single convergence check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckRecord {
    /// Description of the plan
    pub description: String,
    /// Number of expectations in the plan
    pub expectations: usize,
    /// Poll interval in seconds
    pub interval_secs: u64,
    /// Poll timeout in seconds
    pub timeout_secs: u64,
    /// Whether the plan converged
    pub converged: bool,
    /// Number of rounds
    pub attempts: usize,
    /// Time until the verdict, in seconds
    pub elapsed_secs: f64,
    /// Failed expectations of the last round
    pub mismatches: Vec<String>,
}

/// Outcome of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioReport {
    /// Name of the scenario
    pub scenario: String,
    /// Start of the scenario (RFC 3339)
    pub started: String,
    /// Stack type of the cluster
    pub stack: String,
    /// Names of all nodes
    pub nodes: Vec<String>,
    /// All checks, in the order they were performed
    pub checks: Vec<CheckRecord>,
}

impl ScenarioReport {
    /// Start a new report.
    pub fn new(scenario: impl Into<String>, topo: &Topology) -> Self {
        let started = OffsetDateTime::now_local()
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(&Rfc3339)
            .unwrap_or_default();
        Self {
            scenario: scenario.into(),
            started,
            stack: topo.stack().to_string(),
            nodes: topo.nodes().iter().map(|n| n.name().to_string()).collect(),
            checks: Vec::new(),
        }
    }

    /// Record the outcome of a plan.
    pub fn record(&mut self, plan: &Plan, settings: PollSettings, outcome: &ConvergenceOutcome) {
        self.checks.push(CheckRecord {
            description: plan.description().to_string(),
            expectations: plan.num_expectations(),
            interval_secs: settings.interval.as_secs(),
            timeout_secs: settings.timeout.as_secs(),
            converged: outcome.converged(),
            attempts: outcome.attempts,
            elapsed_secs: outcome.elapsed.as_secs_f64(),
            mismatches: outcome
                .last_mismatches
                .iter()
                .map(|m| format!("on {}: {}", m.target, m.expectation))
                .collect(),
        });
    }

    /// Whether all recorded checks converged.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.converged)
    }

    /// Write the report to `<prefix>_<timestamp>.json`, adding a counter if the file exists.
    /// Returns the path that was written.
    pub fn write_json_with_timestamp(
        &self,
        prefix: impl AsRef<str>,
    ) -> Result<PathBuf, std::io::Error> {
        let cur_time = OffsetDateTime::now_local()
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(format_description!(
                "[year]-[month]-[day]_[hour]-[minute]-[second]"
            ))
            .unwrap_or_default();
        let mut offset: Option<usize> = None;
        let file = loop {
            let filename = if let Some(offset) = offset {
                format!("{}_{cur_time}_{}.json", prefix.as_ref(), offset)
            } else {
                format!("{}_{cur_time}.json", prefix.as_ref())
            };
            let file = PathBuf::from(filename);
            if !file.exists() {
                break file;
            }
            offset = Some(offset.unwrap_or_default() + 1);
        };

        self.write_json(&file)?;
        Ok(file)
    }

    /// Write the report to a json file, overwriting any existing file.
    pub fn write_json(&self, file: impl AsRef<Path>) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)?;
        let file = file.as_ref();
        if file.exists() {
            remove_file(file)?;
        }
        let mut file = OpenOptions::new().create(true).write(true).open(file)?;
        writeln!(file, "{json}")?;
        Ok(())
    }
}
