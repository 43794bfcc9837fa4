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

//! Bounded retry loops for state that converges eventually.
//!
//! [`poll_until`] is the single loop used by everything that waits: the resource drivers and the
//! route verification. [`converge`] runs a [`Plan`] of expectations on top of it. Within every
//! tick, all probes of the plan are sampled first, and only then are the expectations evaluated.
//! The plan converges only if every expectation holds on the samples of the same tick.

use std::{fmt, future::Future, time::Duration};

use tokio::time::{sleep_until, timeout, Instant};

use crate::{
    matcher::Expectation,
    sampler::{Query, Sample, SampleError, Sampler, Target},
};

/// Interval and timeout of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Time between the start of two consecutive attempts.
    pub interval: Duration,
    /// Time after which no new attempt is started. An attempt running at the deadline may take up
    /// to one more interval, so the loop returns within `timeout + interval`.
    pub timeout: Duration,
}

impl PollSettings {
    /// BGP session establishment.
    pub const NEIGHBOR: Self = Self::new(5, 30);
    /// Route propagation across the full mesh.
    pub const ROUTE_PROPAGATION: Self = Self::new(15, 120);
    /// Reassignment of an egress IP to another node.
    pub const FAILOVER: Self = Self::new(10, 360);
    /// Creating a custom resource while the API may still reject it.
    pub const RESOURCE_CREATE: Self = Self::new(5, 20);
    /// A custom resource reaching its desired condition.
    pub const RESOURCE_CONDITION: Self = Self::new(5, 30);
    /// Pods selected by a label becoming ready, e.g., after they were deleted.
    pub const PODS_READY: Self = Self::new(5, 300);
    /// A cluster operator rolling out a configuration change.
    pub const OPERATOR_ROLLOUT: Self = Self::new(30, 1080);

    /// Create new settings with interval and timeout in seconds.
    pub const fn new(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl fmt::Display for PollSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "every {}s for {}s",
            self.interval.as_secs(),
            self.timeout.as_secs()
        )
    }
}

/// State of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Still trying.
    Polling,
    /// The condition was met.
    Converged,
    /// The timeout elapsed before the condition was met.
    TimedOut,
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T, O> {
    /// The condition is met.
    Ready(T),
    /// The condition is not yet met. The observation describes why.
    Pending(O),
}

/// A successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polled<T> {
    /// The value returned by the last attempt.
    pub value: T,
    /// Number of attempts, including the successful one.
    pub attempts: usize,
    /// Time from the first attempt until success.
    pub elapsed: Duration,
}

/// The poll loop timed out.
#[derive(Debug, Clone)]
pub struct PollTimeout<O> {
    /// What was awaited.
    pub what: String,
    /// Number of attempts.
    pub attempts: usize,
    /// Time until the loop gave up.
    pub elapsed: Duration,
    /// The last observation of an attempt that completed without error.
    pub last_observation: Option<O>,
    /// The last error. Only relevant if no attempt completed.
    pub last_error: Option<String>,
}

impl<O> fmt::Display for PollTimeout<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timeout while waiting for {} after {} attempts ({:?})",
            self.what, self.attempts, self.elapsed
        )
    }
}

impl<O: fmt::Display> PollTimeout<O> {
    /// Describe the last thing that was observed. Observations take precedence over errors.
    pub fn last(&self) -> String {
        match (&self.last_observation, &self.last_error) {
            (Some(o), _) => o.to_string(),
            (None, Some(e)) => e.clone(),
            (None, None) => "nothing observed".to_string(),
        }
    }
}

/// Evaluate `attempt` immediately, then every `settings.interval`, until it returns
/// [`Attempt::Ready`] or `settings.timeout` elapses. Errors returned by `attempt` count as "not yet
/// converged" and are logged. Each attempt is bounded by the remaining time, but gets at least one
/// interval. Hence, the loop returns after at most `settings.timeout + settings.interval`.
pub async fn poll_until<T, O, E, F, Fut>(
    settings: PollSettings,
    what: impl Into<String>,
    mut attempt: F,
) -> Result<Polled<T>, PollTimeout<O>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T, O>, E>>,
    O: fmt::Display,
    E: fmt::Display,
{
    let what = what.into();
    let start = Instant::now();
    let deadline = start + settings.timeout;
    let mut state = PollState::Polling;
    let mut attempts = 0;
    let mut last_observation = None;
    let mut last_error = None;

    log::debug!("[poll] wait for {what} ({settings})");

    while state == PollState::Polling {
        let tick = Instant::now();
        attempts += 1;
        let budget = deadline.saturating_duration_since(tick).max(settings.interval);

        match timeout(budget, attempt()).await {
            Ok(Ok(Attempt::Ready(value))) => {
                let elapsed = start.elapsed();
                log::debug!("[poll] {what} converged after {attempts} attempts ({elapsed:?})");
                return Ok(Polled {
                    value,
                    attempts,
                    elapsed,
                });
            }
            Ok(Ok(Attempt::Pending(observation))) => {
                log::trace!("[poll] {what}: attempt {attempts} not converged: {observation}");
                last_observation = Some(observation);
            }
            Ok(Err(e)) => {
                log::warn!("[poll] {what}: attempt {attempts} failed: {e}");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                log::warn!("[poll] {what}: attempt {attempts} did not finish in time");
                last_error = Some(format!("attempt {attempts} did not finish within {budget:?}"));
            }
        }

        if Instant::now() >= deadline {
            state = PollState::TimedOut;
        } else {
            sleep_until((tick + settings.interval).min(deadline)).await;
        }
    }

    let elapsed = start.elapsed();
    log::debug!("[poll] {what} timed out after {attempts} attempts ({elapsed:?})");
    Err(PollTimeout {
        what,
        attempts,
        elapsed,
        last_observation,
        last_error,
    })
}

/// One sample to capture per tick, together with all expectations evaluated on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Where to sample
    pub target: Target,
    /// What to sample
    pub query: Query,
    /// What must (or must not) be in the sample
    pub expectations: Vec<Expectation>,
}

/// A set of probes that must all agree within one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    description: String,
    probes: Vec<Probe>,
}

impl Plan {
    /// Create an empty plan.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            probes: Vec::new(),
        }
    }

    /// Add an expectation. Expectations on the same target and query share one sample. Probes
    /// are sampled in the order they were first added.
    pub fn push(&mut self, target: Target, query: Query, expectation: Expectation) {
        match self
            .probes
            .iter_mut()
            .find(|p| p.target == target && p.query == query)
        {
            Some(probe) => {
                if !probe.expectations.contains(&expectation) {
                    probe.expectations.push(expectation)
                }
            }
            None => self.probes.push(Probe {
                target,
                query,
                expectations: vec![expectation],
            }),
        }
    }

    /// Builder variant of [`Plan::push`].
    pub fn with(mut self, target: Target, query: Query, expectation: Expectation) -> Self {
        self.push(target, query, expectation);
        self
    }

    /// Append all probes of another plan.
    pub fn extend(&mut self, other: Plan) {
        for probe in other.probes {
            for expectation in probe.expectations {
                self.push(probe.target.clone(), probe.query.clone(), expectation);
            }
        }
    }

    /// Description used in logs and errors.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// All probes in sampling order.
    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    /// Total number of expectations.
    pub fn num_expectations(&self) -> usize {
        self.probes.iter().map(|p| p.expectations.len()).sum()
    }

    /// Number of expectations on a given target.
    pub fn num_expectations_on(&self, target: &Target) -> usize {
        self.probes
            .iter()
            .filter(|p| &p.target == target)
            .map(|p| p.expectations.len())
            .sum()
    }

    /// The same plan with every expectation inverted.
    pub fn negate(&self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            probes: self
                .probes
                .iter()
                .map(|p| Probe {
                    target: p.target.clone(),
                    query: p.query.clone(),
                    expectations: p.expectations.iter().map(Expectation::negate).collect(),
                })
                .collect(),
        }
    }

    /// Evaluate all expectations on a set of samples captured in the same tick. `samples` must be
    /// in the order of [`Plan::probes`].
    pub fn evaluate(&self, samples: &[Sample]) -> Vec<Mismatch> {
        self.probes
            .iter()
            .zip(samples)
            .flat_map(|(probe, sample)| {
                probe
                    .expectations
                    .iter()
                    .filter(|e| !e.evaluate(&sample.text))
                    .map(|e| Mismatch {
                        target: probe.target.clone(),
                        command: sample.command.clone(),
                        expectation: e.clone(),
                        sample: sample.text.clone(),
                    })
            })
            .collect()
    }
}

/// An expectation that did not hold on a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// The sampled target
    pub target: Target,
    /// The command producing the sample
    pub command: String,
    /// The expectation that failed
    pub expectation: Expectation,
    /// The sampled text
    pub sample: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "on {}: {}\n`{}` returned:\n{}",
            self.target,
            self.expectation,
            self.command,
            self.sample.trim_end()
        )
    }
}

/// All mismatches of a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatches(pub Vec<Mismatch>);

impl fmt::Display for Mismatches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(first) if self.0.len() > 1 => {
                write!(f, "{} mismatches, first {first}", self.0.len())
            }
            Some(first) => first.fmt(f),
            None => f.write_str("no mismatch"),
        }
    }
}

/// Verdict of [`converge`].
#[derive(Debug, Clone)]
pub struct ConvergenceOutcome {
    /// Either [`PollState::Converged`] or [`PollState::TimedOut`].
    pub state: PollState,
    /// Number of ticks.
    pub attempts: usize,
    /// Time from the first tick until the verdict.
    pub elapsed: Duration,
    /// Mismatches of the last tick that captured all samples. Empty if converged.
    pub last_mismatches: Vec<Mismatch>,
    /// The last sampling error, if any tick failed to capture its samples.
    pub last_error: Option<String>,
}

impl ConvergenceOutcome {
    /// Check if the plan converged.
    pub fn converged(&self) -> bool {
        self.state == PollState::Converged
    }
}

/// Capture all samples of a plan, in order. The first failure aborts the tick.
pub async fn capture<S: Sampler + ?Sized>(
    sampler: &S,
    plan: &Plan,
) -> Result<Vec<Sample>, SampleError> {
    let mut samples = Vec::with_capacity(plan.probes.len());
    for probe in plan.probes.iter() {
        samples.push(sampler.sample(&probe.target, &probe.query).await?);
    }
    Ok(samples)
}

/// Poll the plan until all its expectations hold within the same tick, or until the timeout.
pub async fn converge<S: Sampler + ?Sized>(
    sampler: &S,
    plan: &Plan,
    settings: PollSettings,
) -> ConvergenceOutcome {
    log::info!(
        "[convergence] {} ({} expectations on {} samples, {settings})",
        plan.description(),
        plan.num_expectations(),
        plan.probes.len()
    );

    let result = poll_until(settings, plan.description(), move || async move {
        let samples = capture(sampler, plan).await?;
        let mismatches = plan.evaluate(&samples);
        if mismatches.is_empty() {
            Ok::<_, SampleError>(Attempt::Ready(()))
        } else {
            Ok(Attempt::Pending(Mismatches(mismatches)))
        }
    })
    .await;

    match result {
        Ok(polled) => {
            log::info!(
                "[convergence] {} converged after {} attempts ({:?})",
                plan.description(),
                polled.attempts,
                polled.elapsed
            );
            ConvergenceOutcome {
                state: PollState::Converged,
                attempts: polled.attempts,
                elapsed: polled.elapsed,
                last_mismatches: Vec::new(),
                last_error: None,
            }
        }
        Err(t) => {
            log::warn!(
                "[convergence] {} did not converge: {}",
                plan.description(),
                t.last()
            );
            ConvergenceOutcome {
                state: PollState::TimedOut,
                attempts: t.attempts,
                elapsed: t.elapsed,
                last_mismatches: t.last_observation.map(|m| m.0).unwrap_or_default(),
                last_error: t.last_error,
            }
        }
    }
}
