/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::RunConfig,
    discovery::{self, DiscoveredGuest, Discovery, ProcessTable, SysinfoProcessTable},
    error::RunError,
    launcher::{self, GuestHandle},
    preflight,
    readiness::{Readiness, ReadinessProbe},
    sampler::{self, round_to, ProcessProbe, Sample, SampleStats, StopHandle, SysinfoProbe},
    sink::{MetricsSink, SummaryRow},
    summary,
};
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::Serialize;
use std::{
    fmt,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Launching,
    Discovering,
    WaitingReady,
    Running,
    Stopping,
    Flushed,
    Failed,
}

/// Time from guest discovery until its service accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "secs", rename_all = "snake_case")]
pub enum StartupTime {
    Ready(f64),
    TimedOut,
    /// The run ended before readiness was checked.
    NotMeasured,
}
impl fmt::Display for StartupTime {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StartupTime::Ready(secs) => write!(f, "{:.3}", secs),
            StartupTime::TimedOut => write!(f, "timeout"),
            StartupTime::NotMeasured => write!(f, "n/a"),
        }
    }
}

/// Why the run stopped. A readiness timeout does not stop a run, sampling carries on until one
/// of these happens. It shows up as [`StartupTime::TimedOut`] and the `timeout` status instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    /// The launcher or the guest process went away on its own.
    GuestExited,
    Interrupted,
    GuestNotFound,
    Exception,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub run_name: String,
    pub descriptor: String,
    pub started_at: Option<DateTime<Utc>>,
    pub guest_pid: Option<u32>,
    pub startup: StartupTime,
    /// Launcher spawn until the guest process showed up.
    pub discovery_latency_secs: Option<f64>,
    /// Guest discovery until teardown began.
    pub guest_duration_secs: Option<f64>,
    pub total_duration_secs: f64,
    #[serde(skip)]
    pub samples: Vec<Sample>,
    pub stats: Option<SampleStats>,
    pub reason: TerminationReason,
    pub status: String,
    pub error: Option<String>,
    pub flush_error: Option<String>,
}
impl RunResult {
    fn summary_row(&self) -> SummaryRow {
        SummaryRow {
            startup_time: self.startup.to_string(),
            total_duration_secs: self.total_duration_secs,
            avg_cpu_percent: self.stats.map(|stats| stats.avg_cpu_percent),
            status: self.status.clone(),
            config_descriptor: self.descriptor.clone(),
        }
    }
}

/// The value of the summary file's `status` column. Failures win over a readiness timeout,
/// which wins over how the run was stopped.
fn status_of(reason: TerminationReason, startup: StartupTime) -> &'static str {
    match (reason, startup) {
        (TerminationReason::Exception, _) => "exception",
        (TerminationReason::GuestNotFound, _) => "guest-not-found",
        (_, StartupTime::TimedOut) => "timeout",
        (TerminationReason::GuestExited, _) => "normal",
        (TerminationReason::Interrupted, _) => "interrupted",
    }
}

/// Drives a single benchmark run from launch to flushed metrics.
pub struct LifecycleController {
    run_id: String,
    config: RunConfig,
    token: CancellationToken,
    table: Box<dyn ProcessTable>,
    probe: Option<Box<dyn ProcessProbe>>,
    sink: MetricsSink,
    preflight: bool,
    print_summary: bool,

    state: RunState,
    guest: Option<GuestHandle>,
    discovered: Option<DiscoveredGuest>,
    sampler: Option<StopHandle>,
    startup: StartupTime,
    failure: Option<String>,
    finished: Option<RunResult>,
}

impl LifecycleController {
    pub fn new(config: RunConfig, token: CancellationToken) -> Self {
        let sink = MetricsSink::new(&config.output.timeseries, &config.output.summary);
        Self {
            run_id: nanoid!(5),
            config,
            token,
            table: Box::new(SysinfoProcessTable::new()),
            probe: Some(Box::new(SysinfoProbe::new())),
            sink,
            preflight: true,
            print_summary: true,
            state: RunState::Init,
            guest: None,
            discovered: None,
            sampler: None,
            startup: StartupTime::NotMeasured,
            failure: None,
            finished: None,
        }
    }

    pub fn with_process_table(mut self, table: Box<dyn ProcessTable>) -> Self {
        self.table = table;
        self
    }

    pub fn with_process_probe(mut self, probe: Box<dyn ProcessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_preflight(mut self, enabled: bool) -> Self {
        self.preflight = enabled;
        self
    }

    pub fn with_summary(mut self, enabled: bool) -> Self {
        self.print_summary = enabled;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Executes the run. Once the launcher is up, every outcome goes through [`Self::teardown`]
    /// before returning, so collected samples are flushed even when the run fails.
    pub async fn run(&mut self) -> Result<RunResult, RunError> {
        if let Some(result) = &self.finished {
            return Ok(result.clone());
        }

        if let Err(err) = self.config.validate() {
            self.transition(RunState::Failed);
            return Err(err);
        }

        self.transition(RunState::Launching);
        if let Err(err) = self.launch().await {
            error!(run_id = %self.run_id, "{}", err);
            self.transition(RunState::Failed);
            return Err(err);
        }

        let outcome = self.drive().await;
        let reason = match &outcome {
            Ok(reason) => *reason,
            Err(RunError::DiscoveryTimeout { .. }) => TerminationReason::GuestNotFound,
            Err(_) => TerminationReason::Exception,
        };
        if let Err(err) = &outcome {
            error!(run_id = %self.run_id, "{}", err);
            self.failure = Some(err.to_string());
        }

        let result = self.teardown(reason).await;
        match (outcome, &result.flush_error) {
            (Err(err), _) => Err(err),
            (Ok(_), Some(flush_error)) => Err(RunError::Unexpected(anyhow::anyhow!(
                "Unable to write metrics: {}",
                flush_error
            ))),
            (Ok(_), None) => Ok(result),
        }
    }

    async fn launch(&mut self) -> Result<(), RunError> {
        let host = self.config.readiness.host.clone();
        let port = self.config.port;
        if self.preflight && preflight::port_in_use(&host, port).await {
            return Err(RunError::launch(
                &self.config.name,
                anyhow::anyhow!("Port {}:{} is already in use", host, port),
            ));
        }

        let guest = launcher::launch(&self.config)?;
        info!(
            run_id = %self.run_id,
            "launched `{}` (pid {})",
            guest.command(),
            guest.pid()
        );
        self.guest = Some(guest);
        Ok(())
    }

    /// Everything between a successful launch and teardown.
    async fn drive(&mut self) -> Result<TerminationReason, RunError> {
        self.transition(RunState::Discovering);
        let signal = self.config.discovery_signal();
        let timeout = self.config.discovery_timeout();
        let discovery = discovery::discover(
            self.table.as_mut(),
            &signal,
            timeout,
            self.config.discovery_poll(),
            &self.token,
        )
        .await;

        let guest = match discovery {
            Discovery::Found(guest) => guest,
            Discovery::NotFound => {
                return Err(RunError::DiscoveryTimeout {
                    signal: signal.to_string(),
                    timeout,
                })
            }
            Discovery::Cancelled => return Ok(TerminationReason::Interrupted),
        };
        info!(
            run_id = %self.run_id,
            "guest process {} (pid {}) discovered",
            guest.name,
            guest.pid
        );

        self.transition(RunState::WaitingReady);
        let probe = self
            .probe
            .take()
            .ok_or_else(|| anyhow::anyhow!("Process probe was already used by another run"))?;
        let epoch = guest.discovered_at;
        self.sampler = Some(sampler::start(
            probe,
            guest.pid,
            self.config.sampling_interval(),
            epoch,
        ));
        self.discovered = Some(guest);

        let endpoint = ReadinessProbe::new(
            &self.config.readiness.host,
            self.config.port,
            self.config.readiness_check(),
        )
        .timeout(self.config.readiness_timeout())
        .poll(self.config.readiness_poll());

        // a guest that dies while booting ends the run, startup stays unmeasured
        let readiness = {
            let launcher = self.guest.as_mut().ok_or_else(|| {
                anyhow::anyhow!("Launcher handle missing while waiting for readiness")
            })?;
            let sampler = self.sampler.as_ref();
            let mut check = tokio::time::interval(self.config.sampling_interval());
            let waiting = endpoint.wait_ready(epoch, &self.token);
            tokio::pin!(waiting);

            loop {
                tokio::select! {
                    readiness = &mut waiting => break readiness?,
                    status = launcher.wait_exit() => {
                        match status {
                            Ok(status) => info!(run_id = %self.run_id, "launcher exited with {} while booting", status),
                            Err(err) => warn!(run_id = %self.run_id, "lost track of the launcher: {}", err),
                        }
                        return Ok(TerminationReason::GuestExited);
                    }
                    _ = check.tick() => {
                        if sampler.map_or(false, StopHandle::is_finished) {
                            info!(run_id = %self.run_id, "guest process is gone while booting");
                            return Ok(TerminationReason::GuestExited);
                        }
                    }
                }
            }
        };

        match readiness {
            Readiness::Ready(latency) => {
                self.startup = StartupTime::Ready(round_to(latency.as_secs_f64(), 3));
                info!(run_id = %self.run_id, "service ready after {}s", self.startup);
            }
            Readiness::NotReady => {
                self.startup = StartupTime::TimedOut;
                warn!(
                    run_id = %self.run_id,
                    "service not ready within {:.1}s, sampling anyway",
                    self.config.readiness_timeout().as_secs_f64()
                );
            }
            Readiness::Cancelled => return Ok(TerminationReason::Interrupted),
        }

        self.transition(RunState::Running);
        self.wait_for_stop().await
    }

    async fn wait_for_stop(&mut self) -> Result<TerminationReason, RunError> {
        let guest = self
            .guest
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Launcher handle missing while running"))?;
        let sampler = self.sampler.as_ref();
        let mut check = tokio::time::interval(self.config.sampling_interval());

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!(run_id = %self.run_id, "interrupted");
                    return Ok(TerminationReason::Interrupted);
                }
                status = guest.wait_exit() => {
                    match status {
                        Ok(status) => info!(run_id = %self.run_id, "launcher exited with {}", status),
                        Err(err) => warn!(run_id = %self.run_id, "lost track of the launcher: {}", err),
                    }
                    return Ok(TerminationReason::GuestExited);
                }
                _ = check.tick() => {
                    if sampler.map_or(false, StopHandle::is_finished) {
                        info!(run_id = %self.run_id, "guest process is gone");
                        return Ok(TerminationReason::GuestExited);
                    }
                }
            }
        }
    }

    /// Terminates the launcher group, stops the sampler and writes the results. Only the first
    /// call has any effect, later calls return the same result.
    pub async fn teardown(&mut self, reason: TerminationReason) -> RunResult {
        if let Some(result) = &self.finished {
            debug!(run_id = %self.run_id, "teardown already ran");
            return result.clone();
        }

        self.transition(RunState::Stopping);
        let stopping_at = Instant::now();
        let total_duration = self
            .guest
            .as_ref()
            .map(|guest| stopping_at.saturating_duration_since(guest.started_at()))
            .unwrap_or(Duration::ZERO);
        let discovery_latency = match (&self.guest, &self.discovered) {
            (Some(launcher), Some(guest)) => Some(
                guest
                    .discovered_at
                    .saturating_duration_since(launcher.started_at()),
            ),
            _ => None,
        };
        let guest_duration = self
            .discovered
            .as_ref()
            .map(|guest| stopping_at.saturating_duration_since(guest.discovered_at));

        if let Some(guest) = self.guest.as_mut() {
            let outcome = guest.terminate(self.config.grace_period()).await;
            info!(
                run_id = %self.run_id,
                "launcher process group {}: {:?}",
                guest.pid(),
                outcome
            );
        }

        let samples = match self.sampler.take() {
            Some(sampler) => sampler.stop(self.config.join_timeout()).await,
            None => vec![],
        };

        let startup = self.startup;
        let mut result = RunResult {
            run_id: self.run_id.clone(),
            run_name: self.config.name.clone(),
            descriptor: self.config.descriptor(),
            started_at: self.guest.as_ref().map(GuestHandle::started_at_utc),
            guest_pid: self.discovered.as_ref().map(|guest| guest.pid),
            startup,
            discovery_latency_secs: discovery_latency.map(|d| round_to(d.as_secs_f64(), 3)),
            guest_duration_secs: guest_duration.map(|d| round_to(d.as_secs_f64(), 3)),
            total_duration_secs: round_to(total_duration.as_secs_f64(), 3),
            stats: SampleStats::from_samples(&samples),
            samples,
            reason,
            status: status_of(reason, startup).to_string(),
            error: self.failure.clone(),
            flush_error: None,
        };

        // a guest that never showed up leaves no trace in the output files
        if reason != TerminationReason::GuestNotFound {
            if let Err(err) = self.flush(&result) {
                error!(run_id = %self.run_id, "failed to write metrics: {:#}", err);
                result.flush_error = Some(format!("{:#}", err));
            }
        }

        if self.print_summary {
            summary::print_run(&result);
        }

        let failed = result.flush_error.is_some()
            || matches!(
                reason,
                TerminationReason::GuestNotFound | TerminationReason::Exception
            );
        self.transition(if failed {
            RunState::Failed
        } else {
            RunState::Flushed
        });

        self.finished = Some(result.clone());
        result
    }

    fn flush(&self, result: &RunResult) -> anyhow::Result<()> {
        if !result.samples.is_empty() {
            self.sink.append_samples(&result.samples)?;
        }
        self.sink.append_summary(&result.summary_row())
    }

    fn transition(&mut self, next: RunState) {
        info!(run_id = %self.run_id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::tests::run_config,
        discovery::tests::{qemu, FakeTable},
        sampler::tests::FakeProbe,
    };

    #[test]
    fn status_prefers_failures_over_timeouts() {
        use StartupTime::*;
        use TerminationReason::*;

        assert_eq!(status_of(Exception, TimedOut), "exception");
        assert_eq!(status_of(GuestNotFound, NotMeasured), "guest-not-found");
        assert_eq!(status_of(Interrupted, TimedOut), "timeout");
        assert_eq!(status_of(GuestExited, Ready(1.0)), "normal");
        assert_eq!(status_of(Interrupted, Ready(1.0)), "interrupted");
    }

    #[test]
    fn startup_time_renders_sentinels() {
        assert_eq!(StartupTime::Ready(2.0134).to_string(), "2.013");
        assert_eq!(StartupTime::TimedOut.to_string(), "timeout");
        assert_eq!(StartupTime::NotMeasured.to_string(), "n/a");
    }

    #[test]
    fn readiness_timeout_is_reported_through_startup() -> anyhow::Result<()> {
        let result = RunResult {
            run_id: "abcde".to_string(),
            run_name: "slow".to_string(),
            descriptor: "slow/unikernel/cache-server/11211".to_string(),
            started_at: None,
            guest_pid: Some(42),
            startup: StartupTime::TimedOut,
            discovery_latency_secs: Some(0.412),
            guest_duration_secs: Some(19.5),
            total_duration_secs: 20.0,
            samples: vec![],
            stats: None,
            reason: TerminationReason::GuestExited,
            status: status_of(TerminationReason::GuestExited, StartupTime::TimedOut).to_string(),
            error: None,
            flush_error: None,
        };

        let json = serde_json::to_value(&result)?;
        assert_eq!(json["reason"], "guest-exited");
        assert_eq!(json["startup"]["kind"], "timed_out");
        assert_eq!(json["status"], "timeout");
        assert_eq!(json["discovery_latency_secs"], 0.412);
        assert_eq!(json["guest_duration_secs"], 19.5);
        assert_eq!(result.summary_row().startup_time, "timeout");
        Ok(())
    }

    #[tokio::test]
    async fn invalid_config_fails_before_launch() {
        let mut config = run_config("broken", 0);
        config.launch.command = Some("sleep 30".to_string());

        let mut controller =
            LifecycleController::new(config, CancellationToken::new()).with_summary(false);
        assert!(matches!(controller.run().await, Err(RunError::Config(_))));
        assert_eq!(controller.state(), RunState::Failed);
    }

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn teardown_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        let mut config = run_config("idempotent", port);
        config.launch.command = Some("sleep 30".to_string());
        config.output.timeseries = dir.path().join("ts.csv");
        config.output.summary = dir.path().join("sum.csv");
        config.sampling.interval_ms = 50;
        config.readiness.timeout_ms = 200;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            canceller.cancel();
        });

        let mut controller = LifecycleController::new(config, token)
            .with_process_table(Box::new(FakeTable::new(vec![Ok(qemu(1, port))])))
            .with_process_probe(Box::new(FakeProbe::steady(2.0, 512)))
            .with_preflight(false)
            .with_summary(false);

        let first = controller.run().await?;
        assert_eq!(controller.state(), RunState::Flushed);
        assert_eq!(first.status, "timeout");

        let second = controller.teardown(TerminationReason::Exception).await;
        assert_eq!(second.reason, TerminationReason::Interrupted);
        assert_eq!(second.samples, first.samples);

        let summary = std::fs::read_to_string(dir.path().join("sum.csv"))?;
        assert_eq!(summary.lines().count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn exception_flushes_collected_samples() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = run_config("exception", 11211);
        config.output.timeseries = dir.path().join("ts.csv");
        config.output.summary = dir.path().join("sum.csv");

        let mut controller =
            LifecycleController::new(config, CancellationToken::new()).with_summary(false);
        controller.sampler = Some(sampler::start(
            Box::new(FakeProbe::steady(3.0, 1024)),
            7,
            Duration::from_millis(20),
            Instant::now(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        controller.failure = Some("readiness check broke".to_string());

        let result = controller.teardown(TerminationReason::Exception).await;
        assert_eq!(controller.state(), RunState::Failed);
        assert_eq!(result.status, "exception");
        assert_eq!(result.error.as_deref(), Some("readiness check broke"));
        assert!(!result.samples.is_empty());

        let written = crate::sink::read_samples(&dir.path().join("ts.csv"))?;
        assert_eq!(written, result.samples);
        let summary = std::fs::read_to_string(dir.path().join("sum.csv"))?;
        let row = summary.lines().nth(1).unwrap_or_default();
        assert!(row.contains(",3.00,exception,exception/"), "{}", row);
        Ok(())
    }
}
