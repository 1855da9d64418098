/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![cfg(target_family = "unix")]

use std::{fs, path::Path, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use unibench::{
    config::{Config, RunConfig},
    discovery::{ProcessInfo, ProcessLookupError, ProcessTable, SysinfoProcessTable},
    sampler::{ProcessProbe, SampleRead},
    sink::{self, SUMMARY_HEADER, TIMESERIES_HEADER},
    LifecycleController, RunError, RunState, StartupTime, TerminationReason,
};

struct StaticTable(Vec<ProcessInfo>);
impl ProcessTable for StaticTable {
    fn scan(&mut self) -> Vec<Result<ProcessInfo, ProcessLookupError>> {
        self.0.iter().cloned().map(Ok).collect()
    }
}

struct SteadyProbe;
impl ProcessProbe for SteadyProbe {
    fn read(&mut self, _pid: u32) -> SampleRead {
        SampleRead::Ok {
            cpu_percent: 12.5,
            memory_kb: 65_536,
        }
    }
}

fn qemu_forwarding(port: u16) -> ProcessInfo {
    ProcessInfo {
        pid: 4242,
        name: "qemu-system-x86_64".to_string(),
        args: vec![format!("user,id=net0,hostfwd=tcp::{}-:11211", port)],
    }
}

fn run_config(dir: &Path, name: &str, port: u16, command: &str) -> anyhow::Result<RunConfig> {
    let toml = format!(
        "[[run]]\nname = \"{}\"\nguest = \"unikernel\"\nworkload = \"cache-server\"\nport = {}\n",
        name, port
    );
    let mut config = Config::try_from_str(&toml)?.find_run(name)?.clone();
    config.launch.command = Some(command.to_string());
    config.output.timeseries = dir.join("timeseries.csv");
    config.output.summary = dir.join("metrics_summary.csv");
    config.teardown.grace_ms = 2_000;
    Ok(config)
}

fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        canceller.cancel();
    });
    token
}

fn sleep_alive(arg: &str) -> bool {
    SysinfoProcessTable::new()
        .scan()
        .into_iter()
        .filter_map(Result::ok)
        .any(|p| p.name.starts_with("sleep") && p.args.iter().any(|a| a == arg))
}

#[tokio::test]
async fn undiscovered_guest_fails_and_leaves_no_rows() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = free_port()?;
    let mut config = run_config(dir.path(), "scenario-a", port, "sleep 4801")?;
    config.discovery.timeout_ms = 500;

    let mut controller = LifecycleController::new(config, CancellationToken::new())
        .with_process_table(Box::new(StaticTable(vec![qemu_forwarding(port + 1)])))
        .with_summary(false);

    let res = controller.run().await;

    assert!(matches!(res, Err(RunError::DiscoveryTimeout { .. })));
    assert_eq!(controller.state(), RunState::Failed);
    assert!(!dir.path().join("timeseries.csv").exists());
    assert!(!dir.path().join("metrics_summary.csv").exists());
    assert!(!sleep_alive("4801"));
    Ok(())
}

#[tokio::test]
async fn readiness_timeout_still_records_samples() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = free_port()?;
    // the real `sleep` process is the guest, matched by the port in its arguments
    let mut config = run_config(dir.path(), "scenario-b", port, &format!("sleep {}", port))?;
    config.discovery.engine_prefix = "sleep".to_string();
    config.discovery.match_port_anywhere = true;
    config.readiness.timeout_ms = 500;
    config.sampling.interval_ms = 100;

    let mut controller =
        LifecycleController::new(config, cancel_after(Duration::from_millis(1_500)))
            .with_summary(false);

    let result = controller.run().await?;

    assert_eq!(controller.state(), RunState::Flushed);
    assert_eq!(result.startup, StartupTime::TimedOut);
    assert_eq!(result.reason, TerminationReason::Interrupted);
    assert_eq!(result.status, "timeout");

    let samples = sink::read_samples(&dir.path().join("timeseries.csv"))?;
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.memory_kb > 0));

    let summary = fs::read_to_string(dir.path().join("metrics_summary.csv"))?;
    let row = summary.lines().nth(1).unwrap_or_default();
    assert!(row.starts_with("timeout,"), "{}", row);
    assert!(row.contains(",timeout,scenario-b/unikernel/cache-server/"), "{}", row);
    assert!(!sleep_alive(&port.to_string()));
    Ok(())
}

#[tokio::test]
async fn startup_and_duration_are_measured() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = free_port()?;
    let mut config = run_config(dir.path(), "scenario-c", port, "sleep 4803")?;
    config.sampling.interval_ms = 1_000;

    // the service comes up two seconds in
    let service = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        while listener.accept().await.is_ok() {}
        anyhow::Ok(())
    });

    let mut controller = LifecycleController::new(config, cancel_after(Duration::from_secs(10)))
        .with_process_table(Box::new(StaticTable(vec![qemu_forwarding(port)])))
        .with_process_probe(Box::new(SteadyProbe))
        .with_summary(false);

    let result = controller.run().await?;
    service.abort();

    match result.startup {
        StartupTime::Ready(secs) => assert!((1.5..2.6).contains(&secs), "startup {}", secs),
        other => panic!("expected a startup time, got {:?}", other),
    }
    assert!(
        (9.0..=11.0).contains(&result.total_duration_secs),
        "duration {}",
        result.total_duration_secs
    );
    assert!(result.samples.len() >= 8, "{} samples", result.samples.len());
    assert_eq!(result.status, "interrupted");

    let latency = result.discovery_latency_secs.unwrap_or(f64::MAX);
    assert!(latency < 1.0, "discovery latency {}", latency);
    let guest_duration = result.guest_duration_secs.unwrap_or_default();
    assert!(guest_duration > 8.0, "guest duration {}", guest_duration);
    assert!(guest_duration <= result.total_duration_secs);
    assert_eq!(result.stats.map(|s| s.avg_cpu_percent), Some(12.5));
    Ok(())
}

#[tokio::test]
async fn consecutive_runs_share_one_header() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let mut per_run = vec![];
    for name in ["scenario-d-1", "scenario-d-2"] {
        let mut config = run_config(dir.path(), name, port, "sleep 30")?;
        config.sampling.interval_ms = 100;

        let mut controller =
            LifecycleController::new(config, cancel_after(Duration::from_millis(700)))
                .with_process_table(Box::new(StaticTable(vec![qemu_forwarding(port)])))
                .with_process_probe(Box::new(SteadyProbe))
                .with_preflight(false)
                .with_summary(false);
        per_run.push(controller.run().await?.samples);
    }

    let content = fs::read_to_string(dir.path().join("timeseries.csv"))?;
    assert_eq!(content.lines().filter(|l| *l == TIMESERIES_HEADER).count(), 1);
    assert_eq!(content.lines().next(), Some(TIMESERIES_HEADER));

    let samples = sink::read_samples(&dir.path().join("timeseries.csv"))?;
    assert_eq!(samples, per_run.concat());
    for run in &per_run {
        assert!(!run.is_empty());
        assert!(run.windows(2).all(|w| w[0].elapsed_secs <= w[1].elapsed_secs));
    }

    let summary = fs::read_to_string(dir.path().join("metrics_summary.csv"))?;
    let lines: Vec<&str> = summary.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], SUMMARY_HEADER);
    assert!(lines[1].ends_with(&format!("scenario-d-1/unikernel/cache-server/{}", port)));
    assert!(lines[2].ends_with(&format!("scenario-d-2/unikernel/cache-server/{}", port)));
    drop(listener);
    Ok(())
}

#[tokio::test]
async fn launcher_exit_ends_the_run_normally() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let mut config = run_config(dir.path(), "exits", port, "sleep 1")?;
    config.sampling.interval_ms = 100;

    let mut controller = LifecycleController::new(config, CancellationToken::new())
        .with_process_table(Box::new(StaticTable(vec![qemu_forwarding(port)])))
        .with_process_probe(Box::new(SteadyProbe))
        .with_preflight(false)
        .with_summary(false);

    let result = controller.run().await?;

    assert_eq!(result.reason, TerminationReason::GuestExited);
    assert_eq!(result.status, "normal");
    assert!(matches!(result.startup, StartupTime::Ready(_)));
    assert!(result.total_duration_secs < 5.0);
    Ok(())
}

#[tokio::test]
async fn launcher_exit_while_booting_ends_the_run() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = free_port()?;
    let mut config = run_config(dir.path(), "dies-booting", port, "sleep 0.2")?;
    config.readiness.timeout_ms = 6_000;
    config.sampling.interval_ms = 100;

    let mut controller = LifecycleController::new(config, CancellationToken::new())
        .with_process_table(Box::new(StaticTable(vec![qemu_forwarding(port)])))
        .with_process_probe(Box::new(SteadyProbe))
        .with_preflight(false)
        .with_summary(false);

    let result = controller.run().await?;

    assert_eq!(controller.state(), RunState::Flushed);
    assert_eq!(result.reason, TerminationReason::GuestExited);
    assert_eq!(result.status, "normal");
    assert_eq!(result.startup, StartupTime::NotMeasured);
    assert!(
        result.total_duration_secs < 3.0,
        "duration {}",
        result.total_duration_secs
    );

    let summary = fs::read_to_string(dir.path().join("metrics_summary.csv"))?;
    let row = summary.lines().nth(1).unwrap_or_default();
    assert!(row.starts_with("n/a,"), "{}", row);
    assert!(row.contains(",normal,dies-booting/"), "{}", row);
    Ok(())
}

#[tokio::test]
async fn unresolvable_readiness_host_fails_after_flushing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = free_port()?;
    let mut config = run_config(dir.path(), "unresolvable", port, "sleep 4808")?;
    config.readiness.host = "unibench-readiness.invalid".to_string();
    config.sampling.interval_ms = 10;

    let mut controller = LifecycleController::new(config, CancellationToken::new())
        .with_process_table(Box::new(StaticTable(vec![qemu_forwarding(port)])))
        .with_process_probe(Box::new(SteadyProbe))
        .with_preflight(false)
        .with_summary(false);

    let res = controller.run().await;

    assert!(matches!(res, Err(RunError::Unexpected(_))), "{:?}", res);
    assert_eq!(controller.state(), RunState::Failed);
    assert!(!sleep_alive("4808"));

    let summary = fs::read_to_string(dir.path().join("metrics_summary.csv"))?;
    let lines: Vec<&str> = summary.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], SUMMARY_HEADER);
    assert!(lines[1].starts_with("n/a,"), "{}", lines[1]);
    assert!(lines[1].contains(",exception,unresolvable/"), "{}", lines[1]);

    // whatever was sampled before the failure is in the time series
    let timeseries = dir.path().join("timeseries.csv");
    if timeseries.exists() {
        let samples = sink::read_samples(&timeseries)?;
        assert!(samples.iter().all(|s| s.cpu_percent == 12.5));
    }
    Ok(())
}

#[tokio::test]
async fn interrupt_during_discovery_tears_down() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let port = free_port()?;
    let mut config = run_config(dir.path(), "interrupted", port, "sleep 4806")?;
    config.discovery.timeout_ms = 30_000;

    let mut controller =
        LifecycleController::new(config, cancel_after(Duration::from_millis(300)))
            .with_process_table(Box::new(StaticTable(vec![])))
            .with_summary(false);

    let result = controller.run().await?;

    assert_eq!(result.reason, TerminationReason::Interrupted);
    assert_eq!(result.startup, StartupTime::NotMeasured);
    assert!(result.samples.is_empty());
    assert!(result.total_duration_secs < 5.0);
    assert!(!sleep_alive("4806"));

    let summary = fs::read_to_string(dir.path().join("metrics_summary.csv"))?;
    let row = summary.lines().nth(1).unwrap_or_default();
    assert!(row.starts_with("n/a,"), "{}", row);
    assert!(row.contains(",,interrupted,"), "{}", row);
    assert!(!dir.path().join("timeseries.csv").exists());
    Ok(())
}

#[tokio::test]
async fn occupied_port_fails_before_launch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    let config = run_config(dir.path(), "occupied", port, "sleep 4807")?;

    let mut controller =
        LifecycleController::new(config, CancellationToken::new()).with_summary(false);

    assert!(matches!(
        controller.run().await,
        Err(RunError::LaunchFailure { .. })
    ));
    assert_eq!(controller.state(), RunState::Failed);
    assert!(!sleep_alive("4807"));
    Ok(())
}
