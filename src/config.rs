/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{discovery::GuestSignal, error::RunError, readiness::ReadinessCheck};
use anyhow::Context;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/unibench.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(rename = "run", default)]
    pub runs: Vec<RunConfig>,
    #[serde(rename = "bench", default)]
    pub benches: Vec<BenchConfig>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        toml::from_str::<Config>(conf_str).map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))
    }

    pub fn find_run(&self, run_name: &str) -> anyhow::Result<&RunConfig> {
        self.runs
            .iter()
            .find(|run| run.name == run_name)
            .context(format!(
                "Unable to find run with name {}. Known runs: {}",
                run_name,
                self.runs.iter().map(|run| run.name.as_str()).join(", ")
            ))
    }

    pub fn find_bench(&self, bench_name: &str) -> anyhow::Result<&BenchConfig> {
        self.benches
            .iter()
            .find(|bench| bench.name == bench_name)
            .context(format!("Unable to find bench with name {}", bench_name))
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Unikernel,
    Vm,
}
impl fmt::Display for GuestKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GuestKind::Unikernel => write!(f, "unikernel"),
            GuestKind::Vm => write!(f, "vm"),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Workload {
    CacheServer,
    WebServer,
}
impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Workload::CacheServer => write!(f, "cache-server"),
            Workload::WebServer => write!(f, "web-server"),
        }
    }
}

/// Where the launcher's stdout and stderr go.
#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Redirect {
    #[default]
    Null,
    Parent,
    File,
}

/// One benchmark run. Built once from the config file and never mutated afterwards.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunConfig {
    pub name: String,
    pub guest: GuestKind,
    pub workload: Workload,
    /// Host side of the forwarded port.
    pub port: u16,
    /// Guest side of the forwarded port, defaults depend on the workload.
    pub guest_port: Option<u16>,
    #[serde(default)]
    pub launch: LaunchSpec,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LaunchSpec {
    /// Replaces the preset command line entirely when set.
    pub command: Option<String>,
    pub directory: PathBuf,
    pub memory: String,
    pub cpus: u32,
    pub disk: Option<String>,
    pub seed: Option<String>,
    pub arch: String,
    pub platform: String,
    pub extra_args: Vec<String>,
    pub redirect: Redirect,
    /// Launcher output file, only used with `redirect = "file"`.
    pub log_file: PathBuf,
}
impl Default for LaunchSpec {
    fn default() -> Self {
        LaunchSpec {
            command: None,
            directory: PathBuf::from("."),
            memory: "128M".to_string(),
            cpus: 1,
            disk: None,
            seed: None,
            arch: "x86_64".to_string(),
            platform: "qemu".to_string(),
            extra_args: vec![],
            redirect: Redirect::Null,
            log_file: PathBuf::from("metrics/launcher_output.log"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub engine_prefix: String,
    pub timeout_ms: u64,
    pub poll_ms: u64,
    /// Match the port anywhere in the engine's arguments instead of a `hostfwd=tcp::<port>-` rule.
    pub match_port_anywhere: bool,
}
impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            engine_prefix: "qemu-system".to_string(),
            timeout_ms: 10_000,
            poll_ms: 100,
            match_port_anywhere: false,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessStrategy {
    #[default]
    Connect,
    Probe,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReadinessConfig {
    pub strategy: ReadinessStrategy,
    pub host: String,
    pub timeout_ms: u64,
    pub poll_ms: u64,
    pub payload: Option<String>,
    pub expect: Option<String>,
    pub read_timeout_ms: u64,
}
impl Default for ReadinessConfig {
    fn default() -> Self {
        ReadinessConfig {
            strategy: ReadinessStrategy::Connect,
            host: "127.0.0.1".to_string(),
            timeout_ms: 15_000,
            poll_ms: 100,
            payload: None,
            expect: None,
            read_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_ms: u64,
}
impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig { interval_ms: 1_000 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub timeseries: PathBuf,
    pub summary: PathBuf,
}
impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            timeseries: PathBuf::from("metrics/timeseries.csv"),
            summary: PathBuf::from("metrics/metrics_summary.csv"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TeardownConfig {
    /// How long the launcher's process group gets to exit after SIGTERM.
    pub grace_ms: u64,
    /// How long to wait for the sampler to hand back its samples.
    pub join_ms: u64,
}
impl Default for TeardownConfig {
    fn default() -> Self {
        TeardownConfig {
            grace_ms: 5_000,
            join_ms: 10_000,
        }
    }
}

/// A load generator to run against an already running guest.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BenchConfig {
    pub name: String,
    /// Command line, `{i}` and `{out}` are substituted per iteration.
    pub command: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Output path pattern, `{i}` is substituted per iteration.
    pub output: String,
    /// Capture the load generator's stdout in the output file.
    #[serde(default = "default_capture_stdout")]
    pub capture_stdout: bool,
}

fn default_iterations() -> u32 {
    5
}

fn default_capture_stdout() -> bool {
    true
}

impl RunConfig {
    pub fn guest_port(&self) -> u16 {
        self.guest_port.unwrap_or(match (self.workload, self.guest) {
            (Workload::CacheServer, _) => 11211,
            (Workload::WebServer, GuestKind::Unikernel) => 80,
            (Workload::WebServer, GuestKind::Vm) => 8080,
        })
    }

    /// The launcher command line as a list of POSIX words.
    pub fn launch_command(&self) -> anyhow::Result<Vec<String>> {
        let launch = &self.launch;
        let mut words = match &launch.command {
            Some(command) => shlex::split(command)
                .context(format!("Command string is not POSIX compliant: {}", command))?,

            None => match self.guest {
                GuestKind::Unikernel => vec![
                    "kraft".to_string(),
                    "run".to_string(),
                    "--log-level".to_string(),
                    "debug".to_string(),
                    "--log-type".to_string(),
                    "basic".to_string(),
                    "-p".to_string(),
                    format!("{}:{}", self.port, self.guest_port()),
                    "--plat".to_string(),
                    launch.platform.clone(),
                    "--arch".to_string(),
                    launch.arch.clone(),
                    ".".to_string(),
                ],

                GuestKind::Vm => {
                    let disk = launch
                        .disk
                        .as_ref()
                        .context("VM guests need a disk image (launch.disk)")?;
                    let mut words = vec![
                        format!("qemu-system-{}", launch.arch),
                        "-m".to_string(),
                        launch.memory.clone(),
                        "-smp".to_string(),
                        format!("cpus={},threads=1,sockets=1", launch.cpus),
                        "-netdev".to_string(),
                        format!(
                            "user,id=net0,hostfwd=tcp::{}-:{}",
                            self.port,
                            self.guest_port()
                        ),
                        "-device".to_string(),
                        "virtio-net-pci,netdev=net0".to_string(),
                        "-drive".to_string(),
                        format!("file={},format=qcow2", disk),
                    ];
                    if let Some(seed) = &launch.seed {
                        words.push("-cdrom".to_string());
                        words.push(seed.clone());
                    }
                    words.push("-enable-kvm".to_string());
                    words.push("-nographic".to_string());
                    words
                }
            },
        };

        words.extend(launch.extra_args.iter().cloned());
        if words.is_empty() {
            return Err(anyhow::anyhow!("Empty launch command"));
        }
        Ok(words)
    }

    pub fn discovery_signal(&self) -> GuestSignal {
        if self.discovery.match_port_anywhere {
            GuestSignal::new(&self.discovery.engine_prefix, &self.port.to_string())
        } else {
            GuestSignal::new(
                &self.discovery.engine_prefix,
                &format!("hostfwd=tcp::{}-", self.port),
            )
        }
    }

    pub fn readiness_check(&self) -> ReadinessCheck {
        match self.readiness.strategy {
            ReadinessStrategy::Connect => ReadinessCheck::Connect,
            ReadinessStrategy::Probe => {
                let (payload, expect) = match self.workload {
                    Workload::CacheServer => ("version\r\n".to_string(), "VERSION".to_string()),
                    Workload::WebServer => (
                        "HEAD / HTTP/1.1\r\nHost: localhost\r\n\r\n".to_string(),
                        "HTTP/1.1 200".to_string(),
                    ),
                };
                ReadinessCheck::Probe {
                    payload: self.readiness.payload.clone().unwrap_or(payload).into_bytes(),
                    expect: self.readiness.expect.clone().unwrap_or(expect),
                    read_timeout: Duration::from_millis(self.readiness.read_timeout_ms),
                }
            }
        }
    }

    /// Identifies the run in the summary file. Never contains a comma.
    pub fn descriptor(&self) -> String {
        format!("{}/{}/{}/{}", self.name, self.guest, self.workload, self.port).replace(',', ";")
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.timeout_ms)
    }

    /// Host process table poll cadence, kept between 100ms and 500ms.
    pub fn discovery_poll(&self) -> Duration {
        Duration::from_millis(self.discovery.poll_ms.clamp(100, 500))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness.timeout_ms)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness.poll_ms)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling.interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.teardown.grace_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown.join_ms)
    }

    pub fn validate(&self) -> Result<(), RunError> {
        let invalid = |msg: &str| Err(RunError::Config(format!("[{}] {}", self.name, msg)));

        if self.port == 0 {
            return invalid("port must not be 0");
        }
        if self.sampling.interval_ms == 0 {
            return invalid("sampling.interval_ms must be greater than 0");
        }
        if self.discovery.timeout_ms == 0
            || self.readiness.timeout_ms == 0
            || self.readiness.read_timeout_ms == 0
        {
            return invalid("timeouts must be greater than 0");
        }
        if self.readiness.poll_ms == 0 {
            return invalid("readiness.poll_ms must be greater than 0");
        }
        if self.readiness.host.trim().is_empty() {
            return invalid("readiness.host must not be empty");
        }
        if let ReadinessCheck::Probe {
            payload, expect, ..
        } = self.readiness_check()
        {
            if payload.is_empty() || expect.is_empty() {
                return invalid("probe readiness needs a payload and an expected response");
            }
        }
        if let Err(err) = self.launch_command() {
            return invalid(&err.to_string());
        }

        Ok(())
    }
}

impl BenchConfig {
    pub fn output_path(&self, iteration: u32) -> PathBuf {
        PathBuf::from(self.output.replace("{i}", &iteration.to_string()))
    }

    pub fn command_for(&self, iteration: u32) -> String {
        self.command
            .replace("{i}", &iteration.to_string())
            .replace("{out}", &self.output_path(iteration).to_string_lossy())
    }
}
