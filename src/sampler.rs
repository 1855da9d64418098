/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use serde::Serialize;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One observation of the guest process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Seconds since the sampler's epoch, 3 decimal places.
    pub elapsed_secs: f64,
    /// Percent of one logical core over the last interval, 2 decimal places.
    pub cpu_percent: f64,
    /// Resident memory in KiB.
    pub memory_kb: u64,
}
impl Sample {
    pub fn new(elapsed: Duration, cpu_percent: f64, memory_kb: u64) -> Self {
        Sample {
            elapsed_secs: round_to(elapsed.as_secs_f64(), 3),
            cpu_percent: round_to(cpu_percent, 2),
            memory_kb,
        }
    }
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10_f64.powi(places);
    (value * factor).round() / factor
}

/// Mean CPU and memory over a run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleStats {
    pub count: usize,
    pub avg_cpu_percent: f64,
    pub avg_memory_kb: f64,
    pub peak_memory_kb: u64,
}
impl SampleStats {
    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let len = samples.len() as f64;
        let cpu_sum = samples.iter().fold(0_f64, |acc, s| acc + s.cpu_percent);
        let mem_sum = samples.iter().fold(0_f64, |acc, s| acc + s.memory_kb as f64);
        let peak_memory_kb = samples.iter().map(|s| s.memory_kb).max().unwrap_or_default();

        Some(SampleStats {
            count: samples.len(),
            avg_cpu_percent: round_to(cpu_sum / len, 2),
            avg_memory_kb: round_to(mem_sum / len, 2),
            peak_memory_kb,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleRead {
    Ok { cpu_percent: f64, memory_kb: u64 },
    /// The process exists but couldn't be read this time.
    Transient(String),
    /// The process is confirmed gone.
    Gone,
}

/// Reads resource usage of a single process.
pub trait ProcessProbe: Send + 'static {
    /// CPU usage is measured since the previous call, so the first call only establishes a
    /// baseline and its figure is meaningless.
    fn read(&mut self, pid: u32) -> SampleRead;
}

pub struct SysinfoProbe {
    system: System,
}
impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}
impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}
impl ProcessProbe for SysinfoProbe {
    fn read(&mut self, pid: u32) -> SampleRead {
        let pid = Pid::from_u32(pid);
        // processes that no longer exist are dropped from `system` by the refresh
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        match self.system.process(pid) {
            None => SampleRead::Gone,
            Some(process) => match process.status() {
                ProcessStatus::Zombie | ProcessStatus::Dead => SampleRead::Gone,
                _ if process.memory() == 0 => {
                    SampleRead::Transient(format!("no resident memory reported for {}", pid))
                }
                _ => {
                    trace!("[PID {}] cpu_usage: {:?}", pid, process.cpu_usage());
                    SampleRead::Ok {
                        cpu_percent: process.cpu_usage() as f64,
                        memory_kb: process.memory() / 1024,
                    }
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerExit {
    Stopped,
    GuestGone,
}

#[derive(Default)]
struct SampleLog {
    samples: Vec<Sample>,
    sealed: bool,
}

pub struct StopHandle {
    token: CancellationToken,
    handle: JoinHandle<SamplerExit>,
    shared_log: Arc<Mutex<SampleLog>>,
}
impl StopHandle {
    /// True once the sampling loop has ended on its own, e.g. because the guest exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the sampler and hands back everything it collected, in the order it was
    /// collected. Nothing is appended after this returns.
    pub async fn stop(mut self, join_timeout: Duration) -> Vec<Sample> {
        self.token.cancel();

        match tokio::time::timeout(join_timeout, &mut self.handle).await {
            Ok(Ok(exit)) => debug!("sampler finished: {:?}", exit),
            Ok(Err(err)) => warn!("sampler task failed: {}", err),
            Err(_) => {
                warn!(
                    "sampler did not stop within {:.1}s, aborting it",
                    join_timeout.as_secs_f64()
                );
                self.handle.abort();
            }
        }

        let mut log = self
            .shared_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        log.sealed = true;
        std::mem::take(&mut log.samples)
    }
}

/// Starts sampling `pid` every `interval` on a background task.
///
/// # Arguments
///
/// * `probe` - reads the process' CPU and memory usage
/// * `pid` - the guest's execution engine process
/// * `interval` - time between samples
/// * `epoch` - sample timestamps are measured from here
///
/// # Returns
///
/// A handle used to stop the sampler and collect the samples.
pub fn start(
    probe: Box<dyn ProcessProbe>,
    pid: u32,
    interval: Duration,
    epoch: Instant,
) -> StopHandle {
    let token = CancellationToken::new();
    let shared_log = Arc::new(Mutex::new(SampleLog::default()));

    let handle = tokio::spawn(keep_sampling(
        probe,
        pid,
        interval,
        epoch,
        shared_log.clone(),
        token.clone(),
    ));

    StopHandle {
        token,
        handle,
        shared_log,
    }
}

async fn keep_sampling(
    mut probe: Box<dyn ProcessProbe>,
    pid: u32,
    interval: Duration,
    epoch: Instant,
    shared_log: Arc<Mutex<SampleLog>>,
    token: CancellationToken,
) -> SamplerExit {
    // warm-up, establishes the cpu baseline
    if probe.read(pid) == SampleRead::Gone {
        info!("guest process {} is gone, sampler exiting", pid);
        return SamplerExit::GuestGone;
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => return SamplerExit::Stopped,
            _ = ticker.tick() => {}
        }

        match probe.read(pid) {
            SampleRead::Ok {
                cpu_percent,
                memory_kb,
            } => {
                let sample = Sample::new(epoch.elapsed(), cpu_percent, memory_kb);
                let mut log = shared_log.lock().unwrap_or_else(PoisonError::into_inner);
                if log.sealed {
                    return SamplerExit::Stopped;
                }
                log.samples.push(sample);
            }

            SampleRead::Transient(reason) => {
                debug!("skipping sample of {}: {}", pid, reason);
            }

            SampleRead::Gone => {
                info!("guest process {} is gone, sampler exiting", pid);
                return SamplerExit::GuestGone;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted reads, then keeps returning `then`.
    pub(crate) struct FakeProbe {
        pub script: VecDeque<SampleRead>,
        pub then: SampleRead,
    }
    impl FakeProbe {
        pub(crate) fn steady(cpu_percent: f64, memory_kb: u64) -> Self {
            Self {
                script: VecDeque::new(),
                then: SampleRead::Ok {
                    cpu_percent,
                    memory_kb,
                },
            }
        }
    }
    impl ProcessProbe for FakeProbe {
        fn read(&mut self, _pid: u32) -> SampleRead {
            self.script.pop_front().unwrap_or_else(|| self.then.clone())
        }
    }

    #[test]
    fn samples_are_rounded_to_fixed_precision() {
        let sample = Sample::new(Duration::from_micros(1_234_567), 12.3456, 2048);
        assert_eq!(sample.elapsed_secs, 1.235);
        assert_eq!(sample.cpu_percent, 12.35);
        assert_eq!(sample.memory_kb, 2048);
    }

    #[test]
    fn stats_are_arithmetic_means() {
        let samples = vec![
            Sample::new(Duration::from_secs(1), 10.0, 1000),
            Sample::new(Duration::from_secs(2), 20.0, 3000),
        ];
        let stats = SampleStats::from_samples(&samples).expect("not empty");
        assert_eq!(stats.count, 2);
        assert_eq!(stats.avg_cpu_percent, 15.0);
        assert_eq!(stats.avg_memory_kb, 2000.0);
        assert_eq!(stats.peak_memory_kb, 3000);
        assert!(SampleStats::from_samples(&[]).is_none());
    }

    #[tokio::test]
    async fn sample_count_tracks_duration_over_interval() {
        let probe = FakeProbe::steady(5.0, 4096);
        let epoch = Instant::now();
        let handle = start(Box::new(probe), 1, Duration::from_millis(100), epoch);

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let samples = handle.stop(Duration::from_secs(1)).await;

        // 1.05s / 100ms, give or take scheduling jitter
        assert!(
            (8..=12).contains(&samples.len()),
            "collected {} samples",
            samples.len()
        );
        assert!(samples
            .windows(2)
            .all(|pair| pair[0].elapsed_secs <= pair[1].elapsed_secs));
        assert!(samples.iter().all(|s| s.memory_kb == 4096));
    }

    #[tokio::test]
    async fn transient_failures_skip_a_cycle() {
        let mut probe = FakeProbe::steady(1.0, 10);
        probe.script = VecDeque::from(vec![
            SampleRead::Ok {
                cpu_percent: 0.0,
                memory_kb: 10,
            },
            SampleRead::Transient("unreadable".to_string()),
            SampleRead::Transient("unreadable".to_string()),
        ]);
        let handle = start(Box::new(probe), 1, Duration::from_millis(50), Instant::now());

        tokio::time::sleep(Duration::from_millis(420)).await;
        let samples = handle.stop(Duration::from_secs(1)).await;

        // 8 ticks, the first two skipped
        assert!(
            (4..=7).contains(&samples.len()),
            "collected {} samples",
            samples.len()
        );
    }

    #[tokio::test]
    async fn sampler_exits_when_guest_is_gone() {
        let mut probe = FakeProbe::steady(1.0, 10);
        probe.script = VecDeque::from(vec![
            SampleRead::Ok {
                cpu_percent: 0.0,
                memory_kb: 10,
            },
            SampleRead::Ok {
                cpu_percent: 3.0,
                memory_kb: 10,
            },
            SampleRead::Ok {
                cpu_percent: 4.0,
                memory_kb: 10,
            },
        ]);
        probe.then = SampleRead::Gone;
        let handle = start(Box::new(probe), 1, Duration::from_millis(20), Instant::now());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(handle.is_finished());

        let samples = handle.stop(Duration::from_secs(1)).await;
        let cpus: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
        assert_eq!(cpus, vec![3.0, 4.0]);
    }

    #[tokio::test]
    async fn nothing_is_collected_after_stop() {
        let handle = start(
            Box::new(FakeProbe::steady(1.0, 1)),
            1,
            Duration::from_millis(10),
            Instant::now(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;

        let shared_log = handle.shared_log.clone();
        let samples = handle.stop(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let log = shared_log.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(log.sealed);
        assert!(log.samples.is_empty());
        assert!(!samples.is_empty());
    }

    #[tokio::test]
    #[cfg(target_family = "unix")]
    async fn sysinfo_probe_reads_this_process() {
        let mut probe = SysinfoProbe::new();
        let me = std::process::id();
        probe.read(me);
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

        match probe.read(me) {
            SampleRead::Ok { memory_kb, .. } => assert!(memory_kb > 0),
            other => panic!("expected a reading, got {:?}", other),
        }
        assert_eq!(probe.read(u32::MAX), SampleRead::Gone);
    }
}
