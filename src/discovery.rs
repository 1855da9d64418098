/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use itertools::Itertools;
use std::{
    fmt,
    time::{Duration, Instant},
};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A single entry of the host process table.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub args: Vec<String>,
}

/// A process vanished or became unreadable between enumeration and inspection.
#[derive(Debug, Clone)]
pub struct ProcessLookupError {
    pub pid: u32,
    pub reason: String,
}

/// The host process table, refreshed on every scan.
pub trait ProcessTable: Send {
    /// Returns a fresh snapshot of the table. Processes that can't be inspected are reported as
    /// errors in place so that one racing process doesn't spoil the whole scan.
    fn scan(&mut self) -> Vec<Result<ProcessInfo, ProcessLookupError>>;
}

pub struct SysinfoProcessTable {
    system: System,
}
impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}
impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
impl ProcessTable for SysinfoProcessTable {
    fn scan(&mut self) -> Vec<Result<ProcessInfo, ProcessLookupError>> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );

        self.system
            .processes()
            .iter()
            .map(|(pid, process)| {
                if let ProcessStatus::Zombie | ProcessStatus::Dead = process.status() {
                    return Err(ProcessLookupError {
                        pid: pid.as_u32(),
                        reason: format!("process is {}", process.status()),
                    });
                }

                Ok(ProcessInfo {
                    pid: pid.as_u32(),
                    name: process.name().to_string_lossy().into_owned(),
                    args: process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                })
            })
            .collect()
    }
}

/// Identifies the execution engine backing a guest: the process name starts with the engine
/// prefix and one of its arguments contains the given needle (usually the forwarded port).
#[derive(Debug, Clone, PartialEq)]
pub struct GuestSignal {
    pub name_prefix: String,
    pub arg_contains: String,
}
impl GuestSignal {
    pub fn new(name_prefix: &str, arg_contains: &str) -> Self {
        Self {
            name_prefix: name_prefix.to_string(),
            arg_contains: arg_contains.to_string(),
        }
    }

    pub fn matches(&self, process: &ProcessInfo) -> bool {
        process.name.starts_with(&self.name_prefix)
            && process
                .args
                .iter()
                .any(|arg| arg.contains(&self.arg_contains))
    }
}
impl fmt::Display for GuestSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}* with an argument containing `{}`",
            self.name_prefix, self.arg_contains
        )
    }
}

/// The process actually running the guest. The controller only looks it up, it never owns it:
/// terminating the launcher's process group is expected to bring it down.
#[derive(Debug, Clone)]
pub struct DiscoveredGuest {
    pub pid: u32,
    pub name: String,
    pub args: Vec<String>,
    /// When the process was first seen. Readiness latency is measured from here.
    pub discovered_at: Instant,
}

#[derive(Debug)]
pub enum Discovery {
    Found(DiscoveredGuest),
    NotFound,
    Cancelled,
}

/// Scans the table once and returns the matching process with the lowest pid.
pub fn scan_once(table: &mut dyn ProcessTable, signal: &GuestSignal) -> Option<ProcessInfo> {
    let candidates = table
        .scan()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(process) => Some(process),
            Err(err) => {
                trace!("skipping process {}: {}", err.pid, err.reason);
                None
            }
        })
        .filter(|process| signal.matches(process))
        .sorted_by_key(|process| process.pid)
        .collect_vec();

    if candidates.len() > 1 {
        warn!(
            "{} processes match {}, picking the lowest pid out of [{}]",
            candidates.len(),
            signal,
            candidates.iter().map(|process| process.pid).join(", ")
        );
    }

    candidates.into_iter().next()
}

/// Polls the process table until a process matching `signal` shows up, `timeout` elapses or
/// the token is cancelled. Not finding the guest is an expected outcome, not an error.
pub async fn discover(
    table: &mut dyn ProcessTable,
    signal: &GuestSignal,
    timeout: Duration,
    poll: Duration,
    token: &CancellationToken,
) -> Discovery {
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        if token.is_cancelled() {
            return Discovery::Cancelled;
        }

        if let Some(process) = scan_once(table, signal) {
            let discovered_at = Instant::now();
            debug!(
                "found {} (pid {}) after {:.3}s",
                process.name,
                process.pid,
                (discovered_at - started).as_secs_f64()
            );
            return Discovery::Found(DiscoveredGuest {
                pid: process.pid,
                name: process.name,
                args: process.args,
                discovered_at,
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Discovery::NotFound;
        }

        tokio::select! {
            _ = token.cancelled() => return Discovery::Cancelled,
            _ = tokio::time::sleep(poll.min(deadline - now)) => {}
        }
    }
}
