/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    config::{Redirect, RunConfig},
    error::RunError,
};
use chrono::{DateTime, Utc};
use std::{
    fs::{self, OpenOptions},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long to wait for the process group after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// The launcher process and the process group it leads.
#[derive(Debug)]
pub struct GuestHandle {
    child: Child,
    pid: u32,
    command: String,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    released: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TerminateOutcome {
    /// The group exited after SIGTERM.
    Terminated,
    /// The group ignored SIGTERM for the whole grace period and was killed.
    Killed,
    /// Still alive after SIGKILL, given up on.
    Unresponsive,
    /// `terminate` already ran for this handle.
    AlreadyReleased,
}

/// Spawns the launcher as the leader of a new process group, so that terminating it later
/// reaches everything it started. Never retried.
pub fn launch(config: &RunConfig) -> Result<GuestHandle, RunError> {
    let words = config
        .launch_command()
        .map_err(|err| RunError::launch(&config.name, err))?;
    let command_line = words.join(" ");

    let (program, args) = match &words[..] {
        [program, args @ ..] => (program, args),
        _ => return Err(RunError::launch(&command_line, anyhow::anyhow!("Empty command"))),
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&config.launch.directory)
        .stdin(Stdio::null());

    match config.launch.redirect {
        Redirect::Null => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        Redirect::Parent => {}
        Redirect::File => {
            let path = &config.launch.log_file;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|err| RunError::launch(&command_line, err))?;
            }
            let out_file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map_err(|err| RunError::launch(&command_line, err))?;
            let err_file = out_file
                .try_clone()
                .map_err(|err| RunError::launch(&command_line, err))?;
            command.stdout(out_file).stderr(err_file);
        }
    }

    #[cfg(unix)]
    command.process_group(0);

    let started_at = Instant::now();
    let started_at_utc = Utc::now();
    let child = command
        .spawn()
        .map_err(|err| RunError::launch(&command_line, err))?;
    let pid = child.id().ok_or_else(|| {
        RunError::launch(&command_line, anyhow::anyhow!("Process should have a PID"))
    })?;

    debug!("launched `{}` as pid {}", command_line, pid);
    Ok(GuestHandle {
        child,
        pid,
        command: command_line,
        started_at,
        started_at_utc,
        released: false,
    })
}

impl GuestHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    /// Waits for the launcher to exit on its own. Cancel safe.
    pub async fn wait_exit(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminates the launcher's whole process group: SIGTERM, up to `grace` for it to go away,
    /// then SIGKILL. Best effort, and only the first call does anything.
    pub async fn terminate(&mut self, grace: Duration) -> TerminateOutcome {
        if self.released {
            return TerminateOutcome::AlreadyReleased;
        }
        self.released = true;

        self.kill_group(grace).await
    }

    #[cfg(not(unix))]
    async fn kill_group(&mut self, _grace: Duration) -> TerminateOutcome {
        if let Err(err) = self.child.start_kill() {
            warn!("failed to kill launcher {}: {}", self.pid, err);
        }
        match tokio::time::timeout(KILL_WAIT, self.child.wait()).await {
            Ok(_) => TerminateOutcome::Killed,
            Err(_) => TerminateOutcome::Unresponsive,
        }
    }

    #[cfg(unix)]
    async fn kill_group(&mut self, grace: Duration) -> TerminateOutcome {
        use nix::sys::signal::Signal;

        self.signal_group(Signal::SIGTERM);
        if self.wait_group(grace).await {
            debug!("process group {} exited after SIGTERM", self.pid);
            return TerminateOutcome::Terminated;
        }

        warn!(
            "process group {} still alive after {:.1}s, sending SIGKILL",
            self.pid,
            grace.as_secs_f64()
        );
        self.signal_group(Signal::SIGKILL);
        if self.wait_group(KILL_WAIT).await {
            TerminateOutcome::Killed
        } else {
            warn!("giving up on process group {}", self.pid);
            TerminateOutcome::Unresponsive
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

        match killpg(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!("failed to send {:?} to process group {}: {}", signal, self.pid, err),
        }
    }

    /// Waits for the launcher to be reaped and for the rest of its group to disappear.
    #[cfg(unix)]
    async fn wait_group(&mut self, timeout: Duration) -> bool {
        use nix::{
            sys::signal::{killpg, Signal},
            unistd::Pid,
        };

        let deadline = Instant::now() + timeout;
        if tokio::time::timeout(timeout, self.child.wait()).await.is_err() {
            return false;
        }

        let pgid = Pid::from_raw(self.pid as i32);
        loop {
            // signal 0 only checks whether any member is left
            if killpg(pgid, None::<Signal>).is_err() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
