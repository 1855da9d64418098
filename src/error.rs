/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Failures that end a run in the FAILED state and are reported to the operator.
///
/// Readiness timeouts, transient sampling failures and the guest exiting on its own are not
/// represented here: they are recorded in the `RunResult` instead.
#[derive(Debug)]
pub enum RunError {
    /// The run configuration is invalid.
    Config(String),
    /// The launcher could not be started. Never retried.
    LaunchFailure {
        command: String,
        source: anyhow::Error,
    },
    /// No process matching the discovery signal appeared in time. The launcher has already been
    /// terminated when this is returned.
    DiscoveryTimeout { signal: String, timeout: Duration },
    /// Anything else that went wrong after launch. Partial metrics have been flushed.
    Unexpected(anyhow::Error),
}

impl RunError {
    pub fn launch(command: &str, source: impl Into<anyhow::Error>) -> Self {
        RunError::LaunchFailure {
            command: command.to_string(),
            source: source.into(),
        }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RunError::Config(msg) => write!(f, "Invalid run configuration: {}", msg),
            RunError::LaunchFailure { command, source } => {
                write!(f, "Failed to launch guest with `{}`: {:#}", command, source)
            }
            RunError::DiscoveryTimeout { signal, timeout } => write!(
                f,
                "No guest process matching {} appeared within {:.1}s",
                signal,
                timeout.as_secs_f64()
            ),
            RunError::Unexpected(err) => write!(f, "Run aborted: {:#}", err),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RunError::LaunchFailure { source, .. } => Some(&**source),
            RunError::Unexpected(err) => Some(&**err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for RunError {
    fn from(value: anyhow::Error) -> Self {
        RunError::Unexpected(value)
    }
}
