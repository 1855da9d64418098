/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod bench;
pub mod clap_args;
pub mod config;
pub mod discovery;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod preflight;
pub mod readiness;
pub mod sampler;
pub mod sink;
pub mod summary;

pub use config::{Config, RunConfig};
pub use error::RunError;
pub use lifecycle::{LifecycleController, RunResult, RunState, StartupTime, TerminationReason};
