/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = "./unibench.toml")]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch a guest, measure its startup time and sample it until it exits or is interrupted
    Run {
        /// Name of the [[run]] table to execute
        name: String,

        /// Also print the result as JSON
        #[arg(long)]
        json: bool,

        /// Don't check whether the forwarded port is already taken
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Run a load generator against a running guest
    Bench {
        /// Name of the [[bench]] table to execute
        name: String,
    },

    /// Print statistics of a recorded time series
    Stats {
        /// Time series CSV file
        #[arg(default_value = "metrics/timeseries.csv")]
        file: PathBuf,
    },

    /// Write an example config file to the current directory
    Init,
}

pub fn parse() -> Cli {
    Cli::parse()
}
