/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::config::BenchConfig;
use anyhow::{anyhow, Context};
use colored::*;
use std::{fs::File, path::PathBuf};
use subprocess::{Exec, ExitStatus, Redirection};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Iteration {
    pub index: u32,
    pub output: PathBuf,
    pub status: ExitStatus,
}

/// Runs a load generator `bench.iterations` times in a row, blocking until each iteration
/// finishes. A failing iteration is logged and the next one runs anyway. The output is left for
/// external tooling, nothing here parses it.
///
/// # Arguments
///
/// * `bench` - the load generator to run
/// * `token` - checked between iterations
///
/// # Returns
///
/// The exit status of each completed iteration.
pub fn run_bench(bench: &BenchConfig, token: &CancellationToken) -> anyhow::Result<Vec<Iteration>> {
    let mut iterations = vec![];

    for index in 0..bench.iterations {
        if token.is_cancelled() {
            warn!("bench {} interrupted after {} iterations", bench.name, index);
            break;
        }

        let command = bench.command_for(index);
        let output = bench.output_path(index);
        println!(
            "> {} iteration {}/{}",
            bench.name.green(),
            index + 1,
            bench.iterations
        );
        println!("\t{}", format!("- {}", command).bright_black());

        let status = run_once(&command, bench.capture_stdout.then_some(&output))?;
        if status.success() {
            info!("bench {} iteration {} finished", bench.name, index);
        } else {
            warn!(
                "bench {} iteration {} exited with {:?}, continuing",
                bench.name, index, status
            );
        }

        iterations.push(Iteration {
            index,
            output,
            status,
        });
    }

    Ok(iterations)
}

fn run_once(command: &str, stdout: Option<&PathBuf>) -> anyhow::Result<ExitStatus> {
    let words = shlex::split(command)
        .ok_or_else(|| anyhow!("Command string is not POSIX compliant: {}", command))?;

    match &words[..] {
        [program, args @ ..] => {
            let mut exec = Exec::cmd(program).args(args);
            if let Some(path) = stdout {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = File::create(path)
                    .context(format!("Unable to create output file {}", path.display()))?;
                exec = exec.stdout(Redirection::File(file));
            }

            exec.join()
                .context(format!("Failed to run load generator, command: {}", command))
        }
        _ => Err(anyhow!("Empty bench command")),
    }
}
