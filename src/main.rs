/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use dotenvy::dotenv;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;
use unibench::{
    bench,
    clap_args::{self, Cli, Commands},
    config::Config,
    sampler::SampleStats,
    sink, summary, LifecycleController,
};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = clap_args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("{} {:#}", "✗".red(), err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> anyhow::Result<ExitCode> {
    let level = if args.verbose { "debug" } else { "info" };
    set_global_default(get_subscriber(level)).context("Failed to set subscriber")?;

    match args.command {
        Commands::Init => {
            Config::write_example_to_file(&args.config)?;
            println!("> created {}", args.config.display().to_string().green());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run {
            name,
            json,
            skip_preflight,
        } => {
            let config = Config::try_from_path(&args.config)?;
            let run_config = config.find_run(&name)?.clone();
            let token = interrupt_token()?;

            let mut controller =
                LifecycleController::new(run_config, token).with_preflight(!skip_preflight);
            match controller.run().await {
                Ok(result) => {
                    if json {
                        println!("{}", serde_json::to_string_pretty(&result)?);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    eprintln!("{} {}", "✗".red(), err);
                    Ok(ExitCode::FAILURE)
                }
            }
        }

        Commands::Bench { name } => {
            let config = Config::try_from_path(&args.config)?;
            let bench_config = config.find_bench(&name)?.clone();
            let token = interrupt_token()?;

            let iterations =
                tokio::task::spawn_blocking(move || bench::run_bench(&bench_config, &token))
                    .await??;
            let failed = iterations.iter().filter(|it| !it.status.success()).count();
            println!(
                "> {} iterations finished, {} failed",
                iterations.len(),
                failed
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Stats { file } => {
            let samples = sink::read_samples(&file)?;
            summary::print_stats(&file, SampleStats::from_samples(&samples));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn get_subscriber(default_filter: &str) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

/// The handler only cancels the token, the main flow notices and tears down.
fn interrupt_token() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("Unable to install the interrupt handler")?;
    Ok(token)
}
