/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    lifecycle::{RunResult, StartupTime},
    sampler::SampleStats,
};
use colored::*;
use std::path::Path;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

pub fn print_run(result: &RunResult) {
    let status = match result.status.as_str() {
        "normal" | "interrupted" => result.status.green(),
        "timeout" => result.status.yellow(),
        _ => result.status.red(),
    };

    println!("\n{}", " Summary ".reversed().green());
    println!(
        "{} [{}] {}",
        result.run_name.green(),
        result.run_id.bright_black(),
        status
    );
    if let Some(err) = &result.error {
        println!("\t{}", err.red());
    }

    let startup = match result.startup {
        StartupTime::Ready(_) => result.startup.to_string().normal(),
        _ => result.startup.to_string().bright_black(),
    };

    let stats = result.stats;
    let cell = |value: Option<String>| TableCell::new(value.unwrap_or("--".to_string()));

    let table = Table::builder()
        .rows(rows![
            row![
                TableCell::builder("Appeared (s)".bold()).build(),
                TableCell::builder("Startup (s)".bold()).build(),
                TableCell::builder("Guest (s)".bold()).build(),
                TableCell::builder("Duration (s)".bold()).build(),
                TableCell::builder("Samples".bold()).build(),
                TableCell::builder("Avg CPU (%)".bold()).build(),
                TableCell::builder("Avg Mem (KB)".bold()).build(),
                TableCell::builder("Peak Mem (KB)".bold()).build()
            ],
            row![
                cell(result.discovery_latency_secs.map(|secs| format!("{:.3}", secs))),
                TableCell::new(startup),
                cell(result.guest_duration_secs.map(|secs| format!("{:.3}", secs))),
                TableCell::new(format!("{:.3}", result.total_duration_secs)),
                TableCell::new(stats.map_or(0, |stats| stats.count)),
                cell(stats.map(|stats| format!("{:.2}", stats.avg_cpu_percent))),
                cell(stats.map(|stats| format!("{:.0}", stats.avg_memory_kb))),
                cell(stats.map(|stats| stats.peak_memory_kb.to_string()))
            ]
        ])
        .style(TableStyle::rounded())
        .build();

    println!("{}", table.render());
}

pub fn print_stats(path: &Path, stats: Option<SampleStats>) {
    println!("{}:", path.display().to_string().green());
    let Some(stats) = stats else {
        println!("\t{}", "no samples".bright_black());
        return;
    };

    let table = Table::builder()
        .rows(rows![
            row![
                TableCell::builder("Samples".bold()).build(),
                TableCell::builder("Avg CPU (%)".bold()).build(),
                TableCell::builder("Avg Mem (KB)".bold()).build(),
                TableCell::builder("Peak Mem (KB)".bold()).build()
            ],
            row![
                TableCell::new(stats.count),
                TableCell::new(format!("{:.2}", stats.avg_cpu_percent)),
                TableCell::new(format!("{:.0}", stats.avg_memory_kb)),
                TableCell::new(stats.peak_memory_kb)
            ]
        ])
        .style(TableStyle::rounded())
        .build();

    println!("{}", table.render());
}
