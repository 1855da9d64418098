/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::sampler::Sample;
use anyhow::Context;
#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};
use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};
use tracing::debug;

pub const TIMESERIES_HEADER: &str = "Time (s),CPU Usage (%),Memory Usage (KB)";
pub const SUMMARY_HEADER: &str = "startup_time,total_duration,avg_cpu,status,config_descriptor";

/// One line of the summary file.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    /// Seconds with 3 decimals, or a sentinel such as `timeout`.
    pub startup_time: String,
    pub total_duration_secs: f64,
    pub avg_cpu_percent: Option<f64>,
    pub status: String,
    pub config_descriptor: String,
}
impl SummaryRow {
    fn to_csv(&self) -> String {
        format!(
            "{},{:.3},{},{},{}",
            self.startup_time.replace(',', ";"),
            self.total_duration_secs,
            self.avg_cpu_percent
                .map(|cpu| format!("{:.2}", cpu))
                .unwrap_or_default(),
            self.status.replace(',', ";"),
            self.config_descriptor.replace(',', ";"),
        )
    }
}

/// Appends rows to the time series and summary CSV files. Existing rows are never touched and
/// the header is only written into an empty file.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    timeseries_path: PathBuf,
    summary_path: PathBuf,
}
impl MetricsSink {
    pub fn new(timeseries_path: &Path, summary_path: &Path) -> Self {
        Self {
            timeseries_path: timeseries_path.to_path_buf(),
            summary_path: summary_path.to_path_buf(),
        }
    }

    pub fn timeseries_path(&self) -> &Path {
        &self.timeseries_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    pub fn append_samples(&self, samples: &[Sample]) -> anyhow::Result<()> {
        let rows = samples
            .iter()
            .map(|s| format!("{:.3},{:.2},{}", s.elapsed_secs, s.cpu_percent, s.memory_kb))
            .collect::<Vec<_>>();
        append_rows(&self.timeseries_path, TIMESERIES_HEADER, &rows)?;
        debug!(
            "appended {} samples to {}",
            samples.len(),
            self.timeseries_path.display()
        );
        Ok(())
    }

    pub fn append_summary(&self, row: &SummaryRow) -> anyhow::Result<()> {
        append_rows(&self.summary_path, SUMMARY_HEADER, &[row.to_csv()])
    }
}

/// Writes all rows with a single append so that concurrent runs don't interleave lines. The
/// header check and the write happen under an exclusive lock on the file.
fn append_rows(path: &Path, header: &str, rows: &[String]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .context(format!("Unable to create directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .context(format!("Unable to open {}", path.display()))?;
    let mut file = lock_exclusive(file, path)?;

    let mut buf = String::new();
    if file.metadata()?.len() == 0 {
        buf.push_str(header);
        buf.push('\n');
    }
    for row in rows {
        buf.push_str(row);
        buf.push('\n');
    }

    file.write_all(buf.as_bytes())
        .context(format!("Unable to write to {}", path.display()))?;
    file.sync_all()?;
    Ok(())
}

/// Blocks until no other writer holds the file. The lock is released on drop.
#[cfg(unix)]
fn lock_exclusive(file: File, path: &Path) -> anyhow::Result<Flock<File>> {
    Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| anyhow::anyhow!("Unable to lock {}: {}", path.display(), errno))
}

#[cfg(not(unix))]
fn lock_exclusive(file: File, _path: &Path) -> anyhow::Result<File> {
    Ok(file)
}

/// Reads a time series file back. Header lines are skipped wherever they appear.
pub fn read_samples(path: &Path) -> anyhow::Result<Vec<Sample>> {
    let file = File::open(path).context(format!("Unable to open {}", path.display()))?;

    let mut samples = vec![];
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line == TIMESERIES_HEADER {
            continue;
        }

        let parse_err = || format!("Malformed row {} in {}: {}", n + 1, path.display(), line);
        match line.split(',').map(str::trim).collect::<Vec<_>>()[..] {
            [time, cpu, mem] => samples.push(Sample {
                elapsed_secs: time.parse().with_context(parse_err)?,
                cpu_percent: cpu.parse().with_context(parse_err)?,
                memory_kb: mem.parse().with_context(parse_err)?,
            }),
            _ => return Err(anyhow::anyhow!(parse_err())),
        }
    }

    Ok(samples)
}
