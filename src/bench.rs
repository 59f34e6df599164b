use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::array::run_checked;
use crate::config::FioConfig;

/// One benchmark invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchRequest {
    pub blocksize: u64,
    /// fio `readwrite` mode: read, write, randread or randwrite
    pub mode: String,
    /// Distance between the start offsets of consecutive jobs; `None` keeps
    /// every job at offset 0
    pub offset_increment: Option<u64>,
}

/// Per-direction figures of one fio job. `bw` is in KiB/s.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FioStats {
    #[serde(default)]
    pub bw: f64,
    #[serde(default)]
    pub iops: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FioJob {
    #[serde(default)]
    pub read: FioStats,
    #[serde(default)]
    pub write: FioStats,
}

/// The part of fio's JSON output the sweep consumes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FioOutput {
    #[serde(default)]
    pub jobs: Vec<FioJob>,
}

impl FioOutput {
    /// Sum of `pick` over all jobs
    pub fn total(&self, pick: impl Fn(&FioJob) -> f64) -> f64 {
        self.jobs.iter().map(pick).sum()
    }
}

/// System-wide CPU utilisation over a run, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub user: f64,
    pub system: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchResult {
    pub cmd: Vec<String>,
    pub result: FioOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuUsage>,
}

pub trait BenchmarkRunner {
    fn run(&mut self, request: &BenchRequest) -> Result<BenchResult>;
}

/// Aggregate jiffies from the first line of /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    user: u64,
    system: u64,
    total: u64,
}

impl CpuSample {
    pub fn read() -> Result<Self> {
        let stat = fs::read_to_string("/proc/stat").context("Failed to read /proc/stat")?;
        Self::parse(&stat)
    }

    pub fn parse(stat: &str) -> Result<Self> {
        let line = stat
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| anyhow!("no aggregate cpu line in /proc/stat"))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|f| f.parse::<u64>())
            .collect::<std::result::Result<_, _>>()
            .context("Failed to parse /proc/stat")?;
        if fields.len() < 4 {
            return Err(anyhow!("short cpu line in /proc/stat"));
        }
        // user nice system idle iowait irq softirq steal ...
        Ok(CpuSample {
            user: fields[0] + fields[1],
            system: fields[2],
            total: fields.iter().take(8).sum(),
        })
    }

    /// Utilisation between `earlier` and this sample
    pub fn since(&self, earlier: &CpuSample) -> CpuUsage {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return CpuUsage {
                user: 0.0,
                system: 0.0,
            };
        }
        let pct = |now: u64, then: u64| now.saturating_sub(then) as f64 * 100.0 / total as f64;
        CpuUsage {
            user: pct(self.user, earlier.user),
            system: pct(self.system, earlier.system),
        }
    }
}

/// Runs fio against the array device
pub struct FioRunner {
    filename: PathBuf,
    config: FioConfig,
}

impl FioRunner {
    pub fn new(filename: &Path, config: FioConfig) -> Self {
        FioRunner {
            filename: filename.to_path_buf(),
            config,
        }
    }

    /// `--key=value` options, in fio's order
    pub fn options(&self, request: &BenchRequest) -> Vec<String> {
        let c = &self.config;
        let mut opts: Vec<(&str, String)> = vec![
            ("filename", self.filename.display().to_string()),
            ("name", "md_test".to_string()),
            ("blocksize", request.blocksize.to_string()),
            ("runtime", c.runtime.to_string()),
            ("size", c.size.to_string()),
            ("numjobs", c.numjobs.to_string()),
            ("fallocate", "none".to_string()),
            ("time_based", "1".to_string()),
            ("ramp_time", c.ramp_time.to_string()),
            ("group_reporting", "1".to_string()),
            ("direct", "1".to_string()),
            ("ioengine", c.ioengine.clone()),
            ("iodepth", c.iodepth.to_string()),
        ];
        if let Some(increment) = request.offset_increment {
            opts.push(("offset_increment", increment.to_string()));
        }
        opts.push(("output-format", "json".to_string()));
        opts.push(("readwrite", request.mode.clone()));

        opts.into_iter()
            .map(|(key, val)| format!("--{}={}", key, val))
            .collect()
    }
}

impl BenchmarkRunner for FioRunner {
    fn run(&mut self, request: &BenchRequest) -> Result<BenchResult> {
        let options = self.options(request);
        let mut cmd = vec![self.config.executable.clone()];
        cmd.extend(options.iter().cloned());

        let before = if self.config.cpu {
            Some(CpuSample::read()?)
        } else {
            None
        };

        let stdout = run_checked(Command::new(&self.config.executable).args(&options))?;

        let cpu = match before {
            Some(before) => Some(CpuSample::read()?.since(&before)),
            None => None,
        };
        let result: FioOutput =
            serde_json::from_str(&stdout).context("Failed to parse fio output")?;

        Ok(BenchResult { cmd, result, cpu })
    }
}
