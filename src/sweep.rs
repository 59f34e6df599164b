use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::array::ArrayController;
use crate::bench::{BenchRequest, BenchResult, BenchmarkRunner};
use crate::config::{format_size, RaidLevel, SweepConfig};
use crate::error::check_interrupt;
use crate::funccount::{CallCounter, CallCounts};
use crate::io_alignment::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Sequential bandwidth or random IOPS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementKind {
    #[serde(rename = "bw")]
    Bandwidth,
    #[serde(rename = "iops")]
    Iops,
}

impl MeasurementKind {
    /// fio `readwrite` mode
    pub fn mode(&self, direction: Direction) -> &'static str {
        match (self, direction) {
            (MeasurementKind::Bandwidth, Direction::Read) => "read",
            (MeasurementKind::Bandwidth, Direction::Write) => "write",
            (MeasurementKind::Iops, Direction::Read) => "randread",
            (MeasurementKind::Iops, Direction::Write) => "randwrite",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            MeasurementKind::Bandwidth => "bw",
            MeasurementKind::Iops => "iops",
        }
    }

    /// Pull this kind's figure for `direction` out of a run
    pub fn extract(&self, direction: Direction, result: &BenchResult) -> f64 {
        result.result.total(|job| {
            let stats = match direction {
                Direction::Read => &job.read,
                Direction::Write => &job.write,
            };
            match self {
                MeasurementKind::Bandwidth => stats.bw,
                MeasurementKind::Iops => stats.iops,
            }
        })
    }

    /// Human form of a raw figure (KiB/s for bandwidth)
    pub fn display(&self, raw: f64) -> String {
        match self {
            MeasurementKind::Bandwidth => format!("{:.1} MiB/s", raw / 1024.0),
            MeasurementKind::Iops if raw >= 1000.0 => format!("{:.1}k", raw / 1000.0),
            MeasurementKind::Iops => format!("{:.0}", raw),
        }
    }
}

pub fn metric_name(direction: Direction, kind: MeasurementKind) -> String {
    format!("{}_{}", direction, kind.suffix())
}

/// One cell of the sweep grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPoint {
    pub chunk_size: u64,
    pub thread_count: u32,
    pub cache_size: u32,
    pub blocksize: u64,
    pub direction: Direction,
    pub kind: MeasurementKind,
}

impl fmt::Display for SweepPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk={} threads={} cache={}",
            format_size(self.chunk_size),
            self.thread_count,
            self.cache_size
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    #[serde(flatten)]
    pub point: SweepPoint,
    pub metric_name: String,
    pub raw_value: f64,
    pub display_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_user: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_system: Option<f64>,
    /// Kernel function calls during the run, when counting was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub func_counts: Option<CallCounts>,
}

impl MeasurementRecord {
    pub fn new(point: SweepPoint, result: &BenchResult) -> Self {
        let raw_value = point.kind.extract(point.direction, result);
        MeasurementRecord {
            point,
            metric_name: metric_name(point.direction, point.kind),
            raw_value,
            display_value: point.kind.display(raw_value),
            cpu_user: result.cpu.map(|c| c.user),
            cpu_system: result.cpu.map(|c| c.system),
            func_counts: None,
        }
    }
}

/// Spacing between benchmark jobs: the working set rounded up to a whole
/// number of stripes. Mirrors have no stripe and get `None`.
pub fn offset_increment(level: RaidLevel, members: usize, chunk_size: u64, working_set: u64) -> Option<u64> {
    if !level.is_striped() {
        return None;
    }
    let stripe = chunk_size * level.data_members(members) as u64;
    if stripe == 0 {
        return None;
    }
    Some(align_up(working_set, stripe))
}

/// Rebuilds the array for every (chunk, threads, cache) combination and
/// measures each blocksize and direction on it.
pub struct PerfSweepEngine<R: BenchmarkRunner> {
    sweep: SweepConfig,
    working_set: u64,
    runner: R,
    counter: Option<Box<dyn CallCounter>>,
    on_progress: Option<Box<dyn FnMut(f64)>>,
}

impl<R: BenchmarkRunner> PerfSweepEngine<R> {
    pub fn new(sweep: SweepConfig, working_set: u64, runner: R) -> Self {
        PerfSweepEngine {
            sweep,
            working_set,
            runner,
            counter: None,
            on_progress: None,
        }
    }

    /// Count kernel function calls around every benchmark run
    pub fn with_call_counter(mut self, counter: impl CallCounter + 'static) -> Self {
        self.counter = Some(Box::new(counter));
        self
    }

    /// Called with the completed percentage after every measurement
    pub fn with_progress(mut self, f: impl FnMut(f64) + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// One runner call, bracketed by the call counter when there is one
    fn measure(&mut self, request: &BenchRequest) -> Result<(BenchResult, Option<CallCounts>)> {
        let counter = match self.counter.as_mut() {
            Some(counter) => counter,
            None => return Ok((self.runner.run(request)?, None)),
        };
        counter.start()?;
        let result = self.runner.run(request);
        let counts = counter.stop();
        Ok((result?, Some(counts?)))
    }

    fn measurements(&self) -> Vec<(MeasurementKind, u64, Direction)> {
        let mut out = Vec::new();
        for (kind, sizes) in [
            (MeasurementKind::Bandwidth, &self.sweep.bw_blocksizes),
            (MeasurementKind::Iops, &self.sweep.iops_blocksizes),
        ] {
            for &blocksize in sizes {
                for &direction in &self.sweep.directions {
                    out.push((kind, blocksize, direction));
                }
            }
        }
        out
    }

    /// Number of runner invocations a full sweep makes
    pub fn planned(&self) -> usize {
        self.sweep.chunk_sizes.len()
            * self.sweep.thread_counts.len()
            * self.sweep.cache_sizes.len()
            * self.measurements().len()
    }

    pub fn run(&mut self, ctrl: &mut dyn ArrayController) -> Result<Vec<MeasurementRecord>> {
        let total = self.planned();
        let measurements = self.measurements();
        let mut records = Vec::with_capacity(total);
        let sweep = self.sweep.clone();

        for &chunk_size in &sweep.chunk_sizes {
            for &thread_count in &sweep.thread_counts {
                for &cache_size in &sweep.cache_sizes {
                    check_interrupt()?;
                    {
                        let config = ctrl.config_mut();
                        config.chunk_size = chunk_size;
                        config.thread_count = Some(thread_count);
                        config.cache_size = cache_size;
                    }
                    ctrl.setup()?;

                    let level = ctrl.get_level()?;
                    let members = ctrl.get_disks()?.len();
                    let increment = offset_increment(level, members, chunk_size, self.working_set);

                    for &(kind, blocksize, direction) in &measurements {
                        let point = SweepPoint {
                            chunk_size,
                            thread_count,
                            cache_size,
                            blocksize,
                            direction,
                            kind,
                        };
                        let request = BenchRequest {
                            blocksize,
                            mode: kind.mode(direction).to_string(),
                            offset_increment: increment,
                        };
                        check_interrupt()?;
                        let (result, func_counts) = self.measure(&request)?;
                        let mut record = MeasurementRecord::new(point, &result);
                        record.func_counts = func_counts;

                        let percent = (records.len() + 1) as f64 * 100.0 / total as f64;
                        log::info!(
                            "[{:5.1}%] {} {} {}: {}",
                            percent,
                            point,
                            format_size(blocksize),
                            record.metric_name,
                            record.display_value
                        );
                        if let Some(f) = self.on_progress.as_mut() {
                            f(percent);
                        }
                        records.push(record);
                    }
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
#[path = "../tests/unit/sweep_tests.rs"]
mod tests;
