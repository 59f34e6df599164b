use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::sweep::Direction;

/// Redundancy level of the array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidLevel {
    pub fn number(&self) -> u32 {
        match self {
            RaidLevel::Raid0 => 0,
            RaidLevel::Raid1 => 1,
            RaidLevel::Raid4 => 4,
            RaidLevel::Raid5 => 5,
            RaidLevel::Raid6 => 6,
            RaidLevel::Raid10 => 10,
        }
    }

    /// Members per stripe that carry redundancy rather than data
    pub fn parity_count(&self, members: usize) -> usize {
        match self {
            RaidLevel::Raid0 => 0,
            RaidLevel::Raid1 => members.saturating_sub(1),
            RaidLevel::Raid4 | RaidLevel::Raid5 => 1,
            RaidLevel::Raid6 => 2,
            RaidLevel::Raid10 => members / 2,
        }
    }

    pub fn data_members(&self, members: usize) -> usize {
        members.saturating_sub(self.parity_count(members))
    }

    /// Mirrors have no stripe to align benchmark offsets to
    pub fn is_striped(&self) -> bool {
        !matches!(self, RaidLevel::Raid1)
    }

    pub fn is_dual_parity(&self) -> bool {
        matches!(self, RaidLevel::Raid6)
    }

    /// raid4/5/6 share md's raid456 personality, the only one with a stripe
    /// cache and worker thread groups
    pub fn has_stripe_cache(&self) -> bool {
        matches!(self, RaidLevel::Raid4 | RaidLevel::Raid5 | RaidLevel::Raid6)
    }

    pub fn min_members(&self) -> usize {
        match self {
            RaidLevel::Raid0 => 1,
            RaidLevel::Raid1 => 2,
            RaidLevel::Raid4 | RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 | RaidLevel::Raid10 => 4,
        }
    }
}

impl fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raid{}", self.number())
    }
}

impl FromStr for RaidLevel {
    type Err = anyhow::Error;

    /// Accepts `5`, `raid5` and `RAID5`
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let digits = lower.strip_prefix("raid").unwrap_or(&lower);
        match digits {
            "0" => Ok(RaidLevel::Raid0),
            "1" => Ok(RaidLevel::Raid1),
            "4" => Ok(RaidLevel::Raid4),
            "5" => Ok(RaidLevel::Raid5),
            "6" => Ok(RaidLevel::Raid6),
            "10" => Ok(RaidLevel::Raid10),
            _ => Err(anyhow!("Unsupported raid level '{}'", s)),
        }
    }
}

/// Where the member disks come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskSource {
    /// brd ram disks, `/dev/ram0..`
    RamDisks { count: usize },
    /// loop devices over sparse files in /var/tmp
    LoopDisks { count: usize, size: u64 },
    Devices { paths: Vec<PathBuf> },
}

impl DiskSource {
    pub fn count(&self) -> usize {
        match self {
            DiskSource::RamDisks { count } | DiskSource::LoopDisks { count, .. } => *count,
            DiskSource::Devices { paths } => paths.len(),
        }
    }
}

/// Array layout and tuning. The sweep rewrites `chunk_size`, `thread_count`
/// and `cache_size`; none of them take effect until the array is set up again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayConfiguration {
    pub level: RaidLevel,
    /// Chunk size in bytes
    pub chunk_size: u64,
    pub disks: DiskSource,
    /// group_thread_cnt
    pub thread_count: Option<u32>,
    /// stripe_cache_size, in stripes; 0 leaves the kernel default
    pub cache_size: u32,
    /// Consistency policy: resync, bitmap, ppl, journal
    pub policy: String,
    /// Bytes used from each member
    pub size: Option<u64>,
    pub assume_clean: bool,
    pub force: bool,
    pub run: bool,
    pub journal: Option<PathBuf>,
    pub quiet: bool,
}

impl ArrayConfiguration {
    pub fn disk_count(&self) -> usize {
        self.disks.count()
    }
}

impl Default for ArrayConfiguration {
    fn default() -> Self {
        ArrayConfiguration {
            level: RaidLevel::Raid5,
            chunk_size: 64 << 10,
            disks: DiskSource::RamDisks { count: 3 },
            thread_count: Some(4),
            cache_size: 8192,
            policy: "resync".to_string(),
            size: None,
            assume_clean: true,
            force: true,
            run: false,
            journal: None,
            quiet: false,
        }
    }
}

/// Which integrity phases run, and how hard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Random writes per phase
    pub count: usize,
    /// Exercise one disk and one grow only
    pub quick: bool,
    pub basic: bool,
    pub random: bool,
    pub degrade: bool,
    pub grow: bool,
    /// Mirror writes to the reference disk and compare at the end
    pub verify: bool,
    /// Seed of the workload RNG
    pub seed: u64,
}

/// Parameter grid for the performance sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub chunk_sizes: Vec<u64>,
    pub thread_counts: Vec<u32>,
    pub cache_sizes: Vec<u32>,
    /// Sequential bandwidth blocksizes
    pub bw_blocksizes: Vec<u64>,
    /// Random IOPS blocksizes
    pub iops_blocksizes: Vec<u64>,
    pub directions: Vec<Direction>,
}

/// Fixed fio job parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FioConfig {
    pub executable: String,
    /// Seconds per run
    pub runtime: u32,
    pub ramp_time: u32,
    pub numjobs: u32,
    pub iodepth: u32,
    pub ioengine: String,
    /// Working set per job in bytes
    pub size: u64,
    /// Sample CPU utilisation around each run
    pub cpu: bool,
}

impl Default for FioConfig {
    fn default() -> Self {
        FioConfig {
            executable: "fio".to_string(),
            runtime: 15,
            ramp_time: 10,
            numjobs: 16,
            iodepth: 8,
            ioengine: "libaio".to_string(),
            size: 4 << 30,
            cpu: false,
        }
    }
}

/// Kernel function call counting around each benchmark run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncCountConfig {
    /// `funccount` (perf-tools) or `funccount-bpfcc` (bcc)
    pub executable: String,
    /// Function names or `*` patterns; empty turns counting off
    pub functions: Vec<String>,
    /// ftrace's list of traceable functions
    pub filter_functions: PathBuf,
}

impl Default for FuncCountConfig {
    fn default() -> Self {
        FuncCountConfig {
            executable: "funccount".to_string(),
            functions: Vec::new(),
            filter_functions: PathBuf::from("/sys/kernel/debug/tracing/available_filter_functions"),
        }
    }
}

/// Everything a session needs, passed explicitly instead of read from the
/// environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    pub array: ArrayConfiguration,
    pub integrity: IntegrityConfig,
    pub sweep: SweepConfig,
    pub fio: FioConfig,
    #[serde(default)]
    pub funccount: FuncCountConfig,
}

impl HarnessConfig {
    /// Full regression: every phase, every disk
    pub fn full() -> Self {
        HarnessConfig {
            array: ArrayConfiguration::default(),
            integrity: IntegrityConfig {
                count: 1000,
                quick: false,
                basic: true,
                random: true,
                degrade: true,
                grow: true,
                verify: true,
                seed: 0,
            },
            sweep: SweepConfig {
                chunk_sizes: vec![16 << 10, 64 << 10, 256 << 10],
                thread_counts: vec![0, 4, 8],
                cache_sizes: vec![256, 8192],
                bw_blocksizes: vec![1 << 20],
                iops_blocksizes: vec![4 << 10],
                directions: vec![Direction::Read, Direction::Write],
            },
            fio: FioConfig::default(),
            funccount: FuncCountConfig::default(),
        }
    }

    /// Smoke test: one degraded disk, one grow, short runs
    pub fn quick() -> Self {
        let mut config = Self::full();
        config.integrity.count = 100;
        config.integrity.quick = true;
        config.sweep.chunk_sizes = vec![64 << 10];
        config.sweep.thread_counts = vec![4];
        config.sweep.cache_sizes = vec![8192];
        config.fio.runtime = 5;
        config.fio.ramp_time = 2;
        config
    }

    /// Small enough for the in-memory array
    pub fn simulated() -> Self {
        let mut config = Self::quick();
        config.integrity.quick = false;
        config.integrity.count = 20;
        config.array.chunk_size = 4 << 10;
        config
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow!("Failed to parse config: {}", e))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let chunk_ok = |c: u64| c >= 4096 && c.is_power_of_two();

        if !chunk_ok(self.array.chunk_size) {
            errors.push("chunk_size must be a power of two >= 4K".to_string());
        }

        let disks = self.array.disk_count();
        if disks < self.array.level.min_members() {
            errors.push(format!(
                "{} needs at least {} disks, have {}",
                self.array.level,
                self.array.level.min_members(),
                disks
            ));
        }

        if let DiskSource::LoopDisks { size, .. } = self.array.disks {
            if size == 0 {
                errors.push("loop disk size must be > 0".to_string());
            }
        }

        if self.integrity.count == 0 {
            errors.push("count must be > 0".to_string());
        }

        if self.sweep.chunk_sizes.iter().any(|&c| !chunk_ok(c)) {
            errors.push("sweep chunk sizes must be powers of two >= 4K".to_string());
        }

        if self.sweep.chunk_sizes.is_empty()
            || self.sweep.thread_counts.is_empty()
            || self.sweep.cache_sizes.is_empty()
        {
            errors.push("sweep grid must have at least one value per axis".to_string());
        }

        if self
            .sweep
            .bw_blocksizes
            .iter()
            .chain(&self.sweep.iops_blocksizes)
            .any(|&bs| bs == 0 || bs % 512 != 0)
        {
            errors.push("blocksizes must be non-zero multiples of 512".to_string());
        }

        if self.sweep.directions.is_empty() {
            errors.push("sweep needs at least one direction".to_string());
        }

        if self.fio.size == 0 || self.fio.numjobs == 0 {
            errors.push("fio size and numjobs must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig::full()
    }
}

/// Configuration builder for fluent API
pub struct HarnessConfigBuilder {
    config: HarnessConfig,
}

impl HarnessConfigBuilder {
    pub fn new() -> Self {
        HarnessConfigBuilder {
            config: HarnessConfig::full(),
        }
    }

    pub fn from_preset(preset: &str) -> Self {
        let config = match preset {
            "quick" => HarnessConfig::quick(),
            "simulated" => HarnessConfig::simulated(),
            _ => HarnessConfig::full(),
        };

        HarnessConfigBuilder { config }
    }

    pub fn array(mut self, array: ArrayConfiguration) -> Self {
        self.config.array = array;
        self
    }

    pub fn level(mut self, level: RaidLevel) -> Self {
        self.config.array.level = level;
        self
    }

    pub fn disks(mut self, disks: DiskSource) -> Self {
        self.config.array.disks = disks;
        self
    }

    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.config.array.chunk_size = chunk_size;
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.config.integrity.count = count;
        self
    }

    pub fn quick(mut self, quick: bool) -> Self {
        self.config.integrity.quick = quick;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.config.integrity.verify = verify;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.integrity.seed = seed;
        self
    }

    /// Select integrity phases: basic, random, degrade, grow
    pub fn phases(mut self, basic: bool, random: bool, degrade: bool, grow: bool) -> Self {
        let i = &mut self.config.integrity;
        i.basic = basic;
        i.random = random;
        i.degrade = degrade;
        i.grow = grow;
        self
    }

    pub fn sweep(mut self, sweep: SweepConfig) -> Self {
        self.config.sweep = sweep;
        self
    }

    pub fn fio(mut self, fio: FioConfig) -> Self {
        self.config.fio = fio;
        self
    }

    pub fn build(self) -> Result<HarnessConfig> {
        match self.config.validate() {
            Ok(()) => Ok(self.config),
            Err(errors) => Err(anyhow!(
                "Configuration validation failed: {}",
                errors.join("; ")
            )),
        }
    }
}

impl Default for HarnessConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

const UNITS: [(char, u64); 5] = [
    ('K', 1 << 10),
    ('M', 1 << 20),
    ('G', 1 << 30),
    ('T', 1 << 40),
    ('B', 1),
];

/// Parse sizes such as `512`, `64K`, `64KB`, `1M`, `4g`.
pub fn parse_size(value: &str) -> Result<u64> {
    let upper = value.trim().to_uppercase();
    let body = upper.strip_suffix('B').filter(|b| !b.is_empty()).unwrap_or(&upper);
    let (digits, multiplier) = match body.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let unit = UNITS
                .iter()
                .find(|(u, _)| *u == c)
                .ok_or_else(|| anyhow!("Not a valid size: {}", value))?;
            (&body[..body.len() - 1], unit.1)
        }
        _ => (body, 1),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!("Not a valid size: {}", value));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| anyhow!("Not a valid size: {}", value))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("Size out of range: {}", value))
}

/// Shortest exact binary-suffixed form: 4096 -> `4K`, 1536 -> `1536`
pub fn format_size(bytes: u64) -> String {
    for (unit, multiplier) in UNITS.iter().take(4).rev() {
        if bytes >= *multiplier && bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, unit);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
#[path = "../tests/unit/config_tests.rs"]
mod tests;
