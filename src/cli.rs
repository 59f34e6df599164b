use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::artifact::FAILURE_ARTIFACT;
use crate::config::{
    parse_size, ArrayConfiguration, DiskSource, FioConfig, FuncCountConfig, HarnessConfig,
    IntegrityConfig, RaidLevel, SweepConfig,
};
use crate::logging::KmsgSink;
use crate::sweep::Direction;

#[derive(Parser)]
#[command(name = "mdstress")]
#[command(about = "Data integrity and performance harness for md RAID arrays", long_about = None)]
pub struct Cli {
    /// Output results in JSON format
    #[arg(long, global = true, env = "MDSTRESS_JSON")]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write, read back and verify data through degrade, recover and grow
    Integrity(IntegrityArgs),

    /// Rebuild the array across a parameter grid and benchmark each point with fio
    Sweep(SweepArgs),

    /// Re-reduce and print a saved sweep report
    Report {
        /// JSON report written by `sweep --output`
        input: PathBuf,
    },
}

fn size_arg(value: &str) -> Result<u64, String> {
    parse_size(value).map_err(|e| e.to_string())
}

fn direction_arg(value: &str) -> Result<Direction, String> {
    match value.to_lowercase().as_str() {
        "read" | "r" => Ok(Direction::Read),
        "write" | "w" => Ok(Direction::Write),
        _ => Err(format!("Unknown direction '{}'", value)),
    }
}

/// Array layout, shared by every command that builds an array
#[derive(Args, Clone, Debug)]
pub struct ArrayArgs {
    /// md device name under /dev
    #[arg(long, env = "MDSTRESS_MD", default_value = "md0")]
    pub md: String,

    /// Raid level
    #[arg(short, long, env = "MDSTRESS_LEVEL", default_value = "5")]
    pub level: RaidLevel,

    /// md chunk size [default: 64K, 4K with --sim]
    #[arg(short, long, env = "MDSTRESS_CHUNK_SIZE", value_parser = size_arg)]
    pub chunk_size: Option<u64>,

    /// Number of ram disks to create
    #[arg(short, long, visible_alias = "ram-disks", env = "MDSTRESS_DISKS",
          conflicts_with_all = ["loop_disks", "devs"])]
    pub disks: Option<usize>,

    /// Use this many loop devices instead of ram disks (needs --size)
    #[arg(long, env = "MDSTRESS_LOOP_DISKS", conflicts_with = "devs")]
    pub loop_disks: Option<usize>,

    /// Specific disks to use
    #[arg(long, env = "MDSTRESS_DEVS", num_args = 1.., value_delimiter = ',')]
    pub devs: Vec<PathBuf>,

    /// Reference disk for verification when using --devs
    #[arg(long, env = "MDSTRESS_SPECIAL_DISK")]
    pub special_disk: Option<PathBuf>,

    /// Resync after creating the array
    #[arg(long, env = "MDSTRESS_NO_ASSUME_CLEAN")]
    pub no_assume_clean: bool,

    /// Don't force mdadm creation
    #[arg(long, env = "MDSTRESS_NO_FORCE")]
    pub no_force: bool,

    /// Don't prompt to start the array
    #[arg(long, env = "MDSTRESS_RUN")]
    pub run: bool,

    /// Consistency policy
    #[arg(long, env = "MDSTRESS_POLICY", default_value = "resync")]
    pub policy: String,

    /// Be quiet
    #[arg(long, env = "MDSTRESS_QUIET")]
    pub quiet: bool,

    /// Group thread count for the array
    #[arg(long, env = "MDSTRESS_THREAD_CNT", default_value_t = 4)]
    pub thread_cnt: u32,

    /// Stripe cache size
    #[arg(long, env = "MDSTRESS_CACHE_SIZE", default_value_t = 8192)]
    pub cache_size: u32,

    /// Write journal device
    #[arg(long, env = "MDSTRESS_JOURNAL")]
    pub journal: Option<PathBuf>,

    /// Size used from each disk
    #[arg(long, env = "MDSTRESS_SIZE", value_parser = size_arg)]
    pub size: Option<u64>,

    /// Run against an in-memory array instead of md
    #[arg(long, env = "MDSTRESS_SIM")]
    pub sim: bool,
}

impl ArrayArgs {
    pub fn disk_source(&self) -> Result<DiskSource> {
        if !self.devs.is_empty() {
            return Ok(DiskSource::Devices {
                paths: self.devs.clone(),
            });
        }
        if let Some(count) = self.loop_disks {
            let size = self
                .size
                .ok_or_else(|| anyhow!("Must specify --size with --loop-disks"))?;
            return Ok(DiskSource::LoopDisks { count, size });
        }
        Ok(DiskSource::RamDisks {
            count: self.disks.unwrap_or(3),
        })
    }

    /// Layout from the flags, taking the chunk size from `preset` when unset
    pub fn to_config(&self, preset: &ArrayConfiguration) -> Result<ArrayConfiguration> {
        Ok(ArrayConfiguration {
            level: self.level,
            chunk_size: self.chunk_size.unwrap_or(preset.chunk_size),
            disks: self.disk_source()?,
            thread_count: Some(self.thread_cnt),
            cache_size: self.cache_size,
            policy: self.policy.clone(),
            size: self.size,
            assume_clean: !self.no_assume_clean,
            force: !self.no_force,
            run: self.run,
            journal: self.journal.clone(),
            quiet: self.quiet,
        })
    }
}

#[derive(Args, Clone, Debug)]
pub struct IntegrityArgs {
    #[command(flatten)]
    pub array: ArrayArgs,

    /// Random writes per phase
    #[arg(long, env = "MDSTRESS_COUNT")]
    pub count: Option<usize>,

    /// One degraded disk and one grow only
    #[arg(short, long, env = "MDSTRESS_QUICK")]
    pub quick: bool,

    #[arg(long, env = "MDSTRESS_SKIP_BASIC")]
    pub skip_basic: bool,

    #[arg(long, env = "MDSTRESS_SKIP_RANDOM")]
    pub skip_random: bool,

    #[arg(long, env = "MDSTRESS_SKIP_DEGRADE")]
    pub skip_degrade: bool,

    #[arg(long, env = "MDSTRESS_SKIP_GROW")]
    pub skip_grow: bool,

    /// Don't mirror writes to a reference disk
    #[arg(long, env = "MDSTRESS_NO_VERIFY")]
    pub no_verify: bool,

    /// Seed of the random workload
    #[arg(long, env = "MDSTRESS_SEED", default_value_t = 0)]
    pub seed: u64,

    /// Where the read-back buffer of a failed write goes
    #[arg(long, env = "MDSTRESS_ARTIFACT", default_value = FAILURE_ARTIFACT)]
    pub artifact: PathBuf,

    /// Kernel log device for TEST annotations
    #[arg(long, env = "MDSTRESS_KMSG", default_value = KmsgSink::DEFAULT_PATH)]
    pub kmsg: PathBuf,
}

impl IntegrityArgs {
    pub fn to_config(&self) -> Result<HarnessConfig> {
        let mut config = if self.array.sim {
            HarnessConfig::simulated()
        } else if self.quick {
            HarnessConfig::quick()
        } else {
            HarnessConfig::full()
        };
        config.array = self.array.to_config(&config.array)?;

        let integrity: &mut IntegrityConfig = &mut config.integrity;
        if let Some(count) = self.count {
            integrity.count = count;
        }
        integrity.quick = self.quick;
        integrity.basic = !self.skip_basic;
        integrity.random = !self.skip_random;
        integrity.degrade = !self.skip_degrade;
        integrity.grow = !self.skip_grow;
        integrity.verify = !self.no_verify;
        integrity.seed = self.seed;

        config
            .validate()
            .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join("; ")))?;
        Ok(config)
    }
}

#[derive(Args, Clone, Debug)]
pub struct SweepArgs {
    #[command(flatten)]
    pub array: ArrayArgs,

    /// Chunk sizes to sweep
    #[arg(long, env = "MDSTRESS_CHUNK_SIZES", value_delimiter = ',', value_parser = size_arg,
          default_value = "16K,64K,256K")]
    pub chunk_sizes: Vec<u64>,

    /// Group thread counts to sweep
    #[arg(long, env = "MDSTRESS_THREAD_COUNTS", value_delimiter = ',', default_value = "0,4,8")]
    pub thread_counts: Vec<u32>,

    /// Stripe cache sizes to sweep
    #[arg(long, env = "MDSTRESS_CACHE_SIZES", value_delimiter = ',', default_value = "256,8192")]
    pub cache_sizes: Vec<u32>,

    /// Blocksizes for sequential bandwidth runs
    #[arg(long, env = "MDSTRESS_BW_BS", value_delimiter = ',', value_parser = size_arg,
          default_value = "1M")]
    pub bw_bs: Vec<u64>,

    /// Blocksizes for random IOPS runs
    #[arg(long, env = "MDSTRESS_IOPS_BS", value_delimiter = ',', value_parser = size_arg,
          default_value = "4K")]
    pub iops_bs: Vec<u64>,

    #[arg(long, env = "MDSTRESS_DIRECTIONS", value_delimiter = ',', value_parser = direction_arg,
          default_value = "read,write")]
    pub directions: Vec<Direction>,

    /// fio binary
    #[arg(long, env = "MDSTRESS_FIO", default_value = "fio")]
    pub fio: String,

    /// Seconds per fio run
    #[arg(long, env = "MDSTRESS_RUNTIME", default_value_t = 15)]
    pub runtime: u32,

    #[arg(long, env = "MDSTRESS_RAMP_TIME", default_value_t = 10)]
    pub ramp_time: u32,

    #[arg(long, env = "MDSTRESS_NUMJOBS", default_value_t = 16)]
    pub numjobs: u32,

    #[arg(long, env = "MDSTRESS_IODEPTH", default_value_t = 8)]
    pub iodepth: u32,

    /// Working set per fio job
    #[arg(long, env = "MDSTRESS_FIO_SIZE", default_value = "4G", value_parser = size_arg)]
    pub fio_size: u64,

    /// Record CPU utilisation of each run
    #[arg(long, env = "MDSTRESS_CPU")]
    pub cpu: bool,

    /// Kernel functions or `*` patterns to count during each run
    #[arg(long, env = "MDSTRESS_FUNCS", value_delimiter = ',')]
    pub funcs: Vec<String>,

    /// funccount binary; funccount-bpfcc is also understood
    #[arg(long, env = "MDSTRESS_FUNCCOUNT", default_value = "funccount")]
    pub funccount: String,

    /// Also save the JSON report here
    #[arg(short, long, env = "MDSTRESS_OUTPUT")]
    pub output: Option<PathBuf>,
}

impl SweepArgs {
    pub fn to_config(&self) -> Result<HarnessConfig> {
        let mut config = HarnessConfig::full();
        config.array = self.array.to_config(&config.array)?;
        config.sweep = SweepConfig {
            chunk_sizes: self.chunk_sizes.clone(),
            thread_counts: self.thread_counts.clone(),
            cache_sizes: self.cache_sizes.clone(),
            bw_blocksizes: self.bw_bs.clone(),
            iops_blocksizes: self.iops_bs.clone(),
            directions: self.directions.clone(),
        };
        config.fio = FioConfig {
            executable: self.fio.clone(),
            runtime: self.runtime,
            ramp_time: self.ramp_time,
            numjobs: self.numjobs,
            iodepth: self.iodepth,
            size: self.fio_size,
            cpu: self.cpu,
            ..FioConfig::default()
        };
        config.funccount = FuncCountConfig {
            executable: self.funccount.clone(),
            functions: self.funcs.clone(),
            ..FuncCountConfig::default()
        };
        config
            .validate()
            .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join("; ")))?;
        Ok(config)
    }
}
