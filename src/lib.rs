//! Data integrity and performance harness for redundant block arrays.
//!
//! The integrity side writes fill patterns through the array, reads every
//! write back, mirrors it to a reference disk and drives the array through
//! degrade, recover and grow in between. The performance side rebuilds the
//! array across a parameter grid, benchmarks each point with fio and reduces
//! the measurements to per-metric peaks.

pub mod array;
pub mod artifact;
pub mod bench;
pub mod cli;
pub mod config;
pub mod device_io;
pub mod error;
pub mod fault;
pub mod funccount;
pub mod io_alignment;
pub mod logging;
pub mod peaks;
pub mod redundancy;
pub mod report;
pub mod session;
pub mod sim;
pub mod sweep;
pub mod verify;
pub mod workload;

pub use crate::array::{ArrayController, MdArray};
pub use crate::config::{ArrayConfiguration, HarnessConfig, HarnessConfigBuilder, RaidLevel};
pub use crate::error::HarnessError;
pub use crate::session::IntegritySession;
pub use crate::sim::SimArray;
pub use crate::sweep::PerfSweepEngine;
