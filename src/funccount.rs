use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::FuncCountConfig;
use crate::error::HarnessError;

/// Time funccount gets to print its table after SIGINT before it is killed
const STOP_GRACE: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(10);

/// Calls per kernel function over one measurement
pub type CallCounts = BTreeMap<String, u64>;

/// Counts kernel function calls while a benchmark runs
pub trait CallCounter {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<CallCounts>;
}

/// Match `name` against a pattern where `*` stands for any run of
/// characters. With `whole` unset only a prefix of `name` has to match, the
/// way tracing filters are checked against `available_filter_functions`.
pub fn wildcard_match(pattern: &str, name: &str, whole: bool) -> bool {
    let pieces: Vec<&str> = pattern.split('*').collect();
    let (first, tail) = match pieces.split_first() {
        Some(split) => split,
        None => return false,
    };
    let mut rest = match name.strip_prefix(first) {
        Some(rest) => rest,
        None => return false,
    };
    let (last, middle) = match tail.split_last() {
        Some(split) => split,
        None => return !whole || rest.is_empty(),
    };
    for piece in middle {
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    if whole {
        rest.ends_with(last)
    } else {
        rest.contains(last)
    }
}

/// Fail unless every pattern names at least one traceable function.
pub fn check_available(funcs: &[String], available: &str) -> Result<()> {
    for func in funcs {
        // lines may carry a module suffix: "ext4_sync_fs [ext4]"
        if !available.lines().any(|line| wildcard_match(func, line, false)) {
            return Err(HarnessError::Precondition(format!(
                "function not available for tracing: {}",
                func
            ))
            .into());
        }
    }
    Ok(())
}

/// Pick the requested functions out of funccount's `FUNC COUNT` table.
pub fn parse_counts(output: &str, funcs: &[String]) -> CallCounts {
    let mut counts = CallCounts::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (name, count) = match (fields.next(), fields.next()) {
            (Some(name), Some(count)) => (name, count),
            _ => continue,
        };
        // bcc under python3 prints names as b'...'
        let name = name.trim_start_matches("b'").trim_end_matches('\'');
        if !funcs.iter().any(|f| wildcard_match(f, name, true)) {
            continue;
        }
        if let Ok(count) = count.parse::<u64>() {
            counts.insert(name.to_string(), count);
        }
    }
    counts
}

/// funccount (perf-tools or bcc) running in its own process group
pub struct FuncCount {
    executable: String,
    funcs: Vec<String>,
    child: Option<Child>,
}

impl FuncCount {
    /// Validate the patterns against ftrace's function list.
    pub fn new(config: &FuncCountConfig) -> Result<Self> {
        if config.functions.is_empty() {
            return Err(anyhow!("no functions to count"));
        }
        let available = fs::read_to_string(&config.filter_functions)
            .with_context(|| format!("Failed to read {:?}", config.filter_functions))?;
        check_available(&config.functions, &available)?;

        Ok(FuncCount {
            executable: config.executable.clone(),
            funcs: config.functions.clone(),
            child: None,
        })
    }

    /// bcc takes one `|`-joined pattern, perf-tools a space separated list
    pub fn pattern_arg(&self) -> String {
        if self.executable.contains("bpfcc") {
            self.funcs.join("|")
        } else {
            self.funcs.join(" ")
        }
    }

    fn command_line(&self) -> String {
        format!("{} {}", self.executable, self.pattern_arg())
    }

    /// SIGINT the whole group, then kill it if it lingers past the grace period
    fn interrupt(child: &mut Child) -> Result<()> {
        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGINT) {
            log::debug!("SIGINT to process group {} failed: {}", pgid, e);
        }

        let deadline = Instant::now() + STOP_GRACE;
        while child.try_wait()?.is_none() {
            if Instant::now() >= deadline {
                log::warn!("funccount ignored SIGINT, killing it");
                child.kill().context("Failed to kill funccount")?;
                break;
            }
            thread::sleep(STOP_POLL);
        }
        Ok(())
    }
}

impl CallCounter for FuncCount {
    fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(anyhow!("funccount is already running"));
        }
        log::debug!("starting {}", self.command_line());
        let child = Command::new(&self.executable)
            .arg(self.pattern_arg())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to start {}", self.executable))?;
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<CallCounts> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| anyhow!("funccount was not started"))?;
        Self::interrupt(&mut child)?;
        let output = child
            .wait_with_output()
            .context("Failed to collect funccount output")?;

        if !output.status.success() {
            return Err(HarnessError::ExternalTool {
                command: self.command_line(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(parse_counts(&String::from_utf8_lossy(&output.stdout), &self.funcs))
    }
}

impl Drop for FuncCount {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().and_then(|_| child.wait()) {
                log::debug!("failed to reap funccount: {}", e);
            }
        }
    }
}
