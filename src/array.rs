use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::{ArrayConfiguration, DiskSource, RaidLevel};
use crate::device_io::{self, BlockDevice, DirectDevice};
use crate::error::HarnessError;

/// Lifecycle and fault operations on the array under test.
///
/// Disks are identified by the strings the array itself reports (device
/// paths for md). Configuration edits made through [`config_mut`] only take
/// effect at the next [`setup`].
///
/// [`config_mut`]: ArrayController::config_mut
/// [`setup`]: ArrayController::setup
pub trait ArrayController {
    /// Replace the configuration and assemble the array.
    fn create(&mut self, config: ArrayConfiguration) -> Result<()> {
        *self.config_mut() = config;
        self.setup()
    }

    /// Tear down any existing array and assemble it from the current configuration.
    fn setup(&mut self) -> Result<()>;

    fn config(&self) -> &ArrayConfiguration;
    fn config_mut(&mut self) -> &mut ArrayConfiguration;

    /// Open the array device for unbuffered I/O.
    fn open_direct(&mut self) -> Result<Box<dyn BlockDevice>>;

    /// Member devices the array is built from.
    fn devs(&mut self) -> Result<Vec<String>>;

    /// Current members in slot order, as reported by the array.
    fn get_disks(&self) -> Result<Vec<String>>;

    /// A disk outside the array used as the verification reference.
    fn get_special_disk(&mut self) -> Result<String>;

    /// Open a member or the special disk directly.
    fn open_disk(&mut self, disk: &str) -> Result<Box<dyn BlockDevice>>;

    fn disk_size(&mut self, disk: &str) -> Result<u64> {
        self.open_disk(disk)?.size()
    }

    /// Zero the first `size` bytes of every member and of the special disk.
    fn zero_all_disks(&mut self, size: u64) -> Result<()>;

    fn degrade(&mut self, disk: &str) -> Result<()>;
    fn recover(&mut self, disk: &str) -> Result<()>;

    /// Add one member and reshape; returns the new member count.
    fn grow(&mut self) -> Result<usize>;

    fn get_level(&self) -> Result<RaidLevel>;

    /// Block until resync, recovery and reshape have finished.
    fn wait(&mut self) -> Result<()>;

    /// Whether driving this array needs root.
    fn requires_root(&self) -> bool {
        false
    }
}

fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Run a command, failing with [`HarnessError::ExternalTool`] on a non-zero exit.
pub fn run_checked(cmd: &mut Command) -> Result<String> {
    let line = describe(cmd);
    log::debug!("running {}", line);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("Failed to run {}", line))?;
    crate::error::check_interrupt()?;
    if !output.status.success() {
        return Err(HarnessError::ExternalTool {
            command: line,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command whose failure is expected and ignored (nothing to stop, nothing to wait on).
fn run_ignored(cmd: &mut Command) -> Result<()> {
    let line = describe(cmd);
    log::debug!("running {}", line);
    let status = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("Failed to run {}", line))?;
    crate::error::check_interrupt()?;
    if !status.success() {
        log::debug!("{} exited with {}", line, status);
    }
    Ok(())
}

/// brd creates this many ram disks by default; the last one is the reference
const RAM_DISK_SLOTS: usize = 16;
const RAM_DISK_KIB: u64 = 131072;
const LOOP_BACKING_DIR: &str = "/var/tmp";

/// Linux md array driven through mdadm and sysfs
pub struct MdArray {
    md_dev: PathBuf,
    sysfs: PathBuf,
    config: ArrayConfiguration,
    special_disk: Option<PathBuf>,
}

impl MdArray {
    pub fn new(md: &str, config: ArrayConfiguration) -> Self {
        MdArray {
            md_dev: PathBuf::from("/dev").join(md),
            sysfs: PathBuf::from("/sys/block").join(md).join("md"),
            config,
            special_disk: None,
        }
    }

    /// Use an explicit reference disk instead of the spare ram/loop slot.
    pub fn with_special_disk(mut self, path: PathBuf) -> Self {
        self.special_disk = Some(path);
        self
    }

    pub fn device(&self) -> &Path {
        &self.md_dev
    }

    pub fn stop(&self) -> Result<()> {
        run_ignored(
            Command::new("mdadm")
                .arg("--stop")
                .arg(&self.md_dev)
                .arg("--quiet"),
        )
    }

    fn read_sysfs(&self, attr: &str) -> Result<String> {
        let path = self.sysfs.join(attr);
        let value = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        Ok(value.trim().to_string())
    }

    fn write_sysfs(&self, attr: &str, value: &str) -> Result<()> {
        let path = self.sysfs.join(attr);
        fs::write(&path, value).with_context(|| format!("Failed to write {} to {:?}", value, path))
    }

    pub fn get_num_disks(&self) -> Result<usize> {
        self.read_sysfs("raid_disks")?
            .parse()
            .context("Failed to parse raid_disks")
    }

    fn slot_block(&self, slot: usize) -> PathBuf {
        self.sysfs.join(format!("rd{}", slot)).join("block")
    }

    fn slot_disk(&self, slot: usize) -> Result<String> {
        let link = fs::read_link(self.slot_block(slot))
            .with_context(|| format!("Failed to resolve member rd{}", slot))?;
        let name = link
            .file_name()
            .ok_or_else(|| anyhow!("rd{} has no block device", slot))?;
        Ok(format!("/dev/{}", name.to_string_lossy()))
    }

    fn load_brd(&self) -> Result<()> {
        let kib = self.config.size.map(|s| s >> 10).unwrap_or(RAM_DISK_KIB);
        run_checked(
            Command::new("modprobe")
                .arg("brd")
                .arg(format!("rd_size={}", kib))
                .arg(format!("rd_nr={}", RAM_DISK_SLOTS)),
        )?;
        Ok(())
    }

    fn create_loop_disk(&self, index: usize, size: u64) -> Result<PathBuf> {
        let dev = PathBuf::from(format!("/dev/loop{}", index));
        let backing = Path::new(LOOP_BACKING_DIR).join(format!("lodisk{}", index));

        run_ignored(Command::new("losetup").arg("-d").arg(&dev))?;
        let file = fs::File::create(&backing)
            .with_context(|| format!("Failed to create {:?}", backing))?;
        file.set_len(size)
            .with_context(|| format!("Failed to size {:?}", backing))?;
        drop(file);
        run_checked(Command::new("losetup").arg(&dev).arg(&backing))?;
        Ok(dev)
    }

    /// Make sure the member disks exist and return them.
    fn provision(&mut self) -> Result<Vec<PathBuf>> {
        match self.config.disks.clone() {
            DiskSource::RamDisks { count } => {
                if count >= RAM_DISK_SLOTS {
                    return Err(anyhow!("at most {} ram disks", RAM_DISK_SLOTS - 1));
                }
                self.load_brd()?;
                Ok((0..count).map(|i| PathBuf::from(format!("/dev/ram{}", i))).collect())
            }
            DiskSource::LoopDisks { count, size } => (0..count)
                .map(|i| self.create_loop_disk(i, size))
                .collect(),
            DiskSource::Devices { paths } => Ok(paths),
        }
    }

    fn create_args(&self, disks: &[PathBuf]) -> Command {
        let c = &self.config;
        let mut cmd = Command::new("mdadm");
        cmd.arg("--create")
            .arg(&self.md_dev)
            .args(["--level", &c.level.number().to_string()])
            .args(["--chunk", &(c.chunk_size >> 10).to_string()])
            .args(["--raid-devices", &disks.len().to_string()])
            .args(["--consistency-policy", &c.policy]);

        if c.policy == "bitmap" {
            cmd.arg("--bitmap=internal");
        }
        if c.assume_clean {
            cmd.arg("--assume-clean");
        }
        if c.force {
            cmd.arg("--force");
        }
        if c.run {
            cmd.arg("--run");
        }
        if c.quiet {
            cmd.arg("--quiet");
        }
        if let Some(journal) = &c.journal {
            cmd.arg("--write-journal").arg(journal);
        }
        // loop disks are already sized
        if let (Some(size), false) = (c.size, matches!(c.disks, DiskSource::LoopDisks { .. })) {
            cmd.args(["--size", &(size >> 10).to_string()]);
        }
        cmd.args(disks);
        cmd
    }

    /// sysfs attributes written after create. Only raid456 arrays have
    /// them; other levels keep the kernel defaults.
    fn tuning_attributes(&self) -> Vec<(&'static str, String)> {
        let c = &self.config;
        if !c.level.has_stripe_cache() {
            if c.thread_count.is_some() || c.cache_size > 0 {
                log::debug!("{} has no stripe cache, skipping thread and cache tuning", c.level);
            }
            return Vec::new();
        }
        let mut attrs = Vec::new();
        if let Some(threads) = c.thread_count {
            attrs.push(("group_thread_cnt", threads.to_string()));
        }
        if c.cache_size > 0 {
            attrs.push(("stripe_cache_size", c.cache_size.to_string()));
        }
        attrs
    }

    /// `mdadm --manage <md> --quiet <op> <disk>`
    fn manage_args(&self, op: &str, disk: &str) -> Command {
        let mut cmd = Command::new("mdadm");
        cmd.arg("--manage")
            .arg(&self.md_dev)
            .args(["--quiet", op, disk]);
        cmd
    }

    fn add_args(&self, dev: &Path) -> Command {
        let mut cmd = Command::new("mdadm");
        cmd.arg("--add").arg(&self.md_dev).arg("--quiet").arg(dev);
        cmd
    }

    fn grow_args(&self, members: usize) -> Command {
        let mut cmd = Command::new("mdadm");
        cmd.args(["--grow", "--raid-devices", &members.to_string()])
            .arg(&self.md_dev);
        cmd
    }

    fn next_disk(&self) -> Result<PathBuf> {
        let first = self.slot_disk(0)?;
        let n = self.get_num_disks()?;
        if first.contains("ram") {
            if n + 1 >= RAM_DISK_SLOTS {
                return Err(anyhow!("no spare ram disk left to grow into"));
            }
            return Ok(PathBuf::from(format!("/dev/ram{}", n)));
        }
        if first.contains("loop") {
            let sectors: u64 = fs::read_to_string(self.slot_block(0).join("size"))
                .context("Failed to read member size")?
                .trim()
                .parse()
                .context("Failed to parse member size")?;
            return self.create_loop_disk(n, sectors << 9);
        }
        Err(anyhow!(
            "Can't grow array without using loop or ram disks"
        ))
    }
}

impl ArrayController for MdArray {
    fn setup(&mut self) -> Result<()> {
        self.wait()?;
        self.stop()?;

        let disks = self.provision()?;
        run_checked(&mut self.create_args(&disks))?;

        for (attr, value) in self.tuning_attributes() {
            self.write_sysfs(attr, &value)?;
        }
        log::info!(
            "created {} {} on {} disks, chunk {}K",
            self.md_dev.display(),
            self.config.level,
            disks.len(),
            self.config.chunk_size >> 10
        );
        Ok(())
    }

    fn config(&self) -> &ArrayConfiguration {
        &self.config
    }

    fn config_mut(&mut self) -> &mut ArrayConfiguration {
        &mut self.config
    }

    fn open_direct(&mut self) -> Result<Box<dyn BlockDevice>> {
        Ok(Box::new(DirectDevice::open(&self.md_dev)?))
    }

    fn devs(&mut self) -> Result<Vec<String>> {
        Ok(self
            .provision()?
            .iter()
            .map(|p| p.display().to_string())
            .collect())
    }

    fn get_disks(&self) -> Result<Vec<String>> {
        (0..self.get_num_disks()?).map(|slot| self.slot_disk(slot)).collect()
    }

    fn get_special_disk(&mut self) -> Result<String> {
        if let Some(path) = &self.special_disk {
            return Ok(path.display().to_string());
        }
        let slot = RAM_DISK_SLOTS - 1;
        let path = match self.config.disks {
            DiskSource::RamDisks { .. } => {
                self.load_brd()?;
                PathBuf::from(format!("/dev/ram{}", slot))
            }
            DiskSource::LoopDisks { size, .. } => self.create_loop_disk(slot, size)?,
            DiskSource::Devices { .. } => {
                return Err(HarnessError::Precondition(
                    "verification with explicit devices needs a reference disk".to_string(),
                )
                .into())
            }
        };
        self.special_disk = Some(path.clone());
        Ok(path.display().to_string())
    }

    fn open_disk(&mut self, disk: &str) -> Result<Box<dyn BlockDevice>> {
        Ok(Box::new(DirectDevice::open(Path::new(disk))?))
    }

    fn disk_size(&mut self, disk: &str) -> Result<u64> {
        device_io::disk_size(Path::new(disk))
    }

    fn zero_all_disks(&mut self, size: u64) -> Result<()> {
        self.wait()?;
        self.stop()?;
        let mut disks = self.devs()?;
        disks.push(self.get_special_disk()?);
        for disk in disks {
            log::info!("zeroing first {} bytes of {}", size, disk);
            device_io::zero_disk(Path::new(&disk), size)?;
        }
        Ok(())
    }

    fn degrade(&mut self, disk: &str) -> Result<()> {
        self.wait()?;
        run_checked(&mut self.manage_args("--fail", disk))?;
        run_checked(&mut self.manage_args("--remove", disk))?;
        Ok(())
    }

    fn recover(&mut self, disk: &str) -> Result<()> {
        run_checked(&mut self.manage_args("--add-spare", disk))?;
        Ok(())
    }

    fn grow(&mut self) -> Result<usize> {
        self.wait()?;
        let dev = self.next_disk()?;
        let n = self.get_num_disks()?;
        run_checked(&mut self.add_args(&dev))?;
        run_checked(&mut self.grow_args(n + 1))?;
        Ok(n + 1)
    }

    fn get_level(&self) -> Result<RaidLevel> {
        self.read_sysfs("level")?.parse()
    }

    fn wait(&mut self) -> Result<()> {
        run_ignored(
            Command::new("mdadm")
                .arg("--wait")
                .arg(&self.md_dev)
                .arg("--quiet"),
        )
    }

    fn requires_root(&self) -> bool {
        true
    }
}
