use anyhow::{anyhow, Context, Result};

use crate::array::ArrayController;
use crate::artifact::ArtifactSink;
use crate::device_io::BlockDevice;
use crate::error::{check_interrupt, HarnessError};
use crate::io_alignment::align_up;
use crate::logging::AnnotationSink;
use crate::workload::WorkloadGenerator;

/// Fixed part of the compared region
pub const WINDOW_BASE: u64 = 10 << 20;
/// One byte of window per this many bytes of the smallest disk
pub const WINDOW_DIVISOR: u64 = 8192;

const COMPARE_CHUNK: usize = 1 << 20;

/// Region of the array and the reference disk that is zeroed up front and
/// compared at the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationWindow {
    pub size_bytes: u64,
    pub min_disk_size: u64,
}

impl VerificationWindow {
    pub fn for_min_disk_size(min_disk_size: u64) -> Self {
        VerificationWindow {
            size_bytes: WINDOW_BASE + min_disk_size / WINDOW_DIVISOR,
            min_disk_size,
        }
    }
}

/// Mirrors every test write to a disk outside the array and compares the two
/// once the workload is done.
///
/// The array under test may carry a narrow race that makes the final compare
/// fail on a run whose per-write readbacks all passed. Such a failure is
/// reported like any other mismatch.
#[derive(Debug, Default)]
pub struct VerificationEngine {
    window: Option<VerificationWindow>,
    special_disk: Option<String>,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self) -> Option<VerificationWindow> {
        self.window
    }

    /// Size the window from the smallest member or reference disk and zero
    /// that much of every disk. Runs before the array is assembled: zeroing
    /// afterwards would wipe the array's own metadata.
    pub fn prepare(&mut self, ctrl: &mut dyn ArrayController) -> Result<VerificationWindow> {
        let special = ctrl.get_special_disk()?;
        let mut disks = ctrl.devs()?;
        disks.push(special.clone());

        let mut min_disk_size = u64::MAX;
        for disk in &disks {
            let size = ctrl
                .disk_size(disk)
                .with_context(|| format!("Failed to size {}", disk))?;
            log::debug!("{}: {} bytes", disk, size);
            min_disk_size = min_disk_size.min(size);
        }

        let window = VerificationWindow::for_min_disk_size(min_disk_size);
        if window.size_bytes > min_disk_size {
            return Err(HarnessError::Precondition(format!(
                "smallest disk ({} bytes) cannot hold the {} byte verification window",
                min_disk_size, window.size_bytes
            ))
            .into());
        }

        log::info!(
            "verification window {} bytes (smallest disk {} bytes), reference {}",
            window.size_bytes,
            min_disk_size,
            special
        );
        ctrl.zero_all_disks(window.size_bytes)?;

        self.window = Some(window);
        self.special_disk = Some(special);
        Ok(window)
    }

    /// Hand the reference disk to the generator so it receives every write.
    pub fn attach<S: AnnotationSink, A: ArtifactSink>(
        &self,
        ctrl: &mut dyn ArrayController,
        generator: &mut WorkloadGenerator<S, A>,
    ) -> Result<()> {
        let special = self
            .special_disk
            .as_deref()
            .ok_or_else(|| anyhow!("verification was not prepared"))?;
        generator.attach_reference(ctrl.open_disk(special)?);
        Ok(())
    }

    /// Compare the window of the array device against the reference disk.
    pub fn verify(&self, device: &mut dyn BlockDevice, reference: &mut dyn BlockDevice) -> Result<()> {
        let window = self
            .window
            .ok_or_else(|| anyhow!("verification was not prepared"))?;
        log::info!(
            "comparing {} bytes of {} against {}",
            window.size_bytes,
            device.describe(),
            reference.describe()
        );

        let unit = device.block_size().max(reference.block_size()) as u64;
        let mut offset = 0u64;
        while offset < window.size_bytes {
            check_interrupt()?;
            let want = (window.size_bytes - offset).min(COMPARE_CHUNK as u64);
            // direct I/O reads whole blocks; only the window part is compared
            let len = align_up(want, unit) as usize;
            let mut ours = vec![0u8; len];
            let mut theirs = vec![0u8; len];
            device.read_at(offset, &mut ours)?;
            reference.read_at(offset, &mut theirs)?;

            let want = want as usize;
            if let Some(index) = ours[..want]
                .iter()
                .zip(&theirs[..want])
                .position(|(a, b)| a != b)
            {
                let at = offset + index as u64;
                return Err(HarnessError::DataIntegrity {
                    offset: at,
                    detail: format!(
                        "{} has {:#04x}, reference {} has {:#04x}",
                        device.describe(),
                        ours[index],
                        reference.describe(),
                        theirs[index]
                    ),
                }
                .into());
            }
            offset += want as u64;
        }
        log::info!("verification passed");
        Ok(())
    }
}

#[cfg(test)]
#[path = "../tests/unit/verify_tests.rs"]
mod tests;
