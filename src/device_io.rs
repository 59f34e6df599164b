use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::HarnessError;
use crate::io_alignment::{align_up, pread_direct, pwrite_direct, AlignedBuf};

pub const SECTOR_SIZE: u64 = 512;

/// Positioned I/O handle on a device under test or a reference disk.
pub trait BlockDevice {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    /// Size in bytes as reported by seeking to the end
    fn size(&mut self) -> Result<u64>;
    /// Smallest unit direct I/O accepts
    fn block_size(&self) -> usize;
    fn describe(&self) -> String;
}

/// A block device opened for unbuffered I/O
pub struct DirectDevice {
    pub path: PathBuf,
    file: File,
    pub block_size: usize,
}

impl DirectDevice {
    /// Open a device with O_DIRECT. Without it reads are served from the page
    /// cache and a readback proves nothing, so there is no buffered fallback.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_DIRECT)
            .open(path)
            .map_err(|e| open_error(path, e))?;

        // Regular files don't answer BLKSSZGET; 4096 satisfies any filesystem's O_DIRECT
        let block_size = probe_block_size_raw(file.as_raw_fd()).unwrap_or(4096);

        Ok(DirectDevice {
            path: path.to_path_buf(),
            file,
            block_size,
        })
    }

    fn aligned(&self, len: usize) -> Result<AlignedBuf> {
        if len % self.block_size != 0 {
            return Err(anyhow!(
                "I/O of {} bytes on {:?} is not a multiple of the {} byte block size",
                len,
                self.path,
                self.block_size
            ));
        }
        AlignedBuf::new(len, self.block_size)
    }
}

impl BlockDevice for DirectDevice {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let mut buf = self.aligned(data.len())?;
        buf.as_mut_slice().copy_from_slice(data);
        pwrite_direct(self.file.as_raw_fd(), &buf, offset)
            .with_context(|| format!("write of {} bytes at {} to {:?}", data.len(), offset, self.path))
    }

    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        let mut buf = self.aligned(out.len())?;
        pread_direct(self.file.as_raw_fd(), &mut buf, offset)
            .with_context(|| format!("read of {} bytes at {} from {:?}", out.len(), offset, self.path))?;
        out.copy_from_slice(buf.as_slice());
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        self.file
            .seek(SeekFrom::End(0))
            .with_context(|| format!("Failed to seek to end of {:?}", self.path))
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// EINVAL on an O_DIRECT open: the driver or filesystem has no direct I/O
fn open_error(path: &Path, err: io::Error) -> anyhow::Error {
    if err.raw_os_error() == Some(libc::EINVAL) {
        return HarnessError::Precondition(format!(
            "{} does not support O_DIRECT",
            path.display()
        ))
        .into();
    }
    anyhow::Error::new(err).context(format!("Failed to open {:?}", path))
}

/// Probe block size using BLKSSZGET; accepts a raw fd
fn probe_block_size_raw(fd: RawFd) -> Result<usize> {
    const BLKSSZGET: libc::c_ulong = 0x1268;

    let mut blksz: libc::c_uint = 0;
    let ret = unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut blksz) };
    if ret != 0 || blksz == 0 {
        return Err(anyhow!("BLKSSZGET ioctl failed"));
    }
    Ok(blksz as usize)
}

/// Size of a disk found by seeking to its end
pub fn disk_size(path: &Path) -> Result<u64> {
    let mut f = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    f.seek(SeekFrom::End(0))
        .with_context(|| format!("Failed to seek to end of {:?}", path))
}

/// Overwrite the first `len` bytes of a disk with zeros, rounded up to
/// whole blocks.
pub fn zero_disk(path: &Path, len: u64) -> Result<()> {
    const CHUNK: u64 = 1 << 20;

    let mut dev = DirectDevice::open(path)?;
    let len = align_up(len, dev.block_size as u64);
    let zeros = vec![0u8; CHUNK as usize];
    let mut offset = 0;
    while offset < len {
        let n = CHUNK.min(len - offset) as usize;
        dev.write_at(offset, &zeros[..n])?;
        offset += n as u64;
    }
    Ok(())
}

/// In-memory device sharing its backing store between handles
#[derive(Debug, Clone)]
pub struct MemDevice {
    name: String,
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemDevice {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        MemDevice {
            name: name.into(),
            data: Arc::new(Mutex::new(vec![0u8; size])),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        match self.data.lock() {
            Ok(data) => data.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> Result<T>) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| anyhow!("{} lock poisoned", self.name))?;
        f(&mut data)
    }
}

fn bounds(offset: u64, len: usize, size: usize, name: &str) -> Result<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= size)
        .ok_or_else(|| anyhow!("{}: {} bytes at {} is beyond end ({})", name, len, offset, size))?;
    Ok(start..end)
}

impl BlockDevice for MemDevice {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let name = self.name.clone();
        self.with_data(|bytes| {
            let range = bounds(offset, data.len(), bytes.len(), &name)?;
            bytes[range].copy_from_slice(data);
            Ok(())
        })
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let name = self.name.clone();
        self.with_data(|bytes| {
            let range = bounds(offset, buf.len(), bytes.len(), &name)?;
            buf.copy_from_slice(&bytes[range]);
            Ok(())
        })
    }

    fn size(&mut self) -> Result<u64> {
        self.with_data(|bytes| Ok(bytes.len() as u64))
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE as usize
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
#[path = "../tests/unit/device_io_tests.rs"]
mod tests;
