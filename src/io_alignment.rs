#![cfg(unix)]

use anyhow::Result;
use std::ffi::c_void;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// Simple RAII wrapper for aligned memory allocated via posix_memalign
pub struct AlignedBuf {
    ptr: *mut u8,
    size: usize,
    alignment: usize,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of `size` bytes aligned to `alignment`.
    pub fn new(size: usize, alignment: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            anyhow::bail!("alignment must be a non-zero power of two");
        }
        if size == 0 {
            anyhow::bail!("size must be non-zero");
        }

        let mut ptr: *mut c_void = ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut ptr, alignment, size) };
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret).into());
        }
        if ptr.is_null() {
            anyhow::bail!("posix_memalign returned null");
        }
        unsafe { ptr::write_bytes(ptr as *mut u8, 0, size) };

        Ok(AlignedBuf {
            ptr: ptr as *mut u8,
            size,
            alignment,
        })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    fn check(&self, offset: u64) -> Result<()> {
        if (self.ptr as usize) % self.alignment != 0 {
            anyhow::bail!("buffer pointer not aligned");
        }
        if self.size % self.alignment != 0 {
            anyhow::bail!(
                "buffer length {} is not a multiple of {}",
                self.size,
                self.alignment
            );
        }
        if offset % self.alignment as u64 != 0 {
            anyhow::bail!("offset {} is not a multiple of {}", offset, self.alignment);
        }
        Ok(())
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.ptr as *mut c_void);
            self.ptr = ptr::null_mut();
        }
    }
}

/// Align value up to multiple of `align`
pub fn align_up(value: u64, align: u64) -> u64 {
    if align == 0 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Write the whole buffer at `offset`. Retries on EINTR; a zero-length
/// write is reported as an error rather than returned short.
pub fn pwrite_direct(fd: RawFd, buf: &AlignedBuf, offset: u64) -> Result<()> {
    buf.check(offset)?;

    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::pwrite(
                fd,
                buf.ptr.add(done) as *const c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        if ret == 0 {
            anyhow::bail!("short write at offset {}: {} of {}", offset, done, buf.len());
        }
        done += ret as usize;
    }
    Ok(())
}

/// Fill the whole buffer from `offset`. Retries on EINTR; hitting end of
/// device before the buffer is full is an error.
pub fn pread_direct(fd: RawFd, buf: &mut AlignedBuf, offset: u64) -> Result<()> {
    buf.check(offset)?;

    let mut done = 0usize;
    while done < buf.len() {
        let ret = unsafe {
            libc::pread(
                fd,
                buf.ptr.add(done) as *mut c_void,
                buf.len() - done,
                (offset + done as u64) as libc::off_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        if ret == 0 {
            anyhow::bail!("short read at offset {}: {} of {}", offset, done, buf.len());
        }
        done += ret as usize;
    }
    Ok(())
}
