use std::ffi::CString;
use std::os::fd::RawFd;

use crate::error::{RepairError, Result};
use crate::io::platform::{configure_direct_io, direct_open_flags};

/// A raw block device or image file. Implementations only need to move
/// bytes at byte offsets; alignment/clamping/retry policy lives in
/// [`crate::io::facade::BufCache`].
pub trait BlockDevice {
    fn size_bytes(&self) -> u64;
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn pwrite(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}

/// A real block device or disk image, opened with direct I/O the way the
/// teacher's `io::engine::IoEngine` does.
pub struct FileDevice {
    fd: RawFd,
    size: u64,
    read_only: bool,
}

impl FileDevice {
    pub fn open(path: &str, read_only: bool) -> Result<Self> {
        let c_path = CString::new(path).map_err(|_| RepairError::Parse("invalid path (contains NUL)"))?;
        let flags = direct_open_flags(read_only);
        let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
        if fd < 0 {
            return Err(RepairError::Io(std::io::Error::last_os_error()));
        }
        configure_direct_io(fd)?;

        let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if size < 0 {
            unsafe { libc::close(fd) };
            return Err(RepairError::Io(std::io::Error::last_os_error()));
        }

        Ok(Self {
            fd,
            size: size as u64,
            read_only,
        })
    }
}

impl BlockDevice for FileDevice {
    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut total = 0usize;
        while total < buf.len() {
            let ret = unsafe {
                libc::pread(
                    self.fd,
                    buf[total..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - total,
                    (offset + total as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                return Err(RepairError::Io(std::io::Error::last_os_error()));
            }
            if ret == 0 {
                return Err(RepairError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "unexpected EOF during pread",
                )));
            }
            total += ret as usize;
        }
        Ok(())
    }

    fn pwrite(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(RepairError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        let mut total = 0usize;
        while total < buf.len() {
            let ret = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[total..].as_ptr() as *const libc::c_void,
                    buf.len() - total,
                    (offset + total as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                return Err(RepairError::Io(std::io::Error::last_os_error()));
            }
            total += ret as usize;
        }
        Ok(())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// An in-memory device backing tests: a fixed-size byte buffer addressed
/// the same way a real disk image would be.
#[derive(Debug, Clone)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl BlockDevice for MemDevice {
    fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(RepairError::Parse("read past end of device"))?;
        if end > self.data.len() {
            return Err(RepairError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device",
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn pwrite(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or(RepairError::Parse("write past end of device"))?;
        if end > self.data.len() {
            return Err(RepairError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "write past end of device",
            )));
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }
}
