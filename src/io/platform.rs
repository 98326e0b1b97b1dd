use std::os::fd::RawFd;

/// Configure direct I/O on the given file descriptor.
///
/// - Linux: O_DIRECT is set at open time (see device.rs).
/// - macOS: Uses fcntl(F_NOCACHE) to disable the buffer cache.
#[cfg(target_os = "macos")]
pub fn configure_direct_io(fd: RawFd) -> std::io::Result<()> {
    // F_NOCACHE = 48 on macOS
    let ret = unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) };
    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub fn configure_direct_io(_fd: RawFd) -> std::io::Result<()> {
    // On Linux, O_DIRECT is passed at open time. Nothing to do here.
    Ok(())
}

/// Return platform-specific open flags for direct I/O.
///
/// The recovery core opens read-write: log replay and directory repair
/// both write corrected data back in place (unlike the read-only scan
/// path this façade is adapted from).
#[cfg(target_os = "linux")]
pub fn direct_open_flags(read_only: bool) -> libc::c_int {
    let base = if read_only { libc::O_RDONLY } else { libc::O_RDWR };
    base | libc::O_DIRECT
}

#[cfg(target_os = "macos")]
pub fn direct_open_flags(read_only: bool) -> libc::c_int {
    if read_only { libc::O_RDONLY } else { libc::O_RDWR }
}
