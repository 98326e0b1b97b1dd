//! C1: block I/O façade. Everything above this layer addresses storage in
//! basic blocks (BB, 512 bytes) and never touches a file descriptor or a
//! `pread`/`pwrite` call directly.

pub mod aligned_buf;
pub mod device;
pub mod facade;
pub mod platform;

pub use aligned_buf::{AlignedBuf, BB_SIZE, IO_ALIGN, align_up, alloc_aligned};
pub use device::{BlockDevice, FileDevice, MemDevice};
pub use facade::{Buf, BufCache, BufVerifyError};
