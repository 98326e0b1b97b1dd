use aligned_vec::{AVec, ConstAlign};

/// Alignment required for O_DIRECT I/O (512 bytes covers all common block devices).
pub const IO_ALIGN: usize = 512;

/// Basic block size: the fixed 512-byte disk unit the log and the block
/// I/O façade address in (spec GLOSSARY "BB").
pub const BB_SIZE: usize = 512;

pub type AlignedBuf = AVec<u8, ConstAlign<IO_ALIGN>>;

/// Create a new aligned buffer of `size` bytes, zeroed.
pub fn alloc_aligned(size: usize) -> AlignedBuf {
    AVec::from_iter(IO_ALIGN, std::iter::repeat_n(0u8, size))
}

pub fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
