//! C6: directory validator-repairer. Walks the four directory layouts
//! decoded by [`crate::dirfmt`], applies the inode-filter pipeline from
//! [`crate::oracle`], and reports findings through
//! [`crate::context::RepairContext`].

pub mod block_fmt;
pub mod cursor;
pub mod data_block;
pub mod entry_filter;
pub mod node_walk;
pub mod shortform;

use crate::error::Result;
use crate::geom::{BlockMap, FsContext};
use crate::io::aligned_buf::BB_SIZE;
use crate::io::{BlockDevice, Buf, BufCache};

pub use block_fmt::{process_dir, ProcessOutcome, ProcessResult};

/// File offset, in directory blocks, where the leaf/node hash index
/// begins — the well-known split point between data space and index
/// space in the unified directory file-offset addressing (spec §3
/// "leafblk"). Mirrors the real family's 32GiB `XFS_DIR2_LEAF_OFFSET`.
pub fn leafblk(fs_ctx: &FsContext) -> u64 {
    (32u64 << 30) >> fs_ctx.block_log as u64
}

/// Read the directory block at file-offset-block `fileoff` through the
/// block map, returning the decoded buffer.
pub(crate) fn read_dir_block<D: BlockDevice>(
    fs_ctx: &FsContext,
    blkmap: &BlockMap,
    cache: &mut BufCache<D>,
    fileoff: u64,
) -> Result<Buf> {
    let (start_block, within) = blkmap
        .map(fileoff)
        .ok_or(crate::error::RepairError::Corruption("block map has no extent covering this file offset"))?;
    let fsblock = start_block + within;
    let byte_off = crate::geom::extent::fsblock_to_byte(fs_ctx, fsblock);
    let bb = byte_off / BB_SIZE as u64;
    let nbbs = (fs_ctx.dir_blk_size() as usize) / BB_SIZE;
    cache.read(bb, nbbs)
}
