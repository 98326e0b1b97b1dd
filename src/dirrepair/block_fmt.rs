use crate::context::{RepairContext, RepairDiagnostic};
use crate::dirfmt::block;
use crate::dirrepair::data_block::{self, DataBlockOutcome};
use crate::dirrepair::node_walk::{self, Descent};
use crate::dirrepair::{leafblk, read_dir_block, shortform};
use crate::error::Result;
use crate::geom::inode::FMT_LOCAL;
use crate::geom::{BlockMap, FsContext, InodeInfo};
use crate::io::{BlockDevice, BufCache};
use crate::oracle::InodeOracle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Clean,
    MustDiscard,
}

pub struct ProcessResult {
    pub outcome: ProcessOutcome,
    /// Set when the shortform fork was rewritten; the caller must copy
    /// this into the inode's data fork and correct `di_size` to match.
    pub new_shortform_fork: Option<Vec<u8>>,
    /// Set for a leaf/node-format directory whose validated B+tree shape
    /// covers fewer fsblocks than the block map claims (spec §4.C6:
    /// `cursor.greatest_bno` becomes the corrected directory length). The
    /// caller should truncate `di_size` to this many fsblocks' worth of
    /// bytes; blocks beyond it were never reached by the verified walk.
    pub corrected_dir_length_fsblocks: Option<u64>,
}

enum BlockOutcome {
    Discard,
    Ok { dot: Option<u64>, dotdot: Option<u64>, greatest_bno: Option<u64> },
}

/// Top-level directory repair entry point (spec §4.C6 `process_dir`).
pub fn process_dir<O: InodeOracle, D: BlockDevice>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    cache: &mut BufCache<D>,
    inode: &InodeInfo,
    dir_fork: &[u8],
    blkmap: &BlockMap,
) -> Result<ProcessResult> {
    let is_root = inode.ino == fs_ctx.root_ino;

    if inode.format == FMT_LOCAL {
        let end = (inode.size as usize).min(dir_fork.len());
        let out = shortform::repair_shortform(ctx, fs_ctx, inode.ino, is_root, &dir_fork[..end])?;
        return Ok(ProcessResult {
            outcome: ProcessOutcome::Clean,
            new_shortform_fork: out.dirty.then_some(out.fork),
            corrected_dir_length_fsblocks: None,
        });
    }

    let leaf_off = leafblk(fs_ctx);
    let fsbcount = fs_ctx.dir_blk_fsblocks() as u64;
    let single_block = blkmap.data_extent_count(leaf_off) <= 1 && !blkmap.extends_past(leaf_off);

    let block_outcome = if single_block {
        repair_block_format(ctx, fs_ctx, cache, inode.ino, is_root, blkmap)?
    } else {
        repair_leaf_or_node(ctx, fs_ctx, cache, inode.ino, is_root, blkmap, leaf_off, fsbcount)?
    };

    let mut corrected_dir_length_fsblocks = None;
    let outcome = match block_outcome {
        BlockOutcome::Discard => {
            ctx.mark_bad_directory(inode.ino);
            ctx.diagnose(RepairDiagnostic::MustDiscard { ino: inode.ino });
            ProcessOutcome::MustDiscard
        }
        BlockOutcome::Ok { dot, dotdot, greatest_bno } => {
            if dot.is_none() || (dotdot.is_none() && !is_root) {
                ctx.diagnose(RepairDiagnostic::Corrected {
                    ino: inode.ino,
                    fileoff: 0,
                    detail: "directory missing '.' or '..'; deferred to rebuild phase".into(),
                });
            }
            if is_root && dotdot.is_none() {
                ctx.mark_need_root_dotdot();
            }
            if let Some(greatest_bno) = greatest_bno {
                let validated_length = greatest_bno + fsbcount;
                if validated_length < blkmap.end_fileoff() {
                    ctx.diagnose(RepairDiagnostic::Corrected {
                        ino: inode.ino,
                        fileoff: validated_length,
                        detail: format!(
                            "node walk only verified {validated_length} fsblocks of {} claimed by the block map; correcting directory length",
                            blkmap.end_fileoff()
                        ),
                    });
                    corrected_dir_length_fsblocks = Some(validated_length);
                }
            }
            ProcessOutcome::Clean
        }
    };

    Ok(ProcessResult { outcome, new_shortform_fork: None, corrected_dir_length_fsblocks })
}

fn repair_block_format<O: InodeOracle, D: BlockDevice>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    cache: &mut BufCache<D>,
    dir_ino: u64,
    is_root: bool,
    blkmap: &BlockMap,
) -> Result<BlockOutcome> {
    let block_size = fs_ctx.dir_blk_size() as usize;
    let mut buf = read_dir_block(fs_ctx, blkmap, cache, 0)?;
    let mut data = buf.bytes().to_vec();

    let header = match block::decode_header(&data, fs_ctx.version) {
        Ok(h) if block::is_block_magic(h.magic, fs_ctx.version) => h,
        _ => return Ok(BlockOutcome::Discard),
    };
    let tail = match block::decode_block_tail(&data, block_size) {
        Ok(t) => t,
        Err(_) => return Ok(BlockOutcome::Discard),
    };
    let leaf_start = match block::block_leaf_array_start(block_size, &tail) {
        Some(v) if v >= header.hdr_size && v <= block_size => v,
        _ => return Ok(BlockOutcome::Discard),
    };

    let entries = data_block::repair_data_entries(ctx, fs_ctx, dir_ino, is_root, &mut data, header.hdr_size, leaf_start)?;
    if entries.must_discard {
        return Ok(BlockOutcome::Discard);
    }

    let mut dirty = entries.dirty;
    if data_block::bestfree_is_bad(&header.bestfree, &data, header.hdr_size, leaf_start, fs_ctx.has_ftype) {
        let rebuilt = block::data_freescan(&data, header.hdr_size, leaf_start, fs_ctx.has_ftype);
        block::encode_header(&mut data, &block::DataBlockHeader { magic: header.magic, bestfree: rebuilt, hdr_size: header.hdr_size });
        dirty = true;
    }

    if dirty {
        buf.bytes_mut().copy_from_slice(&data);
        cache.put_buf(buf)?;
    }

    Ok(BlockOutcome::Ok { dot: entries.dot_ino, dotdot: entries.dotdot_ino, greatest_bno: None })
}

fn repair_data_block_standalone<O: InodeOracle, D: BlockDevice>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    cache: &mut BufCache<D>,
    dir_ino: u64,
    is_root: bool,
    blkmap: &BlockMap,
    fileoff: u64,
) -> Result<Option<DataBlockOutcome>> {
    let block_size = fs_ctx.dir_blk_size() as usize;
    let mut buf = read_dir_block(fs_ctx, blkmap, cache, fileoff)?;
    let mut data = buf.bytes().to_vec();

    let header = match block::decode_header(&data, fs_ctx.version) {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };

    let outcome = data_block::repair_data_entries(ctx, fs_ctx, dir_ino, is_root, &mut data, header.hdr_size, block_size)?;
    if outcome.must_discard {
        return Ok(None);
    }

    let mut dirty = outcome.dirty;
    if data_block::bestfree_is_bad(&header.bestfree, &data, header.hdr_size, block_size, fs_ctx.has_ftype) {
        let rebuilt = block::data_freescan(&data, header.hdr_size, block_size, fs_ctx.has_ftype);
        block::encode_header(&mut data, &block::DataBlockHeader { magic: header.magic, bestfree: rebuilt, hdr_size: header.hdr_size });
        dirty = true;
    }

    if dirty {
        buf.bytes_mut().copy_from_slice(&data);
        cache.put_buf(buf)?;
    }

    Ok(Some(outcome))
}

fn repair_leaf_or_node<O: InodeOracle, D: BlockDevice>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    cache: &mut BufCache<D>,
    dir_ino: u64,
    is_root: bool,
    blkmap: &BlockMap,
    leaf_off: u64,
    fsbcount: u64,
) -> Result<BlockOutcome> {
    let mut validated = 0usize;
    let mut dot = None;
    let mut dotdot = None;
    let mut fileoff = 0u64;
    while fileoff < leaf_off {
        if blkmap.map(fileoff).is_none() {
            break;
        }
        if let Some(out) = repair_data_block_standalone(ctx, fs_ctx, cache, dir_ino, is_root, blkmap, fileoff)? {
            validated += 1;
            dot = dot.or(out.dot_ino);
            dotdot = dotdot.or(out.dotdot_ino);
        }
        fileoff += fsbcount;
    }
    if validated == 0 {
        return Ok(BlockOutcome::Discard);
    }

    let is_node_format = blkmap.extends_past(leaf_off + fsbcount);

    let descent = match node_walk::traverse_int(fs_ctx, blkmap, cache, leaf_off) {
        Ok(d) => d,
        Err(_) => return Ok(BlockOutcome::Discard),
    };

    let leaf_walk_result: Result<(usize, u64)> = match descent {
        Descent::LeafOnly => {
            let mut cursor = crate::dirrepair::cursor::Cursor::new();
            node_walk::process_leaf_level(ctx, fs_ctx, blkmap, cache, &mut cursor, leaf_off)
                .map(|n| (n, cursor.greatest_bno as u64))
        }
        Descent::Node { mut cursor, first_leaf_bno } => {
            if !is_node_format {
                return Ok(BlockOutcome::Discard);
            }
            (|| {
                let n = node_walk::process_leaf_level(ctx, fs_ctx, blkmap, cache, &mut cursor, first_leaf_bno)?;
                node_walk::verify_final_dir2_path(fs_ctx, blkmap, cache, &cursor)?;
                Ok((n, cursor.greatest_bno as u64))
            })()
        }
    };

    match leaf_walk_result {
        Ok((_, greatest_bno)) => Ok(BlockOutcome::Ok { dot, dotdot, greatest_bno: Some(greatest_bno) }),
        Err(_) => Ok(BlockOutcome::Discard),
    }
}
