use crate::context::RepairContext;
use crate::dirfmt::shortform::{self, SF_8BYTE_THRESHOLD, ShortformDir};
use crate::dirrepair::entry_filter::{EntryVerdict, classify_entry};
use crate::error::Result;
use crate::geom::{FsContext, NULLFSINO};
use crate::oracle::InodeOracle;

/// Result of repairing a shortform directory fork in memory. The caller
/// owns the inode: if `dirty`, it must re-encode `fork` into the data fork
/// and, if `fork.len()` changed, update `di_size` accordingly.
pub struct ShortformOutcome {
    pub fork: Vec<u8>,
    pub dirty: bool,
}

fn emit<O: InodeOracle>(ctx: &RepairContext<O>, ino: u64, detail: impl Into<String>) {
    let detail = detail.into();
    if ctx.no_modify {
        ctx.diagnose(crate::context::RepairDiagnostic::WouldCorrect { ino, fileoff: 0, detail });
    } else {
        ctx.diagnose(crate::context::RepairDiagnostic::Corrected { ino, fileoff: 0, detail });
    }
}

/// Repair a shortform directory fork (spec §4.C6 "Shortform path").
pub fn repair_shortform<O: InodeOracle>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    dir_ino: u64,
    is_root: bool,
    fork_buf: &[u8],
) -> Result<ShortformOutcome> {
    let decoded = shortform::decode_lenient(fork_buf)?;
    let mut dir = decoded.dir;
    let mut dirty = decoded.truncated;
    if decoded.truncated {
        emit(ctx, dir_ino, "shortform entry ran past end of fork, discarding it and everything after");
    }

    let before = dir.entries.len();
    let mut kept = Vec::with_capacity(before);
    for entry in dir.entries.drain(..) {
        match classify_entry(ctx, fs_ctx, dir_ino, entry.ino, &entry.name) {
            EntryVerdict::Remove(reason) => {
                emit(ctx, dir_ino, format!("shortform entry {:?}: {reason}", String::from_utf8_lossy(&entry.name)));
            }
            EntryVerdict::Keep => kept.push(entry),
        }
    }
    dir.entries = kept;
    if dir.entries.len() != before {
        dirty = true;
    }
    dir.count = dir.entries.len() as u8;

    fix_i8count(&mut dir, &mut dirty);
    fix_offsets(ctx, fs_ctx, &mut dir, &mut dirty);
    fix_parent(ctx, fs_ctx, dir_ino, is_root, &mut dir, &mut dirty);

    Ok(ShortformOutcome { fork: shortform::encode(&dir), dirty })
}

fn fix_i8count(dir: &mut ShortformDir, dirty: &mut bool) {
    let actual = dir.entries.iter().filter(|e| e.ino >= SF_8BYTE_THRESHOLD).count() as u8;
    if actual == dir.i8count {
        return;
    }
    dir.i8count = actual;
    if actual == 0 {
        shortform::sf_fix_i8(dir);
    }
    *dirty = true;
}

fn fix_offsets<O: InodeOracle>(ctx: &RepairContext<O>, fs_ctx: &FsContext, dir: &mut ShortformDir, dirty: &mut bool) {
    let monotonic = dir.entries.windows(2).all(|w| w[0].offset < w[1].offset);
    let overflows_block = dir
        .entries
        .last()
        .map(|last| {
            let final_offset = last.offset as u32
                + crate::dirfmt::block::data_entry_size(last.namelen, fs_ctx.has_ftype) as u32;
            let leaf_tail_overhead = dir.entries.len() as u32 * 8 + crate::dirfmt::block::BLOCK_TAIL_SIZE as u32;
            final_offset + leaf_tail_overhead > fs_ctx.dir_blk_size()
        })
        .unwrap_or(false);

    if monotonic && !overflows_block {
        return;
    }
    let reason = if monotonic { "would exceed block size once leaf-tail overhead is accounted for" } else { "out of order" };
    emit(ctx, 0, format!("shortform entry offsets {reason}, regenerating"));
    shortform::sf_fix_offsets(dir, fs_ctx.has_ftype);
    *dirty = true;
}

fn fix_parent<O: InodeOracle>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    dir_ino: u64,
    is_root: bool,
    dir: &mut ShortformDir,
    dirty: &mut bool,
) {
    let mut oracle = ctx.oracle();
    let valid = dir.parent != NULLFSINO && oracle.verify_inum(dir.parent) && !fs_ctx.reserved.is_reserved(dir.parent);
    drop(oracle);

    if !valid {
        if dir.parent != NULLFSINO {
            emit(ctx, dir_ino, "shortform parent inode invalid, clearing");
            dir.parent = NULLFSINO;
            *dirty = true;
        }
    }

    if is_root {
        if dir.parent != dir_ino {
            dir.parent = dir_ino;
            *dirty = true;
        }
    } else if dir.parent == dir_ino {
        emit(ctx, dir_ino, "shortform parent points at self");
        dir.parent = NULLFSINO;
        *dirty = true;
    }

    if is_root && dir.parent == NULLFSINO {
        ctx.mark_need_root_dotdot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::test_support::FakeOracle;

    fn fs_ctx() -> FsContext {
        FsContext {
            version: crate::geom::FormatVersion::V5,
            uuid: [0; 16],
            block_size: 4096,
            block_log: 12,
            ag_count: 1,
            ag_blocks: 1 << 20,
            ag_blk_log: 20,
            dblocks: 1 << 20,
            inode_size: 512,
            inodes_per_block: 8,
            inode_log: 9,
            inop_blog: 3,
            dir_blk_log: 0,
            root_ino: 128,
            sect_size: 512,
            log_start: 0,
            log_blocks: 0,
            log_sunit: 0,
            has_ftype: true,
            has_nrext64: false,
            reserved: crate::geom::ReservedInodes { rbmino: 0, rsumino: 0, uquotino: 0, gquotino: 0, pquotino: 0 },
        }
    }

    fn entry(name: &str, ino: u64, offset: u16) -> crate::dirfmt::shortform::SfEntry {
        crate::dirfmt::shortform::SfEntry {
            namelen: name.len() as u8,
            offset,
            name: name.as_bytes().to_vec(),
            ino,
        }
    }

    #[test]
    fn drops_entry_pointing_at_unknown_inode_without_discovery() {
        let ctx = RepairContext::new(false, false, FakeOracle { max_ino: 1000, ..Default::default() }, |_| {});
        let dir = ShortformDir { count: 1, i8count: 0, parent: 128, entries: vec![entry("ghost", 900, 64)] };
        let buf = shortform::encode(&dir);
        let out = repair_shortform(&ctx, &fs_ctx(), 128, true, &buf).unwrap();
        assert!(out.dirty);
        let decoded = shortform::decode(&out.fork).unwrap();
        assert_eq!(decoded.entries.len(), 0);
    }

    #[test]
    fn scenario_s3_truncated_trailing_entry_is_junked_and_size_shrinks() {
        let ctx = RepairContext::new(false, false, FakeOracle { max_ino: 1000, ..Default::default() }, |_| {});
        let dir = ShortformDir {
            count: 2,
            i8count: 0,
            parent: 128,
            entries: vec![entry("a", 99, 64), entry("longname", 88, 68)],
        };
        let mut buf = shortform::encode(&dir);
        buf.truncate(buf.len() - 4);
        let original_len = buf.len();

        let out = repair_shortform(&ctx, &fs_ctx(), 128, true, &buf).unwrap();
        assert!(out.dirty);
        assert!(out.fork.len() < original_len);
        let decoded = shortform::decode(&out.fork).unwrap();
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded.entries[0].name, b"a");
    }

    #[test]
    fn fix_offsets_regenerates_when_in_order_but_overruns_block_size() {
        let ctx = RepairContext::new(false, false, FakeOracle { max_ino: 1000, ..Default::default() }, |_| {});
        let mut fs = fs_ctx();
        fs.block_log = 6;
        fs.block_size = 64; // dir_blk_size() == 64, tiny enough to overflow
        let dir = ShortformDir {
            count: 1,
            i8count: 0,
            parent: 128,
            entries: vec![entry("a", 99, 60)], // last entry alone already runs past the 64-byte block once tail overhead is added
        };
        let buf = shortform::encode(&dir);
        let out = repair_shortform(&ctx, &fs, 128, true, &buf).unwrap();
        assert!(out.dirty);
        let decoded = shortform::decode(&out.fork).unwrap();
        assert_eq!(decoded.entries[0].offset, crate::dirfmt::shortform::DATA_FIRST_OFFSET);
    }

    #[test]
    fn root_parent_forced_to_self() {
        let ctx = RepairContext::new(false, false, FakeOracle { max_ino: 1000, ..Default::default() }, |_| {});
        let dir = ShortformDir { count: 0, i8count: 0, parent: 5, entries: vec![] };
        let buf = shortform::encode(&dir);
        let out = repair_shortform(&ctx, &fs_ctx(), 128, true, &buf).unwrap();
        let decoded = shortform::decode(&out.fork).unwrap();
        assert_eq!(decoded.parent, 128);
    }

    #[test]
    fn non_root_self_parent_is_cleared_and_latches_nothing() {
        let ctx = RepairContext::new(false, false, FakeOracle { max_ino: 1000, ..Default::default() }, |_| {});
        let dir = ShortformDir { count: 0, i8count: 0, parent: 77, entries: vec![] };
        let buf = shortform::encode(&dir);
        let out = repair_shortform(&ctx, &fs_ctx(), 77, false, &buf).unwrap();
        let decoded = shortform::decode(&out.fork).unwrap();
        assert_eq!(decoded.parent, NULLFSINO);
        assert!(!ctx.needs_root_dotdot());
    }
}
