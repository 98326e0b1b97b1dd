use crate::context::RepairContext;
use crate::dirfmt::block::{self, DataSlot, FreeSlot};
use crate::dirrepair::entry_filter::{EntryVerdict, classify_entry};
use crate::error::Result;
use crate::geom::FsContext;
use crate::oracle::InodeOracle;

/// Result of walking and repairing the entries in one directory data
/// block (spec §4.C6 "Data-block common walk"). Shared by the
/// block-format single-block path and each data block under a leaf/node
/// directory.
pub struct DataBlockOutcome {
    pub dirty: bool,
    pub must_discard: bool,
    pub dot_ino: Option<u64>,
    pub dotdot_ino: Option<u64>,
}

enum Edit {
    Remove,
    ForceNamelenOneAndRemove,
    PatchIno(u64),
}

fn emit<O: InodeOracle>(ctx: &RepairContext<O>, ino: u64, fileoff: u64, detail: impl Into<String>) {
    let detail = detail.into();
    if ctx.no_modify {
        ctx.diagnose(crate::context::RepairDiagnostic::WouldCorrect { ino, fileoff, detail });
    } else {
        ctx.diagnose(crate::context::RepairDiagnostic::Corrected { ino, fileoff, detail });
    }
}

/// Walk the data area `[start, end)` of `buf`, repairing entry-level
/// problems in place: self-references, bad inode references, malformed
/// names, and duplicate/misrouted `.`/`..` entries (spec §4.C6). Returns
/// the pair of inode numbers observed for `.`/`..`, if present, so the
/// caller can decide whether a deferred dot-dot fixup is needed.
pub fn repair_data_entries<O: InodeOracle>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    dir_ino: u64,
    is_root: bool,
    buf: &mut [u8],
    start: usize,
    end: usize,
) -> Result<DataBlockOutcome> {
    let slots = block::walk_data_area(buf, start, end, fs_ctx.has_ftype);

    let mut dirty = false;
    let mut seen_dot = false;
    let mut seen_dotdot = false;
    let mut dot_ino = None;
    let mut dotdot_ino = None;
    let mut edits: Vec<(usize, Edit)> = Vec::new();

    for slot in &slots {
        let slot = match slot {
            Ok(s) => s,
            // `walk_data_area` only ever yields `Corruption` on malformed
            // input; a bad block is discarded, not propagated as a fatal
            // error (spec §4.C6 "Stop and discard the block on...").
            Err(_) => return Ok(DataBlockOutcome { dirty, must_discard: true, dot_ino, dotdot_ino }),
        };

        let DataSlot::Entry { offset, ino, namelen, name_range, .. } = slot else { continue };
        let offset = *offset as usize;

        if *namelen == 0 {
            edits.push((offset, Edit::ForceNamelenOneAndRemove));
            continue;
        }
        let name = &buf[name_range.0..name_range.1];

        if name == b"." {
            if !seen_dot {
                seen_dot = true;
                dot_ino = Some(*ino);
                if *ino != dir_ino {
                    emit(ctx, dir_ino, offset as u64, "'.' entry does not reference its own directory");
                    edits.push((offset, Edit::PatchIno(dir_ino)));
                }
            } else {
                emit(ctx, dir_ino, offset as u64, "duplicate '.' entry");
                edits.push((offset, Edit::Remove));
            }
            continue;
        }

        if name == b".." {
            if !seen_dotdot {
                seen_dotdot = true;
                dotdot_ino = Some(*ino);
                if is_root && *ino != dir_ino {
                    emit(ctx, dir_ino, offset as u64, "root '..' does not reference itself");
                    edits.push((offset, Edit::PatchIno(dir_ino)));
                    dotdot_ino = Some(dir_ino);
                } else if !is_root && *ino == dir_ino {
                    emit(ctx, dir_ino, offset as u64, "non-root '..' points at itself");
                    edits.push((offset, Edit::Remove));
                    dotdot_ino = None;
                }
            } else {
                emit(ctx, dir_ino, offset as u64, "duplicate '..' entry");
                edits.push((offset, Edit::Remove));
            }
            continue;
        }

        if let EntryVerdict::Remove(reason) = classify_entry(ctx, fs_ctx, dir_ino, *ino, name) {
            emit(ctx, dir_ino, offset as u64, reason);
            edits.push((offset, Edit::Remove));
        }
    }

    for (offset, edit) in edits {
        dirty = true;
        match edit {
            Edit::Remove => buf[offset] = b'/',
            Edit::ForceNamelenOneAndRemove => {
                buf[offset + 8] = 1;
                buf[offset + 9] = b'/';
            }
            Edit::PatchIno(new_ino) => buf[offset..offset + 8].copy_from_slice(&new_ino.to_be_bytes()),
        }
    }

    Ok(DataBlockOutcome { dirty, must_discard: false, dot_ino, dotdot_ino })
}

/// Check the per-block bestfree table against an independent scan: each
/// free region at or above the smallest tracked length must match exactly
/// one table slot, and the table itself must be sorted non-increasing by
/// length (spec §4.C5/C6 "badbest").
pub fn bestfree_is_bad(bestfree: &[FreeSlot; 3], buf: &[u8], start: usize, end: usize, has_ftype: bool) -> bool {
    if !(bestfree[0].length >= bestfree[1].length && bestfree[1].length >= bestfree[2].length) {
        return true;
    }
    let mut matched = [false; 3];
    for slot in block::walk_data_area(buf, start, end, has_ftype).into_iter().flatten() {
        if let DataSlot::Free { offset, length } = slot {
            if length < bestfree[2].length {
                continue;
            }
            let mut found = false;
            for i in 0..3 {
                if !matched[i] && bestfree[i].offset == offset && bestfree[i].length == length {
                    matched[i] = true;
                    found = true;
                    break;
                }
            }
            if !found {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RepairContext;
    use crate::dirfmt::block::{data_entry_size, DataBlockHeader};
    use crate::oracle::test_support::FakeOracle;

    fn fs_ctx() -> FsContext {
        FsContext {
            version: crate::geom::FormatVersion::V5,
            uuid: [0; 16],
            block_size: 256,
            block_log: 8,
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
            has_ftype: false,
            has_nrext64: false,
            reserved: crate::geom::ReservedInodes { rbmino: 0, rsumino: 0, uquotino: 0, gquotino: 0, pquotino: 0 },
        }
    }

    fn write_entry(buf: &mut [u8], offset: usize, ino: u64, name: &[u8]) -> usize {
        buf[offset..offset + 8].copy_from_slice(&ino.to_be_bytes());
        buf[offset + 8] = name.len() as u8;
        buf[offset + 9..offset + 9 + name.len()].copy_from_slice(name);
        let entry_len = data_entry_size(name.len() as u8, false) as usize;
        let tag_off = offset + entry_len - 2;
        buf[tag_off..tag_off + 2].copy_from_slice(&(offset as u16).to_be_bytes());
        entry_len
    }

    #[test]
    fn self_reference_entry_is_tombstoned() {
        let ctx = RepairContext::new(false, false, FakeOracle { max_ino: 1000, ..Default::default() }, |_| {});
        let mut buf = vec![0u8; 64];
        let start = 16;
        write_entry(&mut buf, start, 128, b"loop");
        let out = repair_data_entries(&ctx, &fs_ctx(), 128, true, &mut buf, start, 64).unwrap();
        assert!(out.dirty);
        assert_eq!(buf[start], b'/');
    }

    #[test]
    fn dot_entry_ino_is_patched_to_self() {
        let ctx = RepairContext::new(false, false, FakeOracle { max_ino: 1000, ..Default::default() }, |_| {});
        let mut buf = vec![0u8; 64];
        let start = 16;
        write_entry(&mut buf, start, 999, b".");
        let out = repair_data_entries(&ctx, &fs_ctx(), 128, true, &mut buf, start, 64).unwrap();
        assert_eq!(out.dot_ino, Some(128));
        assert!(out.dirty);
    }

    #[test]
    fn bestfree_mismatch_is_detected() {
        let hdr_size = 64usize;
        let block_size = 256usize;
        let mut buf = vec![0u8; block_size];
        let header = DataBlockHeader {
            magic: block::DATA_MAGIC_V5,
            bestfree: [FreeSlot { offset: 999, length: 64 }, FreeSlot::default(), FreeSlot::default()],
            hdr_size,
        };
        block::encode_header(&mut buf, &header);
        let len = (block_size - hdr_size) as u16;
        buf[hdr_size..hdr_size + 2].copy_from_slice(&block::DATA_FREE_TAG.to_be_bytes());
        buf[hdr_size + 2..hdr_size + 4].copy_from_slice(&len.to_be_bytes());
        let tag_off = hdr_size + len as usize - 2;
        buf[tag_off..tag_off + 2].copy_from_slice(&(hdr_size as u16).to_be_bytes());

        assert!(bestfree_is_bad(&header.bestfree, &buf, hdr_size, block_size, false));
    }
}
