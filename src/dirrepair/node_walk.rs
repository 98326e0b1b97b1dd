use crate::context::RepairContext;
use crate::dirfmt::{leaf, node};
use crate::dirrepair::cursor::{Cursor, CursorLevel};
use crate::dirrepair::read_dir_block;
use crate::error::{RepairError, Result};
use crate::geom::{BlockMap, FsContext};
use crate::io::{BlockDevice, BufCache};
use crate::oracle::InodeOracle;

/// Outcome of [`traverse_int`]: either the root itself is a leaf block
/// (leaf-format directory with no interior levels), or a cursor built by
/// walking the left spine down to the bottommost interior level.
pub enum Descent {
    LeafOnly,
    Node { cursor: Cursor, first_leaf_bno: u64 },
}

/// Walk down the left spine of the node index starting at `leafblk`,
/// building the cursor (spec §4.C6 `traverse_int`).
pub fn traverse_int<D: BlockDevice>(
    fs_ctx: &FsContext,
    blkmap: &BlockMap,
    cache: &mut BufCache<D>,
    leafblk: u64,
) -> Result<Descent> {
    let mut cursor = Cursor::new();
    let mut bno = leafblk;
    let mut expected_level: Option<u16> = None;

    loop {
        let buf = read_dir_block(fs_ctx, blkmap, cache, bno)?;
        let bytes = buf.bytes();
        let magic = u16::from_be_bytes(bytes[8..10].try_into().unwrap());

        if leaf::is_leafn_magic(magic, fs_ctx.version) {
            if cursor.active() == 0 {
                return Ok(Descent::LeafOnly);
            }
            return Ok(Descent::Node { cursor, first_leaf_bno: bno });
        }

        let hdr = node::decode_header(bytes, fs_ctx.version)?;
        if hdr.level == 0 || hdr.level as usize >= crate::dirrepair::cursor::MAXDEPTH {
            return Err(RepairError::Corruption("node level out of range"));
        }
        if let Some(prev) = expected_level {
            if hdr.level != prev - 1 {
                return Err(RepairError::Corruption("node depth did not decrease by one per step"));
            }
        }
        expected_level = Some(hdr.level);

        let node_ents = (fs_ctx.dir_blk_size() as usize - hdr.hdr_size) / 8;
        if hdr.count as usize > node_ents {
            return Err(RepairError::Corruption("node entry count exceeds block capacity"));
        }
        let entries = node::decode_entries(bytes, &hdr)?;
        let Some(first) = entries.first() else {
            return Err(RepairError::Corruption("interior node has no entries"));
        };

        cursor.push(CursorLevel {
            hashval: first.hashval,
            bno: bno as u32,
            index: 0,
            count: hdr.count,
            dirty: false,
        })?;

        bno = first.before as u64;
        if hdr.level == 1 {
            // Next block down is the leaf level; loop once more to read it
            // and detect the LEAFN magic above.
            continue;
        }
    }
}

/// Per-leaf-block invariants checked while walking the leaf chain (spec
/// §4.C6 `process_leaf_level`): hash monotonicity (P7), stale-count
/// agreement, and back-pointer continuity.
fn verify_leaf_block(bytes: &[u8], version: crate::geom::FormatVersion, expected_back: u32) -> Result<leaf::LeafHeader> {
    let hdr = leaf::decode_header(bytes, version)?;
    if !leaf::is_leafn_magic(hdr.magic, version) {
        return Err(RepairError::Corruption("expected LEAFN magic in leaf chain"));
    }
    if hdr.back != expected_back {
        return Err(RepairError::Corruption("leaf block back-pointer does not match predecessor"));
    }
    let entries = leaf::decode_entries(bytes, &hdr)?;
    let stale = entries.iter().filter(|e| e.address == leaf::NULL_DATAPTR).count() as u16;
    if stale != hdr.stale {
        return Err(RepairError::Corruption("leaf stale count does not match NULL_DATAPTR entries"));
    }
    if !entries.windows(2).all(|w| w[0].hashval <= w[1].hashval) {
        return Err(RepairError::Corruption("leaf entries not in non-decreasing hash order"));
    }
    Ok(hdr)
}

/// Advance the cursor at `p_level` by one step; on exhaustion, ascend and
/// patch the parent's hashval in place if it disagrees with the child's
/// greatest hashval (invariant D1). Spec §4.C6 `verify_dir2_path`.
fn verify_dir2_path<O: InodeOracle, D: BlockDevice>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    blkmap: &BlockMap,
    cache: &mut BufCache<D>,
    cursor: &mut Cursor,
    p_level: usize,
    child_max_hashval: u32,
) -> Result<()> {
    let Some(level) = cursor.level(p_level).copied() else {
        return Ok(());
    };

    let buf = read_dir_block(fs_ctx, blkmap, cache, level.bno as u64)?;
    let hdr = node::decode_header(buf.bytes(), fs_ctx.version)?;
    let entries = node::decode_entries(buf.bytes(), &hdr)?;
    let idx = level.index as usize;
    let Some(entry) = entries.get(idx) else {
        return Err(RepairError::Corruption("node index past entry count during ascent"));
    };

    if entry.hashval != child_max_hashval {
        if !ctx.no_modify {
            let mut buf = buf;
            node::patch_entry_hashval(buf.bytes_mut(), hdr.hdr_size, idx, child_max_hashval);
            cache.put_buf(buf)?;
        }
        ctx.diagnose(crate::context::RepairDiagnostic::Corrected {
            ino: 0,
            fileoff: level.bno as u64,
            detail: format!("interior entry {idx} hashval did not equal max child hashval; patched"),
        });
    }

    let next_index = level.index + 1;
    if next_index < level.count {
        cursor.set_level(p_level, CursorLevel { index: next_index, ..level });
        return Ok(());
    }

    // This level is exhausted; follow `forw` if present, else ascend.
    if hdr.forw != 0 {
        let next_buf = read_dir_block(fs_ctx, blkmap, cache, hdr.forw as u64)?;
        let next_hdr = node::decode_header(next_buf.bytes(), fs_ctx.version)?;
        if next_hdr.back != level.bno {
            return Err(RepairError::Corruption("node sibling back-pointer mismatch"));
        }
        if next_hdr.level != hdr.level {
            return Err(RepairError::Corruption("node sibling at wrong level"));
        }
        cursor.set_level(
            p_level,
            CursorLevel { bno: hdr.forw, index: 0, count: next_hdr.count, hashval: level.hashval, dirty: false },
        );
        return Ok(());
    }

    verify_dir2_path(ctx, fs_ctx, blkmap, cache, cursor, p_level + 1, child_max_hashval)
}

/// Walk the leaf chain left to right, verifying each block and driving
/// path ascension through the interior levels (spec §4.C6
/// `process_leaf_level`). Returns the number of leaf blocks that
/// validated.
pub fn process_leaf_level<O: InodeOracle, D: BlockDevice>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    blkmap: &BlockMap,
    cache: &mut BufCache<D>,
    cursor: &mut Cursor,
    first_leaf_bno: u64,
) -> Result<usize> {
    let mut bno = first_leaf_bno;
    let mut back = 0u32;
    let mut validated = 0usize;

    loop {
        let buf = read_dir_block(fs_ctx, blkmap, cache, bno)?;
        let hdr = verify_leaf_block(buf.bytes(), fs_ctx.version, back)?;
        let entries = leaf::decode_entries(buf.bytes(), &hdr)?;
        let max_hashval = entries.iter().map(|e| e.hashval).max().unwrap_or(0);
        validated += 1;
        cursor.note_bno(bno as u32);

        if cursor.active() > 0 {
            verify_dir2_path(ctx, fs_ctx, blkmap, cache, cursor, 0, max_hashval)?;
        }

        if hdr.forw == 0 {
            break;
        }
        back = bno as u32;
        bno = hdr.forw as u64;
    }

    Ok(validated)
}

/// Final consistency sweep after the leaf chain is exhausted (spec
/// §4.C6 `verify_final_dir2_path`): every level's index must sit on the
/// last entry, every recorded hashval must be strictly below that
/// entry's hashval, and no level may still have a `forw` sibling.
pub fn verify_final_dir2_path<D: BlockDevice>(
    fs_ctx: &FsContext,
    blkmap: &BlockMap,
    cache: &mut BufCache<D>,
    cursor: &Cursor,
) -> Result<()> {
    let mut p_level = 0;
    while let Some(level) = cursor.level(p_level) {
        let buf = read_dir_block(fs_ctx, blkmap, cache, level.bno as u64)?;
        let hdr = node::decode_header(buf.bytes(), fs_ctx.version)?;
        let entries = node::decode_entries(buf.bytes(), &hdr)?;
        if level.index + 1 != hdr.count {
            return Err(RepairError::Corruption("interior level did not reach its last entry"));
        }
        if let Some(last) = entries.last() {
            if level.hashval >= last.hashval && entries.len() > 1 {
                return Err(RepairError::Corruption("interior level hashval not strictly below final entry"));
            }
        }
        if hdr.forw != 0 {
            return Err(RepairError::Corruption("interior level retains a forw sibling after walk completed"));
        }
        p_level += 1;
    }
    Ok(())
}
