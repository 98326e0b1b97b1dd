use crate::context::RepairContext;
use crate::geom::FsContext;
use crate::oracle::InodeOracle;

/// Outcome of running the shared inode-reference filter pipeline on a
/// directory entry (spec §4.C6 "Shortform path" bullet list, reused
/// verbatim by the block/leaf/node data-block walk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryVerdict {
    Keep,
    Remove(&'static str),
}

/// Apply the inode-filter pipeline to one non-dot entry. Dot (`.`/`..`)
/// entries are handled separately by the caller — this only covers the
/// generic reference-validity rules.
pub fn classify_entry<O: InodeOracle>(
    ctx: &RepairContext<O>,
    fs_ctx: &FsContext,
    dir_ino: u64,
    ino: u64,
    name: &[u8],
) -> EntryVerdict {
    if name.is_empty() {
        return EntryVerdict::Remove("empty entry name");
    }
    if name.contains(&b'/') || name.contains(&0u8) {
        return EntryVerdict::Remove("entry name contains '/' or NUL");
    }
    if ino == dir_ino {
        return EntryVerdict::Remove("entry references its own directory inode");
    }

    let mut oracle = ctx.oracle();
    if !oracle.verify_inum(ino) {
        return EntryVerdict::Remove("inode number fails range/reserved-bit check");
    }
    if fs_ctx.reserved.is_reserved(ino) {
        return EntryVerdict::Remove("inode points at a reserved metadata inode");
    }

    let agno = fs_ctx.ino_to_agno(ino);
    let agino = fs_ctx.ino_to_agino(ino);
    match oracle.find_inode_rec(agno, agino) {
        Some(rec) => {
            let off = agino.wrapping_sub(rec.agino);
            if oracle.is_inode_free(&rec, off) {
                if ctx.ino_discovery {
                    EntryVerdict::Keep
                } else {
                    EntryVerdict::Remove("inode is known free")
                }
            } else {
                EntryVerdict::Keep
            }
        }
        None => {
            if ctx.ino_discovery {
                oracle.add_inode_uncertain(ino, 0);
                EntryVerdict::Keep
            } else {
                EntryVerdict::Remove("inode is unknown and ino_discovery is disabled")
            }
        }
    }
}
