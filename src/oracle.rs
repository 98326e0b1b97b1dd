//! C7: inode reference oracle. External collaborator interface only — the
//! inode table / allocation btree scan that backs a real implementation is
//! out of scope (spec §1), so directory repair is written against this
//! trait and exercised in tests against a simple in-memory model.

/// A cached allocation-btree record covering a contiguous run of inode
/// numbers (one inobt chunk, 64 inodes wide in the family this targets).
#[derive(Debug, Clone)]
pub struct InodeRec {
    pub agino: u32,
    /// Bit `i` set means inode `agino + i` is confirmed to exist.
    pub confirmed_mask: u64,
    /// Bit `i` set means inode `agino + i` is free.
    pub free_mask: u64,
}

/// Answers allocation-status questions about inode numbers during
/// directory repair (spec §4.C7).
pub trait InodeOracle {
    /// Range/reserved-bit sanity check on a raw inode number, independent
    /// of whether it is actually allocated.
    fn verify_inum(&self, ino: u64) -> bool;

    fn find_inode_rec(&self, agno: u32, agino: u32) -> Option<InodeRec>;

    /// True if the inode at `rec.agino + off` is confirmed allocated.
    /// Callers must ensure `off` is in range; this is not re-checked here.
    fn is_inode_confirmed(&self, rec: &InodeRec, off: u32) -> bool {
        rec.confirmed_mask & (1u64 << off) != 0
    }

    /// True if the inode at `rec.agino + off` is known free.
    fn is_inode_free(&self, rec: &InodeRec, off: u32) -> bool {
        rec.free_mask & (1u64 << off) != 0
    }

    /// Record an inode number that is structurally valid but whose
    /// allocation status could not be determined, for a later pass to
    /// resolve (spec "ino_discovery" mode).
    fn add_inode_uncertain(&mut self, ino: u64, r#gen: u32);
}
