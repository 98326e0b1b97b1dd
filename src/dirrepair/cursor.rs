/// Maximum depth of an interior-node B+tree index this crate will descend
/// (spec §3 "cursor `level[0..MAXDEPTH-1]`").
pub const MAXDEPTH: usize = 5;

/// One level of the descent/ascent cursor used by the node-format path.
/// The source owns a buffer handle per level; here each level is
/// re-read on demand from [`crate::io::BufCache`] instead, since Rust's
/// ownership model already guarantees a `Buf` is released (and written
/// back if dirty) the moment it goes out of scope — there is no error
/// path that can leak a held buffer the way an explicit release call
/// would need to guard against.
#[derive(Debug, Clone, Copy)]
pub struct CursorLevel {
    pub hashval: u32,
    pub bno: u32,
    pub index: u16,
    pub count: u16,
    pub dirty: bool,
}

/// The descent/ascent cursor itself (spec §4.C6 "Leaf / node path").
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    levels: Vec<CursorLevel>,
    /// Max `bno` observed at any level; becomes the corrected directory
    /// length once the walk completes.
    pub greatest_bno: u32,
}

impl Cursor {
    pub fn new() -> Self {
        Self { levels: Vec::new(), greatest_bno: 0 }
    }

    /// Depth of the tree as currently understood (spec invariant D3:
    /// "depth at root equals cursor.active").
    pub fn active(&self) -> usize {
        self.levels.len()
    }

    pub fn push(&mut self, level: CursorLevel) -> crate::error::Result<()> {
        if self.levels.len() >= MAXDEPTH {
            return Err(crate::error::RepairError::Corruption("node index deeper than MAXDEPTH"));
        }
        self.greatest_bno = self.greatest_bno.max(level.bno);
        self.levels.push(level);
        Ok(())
    }

    pub fn level(&self, p_level: usize) -> Option<&CursorLevel> {
        self.levels.get(p_level)
    }

    pub fn level_mut(&mut self, p_level: usize) -> Option<&mut CursorLevel> {
        self.levels.get_mut(p_level)
    }

    pub fn set_level(&mut self, p_level: usize, level: CursorLevel) {
        self.greatest_bno = self.greatest_bno.max(level.bno);
        if p_level < self.levels.len() {
            self.levels[p_level] = level;
        }
    }

    /// Fold a visited leaf block's `bno` into `greatest_bno`. Leaf blocks
    /// are not cursor levels (the cursor only tracks interior nodes), but
    /// they are still part of "max bno seen at every level" per spec §4.C6
    /// — the deepest level of the tree is the leaf chain itself.
    pub fn note_bno(&mut self, bno: u32) {
        self.greatest_bno = self.greatest_bno.max(bno);
    }

    pub fn truncate(&mut self, len: usize) {
        self.levels.truncate(len);
    }
}
