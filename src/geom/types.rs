/// Absolute inode number.
pub type Ino = u64;

/// AG number.
pub type Agnumber = u32;

/// AG-relative block number.
pub type Agblock = u32;

/// AG-relative inode number (within the AG).
pub type Agino = u32;

/// Absolute filesystem block number.
pub type Fsblock = u64;

/// File offset, in filesystem blocks.
pub type Fileoff = u64;

/// Basic block (disk sector) number, absolute within the log.
pub type LogBlock = u32;

/// Sentinel "no inode" value used by shortform `..` repair and by the
/// block/leaf/node dot-dot parent slot.
pub const NULLFSINO: Ino = u64::MAX;
