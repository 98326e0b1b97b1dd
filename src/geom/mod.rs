//! C2: geometry and endian codec. Pure functions over byte slices decoding
//! the on-disk headers enumerated in spec §6; no I/O of its own.

pub mod extent;
pub mod inode;
pub mod superblock;
pub mod types;

pub use extent::BlockMap;
pub use inode::InodeInfo;
pub use superblock::{FormatVersion, FsContext, ReservedInodes};
pub use types::{Agblock, Agino, Agnumber, Fileoff, Fsblock, Ino, NULLFSINO};
