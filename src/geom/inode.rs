use zerocopy::{FromBytes, Immutable, KnownLayout};
use zerocopy::byteorder::big_endian::{U16, U32, U64};

use crate::error::{RepairError, Result};

/// Inode magic: "IN".
const DINODE_MAGIC: u16 = 0x494e;

pub const FMT_DEV: u8 = 0;
pub const FMT_LOCAL: u8 = 1;
pub const FMT_EXTENTS: u8 = 2;
pub const FMT_BTREE: u8 = 3;
pub const FMT_UUID: u8 = 4;

pub const S_IFMT: u16 = 0o170000;
pub const S_IFDIR: u16 = 0o040000;
pub const S_IFREG: u16 = 0o100000;
pub const S_IFLNK: u16 = 0o120000;

/// On-disk inode core (V4 layout, 96 bytes). V5 extends this to 176 bytes;
/// every field this crate reads lives within the shared V4 prefix.
#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DinodeCore {
    pub di_magic: U16,
    pub di_mode: U16,
    pub di_version: u8,
    pub di_format: u8,
    pub di_onlink: U16,
    pub di_uid: U32,
    pub di_gid: U32,
    pub di_nlink: U32,
    pub di_projid: U16,
    pub di_projid_hi: U16,
    pub di_pad: [u8; 6],
    pub di_flushiter: U16,
    pub di_atime: Timestamp,
    pub di_mtime: Timestamp,
    pub di_ctime: Timestamp,
    pub di_size: U64,
    pub di_nblocks: U64,
    pub di_extsize: U32,
    pub di_nextents: U32,
    pub di_anextents: U16,
    pub di_forkoff: u8,
    pub di_aformat: u8,
    pub di_dmevmask: U32,
    pub di_dmstate: U16,
    pub di_flags: U16,
    pub di_gen: U32,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Timestamp {
    pub t_sec: U32,
    pub t_nsec: U32,
}

pub const V4_CORE_SIZE: usize = 96;
pub const V5_CORE_SIZE: usize = 176;

/// Parsed directory-relevant inode fields.
#[derive(Debug, Clone)]
pub struct InodeInfo {
    pub ino: u64,
    pub mode: u16,
    pub format: u8,
    pub size: u64,
    pub nextents: u32,
    /// Byte offset within the on-disk inode where the `forkoff`-delimited
    /// data fork begins.
    pub data_fork_offset: usize,
    /// Byte size of the data fork area (`forkoff` boundary, or inode size
    /// minus core size when there is no attribute fork).
    pub data_fork_size: usize,
}

impl InodeInfo {
    pub fn is_dir(&self) -> bool {
        (self.mode & S_IFMT) == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        (self.mode & S_IFMT) == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode & S_IFMT) == S_IFLNK
    }
}

/// Parse a dinode core from `buf` starting at byte 0.
pub fn parse_inode_core(
    buf: &[u8],
    ino: u64,
    is_v5: bool,
    has_nrext64: bool,
    inode_size: u16,
) -> Result<InodeInfo> {
    let core = DinodeCore::ref_from_prefix(buf)
        .map_err(|_| RepairError::Parse("buffer too small for dinode core"))?
        .0;

    if core.di_magic.get() != DINODE_MAGIC {
        return Err(RepairError::BadMagic("dinode"));
    }

    let core_size = if is_v5 { V5_CORE_SIZE } else { V4_CORE_SIZE };
    let data_fork_offset = core_size;

    let forkoff = core.di_forkoff;
    let data_fork_size = if forkoff != 0 {
        (forkoff as usize * 8).saturating_sub(core_size)
    } else {
        (inode_size as usize).saturating_sub(core_size)
    };

    let nextents = if has_nrext64 {
        if buf.len() < 32 {
            return Err(RepairError::Parse("buffer too small for nrext64 extent count"));
        }
        let big = u64::from_be_bytes(buf[24..32].try_into().unwrap());
        (big & 0x0000_FFFF_FFFF_FFFF) as u32
    } else {
        core.di_nextents.get()
    };

    Ok(InodeInfo {
        ino,
        mode: core.di_mode.get(),
        format: core.di_format,
        size: core.di_size.get(),
        nextents,
        data_fork_offset,
        data_fork_size,
    })
}
