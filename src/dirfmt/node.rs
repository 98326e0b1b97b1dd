use crate::error::{RepairError, Result};
use crate::geom::FormatVersion;

/// Interior B+tree node magic: v2 "0xfebe", v3 "0x3ebe".
pub const NODE_MAGIC_V4: u16 = 0xfebe;
pub const NODE_MAGIC_V5: u16 = 0x3ebe;

fn blkinfo_size(version: FormatVersion) -> usize {
    match version {
        FormatVersion::V4 => 4 + 4 + 2 + 2,
        FormatVersion::V5 => 4 + 4 + 2 + 2 + 4 + 8 + 8 + 16 + 8,
    }
}

/// Interior node header (spec §3 "Per interior node").
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    pub forw: u32,
    pub back: u32,
    pub magic: u16,
    pub count: u16,
    pub level: u16,
    pub hdr_size: usize,
}

pub fn is_node_magic(magic: u16, version: FormatVersion) -> bool {
    magic == match version {
        FormatVersion::V4 => NODE_MAGIC_V4,
        FormatVersion::V5 => NODE_MAGIC_V5,
    }
}

pub fn decode_header(buf: &[u8], version: FormatVersion) -> Result<NodeHeader> {
    if buf.len() < 16 {
        return Err(RepairError::Parse("node block too small for header"));
    }
    let forw = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let back = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let magic = u16::from_be_bytes(buf[8..10].try_into().unwrap());
    if !is_node_magic(magic, version) {
        return Err(RepairError::BadMagic("directory node block"));
    }
    let blk_info = blkinfo_size(version);
    if buf.len() < blk_info + 4 {
        return Err(RepairError::Parse("node block too small for count/level"));
    }
    let count = u16::from_be_bytes(buf[blk_info..blk_info + 2].try_into().unwrap());
    let level = u16::from_be_bytes(buf[blk_info + 2..blk_info + 4].try_into().unwrap());
    Ok(NodeHeader {
        forw,
        back,
        magic,
        count,
        level,
        hdr_size: blk_info + 4,
    })
}

pub fn encode_header(buf: &mut [u8], header: &NodeHeader) {
    buf[0..4].copy_from_slice(&header.forw.to_be_bytes());
    buf[4..8].copy_from_slice(&header.back.to_be_bytes());
    buf[8..10].copy_from_slice(&header.magic.to_be_bytes());
    let blk_info = header.hdr_size - 4;
    buf[blk_info..blk_info + 2].copy_from_slice(&header.count.to_be_bytes());
    buf[blk_info + 2..blk_info + 4].copy_from_slice(&header.level.to_be_bytes());
}

/// An interior node's `{hashval, before_blk}` entry (spec invariant D1:
/// `hashval` equals the maximum hashval in the subtree rooted at
/// `before`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub hashval: u32,
    pub before: u32,
}

pub fn decode_entries(buf: &[u8], header: &NodeHeader) -> Result<Vec<NodeEntry>> {
    let mut out = Vec::with_capacity(header.count as usize);
    for i in 0..header.count as usize {
        let off = header.hdr_size + i * 8;
        if off + 8 > buf.len() {
            return Err(RepairError::Parse("node entry array runs past block end"));
        }
        out.push(NodeEntry {
            hashval: u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()),
            before: u32::from_be_bytes(buf[off + 4..off + 8].try_into().unwrap()),
        });
    }
    Ok(out)
}

pub fn encode_entries(buf: &mut [u8], hdr_size: usize, entries: &[NodeEntry]) {
    for (i, e) in entries.iter().enumerate() {
        let off = hdr_size + i * 8;
        buf[off..off + 4].copy_from_slice(&e.hashval.to_be_bytes());
        buf[off + 4..off + 8].copy_from_slice(&e.before.to_be_bytes());
    }
}

/// Patch entry `idx`'s hashval in place, used to repair invariant D1
/// violations (spec scenario S6).
pub fn patch_entry_hashval(buf: &mut [u8], hdr_size: usize, idx: usize, new_hashval: u32) {
    let off = hdr_size + idx * 8;
    buf[off..off + 4].copy_from_slice(&new_hashval.to_be_bytes());
}
