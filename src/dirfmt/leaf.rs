use crate::error::{RepairError, Result};
use crate::geom::FormatVersion;

/// Leaf block magic for the single-leaf-format root (carries the embedded
/// bestfree tail): v2 "0xd2f1", v3 "0x3df1".
pub const LEAF1_MAGIC_V4: u16 = 0xd2f1;
pub const LEAF1_MAGIC_V5: u16 = 0x3df1;
/// Leaf block magic for a node-tree leaf (no embedded tail): v2/v3.
pub const LEAFN_MAGIC_V4: u16 = 0xd2ff;
pub const LEAFN_MAGIC_V5: u16 = 0x3dff;

/// Sentinel address marking a stale (deleted) leaf entry.
pub const NULL_DATAPTR: u32 = 0;

fn blkinfo_size(version: FormatVersion) -> usize {
    match version {
        FormatVersion::V4 => 4 + 4 + 2 + 2,
        FormatVersion::V5 => 4 + 4 + 2 + 2 + 4 + 8 + 8 + 16 + 8,
    }
}

/// Header common to both leaf variants: sibling pointers, magic, and the
/// entry/stale counts that follow the block-info prefix.
#[derive(Debug, Clone, Copy)]
pub struct LeafHeader {
    pub forw: u32,
    pub back: u32,
    pub magic: u16,
    pub count: u16,
    pub stale: u16,
    pub hdr_size: usize,
}

pub fn is_leaf1_magic(magic: u16, version: FormatVersion) -> bool {
    magic == match version {
        FormatVersion::V4 => LEAF1_MAGIC_V4,
        FormatVersion::V5 => LEAF1_MAGIC_V5,
    }
}

pub fn is_leafn_magic(magic: u16, version: FormatVersion) -> bool {
    magic == match version {
        FormatVersion::V4 => LEAFN_MAGIC_V4,
        FormatVersion::V5 => LEAFN_MAGIC_V5,
    }
}

pub fn decode_header(buf: &[u8], version: FormatVersion) -> Result<LeafHeader> {
    if buf.len() < 16 {
        return Err(RepairError::Parse("leaf block too small for header"));
    }
    let forw = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let back = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let magic = u16::from_be_bytes(buf[8..10].try_into().unwrap());
    if !is_leaf1_magic(magic, version) && !is_leafn_magic(magic, version) {
        return Err(RepairError::BadMagic("directory leaf block"));
    }
    let blk_info = blkinfo_size(version);
    if buf.len() < blk_info + 4 {
        return Err(RepairError::Parse("leaf block too small for count/stale"));
    }
    let count = u16::from_be_bytes(buf[blk_info..blk_info + 2].try_into().unwrap());
    let stale = u16::from_be_bytes(buf[blk_info + 2..blk_info + 4].try_into().unwrap());
    Ok(LeafHeader {
        forw,
        back,
        magic,
        count,
        stale,
        hdr_size: blk_info + 4,
    })
}

pub fn encode_header(buf: &mut [u8], header: &LeafHeader) {
    buf[0..4].copy_from_slice(&header.forw.to_be_bytes());
    buf[4..8].copy_from_slice(&header.back.to_be_bytes());
    buf[8..10].copy_from_slice(&header.magic.to_be_bytes());
    let blk_info = header.hdr_size - 4;
    buf[blk_info..blk_info + 2].copy_from_slice(&header.count.to_be_bytes());
    buf[blk_info + 2..blk_info + 4].copy_from_slice(&header.stale.to_be_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub hashval: u32,
    pub address: u32,
}

pub fn decode_entries(buf: &[u8], header: &LeafHeader) -> Result<Vec<LeafEntry>> {
    let mut out = Vec::with_capacity(header.count as usize);
    for i in 0..header.count as usize {
        let off = header.hdr_size + i * 8;
        if off + 8 > buf.len() {
            return Err(RepairError::Parse("leaf entry array runs past block end"));
        }
        out.push(LeafEntry {
            hashval: u32::from_be_bytes(buf[off..off + 4].try_into().unwrap()),
            address: u32::from_be_bytes(buf[off + 4..off + 8].try_into().unwrap()),
        });
    }
    Ok(out)
}

pub fn encode_entries(buf: &mut [u8], hdr_size: usize, entries: &[LeafEntry]) {
    for (i, e) in entries.iter().enumerate() {
        let off = hdr_size + i * 8;
        buf[off..off + 4].copy_from_slice(&e.hashval.to_be_bytes());
        buf[off + 4..off + 8].copy_from_slice(&e.address.to_be_bytes());
    }
}

/// The embedded per-data-block bestfree tail a LEAF1 (single-leaf-format)
/// block carries, one free-length entry per directory data block (spec §6
/// "Directory leaf block ... bestcount + bests[]").
#[derive(Debug, Clone)]
pub struct Leaf1Tail {
    pub bests: Vec<u16>,
}

pub fn decode_leaf1_tail(buf: &[u8], block_size: usize) -> Result<Leaf1Tail> {
    if block_size < 4 {
        return Err(RepairError::Parse("block too small for leaf1 tail"));
    }
    let count_off = block_size - 4;
    let bestcount = u32::from_be_bytes(buf[count_off..count_off + 4].try_into().unwrap()) as usize;
    let bests_start = count_off.checked_sub(bestcount * 2).ok_or(RepairError::Corruption("leaf1 bestcount too large for block"))?;
    let mut bests = Vec::with_capacity(bestcount);
    for i in 0..bestcount {
        let off = bests_start + i * 2;
        bests.push(u16::from_be_bytes(buf[off..off + 2].try_into().unwrap()));
    }
    Ok(Leaf1Tail { bests })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_then_encode_header_round_trips() {
        let mut buf = vec![0u8; 32];
        let header = LeafHeader {
            forw: 5,
            back: 3,
            magic: LEAFN_MAGIC_V4,
            count: 2,
            stale: 1,
            hdr_size: 16,
        };
        encode_header(&mut buf, &header);
        let decoded = decode_header(&buf, FormatVersion::V4).unwrap();
        assert_eq!(decoded.forw, 5);
        assert_eq!(decoded.count, 2);
        assert_eq!(decoded.stale, 1);
    }

    #[test]
    fn entries_round_trip_and_stale_count_matches_null_dataptr() {
        let mut buf = vec![0u8; 64];
        let header = LeafHeader {
            forw: 0,
            back: 0,
            magic: LEAFN_MAGIC_V4,
            count: 3,
            stale: 1,
            hdr_size: 16,
        };
        encode_header(&mut buf, &header);
        let entries = vec![
            LeafEntry { hashval: 10, address: 100 },
            LeafEntry { hashval: 20, address: NULL_DATAPTR },
            LeafEntry { hashval: 30, address: 300 },
        ];
        encode_entries(&mut buf, header.hdr_size, &entries);
        let decoded = decode_entries(&buf, &header).unwrap();
        let stale_count = decoded.iter().filter(|e| e.address == NULL_DATAPTR).count();
        assert_eq!(stale_count, header.stale as usize);
        assert_eq!(decoded, entries);
    }
}
