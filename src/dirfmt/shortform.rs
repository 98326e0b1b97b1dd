use crate::dirfmt::block::data_entry_size;
use crate::error::{RepairError, Result};

/// Header size when the parent inode fits in 4 bytes.
pub const SF_HDR4_SIZE: usize = 1 + 1 + 4;
/// Header size when the parent inode needs 8 bytes.
pub const SF_HDR8_SIZE: usize = 1 + 1 + 8;

/// Inode numbers at or above this value cannot be embedded in 4 bytes.
pub const SF_8BYTE_THRESHOLD: u64 = 1 << 32;

/// Byte offset the first data-block-equivalent entry would occupy if this
/// directory were promoted to block format (spec §4.C5 `sf_fix_offsets`).
pub const DATA_FIRST_OFFSET: u16 = 64;

#[derive(Debug, Clone)]
pub struct SfEntry {
    pub namelen: u8,
    pub offset: u16,
    pub name: Vec<u8>,
    pub ino: u64,
}

impl SfEntry {
    fn on_disk_size(&self, use_8byte: bool) -> usize {
        1 + 2 + self.namelen as usize + if use_8byte { 8 } else { 4 }
    }
}

#[derive(Debug, Clone)]
pub struct ShortformDir {
    pub count: u8,
    pub i8count: u8,
    pub parent: u64,
    pub entries: Vec<SfEntry>,
}

impl ShortformDir {
    pub fn uses_8byte(&self) -> bool {
        self.i8count != 0
    }

    pub fn hdr_size(&self) -> usize {
        if self.uses_8byte() { SF_HDR8_SIZE } else { SF_HDR4_SIZE }
    }

    /// Total on-disk size this fork would occupy if encoded now.
    pub fn encoded_size(&self) -> usize {
        let use_8 = self.uses_8byte();
        self.hdr_size() + self.entries.iter().map(|e| e.on_disk_size(use_8)).sum::<usize>()
    }
}

/// A decoded shortform directory fork, plus whether decoding had to stop
/// before exhausting the header's declared `count` (spec §8 scenario S3's
/// truncate-on-overrun clause: a trailing entry whose namelen would run
/// it past the end of the fork is junked, along with everything after it).
pub struct Decoded {
    pub dir: ShortformDir,
    pub truncated: bool,
}

/// Decode a shortform directory fork (spec §6 "Directory shortform
/// header"/"Directory shortform entry"), entry at a time. A malformed
/// header is unrecoverable (there is no parent/count to fall back on) and
/// still hard-errors; a malformed trailing entry is not — decoding stops
/// at the last entry that parsed cleanly and reports `truncated` instead
/// of failing the whole fork.
pub fn decode_lenient(fork_buf: &[u8]) -> Result<Decoded> {
    if fork_buf.len() < 2 {
        return Err(RepairError::Parse("shortform fork too small for header"));
    }
    let count = fork_buf[0];
    let i8count = fork_buf[1];
    let use_8byte = i8count != 0;

    let (parent, hdr_size) = if use_8byte {
        if fork_buf.len() < SF_HDR8_SIZE {
            return Err(RepairError::Parse("shortform fork too small for 8-byte header"));
        }
        (u64::from_be_bytes(fork_buf[2..10].try_into().unwrap()), SF_HDR8_SIZE)
    } else {
        if fork_buf.len() < SF_HDR4_SIZE {
            return Err(RepairError::Parse("shortform fork too small for 4-byte header"));
        }
        (u32::from_be_bytes(fork_buf[2..6].try_into().unwrap()) as u64, SF_HDR4_SIZE)
    };

    let ino_size = if use_8byte { 8 } else { 4 };
    let mut entries = Vec::with_capacity(count as usize);
    let mut offset = hdr_size;
    let mut truncated = false;

    for _ in 0..count {
        if offset + 3 > fork_buf.len() {
            truncated = true;
            break;
        }
        let namelen = fork_buf[offset];
        let entry_offset = u16::from_be_bytes(fork_buf[offset + 1..offset + 3].try_into().unwrap());
        let name_start = offset + 3;
        let name_end = name_start + namelen as usize;
        if name_end + ino_size > fork_buf.len() {
            truncated = true;
            break;
        }
        let name = fork_buf[name_start..name_end].to_vec();
        let ino = if use_8byte {
            u64::from_be_bytes(fork_buf[name_end..name_end + 8].try_into().unwrap())
        } else {
            u32::from_be_bytes(fork_buf[name_end..name_end + 4].try_into().unwrap()) as u64
        };
        entries.push(SfEntry {
            namelen,
            offset: entry_offset,
            name,
            ino,
        });
        offset = name_end + ino_size;
    }

    let count = entries.len() as u8;
    Ok(Decoded {
        dir: ShortformDir { count, i8count, parent, entries },
        truncated,
    })
}

/// Decode a shortform directory fork, hard-erroring on any entry that runs
/// past the end of the fork. Callers that need to recover a truncated fork
/// rather than reject it outright should use [`decode_lenient`].
pub fn decode(fork_buf: &[u8]) -> Result<ShortformDir> {
    let decoded = decode_lenient(fork_buf)?;
    if decoded.truncated {
        return Err(RepairError::Parse("shortform entry runs past end of fork"));
    }
    Ok(decoded.dir)
}

/// Encode a shortform directory back into fork bytes, sized to exactly
/// hold the current `count`/`entries`/inode-size combination.
pub fn encode(dir: &ShortformDir) -> Vec<u8> {
    let use_8byte = dir.uses_8byte();
    let mut buf = vec![0u8; dir.encoded_size()];
    buf[0] = dir.count;
    buf[1] = dir.i8count;
    if use_8byte {
        buf[2..10].copy_from_slice(&dir.parent.to_be_bytes());
    } else {
        buf[2..6].copy_from_slice(&(dir.parent as u32).to_be_bytes());
    }

    let mut offset = dir.hdr_size();
    for entry in &dir.entries {
        buf[offset] = entry.namelen;
        buf[offset + 1..offset + 3].copy_from_slice(&entry.offset.to_be_bytes());
        let name_start = offset + 3;
        let name_end = name_start + entry.namelen as usize;
        buf[name_start..name_end].copy_from_slice(&entry.name);
        if use_8byte {
            buf[name_end..name_end + 8].copy_from_slice(&entry.ino.to_be_bytes());
            offset = name_end + 8;
        } else {
            buf[name_end..name_end + 4].copy_from_slice(&(entry.ino as u32).to_be_bytes());
            offset = name_end + 4;
        }
    }

    buf
}

/// Shrink 8-byte inode fields back to 4 when every surviving inode number
/// is below the embeddable limit (spec §4.C5 `sf_fix_i8`). No-op if any
/// entry or the parent still needs 8 bytes.
pub fn sf_fix_i8(dir: &mut ShortformDir) {
    if dir.parent >= SF_8BYTE_THRESHOLD || dir.entries.iter().any(|e| e.ino >= SF_8BYTE_THRESHOLD) {
        return;
    }
    dir.i8count = 0;
}

/// Regenerate monotonically increasing shortform entry offsets starting
/// at [`DATA_FIRST_OFFSET`], each advancing by the entry's on-disk size
/// as it would appear in block format (spec §4.C5 `sf_fix_offsets`).
pub fn sf_fix_offsets(dir: &mut ShortformDir, has_ftype: bool) {
    let mut offset = DATA_FIRST_OFFSET;
    for entry in &mut dir.entries {
        entry.offset = offset;
        offset += data_entry_size(entry.namelen, has_ftype);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, ino: u64, offset: u16) -> SfEntry {
        SfEntry {
            namelen: name.len() as u8,
            offset,
            name: name.as_bytes().to_vec(),
            ino,
        }
    }

    #[test]
    fn decode_then_encode_round_trips() {
        let dir = ShortformDir {
            count: 2,
            i8count: 0,
            parent: 128,
            entries: vec![entry("a", 99, 64), entry("bb", 88, 72)],
        };
        let buf = encode(&dir);
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.count, 2);
        assert_eq!(decoded.parent, 128);
        assert_eq!(decoded.entries[0].name, b"a");
        assert_eq!(decoded.entries[1].ino, 88);
    }

    #[test]
    fn scenario_s3_duplicate_names_distinct_inodes_both_retained() {
        let dir = ShortformDir {
            count: 3,
            i8count: 0,
            parent: 2,
            entries: vec![entry("a", 99, 64), entry("b", 88, 68), entry("b", 77, 72)],
        };
        let buf = encode(&dir);
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.entries.len(), 3);
        assert_eq!(decoded.entries[1].ino, 88);
        assert_eq!(decoded.entries[2].ino, 77);
    }

    #[test]
    fn scenario_s3_trailing_entry_past_fork_end_is_truncated() {
        let dir = ShortformDir {
            count: 2,
            i8count: 0,
            parent: 2,
            entries: vec![entry("a", 99, 64), entry("longname", 88, 68)],
        };
        let mut buf = encode(&dir);
        // Lop off the tail so the second entry's name+inode run past the
        // buffer, the way a truncated di_size would on disk.
        buf.truncate(buf.len() - 4);

        assert!(decode(&buf).is_err());

        let decoded = decode_lenient(&buf).unwrap();
        assert!(decoded.truncated);
        assert_eq!(decoded.dir.entries.len(), 1);
        assert_eq!(decoded.dir.entries[0].name, b"a");
        assert_eq!(decoded.dir.count, 1);
    }

    #[test]
    fn sf_fix_i8_shrinks_when_all_inodes_fit() {
        let mut dir = ShortformDir {
            count: 1,
            i8count: 1,
            parent: 2,
            entries: vec![entry("a", 99, 64)],
        };
        sf_fix_i8(&mut dir);
        assert_eq!(dir.i8count, 0);
    }

    #[test]
    fn sf_fix_i8_noop_when_an_inode_needs_8_bytes() {
        let mut dir = ShortformDir {
            count: 1,
            i8count: 1,
            parent: 2,
            entries: vec![entry("a", SF_8BYTE_THRESHOLD + 5, 64)],
        };
        sf_fix_i8(&mut dir);
        assert_eq!(dir.i8count, 1);
    }

    #[test]
    fn sf_fix_offsets_is_monotonic() {
        let mut dir = ShortformDir {
            count: 2,
            i8count: 0,
            parent: 2,
            entries: vec![entry("aaa", 10, 0), entry("b", 11, 0)],
        };
        sf_fix_offsets(&mut dir, false);
        assert!(dir.entries[0].offset < dir.entries[1].offset);
        assert_eq!(dir.entries[0].offset, DATA_FIRST_OFFSET);
    }
}
