use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
use zerocopy::byteorder::big_endian::{U16, U32, U64};

use crate::error::{RepairError, Result};
use crate::io::aligned_buf::BB_SIZE;

/// Log record header magic ("FEEDbabe" — matches the on-disk constant this
/// family of filesystems has always used, so a hex dump of a real log is
/// recognisable against this code).
pub const RECORD_MAGIC: u32 = 0xFEED_BABE;

/// Size in bytes of the fixed portion of a record header, before the
/// cycle-data table.
const HEADER_FIXED_SIZE: usize = 60;

/// Offset of the cycle-data table within the header BB.
const CYCLE_DATA_OFFSET: usize = HEADER_FIXED_SIZE;

/// How many 4-byte cycle-data slots fit in the remainder of the header BB.
/// This caps a single record's data area at this many BBs (plenty for any
/// real transaction; larger transactions split across multiple records).
pub const MAX_CYCLE_DATA_SLOTS: usize = (BB_SIZE - CYCLE_DATA_OFFSET) / 4;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct RecordHeaderFixed {
    magic: U32,
    cycle: U32,
    version: U16,
    _pad: U16,
    len: U32,
    lsn: U64,
    tail_lsn: U64,
    chksum: U32,
    prev_block: U32,
    num_logops: U32,
    fs_uuid: [u8; 16],
}

/// A decoded log record header (spec §6 "Log record header").
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub cycle: u32,
    pub version: u16,
    pub len: u32,
    pub lsn: u64,
    pub tail_lsn: u64,
    pub chksum: u32,
    pub prev_block: u32,
    pub num_logops: u32,
    pub fs_uuid: [u8; 16],
    cycle_data: Vec<u32>,
}

/// LSN = (cycle << 32) | block, per GLOSSARY.
pub fn make_lsn(cycle: u32, block: u32) -> u64 {
    ((cycle as u64) << 32) | block as u64
}

pub fn lsn_cycle(lsn: u64) -> u32 {
    (lsn >> 32) as u32
}

pub fn lsn_block(lsn: u64) -> u32 {
    (lsn & 0xFFFF_FFFF) as u32
}

/// Number of BBs a record's data area occupies.
pub fn data_bblks(h_len: u32) -> u32 {
    h_len.div_ceil(BB_SIZE as u32)
}

impl RecordHeader {
    /// Decode a header from a single header BB. Does not validate the
    /// magic or UUID — callers do that against the mount UUID they hold.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let fixed = RecordHeaderFixed::ref_from_prefix(buf)
            .map_err(|_| RepairError::Parse("buffer too small for log record header"))?
            .0;

        let nbbs = data_bblks(fixed.len.get()) as usize;
        if nbbs > MAX_CYCLE_DATA_SLOTS {
            return Err(RepairError::Corruption("log record declares an implausible length"));
        }

        let mut cycle_data = Vec::with_capacity(nbbs);
        for i in 0..nbbs {
            let off = CYCLE_DATA_OFFSET + i * 4;
            let word = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
            cycle_data.push(word);
        }

        Ok(Self {
            cycle: fixed.cycle.get(),
            version: fixed.version.get(),
            len: fixed.len.get(),
            lsn: fixed.lsn.get(),
            tail_lsn: fixed.tail_lsn.get(),
            chksum: fixed.chksum.get(),
            prev_block: fixed.prev_block.get(),
            num_logops: fixed.num_logops.get(),
            fs_uuid: fixed.fs_uuid,
            cycle_data,
        })
    }

    pub fn magic_ok(buf: &[u8]) -> bool {
        buf.len() >= 4 && u32::from_be_bytes(buf[0..4].try_into().unwrap()) == RECORD_MAGIC
    }

    /// Encode a header into a fresh BB-sized buffer. Used by test fixtures
    /// and by [`pack_record`]; the recovery core itself never writes log
    /// records, only replays them.
    pub fn encode(&self) -> Vec<u8> {
        let fixed = RecordHeaderFixed {
            magic: U32::new(RECORD_MAGIC),
            cycle: U32::new(self.cycle),
            version: U16::new(self.version),
            _pad: U16::new(0),
            len: U32::new(self.len),
            lsn: U64::new(self.lsn),
            tail_lsn: U64::new(self.tail_lsn),
            chksum: U32::new(self.chksum),
            prev_block: U32::new(self.prev_block),
            num_logops: U32::new(self.num_logops),
            fs_uuid: self.fs_uuid,
        };
        let mut buf = vec![0u8; BB_SIZE];
        buf[..HEADER_FIXED_SIZE].copy_from_slice(fixed.as_bytes());
        for (i, word) in self.cycle_data.iter().enumerate() {
            let off = CYCLE_DATA_OFFSET + i * 4;
            buf[off..off + 4].copy_from_slice(&word.to_be_bytes());
        }
        buf
    }

    pub fn new(cycle: u32, len: u32, lsn: u64, tail_lsn: u64, num_logops: u32, fs_uuid: [u8; 16]) -> Self {
        Self {
            cycle,
            version: 2,
            len,
            lsn,
            tail_lsn,
            chksum: 0,
            prev_block: 0,
            num_logops,
            fs_uuid,
            cycle_data: vec![0u32; data_bblks(len) as usize],
        }
    }
}

/// Operation header flags (spec §3 "Log operation").
pub mod op_flags {
    pub const START: u8 = 0x01;
    pub const COMMIT: u8 = 0x02;
    pub const CONTINUE: u8 = 0x04;
    pub const WAS_CONT: u8 = 0x08;
    pub const END: u8 = 0x10;
    pub const UNMOUNT: u8 = 0x20;
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
struct OpHeaderDisk {
    tid: U32,
    len: U32,
    clientid: u8,
    flags: u8,
    _pad: U16,
}

/// A decoded log operation header.
#[derive(Debug, Clone, Copy)]
pub struct OpHeader {
    pub tid: u32,
    pub len: u32,
    pub clientid: u8,
    pub flags: u8,
}

pub const CLIENT_TRANSACTION: u8 = 0x69;
pub const CLIENT_LOG: u8 = 0x0a;

pub const OP_HEADER_SIZE: usize = std::mem::size_of::<OpHeaderDisk>();

impl OpHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let d = OpHeaderDisk::ref_from_prefix(buf)
            .map_err(|_| RepairError::Parse("buffer too small for op header"))?
            .0;
        Ok(Self {
            tid: d.tid.get(),
            len: d.len.get(),
            clientid: d.clientid,
            flags: d.flags,
        })
    }

    pub fn encode(&self) -> [u8; OP_HEADER_SIZE] {
        let d = OpHeaderDisk {
            tid: U32::new(self.tid),
            len: U32::new(self.len),
            clientid: self.clientid,
            flags: self.flags,
            _pad: U16::new(0),
        };
        let mut out = [0u8; OP_HEADER_SIZE];
        out.copy_from_slice(d.as_bytes());
        out
    }
}

/// Reinject the header's cycle-data words into the first word of every BB
/// of `data`, in place. This undoes the write-time substitution described
/// in spec §3 ("Log record"): each data BB's true first word was swapped
/// out for a cycle stamp and stashed in the header.
pub fn unpack_record(header: &RecordHeader, data: &mut [u8]) -> Result<()> {
    let nbbs = data_bblks(header.len);
    if header.cycle_data.len() < nbbs as usize {
        return Err(RepairError::Corruption("cycle-data table shorter than record"));
    }
    for i in 0..nbbs as usize {
        let off = i * BB_SIZE;
        if off + 4 > data.len() {
            return Err(RepairError::Corruption("record data shorter than declared length"));
        }
        data[off..off + 4].copy_from_slice(&header.cycle_data[i].to_be_bytes());
    }
    Ok(())
}

/// Inverse of [`unpack_record`]: stash each data BB's true first word into
/// a fresh header's cycle-data table and stamp the BB's first word with
/// `cycle` instead. Used only by test fixtures that build synthetic log
/// images; the recovery core itself never writes new records.
pub fn pack_record(cycle: u32, lsn: u64, tail_lsn: u64, num_logops: u32, fs_uuid: [u8; 16], data: &mut [u8]) -> RecordHeader {
    let nbbs = data.len().div_ceil(BB_SIZE);
    let mut cycle_data = Vec::with_capacity(nbbs);
    for i in 0..nbbs {
        let off = i * BB_SIZE;
        let end = (off + 4).min(data.len());
        let mut word_bytes = [0u8; 4];
        word_bytes[..end - off].copy_from_slice(&data[off..end]);
        cycle_data.push(u32::from_be_bytes(word_bytes));
        data[off..end].copy_from_slice(&cycle.to_be_bytes()[..end - off]);
    }
    RecordHeader {
        cycle,
        version: 2,
        len: data.len() as u32,
        lsn,
        tail_lsn,
        chksum: 0,
        prev_block: 0,
        num_logops,
        fs_uuid,
        cycle_data,
    }
}
