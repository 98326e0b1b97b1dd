use crate::error::{RepairError, Result};
use crate::io::{BlockDevice, BufCache};
use crate::log::record::RecordHeader;

/// Upper bound on concurrently open log record headers this search
/// considers when aligning the head to a record boundary (spec §4.C3).
pub const MAX_ICLOGS: u32 = 8;

/// log2 of the largest record size this search window accounts for, in
/// bytes (262144 = 256 KiB, comfortably above any real transaction).
pub const MAX_RECORD_BSHIFT: u32 = 18;

pub const MAX_RECORD_BSIZE: u32 = 1 << MAX_RECORD_BSHIFT;

pub const MAX_RECORD_BB: u32 = MAX_RECORD_BSIZE / crate::io::BB_SIZE as u32;

/// The circular log's absolute location on disk, addressed in basic
/// blocks (spec §3 "Physical log").
#[derive(Debug, Clone, Copy)]
pub struct LogGeom {
    pub start_bb: u64,
    pub length_bb: u32,
}

impl LogGeom {
    /// Resolve a log-relative block number to an absolute device BB,
    /// wrapping modulo the log length.
    pub fn resolve(&self, blk: u32) -> u64 {
        self.start_bb + (blk as u64 % self.length_bb as u64)
    }

    /// Add a signed delta to a log-relative block number, wrapping modulo
    /// the log length.
    pub fn wrap_add(&self, blk: u32, delta: i64) -> u32 {
        let l = self.length_bb as i64;
        (((blk as i64 + delta) % l + l) % l) as u32
    }
}

fn read_cycle<D: BlockDevice>(cache: &mut BufCache<D>, geom: &LogGeom, blk: u32) -> Result<u32> {
    let buf = cache.read(geom.resolve(blk), 1)?;
    Ok(u32::from_be_bytes(buf.bytes()[0..4].try_into().unwrap()))
}

/// Binary search for the lowest block in `[first, last]` whose cycle
/// equals `cycle`, given the range brackets the transition (spec §4.C3).
pub fn find_cycle_start<D: BlockDevice>(
    cache: &mut BufCache<D>,
    geom: &LogGeom,
    mut first: u32,
    mut last: u32,
    cycle: u32,
) -> Result<u32> {
    while first < last {
        let mid = first + (last - first) / 2;
        let mid_cycle = read_cycle(cache, geom, mid)?;
        if mid_cycle == cycle {
            last = mid;
        } else {
            first = mid + 1;
        }
    }
    Ok(first)
}

/// Sentinel meaning "scanned the whole range without finding `stop_cycle`".
pub const NOT_FOUND: u32 = u32::MAX;

/// Linear forward scan for the first BB, starting at `start` and covering
/// `n` blocks, whose cycle equals `stop_cycle`.
pub fn find_verify_cycle<D: BlockDevice>(
    cache: &mut BufCache<D>,
    geom: &LogGeom,
    start: u32,
    n: u32,
    stop_cycle: u32,
) -> Result<u32> {
    for i in 0..n {
        let blk = geom.wrap_add(start, i as i64);
        if read_cycle(cache, geom, blk)? == stop_cycle {
            return Ok(blk);
        }
    }
    Ok(NOT_FOUND)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSearchResult {
    Found,
    NotFound,
}

/// Scan backwards from `last - 1` toward `start` for a log record header,
/// verifying its UUID and adjusting `last` if the search stopped mid
/// record (spec §4.C3 `find_verify_log_record`).
pub fn find_verify_log_record<D: BlockDevice>(
    cache: &mut BufCache<D>,
    geom: &LogGeom,
    start: u32,
    last: &mut u32,
    extra: u32,
    fs_uuid: [u8; 16],
) -> Result<RecordSearchResult> {
    let mut i = geom.wrap_add(*last, -1);
    loop {
        let buf = cache.read(geom.resolve(i), 1)?;
        if RecordHeader::magic_ok(buf.bytes()) {
            let header = RecordHeader::decode(buf.bytes())?;
            if header.fs_uuid != fs_uuid {
                return Err(RepairError::Corruption("log record UUID does not match mount"));
            }
            let bblks = crate::log::record::data_bblks(header.len) + 1;
            let found = i;
            let distance = geom.wrap_add(*last, -(found as i64)).wrapping_add(extra);
            if distance != bblks {
                *last = found;
            }
            return Ok(RecordSearchResult::Found);
        }
        if i == start {
            return Ok(RecordSearchResult::NotFound);
        }
        i = geom.wrap_add(i, -1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroedState {
    /// Every BB in the log has cycle 0: the log has never been written.
    Zeroed,
    /// A prefix of the log is written (cycle 1) and the rest is zeroed;
    /// carries the block number of the first zero-cycle BB.
    Partial(u32),
    /// The entire log has been written at least once.
    Written,
}

/// Classify the log as zeroed, partially zeroed, or fully written by
/// inspecting BB 0 and BB `L-1` (spec §4.C3 `find_zeroed`).
pub fn find_zeroed<D: BlockDevice>(cache: &mut BufCache<D>, geom: &LogGeom) -> Result<ZeroedState> {
    let first_cycle = read_cycle(cache, geom, 0)?;
    if first_cycle == 0 {
        let last_cycle = read_cycle(cache, geom, geom.length_bb - 1)?;
        if last_cycle != 0 {
            return Err(RepairError::Corruption("log head zeroed but tail is not"));
        }
        return Ok(ZeroedState::Zeroed);
    }

    let last_cycle = read_cycle(cache, geom, geom.length_bb - 1)?;
    if last_cycle == 0 {
        if first_cycle != 1 {
            return Err(RepairError::Corruption("partially zeroed log must start at cycle 1"));
        }
        let first_nonzero = find_verify_cycle(cache, geom, 0, geom.length_bb, 0)?;
        if first_nonzero == NOT_FOUND {
            return Err(RepairError::Corruption("log reported partial-zero but no zero BB found"));
        }
        return Ok(ZeroedState::Partial(first_nonzero));
    }

    Ok(ZeroedState::Written)
}

/// Locate the log head: the block one past the newest valid record (spec
/// §4.C3 `find_head`).
pub fn find_head<D: BlockDevice>(cache: &mut BufCache<D>, geom: &LogGeom, fs_uuid: [u8; 16]) -> Result<u32> {
    let first_cycle = read_cycle(cache, geom, 0)?;
    let last_cycle = read_cycle(cache, geom, geom.length_bb - 1)?;

    let mut head_blk = if first_cycle == last_cycle {
        // The whole log carries one cycle; the head sits right after a
        // possible hole of the prior cycle at the tail end.
        let stop_cycle = last_cycle.wrapping_sub(1);
        let found = find_verify_cycle(cache, geom, 0, geom.length_bb, stop_cycle)?;
        if found == NOT_FOUND { 0 } else { found }
    } else {
        find_cycle_start(cache, geom, 0, geom.length_bb - 1, last_cycle)?
    };

    let window = MAX_ICLOGS.saturating_mul(MAX_RECORD_BB).min(geom.length_bb);
    let scan_start = geom.wrap_add(head_blk, -(window as i64));
    verify_head_pattern(cache, geom, scan_start, head_blk, last_cycle)?;

    let mut last = head_blk;
    let align_window = MAX_RECORD_BB.min(geom.length_bb);
    let align_start = geom.wrap_add(head_blk, -(align_window as i64));
    match find_verify_log_record(cache, geom, align_start, &mut last, 0, fs_uuid) {
        Ok(RecordSearchResult::Found) => head_blk = last,
        Ok(RecordSearchResult::NotFound) => {
            let wrap_start = geom.wrap_add(geom.length_bb, -(align_window as i64));
            let mut last2 = geom.length_bb;
            if find_verify_log_record(cache, geom, wrap_start, &mut last2, 0, fs_uuid)?
                == RecordSearchResult::Found
            {
                head_blk = last2 % geom.length_bb;
            }
        }
        Err(_) => {}
    }

    Ok(head_blk)
}

/// Scan the window leading up to `head_blk` for the cycle patterns spec
/// §4.C3 names (`x+1|x|x+1|x...`, `x+1|x..|x-1|x`, `x+1|x..|x+1|x`, with
/// `x` = `expected_cycle`): a single transition down from the stale `x+1`
/// straggler cycle into `x` (the boundary the binary search located),
/// tolerating one torn-write blip to `x-1` right at that boundary but never
/// a second transition back up to `x+1` after the walk has settled. Either
/// anomaly means the approximate head landed one record off, which both
/// search branches above have already exhausted their ability to correct.
fn verify_head_pattern<D: BlockDevice>(
    cache: &mut BufCache<D>,
    geom: &LogGeom,
    scan_start: u32,
    head_blk: u32,
    expected_cycle: u32,
) -> Result<()> {
    let at_boundary = |cycle: u32| cycle == expected_cycle || cycle == expected_cycle.wrapping_sub(1);

    let mut blk = scan_start;
    let mut cur = read_cycle(cache, geom, blk)?;
    let mut settled = at_boundary(cur);

    while blk != head_blk {
        let next_blk = geom.wrap_add(blk, 1);
        let next = read_cycle(cache, geom, next_blk)?;

        let delta_ok = next == cur || next == cur.wrapping_sub(1) || next == cur.wrapping_add(1);
        if !delta_ok {
            return Err(RepairError::Corruption("log cycle sequence skipped a generation"));
        }

        if at_boundary(next) {
            settled = true;
        } else if settled && next == expected_cycle.wrapping_add(1) {
            return Err(RepairError::Corruption(
                "log cycle sequence reverted past the head boundary; head estimate landed one record off",
            ));
        }

        cur = next;
        blk = next_blk;
    }

    if !at_boundary(cur) {
        return Err(RepairError::Corruption("log head does not land on the expected cycle boundary"));
    }
    Ok(())
}

/// Locate the log tail given the head: the LSN block recorded in the
/// nearest record header's `tail_lsn`, advanced past a trailing unmount
/// record if one is found immediately before the head (spec §4.C3
/// `find_tail`).
pub fn find_tail<D: BlockDevice>(
    cache: &mut BufCache<D>,
    geom: &LogGeom,
    head_blk: u32,
    fs_uuid: [u8; 16],
) -> Result<u32> {
    let mut last = head_blk;
    let mut found = find_verify_log_record(cache, geom, 0, &mut last, 0, fs_uuid)?;
    if found == RecordSearchResult::NotFound {
        last = geom.length_bb;
        found = find_verify_log_record(cache, geom, head_blk, &mut last, 0, fs_uuid)?;
        if found == RecordSearchResult::NotFound {
            return Err(RepairError::Corruption("no log record found while searching for tail"));
        }
    }

    let rec_blk = geom.wrap_add(last, -1);
    let header_buf = cache.read(geom.resolve(rec_blk), 1)?;
    let header = RecordHeader::decode(header_buf.bytes())?;
    let mut tail_blk = crate::log::record::lsn_block(header.tail_lsn);

    // An unmount record is exactly one header BB and one data BB; if it
    // sits immediately before the head, the true tail is past it. Verify
    // `num_logops == 1` before trusting the position heuristic (spec §9
    // open question).
    let unmount_header_blk = geom.wrap_add(head_blk, -2);
    if let Ok(buf) = cache.read(geom.resolve(unmount_header_blk), 1) {
        if RecordHeader::magic_ok(buf.bytes()) {
            if let Ok(h) = RecordHeader::decode(buf.bytes()) {
                if h.num_logops == 1 && h.fs_uuid == fs_uuid {
                    if let Ok(op_buf) = cache.read(geom.resolve(geom.wrap_add(unmount_header_blk, 1)), 1) {
                        if let Ok(op) = crate::log::record::OpHeader::decode(op_buf.bytes()) {
                            if op.flags & crate::log::record::op_flags::UNMOUNT != 0 {
                                tail_blk = head_blk;
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(tail_blk)
}
