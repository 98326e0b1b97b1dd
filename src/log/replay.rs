use crate::error::{RepairError, Result};
use crate::io::{BlockDevice, BufCache};
use crate::log::record::{self, OpHeader, RecordHeader, op_flags};
use crate::log::scanner::LogGeom;

/// Size of the in-flight transaction hash table (XLOG_RHASH_SIZE, spec §9
/// redesign note — preserved so tid collisions behave the same as the
/// source's intrusive-list table).
pub const RHASH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    One,
    Two,
}

/// One reconstructed item inside a transaction: a description region
/// (its first word holds `{item_type: u16, total_regions: u16}`) followed
/// by zero or more data regions.
#[derive(Debug, Clone)]
pub struct Item {
    pub item_type: u16,
    pub total_regions: u16,
    pub regions: Vec<Vec<u8>>,
}

impl Item {
    fn is_complete(&self) -> bool {
        self.regions.len() as u16 >= self.total_regions
    }
}

/// A transaction reassembled from its START through its COMMIT.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub tid: u32,
    pub lsn: u64,
    pub header: Vec<u8>,
    pub items: Vec<Item>,
    got_header: bool,
}

impl Transaction {
    fn new(tid: u32, lsn: u64) -> Self {
        Self {
            tid,
            lsn,
            header: Vec::new(),
            items: Vec::new(),
            got_header: false,
        }
    }

    fn add_region(&mut self, payload: Vec<u8>) -> Result<()> {
        if !self.got_header {
            self.header = payload;
            self.got_header = true;
            return Ok(());
        }

        let need_new_item = match self.items.last() {
            None => true,
            Some(item) => item.is_complete(),
        };

        if need_new_item {
            if payload.len() < 4 {
                return Err(RepairError::Protocol("item description region shorter than 4 bytes"));
            }
            let word = u32::from_be_bytes(payload[0..4].try_into().unwrap());
            let item_type = (word >> 16) as u16;
            let total_regions = (word & 0xFFFF) as u16;
            if total_regions == 0 {
                return Err(RepairError::Protocol("item declares zero total regions"));
            }
            self.items.push(Item {
                item_type,
                total_regions,
                regions: vec![payload],
            });
        } else {
            self.items
                .last_mut()
                .expect("need_new_item false implies an item exists")
                .regions
                .push(payload);
        }
        Ok(())
    }

    fn append_continuation(&mut self, extra: &[u8]) -> Result<()> {
        let item = self
            .items
            .last_mut()
            .ok_or(RepairError::Protocol("WAS_CONT with no open item"))?;
        let region = item
            .regions
            .last_mut()
            .ok_or(RepairError::Protocol("WAS_CONT with no open region"))?;
        region.extend_from_slice(extra);
        Ok(())
    }
}

/// Open-addressed hash table of in-flight transactions keyed by tid, fixed
/// at [`RHASH_SIZE`] buckets with each bucket chaining collisions in a
/// `Vec` (spec §9: "preserves the existing behaviour where tids collide
/// deterministically").
struct TxnTable {
    buckets: Vec<Vec<Transaction>>,
}

impl TxnTable {
    fn new() -> Self {
        Self {
            buckets: (0..RHASH_SIZE).map(|_| Vec::new()).collect(),
        }
    }

    fn bucket(tid: u32) -> usize {
        (tid as usize) % RHASH_SIZE
    }

    fn contains(&self, tid: u32) -> bool {
        self.buckets[Self::bucket(tid)].iter().any(|t| t.tid == tid)
    }

    fn get_mut(&mut self, tid: u32) -> Option<&mut Transaction> {
        self.buckets[Self::bucket(tid)].iter_mut().find(|t| t.tid == tid)
    }

    fn insert(&mut self, txn: Transaction) {
        self.buckets[Self::bucket(txn.tid)].push(txn);
    }

    fn remove(&mut self, tid: u32) -> Option<Transaction> {
        let bucket = &mut self.buckets[Self::bucket(tid)];
        let idx = bucket.iter().position(|t| t.tid == tid)?;
        Some(bucket.swap_remove(idx))
    }
}

/// Per-pass commit handling is an external collaborator (spec §4.C4): this
/// crate only guarantees the two-pass ordering and exactly-once-per-pass
/// delivery contract, not the buffer/inode/EFI semantics of a commit.
pub trait TransactionDispatcher {
    fn commit(&mut self, pass: Pass, txn: &Transaction) -> Result<()>;
}

/// Replay every operation in one record's data area against `table`,
/// dispatching completed transactions to `dispatcher` (spec §4.C4
/// `process_data`).
fn process_data(
    table: &mut TxnTable,
    header: &RecordHeader,
    data: &[u8],
    pass: Pass,
    dispatcher: &mut dyn TransactionDispatcher,
) -> Result<()> {
    let mut offset = 0usize;
    for _ in 0..header.num_logops {
        let op = OpHeader::decode(&data[offset..]).map_err(|_| RepairError::Corruption("truncated op header"))?;
        offset += record::OP_HEADER_SIZE;
        let end = offset
            .checked_add(op.len as usize)
            .filter(|&e| e <= data.len())
            .ok_or(RepairError::Corruption("op payload runs past record data"))?;
        let payload = &data[offset..end];
        offset = end;

        let dispatch_flags = op.flags & !op_flags::END;

        if dispatch_flags & op_flags::START != 0 {
            if table.contains(op.tid) {
                return Err(RepairError::Protocol("START for a tid already in flight"));
            }
            table.insert(Transaction::new(op.tid, header.lsn));
            continue;
        }

        if dispatch_flags & op_flags::WAS_CONT != 0 {
            let txn = table
                .get_mut(op.tid)
                .ok_or(RepairError::Protocol("op for unknown tid"))?;
            txn.append_continuation(payload)?;
            continue;
        }

        if dispatch_flags & op_flags::CONTINUE != 0 || dispatch_flags == 0 {
            let txn = table
                .get_mut(op.tid)
                .ok_or(RepairError::Protocol("op for unknown tid"))?;
            txn.add_region(payload.to_vec())?;
            continue;
        }

        if dispatch_flags & op_flags::COMMIT != 0 {
            let txn = table
                .remove(op.tid)
                .ok_or(RepairError::Protocol("COMMIT for unknown tid"))?;
            dispatcher.commit(pass, &txn)?;
            continue;
        }

        if dispatch_flags & op_flags::UNMOUNT != 0 {
            table.remove(op.tid);
            continue;
        }

        return Err(RepairError::Protocol("log operation carries an unrecognised flag combination"));
    }
    Ok(())
}

/// Replay the log range `[tail, head)` (modulo the log length) against
/// `dispatcher`, for one pass (spec §4.C4 `replay`). The caller is
/// responsible for invoking this twice, once per [`Pass`], per the
/// ordering contract in spec §5.
pub fn replay<D: BlockDevice>(
    cache: &mut BufCache<D>,
    geom: &LogGeom,
    tail: u32,
    head: u32,
    pass: Pass,
    fs_uuid: [u8; 16],
    dispatcher: &mut dyn TransactionDispatcher,
) -> Result<()> {
    let mut table = TxnTable::new();
    let mut blk = tail;

    while blk != head {
        let header_buf = cache.read(geom.resolve(blk), 1)?;
        if !RecordHeader::magic_ok(header_buf.bytes()) {
            return Err(RepairError::Corruption("expected log record header not found during replay"));
        }
        let header = RecordHeader::decode(header_buf.bytes())?;
        if header.fs_uuid != fs_uuid {
            return Err(RepairError::Corruption("log record UUID does not match mount during replay"));
        }

        let bblks = record::data_bblks(header.len);
        let data_start = geom.wrap_add(blk, 1);
        let mut data = if data_start as u64 + bblks as u64 > geom.length_bb as u64 {
            let first_run = geom.length_bb - data_start;
            let second_run = bblks - first_run;
            cache.read_scattered(&[
                (geom.resolve(data_start), first_run as usize),
                (geom.resolve(0), second_run as usize),
            ])?
        } else {
            cache.read(geom.resolve(data_start), bblks as usize)?
        };

        record::unpack_record(&header, data.bytes_mut())?;
        process_data(&mut table, &header, data.bytes(), pass, dispatcher)?;

        blk = geom.wrap_add(blk, 1 + bblks as i64);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemDevice;
    use crate::log::record::{make_lsn, pack_record};

    struct Recorder {
        commits: Vec<(Pass, u32)>,
    }

    impl TransactionDispatcher for Recorder {
        fn commit(&mut self, pass: Pass, txn: &Transaction) -> Result<()> {
            self.commits.push((pass, txn.tid));
            Ok(())
        }
    }

    fn encode_op(tid: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        let op = OpHeader {
            tid,
            len: payload.len() as u32,
            clientid: record::CLIENT_TRANSACTION,
            flags,
        };
        let mut out = op.encode().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn single_transaction_round_trips_through_replay() {
        let uuid = [5u8; 16];
        let mut data = Vec::new();
        data.extend(encode_op(1, op_flags::START, &[]));
        data.extend(encode_op(1, 0, b"txnhead\0"));
        let mut region = (1u32 << 16 | 1u16 as u32).to_be_bytes().to_vec();
        region.extend_from_slice(b"payload1");
        data.extend(encode_op(1, 0, &region));
        data.extend(encode_op(1, op_flags::COMMIT, &[]));
        let num_logops = 4u32;

        while data.len() % 512 != 0 {
            data.push(0);
        }

        let mut header = pack_record(1, make_lsn(1, 1), make_lsn(1, 0), num_logops, uuid, &mut data);
        header.num_logops = num_logops;
        let header_bytes = header.encode();

        let mut image = vec![0u8; 16 * 512];
        image[0..512].copy_from_slice(&header_bytes);
        image[512..512 + data.len()].copy_from_slice(&data);

        let mem = MemDevice::new(image);
        let mut cache = BufCache::new(mem, false);
        let geom = LogGeom { start_bb: 0, length_bb: 16 };

        let mut recorder = Recorder { commits: Vec::new() };
        replay(&mut cache, &geom, 0, 1 + (data.len() / 512) as u32, Pass::One, uuid, &mut recorder).unwrap();

        assert_eq!(recorder.commits, vec![(Pass::One, 1)]);
    }

    #[test]
    fn commit_for_unknown_tid_is_protocol_error() {
        let uuid = [1u8; 16];
        let mut data = encode_op(9, op_flags::COMMIT, &[]);
        while data.len() % 512 != 0 {
            data.push(0);
        }
        let mut header = pack_record(1, make_lsn(1, 1), make_lsn(1, 0), 1, uuid, &mut data);
        header.num_logops = 1;
        let header_bytes = header.encode();

        let mut image = vec![0u8; 8 * 512];
        image[0..512].copy_from_slice(&header_bytes);
        image[512..512 + data.len()].copy_from_slice(&data);

        let mem = MemDevice::new(image);
        let mut cache = BufCache::new(mem, false);
        let geom = LogGeom { start_bb: 0, length_bb: 8 };
        let mut recorder = Recorder { commits: Vec::new() };
        let result = replay(&mut cache, &geom, 0, 1 + (data.len() / 512) as u32, Pass::One, uuid, &mut recorder);
        assert!(matches!(result, Err(RepairError::Protocol(_))));
    }
}
