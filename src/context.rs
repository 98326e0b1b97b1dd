use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::oracle::InodeOracle;

/// A soft, user-visible repair finding (spec §7 "user-visible messages").
/// Every corrected-or-would-correct event names the inode and, where
/// applicable, the file block involved.
#[derive(Debug, Clone)]
pub enum RepairDiagnostic {
    /// A soft inconsistency was found and (mode permitting) patched.
    Corrected { ino: u64, fileoff: u64, detail: String },
    /// Same finding, but `no_modify` suppressed the write.
    WouldCorrect { ino: u64, fileoff: u64, detail: String },
    /// A directory could not be repaired in place and must be rebuilt by
    /// a later phase.
    MustDiscard { ino: u64 },
}

/// Explicit replacement for the source's global mutables (spec §9
/// REDESIGN FLAGS): `no_modify`, `ino_discovery`, and `need_root_dotdot`
/// travel together on one context passed by reference through the repair
/// call tree, instead of as process-wide statics.
pub struct RepairContext<O: InodeOracle> {
    pub no_modify: bool,
    pub ino_discovery: bool,
    need_root_dotdot: AtomicBool,
    bad_directories: Mutex<BTreeSet<u64>>,
    oracle: Mutex<O>,
    sink: Mutex<Box<dyn FnMut(RepairDiagnostic) + Send>>,
}

impl<O: InodeOracle> RepairContext<O> {
    pub fn new(
        no_modify: bool,
        ino_discovery: bool,
        oracle: O,
        sink: impl FnMut(RepairDiagnostic) + Send + 'static,
    ) -> Self {
        Self {
            no_modify,
            ino_discovery,
            need_root_dotdot: AtomicBool::new(false),
            bad_directories: Mutex::new(BTreeSet::new()),
            oracle: Mutex::new(oracle),
            sink: Mutex::new(Box::new(sink)),
        }
    }

    pub fn mark_need_root_dotdot(&self) {
        self.need_root_dotdot.store(true, Ordering::Relaxed);
    }

    pub fn needs_root_dotdot(&self) -> bool {
        self.need_root_dotdot.load(Ordering::Relaxed)
    }

    /// Add `ino` to the known-bad-directories set (spec §9: append-only,
    /// readers tolerate concurrent append).
    pub fn mark_bad_directory(&self, ino: u64) {
        self.bad_directories
            .lock()
            .expect("bad-directories mutex poisoned")
            .insert(ino);
    }

    pub fn is_bad_directory(&self, ino: u64) -> bool {
        self.bad_directories
            .lock()
            .expect("bad-directories mutex poisoned")
            .contains(&ino)
    }

    pub fn bad_directories(&self) -> Vec<u64> {
        self.bad_directories
            .lock()
            .expect("bad-directories mutex poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub fn oracle(&self) -> std::sync::MutexGuard<'_, O> {
        self.oracle.lock().expect("oracle mutex poisoned")
    }

    /// Emit a diagnostic. Callers pick [`RepairDiagnostic::Corrected`] vs
    /// [`RepairDiagnostic::WouldCorrect`] based on `self.no_modify`
    /// themselves, since only they know whether the write actually ran.
    pub fn diagnose(&self, diagnostic: RepairDiagnostic) {
        (self.sink.lock().expect("diagnostic sink mutex poisoned"))(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::test_support::FakeOracle;

    #[test]
    fn need_root_dotdot_latches_once_set() {
        let ctx = RepairContext::new(false, false, FakeOracle::default(), |_| {});
        assert!(!ctx.needs_root_dotdot());
        ctx.mark_need_root_dotdot();
        assert!(ctx.needs_root_dotdot());
    }

    #[test]
    fn bad_directories_accumulate() {
        let ctx = RepairContext::new(false, false, FakeOracle::default(), |_| {});
        ctx.mark_bad_directory(42);
        ctx.mark_bad_directory(7);
        assert!(ctx.is_bad_directory(42));
        assert_eq!(ctx.bad_directories(), vec![7, 42]);
    }

    #[test]
    fn diagnose_reaches_sink() {
        use std::sync::{Arc, Mutex as StdMutex};
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let ctx = RepairContext::new(false, false, FakeOracle::default(), move |d: RepairDiagnostic| {
            seen2.lock().unwrap().push(format!("{d:?}"));
        });
        ctx.diagnose(RepairDiagnostic::MustDiscard { ino: 5 });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
