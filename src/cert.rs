//! Certification: the versioned index of modified keys.
//!
//! Maps every key touched by a committed write-set to the global seqno of
//! its last writer. A transaction certifies iff none of its keys were
//! written after the position it last saw; the maximum prior writer becomes
//! its apply dependency, which is what unlocks parallel apply.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::core::{
    CodecError, GlobalSeqno, LocalSeqno, Position, TrxHandle, TrxInner, WriteKey,
};

/// Outcome of evaluating the certification predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Ok,
    Failed,
}

#[derive(Debug)]
struct CertEntry {
    keys: Vec<WriteKey>,
    last_depends: Position,
    committed: bool,
}

#[derive(Debug, Default)]
struct CertInner {
    index: HashMap<WriteKey, GlobalSeqno>,
    entries: BTreeMap<GlobalSeqno, CertEntry>,
    /// Highest seqno evaluated, pass or fail.
    position: Position,
    /// Entries at or below this position have been garbage-collected.
    purge_floor: Position,
    deps_sum: u64,
    deps_count: u64,
}

/// The certification index. `append` is the single serialization point for
/// dependency computation and is only called inside the local monitor; the
/// interior mutex guards the read-only paths.
pub struct Certification {
    inner: Mutex<CertInner>,
}

impl Certification {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CertInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CertInner> {
        self.inner.lock().expect("certification lock poisoned")
    }

    /// Evaluates the certification predicate for `trx` and, on success,
    /// records its keys and sets `last_depends` to the maximum prior writer.
    /// The certification position advances on both outcomes.
    pub fn append(&self, trx: &mut TrxInner) -> TestResult {
        let global = trx
            .global_seqno()
            .expect("append before seqno assignment");
        let last_seen = trx.last_seen;
        let mut inner = self.lock();
        if global.position() > inner.position {
            inner.position = global.position();
        }

        let mut depends = Position::GENESIS;
        for key in trx.modified_keys() {
            if let Some(&writer) = inner.index.get(key) {
                if writer.get() > last_seen.get() {
                    return TestResult::Failed;
                }
                depends = depends.max(writer.position());
            }
        }

        let keys: Vec<WriteKey> = trx.modified_keys().cloned().collect();
        for key in &keys {
            inner.index.insert(key.clone(), global);
        }
        inner.entries.insert(
            global,
            CertEntry {
                keys,
                last_depends: depends,
                committed: false,
            },
        );
        trx.last_depends = Some(depends);
        TestResult::Ok
    }

    /// Evaluates the predicate for a transaction's own window without
    /// mutating the index: the re-test for an aborted local transaction.
    pub fn test(&self, trx: &TrxInner) -> TestResult {
        let global = trx.global_seqno().expect("test before seqno assignment");
        self.test_window(trx, trx.last_seen, global.prev())
    }

    /// Evaluates the predicate against an explicit window: conflict iff any
    /// modified key has a recorded writer in `(lo, hi]`.
    pub fn test_window(&self, trx: &TrxInner, lo: Position, hi: Position) -> TestResult {
        let inner = self.lock();
        for key in trx.modified_keys() {
            if let Some(&writer) = inner.index.get(key) {
                if writer.get() > lo.get() && writer.get() <= hi.get() {
                    return TestResult::Failed;
                }
            }
        }
        TestResult::Ok
    }

    /// Records that a certified transaction finished applying; feeds the
    /// rolling dependency-distance statistic.
    pub fn set_committed(&self, trx: &TrxInner) {
        let Some(global) = trx.global_seqno() else {
            return;
        };
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&global) {
            if !entry.committed {
                entry.committed = true;
                let distance = global.get() - entry.last_depends.get();
                inner.deps_sum += distance;
                inner.deps_count += 1;
            }
        }
    }

    /// Removes every index entry whose recorded writer is at or below `cut`.
    /// Keys rewritten by a later transaction are left in place.
    pub fn purge_upto(&self, cut: Position) {
        let mut inner = self.lock();
        if cut <= inner.purge_floor {
            return;
        }
        let Some(cut_seqno) = GlobalSeqno::from_u64(cut.get()) else {
            return;
        };
        let purged: Vec<GlobalSeqno> = inner.entries.range(..=cut_seqno).map(|(&g, _)| g).collect();
        for global in purged {
            let entry = match inner.entries.remove(&global) {
                Some(entry) => entry,
                None => continue,
            };
            for key in entry.keys {
                if inner
                    .index
                    .get(&key)
                    .is_some_and(|writer| writer.position() <= cut)
                {
                    inner.index.remove(&key);
                }
            }
        }
        inner.purge_floor = cut;
    }

    /// The highest seqno processed through certification.
    pub fn position(&self) -> Position {
        self.lock().position
    }

    /// Resets the index at startup or after a state transfer.
    pub fn assign_initial_position(&self, position: Position) {
        self.purge_upto(position);
        let mut inner = self.lock();
        inner.position = position;
        inner.purge_floor = position;
    }

    /// Materializes a remote transaction handle from a received collection.
    pub fn create_trx(
        &self,
        bytes: &[u8],
        local: LocalSeqno,
        global: GlobalSeqno,
    ) -> Result<TrxHandle, CodecError> {
        TrxHandle::from_wire(bytes, local, global)
    }

    /// Average distance between a certified seqno and its last dependency.
    pub fn avg_deps_distance(&self) -> f64 {
        let inner = self.lock();
        if inner.deps_count == 0 {
            0.0
        } else {
            inner.deps_sum as f64 / inner.deps_count as f64
        }
    }
}

impl Default for Certification {
    fn default() -> Self {
        Self::new()
    }
}
