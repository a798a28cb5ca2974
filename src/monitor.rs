//! Ordering monitors: admission of totally-ordered work by monotone seqno.
//!
//! Two monitors cooperate: the local monitor serializes certification in
//! local-seqno order, the apply monitor admits appliers in global-seqno
//! order but lets non-conflicting transactions run concurrently.

use std::collections::{BTreeSet, HashSet};
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard};

use thiserror::Error;

use crate::core::{GlobalSeqno, LocalSeqno, Position};

/// An order type yields the seqno a participant occupies and the admission
/// predicate evaluated against the monitor's last-left position.
pub trait Order: Copy {
    fn seqno(&self) -> u64;
    fn may_enter(&self, last_left: u64) -> bool;
}

/// Admission into certification: strictly serial, ascending, gap-free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalOrder(LocalSeqno);

impl LocalOrder {
    pub fn new(seqno: LocalSeqno) -> Self {
        Self(seqno)
    }
}

impl Order for LocalOrder {
    fn seqno(&self) -> u64 {
        self.0.get()
    }

    fn may_enter(&self, last_left: u64) -> bool {
        last_left + 1 == self.0.get()
    }
}

/// Admission into apply: ordered by global seqno, but entry is permitted as
/// soon as every transaction up to `last_depends` has left, so transactions
/// with disjoint conflict sets apply in parallel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplyOrder {
    global: GlobalSeqno,
    last_depends: Position,
}

impl ApplyOrder {
    pub fn new(global: GlobalSeqno, last_depends: Position) -> Self {
        Self {
            global,
            last_depends,
        }
    }
}

impl Order for ApplyOrder {
    fn seqno(&self) -> u64 {
        self.global.get()
    }

    fn may_enter(&self, last_left: u64) -> bool {
        last_left >= self.last_depends.get()
    }
}

/// A blocked `enter` was cancelled by [`Monitor::interrupt`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("interrupted while waiting to enter monitor")]
pub struct Interrupted;

/// Apply-parallelism statistics for the status snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MonitorStats {
    /// Fraction of entries admitted out of seqno order.
    pub oooe: f64,
    /// Fraction of leaves completed out of seqno order.
    pub oool: f64,
    /// Mean distance between an entering seqno and the last-left position.
    pub window: f64,
}

#[derive(Debug, Default)]
struct MonitorInner {
    last_left: u64,
    /// Seqnos currently inside the monitor.
    entered: HashSet<u64>,
    /// Seqnos above `last_left` that have left or were cancelled.
    finished: BTreeSet<u64>,
    /// Pending interrupts for seqnos that have not entered.
    interrupts: HashSet<u64>,
    enter_count: u64,
    leave_count: u64,
    oooe_count: u64,
    oool_count: u64,
    window_sum: u64,
}

impl MonitorInner {
    fn advance(&mut self) {
        while self.finished.remove(&(self.last_left + 1)) {
            self.last_left += 1;
        }
    }
}

/// Serializes entry of totally-ordered participants.
///
/// Every seqno above the initial position must be accounted for exactly once
/// via `leave` or `self_cancel`, otherwise all later participants stall.
pub struct Monitor<O: Order> {
    inner: Mutex<MonitorInner>,
    cond: Condvar,
    _order: PhantomData<fn(O)>,
}

impl<O: Order> Monitor<O> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MonitorInner::default()),
            cond: Condvar::new(),
            _order: PhantomData,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().expect("monitor lock poisoned")
    }

    /// Blocks until the order's admission predicate holds, then enters.
    ///
    /// Returns `Err(Interrupted)` if [`interrupt`](Self::interrupt) was (or
    /// is) called for this seqno before admission.
    pub fn enter(&self, order: O) -> Result<(), Interrupted> {
        let seqno = order.seqno();
        let mut inner = self.lock();
        debug_assert!(seqno > inner.last_left, "stale enter for seqno {seqno}");
        loop {
            if inner.interrupts.remove(&seqno) {
                return Err(Interrupted);
            }
            if order.may_enter(inner.last_left) {
                break;
            }
            inner = self.cond.wait(inner).expect("monitor lock poisoned");
        }
        inner.enter_count += 1;
        if seqno != inner.last_left + 1 {
            inner.oooe_count += 1;
        }
        inner.window_sum += seqno - inner.last_left;
        inner.entered.insert(seqno);
        Ok(())
    }

    /// Releases a previously entered slot and advances the last-left
    /// position over every contiguously finished seqno.
    pub fn leave(&self, order: O) {
        let seqno = order.seqno();
        let mut inner = self.lock();
        let was_inside = inner.entered.remove(&seqno);
        assert!(was_inside, "leave without enter for seqno {seqno}");
        inner.leave_count += 1;
        if seqno != inner.last_left + 1 {
            inner.oool_count += 1;
        }
        inner.finished.insert(seqno);
        inner.interrupts.remove(&seqno);
        inner.advance();
        self.cond.notify_all();
    }

    /// Accounts for a seqno that will never run: equivalent to enter + leave
    /// for ordering purposes. Cancelling an entered slot is a programmer
    /// error. Seqnos already accounted for are ignored.
    pub fn self_cancel(&self, order: O) {
        let seqno = order.seqno();
        let mut inner = self.lock();
        assert!(
            !inner.entered.contains(&seqno),
            "self-cancel of entered seqno {seqno}"
        );
        if seqno <= inner.last_left || inner.finished.contains(&seqno) {
            return;
        }
        inner.interrupts.remove(&seqno);
        inner.finished.insert(seqno);
        inner.advance();
        self.cond.notify_all();
    }

    /// Forces a concurrently blocked `enter` for this seqno to return
    /// `Err(Interrupted)`. Idempotent; ignored once the seqno has entered or
    /// left.
    pub fn interrupt(&self, order: O) {
        let seqno = order.seqno();
        let mut inner = self.lock();
        if seqno <= inner.last_left
            || inner.finished.contains(&seqno)
            || inner.entered.contains(&seqno)
        {
            return;
        }
        inner.interrupts.insert(seqno);
        self.cond.notify_all();
    }

    /// Blocks until every seqno up to `upto` has left.
    pub fn drain(&self, upto: Position) {
        let mut inner = self.lock();
        while inner.last_left < upto.get() {
            inner = self.cond.wait(inner).expect("monitor lock poisoned");
        }
    }

    /// Resets the monitor position. Admissible only at initialization or
    /// after a state transfer, while nothing is inside the monitor.
    pub fn set_initial_position(&self, position: Position) {
        let mut inner = self.lock();
        assert!(
            inner.entered.is_empty(),
            "monitor repositioned while occupied"
        );
        inner.last_left = position.get();
        inner.finished.clear();
        inner.interrupts.clear();
        self.cond.notify_all();
    }

    pub fn last_left(&self) -> Position {
        Position::new(self.lock().last_left)
    }

    pub fn stats(&self) -> MonitorStats {
        let inner = self.lock();
        let enters = inner.enter_count.max(1) as f64;
        let leaves = inner.leave_count.max(1) as f64;
        MonitorStats {
            oooe: inner.oooe_count as f64 / enters,
            oool: inner.oool_count as f64 / leaves,
            window: inner.window_sum as f64 / enters,
        }
    }
}

impl<O: Order> Default for Monitor<O> {
    fn default() -> Self {
        Self::new()
    }
}
