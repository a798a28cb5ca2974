//! Local path: replicate, certify, commit, abort and replay.

use std::sync::atomic::Ordering;
use std::thread;

use crate::cert::TestResult;
use crate::core::{TrxHandle, TrxInner, TrxKind, TrxState};
use crate::error::{ReplError, ReplResult};
use crate::gcs::GcsError;
use crate::hooks::Applier;
use crate::monitor::{ApplyOrder, LocalOrder};

use super::{NodeState, Replicator};

pub(crate) fn local_order(inner: &TrxInner) -> LocalOrder {
    LocalOrder::new(inner.local_seqno().expect("trx has no local seqno"))
}

pub(crate) fn apply_order(inner: &TrxInner) -> ApplyOrder {
    let global = inner.global_seqno().expect("trx has no global seqno");
    let last_depends = inner.last_depends.unwrap_or_else(|| global.prev());
    ApplyOrder::new(global, last_depends)
}

impl Replicator {
    /// Broadcasts the transaction's write-set collection in total order.
    ///
    /// On success the transaction is REPLICATED with its seqnos assigned.
    /// Concurrent aborts either fail the call or, if the seqnos were already
    /// assigned, turn into the replay protocol.
    pub fn replicate(&self, trx: &TrxHandle) -> ReplResult<()> {
        if self.node_state() < NodeState::Joined {
            return Err(ReplError::TrxFail);
        }

        let mut inner = trx.lock();
        match inner.state() {
            TrxState::MustAbort => {
                inner.shift(TrxState::Aborting);
                return Err(ReplError::TrxFail);
            }
            TrxState::Executing => {}
            other => panic!("replicate in state {other}"),
        }
        // A handle orders its collection at most once. A non-commit trx
        // parked back in EXECUTING still carries its seqnos and apply slot
        // from the first round; stacking another broadcast on top would
        // leave that slot unreleased forever.
        if inner.global_seqno.is_some() || inner.apply_slot_held {
            tracing::warn!(
                global = ?inner.global_seqno(),
                "replicate on an already ordered transaction"
            );
            return Err(ReplError::TrxFail);
        }
        inner.shift(TrxState::Replicating);

        let (local, global, payload_len) = loop {
            let handle = match self.gcs.schedule() {
                Ok(handle) => handle,
                Err(err) => {
                    tracing::debug!(error = %err, "broadcast schedule failed");
                    inner.shift(TrxState::Aborting);
                    return Err(ReplError::TrxFail);
                }
            };
            inner.broadcast_handle = Some(handle);
            inner.last_seen = self.apply_monitor.last_left();
            let payload = match trx.flush(&mut inner) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "write-set flush failed");
                    inner.shift(TrxState::Aborting);
                    return Err(ReplError::TrxFail);
                }
            };

            drop(inner);
            let sent = self.gcs.repl(handle, &payload);
            inner = trx.lock();

            match sent {
                Ok((local, global)) => break (local, global, payload.len()),
                Err(GcsError::Again) if inner.state() != TrxState::MustAbort => {
                    drop(inner);
                    thread::sleep(self.config.replication.broadcast_retry());
                    inner = trx.lock();
                    if inner.state() == TrxState::MustAbort {
                        inner.shift(TrxState::Aborting);
                        inner.broadcast_handle = None;
                        return Err(ReplError::TrxFail);
                    }
                }
                Err(err) => {
                    if !matches!(err, GcsError::Interrupted) {
                        tracing::debug!(error = %err, "broadcast failed");
                    }
                    inner.shift(TrxState::Aborting);
                    inner.broadcast_handle = None;
                    return Err(ReplError::TrxFail);
                }
            }
        };

        inner.broadcast_handle = None;
        inner.set_seqnos(local, global);

        if inner.state() == TrxState::MustAbort {
            // Aborted after the group assigned seqnos: the slots exist and
            // must be either replayed or cancelled.
            let err = self.cert_for_aborted(&mut inner, TrxState::MustCertAndReplay);
            if !matches!(err, ReplError::BfAbort) {
                self.local_monitor.self_cancel(local_order(&inner));
                self.apply_monitor.self_cancel(apply_order(&inner));
            }
            return Err(err);
        }

        inner.shift(TrxState::Replicated);
        self.counters.replicated.fetch_add(1, Ordering::Relaxed);
        self.counters
            .replicated_bytes
            .fetch_add(payload_len as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Certifies a replicated transaction and takes its apply-monitor slot.
    ///
    /// `Err(BfAbort)` means a higher-priority transaction won: the host must
    /// roll back its side and call [`replay`](Self::replay).
    pub fn pre_commit(&self, trx: &TrxHandle) -> ReplResult<()> {
        if self.node_state() < NodeState::Joined {
            return Err(ReplError::TrxFail);
        }
        debug_assert_eq!(trx.state(), TrxState::Replicated);

        self.cert(trx)?;

        let mut inner = trx.lock();
        let order = apply_order(&inner);
        drop(inner);
        let entered = self.apply_monitor.enter(order);
        inner = trx.lock();

        match entered {
            Ok(()) => match inner.state() {
                TrxState::Certified => {
                    inner.apply_slot_held = true;
                    if inner.commit_intent {
                        inner.shift(TrxState::Applying);
                    } else {
                        inner.shift(TrxState::Executing);
                    }
                    Ok(())
                }
                TrxState::MustAbort => {
                    // The abort lost the race for the slot; certification
                    // holds, so the transaction replays into it.
                    inner.apply_slot_held = true;
                    inner.shift(TrxState::MustReplay);
                    Err(ReplError::BfAbort)
                }
                other => panic!("apply admission in state {other}"),
            },
            Err(_) => {
                debug_assert_eq!(inner.state(), TrxState::MustAbort);
                let err = self.cert_for_aborted(&mut inner, TrxState::MustReplay);
                if !matches!(err, ReplError::BfAbort) {
                    self.apply_monitor.self_cancel(order);
                }
                Err(err)
            }
        }
    }

    /// Re-executes a brute-force-aborted transaction under total isolation
    /// from its predecessors.
    pub fn replay(&self, trx: &TrxHandle, applier: &dyn Applier) -> ReplResult<()> {
        let state = trx.state();
        match state {
            TrxState::MustCertAndReplay => {
                if let Err(err) = self.cert(trx) {
                    // cert() cancelled the monitor slots and moved the trx
                    // to ABORTING.
                    return Err(err);
                }
            }
            TrxState::MustReplay => {}
            other => panic!("replay in state {other}"),
        }

        let mut inner = trx.lock();
        let global = inner.global_seqno().expect("replay before ordering");
        // Serialize the replay after every predecessor.
        inner.last_depends = Some(global.prev());
        inner.shift(TrxState::Replaying);
        let order = ApplyOrder::new(global, global.prev());
        let slot_held = inner.apply_slot_held;
        drop(inner);

        if !slot_held {
            self.apply_monitor
                .enter(order)
                .map_err(|_| ReplError::fatal("replay admission interrupted"))?;
            trx.lock().apply_slot_held = true;
        }

        match self.apply_collection(trx, applier) {
            Ok(()) => {
                let mut inner = trx.lock();
                inner.shift(TrxState::Replayed);
                self.counters.local_replays.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(global = %global, "replay succeeded");
                // The apply slot is released in post_commit.
                Ok(())
            }
            Err(err) => {
                let mut inner = trx.lock();
                inner.apply_slot_held = false;
                inner.shift(TrxState::Aborting);
                drop(inner);
                self.apply_monitor.leave(order);
                tracing::debug!(global = %global, "replay failed");
                Err(err)
            }
        }
    }

    /// Releases the apply slot and records the commit.
    pub fn post_commit(&self, trx: &TrxHandle) -> ReplResult<()> {
        let mut inner = trx.lock();
        assert!(
            matches!(inner.state(), TrxState::Applying | TrxState::Replayed),
            "post_commit in state {}",
            inner.state()
        );
        let order = apply_order(&inner);
        inner.apply_slot_held = false;
        inner.shift(TrxState::Committed);
        self.apply_monitor.leave(order);
        self.cert.set_committed(&inner);
        drop(inner);
        self.report_last_committed();
        self.counters.local_commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Finishes a rolled-back transaction.
    pub fn post_rollback(&self, trx: &TrxHandle) -> ReplResult<()> {
        let mut inner = trx.lock();
        assert!(
            matches!(inner.state(), TrxState::Aborting | TrxState::Executing),
            "post_rollback in state {}",
            inner.state()
        );
        if inner.apply_slot_held {
            let order = apply_order(&inner);
            inner.apply_slot_held = false;
            self.apply_monitor.leave(order);
        }
        inner.shift(TrxState::RolledBack);
        drop(inner);
        self.report_last_committed();
        self.counters.local_rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Flags a local transaction for abort on behalf of a higher-priority
    /// one. Callable from any thread; the interrupt delivered depends on
    /// where the transaction is blocked.
    pub fn abort(&self, trx: &TrxHandle) -> ReplResult<()> {
        assert!(trx.is_local(), "abort of a remote transaction");
        let mut inner = trx.lock();
        tracing::debug!(state = %inner.state(), "aborting trx");
        match inner.state() {
            TrxState::MustAbort
            | TrxState::Aborting
            | TrxState::MustCertAndReplay
            | TrxState::MustReplay
            | TrxState::Replaying
            | TrxState::Replayed
            | TrxState::Applying => {
                // Already condemned, or past the point of no return.
                drop(inner);
            }
            TrxState::Executing | TrxState::Replicated => {
                inner.shift(TrxState::MustAbort);
                drop(inner);
            }
            TrxState::Replicating => {
                inner.shift(TrxState::MustAbort);
                let handle = inner.broadcast_handle;
                drop(inner);
                if let Some(handle) = handle {
                    if let Err(err) = self.gcs.interrupt(handle) {
                        tracing::debug!(error = %err, "broadcast interrupt failed");
                    }
                }
            }
            TrxState::Certifying => {
                inner.shift(TrxState::MustAbort);
                let order = local_order(&inner);
                drop(inner);
                self.local_monitor.interrupt(order);
            }
            TrxState::Certified => {
                inner.shift(TrxState::MustAbort);
                let order = apply_order(&inner);
                drop(inner);
                self.apply_monitor.interrupt(order);
            }
            other => panic!("abort in state {other}"),
        }
        self.counters.local_bf_aborts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Begins total-order isolation for a replicated connection action: all
    /// predecessors commit, then the host applies alone.
    pub fn to_isolation_begin(&self, trx: &TrxHandle) -> ReplResult<()> {
        let mut inner = trx.lock();
        assert!(trx.is_conn(), "isolation on a transaction handle");
        debug_assert_eq!(inner.state(), TrxState::Replicated);
        inner.shift(TrxState::Certifying);
        let lo = local_order(&inner);
        let global = inner.global_seqno().expect("isolation before ordering");
        drop(inner);

        if self.local_monitor.enter(lo).is_err() {
            self.local_monitor.self_cancel(lo);
            self.apply_monitor
                .self_cancel(ApplyOrder::new(global, global.prev()));
            trx.lock().shift(TrxState::Aborting);
            return Err(ReplError::TrxFail);
        }

        let mut inner = trx.lock();
        match self.cert.append(&mut inner) {
            TestResult::Ok => {
                inner.shift(TrxState::Certified);
                drop(inner);
                // Barrier: every predecessor must commit first.
                self.apply_monitor.drain(global.prev());
                trx.lock().shift(TrxState::Applying);
                // The local-monitor slot is held until to_isolation_end.
                Ok(())
            }
            TestResult::Failed => {
                inner.shift(TrxState::Aborting);
                self.cert.set_committed(&inner);
                drop(inner);
                self.local_monitor.leave(lo);
                self.apply_monitor
                    .self_cancel(ApplyOrder::new(global, global.prev()));
                Err(ReplError::TrxFail)
            }
        }
    }

    /// Ends total-order isolation, releasing the held slots.
    pub fn to_isolation_end(&self, trx: &TrxHandle) -> ReplResult<()> {
        let mut inner = trx.lock();
        debug_assert_eq!(inner.state(), TrxState::Applying);
        let lo = local_order(&inner);
        let global = inner.global_seqno().expect("isolation before ordering");
        inner.shift(TrxState::Committed);
        self.cert.set_committed(&inner);
        drop(inner);
        self.local_monitor.leave(lo);
        self.apply_monitor
            .self_cancel(ApplyOrder::new(global, global.prev()));
        if let TrxKind::Conn(conn_id) = trx.kind() {
            self.wsdb.discard_conn_trx(conn_id);
        }
        self.report_last_committed();
        Ok(())
    }

    /// Enters the local monitor and appends the transaction to the
    /// certification index.
    pub(crate) fn cert(&self, trx: &TrxHandle) -> ReplResult<()> {
        let mut inner = trx.lock();
        debug_assert!(matches!(
            inner.state(),
            TrxState::Replicated | TrxState::MustCertAndReplay
        ));
        inner.shift(TrxState::Certifying);
        let lo = local_order(&inner);
        drop(inner);

        let entered = self.local_monitor.enter(lo);
        let mut inner = trx.lock();

        match entered {
            Err(_) => {
                debug_assert_eq!(inner.state(), TrxState::MustAbort);
                let err = self.cert_for_aborted(&mut inner, TrxState::MustCertAndReplay);
                if !matches!(err, ReplError::BfAbort) {
                    self.local_monitor.self_cancel(lo);
                    self.apply_monitor.self_cancel(apply_order(&inner));
                }
                Err(err)
            }
            Ok(()) if inner.state() == TrxState::MustAbort => {
                // The abort arrived after admission; certify anyway so the
                // outcome is decided by the index, then leave the slot.
                let result = match self.cert.append(&mut inner) {
                    TestResult::Ok => {
                        inner.shift(TrxState::MustReplay);
                        Err(ReplError::BfAbort)
                    }
                    TestResult::Failed => {
                        inner.shift(TrxState::Aborting);
                        self.counters
                            .local_cert_failures
                            .fetch_add(1, Ordering::Relaxed);
                        self.cert.set_committed(&inner);
                        self.apply_monitor.self_cancel(apply_order(&inner));
                        Err(ReplError::TrxFail)
                    }
                };
                self.local_monitor.leave(lo);
                result
            }
            Ok(()) => {
                let result = match self.cert.append(&mut inner) {
                    TestResult::Ok => {
                        inner.shift(TrxState::Certified);
                        Ok(())
                    }
                    TestResult::Failed => {
                        self.apply_monitor.self_cancel(apply_order(&inner));
                        inner.shift(TrxState::Aborting);
                        self.counters
                            .local_cert_failures
                            .fetch_add(1, Ordering::Relaxed);
                        self.cert.set_committed(&inner);
                        Err(ReplError::TrxFail)
                    }
                };
                self.local_monitor.leave(lo);
                tracing::debug!(
                    global = ?inner.global_seqno(),
                    ok = result.is_ok(),
                    "certification"
                );
                result
            }
        }
    }

    /// Re-tests certification for a transaction whose abort won: decides
    /// between replay and rollback.
    pub(crate) fn cert_for_aborted(
        &self,
        inner: &mut TrxInner,
        replay_state: TrxState,
    ) -> ReplError {
        match self.cert.test(inner) {
            TestResult::Ok => {
                inner.shift(replay_state);
                ReplError::BfAbort
            }
            TestResult::Failed => {
                inner.shift(TrxState::Aborting);
                ReplError::TrxFail
            }
        }
    }

}
