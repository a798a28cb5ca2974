//! Receive loop: dispatching totally-ordered actions to the apply path.

use std::sync::atomic::Ordering;

use bytes::Bytes;

use crate::cert::TestResult;
use crate::core::{codec, GlobalSeqno, LocalSeqno, TrxHandle, TrxState, WriteSetData};
use crate::error::{ReplError, ReplResult};
use crate::gcs::{Action, ConfView, MemberState};
use crate::hooks::{Applier, ApplyData, ApplyError};
use crate::monitor::{ApplyOrder, LocalOrder};

use super::local::{apply_order, local_order};
use super::{NodeState, Replicator};

impl Replicator {
    /// Drains the group connection until the node closes or fails. The host
    /// dedicates one or more threads to this call; `applier` carries the
    /// thread's database session.
    pub fn async_recv(&self, applier: &dyn Applier) -> ReplResult<()> {
        let state = self.node_state();
        if matches!(state, NodeState::Closed | NodeState::Closing) {
            tracing::error!(%state, "receive loop cannot start on closed node");
            return Err(ReplError::fatal("receive loop started on closed node"));
        }
        self.receivers.fetch_add(1, Ordering::SeqCst);

        let mut result = Ok(());
        while self.node_state() != NodeState::Closing {
            let action = match self.gcs.recv() {
                Ok(action) => action,
                Err(err) => {
                    tracing::warn!(error = %err, "group receive failed");
                    result = Err(ReplError::ConnFail);
                    break;
                }
            };
            match self.dispatch(action, applier) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "fatal error in receive loop");
                    result = Err(err);
                    break;
                }
                // Transaction-local outcomes were fully handled inline.
                Err(_) => {}
            }
        }

        if self.receivers.fetch_sub(1, Ordering::SeqCst) == 1
            && self.node_state() == NodeState::Closing
        {
            self.shift_to(NodeState::Closed)?;
        }
        result
    }

    fn dispatch(&self, action: Action, applier: &dyn Applier) -> ReplResult<()> {
        match action {
            Action::Ordered {
                local,
                global,
                payload,
            } => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .received_bytes
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                self.process_global_action(applier, local, global, payload)
            }
            Action::CommitCut { local, payload } => {
                let lo = LocalOrder::new(local);
                self.local_monitor
                    .enter(lo)
                    .map_err(|_| ReplError::fatal("receive slot interrupted"))?;
                let cut = codec::decode_commit_cut(&payload);
                if let Ok(cut) = &cut {
                    self.cert.purge_upto(*cut);
                }
                self.local_monitor.leave(lo);
                cut.map(|_| ()).map_err(ReplError::from)
            }
            other => self.process_to_action(other, applier),
        }
    }

    fn process_global_action(
        &self,
        applier: &dyn Applier,
        local: LocalSeqno,
        global: GlobalSeqno,
        payload: Bytes,
    ) -> ReplResult<()> {
        if global.position() <= self.cert.position() {
            tracing::debug!(%global, "skipping action below certification position");
            self.local_monitor.self_cancel(LocalOrder::new(local));
            return Ok(());
        }

        let trx = match self.cert.create_trx(&payload, local, global) {
            Ok(trx) => trx,
            Err(err) => {
                tracing::warn!(%global, error = %err, "could not read trx");
                return Err(err.into());
            }
        };

        if trx.is_conn() {
            self.process_conn_ws(applier, &trx)
        } else {
            self.process_trx_ws(applier, &trx)
        }
    }

    /// Remote ordinary transaction: certify in local order, apply under the
    /// dependency-gated apply monitor.
    fn process_trx_ws(&self, applier: &dyn Applier, trx: &TrxHandle) -> ReplResult<()> {
        let mut inner = trx.lock();
        let global = inner.global_seqno().expect("remote trx without seqno");
        let lo = local_order(&inner);
        inner.shift(TrxState::Certifying);
        drop(inner);

        self.local_monitor
            .enter(lo)
            .map_err(|_| ReplError::fatal("receive slot interrupted"))?;
        let mut inner = trx.lock();
        let cert_ret = self.cert.append(&mut inner);
        self.local_monitor.leave(lo);

        let mut result = Ok(());
        if global.position() > self.apply_monitor.last_left() {
            match cert_ret {
                TestResult::Ok => {
                    inner.shift(TrxState::Certified);
                    let order = apply_order(&inner);
                    inner.shift(TrxState::Applying);
                    drop(inner);
                    self.apply_monitor
                        .enter(order)
                        .map_err(|_| ReplError::fatal("apply slot interrupted"))?;
                    result = self.apply_collection(trx, applier);
                    self.apply_monitor.leave(order);
                    inner = trx.lock();
                    match &result {
                        Ok(()) => inner.shift(TrxState::Committed),
                        Err(err) => {
                            tracing::warn!(%global, error = %err, "failed to apply trx")
                        }
                    }
                }
                TestResult::Failed => {
                    inner.shift(TrxState::Aborting);
                    self.apply_monitor
                        .self_cancel(ApplyOrder::new(global, global.prev()));
                    result = Err(ReplError::TrxFail);
                }
            }
        } else {
            // Already contained in the state transfer; certified above only
            // to keep the index complete.
            tracing::debug!(%global, "skipping apply of trx");
        }
        drop(inner);

        self.cert.set_committed(&trx.lock());
        self.report_last_committed();
        result
    }

    /// Remote isolated action: drain every predecessor, apply alone while
    /// holding the local monitor.
    fn process_conn_ws(&self, applier: &dyn Applier, trx: &TrxHandle) -> ReplResult<()> {
        let mut inner = trx.lock();
        let global = inner.global_seqno().expect("remote trx without seqno");
        let lo = local_order(&inner);
        inner.shift(TrxState::Certifying);
        drop(inner);

        self.local_monitor
            .enter(lo)
            .map_err(|_| ReplError::fatal("receive slot interrupted"))?;
        let mut inner = trx.lock();
        let cert_ret = self.cert.append(&mut inner);

        let mut result = Ok(());
        if global.position() > self.apply_monitor.last_left() {
            match cert_ret {
                TestResult::Ok => {
                    inner.shift(TrxState::Certified);
                    drop(inner);
                    self.apply_monitor.drain(global.prev());
                    trx.lock().shift(TrxState::Applying);
                    result = self
                        .apply_write_sets(trx, applier)
                        .map_err(|err| {
                            tracing::warn!(%global, error = %err, "isolated apply failed");
                            ReplError::TrxFail
                        });
                    let mut inner2 = trx.lock();
                    if result.is_ok() {
                        inner2.shift(TrxState::Committed);
                    } else {
                        inner2.shift(TrxState::Aborting);
                    }
                    drop(inner2);
                }
                TestResult::Failed => {
                    inner.shift(TrxState::Aborting);
                    drop(inner);
                    result = Err(ReplError::TrxFail);
                }
            }
            self.apply_monitor
                .self_cancel(ApplyOrder::new(global, global.prev()));
        } else {
            tracing::debug!(%global, "skipping apply of isolated trx");
            drop(inner);
        }

        self.cert.set_committed(&trx.lock());
        self.local_monitor.leave(lo);
        result
    }

    /// Membership and state-transfer actions: run with the local monitor
    /// held and the apply monitor drained to the certification position.
    fn process_to_action(&self, action: Action, _applier: &dyn Applier) -> ReplResult<()> {
        let lo = LocalOrder::new(action.local_seqno());
        self.local_monitor
            .enter(lo)
            .map_err(|_| ReplError::fatal("receive slot interrupted"))?;
        self.apply_monitor.drain(self.cert.position());

        let result = match action {
            Action::Conf { view, .. } => self.process_conf(view),
            Action::StateRequest { request, .. } => self.process_state_request(&request),
            Action::Join { .. } => self.shift_to(NodeState::Joined),
            Action::Sync { .. } => {
                let shifted = self.shift_to(NodeState::Synced);
                if shifted.is_ok() {
                    self.hooks.synced();
                }
                shifted
            }
            Action::Ordered { .. } | Action::CommitCut { .. } => {
                unreachable!("ordered actions are dispatched directly")
            }
        };

        self.local_monitor.leave(lo);
        result
    }

    fn process_state_request(&self, request: &Bytes) -> ReplResult<()> {
        self.shift_to(NodeState::Donor)?;
        let state_uuid = *self.state_uuid.lock().expect("state uuid lock poisoned");
        if let Err(err) =
            self.hooks
                .sst_donate(request, state_uuid, self.cert.position(), false)
        {
            tracing::error!(error = %err, "state transfer donation failed");
        }
        Ok(())
    }

    fn process_conf(&self, view: ConfView) -> ReplResult<()> {
        let st_req = self.st_required(&view);
        if let Some(idx) = view.my_idx {
            self.set_node_id(view.members[idx].id);
        }
        let info = crate::gcs::ViewInfo {
            view: view.clone(),
            state_gap: st_req,
        };
        let app_request = self.hooks.view(&info);

        if view.is_primary() {
            // The state transfer payload carries no certification index;
            // rebuild from the view position.
            self.cert.assign_initial_position(view.seqno);

            if st_req {
                let group_uuid = view
                    .group_uuid
                    .ok_or_else(|| ReplError::fatal("primary view without group uuid"))?;
                return self.request_sst(group_uuid, view.seqno, app_request);
            }

            if view.conf_id == 1 {
                // Bootstrap: adopt the group identity and position.
                *self.state_uuid.lock().expect("state uuid lock poisoned") = view.group_uuid;
                self.apply_monitor.set_initial_position(view.seqno);
            }

            let node_state = self.node_state();
            if node_state == NodeState::Joining || node_state == NodeState::Donor {
                match view.my_state {
                    MemberState::Joined => self.shift_to(NodeState::Joined)?,
                    MemberState::Synced => {
                        self.shift_to(NodeState::Synced)?;
                        self.hooks.synced();
                    }
                    other => tracing::debug!(state = ?other, "group member state"),
                }
            }
            self.invalidate_state_file()?;
        } else {
            let state_uuid = *self.state_uuid.lock().expect("state uuid lock poisoned");
            if state_uuid.is_some() {
                self.store_state_file()?;
            }
            if view.my_idx.is_some() {
                if self.node_state() != NodeState::Joining {
                    self.shift_to(NodeState::Joining)?;
                }
            } else {
                self.shift_to(NodeState::Closing)?;
            }
        }
        Ok(())
    }

    /// Applies a full collection with the bounded retry loop, telling the
    /// host to roll back between attempts and to commit at the end.
    pub(crate) fn apply_collection(
        &self,
        trx: &TrxHandle,
        applier: &dyn Applier,
    ) -> ReplResult<()> {
        let global = trx.global_seqno().expect("apply before ordering");
        let max_attempts = self.config.replication.max_apply_attempts;
        let mut attempts = 0u32;

        loop {
            match self.apply_write_sets(trx, applier) {
                Ok(()) => break,
                Err(err) => {
                    attempts += 1;
                    tracing::debug!(%global, attempt = attempts, error = %err, "apply attempt failed");
                    apply_statement(applier, b"rollback\0", global).map_err(|err| {
                        ReplError::fatal(format!("rollback after failed apply failed: {err}"))
                    })?;
                    if attempts >= max_attempts {
                        return Err(ReplError::fatal(format!(
                            "apply of trx {global} failed after {attempts} attempts"
                        )));
                    }
                }
            }
        }

        apply_statement(applier, b"commit\0", global)
            .map_err(|err| ReplError::fatal(format!("commit after apply failed: {err}")))
    }

    /// Applies the collection's entries once, in order.
    pub(crate) fn apply_write_sets(
        &self,
        trx: &TrxHandle,
        applier: &dyn Applier,
    ) -> Result<(), ApplyError> {
        let (write_sets, conn_ctx, global) = {
            let inner = trx.lock();
            (
                inner.write_sets.clone(),
                inner.conn_ctx.clone(),
                inner.global_seqno().expect("apply before ordering"),
            )
        };

        // Re-establish the originating session's context first.
        if let Some(ctx) = &conn_ctx {
            apply_statement(applier, ctx, global)?;
        }

        for ws in &write_sets {
            match &ws.data {
                WriteSetData::Data(buffer) => {
                    applier.apply(ApplyData::RowData(buffer), global)?;
                }
                WriteSetData::Statements(statements) => {
                    for stmt in statements {
                        let data = ApplyData::Statement {
                            query: &stmt.query,
                            timeval: stmt.timeval,
                            rand_seed: stmt.rand_seed,
                        };
                        match applier.apply(data, global) {
                            Ok(()) => {}
                            Err(ApplyError::NotImplemented) => {
                                tracing::warn!(%global, "applier returned not implemented");
                            }
                            Err(err) => {
                                tracing::error!(%global, error = %err, "statement apply failed");
                                return Err(err);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn apply_statement(
    applier: &dyn Applier,
    query: &[u8],
    global: GlobalSeqno,
) -> Result<(), ApplyError> {
    applier.apply(
        ApplyData::Statement {
            query,
            timeval: 0,
            rand_seed: 0,
        },
        global,
    )
}
