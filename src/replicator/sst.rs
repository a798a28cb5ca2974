//! State-transfer orchestration and the on-disk saved state.

use std::fs;
use std::io::Write;
use std::sync::{Condvar, Mutex};
use std::thread;

use bytes::Bytes;
use uuid::Uuid;

use crate::core::Position;
use crate::error::{ReplError, ReplResult};
use crate::gcs::GcsError;
use crate::monitor::LocalOrder;

use super::{NodeState, Replicator};

/// Where the node stands in a state transfer, for the status snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SstState {
    None,
    Wait,
    ReqFailed,
    Failed,
}

struct SstSync {
    state: SstState,
    donor: String,
    received: Option<(Uuid, Position)>,
}

/// Joins the request path (receive loop) with the delivery path (host
/// thread calling `sst_received`).
pub(crate) struct SstCoordinator {
    sync: Mutex<SstSync>,
    cond: Condvar,
}

impl SstCoordinator {
    pub fn new() -> Self {
        Self {
            sync: Mutex::new(SstSync {
                state: SstState::None,
                donor: String::new(),
                received: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SstSync> {
        self.sync.lock().expect("sst lock poisoned")
    }

    pub fn set_donor(&self, donor: &str) {
        self.lock().donor = donor.to_string();
    }

    pub fn donor(&self) -> String {
        self.lock().donor.clone()
    }

    pub fn state(&self) -> SstState {
        self.lock().state
    }

    fn set_state(&self, state: SstState) {
        self.lock().state = state;
    }

    fn deliver(&self, uuid: Uuid, seqno: Position) {
        let mut sync = self.lock();
        sync.received = Some((uuid, seqno));
        self.cond.notify_all();
    }

    fn wait_received(&self) -> (Uuid, Position) {
        let mut sync = self.lock();
        sync.state = SstState::Wait;
        loop {
            if let Some(received) = sync.received.take() {
                return received;
            }
            sync = self.cond.wait(sync).expect("sst lock poisoned");
        }
    }
}

impl Replicator {
    /// Whether joining this primary view requires a state transfer.
    pub(crate) fn st_required(&self, view: &crate::gcs::ConfView) -> bool {
        if view.my_state != crate::gcs::MemberState::Prim {
            return false;
        }
        let state_uuid = *self.state_uuid.lock().expect("state uuid lock poisoned");
        match (state_uuid, view.group_uuid) {
            (Some(mine), Some(group)) if mine == group => {
                if self.node_state() >= NodeState::Joined {
                    // An earlier asynchronous transfer may already exceed
                    // the view position.
                    self.apply_monitor.last_left() < view.seqno
                } else {
                    self.apply_monitor.last_left() != view.seqno
                }
            }
            _ => true,
        }
    }

    /// Requests a state transfer and blocks the receive loop until the host
    /// reports the received state. Runs with the configuration action's
    /// local-monitor slot held.
    pub(crate) fn request_sst(
        &self,
        group_uuid: Uuid,
        group_seqno: Position,
        request: Option<Bytes>,
    ) -> ReplResult<()> {
        tracing::info!(
            group = %group_uuid,
            seqno = %group_seqno,
            local = %self.apply_monitor.last_left(),
            "state transfer required"
        );
        let request = request.unwrap_or_default();
        let donor = self.sst.donor();

        loop {
            self.invalidate_state_file()?;
            match self.gcs.request_state_transfer(&request, &donor) {
                Ok(request_local) => {
                    // The request's own ordered slot is held by this thread;
                    // nothing will enter it.
                    self.local_monitor.self_cancel(LocalOrder::new(request_local));
                    break;
                }
                Err(GcsError::Again) => {
                    tracing::info!(
                        retry_secs = self.config.replication.sst_retry_secs,
                        "state transfer request deferred, retrying"
                    );
                    thread::sleep(self.config.replication.sst_retry());
                }
                Err(err) => {
                    let _ = self.store_state_file();
                    self.sst.set_state(SstState::ReqFailed);
                    tracing::error!(error = %err, "state transfer request failed");
                    return Err(ReplError::fatal(format!(
                        "state transfer request failed: {err}"
                    )));
                }
            }
        }

        let (uuid, seqno) = self.sst.wait_received();
        if uuid != group_uuid || seqno < group_seqno {
            self.sst.set_state(SstState::Failed);
            tracing::error!(
                received_uuid = %uuid,
                received_seqno = %seqno,
                required_uuid = %group_uuid,
                required_seqno = %group_seqno,
                "received wrong state"
            );
            return Err(ReplError::fatal("state transfer delivered wrong state"));
        }

        *self.state_uuid.lock().expect("state uuid lock poisoned") = Some(uuid);
        self.apply_monitor.set_initial_position(seqno);
        self.sst.set_state(SstState::None);
        tracing::info!(uuid = %uuid, seqno = %seqno, "state transfer complete");
        if let Err(err) = self.gcs.join(Some(seqno)) {
            tracing::warn!(error = %err, "join after state transfer failed");
        }
        Ok(())
    }

    /// Host reports the received state; wakes the waiting receive loop.
    pub fn sst_received(&self, uuid: Uuid, seqno: Position) -> ReplResult<()> {
        if self.node_state() != NodeState::Joining {
            tracing::error!(state = %self.node_state(), "sst_received outside JOINING");
            return Err(ReplError::ConnFail);
        }
        self.sst.deliver(uuid, seqno);
        Ok(())
    }

    /// Donor-side completion: host reports the transfer it sent; the node
    /// rejoins the group at that position.
    pub fn sst_sent(&self, uuid: Uuid, seqno: Option<Position>) -> ReplResult<()> {
        if self.node_state() != NodeState::Donor {
            tracing::error!(state = %self.node_state(), "sst_sent outside DONOR");
            return Err(ReplError::ConnFail);
        }
        let state_uuid = *self.state_uuid.lock().expect("state uuid lock poisoned");
        let join_seqno = match seqno {
            // The state sent no longer matches the group: report failure.
            Some(_) if state_uuid != Some(uuid) => None,
            other => other,
        };
        loop {
            match self.gcs.join(join_seqno) {
                Ok(()) => return Ok(()),
                Err(GcsError::Again) => {
                    thread::sleep(self.config.replication.join_retry());
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to recover from donor state");
                    return Err(ReplError::ConnFail);
                }
            }
        }
    }

    pub(crate) fn store_state_file(&self) -> ReplResult<()> {
        let state_uuid = *self.state_uuid.lock().expect("state uuid lock poisoned");
        write_state_file(
            self,
            state_uuid,
            Some(self.apply_monitor.last_left()),
        )
    }

    pub(crate) fn invalidate_state_file(&self) -> ReplResult<()> {
        write_state_file(self, None, None)
    }

    /// Restores saved state at connect. A missing or unreadable file leaves
    /// the node at genesis.
    pub(crate) fn restore_state_file(&self) -> ReplResult<()> {
        let path = self.config.state_file_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not restore state");
                return Ok(());
            }
        };

        let mut uuid = None;
        let mut seqno = None;
        for line in contents.lines().skip(1) {
            if let Some(raw) = line.strip_prefix("uuid:") {
                let parsed = raw.trim().parse::<Uuid>().map_err(|err| {
                    ReplError::fatal(format!("corrupt state file uuid: {err}"))
                })?;
                if !parsed.is_nil() {
                    uuid = Some(parsed);
                }
            } else if let Some(raw) = line.strip_prefix("seqno:") {
                let parsed = raw.trim().parse::<i64>().map_err(|err| {
                    ReplError::fatal(format!("corrupt state file seqno: {err}"))
                })?;
                if parsed >= 0 {
                    seqno = Some(Position::new(parsed as u64));
                }
            }
        }

        *self.state_uuid.lock().expect("state uuid lock poisoned") = uuid;
        if let Some(position) = seqno {
            self.apply_monitor.set_initial_position(position);
            self.cert.assign_initial_position(position);
        }
        tracing::debug!(
            uuid = ?uuid,
            seqno = ?seqno,
            "restored saved state"
        );
        Ok(())
    }
}

fn write_state_file(
    replicator: &Replicator,
    uuid: Option<Uuid>,
    seqno: Option<Position>,
) -> ReplResult<()> {
    let path = replicator.config.state_file_path();
    let mut out = String::new();
    out.push_str("# saved replication state, version: 1\n");
    out.push_str(&format!("uuid:  {}\n", uuid.unwrap_or_else(Uuid::nil)));
    match seqno {
        Some(position) => out.push_str(&format!("seqno: {position}\n")),
        None => out.push_str("seqno: -1\n"),
    }
    out.push_str("cert_index:\n");

    let mut file = fs::File::create(&path)
        .map_err(|err| ReplError::fatal(format!("could not store state: {err}")))?;
    file.write_all(out.as_bytes())
        .map_err(|err| ReplError::fatal(format!("could not store state: {err}")))?;
    Ok(())
}
