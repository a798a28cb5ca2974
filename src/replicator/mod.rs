//! The replicator: node lifecycle, host-callable surface, shared state.

mod local;
mod recv;
mod service;
mod sst;
mod status;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::cert::Certification;
use crate::config::Config;
use crate::core::{ConnId, NodeId, Position, TrxHandle, TrxId};
use crate::error::{ReplError, ReplResult};
use crate::gcs::GroupComm;
use crate::hooks::HostHooks;
use crate::monitor::{ApplyOrder, LocalOrder, Monitor};
use crate::wsdb::Wsdb;

pub use status::{MemberStatus, StatusSnapshot};
use sst::SstCoordinator;

/// Node lifecycle states, ordered: replication requires at least JOINED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Closed,
    Closing,
    Joining,
    Joined,
    Synced,
    Donor,
}

impl NodeState {
    fn permits(self, to: NodeState) -> bool {
        use NodeState::*;
        match self {
            Closed => matches!(to, Joining),
            Closing => matches!(to, Closed),
            Joining => matches!(to, Closing | Joined | Synced),
            Joined => matches!(to, Closing | Synced),
            Synced => matches!(to, Closing | Joining | Donor),
            Donor => matches!(to, Joining | Joined | Synced | Closing),
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Closed => "CLOSED",
            NodeState::Closing => "CLOSING",
            NodeState::Joining => "JOINING",
            NodeState::Joined => "JOINED",
            NodeState::Synced => "SYNCED",
            NodeState::Donor => "DONOR",
        };
        f.write_str(name)
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub replicated: AtomicU64,
    pub replicated_bytes: AtomicU64,
    pub received: AtomicU64,
    pub received_bytes: AtomicU64,
    pub local_commits: AtomicU64,
    pub local_rollbacks: AtomicU64,
    pub local_cert_failures: AtomicU64,
    pub local_bf_aborts: AtomicU64,
    pub local_replays: AtomicU64,
    pub flow_control_waits: AtomicU64,
}

/// The synchronous multi-master replication core.
///
/// One instance per node; the host drives local transactions through
/// [`replicate`](Self::replicate) / [`pre_commit`](Self::pre_commit) /
/// [`post_commit`](Self::post_commit) and dedicates one or more threads to
/// [`async_recv`](Self::async_recv).
pub struct Replicator {
    pub(crate) config: Config,
    pub(crate) gcs: Arc<dyn GroupComm>,
    pub(crate) hooks: Arc<dyn HostHooks>,
    pub(crate) wsdb: Wsdb,
    pub(crate) cert: Certification,
    pub(crate) local_monitor: Monitor<LocalOrder>,
    pub(crate) apply_monitor: Monitor<ApplyOrder>,
    pub(crate) sst: SstCoordinator,
    pub(crate) service: service::ServiceReporter,
    pub(crate) counters: Counters,
    state: Mutex<NodeState>,
    node_id: Mutex<NodeId>,
    pub(crate) state_uuid: Mutex<Option<Uuid>>,
    pub(crate) receivers: AtomicUsize,
    report_counter: AtomicU64,
}

impl Replicator {
    pub fn new(config: Config, gcs: Arc<dyn GroupComm>, hooks: Arc<dyn HostHooks>) -> Self {
        let service = service::ServiceReporter::spawn(Arc::clone(&gcs));
        Self {
            config,
            gcs,
            hooks,
            wsdb: Wsdb::new(),
            cert: Certification::new(),
            local_monitor: Monitor::new(),
            apply_monitor: Monitor::new(),
            sst: SstCoordinator::new(),
            service,
            counters: Counters::default(),
            state: Mutex::new(NodeState::Closed),
            node_id: Mutex::new(NodeId::new(Uuid::nil())),
            state_uuid: Mutex::new(None),
            receivers: AtomicUsize::new(0),
            report_counter: AtomicU64::new(0),
        }
    }

    /// Joins the cluster: restores saved state, seeds the group layer with
    /// the recovered position and opens the group connection.
    pub fn connect(
        &self,
        cluster_name: &str,
        cluster_url: &str,
        state_donor: &str,
    ) -> ReplResult<()> {
        self.shift_to(NodeState::Joining)?;
        self.restore_state_file()?;
        if !state_donor.is_empty() {
            self.sst.set_donor(state_donor);
        } else {
            self.sst.set_donor(&self.config.sst_donor);
        }
        let state_uuid = *self.state_uuid.lock().expect("state uuid lock poisoned");
        self.gcs.set_initial_position(state_uuid, self.cert.position());
        self.gcs.connect(cluster_name, cluster_url)?;
        Ok(())
    }

    /// Closes the group connection; the receive loop winds the node down
    /// through CLOSING when the self-leave view arrives.
    pub fn close(&self) -> ReplResult<()> {
        assert_ne!(self.node_state(), NodeState::Closed, "close on closed node");
        self.gcs.close()?;
        Ok(())
    }

    pub fn node_state(&self) -> NodeState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn shift_to(&self, to: NodeState) -> ReplResult<()> {
        let mut state = self.state.lock().expect("state lock poisoned");
        if !state.permits(to) {
            return Err(ReplError::fatal(format!(
                "illegal node state transition {} -> {}",
                *state, to
            )));
        }
        tracing::info!(from = %*state, to = %to, "node state shift");
        *state = to;
        Ok(())
    }

    pub(crate) fn node_id(&self) -> NodeId {
        *self.node_id.lock().expect("node id lock poisoned")
    }

    pub(crate) fn set_node_id(&self, id: NodeId) {
        *self.node_id.lock().expect("node id lock poisoned") = id;
    }

    /// Looks up (or creates) the handle for a local transaction.
    pub fn local_trx(&self, trx_id: TrxId, create: bool) -> Option<Arc<TrxHandle>> {
        self.wsdb.local_trx(self.node_id(), trx_id, create)
    }

    /// Looks up (or creates) the connection handle for isolated actions.
    pub fn local_conn_trx(&self, conn_id: ConnId, create: bool) -> Option<Arc<TrxHandle>> {
        self.wsdb.conn_trx(self.node_id(), conn_id, create)
    }

    /// Releases a host reference. Dropping the handle is the release; this
    /// exists so call sites read like the rest of the lifecycle surface.
    pub fn unref_local_trx(&self, trx: Arc<TrxHandle>) {
        drop(trx);
    }

    /// Forgets a local transaction; its id may be reused.
    pub fn discard_local_trx(&self, trx_id: TrxId) {
        self.wsdb.discard_trx(trx_id);
    }

    /// Stores the connection's default context, replicated ahead of
    /// isolated actions.
    pub fn set_default_context(&self, conn_id: ConnId, ctx: bytes::Bytes) {
        self.wsdb.set_conn_ctx(conn_id, ctx);
    }

    /// Forgets a connection and its default context.
    pub fn discard_local_conn(&self, conn_id: ConnId) {
        self.wsdb.discard_conn(conn_id);
    }

    /// Waits until reads at the current global position are causally safe.
    pub fn causal_read(&self) -> ReplResult<Position> {
        Err(ReplError::NotImplemented)
    }

    /// Reports last-committed to the group on every N-th call.
    pub(crate) fn report_last_committed(&self) {
        let n = self.report_counter.fetch_add(1, Ordering::Relaxed);
        if n % self.config.replication.report_interval == 0 {
            self.service.report(self.apply_monitor.last_left());
        }
    }
}
