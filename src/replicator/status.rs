//! Status snapshot, rebuilt from atomic counters on demand.

use std::sync::atomic::Ordering;

use serde::Serialize;
use uuid::Uuid;

use super::sst::SstState;
use super::{NodeState, Replicator};

/// Externally visible membership status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Empty,
    Joiner,
    Joined,
    Synced,
    Donor,
}

/// Point-in-time view of the replicator's counters and gauges. Built fresh
/// on every call; holds no references into internal state.
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub local_state_uuid: String,
    pub last_committed: u64,
    pub replicated: u64,
    pub replicated_bytes: u64,
    pub received: u64,
    pub received_bytes: u64,
    pub local_commits: u64,
    pub local_cert_failures: u64,
    pub local_bf_aborts: u64,
    pub local_replays: u64,
    pub local_slave_queue: usize,
    pub flow_control_waits: u64,
    pub cert_deps_distance: f64,
    pub apply_oooe: f64,
    pub apply_oool: f64,
    pub apply_window: f64,
    pub local_status: MemberStatus,
    pub local_status_comment: &'static str,
}

impl Replicator {
    pub fn status(&self) -> StatusSnapshot {
        let state = self.node_state();
        let sst_state = self.sst.state();
        let state_uuid = *self.state_uuid.lock().expect("state uuid lock poisoned");
        let apply_stats = self.apply_monitor.stats();
        let counters = &self.counters;

        StatusSnapshot {
            local_state_uuid: state_uuid.unwrap_or_else(Uuid::nil).to_string(),
            last_committed: self.apply_monitor.last_left().get(),
            replicated: counters.replicated.load(Ordering::Relaxed),
            replicated_bytes: counters.replicated_bytes.load(Ordering::Relaxed),
            received: counters.received.load(Ordering::Relaxed),
            received_bytes: counters.received_bytes.load(Ordering::Relaxed),
            local_commits: counters.local_commits.load(Ordering::Relaxed),
            local_cert_failures: counters.local_cert_failures.load(Ordering::Relaxed),
            local_bf_aborts: counters.local_bf_aborts.load(Ordering::Relaxed),
            local_replays: counters.local_replays.load(Ordering::Relaxed),
            local_slave_queue: self.gcs.queue_len(),
            flow_control_waits: counters.flow_control_waits.load(Ordering::Relaxed),
            cert_deps_distance: self.cert.avg_deps_distance(),
            apply_oooe: apply_stats.oooe,
            apply_oool: apply_stats.oool,
            apply_window: apply_stats.window,
            local_status: member_status(state),
            local_status_comment: status_comment(state, sst_state),
        }
    }
}

fn member_status(state: NodeState) -> MemberStatus {
    match state {
        NodeState::Closed | NodeState::Closing => MemberStatus::Empty,
        NodeState::Joining => MemberStatus::Joiner,
        NodeState::Joined => MemberStatus::Joined,
        NodeState::Synced => MemberStatus::Synced,
        NodeState::Donor => MemberStatus::Donor,
    }
}

fn status_comment(state: NodeState, sst_state: SstState) -> &'static str {
    match state {
        NodeState::Closed | NodeState::Closing => match sst_state {
            SstState::ReqFailed => "SST request failed (-)",
            SstState::Failed => "SST failed (-)",
            _ => "Initialized (0)",
        },
        NodeState::Joining => match sst_state {
            SstState::Wait => "Waiting for SST (4)",
            _ => "Joining (1)",
        },
        NodeState::Joined => "Joined (5)",
        NodeState::Synced => "Synced (6)",
        NodeState::Donor => "Donor (+)",
    }
}
