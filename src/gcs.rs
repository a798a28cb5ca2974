//! Group communication seam: totally-ordered broadcast as a black box.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{BroadcastHandle, GlobalSeqno, LocalSeqno, NodeId, Position};

/// Errors surfaced by the group communication layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcsError {
    /// Transient back-pressure; retrying may succeed.
    #[error("group layer busy, retry")]
    Again,
    /// A pending call was interrupted on request.
    #[error("group call interrupted")]
    Interrupted,
    /// The connection to the group is gone.
    #[error("group connection failed")]
    ConnFail,
    /// The layer has been closed locally.
    #[error("group layer closed")]
    Closed,
    #[error("group layer error: {0}")]
    Other(String),
}

/// Membership state the group layer reports for this node in a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    /// Not part of the primary component.
    NonPrim,
    /// Fresh primary-component member; state transfer not yet decided.
    Prim,
    Joiner,
    Joined,
    Synced,
    Donor,
}

/// One member row of a configuration view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: NodeId,
    pub name: String,
    pub incoming: String,
}

/// A configuration (view) change delivered by the group layer.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfView {
    /// Monotone primary-configuration id; negative for non-primary views.
    pub conf_id: i64,
    pub group_uuid: Option<Uuid>,
    /// Group-wide position at the view boundary.
    pub seqno: Position,
    /// This node's index in `members`, if it is a member.
    pub my_idx: Option<usize>,
    pub my_state: MemberState,
    pub members: Vec<MemberInfo>,
}

impl ConfView {
    pub fn is_primary(&self) -> bool {
        self.conf_id >= 0
    }
}

/// View information handed to the host on every configuration change.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewInfo {
    pub view: ConfView,
    /// Whether this node needs a state transfer to join the view.
    pub state_gap: bool,
}

/// An action delivered by the receive loop.
#[derive(Clone, Debug)]
pub enum Action {
    /// A totally-ordered write-set collection.
    Ordered {
        local: LocalSeqno,
        global: GlobalSeqno,
        payload: Bytes,
    },
    /// Group-wide commit cut: everything at or below the encoded position
    /// has committed everywhere.
    CommitCut { local: LocalSeqno, payload: Bytes },
    /// Configuration change.
    Conf { local: LocalSeqno, view: ConfView },
    /// A joiner requests a state transfer from this node.
    StateRequest { local: LocalSeqno, request: Bytes },
    /// This node's state transfer completed group-side.
    Join { local: LocalSeqno },
    /// This node caught up with the group.
    Sync { local: LocalSeqno },
}

impl Action {
    pub fn local_seqno(&self) -> LocalSeqno {
        match self {
            Action::Ordered { local, .. }
            | Action::CommitCut { local, .. }
            | Action::Conf { local, .. }
            | Action::StateRequest { local, .. }
            | Action::Join { local }
            | Action::Sync { local } => *local,
        }
    }
}

/// Totally-ordered group broadcast, consumed as a black box.
///
/// `repl` blocks until the payload is self-delivered in total order and
/// returns its seqnos; the receive loop sees only remote actions. All
/// methods are callable from any thread.
pub trait GroupComm: Send + Sync {
    fn connect(&self, cluster_name: &str, cluster_url: &str) -> Result<(), GcsError>;

    fn close(&self) -> Result<(), GcsError>;

    /// Blocking read of the next action.
    fn recv(&self) -> Result<Action, GcsError>;

    /// Reserves a broadcast slot; the handle can interrupt the broadcast.
    fn schedule(&self) -> Result<BroadcastHandle, GcsError>;

    /// Totally-ordered broadcast of a write-set collection.
    fn repl(
        &self,
        handle: BroadcastHandle,
        payload: &Bytes,
    ) -> Result<(LocalSeqno, GlobalSeqno), GcsError>;

    /// Interrupts a pending `repl` for the given handle.
    fn interrupt(&self, handle: BroadcastHandle) -> Result<(), GcsError>;

    /// Asks the group for a state-transfer donor. Returns the local seqno
    /// under which the request was ordered, so the caller can cancel its
    /// monitor slot.
    fn request_state_transfer(
        &self,
        request: &Bytes,
        donor: &str,
    ) -> Result<LocalSeqno, GcsError>;

    /// Announces this node has reached `seqno` (joiner done, or donor done).
    /// `None` reports a failed donation.
    fn join(&self, seqno: Option<Position>) -> Result<(), GcsError>;

    /// Seeds the group layer with the node's recovered position.
    fn set_initial_position(&self, uuid: Option<Uuid>, seqno: Position);

    /// Reports the node's last-committed position for group-wide cuts.
    fn set_last_applied(&self, seqno: Position);

    /// Length of the receive queue, for the status snapshot.
    fn queue_len(&self) -> usize;
}
