//! Host-provided callbacks: applying write-sets and servicing membership.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::core::{GlobalSeqno, Position};
use crate::gcs::ViewInfo;

/// One unit of work handed to the host for apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyData<'a> {
    /// A query to re-execute, with the metadata needed for determinism.
    Statement {
        query: &'a [u8],
        timeval: i64,
        rand_seed: u64,
    },
    /// An opaque row-image buffer.
    RowData(&'a [u8]),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The host cannot apply this kind of data.
    #[error("apply not implemented for this data kind")]
    NotImplemented,
    #[error("apply failed: {reason}")]
    Failed { reason: String },
}

/// Applies certified write-sets against the local database. One applier per
/// receive thread (and one per replaying host thread); the applier instance
/// carries whatever session context the host needs.
pub trait Applier: Send + Sync {
    fn apply(&self, data: ApplyData<'_>, global: GlobalSeqno) -> Result<(), ApplyError>;
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("state transfer donation failed: {reason}")]
    DonateFailed { reason: String },
}

/// Membership callbacks, configured once at construction.
pub trait HostHooks: Send + Sync {
    /// Invoked on every configuration change. For a view the node cannot
    /// join without a state transfer, the returned blob is forwarded to the
    /// donor as the transfer request.
    fn view(&self, info: &ViewInfo) -> Option<Bytes>;

    /// Performs a state transfer as donor, synchronously. `bypass` is set
    /// when the joiner only needs the position, not the payload.
    fn sst_donate(
        &self,
        request: &[u8],
        group_uuid: Option<Uuid>,
        seqno: Position,
        bypass: bool,
    ) -> Result<(), HookError>;

    /// Notified when the node reaches SYNCED.
    fn synced(&self);
}
