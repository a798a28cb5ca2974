use thiserror::Error;

use crate::core::CodecError;
use crate::gcs::GcsError;

/// Canonical return-code taxonomy of the replication core.
///
/// Transaction-local failures (`TrxFail`, `BfAbort`) are recoverable by
/// rolling back or replaying one transaction and never escalate; `Fatal`
/// means the node can no longer be trusted to match the group.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReplError {
    /// This transaction must be rolled back; the node is healthy.
    #[error("transaction failed")]
    TrxFail,

    /// A higher-priority earlier-ordered transaction won a conflict; the
    /// host must roll back and replay this transaction.
    #[error("transaction brute-force aborted, replay required")]
    BfAbort,

    /// The group connection is gone; the receive loop exits.
    #[error("group connection failed")]
    ConnFail,

    /// This node failed in a way the rest of the group survives.
    #[error("node failed")]
    NodeFail,

    /// The node has (or may have) diverged from the group.
    #[error("fatal replication error: {reason}")]
    Fatal { reason: String },

    #[error("operation not implemented")]
    NotImplemented,
}

impl ReplError {
    pub fn fatal(reason: impl Into<String>) -> Self {
        ReplError::Fatal {
            reason: reason.into(),
        }
    }

    /// Whether the error ends this node's participation in the group.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplError::Fatal { .. } | ReplError::NodeFail)
    }

    /// Whether the failure is scoped to one transaction.
    pub fn is_trx_local(&self) -> bool {
        matches!(self, ReplError::TrxFail | ReplError::BfAbort)
    }
}

impl From<CodecError> for ReplError {
    fn from(err: CodecError) -> Self {
        // A payload this node cannot decode is a payload every node decoded
        // identically or not at all; treat local decode failure as fatal.
        ReplError::fatal(format!("write-set decode failed: {err}"))
    }
}

impl From<GcsError> for ReplError {
    fn from(err: GcsError) -> Self {
        match err {
            GcsError::Again | GcsError::Interrupted => ReplError::TrxFail,
            GcsError::ConnFail | GcsError::Closed => ReplError::ConnFail,
            GcsError::Other(reason) => ReplError::fatal(reason),
        }
    }
}

pub type ReplResult<T> = std::result::Result<T, ReplError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trx_local_errors_are_not_fatal() {
        assert!(ReplError::TrxFail.is_trx_local());
        assert!(ReplError::BfAbort.is_trx_local());
        assert!(!ReplError::TrxFail.is_fatal());
        assert!(ReplError::fatal("diverged").is_fatal());
        assert!(!ReplError::ConnFail.is_fatal());
    }
}
