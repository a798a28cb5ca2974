//! Core replication model: seqnos, write-sets, wire codec, transactions.

pub mod codec;
mod seqno;
mod trx;
mod writeset;

pub use codec::{CodecError, WireCollection, WireHeader, WireSource, WIRE_VERSION};
pub use seqno::{ConnId, GlobalSeqno, LocalSeqno, NodeId, Position, TrxId};
pub use trx::{BroadcastHandle, TrxHandle, TrxInner, TrxKind, TrxState};
pub use writeset::{Statement, WriteKey, WriteSet, WriteSetData};
