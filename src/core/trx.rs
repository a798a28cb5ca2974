//! Per-transaction handle and lifecycle state machine.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

use super::codec::{self, CodecError, WireCollection, WireHeader, WireSource};
use super::seqno::{ConnId, GlobalSeqno, LocalSeqno, NodeId, Position, TrxId};
use super::writeset::{Statement, WriteKey, WriteSet};

/// Identity a transaction replicates under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrxKind {
    /// Ordinary transaction, host-assigned id.
    Local(TrxId),
    /// Isolated connection action (DDL), identified by connection.
    Conn(ConnId),
}

/// Transaction lifecycle states.
///
/// Transitions are checked centrally in [`TrxInner::shift`]; an illegal
/// transition is an invariant violation and aborts the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrxState {
    Executing,
    Replicating,
    Replicated,
    Certifying,
    Certified,
    Applying,
    Committed,
    MustAbort,
    MustCertAndReplay,
    MustReplay,
    Replaying,
    Replayed,
    Aborting,
    RolledBack,
}

impl TrxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrxState::Committed | TrxState::RolledBack)
    }

    fn permits(self, to: TrxState) -> bool {
        use TrxState::*;
        match self {
            Executing => matches!(to, Replicating | MustAbort | RolledBack),
            Replicating => matches!(to, Replicated | MustAbort | Aborting),
            Replicated => matches!(to, Certifying | MustAbort),
            Certifying => matches!(to, Certified | Aborting | MustAbort),
            Certified => matches!(to, Applying | Replaying | Executing | MustAbort),
            Applying => matches!(to, Committed),
            MustAbort => matches!(to, Aborting | MustCertAndReplay | MustReplay),
            MustCertAndReplay => matches!(to, Certifying | Aborting),
            MustReplay => matches!(to, Replaying | Aborting),
            Replaying => matches!(to, Replayed | Aborting),
            Replayed => matches!(to, Committed),
            Aborting => matches!(to, RolledBack),
            Committed | RolledBack => false,
        }
    }
}

impl fmt::Display for TrxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrxState::Executing => "EXECUTING",
            TrxState::Replicating => "REPLICATING",
            TrxState::Replicated => "REPLICATED",
            TrxState::Certifying => "CERTIFYING",
            TrxState::Certified => "CERTIFIED",
            TrxState::Applying => "APPLYING",
            TrxState::Committed => "COMMITTED",
            TrxState::MustAbort => "MUST_ABORT",
            TrxState::MustCertAndReplay => "MUST_CERT_AND_REPLAY",
            TrxState::MustReplay => "MUST_REPLAY",
            TrxState::Replaying => "REPLAYING",
            TrxState::Replayed => "REPLAYED",
            TrxState::Aborting => "ABORTING",
            TrxState::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

/// Handle opaque to the host; the group communication layer hands one back
/// from `schedule` so an in-flight broadcast can be interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BroadcastHandle(pub u64);

/// Mutable transaction state, guarded by the per-transaction lock.
///
/// The lock must be released across any monitor or broadcast operation that
/// can block, so that an aborter thread can take it and flag MUST_ABORT.
#[derive(Debug)]
pub struct TrxInner {
    state: TrxState,
    pub(crate) local_seqno: Option<LocalSeqno>,
    pub(crate) global_seqno: Option<GlobalSeqno>,
    pub(crate) last_seen: Position,
    pub(crate) last_depends: Option<Position>,
    pub(crate) write_sets: Vec<WriteSet>,
    pub(crate) collection: Option<Bytes>,
    pub(crate) broadcast_handle: Option<BroadcastHandle>,
    pub(crate) commit_intent: bool,
    pub(crate) conn_ctx: Option<Bytes>,
    /// Whether this transaction currently occupies its apply-monitor slot.
    pub(crate) apply_slot_held: bool,
}

impl TrxInner {
    pub fn state(&self) -> TrxState {
        self.state
    }

    /// Moves to `to`, aborting the node on an illegal transition.
    pub fn shift(&mut self, to: TrxState) {
        assert!(
            self.state.permits(to),
            "illegal transaction state transition {} -> {}",
            self.state,
            to
        );
        self.state = to;
    }

    pub fn global_seqno(&self) -> Option<GlobalSeqno> {
        self.global_seqno
    }

    pub fn local_seqno(&self) -> Option<LocalSeqno> {
        self.local_seqno
    }

    pub fn set_seqnos(&mut self, local: LocalSeqno, global: GlobalSeqno) {
        self.local_seqno = Some(local);
        self.global_seqno = Some(global);
    }

    /// Union of the modified keys across all write-set entries.
    pub fn modified_keys(&self) -> impl Iterator<Item = &WriteKey> {
        self.write_sets.iter().flat_map(|ws| ws.keys.iter())
    }
}

/// A transaction being replicated, local or remote.
pub struct TrxHandle {
    source: NodeId,
    kind: TrxKind,
    is_local: bool,
    inner: Mutex<TrxInner>,
}

impl TrxHandle {
    pub fn new_local(source: NodeId, kind: TrxKind) -> Self {
        Self {
            source,
            kind,
            is_local: true,
            inner: Mutex::new(TrxInner {
                state: TrxState::Executing,
                local_seqno: None,
                global_seqno: None,
                last_seen: Position::GENESIS,
                last_depends: None,
                write_sets: Vec::new(),
                collection: None,
                broadcast_handle: None,
                commit_intent: false,
                conn_ctx: None,
                apply_slot_held: false,
            }),
        }
    }

    /// Materializes a remote transaction from a received collection.
    pub fn from_wire(
        bytes: &[u8],
        local: LocalSeqno,
        global: GlobalSeqno,
    ) -> Result<Self, CodecError> {
        let WireCollection { header, write_sets } = codec::decode_collection(bytes)?;
        let WireHeader {
            node,
            source,
            last_seen,
            commit_intent,
            conn_ctx,
            ..
        } = header;
        let kind = match source {
            WireSource::Trx(trx_id) => TrxKind::Local(trx_id),
            WireSource::Conn(conn_id) => TrxKind::Conn(conn_id),
        };
        Ok(Self {
            source: node,
            kind,
            is_local: false,
            inner: Mutex::new(TrxInner {
                state: TrxState::Replicated,
                local_seqno: Some(local),
                global_seqno: Some(global),
                last_seen,
                last_depends: None,
                write_sets,
                collection: Some(Bytes::copy_from_slice(bytes)),
                broadcast_handle: None,
                commit_intent,
                conn_ctx,
                apply_slot_held: false,
            }),
        })
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn kind(&self) -> TrxKind {
        self.kind
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn is_conn(&self) -> bool {
        matches!(self.kind, TrxKind::Conn(_))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TrxInner> {
        self.inner.lock().expect("trx lock poisoned")
    }

    pub fn state(&self) -> TrxState {
        self.lock().state()
    }

    pub fn global_seqno(&self) -> Option<GlobalSeqno> {
        self.lock().global_seqno
    }

    pub fn local_seqno(&self) -> Option<LocalSeqno> {
        self.lock().local_seqno
    }

    pub fn last_depends(&self) -> Option<Position> {
        self.lock().last_depends
    }

    /// Buffers a statement-level write-set entry. Valid only while EXECUTING.
    pub fn append_statement(
        &self,
        keys: Vec<WriteKey>,
        query: impl Into<Bytes>,
        timeval: i64,
        rand_seed: u64,
    ) {
        let mut inner = self.lock();
        assert_eq!(inner.state(), TrxState::Executing, "append after replicate");
        inner.write_sets.push(WriteSet::statements(
            keys,
            vec![Statement::new(query, timeval, rand_seed)],
        ));
    }

    /// Buffers a row-image write-set entry. Valid only while EXECUTING.
    pub fn append_data(&self, keys: Vec<WriteKey>, buffer: impl Into<Bytes>) {
        let mut inner = self.lock();
        assert_eq!(inner.state(), TrxState::Executing, "append after replicate");
        inner.write_sets.push(WriteSet::data(keys, buffer));
    }

    /// Marks that the host intends to commit once `pre_commit` returns.
    pub fn set_commit_intent(&self, commit: bool) {
        self.lock().commit_intent = commit;
    }

    pub(crate) fn set_conn_ctx(&self, ctx: Option<Bytes>) {
        self.lock().conn_ctx = ctx;
    }

    /// Serializes the buffered write-sets into the broadcast collection.
    pub(crate) fn flush(&self, inner: &mut TrxInner) -> Result<Bytes, CodecError> {
        let source = match self.kind {
            TrxKind::Local(trx_id) => WireSource::Trx(trx_id),
            TrxKind::Conn(conn_id) => WireSource::Conn(conn_id),
        };
        let collection = WireCollection {
            header: WireHeader {
                version: codec::WIRE_VERSION,
                node: self.source,
                source,
                last_seen: inner.last_seen,
                commit_intent: inner.commit_intent,
                conn_ctx: inner.conn_ctx.clone(),
            },
            write_sets: inner.write_sets.clone(),
        };
        let bytes = codec::encode_collection(&collection)?;
        inner.collection = Some(bytes.clone());
        Ok(bytes)
    }
}

impl fmt::Debug for TrxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("TrxHandle")
            .field("source", &self.source)
            .field("kind", &self.kind)
            .field("is_local", &self.is_local)
            .field("state", &inner.state)
            .field("local_seqno", &inner.local_seqno)
            .field("global_seqno", &inner.global_seqno)
            .field("last_seen", &inner.last_seen)
            .field("last_depends", &inner.last_depends)
            .finish_non_exhaustive()
    }
}
