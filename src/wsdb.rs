//! Registry of local transaction and connection handles.
//!
//! The registry owns every handle behind an `Arc`; hosts keep the id as the
//! durable key and the `Arc` as a cheap working reference, so there are no
//! back-references from handles to the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

use crate::core::{ConnId, NodeId, TrxHandle, TrxId, TrxKind};

#[derive(Default)]
struct ConnEntry {
    trx: Option<Arc<TrxHandle>>,
    default_ctx: Option<Bytes>,
}

#[derive(Default)]
struct WsdbInner {
    trxs: HashMap<TrxId, Arc<TrxHandle>>,
    conns: HashMap<ConnId, ConnEntry>,
}

/// Write-set database: the map from host transaction ids to live handles.
#[derive(Default)]
pub struct Wsdb {
    inner: Mutex<WsdbInner>,
}

impl Wsdb {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WsdbInner> {
        self.inner.lock().expect("wsdb lock poisoned")
    }

    /// Looks up (or creates) the handle for a local transaction. At most one
    /// handle exists per transaction id while it is live.
    pub fn local_trx(&self, source: NodeId, trx_id: TrxId, create: bool) -> Option<Arc<TrxHandle>> {
        let mut inner = self.lock();
        if let Some(trx) = inner.trxs.get(&trx_id) {
            return Some(Arc::clone(trx));
        }
        if !create {
            return None;
        }
        let trx = Arc::new(TrxHandle::new_local(source, TrxKind::Local(trx_id)));
        inner.trxs.insert(trx_id, Arc::clone(&trx));
        Some(trx)
    }

    /// Removes a transaction from the registry. Outstanding `Arc`s stay
    /// valid; the id can be reused afterwards.
    pub fn discard_trx(&self, trx_id: TrxId) {
        self.lock().trxs.remove(&trx_id);
    }

    /// Looks up (or creates) the connection-scoped handle used for isolated
    /// actions. A fresh handle inherits the connection's default context.
    pub fn conn_trx(&self, source: NodeId, conn_id: ConnId, create: bool) -> Option<Arc<TrxHandle>> {
        let mut inner = self.lock();
        if !inner.conns.contains_key(&conn_id) {
            if !create {
                return None;
            }
            inner.conns.insert(conn_id, ConnEntry::default());
        }
        let entry = inner.conns.get_mut(&conn_id).expect("conn entry present");
        if let Some(trx) = &entry.trx {
            return Some(Arc::clone(trx));
        }
        if !create {
            return None;
        }
        let trx = Arc::new(TrxHandle::new_local(source, TrxKind::Conn(conn_id)));
        trx.set_conn_ctx(entry.default_ctx.clone());
        entry.trx = Some(Arc::clone(&trx));
        Some(trx)
    }

    /// Stores the connection's default context (e.g. the selected database),
    /// replicated ahead of isolated actions so appliers can restore session
    /// state.
    pub fn set_conn_ctx(&self, conn_id: ConnId, ctx: Bytes) {
        let mut inner = self.lock();
        let entry = inner.conns.entry(conn_id).or_default();
        entry.default_ctx = Some(ctx.clone());
        if let Some(trx) = &entry.trx {
            trx.set_conn_ctx(Some(ctx));
        }
    }

    /// Drops the connection's current isolated-action handle, keeping the
    /// connection entry (and its default context) alive.
    pub fn discard_conn_trx(&self, conn_id: ConnId) {
        if let Some(entry) = self.lock().conns.get_mut(&conn_id) {
            entry.trx = None;
        }
    }

    /// Forgets the connection entirely.
    pub fn discard_conn(&self, conn_id: ConnId) {
        self.lock().conns.remove(&conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node() -> NodeId {
        NodeId::new(Uuid::from_bytes([3u8; 16]))
    }

    #[test]
    fn local_trx_is_unique_per_id() {
        let wsdb = Wsdb::new();
        let a = wsdb.local_trx(node(), TrxId::new(1), true).expect("create");
        let b = wsdb.local_trx(node(), TrxId::new(1), true).expect("lookup");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(wsdb.local_trx(node(), TrxId::new(2), false).is_none());
    }

    #[test]
    fn discard_releases_the_id() {
        let wsdb = Wsdb::new();
        let a = wsdb.local_trx(node(), TrxId::new(1), true).expect("create");
        wsdb.discard_trx(TrxId::new(1));
        let b = wsdb.local_trx(node(), TrxId::new(1), true).expect("recreate");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn conn_trx_inherits_default_context() {
        let wsdb = Wsdb::new();
        wsdb.set_conn_ctx(ConnId::new(9), Bytes::from_static(b"use appdb"));
        let trx = wsdb.conn_trx(node(), ConnId::new(9), true).expect("create");
        assert_eq!(
            trx.lock().conn_ctx.as_deref(),
            Some(&b"use appdb"[..])
        );

        wsdb.discard_conn_trx(ConnId::new(9));
        let again = wsdb.conn_trx(node(), ConnId::new(9), true).expect("recreate");
        assert!(!Arc::ptr_eq(&trx, &again));
        assert_eq!(
            again.lock().conn_ctx.as_deref(),
            Some(&b"use appdb"[..])
        );
    }
}
