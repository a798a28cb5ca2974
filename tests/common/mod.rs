#![allow(dead_code)]

//! Shared fixtures: in-process group layer and recording host callbacks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use uuid::Uuid;

use wsrepl::core::codec::{self, WireCollection, WireHeader, WireSource};
use wsrepl::core::{ConnId, GlobalSeqno, LocalSeqno, NodeId, Position, TrxId};
use wsrepl::core::{BroadcastHandle, Statement, WriteKey, WriteSet};
use wsrepl::gcs::{Action, ConfView, GcsError, GroupComm, MemberInfo, MemberState, ViewInfo};
use wsrepl::hooks::{Applier, ApplyData, ApplyError, HookError, HostHooks};
use wsrepl::{Config, Replicator, ReplResult};

pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !pred() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Mock group communication layer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockGcsInner {
    queue: VecDeque<Action>,
    closed: bool,
    next_local: u64,
    next_global: u64,
    next_handle: u64,
    interrupted: HashSet<u64>,
    joins: Vec<Option<Position>>,
    last_applied: Vec<Position>,
    st_requests: Vec<(Bytes, String)>,
    st_errors: VecDeque<GcsError>,
    repl_errors: VecDeque<GcsError>,
}

/// Scripted total-order broadcast: tests inject remote actions and observe
/// joins, requests and reports.
#[derive(Default)]
pub struct MockGcs {
    inner: Mutex<MockGcsInner>,
    cond: Condvar,
}

impl MockGcs {
    pub fn new() -> Self {
        let gcs = Self::default();
        {
            let mut inner = gcs.inner.lock().expect("gcs lock");
            inner.next_local = 1;
            inner.next_global = 1;
            inner.next_handle = 1;
        }
        gcs
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockGcsInner> {
        self.inner.lock().expect("gcs lock")
    }

    fn push(&self, action: Action) {
        self.lock().queue.push_back(action);
        self.cond.notify_all();
    }

    fn alloc_local(inner: &mut MockGcsInner) -> LocalSeqno {
        let l = LocalSeqno::from_u64(inner.next_local).expect("local seqno");
        inner.next_local += 1;
        l
    }

    /// Delivers a remote ordered write-set, allocating the next seqnos.
    pub fn inject_ordered(&self, payload: Bytes) -> GlobalSeqno {
        let mut inner = self.lock();
        let local = Self::alloc_local(&mut inner);
        let global = GlobalSeqno::from_u64(inner.next_global).expect("global seqno");
        inner.next_global += 1;
        inner.queue.push_back(Action::Ordered {
            local,
            global,
            payload,
        });
        drop(inner);
        self.cond.notify_all();
        global
    }

    pub fn inject_commit_cut(&self, cut: Position) {
        let mut inner = self.lock();
        let local = Self::alloc_local(&mut inner);
        inner.queue.push_back(Action::CommitCut {
            local,
            payload: codec::encode_commit_cut(cut),
        });
        drop(inner);
        self.cond.notify_all();
    }

    pub fn inject_conf(&self, view: ConfView) {
        let mut inner = self.lock();
        let local = Self::alloc_local(&mut inner);
        // Remote history resumes after the view position.
        if view.is_primary() {
            inner.next_global = inner.next_global.max(view.seqno.get() + 1);
        }
        inner.queue.push_back(Action::Conf { local, view });
        drop(inner);
        self.cond.notify_all();
    }

    pub fn inject_state_request(&self, request: Bytes) {
        let mut inner = self.lock();
        let local = Self::alloc_local(&mut inner);
        inner.queue.push_back(Action::StateRequest { local, request });
        drop(inner);
        self.cond.notify_all();
    }

    pub fn inject_join(&self) {
        let mut inner = self.lock();
        let local = Self::alloc_local(&mut inner);
        inner.queue.push_back(Action::Join { local });
        drop(inner);
        self.cond.notify_all();
    }

    pub fn inject_sync(&self) {
        let mut inner = self.lock();
        let local = Self::alloc_local(&mut inner);
        inner.queue.push_back(Action::Sync { local });
        drop(inner);
        self.cond.notify_all();
    }

    /// Scripts the next broadcast attempts to fail.
    pub fn script_repl_errors(&self, errors: impl IntoIterator<Item = GcsError>) {
        self.lock().repl_errors.extend(errors);
    }

    /// Scripts the next state-transfer requests to fail.
    pub fn script_st_errors(&self, errors: impl IntoIterator<Item = GcsError>) {
        self.lock().st_errors.extend(errors);
    }

    pub fn joins(&self) -> Vec<Option<Position>> {
        self.lock().joins.clone()
    }

    pub fn st_requests(&self) -> Vec<(Bytes, String)> {
        self.lock().st_requests.clone()
    }

    pub fn last_applied_reports(&self) -> Vec<Position> {
        self.lock().last_applied.clone()
    }
}

impl GroupComm for MockGcs {
    fn connect(&self, _cluster_name: &str, _cluster_url: &str) -> Result<(), GcsError> {
        Ok(())
    }

    fn close(&self) -> Result<(), GcsError> {
        let mut inner = self.lock();
        let local = Self::alloc_local(&mut inner);
        inner.queue.push_back(Action::Conf {
            local,
            view: ConfView {
                conf_id: -1,
                group_uuid: None,
                seqno: Position::GENESIS,
                my_idx: None,
                my_state: MemberState::NonPrim,
                members: Vec::new(),
            },
        });
        inner.closed = true;
        drop(inner);
        self.cond.notify_all();
        Ok(())
    }

    fn recv(&self) -> Result<Action, GcsError> {
        let mut inner = self.lock();
        loop {
            if let Some(action) = inner.queue.pop_front() {
                return Ok(action);
            }
            if inner.closed {
                return Err(GcsError::Closed);
            }
            inner = self.cond.wait(inner).expect("gcs lock");
        }
    }

    fn schedule(&self) -> Result<BroadcastHandle, GcsError> {
        let mut inner = self.lock();
        let handle = BroadcastHandle(inner.next_handle);
        inner.next_handle += 1;
        Ok(handle)
    }

    fn repl(
        &self,
        handle: BroadcastHandle,
        _payload: &Bytes,
    ) -> Result<(LocalSeqno, GlobalSeqno), GcsError> {
        let mut inner = self.lock();
        if let Some(err) = inner.repl_errors.pop_front() {
            return Err(err);
        }
        if inner.interrupted.remove(&handle.0) {
            return Err(GcsError::Interrupted);
        }
        let local = Self::alloc_local(&mut inner);
        let global = GlobalSeqno::from_u64(inner.next_global).expect("global seqno");
        inner.next_global += 1;
        Ok((local, global))
    }

    fn interrupt(&self, handle: BroadcastHandle) -> Result<(), GcsError> {
        self.lock().interrupted.insert(handle.0);
        Ok(())
    }

    fn request_state_transfer(
        &self,
        request: &Bytes,
        donor: &str,
    ) -> Result<LocalSeqno, GcsError> {
        let mut inner = self.lock();
        if let Some(err) = inner.st_errors.pop_front() {
            return Err(err);
        }
        inner.st_requests.push((request.clone(), donor.to_string()));
        Ok(Self::alloc_local(&mut inner))
    }

    fn join(&self, seqno: Option<Position>) -> Result<(), GcsError> {
        self.lock().joins.push(seqno);
        Ok(())
    }

    fn set_initial_position(&self, _uuid: Option<Uuid>, seqno: Position) {
        let mut inner = self.lock();
        inner.next_global = inner.next_global.max(seqno.get() + 1);
    }

    fn set_last_applied(&self, seqno: Position) {
        self.lock().last_applied.push(seqno);
    }

    fn queue_len(&self) -> usize {
        self.lock().queue.len()
    }
}

// ---------------------------------------------------------------------------
// Recording applier with per-seqno gates and scripted failures
// ---------------------------------------------------------------------------

struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut open = self.open.lock().expect("gate lock");
        while !*open {
            open = self.cond.wait(open).expect("gate lock");
        }
    }

    fn release(&self) {
        *self.open.lock().expect("gate lock") = true;
        self.cond.notify_all();
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedRecord {
    pub global: u64,
    pub text: String,
}

#[derive(Default)]
struct RecordingApplierInner {
    applied: Vec<AppliedRecord>,
    fail_counts: HashMap<u64, u32>,
}

/// Records every apply call; can block a seqno behind a gate or fail its
/// first N attempts.
#[derive(Default)]
pub struct RecordingApplier {
    inner: Mutex<RecordingApplierInner>,
    gates: Mutex<HashMap<u64, Arc<Gate>>>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks the first apply call for `global` until `release` is called.
    pub fn hold(&self, global: u64) -> impl Fn() + Send + Sync + 'static {
        let gate = Arc::new(Gate::new());
        self.gates
            .lock()
            .expect("gates lock")
            .insert(global, Arc::clone(&gate));
        move || gate.release()
    }

    /// Fails the first `attempts` non-control applies for `global`.
    pub fn fail_attempts(&self, global: u64, attempts: u32) {
        self.inner
            .lock()
            .expect("applier lock")
            .fail_counts
            .insert(global, attempts);
    }

    pub fn applied(&self) -> Vec<AppliedRecord> {
        self.inner.lock().expect("applier lock").applied.clone()
    }

    /// Applied entries excluding the commit/rollback control statements.
    pub fn applied_payloads(&self) -> Vec<AppliedRecord> {
        self.applied()
            .into_iter()
            .filter(|record| record.text != "commit\0" && record.text != "rollback\0")
            .collect()
    }
}

impl Applier for RecordingApplier {
    fn apply(&self, data: ApplyData<'_>, global: GlobalSeqno) -> Result<(), ApplyError> {
        let text = match data {
            ApplyData::Statement { query, .. } => String::from_utf8_lossy(query).into_owned(),
            ApplyData::RowData(buffer) => format!("row:{}", buffer.len()),
        };
        let control = text == "commit\0" || text == "rollback\0";

        if !control {
            let gate = self
                .gates
                .lock()
                .expect("gates lock")
                .get(&global.get())
                .cloned();
            if let Some(gate) = gate {
                gate.wait();
            }

            let mut inner = self.inner.lock().expect("applier lock");
            if let Some(remaining) = inner.fail_counts.get_mut(&global.get()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ApplyError::Failed {
                        reason: "scripted failure".to_string(),
                    });
                }
            }
            inner.applied.push(AppliedRecord {
                global: global.get(),
                text,
            });
            return Ok(());
        }

        self.inner
            .lock()
            .expect("applier lock")
            .applied
            .push(AppliedRecord {
                global: global.get(),
                text,
            });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording host hooks
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingHooks {
    pub synced_count: AtomicU64,
    views: Mutex<Vec<ViewInfo>>,
    donations: Mutex<Vec<(Bytes, Option<Uuid>, Position)>>,
    sst_request: Mutex<Option<Bytes>>,
}

impl RecordingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sst_request(&self, request: Bytes) {
        *self.sst_request.lock().expect("request lock") = Some(request);
    }

    pub fn views(&self) -> Vec<ViewInfo> {
        self.views.lock().expect("views lock").clone()
    }

    pub fn donations(&self) -> Vec<(Bytes, Option<Uuid>, Position)> {
        self.donations.lock().expect("donations lock").clone()
    }
}

impl HostHooks for RecordingHooks {
    fn view(&self, info: &ViewInfo) -> Option<Bytes> {
        self.views.lock().expect("views lock").push(info.clone());
        if info.state_gap {
            self.sst_request.lock().expect("request lock").clone()
        } else {
            None
        }
    }

    fn sst_donate(
        &self,
        request: &[u8],
        group_uuid: Option<Uuid>,
        seqno: Position,
        _bypass: bool,
    ) -> Result<(), HookError> {
        self.donations.lock().expect("donations lock").push((
            Bytes::copy_from_slice(request),
            group_uuid,
            seqno,
        ));
        Ok(())
    }

    fn synced(&self) {
        self.synced_count.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Node harness
// ---------------------------------------------------------------------------

pub struct TestNode {
    pub replicator: Arc<Replicator>,
    pub gcs: Arc<MockGcs>,
    pub hooks: Arc<RecordingHooks>,
    pub applier: Arc<RecordingApplier>,
    recv_threads: Vec<JoinHandle<ReplResult<()>>>,
    _dir: tempfile::TempDir,
}

impl TestNode {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let config = Config {
            node_name: "test-node".to_string(),
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        Self::with_config(config, dir)
    }

    pub fn with_config(config: Config, dir: tempfile::TempDir) -> Self {
        let gcs = Arc::new(MockGcs::new());
        let hooks = Arc::new(RecordingHooks::new());
        let replicator = Arc::new(Replicator::new(
            config,
            Arc::clone(&gcs) as Arc<dyn GroupComm>,
            Arc::clone(&hooks) as Arc<dyn HostHooks>,
        ));
        Self {
            replicator,
            gcs,
            hooks,
            applier: Arc::new(RecordingApplier::new()),
            recv_threads: Vec::new(),
            _dir: dir,
        }
    }

    pub fn data_dir(&self) -> std::path::PathBuf {
        self._dir.path().to_path_buf()
    }

    pub fn start_recv_threads(&mut self, count: usize) {
        for i in 0..count {
            let replicator = Arc::clone(&self.replicator);
            let applier = Arc::clone(&self.applier);
            let handle = thread::Builder::new()
                .name(format!("recv-{i}"))
                .spawn(move || replicator.async_recv(applier.as_ref()))
                .expect("spawn recv thread");
            self.recv_threads.push(handle);
        }
    }

    /// Connects and drives the node to SYNCED through a bootstrap view.
    pub fn bootstrap_synced(&mut self, group: Uuid, seqno: u64, recv_threads: usize) {
        self.replicator
            .connect("test-cluster", "mock://", "")
            .expect("connect");
        self.start_recv_threads(recv_threads);
        self.gcs.inject_conf(primary_view(group, seqno, MemberState::Synced, 1));
        let hooks = Arc::clone(&self.hooks);
        wait_until(Duration::from_secs(5), || {
            hooks.synced_count.load(Ordering::SeqCst) > 0
        });
    }

    /// Joins the receive threads and returns their results.
    pub fn join_recv_threads(&mut self) -> Vec<ReplResult<()>> {
        self.recv_threads
            .drain(..)
            .map(|handle| handle.join().expect("join recv thread"))
            .collect()
    }

    /// Closes the node and joins the receive threads. Returns the data
    /// directory so callers can inspect what the node left on disk.
    pub fn shutdown(mut self) -> tempfile::TempDir {
        self.replicator.close().expect("close");
        for handle in self.recv_threads.drain(..) {
            let _ = handle.join().expect("join recv thread");
        }
        wait_until(Duration::from_secs(5), || {
            self.replicator.node_state() == wsrepl::NodeState::Closed
        });
        self._dir
    }
}

pub fn primary_view(group: Uuid, seqno: u64, my_state: MemberState, conf_id: i64) -> ConfView {
    ConfView {
        conf_id,
        group_uuid: Some(group),
        seqno: Position::new(seqno),
        my_idx: Some(0),
        my_state,
        members: vec![MemberInfo {
            id: NodeId::new(Uuid::from_bytes([0xAA; 16])),
            name: "test-node".to_string(),
            incoming: "127.0.0.1:0".to_string(),
        }],
    }
}

// ---------------------------------------------------------------------------
// Wire payload builders for remote transactions
// ---------------------------------------------------------------------------

pub fn remote_trx_payload(trx_id: u64, keys: &[&str], last_seen: u64) -> Bytes {
    let write_sets = keys
        .iter()
        .map(|key| {
            WriteSet::statements(
                vec![WriteKey::from(*key)],
                vec![Statement::new(
                    Bytes::from(format!("write {key}")),
                    1_700_000_000,
                    42,
                )],
            )
        })
        .collect();
    encode_payload(WireSource::Trx(TrxId::new(trx_id)), write_sets, last_seen, None)
}

pub fn remote_conn_payload(
    conn_id: u64,
    keys: &[&str],
    last_seen: u64,
    ctx: Option<&str>,
) -> Bytes {
    let write_sets = keys
        .iter()
        .map(|key| {
            WriteSet::statements(
                vec![WriteKey::from(*key)],
                vec![Statement::new(Bytes::from(format!("ddl {key}")), 0, 0)],
            )
        })
        .collect();
    encode_payload(
        WireSource::Conn(ConnId::new(conn_id)),
        write_sets,
        last_seen,
        ctx.map(|c| Bytes::copy_from_slice(c.as_bytes())),
    )
}

fn encode_payload(
    source: WireSource,
    write_sets: Vec<WriteSet>,
    last_seen: u64,
    conn_ctx: Option<Bytes>,
) -> Bytes {
    let collection = WireCollection {
        header: WireHeader {
            version: codec::WIRE_VERSION,
            node: NodeId::new(Uuid::from_bytes([0xBB; 16])),
            source,
            last_seen: Position::new(last_seen),
            commit_intent: true,
            conn_ctx,
        },
        write_sets,
    };
    codec::encode_collection(&collection).expect("encode payload")
}
