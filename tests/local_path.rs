//! Local replication path: replicate, certify, commit, abort, replay.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use wsrepl::core::{ConnId, Position, TrxId, TrxState, WriteKey};
use wsrepl::gcs::GcsError;
use wsrepl::ReplError;

use common::{remote_conn_payload, wait_until, TestNode};

fn group() -> Uuid {
    Uuid::from_bytes([0x11; 16])
}

#[test]
fn solo_replicate_commit() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);

    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    trx.append_statement(
        vec![WriteKey::from("k1")],
        Bytes::from_static(b"insert into t values (1)"),
        1_700_000_000,
        7,
    );
    trx.set_commit_intent(true);

    node.replicator.replicate(&trx).expect("replicate");
    assert_eq!(trx.state(), TrxState::Replicated);
    assert_eq!(trx.global_seqno().expect("global seqno").get(), 1);

    node.replicator.pre_commit(&trx).expect("pre_commit");
    assert_eq!(trx.state(), TrxState::Applying);
    assert_eq!(trx.last_depends(), Some(Position::GENESIS));

    node.replicator.post_commit(&trx).expect("post_commit");
    assert_eq!(trx.state(), TrxState::Committed);

    let status = node.replicator.status();
    assert_eq!(status.replicated, 1);
    assert_eq!(status.local_commits, 1);
    assert_eq!(status.last_committed, 1);
    assert!(status.replicated_bytes > 0);

    node.replicator.discard_local_trx(TrxId::new(1));
    node.shutdown();
}

#[test]
fn local_certification_failure_rolls_back() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);

    let first = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create first");
    first.append_statement(vec![WriteKey::from("k")], Bytes::from_static(b"w1"), 0, 0);
    first.set_commit_intent(true);

    let second = node
        .replicator
        .local_trx(TrxId::new(2), true)
        .expect("create second");
    second.append_statement(vec![WriteKey::from("k")], Bytes::from_static(b"w2"), 0, 0);
    second.set_commit_intent(true);

    // Both replicate before either certifies: both see position 0.
    node.replicator.replicate(&first).expect("replicate first");
    node.replicator.replicate(&second).expect("replicate second");

    node.replicator.pre_commit(&first).expect("pre_commit first");
    node.replicator.post_commit(&first).expect("post_commit first");

    let err = node
        .replicator
        .pre_commit(&second)
        .expect_err("conflicting trx must fail certification");
    assert!(matches!(err, ReplError::TrxFail));
    assert_eq!(second.state(), TrxState::Aborting);
    node.replicator
        .post_rollback(&second)
        .expect("post_rollback");
    assert_eq!(second.state(), TrxState::RolledBack);

    let status = node.replicator.status();
    assert_eq!(status.local_cert_failures, 1);
    assert_eq!(status.local_commits, 1);
    // The failed trx still advanced the apply position via self-cancel.
    assert_eq!(status.last_committed, 2);

    node.shutdown();
}

#[test]
fn bf_abort_leads_to_replay() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);

    // A gated isolated action holds the local monitor through its apply,
    // so the local transaction blocks in certification.
    let release = node.applier.hold(1);
    node.gcs
        .inject_ordered(remote_conn_payload(77, &["ddl-key"], 0, None));

    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    trx.append_statement(vec![WriteKey::from("mine")], Bytes::from_static(b"w"), 0, 0);
    trx.set_commit_intent(true);
    node.replicator.replicate(&trx).expect("replicate");

    let replicator = Arc::clone(&node.replicator);
    let blocked = Arc::clone(&trx);
    let committer = thread::spawn(move || replicator.pre_commit(&blocked));

    wait_until(Duration::from_secs(5), || {
        trx.state() == TrxState::Certifying
    });
    node.replicator.abort(&trx).expect("abort");

    let err = committer
        .join()
        .expect("join committer")
        .expect_err("pre_commit must report brute-force abort");
    assert!(matches!(err, ReplError::BfAbort));
    assert_eq!(trx.state(), TrxState::MustCertAndReplay);

    // Let the isolated action finish, then replay.
    release();
    node.replicator
        .replay(&trx, node.applier.as_ref())
        .expect("replay");
    assert_eq!(trx.state(), TrxState::Replayed);
    node.replicator.post_commit(&trx).expect("post_commit");
    assert_eq!(trx.state(), TrxState::Committed);

    let status = node.replicator.status();
    assert!(status.local_replays >= 1);
    assert!(status.local_bf_aborts >= 1);
    assert_eq!(status.local_commits, 1);
    assert_eq!(status.last_committed, 2);

    node.shutdown();
}

#[test]
fn abort_before_replicate_fails_the_broadcast() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);

    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    trx.append_statement(vec![WriteKey::from("k")], Bytes::from_static(b"w"), 0, 0);
    node.replicator.abort(&trx).expect("abort");
    assert_eq!(trx.state(), TrxState::MustAbort);

    let err = node
        .replicator
        .replicate(&trx)
        .expect_err("replicate after abort must fail");
    assert!(matches!(err, ReplError::TrxFail));
    assert_eq!(trx.state(), TrxState::Aborting);
    node.replicator.post_rollback(&trx).expect("post_rollback");

    node.shutdown();
}

#[test]
fn interrupted_broadcast_aborts_the_transaction() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);
    node.gcs.script_repl_errors([GcsError::Interrupted]);

    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    trx.append_statement(vec![WriteKey::from("k")], Bytes::from_static(b"w"), 0, 0);

    let err = node
        .replicator
        .replicate(&trx)
        .expect_err("interrupted broadcast must fail");
    assert!(matches!(err, ReplError::TrxFail));
    assert_eq!(trx.state(), TrxState::Aborting);

    node.shutdown();
}

#[test]
fn broadcast_backpressure_is_retried() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);
    node.gcs
        .script_repl_errors([GcsError::Again, GcsError::Again]);

    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    trx.append_statement(vec![WriteKey::from("k")], Bytes::from_static(b"w"), 0, 0);
    trx.set_commit_intent(true);

    node.replicator.replicate(&trx).expect("replicate");
    assert_eq!(trx.state(), TrxState::Replicated);
    node.replicator.pre_commit(&trx).expect("pre_commit");
    node.replicator.post_commit(&trx).expect("post_commit");

    node.shutdown();
}

#[test]
fn replicate_refused_before_joined() {
    let node = TestNode::new();
    node.replicator
        .connect("test-cluster", "mock://", "")
        .expect("connect");
    // Still JOINING: replication must be refused.
    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    let err = node
        .replicator
        .replicate(&trx)
        .expect_err("replicate before JOINED must fail");
    assert!(matches!(err, ReplError::TrxFail));
    assert_eq!(trx.state(), TrxState::Executing);
}

#[test]
fn statement_host_keeps_apply_slot_until_rollback() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);

    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    trx.append_statement(vec![WriteKey::from("k")], Bytes::from_static(b"w"), 0, 0);
    // No commit intent: pre_commit parks the trx back in EXECUTING.
    node.replicator.replicate(&trx).expect("replicate");
    node.replicator.pre_commit(&trx).expect("pre_commit");
    assert_eq!(trx.state(), TrxState::Executing);
    assert_eq!(node.replicator.status().last_committed, 0);

    // Rolling back releases the held apply slot and unblocks the order.
    node.replicator.post_rollback(&trx).expect("post_rollback");
    assert_eq!(trx.state(), TrxState::RolledBack);
    assert_eq!(node.replicator.status().last_committed, 1);

    node.shutdown();
}

#[test]
fn second_replicate_on_parked_handle_is_refused() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);

    let trx = node
        .replicator
        .local_trx(TrxId::new(1), true)
        .expect("create trx");
    trx.append_statement(vec![WriteKey::from("k")], Bytes::from_static(b"w"), 0, 0);
    node.replicator.replicate(&trx).expect("replicate");
    node.replicator.pre_commit(&trx).expect("pre_commit");
    assert_eq!(trx.state(), TrxState::Executing);

    // The handle already ordered its collection and still holds its apply
    // slot; another broadcast must be refused, not stacked on top.
    trx.append_statement(vec![WriteKey::from("k2")], Bytes::from_static(b"w2"), 0, 0);
    let err = node
        .replicator
        .replicate(&trx)
        .expect_err("second replicate on the same handle must be refused");
    assert!(matches!(err, ReplError::TrxFail));
    assert_eq!(trx.state(), TrxState::Executing);

    node.replicator.post_rollback(&trx).expect("post_rollback");
    assert_eq!(node.replicator.status().last_committed, 1);

    // The order stayed healthy: a fresh handle replicates and commits.
    let next = node
        .replicator
        .local_trx(TrxId::new(2), true)
        .expect("create next");
    next.append_statement(vec![WriteKey::from("k3")], Bytes::from_static(b"w3"), 0, 0);
    next.set_commit_intent(true);
    node.replicator.replicate(&next).expect("replicate next");
    node.replicator.pre_commit(&next).expect("pre_commit next");
    node.replicator.post_commit(&next).expect("post_commit next");
    assert_eq!(node.replicator.status().last_committed, 2);

    node.shutdown();
}

#[test]
fn isolated_ddl_runs_under_total_order() {
    let mut node = TestNode::new();
    node.bootstrap_synced(group(), 0, 1);

    node.replicator
        .set_default_context(ConnId::new(7), Bytes::from_static(b"use appdb"));
    let trx = node
        .replicator
        .local_conn_trx(ConnId::new(7), true)
        .expect("conn trx");
    trx.append_statement(
        vec![WriteKey::from("t1")],
        Bytes::from_static(b"alter table t1 add column c int"),
        0,
        0,
    );

    node.replicator.replicate(&trx).expect("replicate");
    node.replicator
        .to_isolation_begin(&trx)
        .expect("isolation begin");
    assert_eq!(trx.state(), TrxState::Applying);
    // The host executes the DDL here, alone in the order.
    node.replicator
        .to_isolation_end(&trx)
        .expect("isolation end");
    assert_eq!(trx.state(), TrxState::Committed);
    assert_eq!(node.replicator.status().last_committed, 1);

    // The handle was retired; the next action gets a fresh one that still
    // carries the connection context.
    let again = node
        .replicator
        .local_conn_trx(ConnId::new(7), true)
        .expect("recreate conn trx");
    assert!(!Arc::ptr_eq(&trx, &again));

    node.shutdown();
}

#[test]
fn causal_read_is_not_implemented() {
    let node = TestNode::new();
    let err = node
        .replicator
        .causal_read()
        .expect_err("causal read is unimplemented");
    assert!(matches!(err, ReplError::NotImplemented));
}
