#![forbid(unsafe_code)]

//! Synchronous multi-master write-set replication core.
//!
//! A host database embeds this crate to replicate transactions through a
//! totally-ordered group broadcast: local write-sets are broadcast,
//! optimistically certified against the global order, and applied with as
//! much parallelism as their conflict sets allow. Conflicting local
//! transactions are brute-force aborted and replayed.

pub mod cert;
pub mod config;
pub mod core;
pub mod error;
pub mod gcs;
pub mod hooks;
pub mod monitor;
pub mod replicator;
pub mod telemetry;
pub mod wsdb;

pub use error::{ReplError, ReplResult};

// Re-export the host-facing surface at the crate root.
pub use crate::cert::{Certification, TestResult};
pub use crate::config::{Config, LoggingConfig, ReplicationTuning};
pub use crate::core::{
    ConnId, GlobalSeqno, LocalSeqno, NodeId, Position, Statement, TrxHandle, TrxId, TrxState,
    WriteKey, WriteSet, WriteSetData,
};
pub use crate::gcs::{Action, ConfView, GcsError, GroupComm, MemberInfo, MemberState, ViewInfo};
pub use crate::hooks::{Applier, ApplyData, ApplyError, HookError, HostHooks};
pub use crate::monitor::{ApplyOrder, Interrupted, LocalOrder, Monitor, MonitorStats, Order};
pub use crate::replicator::{MemberStatus, NodeState, Replicator, StatusSnapshot};
pub use crate::wsdb::Wsdb;
