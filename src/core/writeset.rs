//! Write-set model: the modifications a transaction replicates.

use std::fmt;

use bytes::Bytes;

/// Opaque key naming a modified database item. Keys are compared bytewise;
/// the replicator attaches no structure to them.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriteKey(Bytes);

impl WriteKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for WriteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "WriteKey({s:?})"),
            Err(_) => write!(f, "WriteKey({:02x?})", &self.0[..]),
        }
    }
}

impl From<&str> for WriteKey {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<&[u8]> for WriteKey {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

/// One query of a statement-level write-set, carrying the metadata needed
/// for deterministic re-execution on every node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Statement {
    pub query: Bytes,
    /// Original execution wall-clock, unix seconds.
    pub timeval: i64,
    pub rand_seed: u64,
}

impl Statement {
    pub fn new(query: impl Into<Bytes>, timeval: i64, rand_seed: u64) -> Self {
        Self {
            query: query.into(),
            timeval,
            rand_seed,
        }
    }
}

/// Payload of one write-set entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteSetData {
    /// Opaque row-image buffer, delivered to the host in a single apply call.
    Data(Bytes),
    /// Ordered statement sequence, re-executed query by query.
    Statements(Vec<Statement>),
}

impl WriteSetData {
    pub fn level(&self) -> u8 {
        match self {
            WriteSetData::Data(_) => 0,
            WriteSetData::Statements(_) => 1,
        }
    }
}

/// One (key-set, payload) entry of a replicated write-set collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteSet {
    pub keys: Vec<WriteKey>,
    pub data: WriteSetData,
}

impl WriteSet {
    pub fn data(keys: Vec<WriteKey>, buffer: impl Into<Bytes>) -> Self {
        Self {
            keys,
            data: WriteSetData::Data(buffer.into()),
        }
    }

    pub fn statements(keys: Vec<WriteKey>, statements: Vec<Statement>) -> Self {
        Self {
            keys,
            data: WriteSetData::Statements(statements),
        }
    }

    pub fn payload_len(&self) -> usize {
        match &self.data {
            WriteSetData::Data(buf) => buf.len(),
            WriteSetData::Statements(stmts) => stmts.iter().map(|s| s.query.len()).sum(),
        }
    }
}
