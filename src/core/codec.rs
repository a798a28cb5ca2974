//! Wire codec for replicated write-set collections.
//!
//! A collection is the unit handed to the group communication layer: a
//! transaction header followed by the ordered write-set entries. The encoding
//! is CBOR with definite lengths only; statement metadata (timestamp, random
//! seed) round-trips bit-exact.

use std::convert::Infallible;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use uuid::Uuid;

use super::seqno::{ConnId, NodeId, Position, TrxId};
use super::writeset::{Statement, WriteKey, WriteSet, WriteSetData};

pub const WIRE_VERSION: u32 = 1;

const LEVEL_DATA: u8 = 0;
const LEVEL_STATEMENT: u8 = 1;

/// Identity a write-set collection replicates under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireSource {
    /// Ordinary transaction.
    Trx(TrxId),
    /// Isolated connection action (DDL).
    Conn(ConnId),
}

/// Decoded transaction header of a collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireHeader {
    pub version: u32,
    pub node: NodeId,
    pub source: WireSource,
    pub last_seen: Position,
    pub commit_intent: bool,
    /// Connection default context replicated ahead of isolated actions.
    pub conn_ctx: Option<Bytes>,
}

/// A decoded collection: header plus ordered write-set entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireCollection {
    pub header: WireHeader,
    pub write_sets: Vec<WriteSet>,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown write-set level {0}")]
    UnknownLevel(u8),
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("trailing bytes after collection")]
    TrailingBytes,
}

pub fn encode_collection(collection: &WireCollection) -> Result<Bytes, CodecError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);

    enc.array(3)?;
    enc.u32(collection.header.version)?;
    encode_header(&mut enc, &collection.header)?;

    enc.array(collection.write_sets.len() as u64)?;
    for ws in &collection.write_sets {
        encode_write_set(&mut enc, ws)?;
    }

    Ok(Bytes::from(buf))
}

pub fn decode_collection(bytes: &[u8]) -> Result<WireCollection, CodecError> {
    let mut dec = Decoder::new(bytes);

    let outer = decode_array_len(&mut dec, "collection")?;
    if outer != 3 {
        return Err(CodecError::InvalidField {
            field: "collection",
            reason: format!("expected 3 elements, got {outer}"),
        });
    }

    let version = dec.u32()?;
    if version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let header = decode_header(&mut dec, version)?;

    let count = decode_array_len(&mut dec, "write_sets")?;
    let mut write_sets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        write_sets.push(decode_write_set(&mut dec)?);
    }

    if dec.datatype().is_ok() {
        return Err(CodecError::TrailingBytes);
    }

    Ok(WireCollection { header, write_sets })
}

fn encode_header(
    enc: &mut Encoder<&mut Vec<u8>>,
    header: &WireHeader,
) -> Result<(), CodecError> {
    enc.array(6)?;
    enc.bytes(header.node.get().as_bytes())?;
    match header.source {
        WireSource::Trx(trx_id) => {
            enc.u8(0)?;
            enc.u64(trx_id.get())?;
        }
        WireSource::Conn(conn_id) => {
            enc.u8(1)?;
            enc.u64(conn_id.get())?;
        }
    }
    enc.u64(header.last_seen.get())?;
    enc.bool(header.commit_intent)?;
    match &header.conn_ctx {
        Some(ctx) => {
            enc.bytes(ctx)?;
        }
        None => {
            enc.null()?;
        }
    }
    Ok(())
}

fn decode_header(dec: &mut Decoder<'_>, version: u32) -> Result<WireHeader, CodecError> {
    let len = decode_array_len(dec, "header")?;
    if len != 6 {
        return Err(CodecError::InvalidField {
            field: "header",
            reason: format!("expected 6 elements, got {len}"),
        });
    }

    let node = decode_uuid(dec, "node")?;
    let kind = dec.u8()?;
    let id = dec.u64()?;
    let source = match kind {
        0 => WireSource::Trx(TrxId::new(id)),
        1 => WireSource::Conn(ConnId::new(id)),
        other => {
            return Err(CodecError::InvalidField {
                field: "source",
                reason: format!("unknown source kind {other}"),
            });
        }
    };
    let last_seen = Position::new(dec.u64()?);
    let commit_intent = dec.bool()?;
    let conn_ctx = match dec.datatype()? {
        Type::Null => {
            dec.null()?;
            None
        }
        _ => Some(Bytes::copy_from_slice(dec.bytes()?)),
    };

    Ok(WireHeader {
        version,
        node: NodeId::new(node),
        source,
        last_seen,
        commit_intent,
        conn_ctx,
    })
}

fn encode_write_set(enc: &mut Encoder<&mut Vec<u8>>, ws: &WriteSet) -> Result<(), CodecError> {
    enc.array(3)?;
    enc.u8(ws.data.level())?;

    enc.array(ws.keys.len() as u64)?;
    for key in &ws.keys {
        enc.bytes(key.as_bytes())?;
    }

    match &ws.data {
        WriteSetData::Data(buf) => {
            enc.bytes(buf)?;
        }
        WriteSetData::Statements(stmts) => {
            enc.array(stmts.len() as u64)?;
            for stmt in stmts {
                enc.array(3)?;
                enc.bytes(&stmt.query)?;
                enc.i64(stmt.timeval)?;
                enc.u64(stmt.rand_seed)?;
            }
        }
    }
    Ok(())
}

fn decode_write_set(dec: &mut Decoder<'_>) -> Result<WriteSet, CodecError> {
    let len = decode_array_len(dec, "write_set")?;
    if len != 3 {
        return Err(CodecError::InvalidField {
            field: "write_set",
            reason: format!("expected 3 elements, got {len}"),
        });
    }

    let level = dec.u8()?;

    let key_count = decode_array_len(dec, "keys")?;
    let mut keys = Vec::with_capacity(key_count as usize);
    for _ in 0..key_count {
        keys.push(WriteKey::new(Bytes::copy_from_slice(dec.bytes()?)));
    }

    let data = match level {
        LEVEL_DATA => WriteSetData::Data(Bytes::copy_from_slice(dec.bytes()?)),
        LEVEL_STATEMENT => {
            let count = decode_array_len(dec, "statements")?;
            let mut statements = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let stmt_len = decode_array_len(dec, "statement")?;
                if stmt_len != 3 {
                    return Err(CodecError::InvalidField {
                        field: "statement",
                        reason: format!("expected 3 elements, got {stmt_len}"),
                    });
                }
                let query = Bytes::copy_from_slice(dec.bytes()?);
                let timeval = dec.i64()?;
                let rand_seed = dec.u64()?;
                statements.push(Statement {
                    query,
                    timeval,
                    rand_seed,
                });
            }
            WriteSetData::Statements(statements)
        }
        other => return Err(CodecError::UnknownLevel(other)),
    };

    Ok(WriteSet { keys, data })
}

/// Commit-cut payload: the purge position, big-endian u64.
pub fn encode_commit_cut(cut: Position) -> Bytes {
    Bytes::copy_from_slice(&cut.get().to_be_bytes())
}

pub fn decode_commit_cut(bytes: &[u8]) -> Result<Position, CodecError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| CodecError::InvalidField {
        field: "commit_cut",
        reason: format!("expected 8 bytes, got {}", bytes.len()),
    })?;
    Ok(Position::new(u64::from_be_bytes(raw)))
}

fn decode_array_len(dec: &mut Decoder<'_>, field: &'static str) -> Result<u64, CodecError> {
    match dec.array()? {
        Some(len) => Ok(len),
        None => Err(CodecError::InvalidField {
            field,
            reason: "indefinite-length array".to_string(),
        }),
    }
}

fn decode_uuid(dec: &mut Decoder<'_>, field: &'static str) -> Result<Uuid, CodecError> {
    let raw = dec.bytes()?;
    Uuid::from_slice(raw).map_err(|err| CodecError::InvalidField {
        field,
        reason: err.to_string(),
    })
}
