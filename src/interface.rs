//! External interfaces: table suppliers, query outputs, and the wire tuple
//! codec.
//!
//! The engine pulls raw tuples from [`TableSource`] implementations and
//! pushes encoded results to [`QueryOutput`] implementations. Both are
//! supplied by the embedding application (file readers, network
//! connections, test fixtures).
//!
//! # Wire layout
//!
//! Output side: `timestamp:u32 | sign:u8 ('+'/'-') | col_1 | col_2 | …`.
//! Input side for streams: `timestamp | col_1 | …` (sources emit only PLUS
//! and heartbeats, so no sign byte). Input side for relations carries the
//! sign byte so the supplier can request deletions. INT and FLOAT columns
//! are host-endian 4 bytes; BYTE is one byte; CHAR occupies its declared
//! length and is NUL-terminated within it. A heartbeat record is just the
//! 4-byte timestamp.

use crate::error::RilletError;
use crate::layout::{self, TupleLayout};
use crate::types::{Attr, AttrType, Timestamp};

pub const SIGN_PLUS: u8 = b'+';
pub const SIGN_MINUS: u8 = b'-';

/// One record pulled from a table source. The byte buffer is owned by the
/// source and valid only until the next `get_next` call.
#[derive(Debug, Clone, Copy)]
pub struct SourceRecord<'a> {
    pub data: &'a [u8],
    pub is_heartbeat: bool,
}

/// Pull interface delivering raw tuples for one registered stream or
/// relation.
pub trait TableSource: Send {
    /// Called once before the first `get_next`.
    fn start(&mut self) -> Result<(), RilletError>;

    /// Next record if one is available. `Ok(None)` means no tuple is ready
    /// right now — the source operator will try again on a later slice.
    fn get_next(&mut self) -> Result<Option<SourceRecord<'_>>, RilletError>;

    /// Called once when the engine will pull no more tuples.
    fn end(&mut self) -> Result<(), RilletError>;
}

/// Push interface receiving encoded result tuples of one query.
pub trait QueryOutput: Send {
    fn set_num_attrs(&mut self, num_attrs: usize) -> Result<(), RilletError>;

    fn set_attr_info(&mut self, pos: usize, ty: AttrType, len: u32) -> Result<(), RilletError>;

    /// Called once before the first `put_next`.
    fn start(&mut self) -> Result<(), RilletError>;

    /// One encoded output tuple in the wire layout above.
    fn put_next(&mut self, data: &[u8]) -> Result<(), RilletError>;

    /// Called once when the query produces no more tuples.
    fn end(&mut self) -> Result<(), RilletError>;
}

// ── Wire codec ─────────────────────────────────────────────────────────────

/// Packed wire length of the data portion of a schema.
pub fn wire_data_len(schema: &[Attr]) -> usize {
    schema.iter().map(|a| a.ty.size(a.len) as usize).sum()
}

/// Decode the packed data portion of a wire record into an in-memory tuple
/// buffer laid out by `layout`.
pub fn decode_data(
    schema: &[Attr],
    tuple_layout: &TupleLayout,
    wire: &[u8],
    tuple: &mut [u8],
) -> Result<(), RilletError> {
    let expected = wire_data_len(schema);
    if wire.len() < expected {
        return Err(RilletError::SchemaMismatch(format!(
            "wire record has {} data bytes, schema needs {expected}",
            wire.len()
        )));
    }
    let mut off = 0usize;
    for (pos, attr) in schema.iter().enumerate() {
        let col = tuple_layout.column(pos);
        let size = attr.ty.size(attr.len) as usize;
        match attr.ty {
            AttrType::Int => layout::set_icol(
                tuple,
                col,
                i32::from_ne_bytes([wire[off], wire[off + 1], wire[off + 2], wire[off + 3]]),
            ),
            AttrType::Float => layout::set_fcol(
                tuple,
                col,
                f32::from_ne_bytes([wire[off], wire[off + 1], wire[off + 2], wire[off + 3]]),
            ),
            AttrType::Byte => layout::set_bcol(tuple, col, wire[off]),
            AttrType::Char => layout::set_ccol(tuple, col, &wire[off..off + size]),
        }
        off += size;
    }
    Ok(())
}

/// Encode an in-memory tuple into the packed output wire layout, sign byte
/// included.
pub fn encode_output(
    schema: &[Attr],
    tuple_layout: &TupleLayout,
    tuple: &[u8],
    ts: Timestamp,
    sign: u8,
    out: &mut Vec<u8>,
) {
    out.clear();
    out.extend_from_slice(&ts.to_ne_bytes());
    out.push(sign);
    for (pos, attr) in schema.iter().enumerate() {
        let col = tuple_layout.column(pos);
        match attr.ty {
            AttrType::Int => out.extend_from_slice(&layout::icol(tuple, col).to_ne_bytes()),
            AttrType::Float => out.extend_from_slice(&layout::fcol(tuple, col).to_ne_bytes()),
            AttrType::Byte => out.push(layout::bcol(tuple, col)),
            AttrType::Char => out.extend_from_slice(layout::ccol(tuple, col, attr.len)),
        }
    }
}

/// Split a stream-input wire record into timestamp and data portion.
pub fn decode_stream_header(wire: &[u8]) -> Result<(Timestamp, &[u8]), RilletError> {
    if wire.len() < 4 {
        return Err(RilletError::SchemaMismatch(
            "stream record shorter than a timestamp".into(),
        ));
    }
    let ts = u32::from_ne_bytes([wire[0], wire[1], wire[2], wire[3]]);
    Ok((ts, &wire[4..]))
}

/// Split a relation-input wire record into timestamp, sign, and data
/// portion.
pub fn decode_relation_header(wire: &[u8]) -> Result<(Timestamp, u8, &[u8]), RilletError> {
    if wire.len() < 5 {
        return Err(RilletError::SchemaMismatch(
            "relation record shorter than timestamp + sign".into(),
        ));
    }
    let ts = u32::from_ne_bytes([wire[0], wire[1], wire[2], wire[3]]);
    let sign = wire[4];
    if sign != SIGN_PLUS && sign != SIGN_MINUS {
        return Err(RilletError::SchemaMismatch(format!(
            "relation record sign byte must be '+' or '-', got 0x{sign:02x}"
        )));
    }
    Ok((ts, sign, &wire[5..]))
}
