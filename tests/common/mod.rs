//! Shared fixtures for the integration suites: scripted table sources,
//! collecting query outputs, and wire-record builders.

use std::sync::{Arc, Mutex};

use rillet::error::RilletError;
use rillet::interface::{QueryOutput, SourceRecord, TableSource};
use rillet::types::{Attr, AttrType, Timestamp};

/// A typed column value used by the record builders and the collected
/// output rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    I(i32),
    F(f32),
    B(u8),
    C(String),
}

impl Val {
    pub fn as_i(&self) -> i32 {
        match self {
            Val::I(v) => *v,
            other => panic!("expected INT value, got {other:?}"),
        }
    }

    pub fn as_f(&self) -> f32 {
        match self {
            Val::F(v) => *v,
            other => panic!("expected FLOAT value, got {other:?}"),
        }
    }
}

fn push_vals(buf: &mut Vec<u8>, schema: &[Attr], vals: &[Val]) {
    assert_eq!(schema.len(), vals.len(), "record arity mismatch");
    for (attr, val) in schema.iter().zip(vals) {
        match (attr.ty, val) {
            (AttrType::Int, Val::I(v)) => buf.extend_from_slice(&v.to_ne_bytes()),
            (AttrType::Float, Val::F(v)) => buf.extend_from_slice(&v.to_ne_bytes()),
            (AttrType::Byte, Val::B(v)) => buf.push(*v),
            (AttrType::Char, Val::C(s)) => {
                let mut bytes = vec![0u8; attr.len as usize];
                bytes[..s.len()].copy_from_slice(s.as_bytes());
                buf.extend_from_slice(&bytes);
            }
            (ty, val) => panic!("value {val:?} does not match column type {ty:?}"),
        }
    }
}

/// Wire record for a stream tuple: `ts | cols`.
pub fn stream_rec(schema: &[Attr], ts: Timestamp, vals: &[Val]) -> (Vec<u8>, bool) {
    let mut buf = ts.to_ne_bytes().to_vec();
    push_vals(&mut buf, schema, vals);
    (buf, false)
}

/// Wire record for a relation tuple: `ts | sign | cols`.
pub fn reln_rec(schema: &[Attr], ts: Timestamp, sign: u8, vals: &[Val]) -> (Vec<u8>, bool) {
    let mut buf = ts.to_ne_bytes().to_vec();
    buf.push(sign);
    push_vals(&mut buf, schema, vals);
    (buf, false)
}

/// A heartbeat record: just the timestamp.
pub fn hb_rec(ts: Timestamp) -> (Vec<u8>, bool) {
    (ts.to_ne_bytes().to_vec(), true)
}

/// A table source replaying a fixed list of records.
pub struct VecSource {
    records: Vec<(Vec<u8>, bool)>,
    pos: usize,
    started: bool,
}

impl VecSource {
    pub fn new(records: Vec<(Vec<u8>, bool)>) -> Self {
        Self { records, pos: 0, started: false }
    }
}

impl TableSource for VecSource {
    fn start(&mut self) -> Result<(), RilletError> {
        self.started = true;
        Ok(())
    }

    fn get_next(&mut self) -> Result<Option<SourceRecord<'_>>, RilletError> {
        debug_assert!(self.started, "get_next before start");
        match self.records.get(self.pos) {
            Some((data, hb)) => {
                self.pos += 1;
                Ok(Some(SourceRecord { data, is_heartbeat: *hb }))
            }
            None => Ok(None),
        }
    }

    fn end(&mut self) -> Result<(), RilletError> {
        Ok(())
    }
}

/// One decoded output row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutRow {
    pub ts: Timestamp,
    pub sign: u8,
    pub vals: Vec<Val>,
}

impl OutRow {
    pub fn is_plus(&self) -> bool {
        self.sign == b'+'
    }
}

/// A query output decoding and collecting every row it receives.
#[derive(Clone, Default)]
pub struct VecOutput {
    schema: Arc<Mutex<Vec<Attr>>>,
    rows: Arc<Mutex<Vec<OutRow>>>,
}

impl VecOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the rows received so far.
    pub fn rows(&self) -> Vec<OutRow> {
        self.rows.lock().unwrap().clone()
    }
}

impl QueryOutput for VecOutput {
    fn set_num_attrs(&mut self, n: usize) -> Result<(), RilletError> {
        self.schema.lock().unwrap().reserve(n);
        Ok(())
    }

    fn set_attr_info(&mut self, pos: usize, ty: AttrType, len: u32) -> Result<(), RilletError> {
        let mut schema = self.schema.lock().unwrap();
        assert_eq!(schema.len(), pos, "attr info must arrive in order");
        schema.push(Attr { ty, len });
        Ok(())
    }

    fn start(&mut self) -> Result<(), RilletError> {
        Ok(())
    }

    fn put_next(&mut self, data: &[u8]) -> Result<(), RilletError> {
        let schema = self.schema.lock().unwrap();
        let ts = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        let sign = data[4];
        let mut off = 5usize;
        let mut vals = Vec::with_capacity(schema.len());
        for attr in schema.iter() {
            match attr.ty {
                AttrType::Int => {
                    vals.push(Val::I(i32::from_ne_bytes(
                        data[off..off + 4].try_into().unwrap(),
                    )));
                    off += 4;
                }
                AttrType::Float => {
                    vals.push(Val::F(f32::from_ne_bytes(
                        data[off..off + 4].try_into().unwrap(),
                    )));
                    off += 4;
                }
                AttrType::Byte => {
                    vals.push(Val::B(data[off]));
                    off += 1;
                }
                AttrType::Char => {
                    let raw = &data[off..off + attr.len as usize];
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    vals.push(Val::C(String::from_utf8_lossy(&raw[..end]).into_owned()));
                    off += attr.len as usize;
                }
            }
        }
        self.rows.lock().unwrap().push(OutRow { ts, sign, vals });
        Ok(())
    }

    fn end(&mut self) -> Result<(), RilletError> {
        Ok(())
    }
}
