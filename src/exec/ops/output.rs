//! The output operator: the push boundary of the engine.
//!
//! Serializes each element into the wire layout (timestamp, sign byte,
//! packed columns) and hands it to the external [`QueryOutput`]. A failing
//! sink terminates execution; there is nowhere to put its tuples.

use crate::error::RilletError;
use crate::exec::ops::TimeSlice;
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::interface::{QueryOutput, SIGN_MINUS, SIGN_PLUS, encode_output};
use crate::layout::TupleLayout;
use crate::types::{Attr, Timestamp};

pub struct OutputOp {
    pub id: usize,
    input: usize,
    schema: Vec<Attr>,
    tuple_layout: TupleLayout,
    sink: Box<dyn QueryOutput>,
    buf: Vec<u8>,
    last_input_ts: Timestamp,
}

impl std::fmt::Debug for OutputOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputOp").field("id", &self.id).finish()
    }
}

impl OutputOp {
    pub fn new(id: usize, input: usize, schema: Vec<Attr>, sink: Box<dyn QueryOutput>) -> Self {
        let tuple_layout = TupleLayout::for_schema(&schema);
        Self {
            id,
            input,
            schema,
            tuple_layout,
            sink,
            buf: Vec::new(),
            last_input_ts: 0,
        }
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        for _ in 0..slice {
            let Some(element) = rt.queues[self.input].dequeue() else {
                break;
            };
            self.last_input_ts = element.timestamp();

            let (tuple, ts, sign) = match element {
                Element::Heartbeat { .. } => continue,
                Element::Plus { tuple, ts } => (tuple, ts, SIGN_PLUS),
                Element::Minus { tuple, ts } => (tuple, ts, SIGN_MINUS),
            };

            encode_output(
                &self.schema,
                &self.tuple_layout,
                rt.stores.tuple(tuple),
                ts,
                sign,
                &mut self.buf,
            );
            self.sink.put_next(&self.buf)?;
            rt.decr_ref(tuple);
        }
        Ok(())
    }
}
