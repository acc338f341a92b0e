//! Source operators: the pull boundary of the engine.
//!
//! A source drains its external [`TableSource`] only while the output
//! queue has room — the supplier's buffer is valid until the next
//! `get_next`, so each record is decoded into a store tuple immediately.
//! Suppliers deliver timestamps that should be non-decreasing; a
//! regression is clamped to the previous timestamp and logged.
//!
//! Stream sources emit only PLUS and heartbeats. Relation sources carry a
//! sign byte on the wire; a '-' record is matched by value against the
//! source's output synopsis so the MINUS can reference the stored tuple.

use crate::error::RilletError;
use crate::exec::eval::Role;
use crate::exec::ops::{TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::interface::{self, SIGN_MINUS, TableSource};
use crate::layout::TupleLayout;
use crate::types::{Attr, Timestamp};

/// Clamp a supplier timestamp against the last one seen.
fn monotonic(source_id: usize, ts: Timestamp, last: Timestamp) -> Timestamp {
    if ts < last {
        tracing::warn!(source = source_id, ts, last, "source timestamp regression; clamping");
        last
    } else {
        ts
    }
}

// ── Stream source ──────────────────────────────────────────────────────────

pub struct StreamSource {
    pub id: usize,
    output: usize,
    out_store: u32,
    schema: Vec<Attr>,
    tuple_layout: TupleLayout,
    src: Box<dyn TableSource>,
    started: bool,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource").field("id", &self.id).finish()
    }
}

impl StreamSource {
    pub fn new(
        id: usize,
        output: usize,
        out_store: u32,
        schema: Vec<Attr>,
        src: Box<dyn TableSource>,
    ) -> Self {
        let tuple_layout = TupleLayout::for_schema(&schema);
        Self {
            id,
            output,
            out_store,
            schema,
            tuple_layout,
            src,
            started: false,
            last_input_ts: 0,
            last_output_ts: 0,
        }
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        if !self.started {
            self.src.start()?;
            self.started = true;
        }
        for _ in 0..slice {
            if rt.queues[self.output].is_full() {
                break;
            }
            let Some(record) = self.src.get_next()? else {
                break;
            };

            if record.is_heartbeat {
                let (ts, _) = interface::decode_stream_header(record.data)?;
                let ts = monotonic(self.id, ts, self.last_input_ts);
                self.last_input_ts = ts;
                rt.queues[self.output].enqueue(Element::Heartbeat { ts });
                self.last_output_ts = ts;
                continue;
            }

            let (ts, data) = interface::decode_stream_header(record.data)?;
            let ts = monotonic(self.id, ts, self.last_input_ts);
            self.last_input_ts = ts;

            let tuple = rt.stores.new_tuple(self.out_store, &mut rt.mem)?;
            interface::decode_data(
                &self.schema,
                &self.tuple_layout,
                data,
                rt.stores.tuple_mut(tuple),
            )?;
            rt.queues[self.output].enqueue(Element::Plus { tuple, ts });
            self.last_output_ts = ts;
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }
}

// ── Relation source ────────────────────────────────────────────────────────

pub struct RelnSource {
    pub id: usize,
    output: usize,
    out_store: u32,
    /// Output synopsis, value-indexed, so '-' records can locate the
    /// stored tuple they retract.
    out_syn: usize,
    out_index: usize,
    schema: Vec<Attr>,
    tuple_layout: TupleLayout,
    src: Box<dyn TableSource>,
    started: bool,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl std::fmt::Debug for RelnSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelnSource").field("id", &self.id).finish()
    }
}

impl RelnSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        output: usize,
        out_store: u32,
        out_syn: usize,
        out_index: usize,
        schema: Vec<Attr>,
        src: Box<dyn TableSource>,
    ) -> Self {
        let tuple_layout = TupleLayout::for_schema(&schema);
        Self {
            id,
            output,
            out_store,
            out_syn,
            out_index,
            schema,
            tuple_layout,
            src,
            started: false,
            last_input_ts: 0,
            last_output_ts: 0,
        }
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        if !self.started {
            self.src.start()?;
            self.started = true;
        }
        for _ in 0..slice {
            if rt.queues[self.output].is_full() {
                break;
            }
            let Some(record) = self.src.get_next()? else {
                break;
            };

            if record.is_heartbeat {
                let (ts, _) = interface::decode_stream_header(record.data)?;
                let ts = monotonic(self.id, ts, self.last_input_ts);
                self.last_input_ts = ts;
                rt.queues[self.output].enqueue(Element::Heartbeat { ts });
                self.last_output_ts = ts;
                continue;
            }

            let (ts, sign, data) = interface::decode_relation_header(record.data)?;
            let ts = monotonic(self.id, ts, self.last_input_ts);
            self.last_input_ts = ts;

            let tuple = rt.stores.new_tuple(self.out_store, &mut rt.mem)?;
            interface::decode_data(
                &self.schema,
                &self.tuple_layout,
                data,
                rt.stores.tuple_mut(tuple),
            )?;

            if sign == SIGN_MINUS {
                // Locate the previously asserted tuple with these values.
                let hit = rt
                    .index_probe(self.out_index, &[(Role::Input, tuple)])
                    .first()
                    .copied();
                rt.decr_ref(tuple);
                match hit {
                    Some(stored) => {
                        rt.rel_delete(self.out_syn, stored)?;
                        // The synopsis reference rides out on the MINUS.
                        rt.queues[self.output].enqueue(Element::Minus { tuple: stored, ts });
                        self.last_output_ts = ts;
                    }
                    None => {
                        tracing::warn!(
                            source = self.id,
                            "relation source: '-' record with no matching tuple; dropped"
                        );
                    }
                }
            } else {
                rt.add_ref(tuple);
                rt.rel_insert(self.out_syn, tuple)?;
                rt.queues[self.output].enqueue(Element::Plus { tuple, ts });
                self.last_output_ts = ts;
            }
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }
}
