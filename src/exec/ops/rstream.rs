//! Rstream: relation → stream of the whole relation at every timestamp.
//!
//! The operator maintains a synopsis of the current relation. Whenever
//! input time advances past timestamp T, the relation as of T is emitted
//! in full as stream PLUSes carrying T. Emission points are the input's
//! event timestamps (data or heartbeat) — between events the relation
//! cannot have changed.

use crate::error::RilletError;
use crate::exec::ops::{Pending, TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Rstream {
    pub id: usize,
    input: usize,
    output: usize,
    in_syn: usize,
    cur_ts: Timestamp,
    pending: Pending,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Rstream {
    pub fn new(id: usize, input: usize, output: usize, in_syn: usize) -> Self {
        Self {
            id,
            input,
            output,
            in_syn,
            cur_ts: 0,
            pending: Pending::default(),
            last_input_ts: 0,
            last_output_ts: 0,
        }
    }

    fn advance_to(&mut self, rt: &mut Runtime, ts: Timestamp) {
        if ts <= self.cur_ts {
            return;
        }
        for tuple in rt.rel_entries(self.in_syn) {
            // The tuple stays in the synopsis; the emitted element takes
            // its own reference.
            rt.add_ref(tuple);
            self.pending.push(Element::Plus { tuple, ts: self.cur_ts });
        }
        self.cur_ts = ts;
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
            return Ok(());
        }

        for _ in 0..slice {
            if rt.queues[self.output].is_full() {
                break;
            }
            let Some(element) = rt.queues[self.input].dequeue() else {
                break;
            };
            self.last_input_ts = element.timestamp();
            self.advance_to(rt, element.timestamp());

            match element {
                Element::Heartbeat { .. } => {}
                Element::Plus { tuple, .. } => {
                    rt.rel_insert(self.in_syn, tuple)?;
                }
                Element::Minus { tuple, .. } => {
                    rt.rel_delete(self.in_syn, tuple)?;
                    rt.decr_ref(tuple); // synopsis reference
                    rt.decr_ref(tuple); // element reference
                }
            }

            if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                return Ok(());
            }
        }

        generate_heartbeat(rt, self.output, self.cur_ts, &mut self.last_output_ts);
        Ok(())
    }
}
