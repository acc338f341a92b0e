//! The row window: stream → relation keeping the most recent N tuples.
//!
//! Each PLUS is inserted into the window synopsis and forwarded. Once the
//! window holds N tuples, every arrival first evicts the oldest — the
//! MINUS goes out ahead of the new PLUS, both carrying the arrival's
//! timestamp. MINUS input is disallowed: windows read streams.

use crate::error::RilletError;
use crate::exec::ops::{Pending, TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct RowWindow {
    pub id: usize,
    input: usize,
    output: usize,
    window_size: usize,
    win_syn: usize,
    pending: Pending,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl RowWindow {
    pub fn new(id: usize, input: usize, output: usize, window_size: usize, win_syn: usize) -> Self {
        debug_assert!(window_size > 0);
        Self {
            id,
            input,
            output,
            window_size,
            win_syn,
            pending: Pending::default(),
            last_input_ts: 0,
            last_output_ts: 0,
        }
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

            match element {
                Element::Heartbeat { .. } => continue,
                Element::Minus { .. } => {
                    return Err(RilletError::InternalError(
                        "row window received a MINUS; its input must be a stream".into(),
                    ));
                }
                Element::Plus { tuple, ts } => {
                    rt.add_ref(tuple);
                    rt.win_insert(self.win_syn, tuple, ts);

                    if rt.win_len(self.win_syn) > self.window_size {
                        // The synopsis reference rides out on the MINUS.
                        let oldest = rt.win_delete_oldest(self.win_syn).ok_or_else(|| {
                            RilletError::InternalError("row window lost its oldest tuple".into())
                        })?;
                        self.pending.push(Element::Minus { tuple: oldest, ts });
                    }
                    self.pending.push(Element::Plus { tuple, ts });

                    if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                        return Ok(());
                    }
                }
            }
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }
}
