//! The range window: stream → relation keeping tuples for a span of
//! logical time.
//!
//! Three modes:
//! - *Sliding* (stride 0): a tuple inserted at `ts` stays until the input
//!   clock passes `ts + size`; its MINUS carries `ts + size`. Size 0 is
//!   the NOW window — a tuple is in the relation only at its own
//!   timestamp.
//! - *Tumbling* (stride > 0): `window_start` advances by the stride
//!   whenever the clock reaches `window_start + size`, expiring everything
//!   older than the new start; those MINUSes carry the current input
//!   timestamp.
//! - *Unbounded*: the identity stream → relation conversion; nothing ever
//!   expires.
//!
//! Expiry sweeps run on every element, heartbeats included, after the new
//! tuple is inserted and before its PLUS is forwarded. Both the sweep and
//! the forward resume from the pending buffer after a stall, keeping the
//! two paths separately restartable.

use crate::error::RilletError;
use crate::exec::ops::{Pending, TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::{TimeDuration, Timestamp};

#[derive(Debug, Clone, Copy)]
pub enum RangeMode {
    Sliding { size: TimeDuration },
    Tumbling { size: TimeDuration, stride: TimeDuration, window_start: Timestamp },
    Unbounded,
}

#[derive(Debug)]
pub struct RangeWindow {
    pub id: usize,
    input: usize,
    output: usize,
    mode: RangeMode,
    /// Window synopsis; `None` only for unbounded mode.
    win_syn: Option<usize>,
    pending: Pending,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl RangeWindow {
    pub fn new(
        id: usize,
        input: usize,
        output: usize,
        mode: RangeMode,
        win_syn: Option<usize>,
    ) -> Self {
        debug_assert!(matches!(mode, RangeMode::Unbounded) == win_syn.is_none());
        Self {
            id,
            input,
            output,
            mode,
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
            debug_assert!(
                !matches!(element, Element::Minus { .. }),
                "range window input must be a stream"
            );
            debug_assert!(self.last_input_ts <= element.timestamp());
            self.last_input_ts = element.timestamp();

            match element {
                Element::Minus { .. } => {
                    return Err(RilletError::InternalError(
                        "range window received a MINUS; its input must be a stream".into(),
                    ));
                }
                Element::Heartbeat { ts } => {
                    if let Some(syn) = self.win_syn {
                        self.expire(rt, syn, ts);
                    }
                }
                Element::Plus { tuple, ts } => {
                    if let Some(syn) = self.win_syn {
                        rt.add_ref(tuple);
                        rt.win_insert(syn, tuple, ts);
                        self.expire(rt, syn, ts);
                    }
                    self.pending.push(Element::Plus { tuple, ts });
                }
            }

            if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                return Ok(());
            }
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }

    /// Move expired tuples from the synopsis into the pending buffer.
    fn expire(&mut self, rt: &mut Runtime, syn: usize, now: Timestamp) {
        match self.mode {
            RangeMode::Unbounded => {}
            RangeMode::Sliding { size } => {
                while let Some((tuple, inserted)) = rt.win_oldest(syn) {
                    let deadline = inserted as u64 + size as u64;
                    if deadline >= now as u64 {
                        break;
                    }
                    rt.win_delete_oldest(syn);
                    // Synopsis reference rides out on the MINUS.
                    self.pending.push(Element::Minus { tuple, ts: deadline as Timestamp });
                }
            }
            RangeMode::Tumbling { size, stride, ref mut window_start } => {
                while now as u64 >= *window_start as u64 + size as u64 {
                    *window_start += stride;
                    let cutoff = *window_start - 1;
                    while let Some((tuple, inserted)) = rt.win_oldest(syn) {
                        if inserted > cutoff {
                            break;
                        }
                        rt.win_delete_oldest(syn);
                        self.pending.push(Element::Minus { tuple, ts: now });
                    }
                }
            }
        }
    }
}
