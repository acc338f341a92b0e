//! The partition window: logically one row window per partition key.
//!
//! The operator copies each input tuple into its own store (input and
//! window storage stay independent) and inserts the copy into a
//! partition-window synopsis keyed by the declared partition columns. When
//! a partition exceeds N tuples its oldest is evicted; the MINUS follows
//! the triggering PLUS with the same timestamp.

use crate::error::RilletError;
use crate::exec::eval::{AEval, EvalContext, Role};
use crate::exec::ops::{Pending, TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct PartnWindow {
    pub id: usize,
    input: usize,
    output: usize,
    window_size: usize,
    win_syn: usize,
    out_store: u32,
    copy_eval: AEval,
    ctx: EvalContext,
    pending: Pending,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl PartnWindow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        input: usize,
        output: usize,
        window_size: usize,
        win_syn: usize,
        out_store: u32,
        copy_eval: AEval,
        ctx: EvalContext,
    ) -> Self {
        debug_assert!(window_size > 0);
        Self {
            id,
            input,
            output,
            window_size,
            win_syn,
            out_store,
            copy_eval,
            ctx,
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
                        "partition window received a MINUS; its input must be a stream".into(),
                    ));
                }
                Element::Plus { tuple, ts } => {
                    let copy = rt.new_tuple(self.out_store)?;
                    self.ctx.bind(Role::Input, tuple);
                    self.ctx.bind(Role::Copy, copy);
                    self.copy_eval.eval(&mut self.ctx, &mut rt.stores);

                    rt.add_ref(copy);
                    rt.pwin_insert(self.win_syn, copy);
                    self.pending.push(Element::Plus { tuple: copy, ts });

                    debug_assert!(rt.pwin_size(self.win_syn, copy) <= self.window_size + 1);
                    if rt.pwin_size(self.win_syn, copy) == self.window_size + 1 {
                        let oldest = rt.pwin_delete_oldest(self.win_syn, copy)?;
                        self.pending.push(Element::Minus { tuple: oldest, ts });
                    }

                    rt.decr_ref(tuple);
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
