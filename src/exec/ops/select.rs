//! The selection operator.
//!
//! Forwards elements whose tuple satisfies the predicate, unchanged and by
//! reference — selection never allocates. Failing tuples lose the
//! element's reference, since nothing downstream will hold them.

use crate::error::RilletError;
use crate::exec::eval::{BEval, EvalContext, Role};
use crate::exec::ops::{TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Select {
    pub id: usize,
    input: usize,
    output: usize,
    pred: BEval,
    ctx: EvalContext,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Select {
    pub fn new(id: usize, input: usize, output: usize, pred: BEval, ctx: EvalContext) -> Self {
        Self {
            id,
            input,
            output,
            pred,
            ctx,
            last_input_ts: 0,
            last_output_ts: 0,
        }
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        for _ in 0..slice {
            // Blocked at the output queue.
            if rt.queues[self.output].is_full() {
                break;
            }
            let Some(element) = rt.queues[self.input].dequeue() else {
                break;
            };
            self.last_input_ts = element.timestamp();

            let Some(tuple) = element.tuple() else {
                // Heartbeats carry no data to filter.
                continue;
            };

            self.ctx.bind(Role::Input, tuple);
            if self.pred.eval(&mut self.ctx, &mut rt.stores) {
                rt.queues[self.output].enqueue(element);
                self.last_output_ts = element.timestamp();
            } else {
                rt.decr_ref(tuple);
            }
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }
}
