//! Union of two compatible inputs.
//!
//! Elements from both sides are merged in timestamp order (left first on
//! ties) and rewritten into output-store tuples via per-side copy
//! programs. When the result is relation-valued, a lineage synopsis pairs
//! each output with the input tuple that produced it so MINUSes can be
//! retracted; pure stream unions carry no synopsis and accept no MINUS.

use crate::error::RilletError;
use crate::exec::eval::{AEval, EvalContext, Role};
use crate::exec::ops::{Side, TimeSlice, generate_heartbeat, next_side};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::exec::store::TuplePtr;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Union {
    pub id: usize,
    left_q: usize,
    right_q: usize,
    output: usize,
    out_store: u32,
    /// Lineage synopsis; present iff the output is relation-valued.
    out_syn: Option<usize>,
    left_eval: AEval,
    right_eval: AEval,
    ctx: EvalContext,
    last_left_ts: Timestamp,
    last_right_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Union {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        left_q: usize,
        right_q: usize,
        output: usize,
        out_store: u32,
        out_syn: Option<usize>,
        left_eval: AEval,
        right_eval: AEval,
        ctx: EvalContext,
    ) -> Self {
        Self {
            id,
            left_q,
            right_q,
            output,
            out_store,
            out_syn,
            left_eval,
            right_eval,
            ctx,
            last_left_ts: 0,
            last_right_ts: 0,
            last_output_ts: 0,
        }
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        for _ in 0..slice {
            if rt.queues[self.output].is_full() {
                break;
            }
            let Some(side) = next_side(rt, self.left_q, self.right_q, self.last_left_ts, self.last_right_ts)
            else {
                break;
            };
            let queue = match side {
                Side::Left => self.left_q,
                Side::Right => self.right_q,
            };
            let Some(element) = rt.queues[queue].dequeue() else {
                break;
            };
            match side {
                Side::Left => self.last_left_ts = element.timestamp(),
                Side::Right => self.last_right_ts = element.timestamp(),
            }

            match element {
                Element::Heartbeat { .. } => {}
                Element::Plus { tuple, ts } => self.handle_plus(rt, side, tuple, ts)?,
                Element::Minus { tuple, ts } => self.handle_minus(rt, tuple, ts)?,
            }
        }

        let last_input_ts = self.last_left_ts.min(self.last_right_ts);
        generate_heartbeat(rt, self.output, last_input_ts, &mut self.last_output_ts);
        Ok(())
    }

    fn handle_plus(
        &mut self,
        rt: &mut Runtime,
        side: Side,
        tuple: TuplePtr,
        ts: Timestamp,
    ) -> Result<(), RilletError> {
        let out = rt.new_tuple(self.out_store)?;
        self.ctx.bind(Role::Input, tuple);
        self.ctx.bind(Role::Output, out);
        match side {
            Side::Left => self.left_eval.eval(&mut self.ctx, &mut rt.stores),
            Side::Right => self.right_eval.eval(&mut self.ctx, &mut rt.stores),
        }

        rt.queues[self.output].enqueue(Element::Plus { tuple: out, ts });
        self.last_output_ts = ts;

        if let Some(syn) = self.out_syn {
            rt.add_ref(out);
            rt.lin_insert(syn, out, vec![tuple]);
        }
        rt.decr_ref(tuple);
        Ok(())
    }

    fn handle_minus(
        &mut self,
        rt: &mut Runtime,
        tuple: TuplePtr,
        ts: Timestamp,
    ) -> Result<(), RilletError> {
        let syn = self.out_syn.ok_or_else(|| {
            RilletError::InternalError("stream-valued union received a MINUS".into())
        })?;
        let out = rt.lin_get(syn, &[tuple])?;
        rt.lin_delete(syn, out)?;
        rt.queues[self.output].enqueue(Element::Minus { tuple: out, ts });
        self.last_output_ts = ts;
        rt.decr_ref(tuple);
        Ok(())
    }
}
