//! The binary relation-relation join, with an optional fused projection.
//!
//! Both inputs are relation-valued. Each side keeps a synopsis with a hash
//! index probed by the opposite side; a lineage synopsis over the output
//! pairs every produced tuple with the `[left, right]` inputs that made
//! it, so a MINUS on either side can retract exactly the outputs it
//! contributed to.
//!
//! Arrival order across the two inputs is established by timestamp; on
//! ties the left side goes first, making output order deterministic. The
//! arriving tuple enters its own synopsis only after its matches are
//! produced, so a tuple never joins with itself under self-joins.

use crate::error::RilletError;
use crate::exec::eval::{AEval, BEval, EvalContext, Role};
use crate::exec::ops::{Pending, Side, TimeSlice, generate_heartbeat, next_side};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::exec::store::TuplePtr;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Join {
    pub id: usize,
    left_q: usize,
    right_q: usize,
    output: usize,
    /// Synopsis + probing index per side: `left_index` is over the left
    /// synopsis and probed by RIGHT-bound tuples, and vice versa.
    left_syn: usize,
    right_syn: usize,
    left_index: usize,
    right_index: usize,
    out_syn: usize,
    out_store: u32,
    /// Concatenation of the two sides, or the fused projection.
    out_eval: AEval,
    /// Full join predicate re-checked per candidate pair.
    pred: BEval,
    ctx: EvalContext,
    pending: Pending,
    last_left_ts: Timestamp,
    last_right_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Join {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        left_q: usize,
        right_q: usize,
        output: usize,
        left_syn: usize,
        right_syn: usize,
        left_index: usize,
        right_index: usize,
        out_syn: usize,
        out_store: u32,
        out_eval: AEval,
        pred: BEval,
        ctx: EvalContext,
    ) -> Self {
        Self {
            id,
            left_q,
            right_q,
            output,
            left_syn,
            right_syn,
            left_index,
            right_index,
            out_syn,
            out_store,
            out_eval,
            pred,
            ctx,
            pending: Pending::default(),
            last_left_ts: 0,
            last_right_ts: 0,
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
                Element::Plus { tuple, ts } => self.process_plus(rt, side, tuple, ts)?,
                Element::Minus { tuple, ts } => self.process_minus(rt, side, tuple, ts)?,
            }

            if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                return Ok(());
            }
        }

        let last_input_ts = self.last_left_ts.min(self.last_right_ts);
        generate_heartbeat(rt, self.output, last_input_ts, &mut self.last_output_ts);
        Ok(())
    }

    /// Matches on the opposite synopsis that also satisfy the predicate.
    fn matches(&mut self, rt: &mut Runtime, side: Side, tuple: TuplePtr) -> Vec<TuplePtr> {
        let (probe_role, index) = match side {
            Side::Left => (Role::Left, self.right_index),
            Side::Right => (Role::Right, self.left_index),
        };
        let candidates = rt.index_probe(index, &[(probe_role, tuple)]);
        self.ctx.bind(probe_role, tuple);
        let other_role = match side {
            Side::Left => Role::Right,
            Side::Right => Role::Left,
        };
        candidates
            .into_iter()
            .filter(|&m| {
                self.ctx.bind(other_role, m);
                self.pred.eval(&mut self.ctx, &mut rt.stores)
            })
            .collect()
    }

    fn lineage(side: Side, arriving: TuplePtr, matched: TuplePtr) -> Vec<TuplePtr> {
        match side {
            Side::Left => vec![arriving, matched],
            Side::Right => vec![matched, arriving],
        }
    }

    fn process_plus(
        &mut self,
        rt: &mut Runtime,
        side: Side,
        tuple: TuplePtr,
        ts: Timestamp,
    ) -> Result<(), RilletError> {
        rt.op_monitors[self.id].num_input += 1;
        let (own_role, other_role) = match side {
            Side::Left => (Role::Left, Role::Right),
            Side::Right => (Role::Right, Role::Left),
        };

        for m in self.matches(rt, side, tuple) {
            let out = rt.new_tuple(self.out_store)?;
            self.ctx.bind(own_role, tuple);
            self.ctx.bind(other_role, m);
            self.ctx.bind(Role::Output, out);
            self.out_eval.eval(&mut self.ctx, &mut rt.stores);

            rt.add_ref(out);
            rt.lin_insert(self.out_syn, out, Self::lineage(side, tuple, m));
            self.pending.push(Element::Plus { tuple: out, ts });
            rt.op_monitors[self.id].num_joined += 1;
        }

        // Enter our own synopsis last; the element reference becomes the
        // synopsis reference.
        let own_syn = match side {
            Side::Left => self.left_syn,
            Side::Right => self.right_syn,
        };
        rt.rel_insert(own_syn, tuple)
    }

    fn process_minus(
        &mut self,
        rt: &mut Runtime,
        side: Side,
        tuple: TuplePtr,
        ts: Timestamp,
    ) -> Result<(), RilletError> {
        rt.op_monitors[self.id].num_input += 1;
        // Retract every output this tuple contributed to, before leaving
        // the synopsis.
        for m in self.matches(rt, side, tuple) {
            let out = rt.lin_get(self.out_syn, &Self::lineage(side, tuple, m))?;
            rt.lin_delete(self.out_syn, out)?;
            self.pending.push(Element::Minus { tuple: out, ts });
        }

        let own_syn = match side {
            Side::Left => self.left_syn,
            Side::Right => self.right_syn,
        };
        rt.rel_delete(own_syn, tuple)?;
        rt.decr_ref(tuple); // synopsis reference
        rt.decr_ref(tuple); // element reference
        Ok(())
    }
}
