//! Anti-semijoin (EXCEPT): left tuples with no value-equal right tuple.
//!
//! A count synopsis tracks, per distinct value, how many tuples each side
//! currently asserts; a synopsis of the live left tuples makes right-side
//! transitions retroactive. A left tuple is visible in the output exactly
//! while its value's right count is zero, so a right count moving 0→1
//! retracts every visible left tuple of that value, and 1→0 re-asserts
//! them. Output tuples are copies, paired with their left input through a
//! lineage synopsis.

use crate::error::RilletError;
use crate::exec::eval::{AEval, EvalContext, Role};
use crate::exec::ops::{Pending, Side, TimeSlice, generate_heartbeat, next_side};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::exec::store::TuplePtr;
use crate::layout::{icol, set_icol};
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Except {
    pub id: usize,
    left_q: usize,
    right_q: usize,
    output: usize,
    /// Per-value count rows (value columns + left/right count columns).
    count_syn: usize,
    count_index: usize,
    count_store: u32,
    left_count_col: u32,
    right_count_col: u32,
    /// Live left tuples, probed by value.
    left_syn: usize,
    left_index: usize,
    /// Output lineage: `[left_tuple]` → output copy.
    out_syn: usize,
    out_store: u32,
    /// Copies the value columns of an input tuple into a fresh row.
    copy_eval: AEval,
    ctx: EvalContext,
    pending: Pending,
    last_left_ts: Timestamp,
    last_right_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Except {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        left_q: usize,
        right_q: usize,
        output: usize,
        count_syn: usize,
        count_index: usize,
        count_store: u32,
        left_count_col: u32,
        right_count_col: u32,
        left_syn: usize,
        left_index: usize,
        out_syn: usize,
        out_store: u32,
        copy_eval: AEval,
        ctx: EvalContext,
    ) -> Self {
        Self {
            id,
            left_q,
            right_q,
            output,
            count_syn,
            count_index,
            count_store,
            left_count_col,
            right_count_col,
            left_syn,
            left_index,
            out_syn,
            out_store,
            copy_eval,
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

            match (side, element) {
                (_, Element::Heartbeat { .. }) => {}
                (Side::Left, Element::Plus { tuple, ts }) => self.left_plus(rt, tuple, ts)?,
                (Side::Left, Element::Minus { tuple, ts }) => self.left_minus(rt, tuple, ts)?,
                (Side::Right, Element::Plus { tuple, ts }) => self.right_plus(rt, tuple, ts)?,
                (Side::Right, Element::Minus { tuple, ts }) => self.right_minus(rt, tuple, ts)?,
            }

            if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                return Ok(());
            }
        }

        let last_input_ts = self.last_left_ts.min(self.last_right_ts);
        generate_heartbeat(rt, self.output, last_input_ts, &mut self.last_output_ts);
        Ok(())
    }

    /// Find the count row for a tuple's value.
    fn count_row(&mut self, rt: &mut Runtime, tuple: TuplePtr) -> Option<TuplePtr> {
        rt.index_probe(self.count_index, &[(Role::Input, tuple)])
            .first()
            .copied()
    }

    /// Find or create the count row for a tuple's value.
    fn count_row_or_new(
        &mut self,
        rt: &mut Runtime,
        tuple: TuplePtr,
    ) -> Result<TuplePtr, RilletError> {
        if let Some(row) = self.count_row(rt, tuple) {
            return Ok(row);
        }
        let row = rt.new_tuple(self.count_store)?;
        self.ctx.bind(Role::Input, tuple);
        self.ctx.bind(Role::Output, row);
        self.copy_eval.eval(&mut self.ctx, &mut rt.stores);
        let bytes = rt.stores.tuple_mut(row);
        set_icol(bytes, self.left_count_col, 0);
        set_icol(bytes, self.right_count_col, 0);
        // The allocation reference is the count synopsis's.
        rt.rel_insert(self.count_syn, row)?;
        Ok(row)
    }

    fn bump(&self, rt: &mut Runtime, row: TuplePtr, col: u32, delta: i32) -> i32 {
        let bytes = rt.stores.tuple_mut(row);
        let n = icol(bytes, col) + delta;
        set_icol(bytes, col, n);
        n
    }

    fn drop_row_if_unused(&mut self, rt: &mut Runtime, row: TuplePtr) -> Result<(), RilletError> {
        let bytes = rt.stores.tuple(row);
        if icol(bytes, self.left_count_col) == 0 && icol(bytes, self.right_count_col) == 0 {
            rt.rel_delete(self.count_syn, row)?;
            rt.decr_ref(row);
        }
        Ok(())
    }

    /// Produce the output copy for a visible left tuple.
    fn emit_left(&mut self, rt: &mut Runtime, left: TuplePtr, ts: Timestamp) -> Result<(), RilletError> {
        let out = rt.new_tuple(self.out_store)?;
        self.ctx.bind(Role::Input, left);
        self.ctx.bind(Role::Output, out);
        self.copy_eval.eval(&mut self.ctx, &mut rt.stores);
        rt.add_ref(out);
        rt.lin_insert(self.out_syn, out, vec![left]);
        self.pending.push(Element::Plus { tuple: out, ts });
        Ok(())
    }

    /// Retract the output copy of a previously visible left tuple.
    fn retract_left(&mut self, rt: &mut Runtime, left: TuplePtr, ts: Timestamp) -> Result<(), RilletError> {
        let out = rt.lin_get(self.out_syn, &[left])?;
        rt.lin_delete(self.out_syn, out)?;
        self.pending.push(Element::Minus { tuple: out, ts });
        Ok(())
    }

    fn left_plus(&mut self, rt: &mut Runtime, tuple: TuplePtr, ts: Timestamp) -> Result<(), RilletError> {
        let row = self.count_row_or_new(rt, tuple)?;
        self.bump(rt, row, self.left_count_col, 1);
        let visible = icol(rt.stores.tuple(row), self.right_count_col) == 0;
        // The element reference becomes the left-synopsis reference.
        rt.rel_insert(self.left_syn, tuple)?;
        if visible {
            self.emit_left(rt, tuple, ts)?;
        }
        Ok(())
    }

    fn left_minus(&mut self, rt: &mut Runtime, tuple: TuplePtr, ts: Timestamp) -> Result<(), RilletError> {
        let row = self.count_row(rt, tuple).ok_or_else(|| {
            RilletError::InternalError("except: left MINUS for an unknown value".into())
        })?;
        self.bump(rt, row, self.left_count_col, -1);
        let visible = icol(rt.stores.tuple(row), self.right_count_col) == 0;
        if visible {
            self.retract_left(rt, tuple, ts)?;
        }
        rt.rel_delete(self.left_syn, tuple)?;
        rt.decr_ref(tuple); // synopsis reference
        rt.decr_ref(tuple); // element reference
        self.drop_row_if_unused(rt, row)
    }

    fn right_plus(&mut self, rt: &mut Runtime, tuple: TuplePtr, ts: Timestamp) -> Result<(), RilletError> {
        let row = self.count_row_or_new(rt, tuple)?;
        let n = self.bump(rt, row, self.right_count_col, 1);
        if n == 1 {
            // Value became covered: all visible left tuples disappear.
            for left in rt.index_probe(self.left_index, &[(Role::Input, tuple)]) {
                self.retract_left(rt, left, ts)?;
            }
        }
        rt.decr_ref(tuple);
        Ok(())
    }

    fn right_minus(&mut self, rt: &mut Runtime, tuple: TuplePtr, ts: Timestamp) -> Result<(), RilletError> {
        let row = self.count_row(rt, tuple).ok_or_else(|| {
            RilletError::InternalError("except: right MINUS for an unknown value".into())
        })?;
        let n = self.bump(rt, row, self.right_count_col, -1);
        if n == 0 {
            // Value uncovered: the left tuples of this value reappear.
            for left in rt.index_probe(self.left_index, &[(Role::Input, tuple)]) {
                self.emit_left(rt, left, ts)?;
            }
        }
        rt.decr_ref(tuple);
        self.drop_row_if_unused(rt, row)
    }
}
