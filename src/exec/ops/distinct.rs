//! Duplicate elimination.
//!
//! A reference-counted multiset in a relation synopsis: the stored copy of
//! each distinct value carries a hidden multiplicity column. Output is
//! produced only when the multiplicity crosses zero — PLUS on 0→1, MINUS
//! on 1→0.

use crate::error::RilletError;
use crate::exec::eval::{AEval, EvalContext, Role};
use crate::exec::ops::{TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::layout::{icol, set_icol};
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Distinct {
    pub id: usize,
    input: usize,
    output: usize,
    out_syn: usize,
    out_index: usize,
    out_store: u32,
    /// Copies all declared columns of the input into the stored row.
    copy_eval: AEval,
    /// Hidden multiplicity column in the stored row.
    count_col: u32,
    ctx: EvalContext,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Distinct {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        input: usize,
        output: usize,
        out_syn: usize,
        out_index: usize,
        out_store: u32,
        copy_eval: AEval,
        count_col: u32,
        ctx: EvalContext,
    ) -> Self {
        Self {
            id,
            input,
            output,
            out_syn,
            out_index,
            out_store,
            copy_eval,
            count_col,
            ctx,
            last_input_ts: 0,
            last_output_ts: 0,
        }
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        for _ in 0..slice {
            if rt.queues[self.output].is_full() {
                break;
            }
            let Some(element) = rt.queues[self.input].dequeue() else {
                break;
            };
            self.last_input_ts = element.timestamp();

            match element {
                Element::Heartbeat { .. } => {}

                Element::Plus { tuple, ts } => {
                    let hit = rt.index_probe(self.out_index, &[(Role::Input, tuple)]);
                    match hit.first().copied() {
                        Some(stored) => {
                            let row = rt.stores.tuple_mut(stored);
                            let n = icol(row, self.count_col);
                            set_icol(row, self.count_col, n + 1);
                        }
                        None => {
                            let stored = rt.new_tuple(self.out_store)?;
                            self.ctx.bind(Role::Input, tuple);
                            self.ctx.bind(Role::Output, stored);
                            self.copy_eval.eval(&mut self.ctx, &mut rt.stores);
                            set_icol(rt.stores.tuple_mut(stored), self.count_col, 1);

                            rt.add_ref(stored);
                            rt.rel_insert(self.out_syn, stored)?;
                            rt.queues[self.output].enqueue(Element::Plus { tuple: stored, ts });
                            self.last_output_ts = ts;
                        }
                    }
                    rt.decr_ref(tuple);
                }

                Element::Minus { tuple, ts } => {
                    let hit = rt.index_probe(self.out_index, &[(Role::Input, tuple)]);
                    let stored = hit.first().copied().ok_or_else(|| {
                        RilletError::InternalError(
                            "distinct: MINUS for a value never asserted".into(),
                        )
                    })?;
                    let row = rt.stores.tuple_mut(stored);
                    let n = icol(row, self.count_col) - 1;
                    set_icol(row, self.count_col, n);
                    if n == 0 {
                        rt.rel_delete(self.out_syn, stored)?;
                        // The synopsis reference rides out on the MINUS.
                        rt.queues[self.output].enqueue(Element::Minus { tuple: stored, ts });
                        self.last_output_ts = ts;
                    }
                    rt.decr_ref(tuple);
                }
            }
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }
}
