//! Grouped aggregation.
//!
//! The operator maintains one aggregate row per group in a relation
//! synopsis, located by probing a hash index with the input tuple's
//! grouping columns. Updating a group retracts the old row before
//! asserting the new one. A second synopsis keeps the group's member
//! tuples so MAX/MIN can be recomputed when a member is retracted; when a
//! group's count reaches zero its row is deleted and nothing replaces it.
//!
//! Group rows carry a hidden trailing count column (and a hidden sum
//! column per AVG aggregate); consumers only read the declared prefix of
//! the schema, which the layout's prefix-stability makes safe.

use crate::error::RilletError;
use crate::exec::eval::{AEval, EvalContext, Role};
use crate::exec::ops::{Pending, TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::exec::store::TuplePtr;
use crate::layout::{fcol, icol, set_fcol, set_icol};
use crate::types::{AggrFn, AttrType, Timestamp};

/// One aggregate: where to read the input, where to write the output.
#[derive(Debug, Clone, Copy)]
pub struct AggrSpec {
    pub func: AggrFn,
    /// Column of the aggregated attribute in the input tuple.
    pub in_col: u32,
    pub in_ty: AttrType,
    /// Column of the aggregate value in the group row.
    pub out_col: u32,
    /// Hidden running-sum column (AVG only).
    pub sum_col: Option<u32>,
}

/// A numeric input value.
#[derive(Debug, Clone, Copy)]
enum Num {
    I(i32),
    F(f32),
}

impl Num {
    fn read(bytes: &[u8], ty: AttrType, col: u32) -> Num {
        match ty {
            AttrType::Float => Num::F(fcol(bytes, col)),
            _ => Num::I(icol(bytes, col)),
        }
    }
}

#[derive(Debug)]
pub struct GroupAggr {
    pub id: usize,
    input: usize,
    output: usize,
    /// Member tuples per group.
    in_syn: usize,
    in_index: usize,
    /// One aggregate row per group.
    out_syn: usize,
    out_index: usize,
    out_store: u32,
    /// Copies the grouping attributes of the input into a fresh group row.
    group_copy: AEval,
    /// Hidden member count column in the group row.
    count_col: u32,
    aggrs: Vec<AggrSpec>,
    ctx: EvalContext,
    pending: Pending,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl GroupAggr {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        input: usize,
        output: usize,
        in_syn: usize,
        in_index: usize,
        out_syn: usize,
        out_index: usize,
        out_store: u32,
        group_copy: AEval,
        count_col: u32,
        aggrs: Vec<AggrSpec>,
        ctx: EvalContext,
    ) -> Self {
        Self {
            id,
            input,
            output,
            in_syn,
            in_index,
            out_syn,
            out_index,
            out_store,
            group_copy,
            count_col,
            aggrs,
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
                Element::Heartbeat { .. } => {}
                Element::Plus { tuple, ts } => self.process_plus(rt, tuple, ts)?,
                Element::Minus { tuple, ts } => self.process_minus(rt, tuple, ts)?,
            }

            if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                return Ok(());
            }
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }

    fn group_row(&mut self, rt: &mut Runtime, tuple: TuplePtr) -> Option<TuplePtr> {
        rt.index_probe(self.out_index, &[(Role::Input, tuple)])
            .first()
            .copied()
    }

    fn input_vals(&self, rt: &Runtime, tuple: TuplePtr) -> Vec<Num> {
        let bytes = rt.stores.tuple(tuple);
        self.aggrs
            .iter()
            .map(|a| Num::read(bytes, a.in_ty, a.in_col))
            .collect()
    }

    fn process_plus(
        &mut self,
        rt: &mut Runtime,
        tuple: TuplePtr,
        ts: Timestamp,
    ) -> Result<(), RilletError> {
        let vals = self.input_vals(rt, tuple);
        let old = self.group_row(rt, tuple);
        let new = rt.new_tuple(self.out_store)?;

        match old {
            Some(old) => {
                let old_bytes = rt.stores.tuple(old).to_vec();
                let count = icol(&old_bytes, self.count_col) + 1;
                rt.stores.tuple_mut(new).copy_from_slice(&old_bytes);
                let row = rt.stores.tuple_mut(new);
                set_icol(row, self.count_col, count);
                for (a, v) in self.aggrs.iter().zip(&vals) {
                    apply_plus(row, a, *v, count);
                }
                // Retract the old row first; its synopsis reference rides
                // out on the MINUS.
                self.pending.push(Element::Minus { tuple: old, ts });
                rt.rel_delete(self.out_syn, old)?;
            }
            None => {
                self.ctx.bind(Role::Input, tuple);
                self.ctx.bind(Role::Output, new);
                self.group_copy.eval(&mut self.ctx, &mut rt.stores);
                let row = rt.stores.tuple_mut(new);
                set_icol(row, self.count_col, 1);
                for (a, v) in self.aggrs.iter().zip(&vals) {
                    init_aggr(row, a, *v);
                }
            }
        }

        self.pending.push(Element::Plus { tuple: new, ts });
        rt.add_ref(new);
        rt.rel_insert(self.out_syn, new)?;

        // The element reference becomes the member-synopsis reference.
        rt.rel_insert(self.in_syn, tuple)
    }

    fn process_minus(
        &mut self,
        rt: &mut Runtime,
        tuple: TuplePtr,
        ts: Timestamp,
    ) -> Result<(), RilletError> {
        let vals = self.input_vals(rt, tuple);
        let old = self.group_row(rt, tuple).ok_or_else(|| {
            RilletError::InternalError("group aggregation: MINUS for an unknown group".into())
        })?;

        // Drop the member first so MAX/MIN recomputation sees the rest.
        rt.rel_delete(self.in_syn, tuple)?;
        rt.decr_ref(tuple);

        let count = icol(rt.stores.tuple(old), self.count_col) - 1;
        self.pending.push(Element::Minus { tuple: old, ts });
        rt.rel_delete(self.out_syn, old)?;

        if count > 0 {
            let members = rt.index_probe(self.in_index, &[(Role::Input, tuple)]);
            let new = rt.new_tuple(self.out_store)?;
            let old_bytes = rt.stores.tuple(old).to_vec();
            rt.stores.tuple_mut(new).copy_from_slice(&old_bytes);

            for (i, a) in self.aggrs.iter().enumerate() {
                match a.func {
                    AggrFn::Max | AggrFn::Min => {
                        let extremes: Vec<Num> = members
                            .iter()
                            .map(|&m| Num::read(rt.stores.tuple(m), a.in_ty, a.in_col))
                            .collect();
                        let row = rt.stores.tuple_mut(new);
                        recompute_extreme(row, a, &extremes);
                    }
                    _ => {
                        let row = rt.stores.tuple_mut(new);
                        apply_minus(row, a, vals[i], count);
                    }
                }
            }
            let row = rt.stores.tuple_mut(new);
            set_icol(row, self.count_col, count);

            self.pending.push(Element::Plus { tuple: new, ts });
            rt.add_ref(new);
            rt.rel_insert(self.out_syn, new)?;
        }

        rt.decr_ref(tuple);
        Ok(())
    }
}

fn init_aggr(row: &mut [u8], a: &AggrSpec, v: Num) {
    match (a.func, v) {
        (AggrFn::Count, _) => set_icol(row, a.out_col, 1),
        (AggrFn::Sum | AggrFn::Max | AggrFn::Min, Num::I(x)) => set_icol(row, a.out_col, x),
        (AggrFn::Sum | AggrFn::Max | AggrFn::Min, Num::F(x)) => set_fcol(row, a.out_col, x),
        (AggrFn::Avg, Num::I(x)) => {
            set_icol(row, a.sum_col.expect("AVG carries a sum column"), x);
            set_fcol(row, a.out_col, x as f32);
        }
        (AggrFn::Avg, Num::F(x)) => {
            set_fcol(row, a.sum_col.expect("AVG carries a sum column"), x);
            set_fcol(row, a.out_col, x);
        }
    }
}

fn apply_plus(row: &mut [u8], a: &AggrSpec, v: Num, count: i32) {
    match (a.func, v) {
        (AggrFn::Count, _) => set_icol(row, a.out_col, icol(row, a.out_col) + 1),
        (AggrFn::Sum, Num::I(x)) => set_icol(row, a.out_col, icol(row, a.out_col).wrapping_add(x)),
        (AggrFn::Sum, Num::F(x)) => set_fcol(row, a.out_col, fcol(row, a.out_col) + x),
        (AggrFn::Max, Num::I(x)) => set_icol(row, a.out_col, icol(row, a.out_col).max(x)),
        (AggrFn::Max, Num::F(x)) => set_fcol(row, a.out_col, fcol(row, a.out_col).max(x)),
        (AggrFn::Min, Num::I(x)) => set_icol(row, a.out_col, icol(row, a.out_col).min(x)),
        (AggrFn::Min, Num::F(x)) => set_fcol(row, a.out_col, fcol(row, a.out_col).min(x)),
        (AggrFn::Avg, Num::I(x)) => {
            let sum_col = a.sum_col.expect("AVG carries a sum column");
            let sum = icol(row, sum_col).wrapping_add(x);
            set_icol(row, sum_col, sum);
            set_fcol(row, a.out_col, sum as f32 / count as f32);
        }
        (AggrFn::Avg, Num::F(x)) => {
            let sum_col = a.sum_col.expect("AVG carries a sum column");
            let sum = fcol(row, sum_col) + x;
            set_fcol(row, sum_col, sum);
            set_fcol(row, a.out_col, sum / count as f32);
        }
    }
}

fn apply_minus(row: &mut [u8], a: &AggrSpec, v: Num, count: i32) {
    match (a.func, v) {
        (AggrFn::Count, _) => set_icol(row, a.out_col, icol(row, a.out_col) - 1),
        (AggrFn::Sum, Num::I(x)) => set_icol(row, a.out_col, icol(row, a.out_col).wrapping_sub(x)),
        (AggrFn::Sum, Num::F(x)) => set_fcol(row, a.out_col, fcol(row, a.out_col) - x),
        (AggrFn::Avg, Num::I(x)) => {
            let sum_col = a.sum_col.expect("AVG carries a sum column");
            let sum = icol(row, sum_col).wrapping_sub(x);
            set_icol(row, sum_col, sum);
            set_fcol(row, a.out_col, sum as f32 / count as f32);
        }
        (AggrFn::Avg, Num::F(x)) => {
            let sum_col = a.sum_col.expect("AVG carries a sum column");
            let sum = fcol(row, sum_col) - x;
            set_fcol(row, sum_col, sum);
            set_fcol(row, a.out_col, sum / count as f32);
        }
        (AggrFn::Max | AggrFn::Min, _) => {
            unreachable!("extremes are recomputed from the member synopsis")
        }
    }
}

fn recompute_extreme(row: &mut [u8], a: &AggrSpec, members: &[Num]) {
    debug_assert!(!members.is_empty());
    match a.in_ty {
        AttrType::Float => {
            let it = members.iter().map(|v| match v {
                Num::F(x) => *x,
                Num::I(x) => *x as f32,
            });
            let val = match a.func {
                AggrFn::Max => it.fold(f32::NEG_INFINITY, f32::max),
                _ => it.fold(f32::INFINITY, f32::min),
            };
            set_fcol(row, a.out_col, val);
        }
        _ => {
            let it = members.iter().map(|v| match v {
                Num::I(x) => *x,
                Num::F(x) => *x as i32,
            });
            let val = match a.func {
                AggrFn::Max => it.max().unwrap_or(0),
                _ => it.min().unwrap_or(0),
            };
            set_icol(row, a.out_col, val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::exec::eval::{AInstr, BEval, BInstr, Cmp, HEval, HInstr, Operand};
    use crate::exec::index::HashIndex;
    use crate::exec::memory::MemoryManager;
    use crate::exec::store::StubKind;
    use crate::exec::synopsis::SynKind;

    /// SELECT g, SUM(v) FROM R(g, v) GROUP BY g.
    /// Group row layout: g @0, sum @1, hidden count @2.
    fn fixture() -> (Runtime, u32, GroupAggr) {
        let mut rt = Runtime::new(MemoryManager::new(256 * PAGE_SIZE, PAGE_SIZE));
        let in_store = rt.stores.add_store(8, PAGE_SIZE);
        let out_store = rt.stores.add_store(12, PAGE_SIZE);

        let in_stub = rt.stores.store_mut(in_store).add_stub(StubKind::Relation);
        let out_stub = rt.stores.store_mut(out_store).add_stub(StubKind::Relation);
        let in_syn = rt.add_synopsis(SynKind::Relation, in_store, in_stub);
        let out_syn = rt.add_synopsis(SynKind::Relation, out_store, out_stub);

        let key_hash = |role| {
            let mut h = HEval::new();
            h.push(HInstr { role, col: 0, ty: AttrType::Int, len: 0 });
            h
        };
        let key_eq = || {
            let mut b = BEval::new();
            b.push(BInstr {
                cmp: Cmp::IntEq,
                left: Operand::new(Role::Input, 0),
                right: Operand::new(Role::Update, 0),
                char_len: 0,
                left_prep: None,
                right_prep: None,
            });
            b
        };
        let in_idx_val =
            HashIndex::new(0, 0.85, &mut rt.mem, key_hash(Role::Update), key_hash(Role::Input), key_eq())
                .unwrap();
        let in_index = rt.add_index(in_idx_val);
        let out_idx_val =
            HashIndex::new(1, 0.85, &mut rt.mem, key_hash(Role::Update), key_hash(Role::Input), key_eq())
                .unwrap();
        let out_index = rt.add_index(out_idx_val);
        rt.synopses[in_syn].indexes.push(in_index);
        rt.synopses[out_syn].indexes.push(out_index);

        let input = rt.add_queue(32);
        let output = rt.add_queue(32);

        let mut group_copy = AEval::new();
        group_copy.push(AInstr::IntCpy(Operand::new(Role::Input, 0), Operand::new(Role::Output, 0)));

        let aggrs = vec![AggrSpec {
            func: AggrFn::Sum,
            in_col: 1,
            in_ty: AttrType::Int,
            out_col: 1,
            sum_col: None,
        }];
        let op = GroupAggr::new(
            0, input, output, in_syn, in_index, out_syn, out_index, out_store, group_copy, 2,
            aggrs, EvalContext::new(),
        );
        (rt, in_store, op)
    }

    fn feed(rt: &mut Runtime, store: u32, g: i32, v: i32, ts: Timestamp) -> TuplePtr {
        let t = rt.new_tuple(store).unwrap();
        set_icol(rt.stores.tuple_mut(t), 0, g);
        set_icol(rt.stores.tuple_mut(t), 1, v);
        rt.queues[0].enqueue(Element::Plus { tuple: t, ts });
        t
    }

    fn row(rt: &Runtime, e: &Element) -> (i32, i32) {
        let t = e.tuple().unwrap();
        (icol(rt.stores.tuple(t), 0), icol(rt.stores.tuple(t), 1))
    }

    #[test]
    fn test_sum_update_sequence() {
        let (mut rt, store, mut op) = fixture();
        let t1 = feed(&mut rt, store, 1, 10, 1);
        feed(&mut rt, store, 1, 20, 2);
        feed(&mut rt, store, 2, 30, 3);
        op.run(&mut rt, 10).unwrap();

        // Retraction of the first member of group 1.
        rt.add_ref(t1);
        rt.queues[0].enqueue(Element::Minus { tuple: t1, ts: 4 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        let events: Vec<(bool, (i32, i32))> = out
            .iter()
            .filter(|e| !e.is_heartbeat())
            .map(|e| (matches!(e, Element::Plus { .. }), row(&rt, e)))
            .collect();
        assert_eq!(
            events,
            vec![
                (true, (1, 10)),
                (false, (1, 10)),
                (true, (1, 30)),
                (true, (2, 30)),
                (false, (1, 30)),
                (true, (1, 20)),
            ]
        );
    }

    #[test]
    fn test_group_vanishes_at_zero() {
        let (mut rt, store, mut op) = fixture();
        let t = feed(&mut rt, store, 5, 50, 1);
        op.run(&mut rt, 10).unwrap();
        rt.add_ref(t);
        rt.queues[0].enqueue(Element::Minus { tuple: t, ts: 2 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        let data: Vec<&Element> = out.iter().filter(|e| !e.is_heartbeat()).collect();
        assert_eq!(data.len(), 2);
        assert!(matches!(data[0], Element::Plus { .. }));
        assert!(matches!(data[1], Element::Minus { .. }));
        assert_eq!(rt.rel_len(op.out_syn), 0);
        assert_eq!(rt.rel_len(op.in_syn), 0);
    }

    #[test]
    fn test_empty_input_produces_nothing() {
        let (mut rt, _store, mut op) = fixture();
        op.run(&mut rt, 10).unwrap();
        assert!(rt.queues[1].is_empty());
    }

    #[test]
    fn test_min_recomputes_on_retraction() {
        let (mut rt, store, mut op) = fixture();
        op.aggrs = vec![AggrSpec {
            func: AggrFn::Min,
            in_col: 1,
            in_ty: AttrType::Int,
            out_col: 1,
            sum_col: None,
        }];
        let t1 = feed(&mut rt, store, 1, 3, 1);
        feed(&mut rt, store, 1, 8, 2);
        op.run(&mut rt, 10).unwrap();
        // Retract the minimum; the row must fall back to 8.
        rt.add_ref(t1);
        rt.queues[0].enqueue(Element::Minus { tuple: t1, ts: 3 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        let last_plus = out
            .iter()
            .filter(|e| matches!(e, Element::Plus { .. }))
            .next_back()
            .unwrap();
        assert_eq!(row(&rt, last_plus), (1, 8));
    }
}
