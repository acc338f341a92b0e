//! The stream-relation join, with an optional fused projection.
//!
//! The left (outer) input is a stream: its tuples probe the inner
//! relation once, produce their matches, and pass on — nothing is stored
//! for them and no PLUS/MINUS pairing exists on the output, which is a
//! stream. Only the inner side maintains a synopsis; inner changes
//! produce no output of their own.

use crate::error::RilletError;
use crate::exec::eval::{AEval, BEval, EvalContext, Role};
use crate::exec::ops::{Pending, Side, TimeSlice, generate_heartbeat, next_side};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct StreamJoin {
    pub id: usize,
    left_q: usize,
    right_q: usize,
    output: usize,
    inner_syn: usize,
    /// Index over the inner synopsis, probed by LEFT-bound stream tuples.
    inner_index: usize,
    out_store: u32,
    out_eval: AEval,
    pred: BEval,
    ctx: EvalContext,
    pending: Pending,
    last_left_ts: Timestamp,
    last_right_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl StreamJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        left_q: usize,
        right_q: usize,
        output: usize,
        inner_syn: usize,
        inner_index: usize,
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
            inner_syn,
            inner_index,
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

            match (side, element) {
                (_, Element::Heartbeat { .. }) => {}

                (Side::Left, Element::Plus { tuple, ts }) => {
                    rt.op_monitors[self.id].num_input += 1;
                    let candidates = rt.index_probe(self.inner_index, &[(Role::Left, tuple)]);
                    self.ctx.bind(Role::Left, tuple);
                    for m in candidates {
                        self.ctx.bind(Role::Right, m);
                        if !self.pred.eval(&mut self.ctx, &mut rt.stores) {
                            continue;
                        }
                        let out = rt.new_tuple(self.out_store)?;
                        self.ctx.bind(Role::Output, out);
                        self.out_eval.eval(&mut self.ctx, &mut rt.stores);
                        self.pending.push(Element::Plus { tuple: out, ts });
                        rt.op_monitors[self.id].num_joined += 1;
                    }
                    rt.decr_ref(tuple);
                }

                (Side::Left, Element::Minus { .. }) => {
                    return Err(RilletError::InternalError(
                        "stream join outer input received a MINUS".into(),
                    ));
                }

                (Side::Right, Element::Plus { tuple, .. }) => {
                    rt.op_monitors[self.id].num_input += 1;
                    // Element reference becomes the synopsis reference.
                    rt.rel_insert(self.inner_syn, tuple)?;
                }

                (Side::Right, Element::Minus { tuple, .. }) => {
                    rt.op_monitors[self.id].num_input += 1;
                    rt.rel_delete(self.inner_syn, tuple)?;
                    rt.decr_ref(tuple); // synopsis reference
                    rt.decr_ref(tuple); // element reference
                }
            }

            if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                return Ok(());
            }
        }

        let last_input_ts = self.last_left_ts.min(self.last_right_ts);
        generate_heartbeat(rt, self.output, last_input_ts, &mut self.last_output_ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::exec::eval::{AInstr, BInstr, Cmp, HEval, HInstr, Operand};
    use crate::exec::index::HashIndex;
    use crate::exec::memory::MemoryManager;
    use crate::exec::monitor::OpMonitor;
    use crate::exec::store::StubKind;
    use crate::exec::synopsis::SynKind;
    use crate::layout::{icol, set_icol};
    use crate::types::AttrType;

    /// S(k, x) stream joined against relation R(k, y) on k, producing (x, y).
    fn fixture() -> (Runtime, u32, u32, StreamJoin) {
        let mut rt = Runtime::new(MemoryManager::new(256 * PAGE_SIZE, PAGE_SIZE));
        let s_store = rt.stores.add_store(8, PAGE_SIZE);
        let r_store = rt.stores.add_store(8, PAGE_SIZE);
        let out_store = rt.stores.add_store(8, PAGE_SIZE);
        let r_stub = rt.stores.store_mut(r_store).add_stub(StubKind::Relation);
        let inner_syn = rt.add_synopsis(SynKind::Relation, r_store, r_stub);

        let mut update_hash = HEval::new();
        update_hash.push(HInstr { role: Role::Update, col: 0, ty: AttrType::Int, len: 0 });
        let mut scan_hash = HEval::new();
        scan_hash.push(HInstr { role: Role::Left, col: 0, ty: AttrType::Int, len: 0 });
        let mut key_eq = BEval::new();
        key_eq.push(BInstr {
            cmp: Cmp::IntEq,
            left: Operand::new(Role::Left, 0),
            right: Operand::new(Role::Update, 0),
            char_len: 0,
            left_prep: None,
            right_prep: None,
        });
        let ix = HashIndex::new(0, 0.85, &mut rt.mem, update_hash, scan_hash, key_eq).unwrap();
        let inner_index = rt.add_index(ix);
        rt.synopses[inner_syn].indexes.push(inner_index);

        let left_q = rt.add_queue(32);
        let right_q = rt.add_queue(32);
        let output = rt.add_queue(32);
        rt.op_monitors.push(OpMonitor { is_join: true, ..OpMonitor::default() });

        let mut pred = BEval::new();
        pred.push(BInstr {
            cmp: Cmp::IntEq,
            left: Operand::new(Role::Left, 0),
            right: Operand::new(Role::Right, 0),
            char_len: 0,
            left_prep: None,
            right_prep: None,
        });
        let mut out_eval = AEval::new();
        out_eval.push(AInstr::IntCpy(Operand::new(Role::Left, 1), Operand::new(Role::Output, 0)));
        out_eval.push(AInstr::IntCpy(Operand::new(Role::Right, 1), Operand::new(Role::Output, 1)));

        let op = StreamJoin::new(
            0, left_q, right_q, output, inner_syn, inner_index, out_store, out_eval, pred,
            EvalContext::new(),
        );
        (rt, s_store, r_store, op)
    }

    #[test]
    fn test_stream_tuples_probe_once() {
        let (mut rt, ss, rs, mut op) = fixture();
        // Relation gets (1, 200) at ts 1.
        let r = rt.new_tuple(rs).unwrap();
        set_icol(rt.stores.tuple_mut(r), 0, 1);
        set_icol(rt.stores.tuple_mut(r), 1, 200);
        rt.queues[1].enqueue(Element::Plus { tuple: r, ts: 1 });

        // Stream sees (1, 100) at ts 2 and (2, 300) at ts 3.
        for (k, x, ts) in [(1, 100, 2), (2, 300, 3)] {
            let t = rt.new_tuple(ss).unwrap();
            set_icol(rt.stores.tuple_mut(t), 0, k);
            set_icol(rt.stores.tuple_mut(t), 1, x);
            rt.queues[0].enqueue(Element::Plus { tuple: t, ts });
        }
        rt.queues[1].enqueue(Element::Heartbeat { ts: 4 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[2].dequeue()).collect();
        let plus: Vec<&Element> = out.iter().filter(|e| matches!(e, Element::Plus { .. })).collect();
        assert_eq!(plus.len(), 1);
        let t = plus[0].tuple().unwrap();
        assert_eq!(
            (icol(rt.stores.tuple(t), 0), icol(rt.stores.tuple(t), 1)),
            (100, 200)
        );
        // The stream tuple itself was released after the probe.
        assert_eq!(rt.rel_len(op.inner_syn), 1);
    }

    #[test]
    fn test_inner_minus_produces_no_output() {
        let (mut rt, _ss, rs, mut op) = fixture();
        let r = rt.new_tuple(rs).unwrap();
        set_icol(rt.stores.tuple_mut(r), 0, 1);
        rt.queues[1].enqueue(Element::Plus { tuple: r, ts: 1 });
        rt.add_ref(r);
        rt.queues[1].enqueue(Element::Minus { tuple: r, ts: 2 });
        rt.queues[0].enqueue(Element::Heartbeat { ts: 3 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[2].dequeue()).collect();
        assert!(out.iter().all(|e| e.is_heartbeat()));
        assert_eq!(rt.rel_len(op.inner_syn), 0);
        assert_eq!(rt.stores.ref_count(r), 0);
    }
}
