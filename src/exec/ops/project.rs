//! The projection operator.
//!
//! Allocates an output tuple per PLUS and runs the projection program over
//! the INPUT/OUTPUT roles. When the output is relation-valued the operator
//! threads a lineage synopsis so a later MINUS for the input tuple can be
//! paired with the output tuple it produced.

use crate::error::RilletError;
use crate::exec::eval::{AEval, EvalContext, Role};
use crate::exec::ops::{TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Project {
    pub id: usize,
    input: usize,
    output: usize,
    out_store: u32,
    /// Lineage synopsis; present iff the output is relation-valued.
    out_syn: Option<usize>,
    proj: AEval,
    ctx: EvalContext,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Project {
    pub fn new(
        id: usize,
        input: usize,
        output: usize,
        out_store: u32,
        out_syn: Option<usize>,
        proj: AEval,
        ctx: EvalContext,
    ) -> Self {
        Self {
            id,
            input,
            output,
            out_store,
            out_syn,
            proj,
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
                    let out = rt.new_tuple(self.out_store)?;
                    self.ctx.bind(Role::Input, tuple);
                    self.ctx.bind(Role::Output, out);
                    self.proj.eval(&mut self.ctx, &mut rt.stores);

                    rt.queues[self.output].enqueue(Element::Plus { tuple: out, ts });
                    self.last_output_ts = ts;

                    if let Some(syn) = self.out_syn {
                        rt.add_ref(out);
                        rt.lin_insert(syn, out, vec![tuple]);
                    }
                    rt.decr_ref(tuple);
                }

                Element::Minus { tuple, ts } => {
                    let syn = self.out_syn.ok_or_else(|| {
                        RilletError::InternalError(
                            "projection over a stream received a MINUS".into(),
                        )
                    })?;
                    let out = rt.lin_get(syn, &[tuple])?;
                    rt.lin_delete(syn, out)?;
                    // The synopsis reference rides out on the element.
                    rt.queues[self.output].enqueue(Element::Minus { tuple: out, ts });
                    self.last_output_ts = ts;
                    rt.decr_ref(tuple);
                }
            }
        }

        generate_heartbeat(rt, self.output, self.last_input_ts, &mut self.last_output_ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::exec::eval::{AInstr, Operand};
    use crate::exec::memory::MemoryManager;
    use crate::exec::store::StubKind;
    use crate::exec::synopsis::SynKind;
    use crate::layout::{icol, set_icol};

    /// Projection computing out.0 = in.0 + in.1 over a relation output.
    fn fixture(with_lineage: bool) -> (Runtime, u32, Project) {
        let mut rt = Runtime::new(MemoryManager::new(64 * PAGE_SIZE, PAGE_SIZE));
        let in_store = rt.stores.add_store(8, PAGE_SIZE);
        let out_store = rt.stores.add_store(4, PAGE_SIZE);
        let input = rt.add_queue(16);
        let output = rt.add_queue(16);

        let out_syn = with_lineage.then(|| {
            let stub = rt.stores.store_mut(out_store).add_stub(StubKind::Lineage);
            rt.add_synopsis(SynKind::Lineage, out_store, stub)
        });

        let mut proj = AEval::new();
        proj.push(AInstr::IntAdd(
            Operand::new(Role::Input, 0),
            Operand::new(Role::Input, 1),
            Operand::new(Role::Output, 0),
        ));
        let op = Project::new(0, input, output, out_store, out_syn, proj, EvalContext::new());
        (rt, in_store, op)
    }

    fn feed_plus(rt: &mut Runtime, store: u32, a: i32, b: i32, ts: Timestamp) -> crate::exec::store::TuplePtr {
        let t = rt.new_tuple(store).unwrap();
        set_icol(rt.stores.tuple_mut(t), 0, a);
        set_icol(rt.stores.tuple_mut(t), 1, b);
        rt.queues[0].enqueue(Element::Plus { tuple: t, ts });
        t
    }

    #[test]
    fn test_plus_projects_arithmetic() {
        let (mut rt, store, mut op) = fixture(false);
        feed_plus(&mut rt, store, 10, 1, 1);
        op.run(&mut rt, 4).unwrap();
        let e = rt.queues[1].dequeue().unwrap();
        let out = e.tuple().unwrap();
        assert_eq!(icol(rt.stores.tuple(out), 0), 11);
        assert_eq!(e.timestamp(), 1);
    }

    #[test]
    fn test_minus_pairs_through_lineage() {
        let (mut rt, store, mut op) = fixture(true);
        let t = feed_plus(&mut rt, store, 20, 2, 2);
        op.run(&mut rt, 4).unwrap();
        let plus = rt.queues[1].dequeue().unwrap();
        let out = plus.tuple().unwrap();

        // Upstream retracts the same input tuple (it kept a reference).
        rt.add_ref(t);
        rt.queues[0].enqueue(Element::Minus { tuple: t, ts: 5 });
        op.run(&mut rt, 4).unwrap();
        let minus = rt.queues[1].dequeue().unwrap();
        assert_eq!(minus, Element::Minus { tuple: out, ts: 5 });
        // Synopsis entry is gone; both references now sit with us.
        assert_eq!(rt.stores.ref_count(out), 2);
    }

    #[test]
    fn test_minus_without_lineage_is_internal_error() {
        let (mut rt, store, mut op) = fixture(false);
        let t = rt.new_tuple(store).unwrap();
        rt.queues[0].enqueue(Element::Minus { tuple: t, ts: 1 });
        assert!(op.run(&mut rt, 4).is_err());
    }
}
