//! Dstream: relation → stream of deletions.
//!
//! The mirror image of Istream: a tuple is reported at time T iff it was
//! in the relation at T−1 and is not at T. MINUSes arriving at the
//! current timestamp accumulate in the "now" synopsis; a PLUS
//! re-asserting one of them at the same instant cancels the departure.
//! When time advances, the accumulated departures flush as stream PLUSes
//! carrying the old timestamp.

use crate::error::RilletError;
use crate::exec::ops::{Pending, TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Dstream {
    pub id: usize,
    input: usize,
    output: usize,
    now_syn: usize,
    cur_ts: Timestamp,
    pending: Pending,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Dstream {
    pub fn new(id: usize, input: usize, output: usize, now_syn: usize) -> Self {
        Self {
            id,
            input,
            output,
            now_syn,
            cur_ts: 0,
            pending: Pending::default(),
            last_input_ts: 0,
            last_output_ts: 0,
        }
    }

    fn advance_to(&mut self, rt: &mut Runtime, ts: Timestamp) -> Result<(), RilletError> {
        if ts <= self.cur_ts {
            return Ok(());
        }
        for tuple in rt.rel_entries(self.now_syn) {
            rt.rel_delete(self.now_syn, tuple)?;
            self.pending.push(Element::Plus { tuple, ts: self.cur_ts });
        }
        self.cur_ts = ts;
        Ok(())
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
            self.advance_to(rt, element.timestamp())?;

            match element {
                Element::Heartbeat { .. } => {}

                Element::Minus { tuple, .. } => {
                    // The element reference becomes the synopsis reference.
                    rt.rel_insert(self.now_syn, tuple)?;
                }

                Element::Plus { tuple, .. } => {
                    if rt.rel_contains(self.now_syn, tuple) {
                        // Left and rejoined at the same instant: not a
                        // departure after all.
                        rt.rel_delete(self.now_syn, tuple)?;
                        rt.decr_ref(tuple);
                    }
                    rt.decr_ref(tuple);
                }
            }

            if !self.pending.drain(rt, self.output, &mut self.last_output_ts) {
                return Ok(());
            }
        }

        generate_heartbeat(rt, self.output, self.cur_ts, &mut self.last_output_ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::exec::memory::MemoryManager;
    use crate::exec::store::{StubKind, TuplePtr};
    use crate::exec::synopsis::SynKind;

    fn fixture() -> (Runtime, u32, Dstream) {
        let mut rt = Runtime::new(MemoryManager::new(64 * PAGE_SIZE, PAGE_SIZE));
        let store = rt.stores.add_store(8, PAGE_SIZE);
        let stub = rt.stores.store_mut(store).add_stub(StubKind::Relation);
        let syn = rt.add_synopsis(SynKind::Relation, store, stub);
        let input = rt.add_queue(32);
        let output = rt.add_queue(32);
        let op = Dstream::new(0, input, output, syn);
        (rt, store, op)
    }

    #[test]
    fn test_departures_flush_with_old_timestamp() {
        let (mut rt, store, mut op) = fixture();
        let a = rt.new_tuple(store).unwrap();
        rt.add_ref(a); // pretend something upstream still holds it
        rt.queues[0].enqueue(Element::Minus { tuple: a, ts: 4 });
        rt.queues[0].enqueue(Element::Heartbeat { ts: 5 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        let data: Vec<&Element> = out.iter().filter(|e| !e.is_heartbeat()).collect();
        assert_eq!(data, vec![&Element::Plus { tuple: a, ts: 4 }]);
    }

    #[test]
    fn test_same_instant_reinsert_cancels() {
        let (mut rt, store, mut op) = fixture();
        let a: TuplePtr = rt.new_tuple(store).unwrap();
        rt.add_ref(a);
        rt.queues[0].enqueue(Element::Minus { tuple: a, ts: 4 });
        rt.queues[0].enqueue(Element::Plus { tuple: a, ts: 4 });
        rt.queues[0].enqueue(Element::Heartbeat { ts: 6 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        assert!(out.iter().all(|e| e.is_heartbeat()));
        assert_eq!(rt.stores.ref_count(a), 0);
    }

    #[test]
    fn test_plain_insert_is_silent() {
        let (mut rt, store, mut op) = fixture();
        let a = rt.new_tuple(store).unwrap();
        rt.queues[0].enqueue(Element::Plus { tuple: a, ts: 2 });
        rt.queues[0].enqueue(Element::Heartbeat { ts: 3 });
        op.run(&mut rt, 10).unwrap();
        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        assert!(out.iter().all(|e| e.is_heartbeat()));
    }
}
