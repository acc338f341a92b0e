//! Istream: relation → stream of insertions.
//!
//! A tuple is reported at time T iff it is in the relation at T and was
//! not at T−1. PLUSes arriving at the current timestamp accumulate in a
//! "now" synopsis; a MINUS for one of them at the same instant cancels it
//! (the tuple never survived its own timestamp). When input time
//! advances, the survivors flush downstream as stream PLUSes carrying the
//! old timestamp. MINUSes for older tuples are plain departures and
//! produce nothing.

use crate::error::RilletError;
use crate::exec::ops::{Pending, TimeSlice, generate_heartbeat};
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

#[derive(Debug)]
pub struct Istream {
    pub id: usize,
    input: usize,
    output: usize,
    now_syn: usize,
    /// Timestamp the now-synopsis is accumulating for.
    cur_ts: Timestamp,
    pending: Pending,
    last_input_ts: Timestamp,
    last_output_ts: Timestamp,
}

impl Istream {
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

    /// Move the accumulated insertions into the pending buffer when the
    /// clock passes `cur_ts`.
    fn advance_to(&mut self, rt: &mut Runtime, ts: Timestamp) -> Result<(), RilletError> {
        if ts <= self.cur_ts {
            return Ok(());
        }
        for tuple in rt.rel_entries(self.now_syn) {
            rt.rel_delete(self.now_syn, tuple)?;
            // The synopsis reference rides out on the stream PLUS.
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

                Element::Plus { tuple, .. } => {
                    // The element reference becomes the synopsis reference.
                    rt.rel_insert(self.now_syn, tuple)?;
                }

                Element::Minus { tuple, .. } => {
                    if rt.rel_contains(self.now_syn, tuple) {
                        // Appeared and disappeared at the same instant:
                        // never part of any output.
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

        // Survivors for cur_ts may still flush later, so time can only be
        // promised up to cur_ts itself.
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

    fn fixture() -> (Runtime, u32, Istream) {
        let mut rt = Runtime::new(MemoryManager::new(64 * PAGE_SIZE, PAGE_SIZE));
        let store = rt.stores.add_store(8, PAGE_SIZE);
        let stub = rt.stores.store_mut(store).add_stub(StubKind::Relation);
        let syn = rt.add_synopsis(SynKind::Relation, store, stub);
        let input = rt.add_queue(32);
        let output = rt.add_queue(32);
        let op = Istream::new(0, input, output, syn);
        (rt, store, op)
    }

    fn feed_plus(rt: &mut Runtime, store: u32, ts: Timestamp) -> TuplePtr {
        let t = rt.new_tuple(store).unwrap();
        rt.queues[0].enqueue(Element::Plus { tuple: t, ts });
        t
    }

    #[test]
    fn test_insertions_flush_on_time_advance() {
        let (mut rt, store, mut op) = fixture();
        let a = feed_plus(&mut rt, store, 1);
        let b = feed_plus(&mut rt, store, 1);
        op.run(&mut rt, 10).unwrap();
        // Time has not advanced past 1 yet.
        assert!(
            rt.queues[1].peek().is_none_or(|e| e.is_heartbeat()),
            "no data may flush before time advances"
        );

        rt.queues[0].enqueue(Element::Heartbeat { ts: 2 });
        op.run(&mut rt, 10).unwrap();
        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        let mut data: Vec<TuplePtr> = out
            .iter()
            .filter(|e| !e.is_heartbeat())
            .map(|e| e.tuple().unwrap())
            .collect();
        data.sort();
        let mut expect = vec![a, b];
        expect.sort();
        assert_eq!(data, expect);
        assert!(
            out.iter().filter(|e| !e.is_heartbeat()).all(|e| e.timestamp() == 1),
            "flushed PLUSes preserve their timestamp"
        );
    }

    #[test]
    fn test_same_instant_minus_cancels() {
        let (mut rt, store, mut op) = fixture();
        let a = feed_plus(&mut rt, store, 3);
        rt.add_ref(a);
        rt.queues[0].enqueue(Element::Minus { tuple: a, ts: 3 });
        rt.queues[0].enqueue(Element::Heartbeat { ts: 4 });
        op.run(&mut rt, 10).unwrap();

        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        assert!(out.iter().all(|e| e.is_heartbeat()));
        assert_eq!(rt.stores.ref_count(a), 0);
    }

    #[test]
    fn test_departure_of_old_tuple_is_silent() {
        let (mut rt, store, mut op) = fixture();
        let a = feed_plus(&mut rt, store, 1);
        rt.queues[0].enqueue(Element::Heartbeat { ts: 2 });
        op.run(&mut rt, 10).unwrap();
        while rt.queues[1].dequeue().is_some() {}

        // a left the relation at ts 5; istream reports insertions only.
        rt.add_ref(a);
        rt.queues[0].enqueue(Element::Minus { tuple: a, ts: 5 });
        op.run(&mut rt, 10).unwrap();
        let out: Vec<Element> = std::iter::from_fn(|| rt.queues[1].dequeue()).collect();
        assert!(out.iter().all(|e| e.is_heartbeat()));
    }
}
