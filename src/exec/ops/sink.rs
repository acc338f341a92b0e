//! The sink: a bit-bucket for unused branches.
//!
//! Consumes elements and drops their tuple references so memory is
//! reclaimed even when a plan fragment has no external output.

use crate::error::RilletError;
use crate::exec::ops::TimeSlice;
use crate::exec::runtime::Runtime;

#[derive(Debug)]
pub struct Sink {
    pub id: usize,
    input: usize,
}

impl Sink {
    pub fn new(id: usize, input: usize) -> Self {
        Self { id, input }
    }

    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        for _ in 0..slice {
            let Some(element) = rt.queues[self.input].dequeue() else {
                break;
            };
            if let Some(tuple) = element.tuple() {
                rt.decr_ref(tuple);
            }
        }
        Ok(())
    }
}
