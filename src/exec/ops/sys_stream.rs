//! The system-stream generator.
//!
//! A clock operator with no logical inputs. Once per logical tick it
//! samples every entity's monitor counters into a measurement table, then
//! pushes the table as `SysStream` tuples to every attached monitor
//! queue. Each output keeps its own cursor, so a full queue resumes where
//! it stopped; a new tick resets all cursors, making emission idempotent
//! per tick.

use std::time::Instant;

use crate::error::RilletError;
use crate::exec::monitor::{
    ENTITY_OP, ENTITY_QUEUE, ENTITY_STORE, ENTITY_SYN, PROP_JOIN_SEL, PROP_OP_TIME,
    PROP_QUEUE_RATE, PROP_QUEUE_TS, PROP_STORE_SIZE, PROP_SYN_CARD, TICKS_PER_SEC,
};
use crate::exec::ops::TimeSlice;
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::layout::{set_fcol, set_icol};
use crate::types::Timestamp;

/// One sampled property value.
#[derive(Debug, Clone, Copy)]
struct Measure {
    entity: i32,
    id: i32,
    property: i32,
    ival: i32,
    fval: f32,
}

/// One monitor plan attached to the generator.
#[derive(Debug)]
pub struct SysOutput {
    pub queue: usize,
    pub store: u32,
    cursor: usize,
}

impl SysOutput {
    pub fn new(queue: usize, store: u32) -> Self {
        Self { queue, store, cursor: 0 }
    }
}

#[derive(Debug)]
pub struct SysStreamGen {
    pub id: usize,
    outputs: Vec<SysOutput>,
    measures: Vec<Measure>,
    started: Option<Instant>,
    last_ts: Timestamp,
    /// Previous samples, for per-tick deltas.
    last_op_secs: Vec<f64>,
    last_queue_counts: Vec<u64>,
}

impl SysStreamGen {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            outputs: Vec::new(),
            measures: Vec::new(),
            started: None,
            last_ts: 0,
            last_op_secs: Vec::new(),
            last_queue_counts: Vec::new(),
        }
    }

    /// Attach a monitor plan. Called at instantiation and again for each
    /// hot-inserted monitor query.
    pub fn add_output(&mut self, queue: usize, store: u32) {
        self.outputs.push(SysOutput::new(queue, store));
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// The current logical tick.
    fn now_ticks(&mut self) -> Timestamp {
        let started = self.started.get_or_insert_with(Instant::now);
        (started.elapsed().as_secs_f64() * TICKS_PER_SEC as f64) as Timestamp
    }

    pub fn run(&mut self, rt: &mut Runtime, _slice: TimeSlice) -> Result<(), RilletError> {
        if self.outputs.is_empty() {
            return Ok(());
        }

        let now = self.now_ticks();
        if now > self.last_ts {
            self.refresh(rt);
            self.last_ts = now;
            for out in &mut self.outputs {
                out.cursor = 0;
            }
        }

        let ts = self.last_ts;
        for out in &mut self.outputs {
            while out.cursor < self.measures.len() && !rt.queues[out.queue].is_full() {
                let m = self.measures[out.cursor];
                let tuple = rt.stores.new_tuple(out.store, &mut rt.mem)?;
                let bytes = rt.stores.tuple_mut(tuple);
                set_icol(bytes, 0, m.entity);
                set_icol(bytes, 1, m.id);
                set_icol(bytes, 2, m.property);
                set_icol(bytes, 3, m.ival);
                set_fcol(bytes, 4, m.fval);
                rt.queues[out.queue].enqueue(Element::Plus { tuple, ts });
                out.cursor += 1;
            }
        }
        Ok(())
    }

    /// Sample every monitored entity.
    fn refresh(&mut self, rt: &Runtime) {
        self.measures.clear();
        self.last_op_secs.resize(rt.op_monitors.len(), 0.0);
        self.last_queue_counts.resize(rt.queues.len(), 0);

        for (i, mon) in rt.op_monitors.iter().enumerate() {
            let secs = mon.timer.secs();
            let frac = (secs - self.last_op_secs[i]) * TICKS_PER_SEC as f64;
            self.last_op_secs[i] = secs;
            self.measures.push(Measure {
                entity: ENTITY_OP,
                id: i as i32,
                property: PROP_OP_TIME,
                ival: 0,
                fval: frac as f32,
            });
            if mon.is_join {
                let sel = if mon.num_input == 0 {
                    0.0
                } else {
                    mon.num_joined as f32 / mon.num_input as f32
                };
                self.measures.push(Measure {
                    entity: ENTITY_OP,
                    id: i as i32,
                    property: PROP_JOIN_SEL,
                    ival: 0,
                    fval: sel,
                });
            }
        }

        for (i, q) in rt.queues.iter().enumerate() {
            let stats = q.stats();
            let rate = stats.num_enqueued - self.last_queue_counts[i];
            self.last_queue_counts[i] = stats.num_enqueued;
            self.measures.push(Measure {
                entity: ENTITY_QUEUE,
                id: i as i32,
                property: PROP_QUEUE_RATE,
                ival: rate as i32,
                fval: 0.0,
            });
            self.measures.push(Measure {
                entity: ENTITY_QUEUE,
                id: i as i32,
                property: PROP_QUEUE_TS,
                ival: stats.last_ts as i32,
                fval: 0.0,
            });
        }

        for syn in &rt.synopses {
            self.measures.push(Measure {
                entity: ENTITY_SYN,
                id: syn.id as i32,
                property: PROP_SYN_CARD,
                ival: rt.syn_cardinality(syn.id) as i32,
                fval: 0.0,
            });
        }

        for i in 0..rt.stores.len() {
            self.measures.push(Measure {
                entity: ENTITY_STORE,
                id: i as i32,
                property: PROP_STORE_SIZE,
                ival: rt.stores.store(i as u32).num_pages() as i32,
                fval: 0.0,
            });
        }
    }
}
