//! Per-entity monitoring counters and the system-stream vocabulary.
//!
//! Operators, queues, synopses and stores each expose a handful of typed
//! properties. The system-stream generator samples them once per logical
//! tick and publishes `(Type, Id, Property, Ival, Fval)` tuples on
//! `SysStream` (table id 0), from which monitor queries are answered.
//!
//! Everything here is plain counters updated on the scheduler thread; the
//! generator reads them on the same thread, so no synchronization is
//! involved.

use std::time::{Duration, Instant};

use crate::types::{AttrType, Attr, Timestamp};

/// Name by which the system stream is referred to in queries.
pub const SYS_STREAM_NAME: &str = "SysStream";

/// Table id reserved for the system stream.
pub const SYS_STREAM_ID: usize = 0;

/// Fixed schema of the system stream.
pub fn sys_stream_schema() -> Vec<Attr> {
    vec![
        Attr { ty: AttrType::Int, len: 4 },   // Type
        Attr { ty: AttrType::Int, len: 4 },   // Id
        Attr { ty: AttrType::Int, len: 4 },   // Property
        Attr { ty: AttrType::Int, len: 4 },   // Ival
        Attr { ty: AttrType::Float, len: 4 }, // Fval
    ]
}

/// Number of logical time units per wall-clock second for the system
/// stream's clock.
pub const TICKS_PER_SEC: u64 = 5;

// ── Entity type codes (Type column) ────────────────────────────────────────

pub const ENTITY_OP: i32 = 0;
pub const ENTITY_QUEUE: i32 = 1;
pub const ENTITY_SYN: i32 = 2;
pub const ENTITY_STORE: i32 = 3;

// ── Property id codes (Property column) ────────────────────────────────────

/// Fraction of a tick an operator spent running since the last sample.
pub const PROP_OP_TIME: i32 = 0;
/// Elements enqueued on a queue since the last sample.
pub const PROP_QUEUE_RATE: i32 = 1;
/// Timestamp of the last element enqueued on a queue.
pub const PROP_QUEUE_TS: i32 = 2;
/// Output/input ratio of a join since the last sample.
pub const PROP_JOIN_SEL: i32 = 3;
/// Current cardinality of a synopsis.
pub const PROP_SYN_CARD: i32 = 4;
/// Pages currently held by a store.
pub const PROP_STORE_SIZE: i32 = 5;

// ── Timer ──────────────────────────────────────────────────────────────────

/// Accumulating stopwatch for operator run time.
#[derive(Debug, Default)]
pub struct Timer {
    total: Duration,
    started: Option<Instant>,
}

impl Timer {
    pub fn start(&mut self) {
        debug_assert!(self.started.is_none(), "timer started twice");
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(t0) = self.started.take() {
            self.total += t0.elapsed();
        }
    }

    pub fn secs(&self) -> f64 {
        self.total.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.total = Duration::ZERO;
        self.started = None;
    }
}

// ── Operator monitor ───────────────────────────────────────────────────────

/// Counters every operator carries; updated by the engine around each
/// `run` and by join operators as they process input.
#[derive(Debug, Default)]
pub struct OpMonitor {
    pub timer: Timer,
    pub last_out_ts: Timestamp,
    /// Join instrumentation: input elements seen (both sides).
    pub num_input: u64,
    /// Join instrumentation: output tuples produced.
    pub num_joined: u64,
    /// Whether this operator reports join selectivity.
    pub is_join: bool,
}

/// Counters for a synopsis.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynStats {
    pub num_tuples: usize,
    pub max_tuples: usize,
}

impl SynStats {
    pub fn record(&mut self, now: usize) {
        self.num_tuples = now;
        self.max_tuples = self.max_tuples.max(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_accumulates() {
        let mut t = Timer::default();
        t.start();
        std::thread::sleep(Duration::from_millis(2));
        t.stop();
        let first = t.secs();
        assert!(first > 0.0);
        t.start();
        t.stop();
        assert!(t.secs() >= first);
        t.reset();
        assert_eq!(t.secs(), 0.0);
    }

    #[test]
    fn test_syn_stats_track_max() {
        let mut s = SynStats::default();
        s.record(3);
        s.record(1);
        assert_eq!(s.num_tuples, 1);
        assert_eq!(s.max_tuples, 3);
    }

    #[test]
    fn test_sys_stream_schema_shape() {
        let schema = sys_stream_schema();
        assert_eq!(schema.len(), 5);
        assert_eq!(schema[4].ty, AttrType::Float);
    }
}
