//! Physical operators.
//!
//! Every operator exposes `run(rt, time_slice)`, consuming up to
//! `time_slice` input elements. The scheduler dispatches through the
//! [`Operator`] enum — the variant set is closed, and driver code (engine
//! pass, monitor refresh) matches on it exhaustively.
//!
//! # Shared conventions
//!
//! *Reference protocol.* Every PLUS/MINUS element owns one reference to
//! its tuple. Enqueueing transfers that reference downstream; a consumer
//! must forward the tuple, hand the reference to a synopsis, or drop it
//! with `decr_ref`. An operator keeping a tuple in a synopsis *and*
//! forwarding it takes an extra reference.
//!
//! *Stall recovery.* Operators that can emit several elements per input
//! buffer their not-yet-enqueued output in a [`Pending`] list and drain it
//! before touching new input, so a full output queue never loses progress
//! and the saved elements go out first on the next slice. Single-output
//! operators simply check `is_full` before dequeuing.
//!
//! *Heartbeats.* Every operator tracks `last_input_ts` / `last_output_ts`
//! and, when a slice ends without producing anything that new, forwards
//! time with `Heartbeat(last_input_ts)` so windows and joins downstream
//! keep moving.

use std::collections::VecDeque;

use crate::error::RilletError;
use crate::exec::queue::Element;
use crate::exec::runtime::Runtime;
use crate::types::Timestamp;

pub mod distinct;
pub mod dstream;
pub mod except;
pub mod group_aggr;
pub mod istream;
pub mod join;
pub mod output;
pub mod partn_win;
pub mod project;
pub mod range_win;
pub mod rstream;
pub mod row_win;
pub mod select;
pub mod sink;
pub mod source;
pub mod str_join;
pub mod sys_stream;
pub mod union;

pub use distinct::Distinct;
pub use dstream::Dstream;
pub use except::Except;
pub use group_aggr::GroupAggr;
pub use istream::Istream;
pub use join::Join;
pub use output::OutputOp;
pub use partn_win::PartnWindow;
pub use project::Project;
pub use range_win::RangeWindow;
pub use rstream::Rstream;
pub use row_win::RowWindow;
pub use select::Select;
pub use sink::Sink;
pub use source::{RelnSource, StreamSource};
pub use str_join::StreamJoin;
pub use sys_stream::SysStreamGen;
pub use union::Union;

/// Number of input elements one `run` may consume.
pub type TimeSlice = u32;

/// The closed set of physical operators.
#[derive(Debug)]
pub enum Operator {
    Select(Select),
    Project(Project),
    RowWindow(RowWindow),
    RangeWindow(RangeWindow),
    PartnWindow(PartnWindow),
    Join(Join),
    StreamJoin(StreamJoin),
    GroupAggr(GroupAggr),
    Distinct(Distinct),
    Istream(Istream),
    Dstream(Dstream),
    Rstream(Rstream),
    Union(Union),
    Except(Except),
    StreamSource(StreamSource),
    RelnSource(RelnSource),
    Output(OutputOp),
    Sink(Sink),
    SysStreamGen(SysStreamGen),
}

impl Operator {
    pub fn run(&mut self, rt: &mut Runtime, slice: TimeSlice) -> Result<(), RilletError> {
        match self {
            Operator::Select(op) => op.run(rt, slice),
            Operator::Project(op) => op.run(rt, slice),
            Operator::RowWindow(op) => op.run(rt, slice),
            Operator::RangeWindow(op) => op.run(rt, slice),
            Operator::PartnWindow(op) => op.run(rt, slice),
            Operator::Join(op) => op.run(rt, slice),
            Operator::StreamJoin(op) => op.run(rt, slice),
            Operator::GroupAggr(op) => op.run(rt, slice),
            Operator::Distinct(op) => op.run(rt, slice),
            Operator::Istream(op) => op.run(rt, slice),
            Operator::Dstream(op) => op.run(rt, slice),
            Operator::Rstream(op) => op.run(rt, slice),
            Operator::Union(op) => op.run(rt, slice),
            Operator::Except(op) => op.run(rt, slice),
            Operator::StreamSource(op) => op.run(rt, slice),
            Operator::RelnSource(op) => op.run(rt, slice),
            Operator::Output(op) => op.run(rt, slice),
            Operator::Sink(op) => op.run(rt, slice),
            Operator::SysStreamGen(op) => op.run(rt, slice),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Operator::Select(_) => "select",
            Operator::Project(_) => "project",
            Operator::RowWindow(_) => "row-window",
            Operator::RangeWindow(_) => "range-window",
            Operator::PartnWindow(_) => "partition-window",
            Operator::Join(_) => "join",
            Operator::StreamJoin(_) => "stream-join",
            Operator::GroupAggr(_) => "group-aggr",
            Operator::Distinct(_) => "distinct",
            Operator::Istream(_) => "istream",
            Operator::Dstream(_) => "dstream",
            Operator::Rstream(_) => "rstream",
            Operator::Union(_) => "union",
            Operator::Except(_) => "except",
            Operator::StreamSource(_) => "stream-source",
            Operator::RelnSource(_) => "relation-source",
            Operator::Output(_) => "output",
            Operator::Sink(_) => "sink",
            Operator::SysStreamGen(_) => "sys-stream-gen",
        }
    }
}

// ── Pending output buffer ──────────────────────────────────────────────────

/// Output elements produced but not yet enqueued. The invariant all
/// operators uphold: `drain` runs to empty before any new element is
/// produced, so a stalled element is always re-enqueued first.
#[derive(Debug, Default)]
pub struct Pending {
    buf: VecDeque<Element>,
}

impl Pending {
    pub fn push(&mut self, e: Element) {
        self.buf.push_back(e);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Enqueue as much as possible; returns `true` when fully drained.
    pub fn drain(&mut self, rt: &mut Runtime, queue: usize, last_output_ts: &mut Timestamp) -> bool {
        while let Some(&e) = self.buf.front() {
            if !rt.queues[queue].enqueue(e) {
                return false;
            }
            *last_output_ts = (*last_output_ts).max(e.timestamp());
            self.buf.pop_front();
        }
        true
    }
}

// ── Heartbeat generation ───────────────────────────────────────────────────

/// End-of-slice heartbeat rule: assert to the operator downstream that
/// nothing older than `last_input_ts` will be produced.
pub(crate) fn generate_heartbeat(
    rt: &mut Runtime,
    queue: usize,
    last_input_ts: Timestamp,
    last_output_ts: &mut Timestamp,
) {
    if *last_output_ts < last_input_ts && !rt.queues[queue].is_full() {
        rt.queues[queue].enqueue(Element::Heartbeat { ts: last_input_ts });
        *last_output_ts = last_input_ts;
    }
}

// ── Two-input ordering ─────────────────────────────────────────────────────

/// Which input of a binary operator to read next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

/// Pick the input whose next element is safe to process, establishing
/// cross-input order by timestamp. An element on one side is safe when the
/// other side cannot later produce anything older — either its queue head
/// is newer, or its last seen timestamp already covers it. Ties prefer the
/// left side, making output order deterministic.
pub(crate) fn next_side(
    rt: &Runtime,
    left_q: usize,
    right_q: usize,
    last_left_ts: Timestamp,
    last_right_ts: Timestamp,
) -> Option<Side> {
    let left = rt.queues[left_q].peek().map(|e| e.timestamp());
    let right = rt.queues[right_q].peek().map(|e| e.timestamp());
    match (left, right) {
        (Some(l), Some(r)) => {
            if l <= r {
                Some(Side::Left)
            } else {
                Some(Side::Right)
            }
        }
        (Some(l), None) if l <= last_right_ts => Some(Side::Left),
        (None, Some(r)) if r <= last_left_ts => Some(Side::Right),
        _ => None,
    }
}
