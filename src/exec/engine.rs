//! The engine: the runtime arena plus the instantiated operators.
//!
//! Operators and shared entities live in separate fields so one pass can
//! hand each operator a mutable borrow of the whole arena. Operator ids
//! are indices into both `ops` and `rt.op_monitors`.

use crate::error::RilletError;
use crate::exec::ops::{Operator, TimeSlice};
use crate::exec::runtime::Runtime;

#[derive(Debug)]
pub struct Engine {
    pub rt: Runtime,
    pub ops: Vec<Operator>,
}

impl Engine {
    pub fn new(rt: Runtime) -> Self {
        Self { rt, ops: Vec::new() }
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Run every operator once for `slice` elements, timing each around
    /// its `run` for the operator monitor.
    ///
    /// A non-zero status from any operator aborts the pass and propagates.
    pub fn run_pass(&mut self, slice: TimeSlice) -> Result<(), RilletError> {
        for (i, op) in self.ops.iter_mut().enumerate() {
            self.rt.op_monitors[i].timer.start();
            let result = op.run(&mut self.rt, slice);
            self.rt.op_monitors[i].timer.stop();
            if let Err(e) = &result {
                tracing::error!(op = i, kind = op.kind_name(), error = %e, "operator failed");
            }
            result?;
        }
        Ok(())
    }
}
