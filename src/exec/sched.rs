//! The round-robin scheduler and the execution interlock.
//!
//! Scheduling is cooperative and single-threaded: the scheduler loop
//! repeatedly gives every operator one `run(slice)` in registration
//! order. Control threads interact only between passes, through
//! [`ExecControl`] — one mutex and two condition variables:
//!
//! - `stop` flips the state to `End`; the loop notices after the current
//!   pass, so termination latency is bounded by one pass.
//! - `interrupt` parks the scheduler loop: the interrupter waits on
//!   `interrupt_waits` until the loop has actually parked on
//!   `main_waits`, does its critical work (e.g. instantiating a monitor
//!   plan), and `resume`s. Plan mutation is thereby linearized between
//!   passes, never inside one.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::RilletError;
use crate::exec::engine::Engine;
use crate::exec::ops::TimeSlice;

/// Elements an operator may consume per invocation.
pub const DEFAULT_TIME_SLICE: TimeSlice = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Exec,
    /// An interrupter asked the loop to park.
    Interrupting,
    /// The loop is parked; the interrupter owns the engine.
    Parked,
    End,
}

/// Shared control state between the scheduler thread and controllers.
#[derive(Debug)]
pub struct ExecControl {
    state: Mutex<RunState>,
    interrupt_waits: Condvar,
    main_waits: Condvar,
}

impl Default for ExecControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
            interrupt_waits: Condvar::new(),
            main_waits: Condvar::new(),
        }
    }

    /// Request termination. Takes effect after the current pass.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        *state = RunState::End;
        // A parked loop must wake to observe the stop.
        self.main_waits.notify_all();
        self.interrupt_waits.notify_all();
    }

    /// Park the scheduler loop between passes. Returns `true` once the
    /// loop is parked and the caller may touch the engine; `false` if
    /// execution is not running (the engine is free anyway).
    pub fn interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if *state != RunState::Exec {
            return false;
        }
        *state = RunState::Interrupting;
        while *state == RunState::Interrupting {
            self.interrupt_waits.wait(&mut state);
        }
        *state == RunState::Parked
    }

    /// Release a parked scheduler loop.
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == RunState::Parked {
            *state = RunState::Exec;
        }
        self.main_waits.notify_all();
    }

    fn begin(&self) {
        let mut state = self.state.lock();
        // A stop issued before the run started must win.
        if *state == RunState::Idle {
            *state = RunState::Exec;
        }
    }

    /// Between-pass check on the scheduler thread. Parks if an
    /// interrupter is waiting. Returns `false` when execution should end.
    fn checkpoint(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            match *state {
                RunState::Exec => return true,
                RunState::End => return false,
                RunState::Interrupting => {
                    *state = RunState::Parked;
                    self.interrupt_waits.notify_all();
                    self.main_waits.wait(&mut state);
                }
                RunState::Parked => {
                    // Spurious wakeup while the interrupter still works.
                    self.main_waits.wait(&mut state);
                }
                RunState::Idle => return false,
            }
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        *state = RunState::End;
        // Wake anyone still waiting for a park that will never come.
        self.interrupt_waits.notify_all();
        self.main_waits.notify_all();
    }
}

/// The round-robin scheduler.
#[derive(Debug)]
pub struct RoundRobinScheduler {
    time_slice: TimeSlice,
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TIME_SLICE)
    }
}

impl RoundRobinScheduler {
    pub fn new(time_slice: TimeSlice) -> Self {
        Self { time_slice }
    }

    /// Drive the engine for `total_units` passes; 0 means run until
    /// stopped. The engine sits behind a mutex only so interrupters can
    /// reach it while the loop is parked — the lock is uncontended while
    /// the loop runs.
    pub fn run(
        &self,
        engine: &Arc<Mutex<Engine>>,
        control: &Arc<ExecControl>,
        total_units: u64,
    ) -> Result<(), RilletError> {
        control.begin();
        let mut passes: u64 = 0;

        let result = loop {
            if !control.checkpoint() {
                break Ok(());
            }
            if let Err(e) = engine.lock().run_pass(self.time_slice) {
                break Err(e);
            }
            passes += 1;
            if total_units != 0 && passes >= total_units {
                break Ok(());
            }
        };

        control.finish();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::exec::memory::MemoryManager;
    use crate::exec::monitor::OpMonitor;
    use crate::exec::ops::{Operator, Sink};
    use crate::exec::queue::Element;
    use crate::exec::runtime::Runtime;

    fn engine_with_sink() -> Arc<Mutex<Engine>> {
        let mut engine = Engine::new(Runtime::new(MemoryManager::new(16 * PAGE_SIZE, PAGE_SIZE)));
        let q = engine.rt.add_queue(8);
        engine.rt.queues[q].enqueue(Element::Heartbeat { ts: 1 });
        engine.rt.op_monitors.push(OpMonitor::default());
        engine.ops.push(Operator::Sink(Sink::new(0, q)));
        Arc::new(Mutex::new(engine))
    }

    #[test]
    fn test_bounded_run_terminates() {
        let engine = engine_with_sink();
        let control = Arc::new(ExecControl::new());
        RoundRobinScheduler::default()
            .run(&engine, &control, 3)
            .unwrap();
        assert!(engine.lock().rt.queues[0].is_empty());
    }

    #[test]
    fn test_stop_from_another_thread() {
        let engine = engine_with_sink();
        let control = Arc::new(ExecControl::new());
        let c2 = control.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            c2.stop();
        });
        // Unbounded run; must end shortly after stop.
        RoundRobinScheduler::default()
            .run(&engine, &control, 0)
            .unwrap();
        stopper.join().unwrap();
    }

    #[test]
    fn test_interrupt_parks_loop_and_hands_over_engine() {
        let engine = engine_with_sink();
        let control = Arc::new(ExecControl::new());
        let (e2, c2) = (engine.clone(), control.clone());

        let interrupter = std::thread::spawn(move || {
            // Wait until the loop is actually running.
            std::thread::sleep(std::time::Duration::from_millis(20));
            if c2.interrupt() {
                // The loop is parked: the engine lock is free for us.
                let mut eng = e2.lock();
                let q = eng.rt.add_queue(4);
                drop(eng);
                c2.resume();
                std::thread::sleep(std::time::Duration::from_millis(10));
                c2.stop();
                Some(q)
            } else {
                c2.stop();
                None
            }
        });

        RoundRobinScheduler::default()
            .run(&engine, &control, 0)
            .unwrap();
        let added = interrupter.join().unwrap();
        if let Some(q) = added {
            assert!(engine.lock().rt.queues.len() > q);
        }
    }

    #[test]
    fn test_interrupt_when_idle_returns_false() {
        let control = ExecControl::new();
        assert!(!control.interrupt());
    }
}
