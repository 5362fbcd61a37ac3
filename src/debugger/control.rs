//! Execution controller.
//!
//! Single authority over the running/suspended state of every target thread.
//! All mutations happen under the session state lock, the controller itself
//! never talks to the wire: callers validate here, issue the protocol command
//! without the lock, then commit here.
//!
//! Suspension is counted: independent suspend reasons stack, a thread is
//! actually running only at depth 0. The depth can never go negative, a
//! resume against depth 0 is rejected before any command is sent.

use crate::debugger::error::Error;
use crate::debugger::proto::{StepKind, ThreadId};
use log::debug;
use std::collections::HashMap;

/// Thread lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ThreadStatus {
    Running,
    Suspended,
    Exited,
}

/// Engine-side view of one target thread.
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    pub thread: ThreadId,
    pub status: ThreadStatus,
    /// Count of independent suspend reasons. `status == Suspended` iff > 0.
    pub suspend_depth: u32,
    /// Bumped on every suspended-to-running transition. Frame and variable
    /// views capture it to detect staleness.
    pub generation: u64,
    /// Outstanding step request, at most one per thread.
    pub pending_step: Option<StepKind>,
}

impl ThreadSnapshot {
    fn new(thread: ThreadId) -> Self {
        ThreadSnapshot {
            thread,
            status: ThreadStatus::Running,
            suspend_depth: 0,
            generation: 0,
            pending_step: None,
        }
    }
}

/// Per-thread execution state machine table.
pub struct ExecutionCtl {
    threads: HashMap<ThreadId, ThreadSnapshot>,
}

impl ExecutionCtl {
    pub fn new() -> Self {
        ExecutionCtl {
            threads: HashMap::new(),
        }
    }

    pub fn register(&mut self, thread: ThreadId) {
        debug!(target: "control", "thread {thread} registered");
        self.threads
            .entry(thread)
            .or_insert_with(|| ThreadSnapshot::new(thread));
    }

    /// Like [`register`](Self::register) but silent, for threads first seen
    /// mid-flight (replay, or events beating the thread-start notification).
    fn ensure(&mut self, thread: ThreadId) -> &mut ThreadSnapshot {
        self.threads
            .entry(thread)
            .or_insert_with(|| ThreadSnapshot::new(thread))
    }

    pub fn get(&self, thread: ThreadId) -> Result<&ThreadSnapshot, Error> {
        self.threads
            .get(&thread)
            .ok_or(Error::ThreadNotFound(thread))
    }

    /// Snapshot of every known thread.
    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        let mut all: Vec<_> = self.threads.values().cloned().collect();
        all.sort_by_key(|t| t.thread);
        all
    }

    pub fn on_thread_death(&mut self, thread: ThreadId) {
        let snap = self.ensure(thread);
        debug!(target: "control", "thread {thread} exited");
        snap.status = ThreadStatus::Exited;
        snap.suspend_depth = 0;
        snap.pending_step = None;
    }

    /// Mark every live thread exited, on target exit.
    pub fn on_target_exit(&mut self) {
        for snap in self.threads.values_mut() {
            snap.status = ThreadStatus::Exited;
            snap.suspend_depth = 0;
            snap.pending_step = None;
        }
    }

    /// Target stopped `thread` (breakpoint, step, exception or manual
    /// suspend acknowledged by an event).
    pub fn on_stop(&mut self, thread: ThreadId) {
        let snap = self.ensure(thread);
        snap.suspend_depth += 1;
        snap.status = ThreadStatus::Suspended;
        debug!(
            target: "control",
            "thread {thread} suspended, depth {}", snap.suspend_depth
        );
    }

    /// A pending step finished, the thread is suspended at the step target.
    pub fn on_step_complete(&mut self, thread: ThreadId) {
        let snap = self.ensure(thread);
        snap.pending_step = None;
        snap.suspend_depth += 1;
        snap.status = ThreadStatus::Suspended;
        debug!(
            target: "control",
            "thread {thread} finished step, depth {}", snap.suspend_depth
        );
    }

    fn expect_suspended(&self, thread: ThreadId) -> Result<&ThreadSnapshot, Error> {
        let snap = self.get(thread)?;
        match snap.status {
            ThreadStatus::Suspended => Ok(snap),
            ThreadStatus::Running => Err(Error::InvalidContext),
            ThreadStatus::Exited => Err(Error::ThreadExited(thread)),
        }
    }

    /// Validate a resume request. Returns true when the decrement will reach
    /// depth 0 and the underlying thread must actually be resumed.
    pub fn validate_resume(&self, thread: ThreadId) -> Result<bool, Error> {
        let snap = self.expect_suspended(thread)?;
        Ok(snap.suspend_depth == 1)
    }

    /// Commit a resume after the protocol command went out.
    pub fn apply_resume(&mut self, thread: ThreadId) {
        if let Some(snap) = self.threads.get_mut(&thread) {
            snap.suspend_depth = snap.suspend_depth.saturating_sub(1);
            if snap.suspend_depth == 0 && snap.status == ThreadStatus::Suspended {
                snap.status = ThreadStatus::Running;
                snap.generation += 1;
            }
            debug!(
                target: "control",
                "thread {thread} resume committed, depth {}", snap.suspend_depth
            );
        }
    }

    /// Validate a manual suspend request.
    pub fn validate_suspend(&self, thread: ThreadId) -> Result<(), Error> {
        let snap = self.get(thread)?;
        if snap.status == ThreadStatus::Exited {
            return Err(Error::ThreadExited(thread));
        }
        Ok(())
    }

    /// Commit a manual suspend after the protocol command went out.
    pub fn apply_suspend(&mut self, thread: ThreadId) {
        let snap = self.ensure(thread);
        if snap.status == ThreadStatus::Exited {
            return;
        }
        snap.suspend_depth += 1;
        snap.status = ThreadStatus::Suspended;
    }

    /// Validate a step request: only against a suspended context and only one
    /// outstanding step per thread.
    pub fn validate_step(&self, thread: ThreadId) -> Result<(), Error> {
        let snap = self.get(thread)?;
        if snap.pending_step.is_some() {
            return Err(Error::StepAlreadyPending(thread));
        }
        match snap.status {
            ThreadStatus::Suspended => Ok(()),
            ThreadStatus::Running => Err(Error::InvalidContext),
            ThreadStatus::Exited => Err(Error::ThreadExited(thread)),
        }
    }

    /// Commit a step: the step request releases one suspend reason, the
    /// thread runs again once the depth reaches 0.
    pub fn apply_step(&mut self, thread: ThreadId, kind: StepKind) {
        if let Some(snap) = self.threads.get_mut(&thread) {
            snap.pending_step = Some(kind);
            snap.suspend_depth = snap.suspend_depth.saturating_sub(1);
            if snap.suspend_depth == 0 {
                snap.status = ThreadStatus::Running;
                snap.generation += 1;
            }
            debug!(target: "control", "thread {thread} stepping ({kind})");
        }
    }

    /// Commit a suspend-all: every live thread gains one suspend reason,
    /// updated together under one lock so the operator observes the batch
    /// atomically.
    pub fn apply_suspend_all(&mut self) {
        for snap in self.threads.values_mut() {
            if snap.status == ThreadStatus::Exited {
                continue;
            }
            snap.suspend_depth += 1;
            snap.status = ThreadStatus::Suspended;
        }
        debug!(target: "control", "all threads suspended");
    }

    /// Commit a resume-all: drops one suspend reason where present.
    pub fn apply_resume_all(&mut self) {
        for snap in self.threads.values_mut() {
            if snap.status != ThreadStatus::Suspended {
                continue;
            }
            snap.suspend_depth = snap.suspend_depth.saturating_sub(1);
            if snap.suspend_depth == 0 {
                snap.status = ThreadStatus::Running;
                snap.generation += 1;
            }
        }
        debug!(target: "control", "all threads released by one suspend level");
    }

    /// Current generation of a suspended thread, for frame staleness checks.
    pub fn suspension_generation(&self, thread: ThreadId) -> Result<u64, Error> {
        Ok(self.expect_suspended(thread)?.generation)
    }
}

impl Default for ExecutionCtl {
    fn default() -> Self {
        Self::new()
    }
}
