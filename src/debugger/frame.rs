//! Stack and variable inspection.
//!
//! Frames are fetched lazily, only when the operator asks. A [`StackFrame`]
//! carries the suspension generation it was taken from: once the thread runs
//! again (resume or step) the generation moves on and every frame of the old
//! suspension answers [`Error::InvalidContext`] instead of stale data.

use crate::debugger::error::Error;
use crate::debugger::proto::transport::Wire;
use crate::debugger::proto::{Command, Location, Reply, ThreadId};
use crate::debugger::variable::VariableBinding;
use crate::debugger::Debugger;

/// One frame of a suspended thread's call stack, index 0 innermost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub thread: ThreadId,
    pub index: u32,
    pub location: Location,
    generation: u64,
}

impl Debugger {
    /// Call stack of a suspended thread, innermost frame first.
    pub fn frames(&self, thread: ThreadId) -> Result<Vec<StackFrame>, Error> {
        let generation = {
            let state = self.shared.lock_state();
            if state.detached {
                return Err(Error::SessionDetached);
            }
            // also rejects running and exited threads
            state.ctl.suspension_generation(thread)?
        };

        let descriptors = match self.shared.wire.request(Command::Frames { thread })? {
            Reply::Frames(descriptors) => descriptors,
            other => {
                return Err(Error::UnexpectedReply {
                    command: "frames",
                    got: other.name(),
                })
            }
        };

        // the thread may have resumed while the request was in flight
        self.check_generation(thread, generation)?;

        Ok(descriptors
            .into_iter()
            .map(|d| StackFrame {
                thread,
                index: d.index,
                location: d.location,
                generation,
            })
            .collect())
    }

    /// Local variable bindings visible in `frame`.
    ///
    /// Fails with [`Error::InvalidContext`] when the frame belongs to an
    /// earlier suspension of its thread.
    pub fn locals(&self, frame: &StackFrame) -> Result<Vec<VariableBinding>, Error> {
        {
            let state = self.shared.lock_state();
            if state.detached {
                return Err(Error::SessionDetached);
            }
            if state.ctl.suspension_generation(frame.thread)? != frame.generation {
                return Err(Error::InvalidContext);
            }
        }

        let bindings = match self.shared.wire.request(Command::Locals {
            thread: frame.thread,
            frame: frame.index,
        })? {
            Reply::Locals(bindings) => bindings,
            other => {
                return Err(Error::UnexpectedReply {
                    command: "locals",
                    got: other.name(),
                })
            }
        };

        self.check_generation(frame.thread, frame.generation)?;
        Ok(bindings)
    }

    fn check_generation(&self, thread: ThreadId, generation: u64) -> Result<(), Error> {
        let state = self.shared.lock_state();
        if state.ctl.suspension_generation(thread)? != generation {
            return Err(Error::InvalidContext);
        }
        Ok(())
    }
}
