//! Wire protocol contract between the engine and the target.
//!
//! The target exposes a length-prefixed binary packet endpoint, see [`codec`]
//! for the frame layout. This module defines the typed view of that protocol:
//! outbound [`Command`]s, their [`Reply`]s and asynchronous [`Event`]s.

pub mod codec;
pub mod transport;

use crate::debugger::variable::VariableBinding;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target-assigned thread handle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Target-assigned handle of an armed event request (breakpoint, watch).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct RequestHandle(pub u64);

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A resolved position in target code, immutable once produced by the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    /// Source line inside a source unit (class).
    Line { class: String, line: u32 },
    /// Byte offset inside a method body.
    Method {
        class: String,
        method: String,
        offset: u64,
    },
}

impl Location {
    pub fn class(&self) -> &str {
        match self {
            Location::Line { class, .. } => class,
            Location::Method { class, .. } => class,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Line { class, line } => write!(f, "{class}:{line}"),
            Location::Method {
                class,
                method,
                offset,
            } => write!(f, "{class}::{method}+{offset}"),
        }
    }
}

/// Step granularity requested by the operator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
    strum_macros::FromRepr,
)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum StepKind {
    Into = 0,
    Over = 1,
    Out = 2,
}

/// Frame descriptor as shipped by the target, index 0 is the innermost frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    pub index: u32,
    pub location: Location,
}

/// Outbound protocol command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    ListThreads,
    ResolveLine { class: String, line: u32 },
    ResolveMethod { class: String, method: String },
    SetBreakpoint { location: Location },
    ClearBreakpoint { handle: RequestHandle },
    SetExceptionWatch { class_pattern: String },
    ClearExceptionWatch { handle: RequestHandle },
    Suspend { thread: ThreadId },
    Resume { thread: ThreadId },
    SuspendAll,
    ResumeAll,
    Step { thread: ThreadId, kind: StepKind },
    Frames { thread: ThreadId },
    Locals { thread: ThreadId, frame: u32 },
    Dispose,
}

impl Command {
    /// Stable command name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ListThreads => "list-threads",
            Command::ResolveLine { .. } => "resolve-line",
            Command::ResolveMethod { .. } => "resolve-method",
            Command::SetBreakpoint { .. } => "set-breakpoint",
            Command::ClearBreakpoint { .. } => "clear-breakpoint",
            Command::SetExceptionWatch { .. } => "set-exception-watch",
            Command::ClearExceptionWatch { .. } => "clear-exception-watch",
            Command::Suspend { .. } => "suspend",
            Command::Resume { .. } => "resume",
            Command::SuspendAll => "suspend-all",
            Command::ResumeAll => "resume-all",
            Command::Step { .. } => "step",
            Command::Frames { .. } => "frames",
            Command::Locals { .. } => "locals",
            Command::Dispose => "dispose",
        }
    }
}

/// Reply to an outbound command, correlated by packet sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Threads(Vec<ThreadId>),
    Resolved { location: Location },
    /// Resolution target class is not loaded yet, the caller should defer.
    ClassNotLoaded,
    RequestSet { handle: RequestHandle },
    Frames(Vec<FrameDescriptor>),
    Locals(Vec<VariableBinding>),
    Error { code: u16, message: String },
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Ack => "ack",
            Reply::Threads(_) => "threads",
            Reply::Resolved { .. } => "resolved",
            Reply::ClassNotLoaded => "class-not-loaded",
            Reply::RequestSet { .. } => "request-set",
            Reply::Frames(_) => "frames",
            Reply::Locals(_) => "locals",
            Reply::Error { .. } => "error",
        }
    }
}

/// Asynchronous event delivered by the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    ClassPrepared {
        class: String,
    },
    ClassUnloaded {
        class: String,
    },
    /// The target suspended `thread` on an armed breakpoint.
    BreakpointHit {
        thread: ThreadId,
        handle: RequestHandle,
        location: Location,
    },
    /// A previously requested step finished, `thread` is suspended again.
    StepComplete {
        thread: ThreadId,
        location: Location,
    },
    ExceptionThrown {
        thread: ThreadId,
        class: String,
        message: String,
        location: Option<Location>,
    },
    TargetExit {
        code: i32,
    },
    /// Terminal event, the connection to the target is gone.
    Disconnected,
}

impl Event {
    /// Thread this event belongs to, if any.
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Event::ThreadStart { thread }
            | Event::ThreadDeath { thread }
            | Event::BreakpointHit { thread, .. }
            | Event::StepComplete { thread, .. }
            | Event::ExceptionThrown { thread, .. } => Some(*thread),
            _ => None,
        }
    }

    /// True for events after which no further events can arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::TargetExit { .. } | Event::Disconnected)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::ThreadStart { .. } => "thread-start",
            Event::ThreadDeath { .. } => "thread-death",
            Event::ClassPrepared { .. } => "class-prepared",
            Event::ClassUnloaded { .. } => "class-unloaded",
            Event::BreakpointHit { .. } => "breakpoint-hit",
            Event::StepComplete { .. } => "step-complete",
            Event::ExceptionThrown { .. } => "exception-thrown",
            Event::TargetExit { .. } => "target-exit",
            Event::Disconnected => "disconnected",
        }
    }
}
