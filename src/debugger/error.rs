use crate::debugger::breakpoint::{BreakpointId, WatchId};
use crate::debugger::proto::ThreadId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("invalid class pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    // --------------------------------- transport errors ------------------------------------------
    /// Connection to the target is gone. Fatal to the session, all pending
    /// commands fail with this error.
    #[error("transport closed")]
    TransportClosed,
    /// No reply within the configured bound. The command must not be retried
    /// automatically, retrying a suspend/resume could double-apply.
    #[error("no reply for `{0}` within {1:?}")]
    CommandTimeout(&'static str, std::time::Duration),
    /// The session is detached, all in-flight and future commands fail this way.
    #[error("session detached")]
    SessionDetached,
    #[error("handshake rejected by target")]
    Handshake,

    // --------------------------------- protocol errors -------------------------------------------
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("unexpected reply for `{command}`: {got}")]
    UnexpectedReply {
        command: &'static str,
        got: &'static str,
    },
    #[error("target error reply {code}: {message}")]
    ErrorReply { code: u16, message: String },

    // --------------------------------- execution control errors ----------------------------------
    /// Stale frame/thread reference or a command that requires a suspended
    /// context issued against a running thread. Recoverable, re-fetch and retry.
    #[error("invalid context: thread resumed or not suspended")]
    InvalidContext,
    #[error("a step request is already pending for thread {0}")]
    StepAlreadyPending(ThreadId),
    #[error("thread {0} not found")]
    ThreadNotFound(ThreadId),
    #[error("thread {0} already exited")]
    ThreadExited(ThreadId),

    // --------------------------------- registry errors -------------------------------------------
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(BreakpointId),
    #[error("exception watch {0} not found")]
    WatchNotFound(WatchId),

    // --------------------------------- record/replay errors --------------------------------------
    #[error("recording already active")]
    AlreadyRecording,
    #[error("recording is not active")]
    NotRecording,
    #[error("trace format error: {0}")]
    TraceFormat(#[from] serde_json::Error),
    #[error("replay diverged from the recorded session: {0}")]
    ReplayDivergence(String),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),

    #[error("multiple failures: {0:?}")]
    Multiple(Vec<Error>),
}

impl Error {
    /// Return a hint to a front-end - continue debugging after error or tear the session down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::InvalidPattern(_) => false,
            Error::CommandTimeout(_, _) => false,
            Error::MalformedPacket(_) => false,
            Error::UnexpectedReply { .. } => false,
            Error::ErrorReply { .. } => false,
            Error::InvalidContext => false,
            Error::StepAlreadyPending(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::ThreadExited(_) => false,
            Error::BreakpointNotFound(_) => false,
            Error::WatchNotFound(_) => false,
            Error::AlreadyRecording => false,
            Error::NotRecording => false,
            Error::TraceFormat(_) => false,
            Error::ReplayDivergence(_) => false,
            Error::Hook(_) => false,
            Error::Multiple(_) => false,

            // currently fatal errors
            Error::TransportClosed => true,
            Error::SessionDetached => true,
            Error::Handshake => true,
        }
    }
}
