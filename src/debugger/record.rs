//! Session recording and deterministic replay.
//!
//! The recorder sits between the engine and the live wire: every inbound
//! event is appended to the trace before the event loop sees it, every
//! outbound command is appended together with its outcome. The trace is an
//! append-only list of self-describing JSON lines, one entry per line.
//!
//! The replayer implements the same [`Wire`] contract over a loaded trace.
//! Inbound entries are re-exposed in recorded order, and an event is held
//! back until every command recorded ahead of it has been issued again -
//! this reproduces the original pacing, so the thread-state transitions of a
//! replayed session match the live one exactly.

use crate::debugger::error::Error;
use crate::debugger::proto::transport::Wire;
use crate::debugger::proto::{Command, Event, Reply};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// How long a replayed `next_event` may wait for the driver to re-issue the
/// commands recorded ahead of the event.
const REPLAY_PACING_BOUND: Duration = Duration::from_secs(5);

/// Flow direction of one trace entry, seen from the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Result of a recorded command, replayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Reply(Reply),
    TimedOut,
    Closed,
}

/// One record of the session trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub dir: Direction,
    pub payload: TracePayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TracePayload {
    Event(Event),
    Command { command: Command, outcome: Outcome },
}

impl TraceEntry {
    fn event(event: &Event) -> Self {
        TraceEntry {
            at: Utc::now(),
            dir: Direction::Inbound,
            payload: TracePayload::Event(event.clone()),
        }
    }

    fn command(command: Command, outcome: Outcome) -> Self {
        TraceEntry {
            at: Utc::now(),
            dir: Direction::Outbound,
            payload: TracePayload::Command { command, outcome },
        }
    }
}

/// A complete recorded session, read-only during replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    /// Parse a JSON-lines trace, empty lines ignored.
    pub fn read_from(reader: impl Read) -> Result<Trace, Error> {
        let mut entries = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(Trace { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    /// Inbound events of the trace, in recorded order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter().filter_map(|e| match &e.payload {
            TracePayload::Event(event) => Some(event),
            _ => None,
        })
    }
}

// ---------------------------------- recorder ----------------------------------

struct Tape {
    sink: Box<dyn Write + Send>,
    written: usize,
}

impl Tape {
    fn append(&mut self, entry: &TraceEntry) -> Result<(), Error> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.sink.write_all(&line)?;
        self.sink.flush()?;
        self.written += 1;
        Ok(())
    }
}

/// [`Wire`] pass-through with a toggleable recording tape.
///
/// The event loop holds this wrapper for the whole session lifetime, so
/// starting or stopping a recording never disturbs event consumption.
pub struct RecordedWire {
    inner: Box<dyn Wire>,
    tape: Mutex<Option<Tape>>,
}

impl RecordedWire {
    pub fn new(inner: Box<dyn Wire>) -> Self {
        RecordedWire {
            inner,
            tape: Mutex::new(None),
        }
    }

    pub fn start_recording(&self, sink: Box<dyn Write + Send>) -> Result<(), Error> {
        let mut tape = self.tape.lock().expect("lock poisoned");
        if tape.is_some() {
            return Err(Error::AlreadyRecording);
        }
        debug!(target: "recorder", "recording started");
        *tape = Some(Tape { sink, written: 0 });
        Ok(())
    }

    /// Stop recording, returning the number of entries written.
    pub fn stop_recording(&self) -> Result<usize, Error> {
        let mut slot = self.tape.lock().expect("lock poisoned");
        let mut tape = slot.take().ok_or(Error::NotRecording)?;
        tape.sink.flush()?;
        debug!(target: "recorder", "recording stopped, {} entries", tape.written);
        Ok(tape.written)
    }

    fn record(&self, entry: TraceEntry) {
        if let Some(tape) = self.tape.lock().expect("lock poisoned").as_mut() {
            // a full sink stops the tape, never the session
            if let Err(e) = tape.append(&entry) {
                log::warn!(target: "recorder", "trace append failed, recording aborted: {e}");
            }
        }
    }
}

impl Wire for RecordedWire {
    fn request(&self, command: Command) -> Result<Reply, Error> {
        let result = self.inner.request(command.clone());
        let outcome = match &result {
            Ok(reply) => Outcome::Reply(reply.clone()),
            Err(Error::CommandTimeout(_, _)) => Outcome::TimedOut,
            Err(_) => Outcome::Closed,
        };
        self.record(TraceEntry::command(command, outcome));
        result
    }

    fn next_event(&self) -> Result<Event, Error> {
        let event = self.inner.next_event()?;
        // ground truth first: the entry lands on the tape before any handler
        // can observe (or fail on) the event
        self.record(TraceEntry::event(&event));
        Ok(event)
    }

    fn close(&self) {
        self.inner.close()
    }
}

// ---------------------------------- replayer ----------------------------------

struct ReplayState {
    /// Remaining trace, front is the next entry to re-expose.
    rest: VecDeque<TraceEntry>,
    /// Outbound entries already passed by the event cursor but not yet
    /// consumed by a matching `request`.
    due_commands: Vec<(Command, Outcome)>,
    delivered_terminal: bool,
    closed: bool,
}

impl ReplayState {
    /// Move leading outbound entries into the due list.
    fn release_due(&mut self) {
        while matches!(
            self.rest.front(),
            Some(TraceEntry {
                dir: Direction::Outbound,
                ..
            })
        ) {
            let entry = self.rest.pop_front().expect("checked front");
            if let TracePayload::Command { command, outcome } = entry.payload {
                self.due_commands.push((command, outcome));
            }
        }
    }

    fn take_outcome(&mut self, command: &Command) -> Option<Outcome> {
        if let Some(pos) = self.due_commands.iter().position(|(c, _)| c == command) {
            return Some(self.due_commands.remove(pos).1);
        }
        // the driver may run ahead of the event cursor, search the tail too
        let pos = self.rest.iter().position(|entry| {
            matches!(&entry.payload, TracePayload::Command { command: c, .. } if c == command)
        })?;
        let entry = self.rest.remove(pos).expect("position just found");
        match entry.payload {
            TracePayload::Command { outcome, .. } => Some(outcome),
            TracePayload::Event(_) => None,
        }
    }
}

/// Drives the engine from a recorded trace instead of a live target.
pub struct Replayer {
    state: Mutex<ReplayState>,
    advanced: Condvar,
}

impl Replayer {
    pub fn new(trace: Trace) -> Self {
        Replayer {
            state: Mutex::new(ReplayState {
                rest: trace.entries.into(),
                due_commands: Vec::new(),
                delivered_terminal: false,
                closed: false,
            }),
            advanced: Condvar::new(),
        }
    }
}

impl Wire for Replayer {
    fn request(&self, command: Command) -> Result<Reply, Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(Error::SessionDetached);
        }
        state.release_due();
        let outcome = match state.take_outcome(&command) {
            Some(outcome) => outcome,
            // teardown is always allowed, recorded or not
            None if command == Command::Dispose => {
                self.advanced.notify_all();
                return Ok(Reply::Ack);
            }
            None => {
                return Err(Error::ReplayDivergence(format!(
                    "command `{}` was not part of the recorded session",
                    command.name()
                )))
            }
        };
        self.advanced.notify_all();
        debug!(target: "replay", "replayed `{}`", command.name());
        match outcome {
            Outcome::Reply(reply) => Ok(reply),
            Outcome::TimedOut => Err(Error::CommandTimeout(command.name(), Duration::ZERO)),
            Outcome::Closed => Err(Error::TransportClosed),
        }
    }

    fn next_event(&self) -> Result<Event, Error> {
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.closed {
                return Err(Error::TransportClosed);
            }
            state.release_due();

            match state.rest.front() {
                // an event is delivered only after the commands recorded
                // ahead of it were issued again - original pacing
                Some(TraceEntry {
                    dir: Direction::Inbound,
                    ..
                }) if state.due_commands.is_empty() => {
                    let entry = state.rest.pop_front().expect("checked front");
                    if let TracePayload::Event(event) = entry.payload {
                        if event.is_terminal() {
                            state.delivered_terminal = true;
                        }
                        debug!(target: "replay", "replayed event `{}`", event.name());
                        return Ok(event);
                    }
                    continue;
                }
                Some(_) => {
                    let (next, timeout) = self
                        .advanced
                        .wait_timeout(state, REPLAY_PACING_BOUND)
                        .expect("lock poisoned");
                    state = next;
                    if timeout.timed_out() {
                        let stuck = state
                            .due_commands
                            .iter()
                            .map(|(c, _)| c.name())
                            .join(", ");
                        return Err(Error::ReplayDivergence(format!(
                            "replay stalled waiting for recorded commands: {stuck}"
                        )));
                    }
                }
                None => {
                    // trace exhausted: close the stream like a live target
                    if !state.delivered_terminal {
                        state.delivered_terminal = true;
                        return Ok(Event::Disconnected);
                    }
                    return Err(Error::TransportClosed);
                }
            }
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.closed = true;
        self.advanced.notify_all();
    }
}
