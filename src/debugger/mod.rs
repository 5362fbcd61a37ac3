//! Debugger engine for wire-attached targets.
//!
//! A [`Debugger`] owns one session against a remote target: a live TCP
//! connection, any other [`Wire`] implementation, or a recorded trace replayed
//! through [`Debugger::replay`]. The engine keeps its own model of target
//! state (threads, breakpoints, resolutions) and reconciles it with the
//! asynchronous event stream on a dedicated event-loop thread.
//!
//! Locking discipline: all mutable session state lives behind one mutex and
//! that mutex is never held across a protocol round-trip. Operator commands
//! validate under the lock, release it, talk to the wire, then re-acquire and
//! commit.

pub mod breakpoint;
pub mod control;
pub mod error;
mod eventloop;
pub mod frame;
pub mod proto;
pub mod record;
pub mod resolve;
pub mod variable;

pub use breakpoint::{ArmState, Breakpoint, BreakpointId, HitPolicy, WatchId};
pub use control::{ThreadSnapshot, ThreadStatus};
pub use error::Error;
pub use frame::StackFrame;
pub use proto::{Event, Location, StepKind, ThreadId};
pub use record::Trace;
pub use resolve::LocationSpec;
pub use variable::{Value, VariableBinding};

use crate::debugger::breakpoint::BreakpointRegistry;
use crate::debugger::control::ExecutionCtl;
use crate::debugger::proto::transport::{TcpLink, Transport, Wire};
use crate::debugger::proto::{Command, Reply};
use crate::debugger::record::{RecordedWire, Replayer};
use crate::debugger::resolve::{class_pattern_regex, LocationResolver};
use crate::weak_error;
use log::{debug, info};
use std::io::Write;
use std::net::ToSocketAddrs;
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Observer of the reconciled event stream.
///
/// Called from the event-loop thread after the engine committed the event to
/// its own state. A hook error is logged and skipped, it never stops the
/// session.
pub trait EventHook: Send + Sync {
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Default no-op hook.
pub struct NopHook;

impl EventHook for NopHook {
    fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Receiving side of [`Debugger::subscribe`].
///
/// Backed by a bounded channel: a subscriber that stops draining eventually
/// blocks the event loop instead of growing without bound. Once the session
/// is detached the loop stops waiting, so a still-full subscription is
/// dropped and may miss trailing events. Dropping the subscription
/// unsubscribes.
pub struct EventSubscription {
    rx: mpsc::Receiver<Event>,
}

impl EventSubscription {
    /// Block until the next event. `None` once the session is torn down.
    pub fn recv(&self) -> Option<Event> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Event, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Upper bound on one command round-trip.
    pub reply_timeout: Duration,
    /// Queue depth of one event subscription.
    pub notify_capacity: usize,
}

impl Default for AttachOptions {
    fn default() -> Self {
        AttachOptions {
            reply_timeout: Duration::from_secs(3),
            notify_capacity: 128,
        }
    }
}

pub(super) struct SessionState {
    pub(super) ctl: ExecutionCtl,
    pub(super) registry: BreakpointRegistry,
    pub(super) resolver: LocationResolver,
    pub(super) detached: bool,
}

pub(super) struct SessionShared {
    pub(super) wire: RecordedWire,
    pub(super) state: Mutex<SessionState>,
    /// Serializes operator execution-control commands so validate/commit pairs
    /// of different operators cannot interleave. Inspection commands do not
    /// take it.
    pub(super) cmd_lock: Mutex<()>,
    pub(super) subscribers: Mutex<Vec<SyncSender<Event>>>,
    pub(super) hook: Box<dyn EventHook>,
    pub(super) notify_capacity: usize,
}

impl SessionShared {
    pub(super) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("lock poisoned")
    }
}

/// One debug session against a remote target.
pub struct Debugger {
    shared: Arc<SessionShared>,
    event_loop: Option<JoinHandle<()>>,
}

impl Debugger {
    /// Attach over TCP with the handshake preamble exchange.
    pub fn attach_tcp(addr: impl ToSocketAddrs, options: AttachOptions) -> Result<Self, Error> {
        let link = TcpLink::connect(addr)?;
        let transport = Transport::start(link, options.reply_timeout);
        Self::attach(transport, options)
    }

    /// Attach over an already established [`Wire`].
    pub fn attach(wire: impl Wire + 'static, options: AttachOptions) -> Result<Self, Error> {
        Self::new(Box::new(wire), Box::new(NopHook), options, false)
    }

    /// Like [`attach`](Self::attach) with an [`EventHook`] observing the
    /// session.
    pub fn attach_with_hook(
        wire: impl Wire + 'static,
        hook: impl EventHook + 'static,
        options: AttachOptions,
    ) -> Result<Self, Error> {
        Self::new(Box::new(wire), Box::new(hook), options, false)
    }

    /// Drive a full session from a recorded trace instead of a live target.
    ///
    /// The same engine runs on top of a [`Replayer`] wire, so breakpoint
    /// bookkeeping and thread-state transitions replay exactly as they
    /// happened live.
    pub fn replay(trace: Trace, options: AttachOptions) -> Result<Self, Error> {
        Self::new(
            Box::new(Replayer::new(trace)),
            Box::new(NopHook),
            options,
            true,
        )
    }

    fn new(
        wire: Box<dyn Wire>,
        hook: Box<dyn EventHook>,
        options: AttachOptions,
        replaying: bool,
    ) -> Result<Self, Error> {
        let shared = Arc::new(SessionShared {
            wire: RecordedWire::new(wire),
            state: Mutex::new(SessionState {
                ctl: ExecutionCtl::new(),
                registry: BreakpointRegistry::new(),
                resolver: LocationResolver::new(),
                detached: false,
            }),
            cmd_lock: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            hook,
            notify_capacity: options.notify_capacity,
        });

        // seed the thread table before any event can race with it; a failed
        // attach must release the transport so its reader thread stops
        if let Err(e) = Self::seed_threads(&shared, replaying) {
            shared.wire.close();
            return Err(e);
        }

        let loop_shared = shared.clone();
        let event_loop = match thread::Builder::new()
            .name("remdbg-eventloop".into())
            .spawn(move || eventloop::run(loop_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                shared.wire.close();
                return Err(Error::IO(e));
            }
        };

        info!(target: "debugger", "session attached");
        Ok(Debugger {
            shared,
            event_loop: Some(event_loop),
        })
    }

    fn seed_threads(shared: &SessionShared, replaying: bool) -> Result<(), Error> {
        match shared.wire.request(Command::ListThreads) {
            Ok(Reply::Threads(threads)) => {
                let mut state = shared.lock_state();
                for thread in threads {
                    state.ctl.register(thread);
                }
                Ok(())
            }
            Ok(other) => Err(Error::UnexpectedReply {
                command: "list-threads",
                got: other.name(),
            }),
            // a trace captured mid-session has no thread listing, threads are
            // then picked up from the events themselves
            Err(Error::ReplayDivergence(_)) if replaying => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ensure_attached(state: &SessionState) -> Result<(), Error> {
        if state.detached {
            return Err(Error::SessionDetached);
        }
        Ok(())
    }

    /// Subscribe to the reconciled event stream. Events arrive after the
    /// engine committed them, so querying [`thread_state`](Self::thread_state)
    /// on receipt observes the post-event state.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::sync_channel(self.shared.notify_capacity);
        self.shared
            .subscribers
            .lock()
            .expect("lock poisoned")
            .push(tx);
        EventSubscription { rx }
    }

    // ------------------------------ breakpoints ------------------------------

    /// Register a breakpoint. Accepted even when the owning class is not
    /// loaded yet: arming then waits for the matching class-prepared event.
    pub fn add_breakpoint(
        &self,
        spec: LocationSpec,
        policy: HitPolicy,
    ) -> Result<BreakpointId, Error> {
        // reject malformed patterns before registering anything
        class_pattern_regex(spec.class_pattern())?;

        let id = {
            let mut state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.registry.insert(spec.clone(), policy)
        };

        match spec.concrete_class() {
            Some(class) => {
                let class = class.to_string();
                // arming is asynchronous by contract, a failed attempt leaves
                // the breakpoint pending for the next class-prepared
                weak_error!(
                    arm_breakpoint(&self.shared, id, &spec, &class);
                    format!("breakpoint {id} not armed yet")
                );
            }
            None => {
                let mut state = self.shared.lock_state();
                state.resolver.defer(spec)?;
            }
        }
        Ok(id)
    }

    /// Remove a breakpoint. The target-side request is cleared best-effort.
    pub fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        let handle = {
            let mut state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.registry.remove(id)?
        };
        if let Some(handle) = handle {
            weak_error!(self.shared.wire.request(Command::ClearBreakpoint { handle }));
        }
        Ok(())
    }

    /// Disable a breakpoint without forgetting it.
    pub fn disable_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        let handle = {
            let mut state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.registry.disable(id)?
        };
        if let Some(handle) = handle {
            weak_error!(self.shared.wire.request(Command::ClearBreakpoint { handle }));
        }
        Ok(())
    }

    /// Re-enable a disabled breakpoint and try to arm it right away.
    pub fn enable_breakpoint(&self, id: BreakpointId) -> Result<(), Error> {
        let spec = {
            let mut state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.registry.enable(id)?;
            state.registry.get(id)?.spec.clone()
        };
        match spec.concrete_class() {
            Some(class) => {
                let class = class.to_string();
                weak_error!(
                    arm_breakpoint(&self.shared, id, &spec, &class);
                    format!("breakpoint {id} not armed yet")
                );
            }
            None => {
                let mut state = self.shared.lock_state();
                state.resolver.defer(spec)?;
            }
        }
        Ok(())
    }

    /// Snapshot of all registered breakpoints.
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.shared.lock_state().registry.list()
    }

    /// Register an exception watch for thrown exceptions whose class matches
    /// `class_pattern`.
    pub fn add_exception_watch(&self, class_pattern: &str) -> Result<WatchId, Error> {
        let id = {
            let mut state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.registry.insert_watch(class_pattern)?
        };
        let armed = self.shared.wire.request(Command::SetExceptionWatch {
            class_pattern: class_pattern.to_string(),
        });
        match armed {
            Ok(Reply::RequestSet { handle }) => {
                self.shared.lock_state().registry.record_watch_armed(id, handle);
                Ok(id)
            }
            Ok(other) => {
                let _ = self.shared.lock_state().registry.remove_watch(id);
                Err(Error::UnexpectedReply {
                    command: "set-exception-watch",
                    got: other.name(),
                })
            }
            Err(e) => {
                let _ = self.shared.lock_state().registry.remove_watch(id);
                Err(e)
            }
        }
    }

    pub fn remove_exception_watch(&self, id: WatchId) -> Result<(), Error> {
        let handle = {
            let mut state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.registry.remove_watch(id)?
        };
        if let Some(handle) = handle {
            weak_error!(self
                .shared
                .wire
                .request(Command::ClearExceptionWatch { handle }));
        }
        Ok(())
    }

    /// (id, pattern) snapshot of registered exception watches.
    pub fn exception_watches(&self) -> Vec<(WatchId, String)> {
        self.shared.lock_state().registry.watches()
    }

    // ---------------------------- execution control ----------------------------

    /// Drop one suspend reason from `thread`. The target is resumed only when
    /// the last reason is dropped.
    pub fn continue_thread(&self, thread: ThreadId) -> Result<(), Error> {
        let _cmd = self.shared.cmd_lock.lock().expect("lock poisoned");
        let releases = {
            let state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.ctl.validate_resume(thread)?
        };
        if releases {
            expect_ack(self.shared.wire.request(Command::Resume { thread }))?;
        }
        self.shared.lock_state().ctl.apply_resume(thread);
        Ok(())
    }

    /// Add one suspend reason to `thread`, suspending it on the target if it
    /// was running.
    pub fn suspend_thread(&self, thread: ThreadId) -> Result<(), Error> {
        let _cmd = self.shared.cmd_lock.lock().expect("lock poisoned");
        {
            let state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.ctl.validate_suspend(thread)?;
        }
        expect_ack(self.shared.wire.request(Command::Suspend { thread }))?;
        self.shared.lock_state().ctl.apply_suspend(thread);
        Ok(())
    }

    /// Request a single step of the given granularity. The thread must be
    /// suspended and at most one step per thread may be outstanding.
    pub fn step(&self, thread: ThreadId, kind: StepKind) -> Result<(), Error> {
        let _cmd = self.shared.cmd_lock.lock().expect("lock poisoned");
        {
            let state = self.shared.lock_state();
            Self::ensure_attached(&state)?;
            state.ctl.validate_step(thread)?;
        }
        expect_ack(self.shared.wire.request(Command::Step { thread, kind }))?;
        self.shared.lock_state().ctl.apply_step(thread, kind);
        Ok(())
    }

    /// Suspend every live thread, one batch command on the wire and one
    /// atomic state update.
    pub fn suspend_all(&self) -> Result<(), Error> {
        let _cmd = self.shared.cmd_lock.lock().expect("lock poisoned");
        Self::ensure_attached(&self.shared.lock_state())?;
        expect_ack(self.shared.wire.request(Command::SuspendAll))?;
        self.shared.lock_state().ctl.apply_suspend_all();
        Ok(())
    }

    /// Drop one suspend reason from every suspended thread.
    pub fn resume_all(&self) -> Result<(), Error> {
        let _cmd = self.shared.cmd_lock.lock().expect("lock poisoned");
        Self::ensure_attached(&self.shared.lock_state())?;
        expect_ack(self.shared.wire.request(Command::ResumeAll))?;
        self.shared.lock_state().ctl.apply_resume_all();
        Ok(())
    }

    /// Snapshot of every known thread, ordered by thread id.
    pub fn threads(&self) -> Vec<ThreadSnapshot> {
        self.shared.lock_state().ctl.snapshot()
    }

    pub fn thread_state(&self, thread: ThreadId) -> Result<ThreadSnapshot, Error> {
        Ok(self.shared.lock_state().ctl.get(thread)?.clone())
    }

    // ------------------------------ record/replay ------------------------------

    /// Start recording the session trace into `sink`, one JSON entry per line.
    pub fn start_recording(&self, sink: Box<dyn Write + Send>) -> Result<(), Error> {
        self.shared.wire.start_recording(sink)
    }

    /// Stop recording, returning the number of trace entries written.
    pub fn stop_recording(&self) -> Result<usize, Error> {
        self.shared.wire.stop_recording()
    }

    // --------------------------------- teardown ---------------------------------

    /// Detach from the target and stop the event loop. Idempotent, every
    /// subsequent command fails with [`Error::SessionDetached`]. Never waits
    /// on subscribers: an undrained subscription keeps its queued backlog but
    /// receives nothing further.
    pub fn detach(&mut self) -> Result<(), Error> {
        let was_detached = {
            let mut state = self.shared.lock_state();
            std::mem::replace(&mut state.detached, true)
        };
        if !was_detached {
            debug!(target: "debugger", "detaching");
            // target-side cleanup is best-effort, dispose drops armed requests
            weak_error!(self.shared.wire.request(Command::Dispose));
        }
        self.shared.wire.close();
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
            info!(target: "debugger", "session detached");
        }
        Ok(())
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

fn expect_ack(reply: Result<Reply, Error>) -> Result<(), Error> {
    match reply? {
        Reply::Ack => Ok(()),
        other => Err(Error::UnexpectedReply {
            command: "execution control",
            got: other.name(),
        }),
    }
}

/// Resolve `spec` against a loaded `class` and arm it on the target.
///
/// `ClassNotLoaded` re-defers the spec instead of failing. The session state
/// lock is taken only around lookups and commits, never across the wire.
pub(super) fn arm_breakpoint(
    shared: &SessionShared,
    id: BreakpointId,
    spec: &LocationSpec,
    class: &str,
) -> Result<(), Error> {
    let cached = shared.lock_state().resolver.lookup(spec, class);
    let location = match cached {
        Some(location) => location,
        None => match shared.wire.request(spec.resolve_command(class))? {
            Reply::Resolved { location } => location,
            Reply::ClassNotLoaded => {
                shared.lock_state().resolver.defer(spec.clone())?;
                return Ok(());
            }
            other => {
                return Err(Error::UnexpectedReply {
                    command: "resolve",
                    got: other.name(),
                })
            }
        },
    };

    match shared.wire.request(Command::SetBreakpoint {
        location: location.clone(),
    })? {
        Reply::RequestSet { handle } => {
            let mut state = shared.lock_state();
            state.registry.record_armed(id, handle, location.clone());
            state.resolver.commit(spec, class, location);
            Ok(())
        }
        other => Err(Error::UnexpectedReply {
            command: "set-breakpoint",
            got: other.name(),
        }),
    }
}
