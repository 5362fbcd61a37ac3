//! Session event loop.
//!
//! Single consumer of the inbound event stream. Every event is first
//! reconciled with the engine state (thread table, breakpoint registry,
//! resolver), then published to subscribers and the hook - an observer that
//! reacts to a notification always sees the post-event state.
//!
//! Breakpoint hits rejected by their hit policy are non-events: the thread is
//! resumed silently and nothing is published.

use crate::debugger::breakpoint::HitDecision;
use crate::debugger::error::Error;
use crate::debugger::proto::transport::Wire;
use crate::debugger::proto::{Command, Event, ThreadId};
use crate::debugger::{arm_breakpoint, SessionShared};
use crate::weak_error;
use log::{debug, warn};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub(super) fn run(shared: Arc<SessionShared>) {
    loop {
        let event = match shared.wire.next_event() {
            Ok(event) => event,
            Err(e) => {
                if !matches!(e, Error::TransportClosed | Error::SessionDetached) {
                    warn!(target: "eventloop", "event stream failed: {e:#}");
                }
                shared.lock_state().detached = true;
                break;
            }
        };

        debug!(target: "eventloop", "dispatch `{}`", event.name());
        let published = dispatch(&shared, &event);
        let terminal = event.is_terminal();
        if published {
            publish(&shared, event);
        }
        if terminal {
            break;
        }
    }

    // wake subscribers blocked in recv
    shared.subscribers.lock().expect("lock poisoned").clear();
    debug!(target: "eventloop", "event loop finished");
}

/// Reconcile one event with the session state. Returns false for non-events
/// that must stay invisible to observers.
fn dispatch(shared: &SessionShared, event: &Event) -> bool {
    match event {
        Event::ThreadStart { thread } => {
            shared.lock_state().ctl.register(*thread);
        }
        Event::ThreadDeath { thread } => {
            shared.lock_state().ctl.on_thread_death(*thread);
        }
        Event::ClassPrepared { class } => on_class_prepared(shared, class),
        Event::ClassUnloaded { class } => {
            let mut state = shared.lock_state();
            state.registry.unarm_class(class);
            state.resolver.invalidate_class(class);
        }
        Event::BreakpointHit { thread, handle, .. } => {
            let stopped = {
                let mut state = shared.lock_state();
                match state.registry.on_hit(*handle) {
                    HitDecision::Stop { id, retire } => {
                        state.ctl.on_stop(*thread);
                        Some((id, retire))
                    }
                    HitDecision::Resume => None,
                    HitDecision::Unknown => {
                        // hit raced with a removal, or the target is confused
                        warn!(target: "eventloop", "hit for unknown request {handle}");
                        None
                    }
                }
            };
            match stopped {
                Some((id, retire)) => {
                    if let Some(handle) = retire {
                        // one-shot breakpoint served its purpose
                        weak_error!(shared.wire.request(Command::ClearBreakpoint { handle }));
                        debug!(target: "eventloop", "breakpoint {id} retired after hit");
                    }
                }
                None => {
                    resume_silently(shared, *thread);
                    return false;
                }
            }
        }
        Event::StepComplete { thread, .. } => {
            shared.lock_state().ctl.on_step_complete(*thread);
        }
        Event::ExceptionThrown { thread, class, .. } => {
            let watched = {
                let mut state = shared.lock_state();
                let watched = state.registry.matches_exception(class);
                if watched {
                    state.ctl.on_stop(*thread);
                }
                watched
            };
            if !watched {
                // watch was removed while the event was in flight
                resume_silently(shared, *thread);
                return false;
            }
        }
        Event::TargetExit { code } => {
            debug!(target: "eventloop", "target exited with code {code}");
            let mut state = shared.lock_state();
            state.ctl.on_target_exit();
            state.detached = true;
        }
        Event::Disconnected => {
            shared.lock_state().detached = true;
        }
    }
    true
}

/// Arm every pending breakpoint owned by a freshly prepared class.
fn on_class_prepared(shared: &SessionShared, class: &str) {
    let pending = {
        let mut state = shared.lock_state();
        state.resolver.take_deferred(class);
        state.registry.unarmed_for_class(class)
    };
    for (id, spec) in pending {
        // one failed arming must not starve the remaining candidates
        weak_error!(
            arm_breakpoint(shared, id, &spec, class);
            format!("breakpoint {id} not armed on load of {class}")
        );
    }
}

/// The target suspended a thread for a hit the engine decided to ignore.
/// The engine state is left untouched, the thread never appears suspended.
fn resume_silently(shared: &SessionShared, thread: ThreadId) {
    weak_error!(shared.wire.request(Command::Resume { thread }));
}

const SEND_RETRY: Duration = Duration::from_millis(10);

fn publish(shared: &SessionShared, event: Event) {
    {
        let mut subscribers = shared.subscribers.lock().expect("lock poisoned");
        subscribers.retain(|tx| offer(shared, tx, event.clone()));
    }
    weak_error!(shared
        .hook
        .on_event(&event)
        .map_err(Error::Hook); "event hook failed");
}

/// Send with backpressure while the session lives. Once the session is
/// detached a full subscription is dropped instead of keeping the loop (and
/// the join in detach) waiting on a subscriber that never drains.
fn offer(shared: &SessionShared, tx: &SyncSender<Event>, event: Event) -> bool {
    let mut event = event;
    loop {
        match tx.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(back)) => {
                if shared.lock_state().detached {
                    warn!(target: "eventloop", "dropping undrained subscription on teardown");
                    return false;
                }
                event = back;
                thread::sleep(SEND_RETRY);
            }
        }
    }
}
