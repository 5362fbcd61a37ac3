//! Breakpoint and exception-watch registry.
//!
//! The registry owns operator intent: which positions should stop the target
//! and under what policy. Arming (turning intent into protocol requests) is
//! asynchronous - a breakpoint added before its class is loaded stays
//! [`ArmState::Pending`] and is armed when the matching `ClassPrepared`
//! arrives. Class unload only unarms, the breakpoint re-arms on reload.
//!
//! The registry is a pure state machine, protocol round-trips stay with the
//! caller.

use crate::debugger::error::Error;
use crate::debugger::proto::{Location, RequestHandle};
use crate::debugger::resolve::{class_pattern_regex, LocationSpec};
use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

/// Session-scoped breakpoint number, starts from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session-scoped exception watch number, starts from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u32);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local hit-count condition, evaluated by the engine after every hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitPolicy {
    /// Stop on every hit.
    Always,
    /// Stop once, then the breakpoint removes itself.
    Once,
    /// Skip the first `n` hits.
    IgnoreCount(u32),
}

/// Protocol arming state of one breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmState {
    /// Accepted but the owning class is not loaded (or the breakpoint is
    /// disabled). Not an error.
    Pending,
    /// Live protocol request in place.
    Armed {
        handle: RequestHandle,
        location: Location,
    },
    /// Was armed once, the owning class got unloaded. Re-arms on reload.
    Unarmed,
}

/// One operator breakpoint.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub number: BreakpointId,
    pub spec: LocationSpec,
    pub enabled: bool,
    pub policy: HitPolicy,
    /// Hits seen so far, counted whether or not the policy stopped.
    pub hits: u32,
    pub state: ArmState,
}

impl Breakpoint {
    fn register_hit(&mut self) -> bool {
        self.hits += 1;
        match self.policy {
            HitPolicy::Always | HitPolicy::Once => true,
            HitPolicy::IgnoreCount(n) => self.hits > n,
        }
    }
}

/// What the event loop should do with a breakpoint hit.
#[derive(Debug, PartialEq, Eq)]
pub enum HitDecision {
    /// Surface the stop to the operator.
    Stop {
        id: BreakpointId,
        /// Handle to clear on the target for a one-shot breakpoint.
        retire: Option<RequestHandle>,
    },
    /// Condition not met - a non-event, resume silently.
    Resume,
    /// Hit for a handle this session does not know.
    Unknown,
}

struct ExceptionWatch {
    number: WatchId,
    pattern: String,
    regex: Regex,
    handle: Option<RequestHandle>,
}

/// Registry of breakpoints and exception watches.
pub struct BreakpointRegistry {
    breakpoints: IndexMap<BreakpointId, Breakpoint>,
    by_handle: HashMap<RequestHandle, BreakpointId>,
    watches: IndexMap<WatchId, ExceptionWatch>,
    next_breakpoint: u32,
    next_watch: u32,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        BreakpointRegistry {
            breakpoints: IndexMap::new(),
            by_handle: HashMap::new(),
            watches: IndexMap::new(),
            next_breakpoint: 1,
            next_watch: 1,
        }
    }

    /// Accept a breakpoint optimistically, in `Pending` state.
    pub fn insert(&mut self, spec: LocationSpec, policy: HitPolicy) -> BreakpointId {
        let number = BreakpointId(self.next_breakpoint);
        self.next_breakpoint += 1;
        debug!(target: "registry", "breakpoint {number} added at {spec}");
        self.breakpoints.insert(
            number,
            Breakpoint {
                number,
                spec,
                enabled: true,
                policy,
                hits: 0,
                state: ArmState::Pending,
            },
        );
        number
    }

    /// Remove a breakpoint, returning the protocol handle to clear, if armed.
    pub fn remove(&mut self, id: BreakpointId) -> Result<Option<RequestHandle>, Error> {
        let bp = self
            .breakpoints
            .shift_remove(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        debug!(target: "registry", "breakpoint {id} removed");
        Ok(self.detach_handle(&bp))
    }

    fn detach_handle(&mut self, bp: &Breakpoint) -> Option<RequestHandle> {
        if let ArmState::Armed { handle, .. } = bp.state {
            self.by_handle.remove(&handle);
            Some(handle)
        } else {
            None
        }
    }

    pub fn get(&self, id: BreakpointId) -> Result<&Breakpoint, Error> {
        self.breakpoints
            .get(&id)
            .ok_or(Error::BreakpointNotFound(id))
    }

    /// Snapshot of all breakpoints in insertion order.
    pub fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().cloned().collect()
    }

    /// Disable a breakpoint, returning the protocol handle to clear, if armed.
    /// The breakpoint itself stays registered.
    pub fn disable(&mut self, id: BreakpointId) -> Result<Option<RequestHandle>, Error> {
        let bp = self
            .breakpoints
            .get_mut(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        bp.enabled = false;
        let bp = bp.clone();
        let handle = self.detach_handle(&bp);
        if handle.is_some() {
            let slot = self.breakpoints.get_mut(&id).expect("checked above");
            slot.state = ArmState::Pending;
        }
        Ok(handle)
    }

    /// Re-enable a breakpoint. Arming happens asynchronously, the caller
    /// drives it the same way as for a fresh breakpoint.
    pub fn enable(&mut self, id: BreakpointId) -> Result<(), Error> {
        let bp = self
            .breakpoints
            .get_mut(&id)
            .ok_or(Error::BreakpointNotFound(id))?;
        bp.enabled = true;
        Ok(())
    }

    /// Record a successful arming.
    pub fn record_armed(&mut self, id: BreakpointId, handle: RequestHandle, location: Location) {
        if let Some(bp) = self.breakpoints.get_mut(&id) {
            debug!(target: "registry", "breakpoint {id} armed at {location} ({handle})");
            bp.state = ArmState::Armed { handle, location };
            self.by_handle.insert(handle, id);
        }
    }

    /// Enabled breakpoints waiting to be armed whose pattern matches `class`.
    pub fn unarmed_for_class(&self, class: &str) -> Vec<(BreakpointId, LocationSpec)> {
        self.breakpoints
            .values()
            .filter(|bp| {
                bp.enabled && !matches!(bp.state, ArmState::Armed { .. })
            })
            .filter(|bp| {
                class_pattern_regex(bp.spec.class_pattern())
                    .map(|re| re.is_match(class))
                    .unwrap_or(false)
            })
            .map(|bp| (bp.number, bp.spec.clone()))
            .collect()
    }

    /// Unarm every breakpoint owned by an unloaded class. The breakpoints stay
    /// registered and re-arm when the class is prepared again.
    pub fn unarm_class(&mut self, class: &str) {
        let mut dropped = Vec::new();
        for bp in self.breakpoints.values_mut() {
            let armed_here = matches!(
                &bp.state,
                ArmState::Armed { location, .. } if location.class() == class
            );
            if armed_here {
                if let ArmState::Armed { handle, .. } = bp.state {
                    dropped.push(handle);
                }
                debug!(target: "registry", "breakpoint {} unarmed, class {class} unloaded", bp.number);
                bp.state = ArmState::Unarmed;
            }
        }
        for handle in dropped {
            self.by_handle.remove(&handle);
        }
    }

    /// Evaluate a hit against the owning breakpoint's policy.
    pub fn on_hit(&mut self, handle: RequestHandle) -> HitDecision {
        let Some(&id) = self.by_handle.get(&handle) else {
            return HitDecision::Unknown;
        };
        let Some(bp) = self.breakpoints.get_mut(&id) else {
            return HitDecision::Unknown;
        };
        if !bp.register_hit() {
            debug!(target: "registry", "breakpoint {id} hit {} ignored by policy", bp.hits);
            return HitDecision::Resume;
        }
        let retire = if bp.policy == HitPolicy::Once {
            self.breakpoints.shift_remove(&id);
            self.by_handle.remove(&handle);
            Some(handle)
        } else {
            None
        };
        HitDecision::Stop { id, retire }
    }

    /// All armed handles, used for teardown.
    pub fn armed_handles(&self) -> Vec<RequestHandle> {
        self.breakpoints
            .values()
            .filter_map(|bp| match bp.state {
                ArmState::Armed { handle, .. } => Some(handle),
                _ => None,
            })
            .chain(self.watches.values().filter_map(|w| w.handle))
            .collect()
    }

    // ------------------------------ exception watches ------------------------------

    pub fn insert_watch(&mut self, pattern: &str) -> Result<WatchId, Error> {
        let regex = class_pattern_regex(pattern)?;
        let number = WatchId(self.next_watch);
        self.next_watch += 1;
        debug!(target: "registry", "exception watch {number} added for `{pattern}`");
        self.watches.insert(
            number,
            ExceptionWatch {
                number,
                pattern: pattern.to_string(),
                regex,
                handle: None,
            },
        );
        Ok(number)
    }

    pub fn record_watch_armed(&mut self, id: WatchId, handle: RequestHandle) {
        if let Some(watch) = self.watches.get_mut(&id) {
            watch.handle = Some(handle);
        }
    }

    pub fn remove_watch(&mut self, id: WatchId) -> Result<Option<RequestHandle>, Error> {
        let watch = self
            .watches
            .shift_remove(&id)
            .ok_or(Error::WatchNotFound(id))?;
        Ok(watch.handle)
    }

    /// Does any watch match a thrown exception class?
    pub fn matches_exception(&self, class: &str) -> bool {
        self.watches.values().any(|w| w.regex.is_match(class))
    }

    /// (id, pattern) snapshot of registered watches.
    pub fn watches(&self) -> Vec<(WatchId, String)> {
        self.watches
            .values()
            .map(|w| (w.number, w.pattern.clone()))
            .collect()
    }
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
