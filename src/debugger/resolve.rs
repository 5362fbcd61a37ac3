//! Symbol/location resolution.
//!
//! Operators describe positions with class-name patterns, the target only
//! understands resolved [`Location`] handles. The resolver caches successful
//! resolutions and keeps a deferral list for classes that are not loaded yet,
//! to be drained when a matching `ClassPrepared` event arrives.

use crate::debugger::error::Error;
use crate::debugger::proto::{Command, Location};
use log::debug;
use lru::LruCache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;

const RESOLVE_CACHE_CAPACITY: usize = 512;

/// Operator-specified position, before protocol resolution.
///
/// The class part is a JDWP-style pattern: an exact binary name, or a name
/// with a single leading or trailing `*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationSpec {
    Line { class_pattern: String, line: u32 },
    Method { class_pattern: String, method: String },
}

impl LocationSpec {
    pub fn line(class_pattern: impl Into<String>, line: u32) -> Self {
        LocationSpec::Line {
            class_pattern: class_pattern.into(),
            line,
        }
    }

    pub fn method(class_pattern: impl Into<String>, method: impl Into<String>) -> Self {
        LocationSpec::Method {
            class_pattern: class_pattern.into(),
            method: method.into(),
        }
    }

    pub fn class_pattern(&self) -> &str {
        match self {
            LocationSpec::Line { class_pattern, .. } => class_pattern,
            LocationSpec::Method { class_pattern, .. } => class_pattern,
        }
    }

    /// Concrete class name if the pattern has no wildcard.
    pub fn concrete_class(&self) -> Option<&str> {
        let pattern = self.class_pattern();
        (!pattern.contains('*')).then_some(pattern)
    }

    /// Resolution command for this spec against a concrete loaded class.
    pub fn resolve_command(&self, class: &str) -> Command {
        match self {
            LocationSpec::Line { line, .. } => Command::ResolveLine {
                class: class.to_string(),
                line: *line,
            },
            LocationSpec::Method { method, .. } => Command::ResolveMethod {
                class: class.to_string(),
                method: method.clone(),
            },
        }
    }
}

impl fmt::Display for LocationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationSpec::Line {
                class_pattern,
                line,
            } => write!(f, "{class_pattern}:{line}"),
            LocationSpec::Method {
                class_pattern,
                method,
            } => write!(f, "{class_pattern}::{method}"),
        }
    }
}

/// Compile a class-name pattern into an anchored regex.
pub fn class_pattern_regex(pattern: &str) -> Result<Regex, Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut first = true;
    for part in pattern.split('*') {
        if !first {
            expr.push_str(".*");
        }
        expr.push_str(&regex::escape(part));
        first = false;
    }
    expr.push('$');
    Ok(Regex::new(&expr)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ResolveWhat {
    Line(u32),
    Method(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    class: String,
    what: ResolveWhat,
}

impl CacheKey {
    fn of(spec: &LocationSpec, class: &str) -> Self {
        CacheKey {
            class: class.to_string(),
            what: match spec {
                LocationSpec::Line { line, .. } => ResolveWhat::Line(*line),
                LocationSpec::Method { method, .. } => ResolveWhat::Method(method.clone()),
            },
        }
    }
}

struct Deferred {
    spec: LocationSpec,
    regex: Regex,
}

/// Location resolver with a cache and a deferral list.
///
/// Pure state machine: protocol round-trips stay with the caller so no lock
/// is ever held across the wire.
pub struct LocationResolver {
    cache: LruCache<CacheKey, Location>,
    deferred: Vec<Deferred>,
}

impl LocationResolver {
    pub fn new() -> Self {
        LocationResolver {
            cache: LruCache::new(
                NonZeroUsize::new(RESOLVE_CACHE_CAPACITY).expect("nonzero capacity"),
            ),
            deferred: Vec::new(),
        }
    }

    /// Cached resolution of `spec` against a concrete class, if any.
    pub fn lookup(&mut self, spec: &LocationSpec, class: &str) -> Option<Location> {
        self.cache.get(&CacheKey::of(spec, class)).cloned()
    }

    /// Remember a successful resolution. Idempotent.
    pub fn commit(&mut self, spec: &LocationSpec, class: &str, location: Location) {
        self.cache.put(CacheKey::of(spec, class), location);
    }

    /// Register a deferred request, to be resolved on a later `ClassPrepared`.
    pub fn defer(&mut self, spec: LocationSpec) -> Result<(), Error> {
        let regex = class_pattern_regex(spec.class_pattern())?;
        if self.deferred.iter().any(|d| d.spec == spec) {
            return Ok(());
        }
        debug!(target: "resolver", "defer resolution of {spec} until class load");
        self.deferred.push(Deferred { spec, regex });
        Ok(())
    }

    /// Drain deferred requests matched by a freshly prepared class.
    pub fn take_deferred(&mut self, class: &str) -> Vec<LocationSpec> {
        let mut matched = Vec::new();
        self.deferred.retain(|d| {
            if d.regex.is_match(class) {
                matched.push(d.spec.clone());
                false
            } else {
                true
            }
        });
        matched
    }

    /// Drop cached resolutions owned by an unloaded class.
    pub fn invalidate_class(&mut self, class: &str) {
        let stale: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.class == class)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.cache.pop(&key);
        }
    }
}

impl Default for LocationResolver {
    fn default() -> Self {
        Self::new()
    }
}
