//! Ordered, keyed registry of zero-argument close hooks.
//!
//! Each entry is identified by a `(handler, key)` pair. The registry keeps
//! insertion order for invocation and an identity index for O(1) duplicate
//! detection. It does no locking of its own; the owning session serializes
//! mutation against invocation.
//!
//! Two policies are deliberate contract, not accident:
//! - adding an existing identity replaces the hook **in place**, keeping its
//!   original position;
//! - a hook that panics during [`invoke`](CallbackRegistry::invoke) is
//!   isolated: later hooks still run, and the failure is reported to the
//!   caller instead of unwinding through the close sequence.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Close-hook signature: zero arguments, no return value.
///
/// Hooks must not block indefinitely and must not touch the registry they
/// execute within.
pub type CloseHook = Box<dyn Fn() + Send + Sync + 'static>;

/// Hook identity key.
///
/// Keys are restricted to hashable shapes; a non-comparable key is rejected
/// by the type system rather than silently misbehaving at lookup time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookKey {
    Int(i64),
    Text(Box<str>),
}

impl From<i64> for HookKey {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for HookKey {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u32> for HookKey {
    fn from(v: u32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<&str> for HookKey {
    fn from(v: &str) -> Self {
        Self::Text(v.into())
    }
}

impl From<String> for HookKey {
    fn from(v: String) -> Self {
        Self::Text(v.into())
    }
}

impl std::fmt::Display for HookKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

struct CallbackEntry {
    handler: HookKey,
    key: HookKey,
    hook: CloseHook,
}

/// A hook that panicked during invocation.
#[derive(Debug)]
pub struct HookFailure {
    pub handler: HookKey,
    pub key: HookKey,
    /// The panic payload, stringified when possible.
    pub message: String,
}

/// Insertion-ordered collection of close hooks with unique identities.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<CallbackEntry>,
    index: HashMap<(HookKey, HookKey), usize>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook under `(handler, key)`.
    ///
    /// An existing identity has its hook replaced in place, preserving the
    /// entry's position in invocation order; otherwise the entry is appended
    /// at the tail.
    pub fn add(
        &mut self,
        handler: impl Into<HookKey>,
        key: impl Into<HookKey>,
        hook: impl Fn() + Send + Sync + 'static,
    ) {
        let handler = handler.into();
        let key = key.into();
        let identity = (handler.clone(), key.clone());
        match self.index.get(&identity) {
            Some(&pos) => {
                self.entries[pos].hook = Box::new(hook);
            }
            None => {
                self.index.insert(identity, self.entries.len());
                self.entries.push(CallbackEntry {
                    handler,
                    key,
                    hook: Box::new(hook),
                });
            }
        }
    }

    /// Remove the entry registered under `(handler, key)`. No-op if absent.
    pub fn remove(&mut self, handler: impl Into<HookKey>, key: impl Into<HookKey>) {
        let identity = (handler.into(), key.into());
        if let Some(pos) = self.index.remove(&identity) {
            self.entries.remove(pos);
            for entry in &self.entries[pos..] {
                let id = (entry.handler.clone(), entry.key.clone());
                if let Some(slot) = self.index.get_mut(&id) {
                    *slot -= 1;
                }
            }
        }
    }

    /// Run every hook once, front to back, in insertion order.
    ///
    /// The entry list is not mutated: hooks stay registered after
    /// invocation. A panicking hook is caught and recorded; the remaining
    /// hooks still run. Returned failures never re-enter invocation.
    pub fn invoke(&self) -> Vec<HookFailure> {
        let mut failures = Vec::new();
        for entry in &self.entries {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.hook)())) {
                failures.push(HookFailure {
                    handler: entry.handler.clone(),
                    key: entry.key.clone(),
                    message: panic_message(payload),
                });
            }
        }
        failures
    }

    /// Number of currently registered identities.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
