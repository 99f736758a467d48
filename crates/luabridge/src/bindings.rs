//! Key-combination callback table.
//!
//! Scripts bind a callback function to a key + modifier combination; the
//! host fires the combination and every callback bound to it runs
//! with no arguments. A callback whose handle was released through the
//! reference registry is dropped from the table the next time its combo
//! fires, without calling it and without a fault.

use crate::error::{BridgeError, Result};
use crate::registry::{Handle, Ref};
use crate::runtime::Context;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque id of a registered binding.
pub type BindingId = u64;

/// Modifier keys that can be combined with a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Modifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub super_key: bool,
}

impl Modifiers {
    pub const NONE: Self = Self {
        ctrl: false,
        shift: false,
        alt: false,
        super_key: false,
    };

    /// Set the modifier named `name`. Returns false for unknown names.
    fn set(&mut self, name: &str) -> bool {
        match name.trim().to_lowercase().as_str() {
            "ctrl" | "control" => self.ctrl = true,
            "shift" => self.shift = true,
            "alt" | "opt" | "option" => self.alt = true,
            "super" | "cmd" | "command" | "meta" => self.super_key = true,
            _ => return false,
        }
        true
    }

    /// Parse a modifier string like "ctrl+shift" or "alt".
    pub fn parse(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::NONE);
        }
        Self::from_names(s.split('+'))
    }

    /// Build from a list of modifier names such as `["cmd", "shift"]`.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mods = Self::NONE;
        for name in names {
            if !mods.set(name.as_ref()) {
                return Err(BridgeError::runtime(format!(
                    "unknown modifier '{}'",
                    name.as_ref().trim()
                )));
            }
        }
        Ok(mods)
    }

    /// Canonical form: `ctrl+shift+alt+super`, omitting unset keys.
    pub fn to_string_repr(&self) -> String {
        let mut parts = Vec::new();
        if self.ctrl {
            parts.push("ctrl");
        }
        if self.shift {
            parts.push("shift");
        }
        if self.alt {
            parts.push("alt");
        }
        if self.super_key {
            parts.push("super");
        }
        parts.join("+")
    }
}

/// A key + modifier combination.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyCombo {
    pub key: String,
    pub modifiers: Modifiers,
}

impl KeyCombo {
    /// Parse a key combo string like "ctrl+shift+t" or "cmd+s".
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('+').collect();
        let Some((key, mods)) = parts.split_last() else {
            return Err(BridgeError::runtime("empty key combo"));
        };
        Self::from_parts(key, mods)
    }

    /// Build from a key and a list of modifier names.
    pub fn from_parts<S: AsRef<str>>(key: &str, modifiers: &[S]) -> Result<Self> {
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(BridgeError::runtime("key combo has no key"));
        }
        Ok(Self {
            key,
            modifiers: Modifiers::from_names(modifiers)?,
        })
    }

    /// Canonical string representation.
    pub fn to_string_repr(&self) -> String {
        let mods = self.modifiers.to_string_repr();
        if mods.is_empty() {
            self.key.clone()
        } else {
            format!("{}+{}", mods, self.key)
        }
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_repr())
    }
}

struct Binding {
    id: BindingId,
    combo: String,
    callback: Ref,
}

/// Outcome of firing one key combo.
#[derive(Debug, Default)]
pub struct TriggerReport {
    /// Callbacks that ran to completion
    pub invoked: usize,
    /// Bindings dropped because their handle had been released
    pub pruned: usize,
    /// Faults raised by callbacks, in firing order
    pub faults: Vec<BridgeError>,
}

/// Table of key-combo bindings. Owns the callback handles it holds.
pub struct Bindings {
    bindings: Mutex<Vec<Binding>>,
    next_id: AtomicU64,
    /// canonical combo string -> binding ids, in bind order
    lookup: Mutex<HashMap<String, Vec<BindingId>>>,
}

impl Default for Bindings {
    fn default() -> Self {
        Self {
            bindings: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            lookup: Mutex::new(HashMap::new()),
        }
    }
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `callback` to `combo`. The table takes ownership of the handle.
    pub fn bind(&self, combo: &KeyCombo, callback: Ref) -> BindingId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let canonical = combo.to_string_repr();
        tracing::debug!(combo = %canonical, handle = callback.handle().raw(), id, "bound callback");

        self.bindings.lock().push(Binding {
            id,
            combo: canonical.clone(),
            callback,
        });
        self.lookup.lock().entry(canonical).or_default().push(id);
        id
    }

    /// Remove a binding, releasing its handle.
    pub fn unbind(&self, id: BindingId) -> bool {
        let removed = {
            let mut bindings = self.bindings.lock();
            bindings
                .iter()
                .position(|b| b.id == id)
                .map(|index| bindings.remove(index))
        };
        let Some(binding) = removed else {
            return false;
        };
        let mut lookup = self.lookup.lock();
        if let Some(ids) = lookup.get_mut(&binding.combo) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                lookup.remove(&binding.combo);
            }
        }
        true
    }

    pub fn handle_of(&self, id: BindingId) -> Option<Handle> {
        self.bindings
            .lock()
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.callback.handle())
    }

    /// Fire `combo`: call every still-live callback bound to it.
    ///
    /// A callback fault does not stop the remaining callbacks; faults are
    /// collected in the report.
    pub fn trigger(&self, cx: &Context<'_>, combo: &KeyCombo) -> TriggerReport {
        let canonical = combo.to_string_repr();
        let targets: Vec<(BindingId, Handle)> = {
            let lookup = self.lookup.lock();
            let Some(ids) = lookup.get(&canonical) else {
                return TriggerReport::default();
            };
            let bindings = self.bindings.lock();
            ids.iter()
                .filter_map(|id| bindings.iter().find(|b| b.id == *id))
                .map(|b| (b.id, b.callback.handle()))
                .collect()
        };

        let mut report = TriggerReport::default();
        for (id, handle) in targets {
            if !cx.is_live(handle) {
                tracing::debug!(combo = %canonical, handle = handle.raw(), "pruning released callback");
                self.unbind(id);
                report.pruned += 1;
                continue;
            }
            match cx.call(handle, &[]) {
                Ok(_) => report.invoked += 1,
                Err(err) => {
                    tracing::warn!(combo = %canonical, handle = handle.raw(), error = %err, "callback failed");
                    report.faults.push(err);
                }
            }
        }
        report
    }

    /// Number of registered bindings.
    pub fn count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// List all key combos currently bound.
    pub fn bound_combos(&self) -> Vec<String> {
        self.lookup.lock().keys().cloned().collect()
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
