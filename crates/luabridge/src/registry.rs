//! Reference registry.
//!
//! Pins engine values behind integer [`Handle`]s inside a root table that
//! lives in the engine registry, so they survive the call that produced
//! them. Handles are handed out monotonically and never reused within a
//! runtime; a stale handle can never alias a newer value.

use crate::error::{BridgeError, Result};
use crate::runtime::Context;
use crate::stack::Stack;
use mlua::{Table, Value as LuaValue};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Named registry slot holding the root table of all handles.
pub(crate) const REFS_KEY: &str = "luabridge.refs";

/// Opaque key into the reference registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(i64);

impl Handle {
    /// Returned when nil is referenced. Never stored and always valid.
    pub const NIL: Self = Self(-1);

    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_nil(self) -> bool {
        self.0 == Self::NIL.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning wrapper around a [`Handle`].
///
/// Dropping a `Ref` queues its handle for release; the entry is removed from
/// the root table at the next registry operation on the owning runtime.
pub struct Ref {
    handle: Handle,
    released: Weak<ReleaseQueue>,
}

impl Ref {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Give up ownership; the caller becomes responsible for
    /// [`Context::unref`].
    pub fn into_handle(mut self) -> Handle {
        std::mem::replace(&mut self.handle, Handle::NIL)
    }

    /// Whether this handle was issued by `book`.
    fn issued_by(&self, book: &RefBook) -> bool {
        std::ptr::eq(self.released.as_ptr(), Arc::as_ptr(&book.released))
    }
}

impl Drop for Ref {
    fn drop(&mut self) {
        if self.handle.is_nil() {
            return;
        }
        if let Some(queue) = self.released.upgrade() {
            queue.push(self.handle);
        }
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.handle.0).finish()
    }
}

/// Handles of dropped [`Ref`]s awaiting removal from the root table.
struct ReleaseQueue {
    handles: Mutex<Vec<Handle>>,
    closed: AtomicBool,
}

impl ReleaseQueue {
    fn push(&self, handle: Handle) {
        if !self.closed.load(Ordering::Acquire) {
            self.handles.lock().push(handle);
        }
    }
}

struct RefState {
    next: i64,
    live: HashSet<i64>,
}

/// Host-side bookkeeping of outstanding handles.
pub(crate) struct RefBook {
    state: Mutex<RefState>,
    released: Arc<ReleaseQueue>,
}

impl RefBook {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RefState {
                next: 1,
                live: HashSet::new(),
            }),
            released: Arc::new(ReleaseQueue {
                handles: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn allocate(&self) -> Handle {
        let mut state = self.state.lock();
        let raw = state.next;
        state.next += 1;
        state.live.insert(raw);
        Handle(raw)
    }

    fn release(&self, handle: Handle) -> bool {
        self.state.lock().live.remove(&handle.0)
    }

    fn is_live(&self, handle: Handle) -> bool {
        handle.is_nil() || self.state.lock().live.contains(&handle.0)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    fn take_released(&self) -> Vec<Handle> {
        std::mem::take(&mut *self.released.handles.lock())
    }

    pub(crate) fn wrap(&self, handle: Handle) -> Ref {
        Ref {
            handle,
            released: Arc::downgrade(&self.released),
        }
    }

    /// Forget every handle. Used when the runtime is torn down; refs
    /// dropped afterwards are no longer queued.
    pub(crate) fn clear(&self) {
        self.released.closed.store(true, Ordering::Release);
        self.state.lock().live.clear();
        self.released.handles.lock().clear();
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.released.handles.lock().len()
    }
}

impl<'lua> Context<'lua> {
    fn ref_table(&self) -> Result<Table<'lua>> {
        Ok(self.lua.named_registry_value(REFS_KEY)?)
    }

    /// Remove the entries of dropped [`Ref`]s from the root table.
    pub(crate) fn drain_released(&self) -> Result<()> {
        let pending = self.shared.refs.take_released();
        if pending.is_empty() {
            return Ok(());
        }
        let table = self.ref_table()?;
        for handle in pending {
            if self.shared.refs.release(handle) {
                table.raw_set(handle.raw(), LuaValue::Nil)?;
                tracing::trace!(handle = handle.raw(), "released dropped reference");
            }
        }
        Ok(())
    }

    pub(crate) fn reference_value(&self, value: LuaValue<'lua>) -> Result<Handle> {
        self.drain_released()?;
        if value.is_nil() {
            return Ok(Handle::NIL);
        }
        let handle = self.shared.refs.allocate();
        self.ref_table()?.raw_set(handle.raw(), value)?;
        tracing::trace!(handle = handle.raw(), "reference created");
        Ok(handle)
    }

    pub(crate) fn lookup(&self, handle: Handle) -> Result<LuaValue<'lua>> {
        if handle.is_nil() {
            return Ok(LuaValue::Nil);
        }
        if !self.shared.refs.is_live(handle) {
            return Err(BridgeError::InvalidHandle(handle));
        }
        Ok(self.ref_table()?.raw_get(handle.raw())?)
    }

    /// Resolve an owning [`Ref`], rejecting refs issued by another runtime.
    pub(crate) fn lookup_ref(&self, r: &Ref) -> Result<LuaValue<'lua>> {
        if !r.issued_by(&self.shared.refs) {
            return Err(BridgeError::InvalidHandle(r.handle));
        }
        self.lookup(r.handle)
    }

    /// Root `value` and wrap the handle in an owning [`Ref`].
    pub(crate) fn root(&self, value: LuaValue<'lua>) -> Result<Ref> {
        let handle = self.reference_value(value)?;
        Ok(self.shared.refs.wrap(handle))
    }

    /// Take ownership of a raw handle, typically one previously returned by
    /// [`Ref::into_handle`].
    pub fn adopt(&self, handle: Handle) -> Result<Ref> {
        if !self.shared.refs.is_live(handle) {
            return Err(BridgeError::InvalidHandle(handle));
        }
        Ok(self.shared.refs.wrap(handle))
    }

    /// Release `handle`. Releasing a handle twice is an invariant violation.
    pub fn unref(&self, handle: Handle) -> Result<()> {
        self.drain_released()?;
        if handle.is_nil() {
            return Ok(());
        }
        if !self.shared.refs.release(handle) {
            return Err(BridgeError::InvalidHandle(handle));
        }
        self.ref_table()?.raw_set(handle.raw(), LuaValue::Nil)?;
        tracing::trace!(handle = handle.raw(), "reference released");
        Ok(())
    }

    /// Whether `handle` still refers to a rooted value.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.shared.refs.is_live(handle)
    }

    /// Number of outstanding handles.
    pub fn live_refs(&self) -> usize {
        if let Err(err) = self.drain_released() {
            tracing::warn!(error = %err, "failed to drain released references");
        }
        self.shared.refs.live_count()
    }
}

impl Stack<'_> {
    /// Pop the top value and pin it, returning a fresh handle. `[-1, +0]`
    ///
    /// Nil yields [`Handle::NIL`].
    pub fn reference(&mut self) -> Result<Handle> {
        let value = self.pop_raw()?;
        self.context().reference_value(value)
    }

    /// Push the value behind `handle` without consuming it. `[-0, +1]`
    pub fn push_ref(&mut self, handle: Handle) -> Result<()> {
        let value = self.context().lookup(handle)?;
        self.push_raw(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use crate::stack::Kind;
    use crate::value::Value;

    #[test]
    fn reference_pops_and_push_ref_restores() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_string("pinned").unwrap();
        let handle = stack.reference().unwrap();
        assert_eq!(stack.top(), 0);
        assert!(cx.is_live(handle));

        stack.push_ref(handle).unwrap();
        stack.push_ref(handle).unwrap();
        assert_eq!(stack.top(), 2);
        assert_eq!(stack.kind(1), Kind::String);
        cx.unref(handle).unwrap();
    }

    #[test]
    fn nil_reference_is_never_stored() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let before = cx.live_refs();
        let mut stack = cx.stack();
        stack.push_nil();
        let handle = stack.reference().unwrap();
        assert_eq!(handle, Handle::NIL);
        assert_eq!(cx.live_refs(), before);
        stack.push_ref(handle).unwrap();
        assert_eq!(stack.kind(-1), Kind::Nil);
        cx.unref(handle).unwrap();
    }

    #[test]
    fn double_unref_is_invariant_violation() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_integer(5);
        let handle = stack.reference().unwrap();
        cx.unref(handle).unwrap();
        let err = cx.unref(handle).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle(h) if h == handle));
        assert!(stack.push_ref(handle).unwrap_err().is_invariant_violation());
    }

    #[test]
    fn handles_are_not_reused() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_boolean(true);
        let first = stack.reference().unwrap();
        cx.unref(first).unwrap();
        stack.push_boolean(true);
        let second = stack.reference().unwrap();
        assert_ne!(first, second);
        assert!(!cx.is_live(first));
    }

    #[test]
    fn dropped_ref_is_released_lazily() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let before = cx.live_refs();
        let mut stack = cx.stack();
        stack.push_string("owned").unwrap();
        let handle = stack.reference().unwrap();
        let owned = cx.adopt(handle).unwrap();
        assert_eq!(cx.live_refs(), before + 1);
        drop(owned);
        assert_eq!(cx.live_refs(), before);
        assert!(!cx.is_live(handle));
    }

    #[test]
    fn into_handle_transfers_ownership() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_float(1.5);
        let handle = stack.reference().unwrap();
        let raw = cx.adopt(handle).unwrap().into_handle();
        assert_eq!(raw, handle);
        assert!(cx.is_live(handle));
        cx.unref(handle).unwrap();
    }

    #[test]
    fn refs_from_another_runtime_are_rejected() {
        let rt_a = Runtime::new().unwrap();
        let rt_b = Runtime::new().unwrap();
        let cx_a = rt_a.context().unwrap();
        let cx_b = rt_b.context().unwrap();
        let from_a = cx_a.exec("return {origin = 'A'}").unwrap().remove(0);
        let from_b = cx_b.exec("return {origin = 'B'}").unwrap().remove(0);
        assert_eq!(from_a.handle(), from_b.handle());

        let key = Value::from("origin");
        assert_eq!(cx_a.table_get(&from_a, &key).unwrap(), Value::from("A"));
        let err = cx_b.table_get(&from_a, &key).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle(h) if Some(h) == from_a.handle()));
        let err = cx_b.call_value(&from_a, &[]).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn refs_dropped_after_clear_are_not_queued() {
        let book = RefBook::new();
        let early = book.wrap(book.allocate());
        let late = book.wrap(book.allocate());
        drop(early);
        assert_eq!(book.pending_count(), 1);
        book.clear();
        assert_eq!(book.pending_count(), 0);
        drop(late);
        assert_eq!(book.pending_count(), 0);
        assert_eq!(book.live_count(), 0);
    }

    #[test]
    fn handle_display_is_the_raw_key() {
        assert_eq!(Handle::from_raw(42).to_string(), "42");
        assert!(Handle::NIL.is_nil());
    }
}
