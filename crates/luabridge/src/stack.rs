//! Stack accessor.
//!
//! A [`Stack`] is one frame of the bridge's stack-based calling convention:
//! values are pushed and popped on a single mutable sequence and addressed
//! by 1-based absolute index or by negative, top-relative index. Every
//! operation documents its net depth delta as `[-popped, +pushed]`.
//!
//! Host functions exposed to scripts receive a fresh frame holding their
//! arguments at `1..=n` and report how many values they left on top as
//! results.

use crate::error::{BridgeError, Result};
use crate::runtime::Context;
use mlua::{Lua, MultiValue, RegistryKey, Table, Value as LuaValue};
use std::fmt;
use std::sync::Arc;

/// Host function operating directly on a stack frame.
///
/// Receives its arguments at `1..=top` and returns the number of values on
/// top of the frame to hand back as results.
pub type RawFunction = Arc<dyn Fn(&mut Stack<'_>) -> Result<usize> + Send + Sync + 'static>;

/// Runtime kind of a stack slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Nil,
    Boolean,
    Integer,
    Float,
    String,
    Table,
    Function,
    Userdata,
    LightUserdata,
    Thread,
    /// An index with no slot behind it
    None,
}

impl Kind {
    /// Name used in diagnostics, matching the engine's own type names
    /// except that the two numeric subkinds are told apart.
    pub fn name(self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Float => "number",
            Self::String => "string",
            Self::Table => "table",
            Self::Function => "function",
            Self::Userdata => "userdata",
            Self::LightUserdata => "light userdata",
            Self::Thread => "thread",
            Self::None => "no value",
        }
    }

    pub(crate) fn of(value: &LuaValue<'_>) -> Self {
        #[allow(unreachable_patterns)]
        match value {
            LuaValue::Nil => Self::Nil,
            LuaValue::Boolean(_) => Self::Boolean,
            LuaValue::Integer(_) => Self::Integer,
            LuaValue::Number(_) => Self::Float,
            LuaValue::String(_) => Self::String,
            LuaValue::Table(_) => Self::Table,
            LuaValue::Function(_) => Self::Function,
            LuaValue::LightUserData(_) => Self::LightUserdata,
            LuaValue::Thread(_) => Self::Thread,
            LuaValue::UserData(_) | LuaValue::Error(_) => Self::Userdata,
            _ => Self::Userdata,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One frame of the evaluation stack.
pub struct Stack<'lua> {
    cx: Context<'lua>,
    slots: Vec<LuaValue<'lua>>,
    upvalues: Option<Table<'lua>>,
}

impl<'lua> Stack<'lua> {
    pub(crate) fn new(cx: Context<'lua>) -> Self {
        Self {
            cx,
            slots: Vec::new(),
            upvalues: None,
        }
    }

    pub(crate) fn with_values(cx: Context<'lua>, values: Vec<LuaValue<'lua>>) -> Self {
        Self {
            cx,
            slots: values,
            upvalues: None,
        }
    }

    /// The context this frame belongs to.
    pub fn context(&self) -> &Context<'lua> {
        &self.cx
    }

    pub(crate) fn lua(&self) -> &'lua Lua {
        self.cx.lua
    }

    /// Number of slots in the frame. `[-0, +0]`
    pub fn top(&self) -> usize {
        self.slots.len()
    }

    /// Normalize `index` to an absolute 1-based index. `[-0, +0]`
    ///
    /// Negative indices count from the top (`-1` is the top slot). Fails for
    /// `0` and for indices outside `1..=top`.
    pub fn abs_index(&self, index: i32) -> Result<usize> {
        let top = self.slots.len();
        let resolved = if index > 0 {
            usize::try_from(index).ok()
        } else if index < 0 {
            usize::try_from(index.unsigned_abs())
                .ok()
                .and_then(|back| top.checked_sub(back))
                .map(|zero_based| zero_based + 1)
        } else {
            None
        };
        match resolved {
            Some(abs) if (1..=top).contains(&abs) => Ok(abs),
            _ => Err(BridgeError::InvalidIndex { index, top }),
        }
    }

    /// Whether `index` addresses a slot. `[-0, +0]`
    pub fn is_valid(&self, index: i32) -> bool {
        self.abs_index(index).is_ok()
    }

    /// Kind of the slot at `index`, [`Kind::None`] if there is none. `[-0, +0]`
    pub fn kind(&self, index: i32) -> Kind {
        self.raw(index).map_or(Kind::None, Kind::of)
    }

    /// Truthiness per the engine's rules: only nil and false are falsy.
    /// Invalid indices are falsy. `[-0, +0]`
    pub fn is_truthy(&self, index: i32) -> bool {
        !matches!(
            self.raw(index),
            Err(_) | Ok(LuaValue::Nil | LuaValue::Boolean(false))
        )
    }

    /// `[-0, +1]`
    pub fn push_nil(&mut self) {
        self.slots.push(LuaValue::Nil);
    }

    /// `[-0, +1]`
    pub fn push_boolean(&mut self, value: bool) {
        self.slots.push(LuaValue::Boolean(value));
    }

    /// `[-0, +1]`
    pub fn push_integer(&mut self, value: i64) {
        self.slots.push(LuaValue::Integer(value));
    }

    /// `[-0, +1]`
    pub fn push_float(&mut self, value: f64) {
        self.slots.push(LuaValue::Number(value));
    }

    /// Push a byte string; embedded zero bytes are preserved. `[-0, +1]`
    pub fn push_string(&mut self, bytes: impl AsRef<[u8]>) -> Result<()> {
        let s = self.cx.lua.create_string(bytes.as_ref())?;
        self.slots.push(LuaValue::String(s));
        Ok(())
    }

    /// Push an opaque address. `[-0, +1]`
    pub fn push_light_userdata(&mut self, address: usize) {
        self.slots.push(LuaValue::LightUserData(mlua::LightUserData(
            address as *mut std::ffi::c_void,
        )));
    }

    /// Pop `upvalues` values and push a host closure over them. `[-upvalues, +1]`
    ///
    /// Inside `function`, [`Stack::push_upvalue`] reads them back in the
    /// order they were pushed.
    pub fn push_function(&mut self, function: RawFunction, upvalues: usize) -> Result<()> {
        let lua = self.cx.lua;
        let key: Option<RegistryKey> = if upvalues > 0 {
            let start = self.slots.len().checked_sub(upvalues).ok_or_else(|| {
                BridgeError::InvalidIndex {
                    index: -i32::try_from(upvalues).unwrap_or(i32::MAX),
                    top: self.slots.len(),
                }
            })?;
            let captured = lua.create_sequence_from(self.slots.split_off(start))?;
            Some(lua.create_registry_value(captured)?)
        } else {
            None
        };

        let closure = lua.create_function(move |lua, args: MultiValue| {
            let cx = Context::attach(lua)?;
            let mut frame = Stack::with_values(cx, args.into_vec());
            if let Some(key) = &key {
                frame.upvalues = Some(lua.registry_value::<Table>(key)?);
            }
            let count = function(&mut frame)?;
            Ok(MultiValue::from_vec(frame.take_results(count)?))
        })?;
        self.slots.push(LuaValue::Function(closure));
        Ok(())
    }

    /// Push upvalue `n` (1-based) of the running host closure; nil when the
    /// closure has fewer upvalues. `[-0, +1]`
    pub fn push_upvalue(&mut self, n: usize) -> Result<()> {
        let value = match &self.upvalues {
            Some(table) => table.raw_get::<_, LuaValue>(n)?,
            None => LuaValue::Nil,
        };
        self.slots.push(value);
        Ok(())
    }

    /// Push a copy of the slot at `index`. `[-0, +1]`
    pub fn push_value(&mut self, index: i32) -> Result<()> {
        let value = self.raw(index)?.clone();
        self.slots.push(value);
        Ok(())
    }

    /// Remove the slot at `index`, shifting the slots above it down. `[-1, +0]`
    pub fn remove(&mut self, index: i32) -> Result<()> {
        let abs = self.abs_index(index)?;
        self.slots.remove(abs - 1);
        Ok(())
    }

    /// Move the top slot into `index`, shifting the slots above it up. `[-1, +1]`
    pub fn insert(&mut self, index: i32) -> Result<()> {
        let abs = self.abs_index(index)?;
        let top = self.slots.len();
        let Some(value) = self.slots.pop() else {
            return Err(BridgeError::InvalidIndex { index, top });
        };
        self.slots.insert(abs - 1, value);
        Ok(())
    }

    /// `[-n, +0]`
    pub fn pop(&mut self, n: usize) -> Result<()> {
        let top = self.slots.len();
        let new_top = top.checked_sub(n).ok_or(BridgeError::InvalidIndex {
            index: -i32::try_from(n).unwrap_or(i32::MAX),
            top,
        })?;
        self.slots.truncate(new_top);
        Ok(())
    }

    /// Set the frame depth to `n`, filling with nil or dropping from the top.
    pub fn set_top(&mut self, n: usize) {
        self.slots.resize(n, LuaValue::Nil);
    }

    pub(crate) fn raw(&self, index: i32) -> Result<&LuaValue<'lua>> {
        let abs = self.abs_index(index)?;
        Ok(&self.slots[abs - 1])
    }

    pub(crate) fn push_raw(&mut self, value: LuaValue<'lua>) {
        self.slots.push(value);
    }

    pub(crate) fn pop_raw(&mut self) -> Result<LuaValue<'lua>> {
        self.slots.pop().ok_or(BridgeError::InvalidIndex { index: -1, top: 0 })
    }

    /// Split the top `count` values off the frame, bottom-most first.
    pub(crate) fn take_results(&mut self, count: usize) -> Result<Vec<LuaValue<'lua>>> {
        let top = self.slots.len();
        let start = top.checked_sub(count).ok_or(BridgeError::InvalidIndex {
            index: -i32::try_from(count).unwrap_or(i32::MAX),
            top,
        })?;
        Ok(self.slots.split_off(start))
    }
}

impl fmt::Debug for Stack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<Kind> = self.slots.iter().map(Kind::of).collect();
        f.debug_struct("Stack").field("slots", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;

    #[test]
    fn abs_index_normalizes_negative_indices() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_integer(10);
        stack.push_integer(20);
        stack.push_integer(30);
        assert_eq!(stack.abs_index(-1).unwrap(), 3);
        assert_eq!(stack.abs_index(-3).unwrap(), 1);
        assert_eq!(stack.abs_index(2).unwrap(), 2);
        assert!(stack.abs_index(0).unwrap_err().is_invariant_violation());
        assert!(stack.abs_index(-4).is_err());
        assert!(stack.abs_index(4).is_err());
    }

    #[test]
    fn kind_distinguishes_numeric_subkinds() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_integer(1);
        stack.push_float(1.0);
        stack.push_string("x").unwrap();
        stack.push_nil();
        stack.push_light_userdata(0x10);
        assert_eq!(stack.kind(1), Kind::Integer);
        assert_eq!(stack.kind(2), Kind::Float);
        assert_eq!(stack.kind(3), Kind::String);
        assert_eq!(stack.kind(-2), Kind::Nil);
        assert_eq!(stack.kind(-1), Kind::LightUserdata);
        assert_eq!(stack.kind(6), Kind::None);
    }

    #[test]
    fn truthiness_follows_engine_rules() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_nil();
        stack.push_boolean(false);
        stack.push_integer(0);
        stack.push_string("").unwrap();
        assert!(!stack.is_truthy(1));
        assert!(!stack.is_truthy(2));
        assert!(stack.is_truthy(3));
        assert!(stack.is_truthy(4));
        assert!(!stack.is_truthy(9));
    }

    #[test]
    fn remove_insert_and_duplicate_shift_slots() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_integer(1);
        stack.push_integer(2);
        stack.push_integer(3);

        stack.push_value(1).unwrap();
        assert_eq!(stack.top(), 4);
        assert!(matches!(stack.raw(-1).unwrap(), LuaValue::Integer(1)));

        stack.insert(2).unwrap();
        // 1, 1, 2, 3
        assert!(matches!(stack.raw(2).unwrap(), LuaValue::Integer(1)));
        assert!(matches!(stack.raw(3).unwrap(), LuaValue::Integer(2)));

        stack.remove(-2).unwrap();
        // 1, 1, 3
        assert_eq!(stack.top(), 3);
        assert!(matches!(stack.raw(-1).unwrap(), LuaValue::Integer(3)));
    }

    #[test]
    fn insert_on_an_empty_frame_is_rejected() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        let err = stack.insert(1).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(matches!(err, BridgeError::InvalidIndex { index: 1, top: 0 }));
        assert!(stack.insert(-1).is_err());
        assert_eq!(stack.top(), 0);
    }

    #[test]
    fn set_top_pads_and_truncates() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.set_top(3);
        assert_eq!(stack.top(), 3);
        assert_eq!(stack.kind(3), Kind::Nil);
        stack.set_top(1);
        assert_eq!(stack.top(), 1);
        assert!(stack.pop(2).is_err());
        stack.pop(1).unwrap();
        assert_eq!(stack.top(), 0);
    }

    #[test]
    fn host_closure_reads_its_upvalues() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_integer(40);
        stack.push_string("suffix").unwrap();
        let body: RawFunction = Arc::new(|frame: &mut Stack<'_>| {
            frame.push_upvalue(1)?;
            frame.push_upvalue(2)?;
            frame.push_upvalue(3)?;
            Ok(3)
        });
        stack.push_function(body, 2).unwrap();
        assert_eq!(stack.top(), 1);
        assert_eq!(stack.kind(1), Kind::Function);

        let n = stack.protected_call(0).unwrap();
        assert_eq!(n, 3);
        assert!(matches!(stack.raw(1).unwrap(), LuaValue::Integer(40)));
        assert_eq!(stack.kind(2), Kind::String);
        assert_eq!(stack.kind(3), Kind::Nil);
    }

    #[test]
    fn host_closure_sees_arguments_as_its_frame() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        let body: RawFunction = Arc::new(|frame: &mut Stack<'_>| {
            let n = frame.top();
            frame.push_integer(i64::try_from(n).unwrap_or(-1));
            Ok(1)
        });
        stack.push_function(body, 0).unwrap();
        stack.push_boolean(true);
        stack.push_nil();
        stack.push_float(2.5);
        let n = stack.protected_call(3).unwrap();
        assert_eq!(n, 1);
        assert!(matches!(stack.raw(-1).unwrap(), LuaValue::Integer(3)));
    }

    #[test]
    fn push_function_requires_enough_upvalues() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        let body: RawFunction = Arc::new(|_: &mut Stack<'_>| Ok(0));
        let err = stack.push_function(body, 2).unwrap_err();
        assert!(err.is_invariant_violation());
    }
}
