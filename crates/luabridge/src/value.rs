//! Value data model and codec.
//!
//! Primitive values are decoded eagerly into host form. Tables, functions,
//! threads and userdata stay resident in the engine and are carried by an
//! owning [`Ref`].

use crate::error::{BridgeError, Result};
use crate::object::{BoxedInstance, TypeTag};
use crate::registry::{Handle, Ref};
use crate::runtime::Context;
use crate::stack::{Kind, Stack};
use bstr::{BString, ByteSlice};
use mlua::{AnyUserData, LightUserData, Table, Value as LuaValue};
use std::sync::Arc;

/// A value exchanged across the bridge.
#[derive(Debug, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(BString),
    Table(Ref),
    Function(Ref),
    Userdata(UserdataRef),
    LightUserdata(usize),
    Thread(Ref),
}

/// A rooted userdata value.
///
/// `boxed` is present only for instances created by
/// [`Context::box_value`]; the payload itself is resolved on demand.
#[derive(Debug, PartialEq)]
pub struct UserdataRef {
    handle: Ref,
    boxed: Option<BoxedTag>,
}

/// Identity of a bridge-boxed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxedTag {
    pub tag: TypeTag,
    pub type_name: Arc<str>,
    pub slot: u64,
}

impl UserdataRef {
    pub fn handle(&self) -> Handle {
        self.handle.handle()
    }

    pub fn boxed(&self) -> Option<&BoxedTag> {
        self.boxed.as_ref()
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Self::Nil => Kind::Nil,
            Self::Boolean(_) => Kind::Boolean,
            Self::Integer(_) => Kind::Integer,
            Self::Float(_) => Kind::Float,
            Self::String(_) => Kind::String,
            Self::Table(_) => Kind::Table,
            Self::Function(_) => Kind::Function,
            Self::Userdata(_) => Kind::Userdata,
            Self::LightUserdata(_) => Kind::LightUserdata,
            Self::Thread(_) => Kind::Thread,
        }
    }

    /// Type name as a script author would see it. Boxed instances report
    /// their registered type name.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Integer(_) | Self::Float(_) => "number",
            Self::LightUserdata(_) => "userdata",
            Self::Userdata(ud) => ud
                .boxed
                .as_ref()
                .map_or("userdata", |boxed| &*boxed.type_name),
            other => other.kind().name(),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Truthiness per the engine's rules.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Boolean(false))
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; floats with an exact integral value convert.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => float_to_integer(*f),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(s) => Some(s.as_slice()),
            _ => None,
        }
    }

    /// UTF-8 view of a string value.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| b.to_str().ok())
    }

    /// Handle of a rooted value.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Self::Table(r) | Self::Function(r) | Self::Thread(r) => Some(r.handle()),
            Self::Userdata(ud) => Some(ud.handle()),
            _ => None,
        }
    }

    /// Take the owning reference out of a rooted value.
    pub fn into_ref(self) -> Option<Ref> {
        match self {
            Self::Table(r) | Self::Function(r) | Self::Thread(r) => Some(r),
            Self::Userdata(ud) => Some(ud.handle),
            _ => None,
        }
    }
}

pub(crate) fn float_to_integer(f: f64) -> Option<i64> {
    #[allow(clippy::cast_precision_loss)]
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    if f.is_finite() && f.fract() == 0.0 && in_range {
        #[allow(clippy::cast_possible_truncation)]
        Some(f as i64)
    } else {
        None
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(BString::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(BString::from(s))
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::String(BString::from(bytes))
    }
}

impl From<BString> for Value {
    fn from(s: BString) -> Self {
        Self::String(s)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Nil
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Nil, Into::into)
    }
}

fn boxed_tag(ud: &AnyUserData<'_>) -> Option<BoxedTag> {
    let instance = ud.borrow::<BoxedInstance>().ok()?;
    Some(BoxedTag {
        tag: instance.tag(),
        type_name: instance.type_name(),
        slot: instance.slot(),
    })
}

impl<'lua> Context<'lua> {
    pub(crate) fn decode_raw(&self, raw: LuaValue<'lua>) -> Result<Value> {
        #[allow(unreachable_patterns)]
        let value = match raw {
            LuaValue::Nil => Value::Nil,
            LuaValue::Boolean(b) => Value::Boolean(b),
            LuaValue::Integer(i) => Value::Integer(i),
            LuaValue::Number(n) => Value::Float(n),
            LuaValue::String(s) => Value::String(BString::from(s.as_bytes())),
            LuaValue::LightUserData(p) => Value::LightUserdata(p.0 as usize),
            LuaValue::Table(t) => Value::Table(self.root(LuaValue::Table(t))?),
            LuaValue::Function(f) => Value::Function(self.root(LuaValue::Function(f))?),
            LuaValue::Thread(t) => Value::Thread(self.root(LuaValue::Thread(t))?),
            LuaValue::UserData(ud) => {
                let boxed = boxed_tag(&ud);
                Value::Userdata(UserdataRef {
                    handle: self.root(LuaValue::UserData(ud))?,
                    boxed,
                })
            }
            other => Value::Userdata(UserdataRef {
                handle: self.root(other)?,
                boxed: None,
            }),
        };
        Ok(value)
    }

    pub(crate) fn encode_raw(&self, value: &Value) -> Result<LuaValue<'lua>> {
        let raw = match value {
            Value::Nil => LuaValue::Nil,
            Value::Boolean(b) => LuaValue::Boolean(*b),
            Value::Integer(i) => LuaValue::Integer(*i),
            Value::Float(f) => LuaValue::Number(*f),
            Value::String(s) => LuaValue::String(self.lua.create_string(s.as_slice())?),
            Value::LightUserdata(address) => {
                LuaValue::LightUserData(LightUserData(*address as *mut std::ffi::c_void))
            }
            Value::Table(r) | Value::Function(r) | Value::Thread(r) => self.lookup_ref(r)?,
            Value::Userdata(ud) => self.lookup_ref(&ud.handle)?,
        };
        Ok(raw)
    }

    fn table_of(&self, value: &Value) -> Result<Table<'lua>> {
        match self.encode_raw(value)? {
            LuaValue::Table(t) => Ok(t),
            _ => Err(BridgeError::TypeMismatch {
                expected: "table".to_string(),
                actual: value.type_name().to_string(),
            }),
        }
    }

    /// Decode the value behind `handle` without consuming it.
    pub fn fetch(&self, handle: Handle) -> Result<Value> {
        let raw = self.lookup(handle)?;
        self.decode_raw(raw)
    }

    /// Root the value under a fresh handle owned by the returned copy.
    pub fn duplicate(&self, value: &Value) -> Result<Value> {
        let raw = self.encode_raw(value)?;
        self.decode_raw(raw)
    }

    /// Build a table from key/value pairs.
    pub fn create_table(&self, pairs: Vec<(Value, Value)>) -> Result<Value> {
        let table = self.lua.create_table()?;
        for (key, value) in &pairs {
            table.raw_set(self.encode_raw(key)?, self.encode_raw(value)?)?;
        }
        self.decode_raw(LuaValue::Table(table))
    }

    /// Build an array-like table with keys `1..=values.len()`.
    pub fn sequence(&self, values: Vec<Value>) -> Result<Value> {
        let raw = values
            .iter()
            .map(|v| self.encode_raw(v))
            .collect::<Result<Vec<_>>>()?;
        let table = self.lua.create_sequence_from(raw)?;
        self.decode_raw(LuaValue::Table(table))
    }

    pub fn table_get(&self, table: &Value, key: &Value) -> Result<Value> {
        let table = self.table_of(table)?;
        let raw: LuaValue = table.get(self.encode_raw(key)?)?;
        self.decode_raw(raw)
    }

    pub fn table_set(&self, table: &Value, key: &Value, value: &Value) -> Result<()> {
        let table = self.table_of(table)?;
        table.set(self.encode_raw(key)?, self.encode_raw(value)?)?;
        Ok(())
    }

    /// All entries of a table, in the engine's traversal order.
    pub fn table_pairs(&self, table: &Value) -> Result<Vec<(Value, Value)>> {
        let table = self.table_of(table)?;
        let mut out = Vec::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
            let (k, v) = pair?;
            out.push((self.decode_raw(k)?, self.decode_raw(v)?));
        }
        Ok(out)
    }

    /// The elements of an array-like table, or `None` when its keys are not
    /// exactly `1..=n`.
    pub fn table_sequence(&self, table: &Value) -> Result<Option<Vec<Value>>> {
        let table = self.table_of(table)?;
        let len = usize::try_from(table.raw_len()).unwrap_or(0);
        let mut count = 0usize;
        for pair in table.clone().pairs::<LuaValue, LuaValue>() {
            let (key, _) = pair?;
            let in_range = match key {
                LuaValue::Integer(i) => usize::try_from(i).is_ok_and(|i| (1..=len).contains(&i)),
                _ => false,
            };
            if !in_range {
                return Ok(None);
            }
            count += 1;
        }
        if count != len {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(len);
        for i in 1..=len {
            let raw: LuaValue = table.raw_get(i)?;
            out.push(self.decode_raw(raw)?);
        }
        Ok(Some(out))
    }

    pub fn global(&self, name: &str) -> Result<Value> {
        let raw: LuaValue = self.lua.globals().get(name)?;
        self.decode_raw(raw)
    }

    pub fn set_global(&self, name: &str, value: &Value) -> Result<()> {
        self.lua.globals().set(name, self.encode_raw(value)?)?;
        Ok(())
    }
}

impl Stack<'_> {
    /// Decode the slot at `index`. `[-0, +0]`
    pub fn decode(&self, index: i32) -> Result<Value> {
        let raw = self.raw(index)?.clone();
        self.context().decode_raw(raw)
    }

    /// Push `value`. `[-0, +1]`
    pub fn encode(&mut self, value: &Value) -> Result<()> {
        let raw = self.context().encode_raw(value)?;
        self.push_raw(raw);
        Ok(())
    }
}
