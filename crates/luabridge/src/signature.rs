//! Parameter declarations and argument access for bound functions.

use crate::error::{BridgeError, Result};
use crate::registry::Ref;
use crate::runtime::Context;
use crate::value::{UserdataRef, Value};
use bstr::{BString, ByteSlice};
use std::fmt;
use std::sync::Arc;

type Predicate = Arc<dyn Fn(&Context<'_>, &Value) -> bool + Send + Sync>;

/// A declared parameter: a label naming the expected kind and a predicate
/// over the decoded argument.
#[derive(Clone)]
pub struct Param {
    label: Arc<str>,
    check: Predicate,
}

impl Param {
    pub fn custom<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Context<'_>, &Value) -> bool + Send + Sync + 'static,
    {
        Self {
            label: Arc::from(label.into()),
            check: Arc::new(predicate),
        }
    }

    fn kind(label: &str, predicate: fn(&Value) -> bool) -> Self {
        Self::custom(label, move |_, value| predicate(value))
    }

    pub fn any() -> Self {
        Self::kind("value", |_| true)
    }

    pub fn nil() -> Self {
        Self::kind("nil", Value::is_nil)
    }

    pub fn boolean() -> Self {
        Self::kind("boolean", |v| matches!(v, Value::Boolean(_)))
    }

    /// Integers, and floats with an exact integral value.
    pub fn integer() -> Self {
        Self::kind("integer", |v| v.as_integer().is_some())
    }

    pub fn number() -> Self {
        Self::kind("number", |v| matches!(v, Value::Integer(_) | Value::Float(_)))
    }

    pub fn string() -> Self {
        Self::kind("string", |v| matches!(v, Value::String(_)))
    }

    pub fn table() -> Self {
        Self::kind("table", |v| matches!(v, Value::Table(_)))
    }

    pub fn function() -> Self {
        Self::kind("function", |v| matches!(v, Value::Function(_)))
    }

    pub fn userdata() -> Self {
        Self::kind("userdata", |v| {
            matches!(v, Value::Userdata(_) | Value::LightUserdata(_))
        })
    }

    /// A live boxed instance of the registered type `type_name`.
    pub fn instance(type_name: &str) -> Self {
        let expected: Arc<str> = Arc::from(type_name);
        Self::custom(type_name, move |cx, value| match value {
            Value::Userdata(ud) => ud.boxed().is_some_and(|boxed| {
                *boxed.type_name == *expected && cx.shared.objects.contains(boxed.slot)
            }),
            _ => false,
        })
    }

    /// A table whose keys are exactly `1..=n` and whose every element
    /// satisfies `element`.
    pub fn array_of(element: Self) -> Self {
        let label = format!("array of {}", element.label);
        Self::custom(label, move |cx, value| {
            if !matches!(value, Value::Table(_)) {
                return false;
            }
            match cx.table_sequence(value) {
                Ok(Some(items)) => items.iter().all(|item| element.accepts(cx, item)),
                _ => false,
            }
        })
    }

    /// A table whose every entry has a key satisfying `key` and a value
    /// satisfying `value`. The empty table matches.
    pub fn map_of(key: Self, value: Self) -> Self {
        let label = format!("map of {} to {}", key.label, value.label);
        Self::custom(label, move |cx, table| {
            if !matches!(table, Value::Table(_)) {
                return false;
            }
            cx.table_pairs(table).is_ok_and(|pairs| {
                pairs
                    .iter()
                    .all(|(k, v)| key.accepts(cx, k) && value.accepts(cx, v))
            })
        })
    }

    /// `inner` or nil.
    pub fn optional(inner: Self) -> Self {
        let label = format!("{} or nil", inner.label);
        Self::custom(label, move |cx, value| {
            value.is_nil() || inner.accepts(cx, value)
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn accepts(&self, cx: &Context<'_>, value: &Value) -> bool {
        (self.check)(cx, value)
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Param").field(&self.label).finish()
    }
}

/// Check `args` against `params` in declaration order and report the first
/// mismatch. `offset` is the number of leading arguments already consumed
/// (an instance method's receiver).
pub(crate) fn validate(
    cx: &Context<'_>,
    function: &str,
    params: &[Param],
    args: &[Value],
    offset: usize,
) -> Result<()> {
    for (i, param) in params.iter().enumerate() {
        let (accepted, actual) = match args.get(i) {
            Some(value) => (param.accepts(cx, value), value.type_name()),
            None => (param.accepts(cx, &Value::Nil), "no value"),
        };
        if !accepted {
            return Err(BridgeError::ArgumentType {
                function: function.to_string(),
                position: offset + i + 1,
                expected: param.label().to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}

/// The arguments of one bound-function call, consumed front to back.
///
/// Missing trailing arguments read as nil.
pub struct Arguments {
    values: std::vec::IntoIter<Value>,
    position: usize,
}

impl Arguments {
    pub(crate) fn new(values: Vec<Value>, offset: usize) -> Self {
        Self {
            values: values.into_iter(),
            position: offset,
        }
    }

    /// Arguments not consumed yet.
    pub fn remaining(&self) -> usize {
        self.values.len()
    }

    /// 1-based position of the next argument.
    pub fn position(&self) -> usize {
        self.position + 1
    }

    /// Next argument, nil if exhausted.
    pub fn value(&mut self) -> Value {
        self.next().unwrap_or(Value::Nil)
    }

    fn take<T>(
        &mut self,
        expected: &str,
        read: impl FnOnce(Value) -> std::result::Result<T, Value>,
    ) -> Result<T> {
        let (position, value) = match self.next() {
            Some(value) => (self.position, Some(value)),
            None => {
                self.position += 1;
                (self.position, None)
            }
        };
        let missing = value.is_none();
        match read(value.unwrap_or(Value::Nil)) {
            Ok(out) => Ok(out),
            Err(rejected) => Err(BridgeError::ArgumentType {
                function: String::new(),
                position,
                expected: expected.to_string(),
                actual: if missing {
                    "no value".to_string()
                } else {
                    rejected.type_name().to_string()
                },
            }),
        }
    }

    pub fn boolean(&mut self) -> Result<bool> {
        self.take("boolean", |v| v.as_boolean().ok_or(v))
    }

    pub fn integer(&mut self) -> Result<i64> {
        self.take("integer", |v| v.as_integer().ok_or(v))
    }

    pub fn number(&mut self) -> Result<f64> {
        self.take("number", |v| v.as_number().ok_or(v))
    }

    pub fn bytes(&mut self) -> Result<BString> {
        self.take("string", |v| match v {
            Value::String(s) => Ok(s),
            other => Err(other),
        })
    }

    pub fn string(&mut self) -> Result<String> {
        self.take("string", |v| match v {
            Value::String(s) => {
                let text = s.to_str().ok().map(str::to_owned);
                text.ok_or(Value::String(s))
            }
            other => Err(other),
        })
    }

    /// A table argument, still rooted.
    pub fn table(&mut self) -> Result<Value> {
        self.take("table", |v| match v {
            Value::Table(_) => Ok(v),
            other => Err(other),
        })
    }

    pub fn function(&mut self) -> Result<Ref> {
        self.take("function", |v| match v {
            Value::Function(r) => Ok(r),
            other => Err(other),
        })
    }

    pub fn userdata(&mut self) -> Result<UserdataRef> {
        self.take("userdata", |v| match v {
            Value::Userdata(ud) => Ok(ud),
            other => Err(other),
        })
    }
}

impl Iterator for Arguments {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let value = self.values.next()?;
        self.position += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.values.size_hint()
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arguments")
            .field("position", &self.position)
            .field("remaining", &self.values.len())
            .finish()
    }
}
