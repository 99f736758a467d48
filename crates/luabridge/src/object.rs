//! Opaque object registry.
//!
//! Host types are described once with a [`TypeBuilder`] and registered on a
//! runtime. Boxing a value stores the payload in a host-side slot table and
//! hands the engine a small userdata carrying only `(tag, name, slot)`.
//! Unboxing checks the tag and then looks the slot up, so a value whose
//! finalizer already ran can never be unboxed again.

use crate::error::{BridgeError, Result, catch_panic};
use crate::invoke::HostFunction;
use crate::runtime::Context;
use crate::signature::{Arguments, Param, validate};
use crate::value::Value;
use mlua::{AnyUserData, MetaMethod, Table, UserData, UserDataMethods, Value as LuaValue};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

type Payload = Arc<dyn Any + Send + Sync>;
type InstanceBody =
    Arc<dyn Fn(&Context<'_>, Payload, Arguments) -> Result<Vec<Value>> + Send + Sync>;
type EqualityHook =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool + Send + Sync>;
type FinalizerHook = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Result<()> + Send + Sync>;

/// Runtime identity of a registered host type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(u32);

impl TypeTag {
    pub const fn index(self) -> u32 {
        self.0
    }
}

struct Method<B> {
    name: String,
    params: Vec<Param>,
    body: B,
}

/// Registration table for one host type. Built with [`TypeBuilder`].
pub struct TypeDescriptor {
    name: Arc<str>,
    type_id: TypeId,
    host_type: &'static str,
    class_methods: Vec<Method<HostFunction>>,
    instance_methods: Vec<Method<InstanceBody>>,
    equality: Option<EqualityHook>,
    finalizer: Option<FinalizerHook>,
}

impl TypeDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class: Vec<&str> = self.class_methods.iter().map(|m| m.name.as_str()).collect();
        let instance: Vec<&str> = self
            .instance_methods
            .iter()
            .map(|m| m.name.as_str())
            .collect();
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("host_type", &self.host_type)
            .field("class_methods", &class)
            .field("instance_methods", &instance)
            .field("equality", &self.equality.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Builder for a [`TypeDescriptor`] describing host type `T`.
pub struct TypeBuilder<T> {
    descriptor: TypeDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> TypeBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: TypeDescriptor {
                name: Arc::from(name.into()),
                type_id: TypeId::of::<T>(),
                host_type: std::any::type_name::<T>(),
                class_methods: Vec::new(),
                instance_methods: Vec::new(),
                equality: None,
                finalizer: None,
            },
            _marker: PhantomData,
        }
    }

    /// A type-level function, reachable as `Name.method(...)`.
    #[must_use]
    pub fn class_method<F>(mut self, name: &str, params: Vec<Param>, body: F) -> Self
    where
        F: Fn(&Context<'_>, Arguments) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        self.descriptor.class_methods.push(Method {
            name: name.to_string(),
            params,
            body: Arc::new(body),
        });
        self
    }

    /// A value-level function, reachable as `instance:method(...)`. The
    /// unboxed receiver is passed ahead of the remaining arguments, and
    /// `params` describe those remaining arguments only.
    #[must_use]
    pub fn instance_method<F>(mut self, name: &str, params: Vec<Param>, body: F) -> Self
    where
        F: Fn(&Context<'_>, Arc<T>, Arguments) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let type_name = Arc::clone(&self.descriptor.name);
        let body: InstanceBody = Arc::new(
            move |cx: &Context<'_>, payload: Payload, args: Arguments| {
                let this = payload.downcast::<T>().map_err(|_| BridgeError::TypeMismatch {
                    expected: type_name.to_string(),
                    actual: "foreign payload".to_string(),
                })?;
                body(cx, this, args)
            },
        );
        self.descriptor.instance_methods.push(Method {
            name: name.to_string(),
            params,
            body,
        });
        self
    }

    /// Equality between two boxed instances of this type.
    #[must_use]
    pub fn equality<F>(mut self, eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let hook: EqualityHook = Arc::new(
            move |a: &(dyn Any + Send + Sync), b: &(dyn Any + Send + Sync)| {
                match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                    (Some(a), Some(b)) => eq(a, b),
                    _ => false,
                }
            },
        );
        self.descriptor.equality = Some(hook);
        self
    }

    /// Runs once when the engine reclaims a boxed instance. Cannot call back
    /// into the engine; a returned error is logged and queued as a fault.
    #[must_use]
    pub fn finalizer<F>(mut self, finalize: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        let hook: FinalizerHook = Arc::new(move |payload: &(dyn Any + Send + Sync)| {
            payload.downcast_ref::<T>().map_or(Ok(()), &finalize)
        });
        self.descriptor.finalizer = Some(hook);
        self
    }

    pub fn build(self) -> TypeDescriptor {
        self.descriptor
    }
}

struct TypeEntry {
    name: Arc<str>,
    type_id: TypeId,
    equality: Option<EqualityHook>,
    finalizer: Option<FinalizerHook>,
}

struct LiveObject {
    tag: TypeTag,
    payload: Payload,
}

#[derive(Default)]
struct ObjectState {
    types: Vec<TypeEntry>,
    by_name: HashMap<Arc<str>, TypeTag>,
    by_type: HashMap<TypeId, TypeTag>,
    live: HashMap<u64, LiveObject>,
    next_slot: u64,
    faults: Vec<BridgeError>,
}

enum Registration {
    New(TypeTag),
    Existing(TypeTag),
}

/// Host-side table of registered types and live boxed payloads.
///
/// The lock is never held while the engine runs: collection may drop a
/// [`BoxedInstance`] at any allocation, and that drop re-enters this table.
#[derive(Default)]
pub(crate) struct ObjectTable {
    inner: Mutex<ObjectState>,
}

impl ObjectTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        name: &Arc<str>,
        type_id: TypeId,
        equality: Option<EqualityHook>,
        finalizer: Option<FinalizerHook>,
    ) -> Result<Registration> {
        let mut state = self.inner.lock();
        if let Some(&tag) = state.by_name.get(name) {
            let same_type = state
                .types
                .get(tag.0 as usize)
                .is_some_and(|entry| entry.type_id == type_id);
            return if same_type {
                Ok(Registration::Existing(tag))
            } else {
                Err(BridgeError::TypeConflict(name.to_string()))
            };
        }
        if state.by_type.contains_key(&type_id) {
            return Err(BridgeError::TypeConflict(name.to_string()));
        }
        let index = u32::try_from(state.types.len())
            .map_err(|_| BridgeError::runtime("too many registered types"))?;
        let tag = TypeTag(index);
        state.types.push(TypeEntry {
            name: Arc::clone(name),
            type_id,
            equality,
            finalizer,
        });
        state.by_name.insert(Arc::clone(name), tag);
        state.by_type.insert(type_id, tag);
        Ok(Registration::New(tag))
    }

    fn tag_of(&self, type_id: TypeId) -> Option<(TypeTag, Arc<str>)> {
        let state = self.inner.lock();
        let tag = *state.by_type.get(&type_id)?;
        let name = Arc::clone(&state.types.get(tag.0 as usize)?.name);
        Some((tag, name))
    }

    fn insert(&self, tag: TypeTag, payload: Payload) -> u64 {
        let mut state = self.inner.lock();
        state.next_slot += 1;
        let slot = state.next_slot;
        state.live.insert(slot, LiveObject { tag, payload });
        slot
    }

    fn payload(&self, slot: u64, tag: TypeTag) -> Option<Payload> {
        let state = self.inner.lock();
        state
            .live
            .get(&slot)
            .filter(|object| object.tag == tag)
            .map(|object| Arc::clone(&object.payload))
    }

    pub(crate) fn contains(&self, slot: u64) -> bool {
        self.inner.lock().live.contains_key(&slot)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub(crate) fn fault_count(&self) -> usize {
        self.inner.lock().faults.len()
    }

    pub(crate) fn take_faults(&self) -> Vec<BridgeError> {
        std::mem::take(&mut self.inner.lock().faults)
    }

    fn equal(&self, tag: TypeTag, a: u64, b: u64) -> Result<bool> {
        let (entry, left, right) = {
            let state = self.inner.lock();
            let entry = state
                .types
                .get(tag.0 as usize)
                .and_then(|entry| Some((Arc::clone(&entry.name), entry.equality.clone()?)));
            let left = state.live.get(&a).map(|o| Arc::clone(&o.payload));
            let right = state.live.get(&b).map(|o| Arc::clone(&o.payload));
            (entry, left, right)
        };
        match (entry, left, right) {
            (Some((name, hook)), Some(left), Some(right)) => {
                catch_panic(|| Ok(hook(left.as_ref(), right.as_ref())))
                    .map_err(|err| err.in_function(&format!("{name} equality")))
            }
            _ => Ok(false),
        }
    }

    /// Remove `slot` and run its type's finalizer, outside the lock.
    fn finalize(&self, slot: u64) {
        let (object, name, finalizer) = {
            let mut state = self.inner.lock();
            let Some(object) = state.live.remove(&slot) else {
                return;
            };
            let entry = state.types.get(object.tag.0 as usize);
            let name = entry.map(|e| Arc::clone(&e.name));
            let finalizer = entry.and_then(|e| e.finalizer.clone());
            (object, name, finalizer)
        };
        let name = name.unwrap_or_else(|| Arc::from("?"));
        if let Some(finalizer) = finalizer {
            if let Err(err) = catch_panic(|| finalizer(object.payload.as_ref())) {
                tracing::warn!(type_name = %name, slot, error = %err, "finalizer failed");
                let fault = err.in_function(&format!("{name} finalizer"));
                self.inner.lock().faults.push(fault);
            }
        }
        tracing::debug!(type_name = %name, slot, "boxed instance finalized");
    }
}

fn type_key(name: &str) -> String {
    format!("luabridge.type.{name}")
}

/// The engine-side half of a boxed instance.
pub(crate) struct BoxedInstance {
    tag: TypeTag,
    name: Arc<str>,
    slot: u64,
    owner: Weak<ObjectTable>,
}

impl BoxedInstance {
    pub(crate) fn tag(&self) -> TypeTag {
        self.tag
    }

    pub(crate) fn type_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub(crate) fn slot(&self) -> u64 {
        self.slot
    }
}

impl Drop for BoxedInstance {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.finalize(self.slot);
        }
    }
}

impl UserData for BoxedInstance {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: LuaValue| {
            let lib: Table = lua.named_registry_value(&type_key(&this.name))?;
            lib.raw_get::<_, LuaValue>(key)
        });

        methods.add_meta_function(MetaMethod::Eq, |_, (a, b): (AnyUserData, AnyUserData)| {
            let (Ok(a), Ok(b)) = (a.borrow::<Self>(), b.borrow::<Self>()) else {
                return Ok(false);
            };
            if a.tag != b.tag {
                return Ok(false);
            }
            match a.owner.upgrade() {
                Some(owner) => Ok(owner.equal(a.tag, a.slot, b.slot)?),
                None => Ok(false),
            }
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("{}: #{}", this.name, this.slot))
        });
    }
}

impl<'lua> Context<'lua> {
    /// Register a host type. Registering the same type under the same name
    /// again returns the existing tag.
    pub fn register_type(&self, descriptor: TypeDescriptor) -> Result<TypeTag> {
        let TypeDescriptor {
            name,
            type_id,
            host_type,
            class_methods,
            instance_methods,
            equality,
            finalizer,
        } = descriptor;

        let tag = match self
            .shared
            .objects
            .register(&name, type_id, equality, finalizer)?
        {
            Registration::Existing(tag) => return Ok(tag),
            Registration::New(tag) => tag,
        };

        let lib = self.lua.create_table()?;
        lib.raw_set("__name", &*name)?;
        for method in class_methods {
            let qualified = format!("{name}.{}", method.name);
            let function = self.host_function(&qualified, method.params, method.body)?;
            lib.raw_set(method.name, function)?;
        }
        for method in instance_methods {
            let qualified = format!("{name}:{}", method.name);
            let function =
                self.instance_function(tag, &name, &qualified, method.params, method.body)?;
            lib.raw_set(method.name, function)?;
        }
        lib.raw_set("__index", lib.clone())?;
        self.lua
            .set_named_registry_value(&type_key(&name), lib.clone())?;
        self.namespace()?.set(&*name, lib)?;

        tracing::debug!(type_name = %name, host_type, tag = tag.0, "registered host type");
        Ok(tag)
    }

    fn instance_function(
        &self,
        tag: TypeTag,
        type_name: &Arc<str>,
        qualified: &str,
        params: Vec<Param>,
        body: InstanceBody,
    ) -> Result<mlua::Function<'lua>> {
        let type_name = Arc::clone(type_name);
        let receiver: HostFunction = Arc::new(move |cx: &Context<'_>, args: Arguments| {
            let mut values: Vec<Value> = args.collect();
            let rest = if values.is_empty() {
                Vec::new()
            } else {
                values.split_off(1)
            };
            let this = values.pop().unwrap_or(Value::Nil);
            let payload = match &this {
                Value::Userdata(ud) => ud
                    .boxed()
                    .filter(|boxed| boxed.tag == tag)
                    .and_then(|boxed| cx.shared.objects.payload(boxed.slot, tag)),
                _ => None,
            };
            let Some(payload) = payload else {
                return Err(BridgeError::ArgumentType {
                    function: String::new(),
                    position: 1,
                    expected: type_name.to_string(),
                    actual: this.type_name().to_string(),
                });
            };
            validate(cx, "", &params, &rest, 1)?;
            body(cx, payload, Arguments::new(rest, 1))
        });
        self.host_function(qualified, Vec::new(), receiver)
    }

    /// Box `value` as an instance of its registered type.
    pub fn box_value<T: Any + Send + Sync>(&self, value: T) -> Result<Value> {
        self.box_arc(Arc::new(value))
    }

    /// Box a shared payload; the host keeps its own clone.
    pub fn box_arc<T: Any + Send + Sync>(&self, value: Arc<T>) -> Result<Value> {
        let objects = &self.shared.objects;
        let (tag, name) = objects
            .tag_of(TypeId::of::<T>())
            .ok_or_else(|| BridgeError::UnregisteredType(std::any::type_name::<T>().to_string()))?;
        let slot = objects.insert(tag, value);
        let instance = BoxedInstance {
            tag,
            name: Arc::clone(&name),
            slot,
            owner: Arc::downgrade(objects),
        };
        let userdata = self.lua.create_userdata(instance)?;
        tracing::debug!(type_name = %name, slot, "boxed host value");
        self.decode_raw(LuaValue::UserData(userdata))
    }

    /// The payload of a boxed `T`, or `None` if `value` is anything else or
    /// was already finalized.
    pub fn unbox<T: Any + Send + Sync>(&self, value: &Value) -> Option<Arc<T>> {
        let Value::Userdata(ud) = value else {
            return None;
        };
        let boxed = ud.boxed()?;
        let (tag, _) = self.shared.objects.tag_of(TypeId::of::<T>())?;
        if boxed.tag != tag {
            return None;
        }
        self.shared
            .objects
            .payload(boxed.slot, tag)?
            .downcast::<T>()
            .ok()
    }

    /// Like [`unbox`](Self::unbox), treating a mismatch as a host defect.
    pub fn expect_instance<T: Any + Send + Sync>(&self, value: &Value) -> Result<Arc<T>> {
        self.unbox::<T>(value).ok_or_else(|| BridgeError::TypeMismatch {
            expected: self
                .shared
                .objects
                .tag_of(TypeId::of::<T>())
                .map_or_else(|| std::any::type_name::<T>().to_string(), |(_, n)| n.to_string()),
            actual: value.type_name().to_string(),
        })
    }

    /// Number of boxed payloads not yet finalized.
    pub fn live_objects(&self) -> usize {
        self.shared.objects.live_count()
    }
}
