//! Runtime lifecycle.
//!
//! A [`Runtime`] owns one engine instance together with the bridge state
//! attached to it: the reference registry's bookkeeping and the opaque
//! object table. It moves `Open -> Closed` exactly once. All bridge
//! operations go through a [`Context`] borrowed from an open runtime.

use crate::config::RuntimeConfig;
use crate::error::{BridgeError, Result};
use crate::invoke;
use crate::object::ObjectTable;
use crate::registry::{REFS_KEY, RefBook};
use crate::stack::Stack;
use mlua::{Lua, LuaOptions, StdLib, Table};
use std::fmt;
use std::sync::Arc;

/// Bridge state shared by every context of one runtime.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) refs: RefBook,
    pub(crate) objects: Arc<ObjectTable>,
}

/// Explicit handle threaded through every bridge call.
#[derive(Clone)]
pub struct Context<'lua> {
    pub(crate) lua: &'lua Lua,
    pub(crate) shared: Arc<Shared>,
}

impl<'lua> Context<'lua> {
    /// Recover the context inside a host callback.
    pub(crate) fn attach(lua: &'lua Lua) -> Result<Self> {
        let shared = lua
            .app_data_ref::<Arc<Shared>>()
            .map(|shared| Arc::clone(&shared))
            .ok_or(BridgeError::Closed)?;
        Ok(Self { lua, shared })
    }

    /// A fresh, empty stack frame.
    pub fn stack(&self) -> Stack<'lua> {
        Stack::new(self.clone())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// The table host registrations are published into.
    pub(crate) fn namespace(&self) -> Result<Table<'lua>> {
        let globals = self.lua.globals();
        let name = &self.shared.config.namespace;
        if name.is_empty() {
            return Ok(globals);
        }
        Ok(globals.get(name.as_str())?)
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("namespace", &self.shared.config.namespace)
            .finish_non_exhaustive()
    }
}

/// One embedded engine instance.
pub struct Runtime {
    lua: Option<Lua>,
    shared: Arc<Shared>,
}

impl Runtime {
    /// Open a runtime with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;

        let lua = if config.open_std_libs {
            Lua::new()
        } else {
            Lua::new_with(StdLib::NONE, LuaOptions::new())?
        };
        if let Some(limit) = config.memory_limit {
            lua.set_memory_limit(limit)?;
        }

        lua.set_named_registry_value(REFS_KEY, lua.create_table()?)?;
        invoke::install(&lua, config.traceback_depth)?;
        if !config.namespace.is_empty() {
            lua.globals()
                .set(config.namespace.as_str(), lua.create_table()?)?;
        }

        let shared = Arc::new(Shared {
            config,
            refs: RefBook::new(),
            objects: Arc::new(ObjectTable::new()),
        });
        lua.set_app_data(Arc::clone(&shared));

        tracing::info!(
            namespace = %shared.config.namespace,
            std_libs = shared.config.open_std_libs,
            memory_limit = ?shared.config.memory_limit,
            "runtime opened"
        );
        Ok(Self {
            lua: Some(lua),
            shared,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.lua.is_none()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Borrow a context for bridge operations.
    pub fn context(&self) -> Result<Context<'_>> {
        let lua = self.lua.as_ref().ok_or(BridgeError::Closed)?;
        Ok(Context {
            lua,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Tear the engine down. Pending finalizers run and every handle becomes
    /// invalid. Closing twice reports [`BridgeError::Closed`].
    pub fn close(&mut self) -> Result<()> {
        let lua = self.lua.take().ok_or(BridgeError::Closed)?;
        let outstanding = self.shared.refs_outstanding();
        drop(lua);
        self.shared.refs.clear();
        tracing::info!(
            outstanding_refs = outstanding,
            faults = self.shared.objects.fault_count(),
            "runtime closed"
        );
        Ok(())
    }

    /// Run a full collection cycle, finalizing unreachable boxed instances.
    pub fn collect_garbage(&self) -> Result<()> {
        let lua = self.lua.as_ref().ok_or(BridgeError::Closed)?;
        self.context()?.drain_released()?;
        // Finalized objects are only reclaimed by the following cycle.
        lua.gc_collect()?;
        lua.gc_collect()?;
        Ok(())
    }

    /// Outstanding handles; zero once closed.
    pub fn live_refs(&self) -> usize {
        self.context().map_or(0, |cx| cx.live_refs())
    }

    pub fn live_objects(&self) -> usize {
        self.shared.objects.live_count()
    }

    /// Faults raised by finalizers since the last call.
    pub fn take_faults(&self) -> Vec<BridgeError> {
        self.shared.objects.take_faults()
    }

    /// Bytes currently allocated by the engine; zero once closed.
    pub fn used_memory(&self) -> usize {
        self.lua.as_ref().map_or(0, Lua::used_memory)
    }
}

impl Shared {
    fn refs_outstanding(&self) -> usize {
        self.refs.live_count()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.lua.is_some() {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "failed to close runtime");
            }
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("closed", &self.is_closed())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn open_then_close_once() {
        let mut rt = Runtime::new().unwrap();
        assert!(!rt.is_closed());
        rt.close().unwrap();
        assert!(rt.is_closed());
        assert!(matches!(rt.close(), Err(BridgeError::Closed)));
        assert!(matches!(rt.context(), Err(BridgeError::Closed)));
        assert!(matches!(rt.collect_garbage(), Err(BridgeError::Closed)));
        assert_eq!(rt.live_refs(), 0);
        assert_eq!(rt.used_memory(), 0);
    }

    #[test]
    fn close_invalidates_handles() {
        let mut rt = Runtime::new().unwrap();
        let handle = {
            let cx = rt.context().unwrap();
            let mut stack = cx.stack();
            stack.push_string("kept").unwrap();
            stack.reference().unwrap()
        };
        assert_eq!(rt.live_refs(), 1);
        rt.close().unwrap();
        assert!(!handle.is_nil());
        assert_eq!(rt.shared.refs_outstanding(), 0);
        assert_eq!(rt.live_refs(), 0);
    }

    #[test]
    fn std_libs_are_optional() {
        let bare = Runtime::with_config(RuntimeConfig {
            open_std_libs: false,
            ..RuntimeConfig::default()
        })
        .unwrap();
        let cx = bare.context().unwrap();
        assert_eq!(cx.global("string").unwrap(), Value::Nil);
        assert_eq!(cx.exec("return 1 + 1").unwrap(), vec![Value::Integer(2)]);

        let full = Runtime::new().unwrap();
        let cx = full.context().unwrap();
        assert_eq!(
            cx.exec("return string.upper('a')").unwrap(),
            vec![Value::from("A")]
        );
    }

    #[test]
    fn empty_namespace_publishes_globals() {
        let rt = Runtime::with_config(RuntimeConfig {
            namespace: String::new(),
            ..RuntimeConfig::default()
        })
        .unwrap();
        let cx = rt.context().unwrap();
        cx.register_function("ping", vec![], |_, _| Ok(vec![Value::from("pong")]))
            .unwrap();
        assert_eq!(cx.exec("return ping()").unwrap(), vec![Value::from("pong")]);
    }

    #[test]
    fn invalid_config_is_rejected_at_open() {
        let err = Runtime::with_config(RuntimeConfig {
            namespace: "not valid".to_string(),
            ..RuntimeConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn memory_limit_turns_runaway_allocation_into_fault() {
        let rt = Runtime::with_config(RuntimeConfig {
            memory_limit: Some(2 * 1024 * 1024),
            ..RuntimeConfig::default()
        })
        .unwrap();
        let cx = rt.context().unwrap();
        let err = cx
            .exec("local t = {} for i = 1, 1e8 do t[i] = i end")
            .unwrap_err();
        assert!(err.is_runtime_fault());
        assert!(rt.used_memory() > 0);
    }
}
