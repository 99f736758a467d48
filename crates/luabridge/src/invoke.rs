//! Invocation engine.
//!
//! Calls follow the engine's stack protocol: the callee and its arguments
//! are pushed left to right, a diagnostic message handler is slotted in
//! below the callee, and the protected call leaves every returned value
//! above the original depth. A failed call leaves a single fault value that
//! is decoded into a [`BridgeError`] carrying the captured traceback.

use crate::error::{BridgeError, Result, catch_panic};
use crate::registry::Handle;
use crate::runtime::Context;
use crate::signature::{Arguments, Param, validate};
use crate::stack::{RawFunction, Stack};
use crate::value::Value;
use mlua::{Function, Lua, MultiValue, Value as LuaValue};
use std::fmt::Write as _;
use std::sync::Arc;

/// Body of a bound host function.
pub type HostFunction =
    Arc<dyn Fn(&Context<'_>, Arguments) -> Result<Vec<Value>> + Send + Sync + 'static>;

const XPCALL_KEY: &str = "luabridge.xpcall";
const HANDLER_KEY: &str = "luabridge.handler";

/// Capture the engine's protected-call primitive and install the message
/// handler. Runs once per runtime, before any script code.
pub(crate) fn install(lua: &Lua, traceback_depth: usize) -> Result<()> {
    let xpcall: LuaValue = lua.globals().raw_get("xpcall")?;
    let LuaValue::Function(xpcall) = xpcall else {
        return Err(BridgeError::runtime("base library does not provide xpcall"));
    };
    lua.set_named_registry_value(XPCALL_KEY, xpcall)?;

    let handler = lua.create_function(move |lua, args: MultiValue| {
        let err = args.into_iter().next().unwrap_or(LuaValue::Nil);
        let fault = lua.create_table()?;
        fault.raw_set("__fault", true)?;
        fault.raw_set("error", err)?;
        fault.raw_set("traceback", traceback(lua, traceback_depth))?;
        Ok(fault)
    })?;
    lua.set_named_registry_value(HANDLER_KEY, handler)?;
    Ok(())
}

fn traceback(lua: &Lua, depth: usize) -> String {
    let mut out = String::from("stack traceback:");
    // Level 0 is the handler itself.
    for level in 1..=depth {
        let Some(frame) = lua.inspect_stack(level) else {
            break;
        };
        let source = frame.source();
        let names = frame.names();
        let src = source.short_src.as_deref().unwrap_or("?");
        let line = frame.curr_line();
        let _ = if line > 0 {
            write!(out, "\n\t{src}:{line}:")
        } else {
            write!(out, "\n\t{src}:")
        };
        let _ = match names.name.as_deref() {
            Some(name) => write!(out, " in function '{name}'"),
            None => write!(out, " in ?"),
        };
    }
    out
}


impl<'lua> Context<'lua> {
    /// Decode the single value a failed protected call left behind.
    pub(crate) fn decode_fault(&self, err: LuaValue<'lua>) -> BridgeError {
        if let LuaValue::Table(fault) = &err {
            if fault.raw_get::<_, bool>("__fault").unwrap_or(false) {
                let traceback = fault
                    .raw_get::<_, Option<String>>("traceback")
                    .ok()
                    .flatten();
                let inner = fault
                    .raw_get::<_, LuaValue>("error")
                    .unwrap_or(LuaValue::Nil);
                return self.error_value(inner).with_traceback(traceback);
            }
        }
        self.error_value(err)
    }

    /// A fault for the raised value `err`. Values other than strings and
    /// numbers are rooted and kept on the fault.
    fn error_value(&self, err: LuaValue<'lua>) -> BridgeError {
        match err {
            LuaValue::Error(e) => BridgeError::from_lua_error(&e),
            LuaValue::String(s) => BridgeError::runtime(s.to_string_lossy()),
            LuaValue::Integer(i) => BridgeError::runtime(i.to_string()),
            LuaValue::Number(n) => BridgeError::runtime(n.to_string()),
            other => {
                let fault = BridgeError::runtime(format!(
                    "(error object is a {} value)",
                    other.type_name()
                ));
                match self.decode_raw(other) {
                    Ok(raised) => fault.with_value(raised),
                    Err(err) => {
                        tracing::warn!(error = %err, "could not root raised error value");
                        fault
                    }
                }
            }
        }
    }

    /// Call the function behind `function` with `args`, collecting every
    /// returned value.
    pub fn call(&self, function: Handle, args: &[Value]) -> Result<Vec<Value>> {
        let mut stack = self.stack();
        stack.push_ref(function)?;
        self.finish_call(stack, args)
    }

    pub fn call_value(&self, function: &Value, args: &[Value]) -> Result<Vec<Value>> {
        let mut stack = self.stack();
        stack.encode(function)?;
        self.finish_call(stack, args)
    }

    /// Call the global function `name`.
    pub fn call_global(&self, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        let function: LuaValue = self.lua.globals().get(name)?;
        let mut stack = self.stack();
        stack.push_raw(function);
        self.finish_call(stack, args)
    }

    fn finish_call(&self, mut stack: Stack<'lua>, args: &[Value]) -> Result<Vec<Value>> {
        for arg in args {
            stack.encode(arg)?;
        }
        let count = stack.protected_call(args.len())?;
        stack
            .take_results(count)?
            .into_iter()
            .map(|raw| self.decode_raw(raw))
            .collect()
    }

    /// Compile `source` without running it.
    pub fn load(&self, source: &str, chunk_name: &str) -> Result<Value> {
        let function = self
            .lua
            .load(source)
            .set_name(chunk_name)
            .into_function()
            .map_err(|e| BridgeError::from_lua_error(&e))?;
        self.decode_raw(LuaValue::Function(function))
    }

    /// Compile and run `source`, returning whatever the chunk returns.
    pub fn exec(&self, source: &str) -> Result<Vec<Value>> {
        let chunk = self.load(source, "=exec")?;
        self.call_value(&chunk, &[])
    }

    pub(crate) fn host_function(
        &self,
        name: &str,
        params: Vec<Param>,
        body: HostFunction,
    ) -> Result<Function<'lua>> {
        let name: Arc<str> = Arc::from(name);
        let raw: RawFunction = Arc::new(move |frame: &mut Stack<'_>| {
            let cx = frame.context().clone();
            let top = frame.top();
            let args = frame
                .take_results(top)?
                .into_iter()
                .map(|raw| cx.decode_raw(raw))
                .collect::<Result<Vec<_>>>()?;
            validate(&cx, &name, &params, &args, 0)?;
            let results = catch_panic(|| body(&cx, Arguments::new(args, 0)))
                .map_err(|e| e.in_function(&name))?;
            for value in &results {
                frame.encode(value)?;
            }
            Ok(results.len())
        });

        let mut stack = self.stack();
        stack.push_function(raw, 0)?;
        match stack.pop_raw()? {
            LuaValue::Function(function) => Ok(function),
            other => Err(BridgeError::runtime(format!(
                "expected function, got {}",
                other.type_name()
            ))),
        }
    }

    /// Wrap `body` as a script-callable function. Arguments are checked
    /// against `params` in order before `body` runs.
    pub fn bind<F>(&self, name: &str, params: Vec<Param>, body: F) -> Result<Value>
    where
        F: Fn(&Context<'_>, Arguments) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let function = self.host_function(name, params, Arc::new(body))?;
        self.decode_raw(LuaValue::Function(function))
    }

    /// [`bind`](Self::bind) and publish the result under `name` in the host
    /// namespace.
    pub fn register_function<F>(&self, name: &str, params: Vec<Param>, body: F) -> Result<()>
    where
        F: Fn(&Context<'_>, Arguments) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let function = self.host_function(name, params, Arc::new(body))?;
        self.namespace()?.set(name, function)?;
        tracing::debug!(
            function = name,
            namespace = %self.shared.config.namespace,
            "registered host function"
        );
        Ok(())
    }
}

impl Stack<'_> {
    /// Call the function below the top `nargs` values. `[-(nargs+1), +n]`
    ///
    /// Returns `n`, the number of results left on the frame. On failure
    /// nothing is left and the decoded fault is returned.
    pub fn protected_call(&mut self, nargs: usize) -> Result<usize> {
        let depth = i32::try_from(nargs).map_or(i32::MIN, |n| -n - 1);
        let callee = self.abs_index(depth)?;
        let callee = i32::try_from(callee).map_err(|_| BridgeError::InvalidIndex {
            index: depth,
            top: self.top(),
        })?;

        let lua = self.lua();
        let xpcall: Function = lua.named_registry_value(XPCALL_KEY)?;
        let handler: Function = lua.named_registry_value(HANDLER_KEY)?;
        self.push_raw(LuaValue::Function(handler));
        self.insert(callee)?;

        // xpcall(f, handler, ...) takes the handler as its second argument.
        let mut call = self.take_results(nargs + 1)?;
        let handler = self.pop_raw()?;
        call.insert(1, handler);

        let mut results = xpcall
            .call::<_, MultiValue>(MultiValue::from_vec(call))
            .map_err(|e| BridgeError::from_lua_error(&e))?
            .into_vec();
        let succeeded = matches!(results.first(), Some(LuaValue::Boolean(true)));
        if results.is_empty() {
            return Err(BridgeError::runtime("protected call returned no status"));
        }
        results.remove(0);

        if succeeded {
            let count = results.len();
            for value in results {
                self.push_raw(value);
            }
            Ok(count)
        } else {
            let fault = results.into_iter().next().unwrap_or(LuaValue::Nil);
            let err = self.context().decode_fault(fault);
            tracing::debug!(error = %err, "protected call failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Runtime;
    use crate::stack::Kind;

    #[test]
    fn multiple_and_zero_returns() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let f = cx.load("return 1, 'two', nil", "multi").unwrap();
        assert_eq!(
            cx.call_value(&f, &[]).unwrap(),
            vec![Value::Integer(1), Value::from("two"), Value::Nil]
        );
        let g = cx.load("local x = ...", "none").unwrap();
        assert!(cx.call_value(&g, &[Value::Integer(1)]).unwrap().is_empty());
    }

    #[test]
    fn protected_call_restores_depth_on_failure() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_string("sentinel").unwrap();
        let f = cx.load("error('nope')", "=fails").unwrap();
        stack.encode(&f).unwrap();
        stack.push_integer(1);
        let err = stack.protected_call(1).unwrap_err();
        assert!(err.is_runtime_fault());
        assert!(err.to_string().contains("nope"));
        assert_eq!(stack.top(), 1);
        assert_eq!(stack.kind(1), Kind::String);
    }

    #[test]
    fn results_land_above_original_depth() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_boolean(true);
        let f = cx.load("local a, b = ... return b, a", "swap").unwrap();
        stack.encode(&f).unwrap();
        stack.push_integer(1);
        stack.push_integer(2);
        let n = stack.protected_call(2).unwrap();
        assert_eq!(n, 2);
        assert_eq!(stack.top(), 3);
        assert_eq!(stack.decode(2).unwrap(), Value::Integer(2));
        assert_eq!(stack.decode(3).unwrap(), Value::Integer(1));
    }

    #[test]
    fn protected_call_without_callee_is_invariant_violation() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let mut stack = cx.stack();
        stack.push_integer(1);
        assert!(stack.protected_call(1).unwrap_err().is_invariant_violation());
    }

    #[test]
    fn runtime_fault_carries_traceback() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let err = cx
            .exec("local function inner() error('deep') end\nlocal function outer() inner() end\nouter()")
            .unwrap_err();
        assert!(err.is_runtime_fault());
        assert!(err.to_string().contains("deep"));
        let traceback = err.traceback().unwrap();
        assert!(traceback.starts_with("stack traceback:"));
        assert!(traceback.contains("inner"));
    }

    #[test]
    fn non_string_error_values_are_described() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let err = cx.exec("error({})").unwrap_err();
        assert_eq!(err.to_string(), "(error object is a table value)");
        let err = cx.exec("error(42)").unwrap_err();
        assert_eq!(err.to_string(), "42");
    }

    #[test]
    fn raised_table_is_kept_on_the_fault() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let err = cx.exec("error({code = 42})").unwrap_err();
        let raised = err.error_value().expect("raised value kept");
        assert_eq!(raised.kind(), Kind::Table);
        assert_eq!(
            cx.table_get(raised, &Value::from("code")).unwrap(),
            Value::Integer(42)
        );
        assert!(cx.exec("error('plain')").unwrap_err().error_value().is_none());
    }

    #[test]
    fn panicking_host_function_becomes_a_named_fault() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        cx.register_function("oops", vec![], |_, _| panic!("body exploded"))
            .unwrap();
        let err = cx.exec("host.oops()").unwrap_err();
        assert!(err.is_runtime_fault());
        assert!(err.to_string().contains("oops: panicked: body exploded"), "{err}");
        assert!(err.traceback().unwrap().starts_with("stack traceback:"));
        assert_eq!(cx.exec("return 1").unwrap(), vec![Value::Integer(1)]);
    }

    #[test]
    fn syntax_errors_surface_at_load() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let err = cx.load("return +", "broken").unwrap_err();
        assert!(matches!(err, BridgeError::Syntax(_)));
        assert!(err.is_runtime_fault());
    }

    #[test]
    fn calling_a_non_function_is_a_runtime_fault() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let err = cx.call_global("missing", &[]).unwrap_err();
        assert!(err.is_runtime_fault());
        assert!(err.to_string().contains("attempt to call"));
    }

    #[test]
    fn bound_function_sees_host_arguments() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        let add = cx
            .bind("add", vec![Param::integer(), Param::integer()], |_, mut args| {
                Ok(vec![Value::Integer(args.integer()? + args.integer()?)])
            })
            .unwrap();
        let out = cx
            .call_value(&add, &[Value::Integer(2), Value::Float(3.0)])
            .unwrap();
        assert_eq!(out, vec![Value::Integer(5)]);
    }

    #[test]
    fn registered_function_is_published_in_namespace() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        cx.register_function("greet", vec![Param::string()], |_, mut args| {
            Ok(vec![Value::from(format!("hello {}", args.string()?))])
        })
        .unwrap();
        assert_eq!(
            cx.exec("return host.greet('lua')").unwrap(),
            vec![Value::from("hello lua")]
        );
    }

    #[test]
    fn nested_fault_keeps_innermost_traceback() {
        let rt = Runtime::new().unwrap();
        let cx = rt.context().unwrap();
        cx.register_function("relay", vec![Param::function()], |cx, mut args| {
            let callback = args.function()?;
            cx.call(callback.handle(), &[])
        })
        .unwrap();
        let err = cx
            .exec("local function thrower() error('from script') end\nreturn host.relay(thrower)")
            .unwrap_err();
        assert!(err.is_runtime_fault());
        let message = err.to_string();
        assert!(message.starts_with("relay: "), "{message}");
        assert!(message.contains("from script"));
        assert!(err.traceback().unwrap().contains("exec:1:"));
    }
}
