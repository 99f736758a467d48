//! luabridge: embedding bridge between a host program and a Lua runtime
//!
//! The bridge exchanges values, functions and opaque host objects with an
//! embedded, stack-based scripting engine. Scripts can keep long-lived
//! references to callbacks, host code can call back into scripts under a
//! protected call that yields a traceback, and host objects can be boxed
//! into scripts with per-type method tables, equality and finalizers.
//!
//! # Architecture
//!
//! ```text
//! Executor thread ──► Runtime ──► Context ──► Stack frames
//!                        │           │
//!                        │           ├── reference registry (Handle / Ref)
//!                        │           ├── host functions (Param, Arguments)
//!                        │           └── protected calls + tracebacks
//!                        └── object table (TypeBuilder, boxed instances)
//! ```
//!
//! # Modules
//!
//! - `config`: Runtime configuration (TOML)
//! - `logging`: tracing subscriber setup
//! - `error`: Error taxonomy
//! - `stack`: Value stack frames and raw host functions
//! - `value`: Host-side value model and table helpers
//! - `registry`: Reference registry for long-lived handles
//! - `signature`: Argument validation and extraction
//! - `invoke`: Protected calls, script loading and host function binding
//! - `object`: Opaque host objects exposed as script userdata
//! - `runtime`: Runtime lifecycle
//! - `bindings`: Key-combination callback table
//! - `executor`: Single owning thread for cross-thread callers

pub mod bindings;
pub mod config;
pub mod error;
pub mod executor;
pub mod invoke;
pub mod logging;
pub mod object;
pub mod registry;
pub mod runtime;
pub mod signature;
pub mod stack;
pub mod value;

pub use bindings::{BindingId, Bindings, KeyCombo, Modifiers, TriggerReport};
pub use config::{DEFAULT_NAMESPACE, RuntimeConfig};
pub use error::{BridgeError, Result};
pub use executor::{Executor, ExecutorHandle};
pub use invoke::HostFunction;
pub use logging::{LogConfig, LogError, LogFormat, init_logging};
pub use object::{TypeBuilder, TypeDescriptor, TypeTag};
pub use registry::{Handle, Ref};
pub use runtime::{Context, Runtime};
pub use signature::{Arguments, Param};
pub use stack::{Kind, RawFunction, Stack};
pub use value::{BoxedTag, UserdataRef, Value};
