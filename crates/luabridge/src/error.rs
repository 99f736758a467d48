//! Error types for luabridge
//!
//! Faults fall into three classes:
//!
//! - **argument faults** (`ArgumentType`): a bound function was called with
//!   an argument that failed its declared parameter check.
//! - **runtime faults** (`Runtime`, `Syntax`): script code raised, possibly
//!   through a nested host callback. Always recoverable.
//! - **invariant violations** (`InvalidHandle`, `InvalidIndex`, `TypeMismatch`): host code
//!   misused the bridge. These are defects; tests assert on them.

use crate::registry::Handle;
use crate::value::Value;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use thiserror::Error;

/// Result type alias using the bridge's error type
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for luabridge
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    /// A bound function rejected one of its arguments before its body ran
    #[error("bad argument #{position} to '{function}' ({expected} expected, got {actual})")]
    ArgumentType {
        function: String,
        /// 1-based parameter position
        position: usize,
        expected: String,
        actual: String,
    },

    /// Script code raised an error
    #[error("{message}")]
    Runtime {
        message: String,
        traceback: Option<String>,
        /// The raised value, when it was not a plain string or number
        value: Option<Arc<Value>>,
    },

    /// A chunk failed to compile
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("invalid handle {0}")]
    InvalidHandle(Handle),

    #[error("stack index {index} is not valid (top is {top})")]
    InvalidIndex { index: i32, top: usize },

    /// A value was unboxed against a host type it does not carry
    #[error("expected instance of {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("host type {0} is not registered")]
    UnregisteredType(String),

    #[error("type name '{0}' is already registered for a different host type")]
    TypeConflict(String),

    #[error("runtime is closed")]
    Closed,

    /// A blocking executor call was issued from the executor's own thread
    #[error("re-entrant call into the runtime executor")]
    Reentrant,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Lua(#[from] mlua::Error),
}

impl BridgeError {
    /// Construct a runtime fault with no traceback attached yet.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            traceback: None,
            value: None,
        }
    }

    pub fn is_argument_fault(&self) -> bool {
        matches!(self, Self::ArgumentType { .. })
    }

    pub fn is_runtime_fault(&self) -> bool {
        matches!(self, Self::Runtime { .. } | Self::Syntax(_))
    }

    /// True for host-side misuse of the bridge (a programming defect).
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandle(_) | Self::InvalidIndex { .. } | Self::TypeMismatch { .. }
        )
    }

    /// The diagnostic traceback captured when the fault crossed into the host.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Self::Runtime { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }

    /// The value the script raised, e.g. the table passed to `error({...})`.
    pub fn error_value(&self) -> Option<&Value> {
        match self {
            Self::Runtime { value, .. } => value.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn with_value(self, raised: Value) -> Self {
        match self {
            Self::Runtime {
                message,
                traceback,
                value: None,
            } => Self::Runtime {
                message,
                traceback,
                value: Some(Arc::new(raised)),
            },
            other => other,
        }
    }

    /// Attach `traceback` unless one was already captured closer to the fault.
    pub(crate) fn with_traceback(self, traceback: Option<String>) -> Self {
        match self {
            Self::Runtime {
                message,
                traceback: None,
                value,
            } => Self::Runtime {
                message,
                traceback,
                value,
            },
            other => other,
        }
    }

    /// Qualify a fault raised inside the body of the bound function `name`.
    pub(crate) fn in_function(self, name: &str) -> Self {
        match self {
            Self::ArgumentType {
                function,
                position,
                expected,
                actual,
            } => Self::ArgumentType {
                function: if function.is_empty() {
                    name.to_string()
                } else {
                    function
                },
                position,
                expected,
                actual,
            },
            Self::Runtime {
                message,
                traceback,
                value,
            } => Self::Runtime {
                message: format!("{name}: {message}"),
                traceback,
                value,
            },
            other => Self::runtime(format!("{name}: {other}")),
        }
    }

    /// Recover a bridge error from an engine error, unwrapping the layers the
    /// engine adds when an error travels through a host callback.
    pub(crate) fn from_lua_error(err: &mlua::Error) -> Self {
        match err {
            mlua::Error::CallbackError { cause, .. } => Self::from_lua_error(cause),
            mlua::Error::ExternalError(inner) => match inner.downcast_ref::<BridgeError>() {
                Some(Self::Lua(nested)) => Self::from_lua_error(nested),
                Some(bridge) => bridge.clone(),
                None => Self::runtime(inner.to_string()),
            },
            mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => {
                Self::runtime(message.clone())
            }
            mlua::Error::SyntaxError { message, .. } => Self::Syntax(message.clone()),
            other => Self::runtime(other.to_string()),
        }
    }
}

/// Text carried by a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run host code that is about to be unwound through the engine, turning a
/// panic into a runtime fault.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> Result<R>) -> Result<R> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(BridgeError::runtime(format!(
            "panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

impl From<BridgeError> for mlua::Error {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Lua(inner) => inner,
            other => mlua::Error::external(other),
        }
    }
}
