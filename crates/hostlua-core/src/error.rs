//! Error taxonomy
//!
//! Script-visible failures travel as [`Unwind`], the non-local exit of the VM calling
//! convention. Native-only failures (frozen tables, scheduler misuse, bad configuration) use
//! their own `thiserror` enums and convert into script errors when they cross into the VM.

use crate::opaque::OpaqueKind;
use crate::text::Text;
use crate::value::{OwnedValue, Value};
use crate::vm::is_memory_error;
use std::fmt;

/// Non-local exit out of VM code
#[derive(Debug, Clone, thiserror::Error)]
pub enum Unwind {
    /// A raised script error carrying any VM value
    #[error("{0}")]
    Error(ScriptError),

    /// The current script thread was terminated; not catchable by protected calls
    #[error("thread terminated")]
    Terminate,

    /// The state's allocation budget is exhausted; not catchable by protected calls
    #[error("not enough memory")]
    OutOfMemory,
}

impl Unwind {
    /// Raise a string message
    pub fn runtime(message: impl Into<Text>) -> Self {
        Self::raise(Value::Text(message.into()))
    }

    /// Raise an arbitrary value
    pub fn raise(value: OwnedValue) -> Self {
        Unwind::Error(ScriptError { value })
    }

    /// Translate an error reported by the VM
    ///
    /// Allocation failures stay fatal; everything else becomes a script error carrying the
    /// VM's message.
    pub fn from_lua(err: mlua::Error) -> Self {
        if is_memory_error(&err) {
            return Unwind::OutOfMemory;
        }
        match err {
            mlua::Error::RuntimeError(message) => Unwind::runtime(message),
            mlua::Error::CallbackError { cause, .. } => Unwind::from_lua((*cause).clone()),
            other => Unwind::runtime(other.to_string()),
        }
    }

    /// The raised value, for script errors
    pub fn value(&self) -> Option<&OwnedValue> {
        match self {
            Unwind::Error(err) => Some(&err.value),
            _ => None,
        }
    }

    pub fn is_script_error(&self) -> bool {
        matches!(self, Unwind::Error(_))
    }
}

/// Payload of [`Unwind::Error`]
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub(crate) value: OwnedValue,
}

impl ScriptError {
    pub fn value(&self) -> &OwnedValue {
        &self.value
    }

    pub fn into_value(self) -> OwnedValue {
        self.value
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Text(text) => write!(f, "{}", text),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Number(n) => f.write_str(&crate::value::format_number(*n)),
            other => write!(f, "(error object is a {} value)", other.kind().name()),
        }
    }
}

/// VM-level result
pub type VmResult<T> = Result<T, Unwind>;

// ============================================================================
// Native-only errors
// ============================================================================

/// Errors raised while creating or configuring a VM state
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Option validation failed
    #[error("invalid VM options: {0}")]
    InvalidOptions(String),

    /// Registering a built-in library failed
    #[error("failed to register library '{name}': {source}")]
    Library {
        /// Library table name
        name: &'static str,
        /// Underlying VM error
        #[source]
        source: Unwind,
    },

    /// A class initialisation hook raised
    #[error("class initialisation for {kind} failed: {source}")]
    ClassInit {
        /// Kind the hook was registered for
        kind: OpaqueKind,
        /// Underlying VM error
        #[source]
        source: Unwind,
    },

    /// The VM rejected an operation while the state was being built
    #[error("VM error: {0}")]
    Lua(#[from] mlua::Error),

    /// The owning VM state has been dropped
    #[error("VM state has been closed")]
    StateClosed,
}

/// Errors from the native table store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    /// Mutation of a frozen table
    #[error("attempt to modify a readonly table")]
    Frozen,

    /// `Nil` used as a key
    #[error("table index is nil")]
    NilKey,

    /// NaN used as a key
    #[error("table index is NaN")]
    NanKey,

    /// Position outside `1..=len + 1`
    #[error("position {position} out of bounds")]
    OutOfBounds {
        /// Offending 1-based position
        position: i64,
    },

    /// A move span larger than the array can address
    #[error("too many elements to move")]
    TooManyElements,

    /// A move whose destination index overflows
    #[error("destination wrap around")]
    DestinationWrap,

    /// A value that is neither text nor a number reached `concat`
    #[error("invalid value (at index {index}) in table for 'concat'")]
    InvalidConcat {
        /// 1-based index of the offending value
        index: i64,
    },

    /// Two values with no natural order reached `sort`
    #[error("attempt to compare {left} with {right}")]
    NotComparable {
        /// Type name of the left operand
        left: &'static str,
        /// Type name of the right operand
        right: &'static str,
    },
}

impl From<TableError> for Unwind {
    fn from(err: TableError) -> Self {
        Unwind::runtime(err.to_string())
    }
}

/// Errors from the native scheduler surface
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// The thread handle belongs to a different VM state
    #[error("thread belongs to a different VM state")]
    ForeignThread,

    /// The main thread is not a coroutine and cannot be queued
    #[error("the main thread cannot be scheduled")]
    MainThread,

    /// Neither a function nor a thread
    #[error("expected a function or thread, got {0}")]
    NotRunnable(&'static str),

    /// Durations must be finite and non-negative
    #[error("invalid duration: {0}")]
    InvalidDuration(f64),

    /// The owning VM state has been dropped
    #[error("VM state has been closed")]
    StateClosed,

    /// A VM-level failure while creating or resuming a thread
    #[error(transparent)]
    Vm(#[from] Unwind),
}

impl From<SchedulerError> for Unwind {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Vm(unwind) => unwind,
            other => Unwind::runtime(other.to_string()),
        }
    }
}
