//! Native extension objects
//!
//! An opaque object is a native value handed to scripts as userdata. Each object declares a
//! closed [`OpaqueKind`] and the [`Capabilities`] it implements; the VM dispatches operators on
//! the object through the [`Opaque`] trait and reports `"<Kind> does not support <capability>"`
//! for anything outside the declared set.

pub(crate) mod dispatch;
mod registry;

pub use dispatch::OpaqueCell;
pub use registry::{register_class, ClassInit};
pub(crate) use dispatch::to_raw;
pub(crate) use registry::initialize_classes;

use crate::context::{Context, FunctionContext};
use crate::error::{Unwind, VmResult};
use crate::rc::Shared;
use crate::text::Text;
use crate::value::{ArithOp, OwnedValue, Value};
use crate::vm::Outcome;
use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Closed set of native object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpaqueKind {
    /// Scene-graph object of the host application
    Instance,
    /// Event source scripts can connect to
    Signal,
    /// Connection returned by a signal
    Connection,
    /// Table shared between states and native threads
    SharedTable,
}

impl OpaqueKind {
    pub fn name(self) -> &'static str {
        match self {
            OpaqueKind::Instance => "Instance",
            OpaqueKind::Signal => "ScriptSignal",
            OpaqueKind::Connection => "ScriptConnection",
            OpaqueKind::SharedTable => "SharedTable",
        }
    }
}

impl fmt::Display for OpaqueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit set of operations an opaque object implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const ARITH: Capabilities = Capabilities(0x01);
    pub const INDEX: Capabilities = Capabilities(0x02);
    pub const SET_INDEX: Capabilities = Capabilities(0x04);
    pub const STRINGIFY: Capabilities = Capabilities(0x08);
    pub const CALL: Capabilities = Capabilities(0x20);
    pub const LEN: Capabilities = Capabilities(0x80);

    pub const fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

/// Error raised when a script uses a capability the object does not declare
pub fn unsupported(kind: OpaqueKind, capability: &str) -> Unwind {
    Unwind::runtime(format!("{} does not support {}", kind, capability))
}

/// Behaviour of a native extension object
///
/// Only the methods named by [`Opaque::capabilities`] are ever dispatched; the defaults raise
/// the "does not support" error.
pub trait Opaque: Send + Sync + 'static {
    fn kind(&self) -> OpaqueKind;

    fn capabilities(&self) -> Capabilities;

    fn as_any(&self) -> &dyn Any;

    /// `object[key]`
    fn index(&self, ctx: &Context, key: &Value<'_>) -> VmResult<OwnedValue> {
        let _ = (ctx, key);
        Err(unsupported(self.kind(), "index"))
    }

    /// `object[key] = value`
    fn set_index(&self, ctx: &Context, key: &Value<'_>, value: &Value<'_>) -> VmResult<()> {
        let _ = (ctx, key, value);
        Err(unsupported(self.kind(), "newindex"))
    }

    fn stringify(&self, ctx: &Context) -> VmResult<Text> {
        let _ = ctx;
        Err(unsupported(self.kind(), "tostring"))
    }

    /// Arithmetic with the object on the left, or on the right when `reversed`
    ///
    /// For [`ArithOp::Unm`] `other` is `Nil`.
    fn arith(
        &self,
        ctx: &Context,
        op: ArithOp,
        other: &Value<'_>,
        reversed: bool,
    ) -> VmResult<OwnedValue> {
        let _ = (ctx, other, reversed);
        Err(unsupported(self.kind(), op.label()))
    }

    /// Called like a function; argument 1 is the object itself
    fn call(&self, ctx: &FunctionContext) -> VmResult<Outcome> {
        let _ = ctx;
        Err(unsupported(self.kind(), "call"))
    }

    /// `#object`
    fn len(&self, ctx: &Context) -> VmResult<OwnedValue> {
        let _ = ctx;
        Err(unsupported(self.kind(), "len"))
    }
}

/// Userdata payload: a type-erased opaque object
pub struct OpaqueObject {
    inner: Arc<dyn Opaque>,
}

impl OpaqueObject {
    /// Wrap `object` in a shared handle ready to be pushed as userdata
    pub fn new(object: impl Opaque) -> Shared<OpaqueObject> {
        Shared::new(OpaqueObject {
            inner: Arc::new(object),
        })
    }

    pub fn kind(&self) -> OpaqueKind {
        self.inner.kind()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    pub fn downcast_ref<T: Opaque>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// The object itself, detached from the handle's lock
    pub(crate) fn handle(&self) -> Arc<dyn Opaque> {
        Arc::clone(&self.inner)
    }
}

impl fmt::Debug for OpaqueObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueObject")
            .field("kind", &self.kind())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}
