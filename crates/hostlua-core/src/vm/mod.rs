//! The embedded VM boundary
//!
//! Every [`VmState`] embeds a Luau VM through `mlua`. Native functions enter the VM through a
//! small Luau runtime chunk that turns their [`Outcome`] into a return, a raised error, a yield
//! or a termination of the running coroutine. Coroutines are VM threads driven through the
//! VM's own `coroutine.resume`, so scripts and native code see the same threads.
//!
//! Each execution handle ([`VmThread`]) keeps a shadow stack of the values native frames hold
//! on it; [`Context`](crate::context::Context) indexes that stack the way the C API indexes
//! a Lua stack.

mod registry;
mod runtime;
mod state;
mod thread;

pub use mlua::Value as RawValue;
pub use registry::RegistryRef;
pub use state::{StateId, VmState};
pub use thread::{ThreadStatus, VmThread};

pub(crate) use runtime::{is_memory_error, Runtime, Tag};
pub(crate) use state::StateInner;
pub(crate) use thread::Resumed;

/// How a native function leaves its frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Return the top `n` values of the frame
    Return(usize),
    /// Suspend the running coroutine, handing the top `n` values to the resumer
    Yield(usize),
}
