//! Hostlua interop core
//!
//! This crate lets native code create, inspect and call values living inside an embedded
//! Luau VM (through `mlua`), and multiplexes cooperative script threads over it:
//! - Ownership primitives for natively-owned objects ([`rc`])
//! - A tagged value type spanning stack slots, registry handles and native objects ([`value`])
//! - Stack-balanced calling contexts with protected calls and coroutines ([`context`])
//! - A cooperative scheduler with synchronized and desynchronized domains ([`scheduler`])
//! - Native and lock-protected tables ([`table`])

#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod context;
pub mod error;
pub mod function;
pub mod opaque;
pub mod options;
pub mod rc;
pub mod scheduler;
pub mod table;
pub mod text;
pub mod value;
pub mod vm;

pub use buffer::Buffer;
pub use context::{Context, FunctionContext};
pub use error::{HostError, SchedulerError, ScriptError, TableError, Unwind, VmResult};
pub use function::{Function, HostFn, NativeFunction};
pub use opaque::{
    register_class, Capabilities, ClassInit, Opaque, OpaqueCell, OpaqueKind, OpaqueObject,
};
pub use options::{PrimaryDriver, SchedulerOptions, VmOptions};
pub use rc::{Exclusive, Shared};
pub use scheduler::{
    Domain, PendingCounts, Scheduler, ScriptThread, SecurityContext, StepReport, ThreadIdentity,
};
pub use table::{SharedTable, Table};
pub use text::Text;
pub use value::{ArithOp, HeapHandle, HeapPayload, Kind, OwnedValue, StackSlot, Value, ValueSeq};
pub use vm::{Outcome, RawValue, RegistryRef, StateId, ThreadStatus, VmState, VmThread};

pub use mlua;
