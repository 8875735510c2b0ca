//! Ownership primitives for natively-owned objects
//!
//! Two reference-counted handle flavours back every object the VM does not own itself:
//!
//! - [`Exclusive`]: single-threaded, borrow-checked at runtime. Used for data that never leaves
//!   the call stack it was created on.
//! - [`Shared`]: atomically counted and guarded by a fair reader/writer lock. Used for anything
//!   that may be touched from another OS thread (opaque objects, shared tables, heap payloads).
//!
//! Both flavours support "self-aware" payloads that can mint handles to themselves after a
//! two-step construction (construct, then register a weak self-reference).

mod exclusive;
mod shared;

pub use exclusive::{Exclusive, ExclusiveSelf, KnowsExclusiveSelf, WeakExclusive};
pub use shared::{KnowsSharedSelf, ReadGuard, SelfHandle, Shared, WeakShared, WriteGuard};
