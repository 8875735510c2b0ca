//! Values pinned in the Lua registry
//!
//! Pinning a value stores it under an `mlua::RegistryKey`, which keeps it alive outside any
//! stack frame. A [`RegistryRef`] removes its key when the last native holder drops.

use super::state::{StateInner, VmState};
use super::RawValue;
use crate::error::{Unwind, VmResult};
use mlua::RegistryKey;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Stable handle to a pinned value
///
/// Clones share the same key; the key is removed when the last clone drops. A handle whose
/// key was [released](RegistryRef::release) or whose state is gone reads as `nil`.
#[derive(Clone)]
pub struct RegistryRef(Arc<RefSlot>);

struct RefSlot {
    id: u64,
    state: Weak<StateInner>,
    key: Mutex<Option<RegistryKey>>,
}

impl RegistryRef {
    /// Pin `value` under a fresh registry key of `state`
    pub fn pin(state: &VmState, value: RawValue) -> VmResult<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let key = state
            .lua()
            .create_registry_value(value)
            .map_err(Unwind::from_lua)?;
        state.inner().pinned(1);
        Ok(Self(Arc::new(RefSlot {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::downgrade(state.inner()),
            key: Mutex::new(Some(key)),
        })))
    }

    /// Process-unique id of the pinned entry
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Owning state, if it is still alive
    pub fn state(&self) -> Option<VmState> {
        self.0.state.upgrade().map(VmState::from_inner)
    }

    pub fn belongs_to(&self, state: &VmState) -> bool {
        std::ptr::eq(self.0.state.as_ptr(), Arc::as_ptr(state.inner()))
    }

    /// Current value of the entry
    pub fn get(&self) -> RawValue {
        let Some(inner) = self.0.state.upgrade() else {
            return RawValue::Nil;
        };
        let key = self.0.key.lock();
        match key.as_ref() {
            Some(key) => inner.lua().registry_value(key).unwrap_or(RawValue::Nil),
            None => RawValue::Nil,
        }
    }

    /// Remove the entry ahead of the last holder dropping
    pub fn release(&self) {
        let key = self.0.key.lock().take();
        if let Some(key) = key {
            unpin(&self.0.state, key);
        }
    }

    /// Whether two handles share one entry
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

fn unpin(state: &Weak<StateInner>, key: RegistryKey) {
    match state.upgrade() {
        Some(inner) => {
            inner.pinned(-1);
            if let Err(err) = inner.lua().remove_registry_value(key) {
                tracing::warn!(error = %err, "failed to remove registry value");
            }
        }
        // The key is reclaimed with the Lua state.
        None => drop(key),
    }
}

impl Drop for RefSlot {
    fn drop(&mut self) {
        if let Some(key) = self.key.get_mut().take() {
            unpin(&self.state, key);
        }
    }
}

impl fmt::Debug for RegistryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistryRef({})", self.0.id)
    }
}
