//! Thread-safe shared handles
//!
//! `Shared<T>` co-allocates the payload beside a `parking_lot::RwLock` inside one `Arc`. Guards
//! are the owning `arc_lock` guards: each one holds its own strong count for as long as it is
//! alive, so the payload survives every handle being dropped while a guard is still out.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock, Weak};

/// Shared, lock-protected handle to a natively-owned object
pub struct Shared<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Shared<T> {
    /// Allocate a new payload with a strong count of one
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Acquire shared access, blocking while a writer holds or waits for the lock
    pub fn read(&self) -> ReadGuard<T> {
        ReadGuard {
            guard: self.inner.read_arc(),
        }
    }

    /// Acquire exclusive access
    pub fn write(&self) -> WriteGuard<T> {
        WriteGuard {
            guard: self.inner.write_arc(),
        }
    }

    /// Non-blocking variant of [`Shared::read`]
    pub fn try_read(&self) -> Option<ReadGuard<T>> {
        self.inner.try_read_arc().map(|guard| ReadGuard { guard })
    }

    /// Non-blocking variant of [`Shared::write`]
    pub fn try_write(&self) -> Option<WriteGuard<T>> {
        self.inner.try_write_arc().map(|guard| WriteGuard { guard })
    }

    /// Whether two handles point at the same payload
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Address of the payload allocation, used as an identity key
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Number of strong holders, guards included
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn downgrade(&self) -> WeakShared<T> {
        WeakShared {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T: KnowsSharedSelf> Shared<T> {
    /// Construct a self-aware payload and register its weak self-reference
    pub fn new_self_aware(value: T) -> Self {
        let shared = Self::new(value);
        shared
            .read()
            .self_handle()
            .register(Arc::downgrade(&shared.inner));
        shared
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({:#x})", self.addr())
    }
}

/// Weak counterpart of [`Shared`]
pub struct WeakShared<T> {
    inner: Weak<RwLock<T>>,
}

impl<T> WeakShared<T> {
    pub fn upgrade(&self) -> Option<Shared<T>> {
        self.inner.upgrade().map(|inner| Shared { inner })
    }
}

impl<T> Clone for WeakShared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

// ============================================================================
// Guards
// ============================================================================

/// Shared-access guard; holds the lock and one strong count until dropped
pub struct ReadGuard<T> {
    guard: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> Deref for ReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive-access guard; holds the lock and one strong count until dropped
pub struct WriteGuard<T> {
    guard: ArcRwLockWriteGuard<RawRwLock, T>,
}

impl<T> Deref for WriteGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WriteGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

// ============================================================================
// Self-aware payloads
// ============================================================================

/// Weak self-reference slot embedded in a self-aware payload
pub struct SelfHandle<T> {
    slot: OnceLock<Weak<RwLock<T>>>,
}

impl<T> SelfHandle<T> {
    pub const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
        }
    }

    fn register(&self, weak: Weak<RwLock<T>>) {
        // Registration happens once, right after allocation.
        let _ = self.slot.set(weak);
    }

    /// Mint a new strong handle to the enclosing payload
    ///
    /// Returns `None` before registration or once the payload is being torn down.
    pub fn handle(&self) -> Option<Shared<T>> {
        self.slot
            .get()
            .and_then(Weak::upgrade)
            .map(|inner| Shared { inner })
    }
}

impl<T> Default for SelfHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Payloads that carry a [`SelfHandle`] to themselves
pub trait KnowsSharedSelf: Sized {
    fn self_handle(&self) -> &SelfHandle<Self>;

    /// Shorthand for `self.self_handle().handle()`
    fn shared_self(&self) -> Option<Shared<Self>> {
        self.self_handle().handle()
    }
}
