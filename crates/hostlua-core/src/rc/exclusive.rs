//! Single-threaded shared handles

use std::cell::{OnceCell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

/// Non-atomic shared handle; `!Send`, access through scoped borrows
pub struct Exclusive<T> {
    inner: Rc<RefCell<T>>,
}

impl<T> Exclusive<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(value)),
        }
    }

    /// Borrow the payload immutably; panics if a mutable borrow is active
    pub fn borrow(&self) -> Ref<'_, T> {
        self.inner.borrow()
    }

    /// Borrow the payload mutably; panics if any other borrow is active
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }

    pub fn try_borrow_mut(&self) -> Option<RefMut<'_, T>> {
        self.inner.try_borrow_mut().ok()
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    pub fn downgrade(&self) -> WeakExclusive<T> {
        WeakExclusive {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl<T: KnowsExclusiveSelf> Exclusive<T> {
    /// Construct a self-aware payload and register its weak self-reference
    pub fn new_self_aware(value: T) -> Self {
        let handle = Self::new(value);
        handle
            .borrow()
            .exclusive_self()
            .register(Rc::downgrade(&handle.inner));
        handle
    }
}

impl<T> Clone for Exclusive<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Exclusive<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exclusive({:p})", Rc::as_ptr(&self.inner))
    }
}

pub struct WeakExclusive<T> {
    inner: Weak<RefCell<T>>,
}

impl<T> WeakExclusive<T> {
    pub fn upgrade(&self) -> Option<Exclusive<T>> {
        self.inner.upgrade().map(|inner| Exclusive { inner })
    }
}

/// Weak self-reference slot for [`Exclusive`] payloads
pub struct ExclusiveSelf<T> {
    slot: OnceCell<Weak<RefCell<T>>>,
}

impl<T> ExclusiveSelf<T> {
    pub const fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    fn register(&self, weak: Weak<RefCell<T>>) {
        let _ = self.slot.set(weak);
    }

    pub fn handle(&self) -> Option<Exclusive<T>> {
        self.slot
            .get()
            .and_then(Weak::upgrade)
            .map(|inner| Exclusive { inner })
    }
}

impl<T> Default for ExclusiveSelf<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub trait KnowsExclusiveSelf: Sized {
    fn exclusive_self(&self) -> &ExclusiveSelf<Self>;
}
