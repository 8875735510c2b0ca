//! Execution handles: the main thread and coroutines
//!
//! A handle pairs a VM thread with a shadow stack of the values native frames hold on it.
//! Indices follow the C API: they are 1-based relative to the current frame's base, and
//! negative indices count down from the top. The internal lock is only ever held for a single
//! stack operation, never while VM code runs, so a native function may freely re-enter its own
//! thread.

use super::state::{StateInner, VmState};
use super::RawValue;
use crate::error::{Unwind, VmResult};
use crate::value::Value;
use mlua::MultiValue;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Lifecycle of an execution handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    /// Holds a body that has not started yet
    Created,
    /// Currently executing (the main thread is always running)
    Running,
    /// Yielded; may be resumed
    Suspended,
    /// The body returned
    Completed,
    /// The body raised an uncaught error
    Errored,
    /// Closed before completion
    Cancelled,
}

impl ThreadStatus {
    pub fn is_resumable(self) -> bool {
        matches!(self, ThreadStatus::Created | ThreadStatus::Suspended)
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ThreadStatus::Completed | ThreadStatus::Errored | ThreadStatus::Cancelled
        )
    }
}

/// How one resumption of a coroutine ended
#[derive(Debug)]
pub(crate) enum Resumed {
    Yielded(Vec<RawValue>),
    Returned(Vec<RawValue>),
    /// Terminated from inside, or closed at the suspension that followed a cancel request
    Cancelled,
}

struct ThreadData {
    stack: Vec<RawValue>,
    /// Absolute index of the first argument of every active native frame
    frames: Vec<usize>,
    status: ThreadStatus,
    close_requested: bool,
}

pub(crate) struct ThreadInner {
    id: u64,
    addr: usize,
    state: Weak<StateInner>,
    /// `None` for the main thread
    co: Option<mlua::Thread>,
    max_stack: usize,
    max_depth: usize,
    data: Mutex<ThreadData>,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Handle to a VM execution handle; clones share the thread
#[derive(Clone)]
pub struct VmThread(Arc<ThreadInner>);

/// Status of `co` as far as the VM can tell, refining what was last tracked natively
///
/// Scripts may resume a coroutine through `coroutine.resume` without the handle noticing.
fn observed(tracked: ThreadStatus, co: &mlua::Thread) -> ThreadStatus {
    if !tracked.is_resumable() {
        return tracked;
    }
    match co.status() {
        mlua::ThreadStatus::Resumable => tracked,
        mlua::ThreadStatus::Error => ThreadStatus::Errored,
        _ => ThreadStatus::Completed,
    }
}

fn current(data: &ThreadData, co: &mlua::Thread) -> ThreadStatus {
    if data.frames.is_empty() {
        observed(data.status, co)
    } else {
        ThreadStatus::Running
    }
}

impl VmThread {
    pub(crate) fn new(
        id: u64,
        state: Weak<StateInner>,
        co: Option<mlua::Thread>,
        max_stack: usize,
        max_depth: usize,
    ) -> Self {
        let status = match co {
            Some(_) => ThreadStatus::Created,
            None => ThreadStatus::Running,
        };
        Self(Arc::new_cyclic(|weak: &Weak<ThreadInner>| ThreadInner {
            id,
            addr: match &co {
                Some(co) => RawValue::Thread(co.clone()).to_pointer() as usize,
                None => weak.as_ptr() as *const () as usize,
            },
            state,
            co,
            max_stack,
            max_depth,
            data: Mutex::new(ThreadData {
                stack: Vec::new(),
                frames: Vec::new(),
                status,
                close_requested: false,
            }),
            user_data: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn is_main(&self) -> bool {
        self.0.co.is_none()
    }

    /// The VM coroutine; `None` for the main thread
    pub fn coroutine(&self) -> Option<&mlua::Thread> {
        self.0.co.as_ref()
    }

    /// Identity of the underlying VM thread
    pub(crate) fn addr(&self) -> usize {
        self.0.addr
    }

    pub(crate) fn downgrade(&self) -> Weak<ThreadInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn from_inner(inner: Arc<ThreadInner>) -> Self {
        VmThread(inner)
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.0.addr == b.0.addr
    }

    /// Owning state, if still alive
    pub fn state(&self) -> Option<VmState> {
        self.0.state.upgrade().map(VmState::from_inner)
    }

    pub fn belongs_to(&self, state: &VmState) -> bool {
        std::ptr::eq(self.0.state.as_ptr(), Arc::as_ptr(state.inner()))
    }

    /// Current status; a coroutine with an active native frame is running
    pub fn status(&self) -> ThreadStatus {
        let data = self.0.data.lock();
        match &self.0.co {
            Some(co) => current(&data, co),
            None => data.status,
        }
    }

    /// Attach opaque per-thread data
    pub fn set_thread_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.0.user_data.lock() = Some(data);
    }

    /// Per-thread data, if attached and of type `T`
    pub fn thread_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.0.user_data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    /// Per-thread data of type `T`, attaching `init()` first if none of that type is present
    pub fn thread_data_or_init<T: Any + Send + Sync>(&self, init: impl FnOnce() -> T) -> Arc<T> {
        let mut slot = self.0.user_data.lock();
        if let Some(existing) = slot.clone().and_then(|data| data.downcast::<T>().ok()) {
            return existing;
        }
        let data = Arc::new(init());
        *slot = Some(Arc::clone(&data) as Arc<dyn Any + Send + Sync>);
        data
    }

    // ========================================================================
    // Stack access
    // ========================================================================

    /// Absolute index of the current frame's first slot
    pub fn frame_base(&self) -> usize {
        self.0.data.lock().frames.last().copied().unwrap_or(0)
    }

    /// Number of values in the current frame
    pub fn top(&self) -> usize {
        let data = self.0.data.lock();
        let base = data.frames.last().copied().unwrap_or(0);
        data.stack.len().saturating_sub(base)
    }

    /// Total number of values on the stack
    pub fn abs_top(&self) -> usize {
        self.0.data.lock().stack.len()
    }

    /// Translate a frame-relative index into an absolute one
    pub fn abs_index(&self, index: i32) -> Option<usize> {
        let data = self.0.data.lock();
        let base = data.frames.last().copied().unwrap_or(0);
        if index > 0 {
            Some(base + index as usize - 1)
        } else if index < 0 {
            let pos = data.stack.len() as i64 + index as i64;
            (pos >= base as i64).then_some(pos as usize)
        } else {
            None
        }
    }

    pub fn push(&self, value: RawValue) -> VmResult<()> {
        let mut data = self.0.data.lock();
        if data.stack.len() >= self.0.max_stack {
            return Err(Unwind::runtime("stack overflow"));
        }
        data.stack.push(value);
        Ok(())
    }

    /// Value at a frame-relative index; invalid indices read as `nil`
    pub fn get(&self, index: i32) -> RawValue {
        match self.abs_index(index) {
            Some(pos) => self.get_abs(pos),
            None => RawValue::Nil,
        }
    }

    pub fn get_abs(&self, pos: usize) -> RawValue {
        self.0
            .data
            .lock()
            .stack
            .get(pos)
            .cloned()
            .unwrap_or(RawValue::Nil)
    }

    /// Pop `n` values, never below the current frame base
    pub fn pop(&self, n: usize) {
        let tail = {
            let mut data = self.0.data.lock();
            let base = data.frames.last().copied().unwrap_or(0);
            let keep = data.stack.len().saturating_sub(n).max(base);
            let keep = keep.min(data.stack.len());
            data.stack.split_off(keep)
        };
        drop(tail);
    }

    /// Drop everything at or above absolute position `len`
    pub fn truncate_abs(&self, len: usize) {
        let tail = {
            let mut data = self.0.data.lock();
            if len >= data.stack.len() {
                return;
            }
            data.stack.split_off(len)
        };
        drop(tail);
    }

    /// Remove and return the top `n` values, bottom-most first
    pub fn take_top(&self, n: usize) -> Vec<RawValue> {
        let mut data = self.0.data.lock();
        let len = data.stack.len();
        data.stack.split_off(len - n.min(len))
    }

    /// Number of active native frames
    pub fn frame_depth(&self) -> usize {
        self.0.data.lock().frames.len()
    }

    /// Open a native frame holding `args`, returning its base
    pub(crate) fn enter_frame(&self, args: Vec<RawValue>) -> VmResult<usize> {
        let mut data = self.0.data.lock();
        if data.frames.len() >= self.0.max_depth {
            return Err(Unwind::runtime("stack overflow"));
        }
        if data.stack.len() + args.len() > self.0.max_stack {
            return Err(Unwind::runtime("stack overflow"));
        }
        if self.0.co.is_some() && data.status == ThreadStatus::Created {
            data.status = ThreadStatus::Suspended;
        }
        let base = data.stack.len();
        data.frames.push(base);
        data.stack.extend(args);
        Ok(base)
    }

    /// Close the frame opened at `base`, returning its top `n` values
    pub(crate) fn leave_frame(&self, base: usize, n: usize) -> Vec<RawValue> {
        let (results, rest) = {
            let mut data = self.0.data.lock();
            if let Some(depth) = data.frames.iter().rposition(|&frame| frame == base) {
                data.frames.truncate(depth);
            }
            let len = data.stack.len();
            let first = len.saturating_sub(n).max(base).min(len);
            let results = data.stack.split_off(first);
            let remaining = data.stack.len();
            let rest = data.stack.split_off(base.min(remaining));
            (results, rest)
        };
        drop(rest);
        results
    }

    // ========================================================================
    // Coroutines
    // ========================================================================

    /// Resume the coroutine with `args`
    ///
    /// Status is checked before anything is handed to the VM, so a rejected resume leaves
    /// every stack untouched. A raised error ends the coroutine and is returned as `Err`.
    pub(crate) fn resume(&self, state: &VmState, args: Vec<RawValue>) -> VmResult<Resumed> {
        if !self.belongs_to(state) {
            return Err(Unwind::runtime(
                "attempt to resume a thread that belongs to another VM state",
            ));
        }
        let Some(co) = &self.0.co else {
            return Err(Unwind::runtime("cannot resume non-suspended coroutine"));
        };
        {
            let mut data = self.0.data.lock();
            match current(&data, co) {
                ThreadStatus::Created | ThreadStatus::Suspended => {
                    data.status = ThreadStatus::Running;
                }
                ThreadStatus::Running => {
                    return Err(Unwind::runtime("cannot resume non-suspended coroutine"));
                }
                finished => {
                    data.status = finished;
                    return Err(Unwind::runtime("cannot resume dead coroutine"));
                }
            }
        }

        let mut call = Vec::with_capacity(args.len() + 1);
        call.push(RawValue::Thread(co.clone()));
        call.extend(args);
        let mut values = match state
            .runtime()
            .resume()
            .call::<MultiValue>(MultiValue::from_vec(call))
        {
            Ok(values) => values.into_vec().into_iter(),
            Err(err) => {
                self.finish(ThreadStatus::Errored);
                return Err(Unwind::from_lua(err));
            }
        };

        match values.next() {
            Some(RawValue::Boolean(true)) => {
                let values: Vec<RawValue> = values.collect();
                if co.status() != mlua::ThreadStatus::Resumable {
                    self.finish(ThreadStatus::Completed);
                    return Ok(Resumed::Returned(values));
                }
                let close = {
                    let mut data = self.0.data.lock();
                    data.status = ThreadStatus::Suspended;
                    std::mem::take(&mut data.close_requested)
                };
                if close {
                    self.close();
                    return Ok(Resumed::Cancelled);
                }
                Ok(Resumed::Yielded(values))
            }
            _ => {
                let error = values.next().unwrap_or(RawValue::Nil);
                match state.runtime().fatal(&error) {
                    Some(Unwind::Terminate) => {
                        self.finish(ThreadStatus::Cancelled);
                        Ok(Resumed::Cancelled)
                    }
                    Some(fatal) => {
                        self.finish(ThreadStatus::Errored);
                        Err(fatal)
                    }
                    None => {
                        self.finish(ThreadStatus::Errored);
                        Err(Unwind::raise(Value::from_raw(error, state)?))
                    }
                }
            }
        }
    }

    fn finish(&self, status: ThreadStatus) {
        let (stack, frames) = {
            let mut data = self.0.data.lock();
            data.status = status;
            data.close_requested = false;
            (
                std::mem::take(&mut data.stack),
                std::mem::take(&mut data.frames),
            )
        };
        drop(stack);
        drop(frames);
    }

    /// Close this coroutine
    ///
    /// A created or suspended coroutine is closed immediately and `true` is returned. A running
    /// one is only marked; it is closed when it next suspends.
    pub fn close(&self) -> bool {
        let Some(co) = &self.0.co else {
            return false;
        };
        {
            let mut data = self.0.data.lock();
            match current(&data, co) {
                ThreadStatus::Running => {
                    data.close_requested = true;
                    return false;
                }
                ThreadStatus::Created | ThreadStatus::Suspended => {}
                finished => {
                    data.status = finished;
                    return false;
                }
            }
        }
        self.finish(ThreadStatus::Cancelled);
        if let Some(state) = self.state() {
            if let Err(err) = state.runtime().close().call::<MultiValue>(co.clone()) {
                tracing::warn!(thread = self.0.id, error = %err, "failed to close coroutine");
            }
        }
        true
    }

    /// Whether a close was requested while the thread was running
    pub fn close_requested(&self) -> bool {
        self.0.data.lock().close_requested
    }
}

impl fmt::Debug for VmThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.0.id)
            .field("main", &self.is_main())
            .field("status", &self.status())
            .finish()
    }
}
