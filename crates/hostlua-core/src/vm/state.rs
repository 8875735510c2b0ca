//! VM instances

use super::runtime::Runtime;
use super::thread::{ThreadInner, VmThread};
use super::RawValue;
use crate::context::Context;
use crate::error::{HostError, Unwind, VmResult};
use crate::opaque;
use crate::options::{PrimaryDriver, VmOptions};
use crate::scheduler::{self, Scheduler};
use crate::value::{OwnedValue, Value};
use mlua::Lua;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for a VM state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

pub(crate) struct StateInner {
    id: StateId,
    options: VmOptions,
    runtime: Runtime,
    main: VmThread,
    /// Handles of coroutines seen so far, keyed by VM thread address
    threads: Mutex<FxHashMap<usize, Weak<ThreadInner>>>,
    scheduler: Scheduler,
    primary_driver: Mutex<Option<std::thread::ThreadId>>,
    pinned: AtomicIsize,
    next_thread_id: AtomicU64,
    // Declared last so every handle above is released before the VM closes.
    lua: Lua,
}

impl StateInner {
    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Track registry entries held by native handles
    pub(crate) fn pinned(&self, delta: isize) {
        self.pinned.fetch_add(delta, Ordering::Relaxed);
    }
}

/// One VM instance: registry, globals, main thread and scheduler
///
/// Cloning the handle shares the instance. Threads and registry handles refer back to it
/// weakly, so the instance is torn down when the last `VmState` handle drops.
#[derive(Clone)]
pub struct VmState(Arc<StateInner>);

impl VmState {
    /// Create a state, register the built-in libraries and run class initialisers
    pub fn new(options: VmOptions) -> Result<Self, HostError> {
        options.validate()?;

        let lua = Lua::new();
        let runtime = Runtime::load(&lua)?;
        if let Some(limit) = options.memory_limit {
            lua.set_memory_limit(limit)?;
        }
        let primary = match options.primary_driver {
            PrimaryDriver::CreatingThread => Some(std::thread::current().id()),
            PrimaryDriver::AnyThread => None,
        };

        let inner = Arc::new_cyclic(|weak: &Weak<StateInner>| {
            lua.set_app_data(weak.clone());
            StateInner {
                id: StateId::next(),
                main: VmThread::new(
                    0,
                    weak.clone(),
                    None,
                    options.max_stack_slots,
                    options.max_call_depth,
                ),
                scheduler: Scheduler::new(weak.clone(), options.scheduler.clone()),
                options,
                runtime,
                threads: Mutex::new(FxHashMap::default()),
                primary_driver: Mutex::new(primary),
                pinned: AtomicIsize::new(0),
                next_thread_id: AtomicU64::new(1),
                lua,
            }
        });
        let state = VmState(inner);

        {
            let ctx = Context::main(&state);
            scheduler::library::install(&ctx).map_err(|source| HostError::Library {
                name: "task",
                source,
            })?;
            opaque::initialize_classes(&ctx)?;
        }

        tracing::debug!(state = state.id().as_u64(), chunk = %state.0.options.chunk_name, "VM state created");
        Ok(state)
    }

    /// The state embedding `lua`, if it was created by [`VmState::new`] and is still alive
    pub fn from_lua(lua: &Lua) -> Option<VmState> {
        let weak = lua.app_data_ref::<Weak<StateInner>>()?;
        weak.upgrade().map(VmState)
    }

    pub(crate) fn from_inner(inner: Arc<StateInner>) -> Self {
        VmState(inner)
    }

    pub(crate) fn inner(&self) -> &Arc<StateInner> {
        &self.0
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    /// The embedded VM
    pub fn lua(&self) -> &Lua {
        &self.0.lua
    }

    pub fn id(&self) -> StateId {
        self.0.id
    }

    pub fn options(&self) -> &VmOptions {
        &self.0.options
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn main_thread(&self) -> &VmThread {
        &self.0.main
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.0.scheduler
    }

    /// The globals table
    pub fn globals(&self) -> mlua::Table {
        self.0.runtime.globals().clone()
    }

    /// Number of registry entries held by native handles
    pub fn registry_len(&self) -> usize {
        self.0.pinned.load(Ordering::Relaxed).max(0) as usize
    }

    /// Bytes currently allocated by the VM
    pub fn used_memory(&self) -> usize {
        self.0.lua.used_memory()
    }

    /// Compile `source` into a function; `name` appears in error positions
    pub fn load(&self, source: &str, name: &str) -> VmResult<OwnedValue> {
        let function = self
            .lua()
            .load(source)
            .set_name(format!("={}", name))
            .into_function()
            .map_err(Unwind::from_lua)?;
        Value::from_raw(RawValue::Function(function), self)
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// A fresh coroutine whose body returns immediately
    pub fn new_thread(&self) -> VmResult<VmThread> {
        self.create_thread(self.0.runtime.idle().clone())
    }

    /// A coroutine whose body is `body`
    pub fn create_thread(&self, body: mlua::Function) -> VmResult<VmThread> {
        let co = self.lua().create_thread(body).map_err(Unwind::from_lua)?;
        Ok(self.attach_thread(co))
    }

    /// A coroutine whose body is `function`
    pub fn new_thread_with(&self, function: &Value<'_>) -> VmResult<VmThread> {
        match function.to_raw(self)? {
            RawValue::Function(body) => self.create_thread(body),
            other => Err(Unwind::runtime(format!(
                "expected a function, got {}",
                other.type_name()
            ))),
        }
    }

    /// Handle for a VM coroutine; every handle for the same coroutine shares its shadow stack
    /// and attached data while any of them is alive
    pub fn attach_thread(&self, co: mlua::Thread) -> VmThread {
        let addr = RawValue::Thread(co.clone()).to_pointer() as usize;
        let mut threads = self.0.threads.lock();
        if let Some(existing) = threads.get(&addr).and_then(Weak::upgrade) {
            return VmThread::from_inner(existing);
        }
        threads.retain(|_, thread| thread.strong_count() > 0);
        let thread = VmThread::new(
            self.0.next_thread_id.fetch_add(1, Ordering::Relaxed),
            Arc::downgrade(&self.0),
            Some(co),
            self.0.options.max_stack_slots,
            self.0.options.max_call_depth,
        );
        threads.insert(addr, thread.downgrade());
        thread
    }

    /// Handle for the thread a native entry runs on; `nil` stands for the main thread
    pub(crate) fn running_thread(&self, running: RawValue) -> VmThread {
        match running {
            RawValue::Thread(co) => self.attach_thread(co),
            _ => self.0.main.clone(),
        }
    }

    // ========================================================================
    // Primary driver
    // ========================================================================

    /// Make the calling OS thread the primary driver of the synchronized domain
    pub fn set_primary_driver(&self) {
        *self.0.primary_driver.lock() = Some(std::thread::current().id());
    }

    /// Whether the calling OS thread may step the synchronized domain
    pub fn is_primary_driver(&self) -> bool {
        match *self.0.primary_driver.lock() {
            Some(id) => id == std::thread::current().id(),
            None => true,
        }
    }
}

impl fmt::Debug for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmState")
            .field("id", &self.0.id)
            .field("registry", &self.registry_len())
            .field("memory", &self.used_memory())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Kind;

    #[test]
    fn test_state_ids_are_unique() {
        let a = VmState::new(VmOptions::default()).unwrap();
        let b = VmState::new(VmOptions::default()).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(!VmState::ptr_eq(&a, &b));
    }

    #[test]
    fn test_base_library_installed() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let string: mlua::Table = state.globals().get("string").unwrap();
        assert!(matches!(
            string.get::<RawValue>("format").unwrap(),
            RawValue::Function(_)
        ));
        assert!(matches!(
            state.globals().get::<RawValue>("task").unwrap(),
            RawValue::Table(_)
        ));
    }

    #[test]
    fn test_from_lua_finds_state() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let found = VmState::from_lua(state.lua()).unwrap();
        assert!(VmState::ptr_eq(&state, &found));
        assert!(VmState::from_lua(&Lua::new()).is_none());
    }

    #[test]
    fn test_creator_is_primary_driver() {
        let state = VmState::new(VmOptions::default()).unwrap();
        assert!(state.is_primary_driver());
        let other = state.clone();
        let on_other = std::thread::spawn(move || other.is_primary_driver())
            .join()
            .unwrap();
        assert!(!on_other);
    }

    #[test]
    fn test_threads_do_not_keep_state_alive() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let thread = state.new_thread().unwrap();
        drop(state);
        assert!(thread.state().is_none());
    }

    #[test]
    fn test_attach_shares_handles() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let thread = state.new_thread().unwrap();
        let co = thread.coroutine().unwrap().clone();
        let again = state.attach_thread(co);
        assert!(VmThread::ptr_eq(&thread, &again));
        assert_eq!(thread.id(), again.id());
    }

    #[test]
    fn test_load_compiles_chunks() {
        let state = VmState::new(VmOptions::default()).unwrap();
        let chunk = state.load("return 40 + 2", "answer").unwrap();
        assert_eq!(chunk.kind(), Kind::Function);
        let err = state.load("return +", "broken").unwrap_err();
        assert!(err.to_string().contains("broken"), "{}", err);
    }

    #[test]
    fn test_memory_limit_applies_to_allocations() {
        let state = VmState::new(VmOptions::with_memory_limit(4 * 1024 * 1024)).unwrap();
        let mut buffers = Vec::new();
        let failed = loop {
            match state.lua().create_buffer(vec![0u8; 256 * 1024]) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => break Unwind::from_lua(err),
            }
        };
        assert!(matches!(failed, Unwind::OutOfMemory));
    }
}
