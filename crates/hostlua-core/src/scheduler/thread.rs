//! Script threads: VM coroutines with scheduling metadata

use super::identity::{SecurityContext, ThreadIdentity};
use super::Domain;
use crate::vm::{ThreadStatus, VmThread};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Scheduling metadata attached to a VM thread
#[derive(Default)]
struct ThreadMeta {
    identity: AtomicU8,
    /// 0 = synchronized, 1 = desynchronized
    domain: AtomicU8,
}

/// A coroutine of the VM paired with its identity and execution domain
///
/// Handles are cheap to clone; every handle for the same VM thread shares one set of
/// metadata.
#[derive(Clone)]
pub struct ScriptThread {
    vm: VmThread,
    meta: Arc<ThreadMeta>,
}

impl ScriptThread {
    /// Wrap `vm`, attaching fresh metadata the first time
    pub fn attach(vm: VmThread) -> ScriptThread {
        let meta = vm.thread_data_or_init(ThreadMeta::default);
        ScriptThread { vm, meta }
    }

    pub fn vm(&self) -> &VmThread {
        &self.vm
    }

    pub fn id(&self) -> u64 {
        self.vm.id()
    }

    pub fn is_main(&self) -> bool {
        self.vm.is_main()
    }

    pub fn status(&self) -> ThreadStatus {
        self.vm.status()
    }

    pub fn identity(&self) -> ThreadIdentity {
        ThreadIdentity::from_u8(self.meta.identity.load(Ordering::Acquire))
    }

    pub fn set_identity(&self, identity: ThreadIdentity) {
        self.meta.identity.store(identity.as_u8(), Ordering::Release);
    }

    /// Capabilities of the current identity
    pub fn security(&self) -> SecurityContext {
        self.identity().security()
    }

    pub fn domain(&self) -> Domain {
        match self.meta.domain.load(Ordering::Acquire) {
            0 => Domain::Synchronized,
            _ => Domain::Desynchronized,
        }
    }

    /// Move the thread to `domain`; takes effect for its next enqueue
    pub fn set_domain(&self, domain: Domain) {
        self.meta.domain.store(domain.index() as u8, Ordering::Release);
    }

    pub fn is_synchronized(&self) -> bool {
        self.domain() == Domain::Synchronized
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        VmThread::ptr_eq(&a.vm, &b.vm)
    }
}

impl fmt::Debug for ScriptThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptThread")
            .field("id", &self.vm.id())
            .field("status", &self.status())
            .field("identity", &self.identity())
            .field("domain", &self.domain())
            .finish()
    }
}
