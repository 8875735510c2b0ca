//! The tagged value type
//!
//! [`Value`] covers every value a script can observe plus the two native-only references into
//! a VM: a live stack slot, borrowed for the lifetime of the context that produced it, and a
//! registry handle that keeps a VM heap value alive until it is released. Natively-owned
//! tables, buffers, functions and threads travel as [`Value::Heap`]; extension objects as
//! [`Value::Opaque`].
//!
//! Cloning a stack slot or registry value pins it into a fresh registry entry; every other
//! clone is a handle copy.

pub(crate) mod identity;
mod kind;
mod marshal;
mod number;
mod ops;
mod seq;

pub use kind::Kind;
pub use ops::ArithOp;
pub use seq::ValueSeq;

pub(crate) use marshal::text_of;
pub(crate) use number::{float_to_integer, format_number};

use crate::buffer::Buffer;
use crate::function::Function;
use crate::opaque::{OpaqueCell, OpaqueKind, OpaqueObject};
use crate::rc::{ReadGuard, Shared, WriteGuard};
use crate::scheduler::ScriptThread;
use crate::table::{SharedTable, Table};
use crate::text::Text;
use crate::vm::{RawValue, RegistryRef, VmState, VmThread};
use std::fmt;

/// A value as native code sees it
pub enum Value<'ctx> {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    LightPointer(usize),
    Text(Text),
    /// A live position on a VM stack
    StackSlot(StackSlot<'ctx>),
    /// A value pinned in a VM registry
    Registry(RegistryRef),
    /// A natively-owned heap object
    Heap(HeapHandle),
    /// A native extension object
    Opaque(Shared<OpaqueObject>),
}

/// A value that owns everything it refers to
pub type OwnedValue = Value<'static>;

/// Borrowed reference to an absolute stack position of a thread
#[derive(Clone, Copy)]
pub struct StackSlot<'ctx> {
    thread: &'ctx VmThread,
    index: usize,
}

impl<'ctx> StackSlot<'ctx> {
    pub(crate) fn new(thread: &'ctx VmThread, index: usize) -> Self {
        debug_assert!(index < thread.abs_top(), "stack slot {} is not live", index);
        Self { thread, index }
    }

    pub fn thread(&self) -> &'ctx VmThread {
        self.thread
    }

    /// Absolute stack index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current VM value at the slot
    pub fn get(&self) -> RawValue {
        self.thread.get_abs(self.index)
    }
}

/// Natively-owned payload of [`Value::Heap`]
pub enum HeapPayload {
    Table(Table),
    Buffer(Buffer),
    Function(Function),
    Thread(ScriptThread),
    /// A table or buffer that has been handed to a state; the VM object is now the only copy
    Bound(RegistryRef),
}

impl HeapPayload {
    pub fn kind(&self) -> Kind {
        match self {
            HeapPayload::Table(_) => Kind::Table,
            HeapPayload::Buffer(_) => Kind::Buffer,
            HeapPayload::Function(_) => Kind::Function,
            HeapPayload::Thread(_) => Kind::Thread,
            HeapPayload::Bound(handle) => Kind::of_raw(&handle.get(), handle.state().as_ref()),
        }
    }
}

/// Handle to a natively-owned heap object
///
/// Kind and identity are fixed when the handle is created, so reading them never takes the
/// payload lock. Clones share the payload.
#[derive(Clone)]
pub struct HeapHandle {
    kind: Kind,
    addr: usize,
    payload: Shared<HeapPayload>,
}

impl HeapHandle {
    pub fn new(payload: HeapPayload) -> Self {
        let kind = payload.kind();
        let thread_addr = match &payload {
            HeapPayload::Thread(thread) => Some(thread.vm().addr()),
            _ => None,
        };
        let payload = Shared::new(payload);
        Self {
            kind,
            // A thread wrapper is the same object as the VM thread it wraps.
            addr: thread_addr.unwrap_or_else(|| payload.addr()),
            payload,
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Identity of the object
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn read(&self) -> ReadGuard<HeapPayload> {
        self.payload.read()
    }

    pub fn write(&self) -> WriteGuard<HeapPayload> {
        self.payload.write()
    }

    /// VM object the payload was bound to, if it has been handed to a state
    pub fn bound(&self) -> Option<RegistryRef> {
        match &*self.payload.read() {
            HeapPayload::Bound(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Shared::ptr_eq(&a.payload, &b.payload)
    }
}

impl<'ctx> Value<'ctx> {
    /// Wrap a natively-owned payload
    pub fn heap(payload: HeapPayload) -> Self {
        Value::Heap(HeapHandle::new(payload))
    }

    /// The VM value behind a stack slot, registry handle or bound heap object
    fn resolve(&self) -> Option<RawValue> {
        match self {
            Value::StackSlot(slot) => Some(slot.get()),
            Value::Registry(handle) => Some(handle.get()),
            Value::Heap(handle) => handle.bound().map(|bound| bound.get()),
            _ => None,
        }
    }

    /// State a VM reference belongs to, if it is still alive
    pub(crate) fn vm_state(&self) -> Option<VmState> {
        match self {
            Value::StackSlot(slot) => slot.thread.state(),
            Value::Registry(handle) => handle.state(),
            Value::Heap(handle) => handle.bound().and_then(|bound| bound.state()),
            _ => None,
        }
    }

    /// Effective kind; VM references resolve one level
    pub fn kind(&self) -> Kind {
        match self {
            Value::Nil => Kind::Nil,
            Value::Boolean(_) => Kind::Boolean,
            Value::Integer(_) => Kind::Integer,
            Value::Number(_) => Kind::Number,
            Value::LightPointer(_) => Kind::LightPointer,
            Value::Text(_) => Kind::Text,
            Value::StackSlot(slot) => Kind::of_raw(&slot.get(), slot.thread.state().as_ref()),
            Value::Registry(handle) => Kind::of_raw(&handle.get(), handle.state().as_ref()),
            Value::Heap(handle) => handle.kind(),
            Value::Opaque(_) => Kind::Opaque,
        }
    }

    pub fn is_kind(&self, kind: Kind) -> bool {
        self.kind().satisfies(kind)
    }

    pub fn is_opaque_kind(&self, kind: OpaqueKind) -> bool {
        self.opaque_kind() == Some(kind)
    }

    pub fn opaque_kind(&self) -> Option<OpaqueKind> {
        self.as_opaque().map(|object| object.read().kind())
    }

    pub fn is_nil(&self) -> bool {
        self.kind() == Kind::Nil
    }

    /// Script truthiness: everything but `nil` and `false`
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Boolean(false) => false,
            Value::StackSlot(_) | Value::Registry(_) => {
                self.resolve().map_or(false, |raw| raw_truthy(&raw))
            }
            _ => true,
        }
    }

    /// Whether [`Clone::clone`] is allowed for this value
    pub fn can_clone(&self) -> bool {
        true
    }

    /// Independent owned copy; VM references are pinned into a fresh registry entry
    ///
    /// When pinning fails the copy shares the original registry entry instead.
    pub fn clone_owned(&self) -> OwnedValue {
        match self {
            Value::Nil => Value::Nil,
            Value::Boolean(b) => Value::Boolean(*b),
            Value::Integer(i) => Value::Integer(*i),
            Value::Number(n) => Value::Number(*n),
            Value::LightPointer(p) => Value::LightPointer(*p),
            Value::Text(t) => Value::Text(t.clone()),
            Value::StackSlot(_) | Value::Registry(_) => {
                let (Some(raw), Some(state)) = (self.resolve(), self.vm_state()) else {
                    return Value::Nil;
                };
                match Value::from_raw(raw, &state) {
                    Ok(owned) => owned,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to pin a copied value");
                        match self {
                            Value::Registry(handle) => Value::Registry(handle.clone()),
                            _ => Value::Nil,
                        }
                    }
                }
            }
            Value::Heap(handle) => Value::Heap(handle.clone()),
            Value::Opaque(object) => Value::Opaque(object.clone()),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::StackSlot(_) | Value::Registry(_) => match self.resolve()? {
                RawValue::Boolean(b) => Some(b),
                _ => None,
            },
            _ => None,
        }
    }

    /// Integer view; floats qualify when they hold an exact integer
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) => float_to_integer(*n),
            Value::StackSlot(_) | Value::Registry(_) => match self.resolve()? {
                RawValue::Integer(i) => Some(i64::from(i)),
                RawValue::Number(n) => float_to_integer(n),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            Value::StackSlot(_) | Value::Registry(_) => match self.resolve()? {
                RawValue::Integer(i) => Some(i64::from(i) as f64),
                RawValue::Number(n) => Some(n),
                _ => None,
            },
            _ => None,
        }
    }

    /// Text content; numbers are not coerced
    pub fn as_text(&self) -> Option<Text> {
        match self {
            Value::Text(t) => Some(t.clone()),
            Value::StackSlot(_) | Value::Registry(_) => match self.resolve()? {
                RawValue::String(s) => Some(text_of(&s)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Text content as an owned UTF-8 string, if it is valid UTF-8
    pub fn as_string(&self) -> Option<String> {
        self.as_text()
            .and_then(|text| text.as_str().map(str::to_owned))
    }

    pub fn as_light_pointer(&self) -> Option<usize> {
        match self {
            Value::LightPointer(p) => Some(*p),
            Value::StackSlot(_) | Value::Registry(_) => match self.resolve()? {
                RawValue::LightUserData(p) => Some(p.0 as usize),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_opaque(&self) -> Option<Shared<OpaqueObject>> {
        match self {
            Value::Opaque(object) => Some(object.clone()),
            Value::StackSlot(_) | Value::Registry(_) => match self.resolve()? {
                RawValue::UserData(ud) => ud.borrow::<OpaqueCell>().ok().map(|cell| cell.object()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_shared_table(&self) -> Option<SharedTable> {
        let object = self.as_opaque()?;
        let guard = object.read();
        let table = guard.downcast_ref::<SharedTable>().cloned();
        table
    }

    pub fn as_heap(&self) -> Option<&HeapHandle> {
        match self {
            Value::Heap(handle) => Some(handle),
            _ => None,
        }
    }

    /// Function handle: a native descriptor or a reference to a VM function
    pub fn as_function(&self) -> Option<Function> {
        match self {
            Value::Heap(handle) => match &*handle.read() {
                HeapPayload::Function(function) => Some(function.clone()),
                _ => None,
            },
            Value::Registry(handle) => match handle.get() {
                RawValue::Function(_) => Some(Function::from_vm(handle.clone())),
                _ => None,
            },
            Value::StackSlot(slot) => {
                let raw = slot.get();
                let state = self.vm_state()?;
                match raw {
                    RawValue::Function(_) => RegistryRef::pin(&state, raw).ok().map(Function::from_vm),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub fn as_thread(&self) -> Option<ScriptThread> {
        match self {
            Value::Heap(handle) => match &*handle.read() {
                HeapPayload::Thread(thread) => Some(thread.clone()),
                _ => None,
            },
            Value::StackSlot(_) | Value::Registry(_) => match self.resolve()? {
                RawValue::Thread(co) => {
                    let state = self.vm_state()?;
                    Some(ScriptThread::attach(state.attach_thread(co)))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Snapshot of a table as a native [`Table`]
    ///
    /// VM tables are copied one level deep: nested heap values become registry handles.
    pub fn to_table(&self) -> Option<Table> {
        if let Value::Heap(handle) = self {
            if let HeapPayload::Table(table) = &*handle.read() {
                return Some(table.clone());
            }
        }
        let raw = self.resolve()?;
        let state = self.vm_state()?;
        match raw {
            RawValue::Table(table) => match snapshot(&table, &state) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to snapshot a VM table");
                    None
                }
            },
            _ => None,
        }
    }

    /// Pinned registry handle behind a `Registry` value
    pub fn as_registry(&self) -> Option<&RegistryRef> {
        match self {
            Value::Registry(handle) => Some(handle),
            _ => None,
        }
    }
}

fn raw_truthy(raw: &RawValue) -> bool {
    !matches!(raw, RawValue::Nil | RawValue::Boolean(false))
}

fn snapshot(table: &mlua::Table, state: &VmState) -> crate::error::VmResult<Table> {
    let mut entries = Vec::new();
    table
        .for_each(|key: RawValue, value: RawValue| {
            entries.push((key, value));
            Ok(())
        })
        .map_err(crate::error::Unwind::from_lua)?;
    let mut snapshot = Table::new();
    for (key, value) in entries {
        let key = Value::from_raw(key, state)?;
        let value = Value::from_raw(value, state)?;
        // Keys coming from a VM table are never nil or NaN.
        let _ = snapshot.set(key, value);
    }
    if table.is_readonly() {
        snapshot.freeze();
    }
    Ok(snapshot)
}

impl Clone for Value<'_> {
    fn clone(&self) -> Self {
        self.clone_owned()
    }
}

impl Default for Value<'_> {
    fn default() -> Self {
        Value::Nil
    }
}

impl fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("Nil"),
            Value::Boolean(b) => write!(f, "Boolean({})", b),
            Value::Integer(i) => write!(f, "Integer({})", i),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::LightPointer(p) => write!(f, "LightPointer(0x{:x})", p),
            Value::Text(t) => write!(f, "Text({:?})", t),
            Value::StackSlot(slot) => write!(f, "StackSlot({}: {:?})", slot.index, slot.get()),
            Value::Registry(handle) => write!(f, "Registry({}: {:?})", handle.id(), handle.get()),
            Value::Heap(handle) => write!(f, "Heap({})", handle.kind()),
            Value::Opaque(object) => write!(f, "Opaque({})", object.read().kind()),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<()> for Value<'_> {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<bool> for Value<'_> {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value<'_> {
                fn from(i: $t) -> Self {
                    Value::Integer(i as i64)
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value<'_> {
    fn from(n: f32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value<'_> {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value<'_> {
    fn from(s: &str) -> Self {
        Value::Text(Text::from(s))
    }
}

impl From<String> for Value<'_> {
    fn from(s: String) -> Self {
        Value::Text(Text::from(s))
    }
}

impl From<&[u8]> for Value<'_> {
    fn from(bytes: &[u8]) -> Self {
        Value::Text(Text::from(bytes))
    }
}

impl From<Vec<u8>> for Value<'_> {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Text(Text::from(bytes))
    }
}

impl From<Text> for Value<'_> {
    fn from(text: Text) -> Self {
        Value::Text(text)
    }
}

impl From<Table> for Value<'_> {
    fn from(table: Table) -> Self {
        Value::heap(HeapPayload::Table(table))
    }
}

impl From<SharedTable> for Value<'_> {
    fn from(table: SharedTable) -> Self {
        Value::Opaque(OpaqueObject::new(table))
    }
}

impl From<Buffer> for Value<'_> {
    fn from(buffer: Buffer) -> Self {
        Value::heap(HeapPayload::Buffer(buffer))
    }
}

impl From<Function> for Value<'_> {
    fn from(function: Function) -> Self {
        Value::heap(HeapPayload::Function(function))
    }
}

impl From<ScriptThread> for Value<'_> {
    fn from(thread: ScriptThread) -> Self {
        Value::heap(HeapPayload::Thread(thread))
    }
}

impl From<RegistryRef> for Value<'_> {
    fn from(handle: RegistryRef) -> Self {
        Value::Registry(handle)
    }
}

impl From<Shared<OpaqueObject>> for Value<'_> {
    fn from(object: Shared<OpaqueObject>) -> Self {
        Value::Opaque(object)
    }
}

impl<'ctx, T: Into<Value<'ctx>>> From<Option<T>> for Value<'ctx> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::VmOptions;

    fn state() -> VmState {
        VmState::new(VmOptions::default()).unwrap()
    }

    fn vm_table(state: &VmState) -> OwnedValue {
        let table = state.lua().create_table().unwrap();
        Value::from_raw(RawValue::Table(table), state).unwrap()
    }

    #[test]
    fn test_primitive_kinds() {
        assert_eq!(Value::from(3).kind(), Kind::Integer);
        assert_eq!(Value::from(3.5).kind(), Kind::Number);
        assert_eq!(Value::from("x").kind(), Kind::Text);
        assert_eq!(Value::from(()).kind(), Kind::Nil);
        assert!(Value::from(2.0).is_kind(Kind::Integer));
    }

    #[test]
    fn test_registry_kind_resolves() {
        let state = state();
        let value = vm_table(&state);
        assert!(matches!(value, Value::Registry(_)));
        assert_eq!(value.kind(), Kind::Table);
    }

    #[test]
    fn test_released_registry_reads_nil() {
        let state = state();
        let value = vm_table(&state);
        value.as_registry().unwrap().release();
        assert_eq!(value.kind(), Kind::Nil);
        assert!(value.is_nil());
    }

    #[test]
    fn test_globals_report_global_env() {
        let state = state();
        let globals = Value::from_raw(RawValue::Table(state.globals()), &state).unwrap();
        assert_eq!(globals.kind(), Kind::GlobalEnv);
        assert!(globals.is_kind(Kind::Table));
    }

    #[test]
    fn test_clone_pins_fresh_entry() {
        let state = state();
        let value = vm_table(&state);
        let before = state.registry_len();
        let copy = value.clone();
        assert_eq!(state.registry_len(), before + 1);
        assert_eq!(copy.kind(), value.kind());
        assert_eq!(copy, value);
        drop(copy);
        assert_eq!(state.registry_len(), before);
    }

    #[test]
    fn test_stack_slot_clone_becomes_registry() {
        let state = state();
        let thread = state.main_thread();
        let table = state.lua().create_table().unwrap();
        thread.push(RawValue::Table(table)).unwrap();
        let slot = Value::StackSlot(StackSlot::new(thread, thread.abs_top() - 1));
        let owned = slot.clone_owned();
        assert!(matches!(owned, Value::Registry(_)));
        assert_eq!(owned.kind(), Kind::Table);
        assert_eq!(owned, slot);
        thread.pop(1);
    }

    #[test]
    fn test_heap_kind_does_not_lock_payload() {
        let value = OwnedValue::from(Table::new());
        let handle = value.as_heap().unwrap().clone();
        let _guard = handle.write();
        assert_eq!(value.kind(), Kind::Table);
        assert!(!value.is_nil());
        assert_eq!(value, value.clone());
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::from(4.0).as_integer(), Some(4));
        assert_eq!(Value::from(4.5).as_integer(), None);
        assert_eq!(Value::from(7).as_number(), Some(7.0));
        assert_eq!(Value::from("hi").as_string().as_deref(), Some("hi"));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert!(Value::from(1).as_text().is_none());
        assert!(!Value::from(false).truthy());
        assert!(Value::from(0).truthy());
    }

    #[test]
    fn test_to_table_snapshot() {
        let state = state();
        let table = state.lua().create_table().unwrap();
        table.raw_set(1, "a").unwrap();
        table.raw_set("k", true).unwrap();
        let value = Value::from_raw(RawValue::Table(table), &state).unwrap();
        let snapshot = value.to_table().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&Value::from(1)), Value::from("a"));
        assert_eq!(snapshot.get(&Value::from("k")), Value::from(true));
    }
}
