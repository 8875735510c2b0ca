//! Moving values between native code and VM states
//!
//! Natively-owned tables and buffers are handed to a state by reference: the first push
//! creates the VM object, moves the native contents into it and leaves the heap handle bound
//! to it. Later pushes, and writes made by scripts, all go through that one VM object.

use super::{HeapHandle, HeapPayload, OwnedValue, Value};
use crate::error::{Unwind, VmResult};
use crate::function::Function;
use crate::opaque::{self, OpaqueCell};
use crate::table::Table;
use crate::text::Text;
use crate::vm::{RawValue, RegistryRef, VmState};
use rustc_hash::{FxHashMap, FxHashSet};
use std::ffi::c_void;

fn foreign() -> Unwind {
    Unwind::runtime("attempt to use a value that belongs to another VM state")
}

/// Bytes of a VM string
pub(crate) fn text_of(s: &mlua::String) -> Text {
    Text::new(&*s.as_bytes())
}

/// VM number for an integer; integers the VM cannot hold exactly become floats
pub(crate) fn raw_integer(i: i64) -> RawValue {
    mlua::Integer::try_from(i)
        .map(RawValue::Integer)
        .unwrap_or(RawValue::Number(i as f64))
}

impl Value<'_> {
    /// Owned view of a VM value; heap kinds are pinned in `state`'s registry
    pub fn from_raw(raw: RawValue, state: &VmState) -> VmResult<OwnedValue> {
        Ok(match raw {
            RawValue::Nil => Value::Nil,
            RawValue::Boolean(b) => Value::Boolean(b),
            RawValue::Integer(i) => Value::Integer(i64::from(i)),
            RawValue::Number(n) => Value::Number(n),
            RawValue::String(s) => Value::Text(text_of(&s)),
            RawValue::LightUserData(p) => Value::LightPointer(p.0 as usize),
            RawValue::Error(err) => Value::Text(Text::from(err.to_string())),
            RawValue::UserData(ud) => match ud.borrow::<OpaqueCell>() {
                Ok(cell) => Value::Opaque(cell.object()),
                Err(_) => Value::Registry(RegistryRef::pin(state, RawValue::UserData(ud.clone()))?),
            },
            other => Value::Registry(RegistryRef::pin(state, other)?),
        })
    }

    /// VM value for this value inside `state`
    ///
    /// Native tables and buffers are bound to a VM object on first use (cycles preserved),
    /// native function descriptors are materialised as VM functions. References into a
    /// different state are rejected.
    pub fn to_raw(&self, state: &VmState) -> VmResult<RawValue> {
        Ok(match self {
            Value::Nil => RawValue::Nil,
            Value::Boolean(b) => RawValue::Boolean(*b),
            Value::Integer(i) => raw_integer(*i),
            Value::Number(n) => RawValue::Number(*n),
            Value::LightPointer(p) => RawValue::LightUserData(mlua::LightUserData(*p as *mut c_void)),
            Value::Text(t) => RawValue::String(
                state
                    .lua()
                    .create_string(t.as_bytes())
                    .map_err(Unwind::from_lua)?,
            ),
            Value::StackSlot(slot) => {
                if !slot.thread().belongs_to(state) {
                    return Err(foreign());
                }
                slot.get()
            }
            Value::Registry(handle) => {
                if !handle.belongs_to(state) {
                    return Err(foreign());
                }
                handle.get()
            }
            Value::Heap(handle) => heap_to_raw(handle, state)?,
            Value::Opaque(object) => opaque::to_raw(object, state)?,
        })
    }

    /// Copy of this value usable inside `target`
    ///
    /// Returns `None` when the value cannot leave its state, e.g. a coroutine, a VM function or
    /// a table that holds one. Never raises.
    pub fn clone_in(&self, target: &VmState) -> Option<OwnedValue> {
        Migration::new(target).value(self)
    }

    /// Whether [`Value::clone_in`] would succeed, allocation failures aside
    pub fn can_cross_state_boundary(&self) -> bool {
        crossable(self, &mut FxHashSet::default())
    }
}

fn heap_to_raw(handle: &HeapHandle, state: &VmState) -> VmResult<RawValue> {
    let lua = state.lua();
    let mut guard = handle.write();
    let raw = match &*guard {
        HeapPayload::Bound(bound) if bound.belongs_to(state) => return Ok(bound.get()),
        HeapPayload::Bound(bound) => {
            let raw = bound.get();
            drop(guard);
            return Migration::new(state).raw(&raw).ok_or_else(foreign);
        }
        HeapPayload::Function(function) => {
            let function = function.clone();
            drop(guard);
            return function.materialize(state);
        }
        HeapPayload::Thread(thread) => {
            let vm = thread.vm();
            return match vm.coroutine() {
                Some(co) if vm.belongs_to(state) => Ok(RawValue::Thread(co.clone())),
                Some(_) => Err(foreign()),
                None => Err(Unwind::runtime("the main thread cannot be passed as a value")),
            };
        }
        HeapPayload::Table(_) => RawValue::Table(lua.create_table().map_err(Unwind::from_lua)?),
        HeapPayload::Buffer(buffer) => RawValue::Buffer(
            lua.create_buffer(buffer.as_bytes())
                .map_err(Unwind::from_lua)?,
        ),
    };
    let bound = RegistryRef::pin(state, raw.clone())?;
    let previous = std::mem::replace(&mut *guard, HeapPayload::Bound(bound));
    // Entries are converted without the lock, so a table that holds itself binds once.
    drop(guard);

    if let (HeapPayload::Table(table), RawValue::Table(target)) = (&previous, &raw) {
        if let Err(err) = fill(table, target, state) {
            *handle.write() = previous;
            return Err(err);
        }
    }
    Ok(raw)
}

fn fill(table: &Table, target: &mlua::Table, state: &VmState) -> VmResult<()> {
    for (key, value) in table.iter() {
        let key = key.to_raw(state)?;
        let value = value.to_raw(state)?;
        target.raw_set(key, value).map_err(Unwind::from_lua)?;
    }
    if table.is_frozen() {
        target.set_readonly(true);
    }
    Ok(())
}

struct Migration<'t> {
    target: &'t VmState,
    vm_tables: FxHashMap<usize, mlua::Table>,
    native_tables: FxHashMap<usize, HeapHandle>,
}

impl<'t> Migration<'t> {
    fn new(target: &'t VmState) -> Self {
        Self {
            target,
            vm_tables: FxHashMap::default(),
            native_tables: FxHashMap::default(),
        }
    }

    fn value(&mut self, value: &Value<'_>) -> Option<OwnedValue> {
        match value {
            Value::StackSlot(_) | Value::Registry(_) => {
                let raw = self.raw(&value.resolve()?)?;
                Value::from_raw(raw, self.target).ok()
            }
            Value::Heap(handle) => self.heap(handle),
            other => Some(other.clone_owned()),
        }
    }

    fn heap(&mut self, handle: &HeapHandle) -> Option<OwnedValue> {
        if let Some(done) = self.native_tables.get(&handle.addr()) {
            return Some(Value::Heap(done.clone()));
        }
        let guard = handle.read();
        match &*guard {
            HeapPayload::Table(table) => {
                let copy = HeapHandle::new(HeapPayload::Table(Table::new()));
                self.native_tables.insert(handle.addr(), copy.clone());
                let mut entries = Vec::with_capacity(table.len());
                for (key, value) in table.iter() {
                    entries.push((self.value(key)?, self.value(value)?));
                }
                if let HeapPayload::Table(target) = &mut *copy.write() {
                    for (key, value) in entries {
                        // Keys were valid in the source table.
                        let _ = target.set(key, value);
                    }
                    if table.is_frozen() {
                        target.freeze();
                    }
                }
                Some(Value::Heap(copy))
            }
            HeapPayload::Buffer(buffer) => Some(Value::from(buffer.clone())),
            HeapPayload::Function(Function::Native(native)) => {
                let mut upvalues = Vec::with_capacity(native.upvalues().len());
                for upvalue in native.upvalues() {
                    upvalues.push(self.value(upvalue)?);
                }
                Some(Value::from(Function::Native(native.with_upvalues(upvalues))))
            }
            HeapPayload::Function(Function::Vm(_)) | HeapPayload::Thread(_) => None,
            HeapPayload::Bound(bound) => {
                let raw = self.raw(&bound.get())?;
                Value::from_raw(raw, self.target).ok()
            }
        }
    }

    /// Copy of a VM value of another state, built inside the target state
    fn raw(&mut self, raw: &RawValue) -> Option<RawValue> {
        let lua = self.target.lua();
        match raw {
            RawValue::Table(table) => {
                let addr = raw.to_pointer() as usize;
                if let Some(done) = self.vm_tables.get(&addr) {
                    return Some(RawValue::Table(done.clone()));
                }
                let copy = lua.create_table().ok()?;
                self.vm_tables.insert(addr, copy.clone());
                let mut entries = Vec::new();
                table
                    .for_each(|key: RawValue, value: RawValue| {
                        entries.push((key, value));
                        Ok(())
                    })
                    .ok()?;
                for (key, value) in entries {
                    let key = self.raw(&key)?;
                    let value = self.raw(&value)?;
                    copy.raw_set(key, value).ok()?;
                }
                if let Some(meta) = table.metatable() {
                    if let RawValue::Table(meta) = self.raw(&RawValue::Table(meta))? {
                        copy.set_metatable(Some(meta));
                    }
                }
                copy.set_readonly(table.is_readonly());
                Some(RawValue::Table(copy))
            }
            RawValue::Buffer(buffer) => {
                Some(RawValue::Buffer(lua.create_buffer(buffer.to_vec()).ok()?))
            }
            RawValue::String(s) => Some(RawValue::String(lua.create_string(&*s.as_bytes()).ok()?)),
            RawValue::UserData(ud) => {
                let object = ud.borrow::<OpaqueCell>().ok()?.object();
                opaque::to_raw(&object, self.target).ok()
            }
            RawValue::Function(_) | RawValue::Thread(_) => None,
            RawValue::Nil
            | RawValue::Boolean(_)
            | RawValue::Integer(_)
            | RawValue::Number(_)
            | RawValue::LightUserData(_) => Some(raw.clone()),
            _ => None,
        }
    }
}

fn crossable(value: &Value<'_>, seen: &mut FxHashSet<usize>) -> bool {
    match value {
        Value::StackSlot(_) | Value::Registry(_) => value
            .resolve()
            .map_or(true, |raw| raw_crossable(&raw, seen)),
        Value::Heap(handle) => {
            if !seen.insert(handle.addr()) {
                return true;
            }
            let guard = handle.read();
            match &*guard {
                HeapPayload::Table(table) => table
                    .iter()
                    .all(|(key, value)| crossable(key, seen) && crossable(value, seen)),
                HeapPayload::Buffer(_) => true,
                HeapPayload::Function(Function::Native(native)) => {
                    native.upvalues().iter().all(|up| crossable(up, seen))
                }
                HeapPayload::Function(Function::Vm(_)) | HeapPayload::Thread(_) => false,
                HeapPayload::Bound(bound) => raw_crossable(&bound.get(), seen),
            }
        }
        _ => true,
    }
}

fn raw_crossable(raw: &RawValue, seen: &mut FxHashSet<usize>) -> bool {
    match raw {
        RawValue::Table(table) => {
            if !seen.insert(raw.to_pointer() as usize) {
                return true;
            }
            let meta_ok = table
                .metatable()
                .map_or(true, |meta| raw_crossable(&RawValue::Table(meta), seen));
            let mut entries_ok = true;
            let walked = table.for_each(|key: RawValue, value: RawValue| {
                entries_ok = entries_ok && raw_crossable(&key, seen) && raw_crossable(&value, seen);
                Ok(())
            });
            meta_ok && entries_ok && walked.is_ok()
        }
        RawValue::UserData(ud) => ud.borrow::<OpaqueCell>().is_ok(),
        RawValue::Function(_) | RawValue::Thread(_) => false,
        _ => true,
    }
}
