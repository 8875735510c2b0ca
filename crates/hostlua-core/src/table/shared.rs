//! Lock-protected tables shared across native threads and VM states

use super::Table;
use crate::context::Context;
use crate::error::{TableError, Unwind, VmResult};
use crate::opaque::{Capabilities, Opaque, OpaqueKind};
use crate::rc::Shared;
use crate::text::Text;
use crate::value::{Kind, OwnedValue, Value};
use std::any::Any;
use std::fmt;

/// Table behind a reader/writer lock
///
/// Every operation takes the lock for the duration of that one call: shared for reads and
/// single iteration steps, exclusive for mutation. Iterators hold no lock between steps, so
/// writers on other threads are never blocked by a slow traversal.
#[derive(Clone)]
pub struct SharedTable {
    inner: Shared<Table>,
}

impl SharedTable {
    pub fn new() -> Self {
        Self {
            inner: Shared::new(Table::new()),
        }
    }

    pub fn get(&self, key: &Value<'_>) -> OwnedValue {
        self.inner.read().get(key)
    }

    pub fn has(&self, key: &Value<'_>) -> bool {
        self.inner.read().has(key)
    }

    pub fn set(&self, key: OwnedValue, value: OwnedValue) -> Result<(), TableError> {
        self.inner.write().set(key, value)
    }

    /// Store `value` only when `key` is absent; returns whether it was stored
    pub fn set_if_absent(&self, key: OwnedValue, value: OwnedValue) -> Result<bool, TableError> {
        let mut table = self.inner.write();
        if table.has(&key) {
            return Ok(false);
        }
        table.set(key, value)?;
        Ok(true)
    }

    /// Remove `key`, returning its value
    pub fn take(&self, key: &Value<'_>) -> Result<Option<OwnedValue>, TableError> {
        self.inner.write().remove(key)
    }

    /// Remove `key` only when `accept` approves its current value
    pub fn take_if<F>(&self, key: &Value<'_>, accept: F) -> Result<Option<OwnedValue>, TableError>
    where
        F: FnOnce(&OwnedValue) -> bool,
    {
        let mut table = self.inner.write();
        match table.get_ref(key) {
            Some(value) if accept(value) => table.remove(key),
            _ => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn array_len(&self) -> i64 {
        self.inner.read().array_len()
    }

    pub fn clear(&self) -> Result<(), TableError> {
        self.inner.write().clear()
    }

    pub fn freeze(&self) {
        self.inner.write().freeze();
    }

    pub fn unfreeze(&self) {
        self.inner.write().unfreeze();
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.read().is_frozen()
    }

    pub fn push(&self, value: OwnedValue) -> Result<(), TableError> {
        self.inner.write().push(value)
    }

    pub fn insert_at(&self, pos: i64, value: OwnedValue) -> Result<(), TableError> {
        self.inner.write().insert_at(pos, value)
    }

    pub fn remove_at(&self, pos: i64) -> Result<OwnedValue, TableError> {
        self.inner.write().remove_at(pos)
    }

    pub fn next(&self, cursor: usize) -> Option<(usize, OwnedValue, OwnedValue)> {
        self.inner.read().next(cursor)
    }

    /// Cursor over `1, 2, ...` that locks once per step
    pub fn ipairs(&self) -> SharedIpairs {
        SharedIpairs {
            table: self.clone(),
            next: 1,
        }
    }

    /// Cursor over every entry that locks once per step
    pub fn pairs(&self) -> SharedPairs {
        SharedPairs {
            table: self.clone(),
            cursor: 0,
        }
    }

    /// Every entry, copied under one shared lock
    pub fn entries(&self) -> Vec<(OwnedValue, OwnedValue)> {
        self.inner
            .read()
            .pairs()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Copy of the whole table
    pub fn snapshot(&self) -> Table {
        self.inner.read().clone()
    }

    /// Run `f` with shared access
    pub fn with_read<R>(&self, f: impl FnOnce(&Table) -> R) -> R {
        f(&self.inner.read())
    }

    /// Run `f` with exclusive access
    pub fn with_write<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        f(&mut self.inner.write())
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Shared::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for SharedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Table> for SharedTable {
    fn from(table: Table) -> Self {
        Self {
            inner: Shared::new(table),
        }
    }
}

impl fmt::Debug for SharedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_read() {
            Some(table) => f.debug_tuple("SharedTable").field(&*table).finish(),
            None => f.write_str("SharedTable(<locked>)"),
        }
    }
}

/// Array cursor returned by [`SharedTable::ipairs`]
pub struct SharedIpairs {
    table: SharedTable,
    next: i64,
}

impl Iterator for SharedIpairs {
    type Item = (i64, OwnedValue);

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.table.get(&Value::Integer(self.next));
        if value.is_nil() {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some((index, value))
    }
}

/// Entry cursor returned by [`SharedTable::pairs`]
pub struct SharedPairs {
    table: SharedTable,
    cursor: usize,
}

impl Iterator for SharedPairs {
    type Item = (OwnedValue, OwnedValue);

    fn next(&mut self) -> Option<Self::Item> {
        let (cursor, key, value) = self.table.next(self.cursor)?;
        self.cursor = cursor;
        Some((key, value))
    }
}

impl Opaque for SharedTable {
    fn kind(&self) -> OpaqueKind {
        OpaqueKind::SharedTable
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::INDEX | Capabilities::SET_INDEX | Capabilities::LEN | Capabilities::STRINGIFY
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn index(&self, _ctx: &Context, key: &Value<'_>) -> VmResult<OwnedValue> {
        Ok(self.get(key))
    }

    fn set_index(&self, _ctx: &Context, key: &Value<'_>, value: &Value<'_>) -> VmResult<()> {
        self.set(key.clone_owned(), value.clone_owned())
            .map_err(Unwind::from)
    }

    fn stringify(&self, _ctx: &Context) -> VmResult<Text> {
        Ok(Text::from(format!("SharedTable: 0x{:016x}", self.inner.addr())))
    }

    fn len(&self, _ctx: &Context) -> VmResult<OwnedValue> {
        Ok(Value::Integer(self.array_len()))
    }
}

/// Install the `SharedTable` global with its `new([table])` constructor
pub(crate) fn install_class(ctx: &Context) -> VmResult<()> {
    let constructor = ctx.create_function("new", |ctx| {
        ctx.expect_argn_range(0, 1)?;
        let shared = if ctx.argument(1).is_nil() {
            SharedTable::new()
        } else {
            let source = ctx.expect(1, Kind::Table)?;
            SharedTable::from(source.to_table().unwrap_or_default())
        };
        ctx.return_values([Value::from(shared)])
    })?;
    let mut class = Table::new();
    class.set(Value::from("new"), constructor)?;
    class.freeze();
    ctx.set_global("SharedTable", &Value::from(class))
}
