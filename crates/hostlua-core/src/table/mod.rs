//! Natively-owned tables
//!
//! [`Table`] is a hash table of owned values with the VM's key semantics (integral floats are
//! integer keys, `nil` and NaN are rejected, setting `nil` removes). Entries keep their
//! insertion order, which gives stable `pairs` traversal and cheap cursors.
//! [`SharedTable`] puts a table behind a reader/writer lock so it can be shared between
//! native threads and VM states.

mod shared;

pub use shared::{SharedIpairs, SharedPairs, SharedTable};
pub(crate) use shared::install_class as install_shared_table_class;

use crate::error::TableError;
use crate::text::Text;
use crate::value::identity::Identity;
use crate::value::{HeapPayload, OwnedValue, Value};
use crate::value::{float_to_integer, format_number};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;

/// Slots below this count are never compacted
const COMPACT_THRESHOLD: usize = 16;

#[derive(Clone, Default)]
pub struct Table {
    index: FxHashMap<Identity, usize>,
    slots: Vec<Option<(OwnedValue, OwnedValue)>>,
    live: usize,
    frozen: bool,
}

fn normalize(key: OwnedValue) -> OwnedValue {
    match key {
        Value::Number(n) => match float_to_integer(n) {
            Some(i) => Value::Integer(i),
            None => Value::Number(n),
        },
        other => other,
    }
}

impl Table {
    /// Longest span [`Table::move_range`] accepts
    pub const MAX_MOVE: i64 = 1 << 24;

    pub fn new() -> Self {
        Self::default()
    }

    /// Array of `count` copies of `value` at keys `1..=count`
    pub fn filled(count: usize, value: OwnedValue) -> Self {
        let mut table = Table::new();
        if value.is_nil() {
            return table;
        }
        for i in 1..=count {
            table.insert_new(Value::Integer(i as i64), value.clone());
        }
        table
    }

    // ========================================================================
    // Access
    // ========================================================================

    fn slot(&self, key: &Value<'_>) -> Option<usize> {
        self.index.get(&Identity::of(key)).copied()
    }

    /// Value stored under `key`, `Nil` when absent
    pub fn get(&self, key: &Value<'_>) -> OwnedValue {
        self.get_ref(key).cloned().unwrap_or_default()
    }

    pub fn get_ref(&self, key: &Value<'_>) -> Option<&OwnedValue> {
        let slot = self.slot(key)?;
        self.slots[slot].as_ref().map(|(_, value)| value)
    }

    pub fn has(&self, key: &Value<'_>) -> bool {
        self.slot(key).is_some()
    }

    /// Store `value` under `key`; a `Nil` value removes the entry
    pub fn set(&mut self, key: OwnedValue, value: OwnedValue) -> Result<(), TableError> {
        if self.frozen {
            return Err(TableError::Frozen);
        }
        let identity = Identity::of(&key);
        if identity.is_nil() {
            return Err(TableError::NilKey);
        }
        if identity.is_nan() {
            return Err(TableError::NanKey);
        }
        if value.is_nil() {
            self.take(&identity);
            return Ok(());
        }
        match self.index.get(&identity) {
            Some(&slot) => {
                if let Some((_, current)) = self.slots[slot].as_mut() {
                    *current = value;
                }
            }
            None => self.insert_new(key, value),
        }
        Ok(())
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &Value<'_>) -> Result<Option<OwnedValue>, TableError> {
        if self.frozen {
            return Err(TableError::Frozen);
        }
        Ok(self.take(&Identity::of(key)))
    }

    fn take(&mut self, identity: &Identity) -> Option<OwnedValue> {
        let slot = self.index.remove(identity)?;
        let (_, value) = self.slots[slot].take()?;
        self.live -= 1;
        Some(value)
    }

    fn insert_new(&mut self, key: OwnedValue, value: OwnedValue) {
        if self.slots.len() >= COMPACT_THRESHOLD && self.live * 2 < self.slots.len() {
            self.compact();
        }
        let key = normalize(key);
        self.index.insert(Identity::of(&key), self.slots.len());
        self.slots.push(Some((key, value)));
        self.live += 1;
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        self.index.clear();
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some((key, _)) = entry {
                self.index.insert(Identity::of(key), slot);
            }
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Length of the contiguous run of keys `1..=n`
    pub fn array_len(&self) -> i64 {
        let mut n = 0;
        while self.has(&Value::Integer(n + 1)) {
            n += 1;
        }
        n
    }

    /// Largest positive numeric key, 0 when there is none
    pub fn maxn(&self) -> f64 {
        self.pairs()
            .filter_map(|(key, _)| match key {
                Value::Integer(i) => Some(*i as f64),
                Value::Number(n) => Some(*n),
                _ => None,
            })
            .filter(|n| *n > 0.0)
            .fold(0.0, f64::max)
    }

    pub fn clear(&mut self) -> Result<(), TableError> {
        if self.frozen {
            return Err(TableError::Frozen);
        }
        self.index.clear();
        self.slots.clear();
        self.live = 0;
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    // ========================================================================
    // Iteration
    // ========================================================================

    /// Every entry in insertion order
    pub fn pairs(&self) -> impl Iterator<Item = (&OwnedValue, &OwnedValue)> + '_ {
        self.slots
            .iter()
            .flatten()
            .map(|(key, value)| (key, value))
    }

    /// Alias of [`Table::pairs`]
    pub fn iter(&self) -> impl Iterator<Item = (&OwnedValue, &OwnedValue)> + '_ {
        self.pairs()
    }

    /// Entries `1, 2, ...` up to the first missing index
    pub fn ipairs(&self) -> impl Iterator<Item = (i64, &OwnedValue)> + '_ {
        self.ipairs_from(1)
    }

    /// Entries `start, start + 1, ...` up to the first missing index
    pub fn ipairs_from(&self, start: i64) -> impl Iterator<Item = (i64, &OwnedValue)> + '_ {
        (start..).map_while(move |i| self.get_ref(&Value::Integer(i)).map(|value| (i, value)))
    }

    /// Entry at or after `cursor`, with the cursor of the following entry
    ///
    /// Start from cursor 0; `None` ends the traversal.
    pub fn next(&self, cursor: usize) -> Option<(usize, OwnedValue, OwnedValue)> {
        self.slots
            .iter()
            .enumerate()
            .skip(cursor)
            .find_map(|(slot, entry)| {
                entry
                    .as_ref()
                    .map(|(key, value)| (slot + 1, key.clone(), value.clone()))
            })
    }

    // ========================================================================
    // Sequence operations
    // ========================================================================

    fn check_writable(&self) -> Result<(), TableError> {
        if self.frozen {
            Err(TableError::Frozen)
        } else {
            Ok(())
        }
    }

    /// Insert `value` at `pos`, shifting `pos..=n` up by one
    pub fn insert_at(&mut self, pos: i64, value: OwnedValue) -> Result<(), TableError> {
        self.check_writable()?;
        let n = self.array_len();
        if pos < 1 || pos > n + 1 {
            return Err(TableError::OutOfBounds { position: pos });
        }
        for i in (pos..=n).rev() {
            let moved = self.get(&Value::Integer(i));
            self.set(Value::Integer(i + 1), moved)?;
        }
        self.set(Value::Integer(pos), value)
    }

    /// Append after the last array element
    pub fn push(&mut self, value: OwnedValue) -> Result<(), TableError> {
        let n = self.array_len();
        self.insert_at(n + 1, value)
    }

    /// Remove the element at `pos`, shifting the rest down
    pub fn remove_at(&mut self, pos: i64) -> Result<OwnedValue, TableError> {
        self.check_writable()?;
        let n = self.array_len();
        if pos < 1 || pos > n {
            return Err(TableError::OutOfBounds { position: pos });
        }
        let removed = self.get(&Value::Integer(pos));
        for i in pos..n {
            let moved = self.get(&Value::Integer(i + 1));
            self.set(Value::Integer(i), moved)?;
        }
        self.set(Value::Integer(n), Value::Nil)?;
        Ok(removed)
    }

    /// First array index at or after `init` holding `value`
    pub fn find(&self, value: &Value<'_>, init: i64) -> Option<i64> {
        self.ipairs_from(init.max(1))
            .find(|(_, candidate)| *candidate == value)
            .map(|(i, _)| i)
    }

    /// Join elements `i..=j` with `sep`
    pub fn concat(&self, sep: &str, i: i64, j: i64) -> Result<Text, TableError> {
        let mut out = Vec::new();
        for k in i..=j {
            match self.get_ref(&Value::Integer(k)) {
                Some(Value::Text(text)) => out.extend_from_slice(text.as_bytes()),
                Some(Value::Integer(n)) => out.extend_from_slice(n.to_string().as_bytes()),
                Some(Value::Number(n)) => out.extend_from_slice(format_number(*n).as_bytes()),
                _ => return Err(TableError::InvalidConcat { index: k }),
            }
            if k < j {
                out.extend_from_slice(sep.as_bytes());
            }
        }
        Ok(Text::from(out))
    }

    /// Copy elements `from..=to` to `dest..`, handling overlap like `table.move`
    ///
    /// Spans longer than [`Table::MAX_MOVE`] and destinations past `i64::MAX` are rejected
    /// before anything is written.
    pub fn move_range(&mut self, from: i64, to: i64, dest: i64) -> Result<(), TableError> {
        self.check_writable()?;
        if to < from {
            return Ok(());
        }
        let span = to.checked_sub(from).ok_or(TableError::TooManyElements)?;
        if span >= Self::MAX_MOVE {
            return Err(TableError::TooManyElements);
        }
        dest.checked_add(span).ok_or(TableError::DestinationWrap)?;

        let values: Vec<OwnedValue> = (from..=to).map(|i| self.get(&Value::Integer(i))).collect();
        for (offset, value) in values.into_iter().enumerate() {
            self.set(Value::Integer(dest + offset as i64), value)?;
        }
        Ok(())
    }

    /// Sort the array part in natural order: numbers numerically, text bytewise
    pub fn sort(&mut self) -> Result<(), TableError> {
        let mut failure = None;
        self.sort_by(|a, b| match natural_order(a, b) {
            Ok(ordering) => ordering,
            Err(err) => {
                failure.get_or_insert(err);
                Ordering::Equal
            }
        })?;
        failure.map_or(Ok(()), Err)
    }

    /// Sort the array part with `compare`
    pub fn sort_by<F>(&mut self, mut compare: F) -> Result<(), TableError>
    where
        F: FnMut(&OwnedValue, &OwnedValue) -> Ordering,
    {
        self.check_writable()?;
        let n = self.array_len();
        let mut values: Vec<OwnedValue> = (1..=n).map(|i| self.get(&Value::Integer(i))).collect();
        values.sort_by(|a, b| compare(a, b));
        for (i, value) in values.into_iter().enumerate() {
            self.set(Value::Integer(i as i64 + 1), value)?;
        }
        Ok(())
    }

    /// Copy with nested native tables copied too; shared sub-tables stay shared in the copy
    pub fn deep_clone(&self) -> Table {
        let mut seen = FxHashMap::default();
        self.deep_clone_with(&mut seen)
    }

    fn deep_clone_with(&self, seen: &mut FxHashMap<usize, OwnedValue>) -> Table {
        let mut copy = Table {
            frozen: false,
            ..Table::default()
        };
        for (key, value) in self.pairs() {
            let key = deep_value(key, seen);
            let value = deep_value(value, seen);
            copy.insert_new(key, value);
        }
        copy.frozen = self.frozen;
        copy
    }
}

fn deep_value(value: &OwnedValue, seen: &mut FxHashMap<usize, OwnedValue>) -> OwnedValue {
    let Value::Heap(payload) = value else {
        return value.clone();
    };
    if let Some(done) = seen.get(&payload.addr()) {
        return done.clone();
    }
    let guard = payload.read();
    let HeapPayload::Table(table) = &*guard else {
        return value.clone();
    };
    let slot = Value::heap(HeapPayload::Table(Table::new()));
    seen.insert(payload.addr(), slot.clone());
    let copy = table.deep_clone_with(seen);
    if let Some(target) = slot.as_heap() {
        *target.write() = HeapPayload::Table(copy);
    }
    slot
}

fn natural_order(a: &OwnedValue, b: &OwnedValue) -> Result<Ordering, TableError> {
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => Ok(x.as_bytes().cmp(y.as_bytes())),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok(x.partial_cmp(&y).unwrap_or(Ordering::Equal)),
            _ => Err(TableError::NotComparable {
                left: a.kind().name(),
                right: b.kind().name(),
            }),
        },
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.pairs()).finish()
    }
}

impl FromIterator<(OwnedValue, OwnedValue)> for Table {
    /// Entries with a `Nil` or NaN key are skipped
    fn from_iter<I: IntoIterator<Item = (OwnedValue, OwnedValue)>>(iter: I) -> Self {
        let mut table = Table::new();
        for (key, value) in iter {
            let _ = table.set(key, value);
        }
        table
    }
}

impl From<Vec<OwnedValue>> for Table {
    fn from(values: Vec<OwnedValue>) -> Self {
        let mut table = Table::new();
        for (i, value) in values.into_iter().enumerate() {
            if !value.is_nil() {
                table.insert_new(Value::Integer(i as i64 + 1), value);
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array(values: &[i64]) -> Table {
        Table::from(values.iter().map(|&v| Value::from(v)).collect::<Vec<_>>())
    }

    fn contents(table: &Table) -> Vec<i64> {
        table.ipairs().filter_map(|(_, v)| v.as_integer()).collect()
    }

    #[test]
    fn test_set_nil_removes() {
        let mut table = Table::new();
        table.set(Value::from("a"), Value::from(1)).unwrap();
        assert!(table.has(&Value::from("a")));
        table.set(Value::from("a"), Value::Nil).unwrap();
        assert!(!table.has(&Value::from("a")));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_rejects_nil_and_nan_keys() {
        let mut table = Table::new();
        assert_eq!(table.set(Value::Nil, Value::from(1)), Err(TableError::NilKey));
        assert_eq!(
            table.set(Value::from(f64::NAN), Value::from(1)),
            Err(TableError::NanKey)
        );
    }

    #[test]
    fn test_float_keys_normalize() {
        let mut table = Table::new();
        table.set(Value::from(2.0), Value::from("x")).unwrap();
        assert_eq!(table.get(&Value::from(2)), Value::from("x"));
        assert!(matches!(table.pairs().next(), Some((Value::Integer(2), _))));
    }

    #[test]
    fn test_frozen_rejects_mutation() {
        let mut table = array(&[1, 2]);
        table.freeze();
        assert_eq!(table.set(Value::from(3), Value::from(3)), Err(TableError::Frozen));
        assert_eq!(table.push(Value::from(3)), Err(TableError::Frozen));
        assert_eq!(table.clear(), Err(TableError::Frozen));
        table.unfreeze();
        table.push(Value::from(3)).unwrap();
        assert_eq!(contents(&table), vec![1, 2, 3]);
    }

    #[test]
    fn test_array_len_stops_at_gap() {
        let mut table = array(&[1, 2, 3]);
        table.set(Value::from(5), Value::from(5)).unwrap();
        assert_eq!(table.array_len(), 3);
        assert_eq!(table.maxn(), 5.0);
    }

    #[test]
    fn test_insert_and_remove_shift() {
        let mut table = array(&[1, 3]);
        table.insert_at(2, Value::from(2)).unwrap();
        assert_eq!(contents(&table), vec![1, 2, 3]);
        assert_eq!(table.remove_at(1).unwrap(), Value::from(1));
        assert_eq!(contents(&table), vec![2, 3]);
        assert_eq!(
            table.insert_at(9, Value::from(0)),
            Err(TableError::OutOfBounds { position: 9 })
        );
    }

    #[test]
    fn test_cursor_visits_every_entry_once() {
        let mut table = Table::new();
        for i in 0..40 {
            table.set(Value::from(format!("k{}", i)), Value::from(i)).unwrap();
        }
        for i in 0..30 {
            table.set(Value::from(format!("k{}", i)), Value::Nil).unwrap();
        }
        let mut cursor = 0;
        let mut seen = Vec::new();
        while let Some((next, _, value)) = table.next(cursor) {
            seen.push(value.as_integer().unwrap());
            cursor = next;
        }
        assert_eq!(seen, (30..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_concat_and_find() {
        let mut table = Table::new();
        table.push(Value::from("a")).unwrap();
        table.push(Value::from(1)).unwrap();
        table.push(Value::from(2.5)).unwrap();
        assert_eq!(table.concat(",", 1, 3).unwrap().as_str(), Some("a,1,2.5"));
        assert_eq!(table.find(&Value::from(1), 1), Some(2));
        table.push(Value::from(true)).unwrap();
        assert_eq!(
            table.concat(",", 1, 4),
            Err(TableError::InvalidConcat { index: 4 })
        );
    }

    #[test]
    fn test_sort_natural_and_custom() {
        let mut table = array(&[3, 1, 2]);
        table.sort().unwrap();
        assert_eq!(contents(&table), vec![1, 2, 3]);
        table
            .sort_by(|a, b| b.as_integer().cmp(&a.as_integer()))
            .unwrap();
        assert_eq!(contents(&table), vec![3, 2, 1]);

        let mut mixed = Table::new();
        mixed.push(Value::from(1)).unwrap();
        mixed.push(Value::from("x")).unwrap();
        assert!(matches!(mixed.sort(), Err(TableError::NotComparable { .. })));
    }

    #[test]
    fn test_move_range_overlapping() {
        let mut table = array(&[1, 2, 3]);
        table.move_range(1, 3, 2).unwrap();
        assert_eq!(contents(&table), vec![1, 1, 2, 3]);
    }

    #[test]
    fn test_move_range_limits() {
        let mut table = array(&[1, 2, 3]);
        assert!(matches!(
            table.move_range(i64::MIN, i64::MAX, 1),
            Err(TableError::TooManyElements)
        ));
        assert!(matches!(
            table.move_range(0, Table::MAX_MOVE, 1),
            Err(TableError::TooManyElements)
        ));
        assert!(matches!(
            table.move_range(1, 3, i64::MAX - 1),
            Err(TableError::DestinationWrap)
        ));
        assert_eq!(contents(&table), vec![1, 2, 3]);

        table.move_range(2, 3, i64::MAX - 1).unwrap();
        assert_eq!(table.get(&Value::Integer(i64::MAX)), Value::from(3));
    }

    #[test]
    fn test_filled() {
        let table = Table::filled(3, Value::from("z"));
        assert_eq!(table.array_len(), 3);
        assert_eq!(table.get(&Value::from(3)), Value::from("z"));
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let inner = Value::from(array(&[1]));
        let mut outer = Table::new();
        outer.set(Value::from("inner"), inner.clone()).unwrap();
        let copy = outer.deep_clone();
        let copied_inner = copy.get(&Value::from("inner"));
        assert_ne!(copied_inner, inner);
        assert_eq!(copied_inner.to_table().unwrap().get(&Value::from(1)), Value::from(1));
    }
}
